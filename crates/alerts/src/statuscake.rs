//! StatusCake adapter: tests by tag, then each test's up/down periods.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{clip_periods, AlertError, AlertProvider, CheckPeriod, CheckResponse, CheckStatus, Result};

const NAME: &str = "statuscake";

pub struct Statuscake {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TestItem {
    #[serde(rename = "TestID")]
    test_id: u64,
    website_name: String,
    #[serde(rename = "WebsiteURL", default)]
    website_url: Option<String>,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PeriodItem {
    status: String,
    start: String,
    #[serde(default)]
    end: Option<String>,
}

/// StatusCake reports `YYYY-MM-DD HH:MM:SS` in UTC; RFC 3339 is accepted as well.
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok().map(|n| n.and_utc())
}

fn periods_of(items: Vec<PeriodItem>) -> Vec<CheckPeriod> {
    items
        .into_iter()
        .filter_map(|p| {
            let from = parse_time(&p.start)?;
            let to = p.end.as_deref().filter(|e| !e.is_empty()).and_then(parse_time);
            Some(CheckPeriod { status: CheckStatus::from(p.status.as_str()), from, to })
        })
        .collect()
}

impl Statuscake {
    pub fn new(client: reqwest::Client, endpoint: &str, username: &str, api_key: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            username: username.to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .client
            .get(&url)
            .header("API", &self.api_key)
            .header("Username", &self.username)
            .query(query)
            .send()
            .await
            .map_err(|source| AlertError::Http { provider: NAME, source })?;
        if !resp.status().is_success() {
            return Err(AlertError::Status { provider: NAME, status: resp.status().as_u16() });
        }
        resp.json::<T>().await.map_err(|source| AlertError::Http { provider: NAME, source })
    }
}

#[async_trait::async_trait]
impl AlertProvider for Statuscake {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn lookup_checks_by_tag(&self, tags: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<CheckResponse>> {
        let tests: Vec<TestItem> = self.get("/API/Tests/", &[("tags", tags.to_string())]).await?;
        debug!(%tags, count = tests.len(), "statuscake tests found");
        let mut out = Vec::with_capacity(tests.len());
        for t in tests {
            let periods = match self.get::<Vec<PeriodItem>>("/API/Tests/Periods", &[("TestID", t.test_id.to_string())]).await {
                Ok(items) => clip_periods(periods_of(items), from, to),
                Err(e) => {
                    warn!(test = t.test_id, error = %e, "statuscake periods unavailable");
                    Vec::new()
                }
            };
            out.push(CheckResponse {
                id: t.test_id.to_string(),
                name: t.website_name,
                url: t.website_url,
                status: CheckStatus::from(t.status.as_str()),
                periods,
            });
        }
        Ok(out)
    }
}
