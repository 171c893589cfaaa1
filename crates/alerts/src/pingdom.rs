//! Pingdom adapter (API 3.1): checks by tag, then each check's outage summary.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{clip_periods, AlertError, AlertProvider, CheckPeriod, CheckResponse, CheckStatus, Result};

const NAME: &str = "pingdom";

pub struct Pingdom {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ChecksBody {
    #[serde(default)]
    checks: Vec<Check>,
}

#[derive(Debug, Deserialize)]
struct Check {
    id: u64,
    name: String,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct OutageBody {
    summary: OutageSummary,
}

#[derive(Debug, Deserialize)]
struct OutageSummary {
    #[serde(default)]
    states: Vec<OutageState>,
}

#[derive(Debug, Deserialize)]
struct OutageState {
    status: String,
    timefrom: i64,
    timeto: i64,
}

fn periods_of(states: Vec<OutageState>) -> Vec<CheckPeriod> {
    states
        .into_iter()
        .filter_map(|s| {
            let from = DateTime::from_timestamp(s.timefrom, 0)?;
            Some(CheckPeriod { status: CheckStatus::from(s.status.as_str()), from, to: DateTime::from_timestamp(s.timeto, 0) })
        })
        .collect()
}

impl Pingdom {
    pub fn new(client: reqwest::Client, endpoint: &str, token: &str) -> Self {
        Self { client, endpoint: endpoint.trim_end_matches('/').to_string(), token: token.to_string() }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
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
impl AlertProvider for Pingdom {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn lookup_checks_by_tag(&self, tags: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<CheckResponse>> {
        let body: ChecksBody = self.get("/checks", &[("tags", tags.to_string())]).await?;
        debug!(%tags, count = body.checks.len(), "pingdom checks found");
        let range = [("from", from.timestamp().to_string()), ("to", to.timestamp().to_string())];
        let mut out = Vec::with_capacity(body.checks.len());
        for c in body.checks {
            let periods = match self.get::<OutageBody>(&format!("/summary.outage/{}", c.id), &range).await {
                Ok(o) => clip_periods(periods_of(o.summary.states), from, to),
                Err(e) => {
                    warn!(check = c.id, error = %e, "pingdom outage summary unavailable");
                    Vec::new()
                }
            };
            out.push(CheckResponse {
                id: c.id.to_string(),
                name: c.name,
                url: c.hostname,
                status: CheckStatus::from(c.status.as_str()),
                periods,
            });
        }
        Ok(out)
    }
}
