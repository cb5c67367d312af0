use crate::error::AppError;
use crate::models::{CostSummary, ModelTokens, Organization, UsageSummary, UserCost, Workspace};
use crate::providers::{console_status_error, endpoint, fetch_paginated};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_CONCURRENT_DAYS: usize = 10;

/// Organization-level Admin API surface.
#[async_trait]
pub trait ConsoleApi: Send + Sync {
    async fn fetch_organization(&self) -> Result<Organization, AppError>;

    async fn fetch_workspaces(&self) -> Result<Vec<Workspace>, AppError>;

    async fn fetch_usage_report(&self, start: NaiveDate, end: NaiveDate) -> Result<UsageSummary, AppError>;

    async fn fetch_cost_report(&self, start: NaiveDate, end: NaiveDate) -> Result<CostSummary, AppError>;

    /// Claude Code spend per user over `start..=end`, one request per day.
    async fn fetch_claude_code_user_costs(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<UserCost>, AppError>;

    async fn fetch_user_emails(&self) -> Result<Vec<String>, AppError>;
}

pub struct ConsoleClient {
    client: Client,
    base_url: String,
    headers: HeaderMap,
}

impl ConsoleClient {
    pub fn new(client: Client, base_url: impl Into<String>, admin_key: &str) -> Result<Self, AppError> {
        let key = HeaderValue::from_str(admin_key)
            .map_err(|_| AppError::Credentials("Admin API key contains invalid characters.".into()))?;

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            client,
            base_url: base_url.into(),
            headers,
        })
    }

    async fn paginated(&self, path: &str, params: &[(&str, String)]) -> Result<Vec<Value>, AppError> {
        let url = endpoint(&self.base_url, path, params)?;
        fetch_paginated(&self.client, url, &self.headers).await
    }
}

fn date_range(start: NaiveDate, end: NaiveDate) -> [(&'static str, String); 2] {
    [
        ("starting_at", start.format("%Y-%m-%d").to_string()),
        ("ending_at", end.format("%Y-%m-%d").to_string()),
    ]
}

#[async_trait]
impl ConsoleApi for ConsoleClient {
    async fn fetch_organization(&self) -> Result<Organization, AppError> {
        let url = endpoint(&self.base_url, "/v1/organizations/me", &[])?;
        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|_| AppError::Api("Network error - retrying".into()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(console_status_error(status, &body));
        }
        Ok(response.json().await?)
    }

    async fn fetch_workspaces(&self) -> Result<Vec<Workspace>, AppError> {
        let items = self.paginated("/v1/organizations/workspaces", &[]).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect())
    }

    async fn fetch_usage_report(&self, start: NaiveDate, end: NaiveDate) -> Result<UsageSummary, AppError> {
        let items = self
            .paginated("/v1/organizations/usage_report/messages", &date_range(start, end))
            .await?;
        Ok(aggregate_usage(&items))
    }

    async fn fetch_cost_report(&self, start: NaiveDate, end: NaiveDate) -> Result<CostSummary, AppError> {
        let items = self
            .paginated("/v1/organizations/cost_report", &date_range(start, end))
            .await?;
        Ok(aggregate_costs(&items))
    }

    async fn fetch_claude_code_user_costs(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<UserCost>, AppError> {
        let limiter = Arc::new(Semaphore::new(MAX_CONCURRENT_DAYS));
        let mut tasks = JoinSet::new();

        for day in start.iter_days().take_while(|day| *day <= end) {
            let url = endpoint(
                &self.base_url,
                "/v1/organizations/usage_report/claude_code",
                &[
                    ("starting_at", day.format("%Y-%m-%d").to_string()),
                    ("limit", "1000".to_string()),
                ],
            )?;
            let client = self.client.clone();
            let headers = self.headers.clone();
            let limiter = Arc::clone(&limiter);

            tasks.spawn(async move {
                let _permit = limiter
                    .acquire_owned()
                    .await
                    .map_err(|_| AppError::Api("request limiter closed".into()))?;
                fetch_paginated(&client, url, &headers)
                    .await
                    .map_err(|err| AppError::Api(format!("Error fetching {day}: {err}")))
            });
        }

        // Dropping `tasks` on an early return aborts the remaining days.
        let mut totals = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let items = joined.map_err(|err| AppError::Api(format!("day fetch task failed: {err}")))??;
            accumulate_claude_code_costs(&mut totals, &items);
        }

        Ok(totals
            .into_iter()
            .map(|(email, cost_usd)| UserCost { email, cost_usd })
            .collect())
    }

    async fn fetch_user_emails(&self) -> Result<Vec<String>, AppError> {
        let items = self.paginated("/v1/organizations/users", &[]).await?;
        Ok(items
            .iter()
            .filter_map(|user| user.get("email").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

fn parse_amount(raw: &Value) -> Option<f64> {
    match raw {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn month_label(starting_at: &str) -> String {
    let date = if starting_at.contains('T') {
        DateTime::parse_from_rfc3339(starting_at)
            .map(|ts| ts.date_naive())
            .ok()
    } else {
        NaiveDate::parse_from_str(starting_at, "%Y-%m-%d").ok()
    };
    date.map(|d| d.format("%B %Y").to_string())
        .unwrap_or_default()
}

/// Sums the USD `amount` of every cost bucket result.
pub fn aggregate_costs(buckets: &[Value]) -> CostSummary {
    let period_label = buckets
        .first()
        .and_then(|bucket| bucket.get("starting_at"))
        .and_then(Value::as_str)
        .map(month_label)
        .unwrap_or_default();

    let total_cost_usd: f64 = buckets
        .iter()
        .filter_map(|bucket| bucket.get("results").and_then(Value::as_array))
        .flatten()
        .filter(|result| result.get("currency").and_then(Value::as_str) == Some("USD"))
        .filter_map(|result| result.get("amount").and_then(parse_amount))
        .sum();

    CostSummary {
        total_cost_usd,
        period_label,
    }
}

pub fn aggregate_usage(buckets: &[Value]) -> UsageSummary {
    let mut by_model: BTreeMap<String, ModelTokens> = BTreeMap::new();
    let tokens = |result: &Value, key: &str| result.get(key).and_then(Value::as_u64).unwrap_or(0);

    for result in buckets
        .iter()
        .filter_map(|bucket| bucket.get("results").and_then(Value::as_array))
        .flatten()
    {
        let Some(model) = result.get("model").and_then(Value::as_str).filter(|m| !m.is_empty()) else {
            continue;
        };
        let entry = by_model.entry(model.to_string()).or_default();
        entry.input_tokens += tokens(result, "input_tokens");
        entry.output_tokens += tokens(result, "output_tokens");
        entry.cache_creation_input_tokens += tokens(result, "cache_creation_input_tokens");
        entry.cache_read_input_tokens += tokens(result, "cache_read_input_tokens");
    }

    UsageSummary { by_model }
}

/// Adds one day of Claude Code records into `totals`, keyed by email.
///
/// `estimated_cost` is normally `{"currency": "USD", "amount": <cents>}`;
/// a bare number is taken as dollars.
pub fn accumulate_claude_code_costs(totals: &mut BTreeMap<String, f64>, records: &[Value]) {
    for record in records {
        let Some(email) = record
            .get("actor")
            .and_then(|actor| actor.get("email_address"))
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
        else {
            continue;
        };

        let breakdown = record
            .get("model_breakdown")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for model in breakdown {
            let cost = match model.get("estimated_cost") {
                Some(Value::Object(obj)) => obj.get("amount").and_then(parse_amount).map(|cents| cents / 100.0),
                Some(other) => parse_amount(other),
                None => None,
            };
            if let Some(cost) = cost {
                *totals.entry(email.to_string()).or_insert(0.0) += cost;
            }
        }
    }
}

/// Candidate substrings derived from a login name. `jsbattig` also tries
/// `battig`, the usual first-initials-plus-surname pattern.
pub fn username_search_terms(username: &str) -> Vec<String> {
    let username = username.trim().to_lowercase();
    if username.is_empty() {
        return Vec::new();
    }
    let mut terms = vec![username.clone()];
    if username.chars().count() > 4 {
        terms.push(username.chars().skip(2).collect());
    }
    terms
}

pub fn match_user_email<'a, I>(username: &str, emails: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let terms = username_search_terms(username);
    if terms.is_empty() {
        return None;
    }
    emails.into_iter().find_map(|email| {
        let lowered = email.to_lowercase();
        terms
            .iter()
            .any(|term| lowered.contains(term.as_str()))
            .then(|| email.to_string())
    })
}

pub fn system_username() -> Option<String> {
    ["USER", "USERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.trim().is_empty())
}
