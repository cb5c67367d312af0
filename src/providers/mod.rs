use crate::error::AppError;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub mod console;
pub mod oauth;

pub fn build_client() -> Result<Client, AppError> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(15))
        .build()?;
    Ok(client)
}

pub(crate) fn endpoint(base_url: &str, path: &str, params: &[(&str, String)]) -> Result<Url, AppError> {
    let raw = format!("{}{}", base_url.trim_end_matches('/'), path);
    let parsed = if params.is_empty() {
        Url::parse(&raw)
    } else {
        Url::parse_with_params(&raw, params.iter().map(|(k, v)| (*k, v.as_str())))
    };
    parsed.map_err(|err| AppError::Config(format!("Invalid API URL '{raw}': {err}")))
}

pub(crate) fn console_status_error(status: StatusCode, body: &str) -> AppError {
    match status.as_u16() {
        401 | 403 => AppError::Api("Authentication failed - check Admin API key".into()),
        429 => AppError::Api(
            "Rate limit exceeded - please wait a few minutes and try again".into(),
        ),
        _ => {
            let snippet: String = body.chars().take(100).collect();
            AppError::Api(format!("API error: {} - {snippet}", status.as_u16()))
        }
    }
}

/// Cursor for the next page, as `(query parameter, value)`.
///
/// Endpoints disagree on naming: some return `next_page`, others
/// `next_page_token`. `has_more` without either cursor ends the walk.
pub(crate) fn next_cursor(body: &Value) -> Option<(&'static str, String)> {
    if !body.get("has_more").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let cursor = |key: &str| {
        body.get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    if let Some(token) = cursor("next_page_token") {
        return Some(("page_token", token));
    }
    cursor("next_page").map(|page| ("page", page))
}

/// Follows pagination and concatenates every page's `data` array.
pub(crate) async fn fetch_paginated(
    client: &Client,
    url: Url,
    headers: &HeaderMap,
) -> Result<Vec<Value>, AppError> {
    let mut items = Vec::new();
    let mut cursor: Option<(&'static str, String)> = None;

    loop {
        let mut page_url = url.clone();
        if let Some((param, value)) = &cursor {
            page_url.query_pairs_mut().append_pair(param, value);
        }

        let response = client
            .get(page_url)
            .headers(headers.clone())
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AppError::Api("Request timed out".into())
                } else {
                    AppError::Api(format!("Network error: {err}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(console_status_error(status, &body));
        }

        let body: Value = response.json().await?;
        if let Some(data) = body.get("data").and_then(Value::as_array) {
            items.extend(data.iter().cloned());
        }

        match next_cursor(&body) {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(items)
}
