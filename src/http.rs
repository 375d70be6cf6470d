use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn user_agent() -> String {
    format!("kira-rdb/{}", env!("CARGO_PKG_VERSION"))
}

/// Blocking client shared by the upstream adapters. Adapters never retry;
/// retry policy belongs to the coordinator.
pub fn build_client(timeout: Duration) -> Result<Client, String> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&user_agent()).map_err(|err| err.to_string())?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| err.to_string())
}

/// Splits a response into success or `(status, body)`.
pub fn check_status(response: Response, fallback: &str) -> Result<Response, (u16, String)> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .ok()
        .filter(|body| !body.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string());
    Err((status, truncate(&message, 200)))
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((pos, _)) => format!("{}...", &value[..pos]),
        None => value.to_string(),
    }
}
