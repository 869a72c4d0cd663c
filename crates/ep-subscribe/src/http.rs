//! Subscription download over HTTP(S).

use std::time::Duration;

use crate::SubscribeError;

// Some providers gate on the UA; present a browser-ish one.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

pub async fn fetch_text(url: &str, timeout: Duration) -> Result<String, SubscribeError> {
    let timeout = if timeout.is_zero() {
        Duration::from_secs(30)
    } else {
        timeout
    };
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SubscribeError::Fetch(e.to_string()))?;
    let resp = client
        .get(url)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .header(reqwest::header::ACCEPT, "*/*")
        .send()
        .await
        .map_err(|e| SubscribeError::Fetch(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(SubscribeError::Status(resp.status().as_u16()));
    }
    resp.text()
        .await
        .map_err(|e| SubscribeError::Fetch(e.to_string()))
}
