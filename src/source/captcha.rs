// src/source/captcha.rs
use std::time::Duration;

use reqwest::Client;

use super::SourceError;

const SOLVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the external captcha resolution service.
///
/// Protocol: POST `{base}/resolver` with a form field `body` holding the
/// base64 image; a successful reply reads `OK|<text>`. Anything else counts
/// as unresolved.
#[derive(Debug, Clone)]
pub struct CaptchaSolver {
    base_url: String,
    client: Client,
}

impl CaptchaSolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }

    /// Resolve a base64-encoded captcha image into its text.
    pub async fn solve(&self, base64_image: &str) -> Result<String, SourceError> {
        let reply = self
            .client
            .post(format!("{}/resolver", self.base_url))
            .timeout(SOLVE_TIMEOUT)
            .form(&[("body", base64_image)])
            .send()
            .await?
            .text()
            .await?;
        parse_reply(&reply)
    }
}

fn parse_reply(reply: &str) -> Result<String, SourceError> {
    if !reply.contains("OK") {
        return Err(SourceError::CaptchaUnresolved(reply.trim().to_string()));
    }
    reply
        .split('|')
        .nth(1)
        .map(str::to_string)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| SourceError::CaptchaUnresolved(format!("malformed resolver reply: {reply}")))
}
