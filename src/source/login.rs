// src/source/login.rs
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::captcha::CaptchaSolver;
use super::SourceError;

/// Credentials of an authenticated bank session, handed out by the login
/// flow and attached to every history request.
#[derive(Debug, Clone)]
pub struct BankSession {
    pub session_id: String,
    pub device_id: String,
}

/// Boundary to the interactive, captcha-gated login flow. Implementations
/// own the mechanics and hand back a usable session; sources call this on
/// demand whenever they hold no session.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<BankSession, SourceError>;
}

const LOGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Authenticates through the login-automation sidecar, which drives the
/// bank's login page and exposes it as a two-step challenge: `begin` opens a
/// challenge and yields its captcha image, `complete` submits credentials
/// plus the resolved captcha text and yields the session.
pub struct RemoteAuthenticator {
    base_url: String,
    login_id: String,
    password: String,
    solver: CaptchaSolver,
    client: Client,
}

#[derive(Serialize)]
struct BeginRequest<'a> {
    login_id: &'a str,
}

#[derive(Deserialize)]
struct BeginReply {
    challenge_id: String,
    captcha_image: String,
}

#[derive(Serialize)]
struct CompleteRequest<'a> {
    challenge_id: &'a str,
    password: &'a str,
    captcha_text: &'a str,
}

#[derive(Deserialize)]
struct CompleteReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RemoteAuthenticator {
    pub fn new(
        base_url: impl Into<String>,
        login_id: impl Into<String>,
        password: impl Into<String>,
        solver: CaptchaSolver,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            login_id: login_id.into(),
            password: password.into(),
            solver,
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for RemoteAuthenticator {
    async fn authenticate(&self) -> Result<BankSession, SourceError> {
        // 1) open a login challenge and fetch its captcha image
        let begin: BeginReply = self
            .client
            .post(format!("{}/login/begin", self.base_url))
            .timeout(LOGIN_TIMEOUT)
            .json(&BeginRequest {
                login_id: &self.login_id,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // 2) resolve the captcha
        let captcha_text = self.solver.solve(&begin.captcha_image).await?;

        // 3) submit credentials and the captcha text
        let done: CompleteReply = self
            .client
            .post(format!("{}/login/complete", self.base_url))
            .timeout(LOGIN_TIMEOUT)
            .json(&CompleteRequest {
                challenge_id: &begin.challenge_id,
                password: &self.password,
                captcha_text: &captcha_text,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !done.ok {
            return Err(SourceError::LoginFailed(
                done.message.unwrap_or_else(|| "login refused".to_string()),
            ));
        }
        match (done.session_id, done.device_id) {
            (Some(session_id), Some(device_id)) => {
                tracing::debug!("bank login succeeded");
                Ok(BankSession {
                    session_id,
                    device_id,
                })
            }
            _ => Err(SourceError::LoginFailed(
                "automation reply missing session".to_string(),
            )),
        }
    }
}
