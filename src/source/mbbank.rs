//! # MB Bank adapter
//!
//! Talks to the bank's public web API: formats the history request the way
//! the web client does, detects expired sessions, and maps raw rows into
//! [`Payment`] values. Parsing is deliberately permissive; a malformed row
//! is mapped with zeroed fields rather than dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::login::{Authenticator, BankSession};
use super::{FetchWindow, SourceError, TransactionSource};
use crate::payment::Payment;

const HISTORY_PATH: &str = "/api/retail-transactionms/transactionms/get-account-transaction-history";
const HISTORY_TIMEOUT: Duration = Duration::from_secs(30);
/// Response code the bank returns for a dead or stale session.
const SESSION_EXPIRED_CODE: &str = "GW200";
const BANK_DATE_FORMAT: &str = "%d/%m/%Y";
/// Web client identity the public API expects on every call.
const BASIC_AUTH: &str = "Basic RU1CUkVUQUlMV0VCOlNEMjM0ZGZnMzQlI0BGR0AzNHNmc2RmNDU4NDNm";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36";

/// Transaction source backed by the MB Bank retail web API.
pub struct MbBankSource {
    base_url: String,
    tz: FixedOffset,
    auth: Arc<dyn Authenticator>,
    client: Client,
    session: Mutex<Option<BankSession>>,
    history_timeout: Duration,
}

impl MbBankSource {
    pub fn new(base_url: impl Into<String>, tz: FixedOffset, auth: Arc<dyn Authenticator>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            tz,
            auth,
            client: Client::new(),
            session: Mutex::new(None),
            history_timeout: HISTORY_TIMEOUT,
        }
    }

    pub fn with_history_timeout(mut self, timeout: Duration) -> Self {
        self.history_timeout = timeout;
        self
    }

    /// Reuse the cached session or run the login flow. The lock is held
    /// across login so concurrent fetches cannot double-authenticate.
    async fn session_or_login(&self) -> Result<BankSession, SourceError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let fresh = self.auth.authenticate().await?;
        tracing::info!("established new bank session");
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn request_history(
        &self,
        session: &BankSession,
        account: &str,
        window: FetchWindow,
    ) -> Result<HistoryReply, SourceError> {
        let now = Utc::now().with_timezone(&self.tz);
        let ref_no = make_ref_no(account, now);
        let body = HistoryRequest {
            account_no: account,
            from_date: window.from.with_timezone(&self.tz).format(BANK_DATE_FORMAT).to_string(),
            to_date: window.to.with_timezone(&self.tz).format(BANK_DATE_FORMAT).to_string(),
            session_id: &session.session_id,
            ref_no: &ref_no,
            device_id_common: &session.device_id,
        };
        let reply = self
            .client
            .post(format!("{}{HISTORY_PATH}", self.base_url))
            .timeout(self.history_timeout)
            .header(header::AUTHORIZATION, BASIC_AUTH)
            .header("App", "MB_WEB")
            .header("Deviceid", &session.device_id)
            .header("Refno", &ref_no)
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ORIGIN, &self.base_url)
            .header(header::REFERER, format!("{}/", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<HistoryReply>()
            .await?;
        Ok(reply)
    }

    fn map_transaction(&self, t: RawTransaction) -> Payment {
        // which side is the counterparty depends on the money direction
        let account_receiver = if t.debit_amount > 0 {
            t.ben_account_no.clone()
        } else {
            t.account_no.clone()
        };
        let account_sender = if t.credit_amount > 0 {
            t.ben_account_no.clone()
        } else {
            t.account_no.clone()
        };
        Payment {
            transaction_id: format!("mbbank-{}", t.ref_no),
            content: t.description,
            credit_amount: t.credit_amount,
            debit_amount: t.debit_amount,
            date: self.parse_bank_date(&t.transaction_date),
            account_receiver,
            account_sender,
            name_sender: t.ben_account_name,
        }
    }

    fn parse_bank_date(&self, raw: &str) -> DateTime<Utc> {
        let naive = NaiveDateTime::parse_from_str(raw, "%d/%m/%Y %H:%M:%S").or_else(|_| {
            NaiveDate::parse_from_str(raw, BANK_DATE_FORMAT).map(|d| d.and_time(NaiveTime::MIN))
        });
        match naive {
            Ok(n) => self
                .tz
                .from_local_datetime(&n)
                .single()
                .map(|local| local.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            Err(_) => {
                tracing::warn!("unparseable transaction date {raw:?}, falling back to now");
                Utc::now()
            }
        }
    }
}

#[async_trait::async_trait]
impl TransactionSource for MbBankSource {
    async fn fetch(&self, account: &str, window: FetchWindow) -> Result<Vec<Payment>, SourceError> {
        let session = self.session_or_login().await?;
        let reply = self.request_history(&session, account, window).await?;
        if reply.result.response_code == SESSION_EXPIRED_CODE {
            // drop the dead session so the next call re-authenticates
            self.session.lock().await.take();
            return Err(SourceError::SessionExpired);
        }
        if !reply.result.ok {
            return Err(SourceError::Transient(format!(
                "bank refused history request: {} {}",
                reply.result.response_code,
                reply.result.message.unwrap_or_default()
            )));
        }
        Ok(reply
            .transaction_history_list
            .into_iter()
            .map(|t| self.map_transaction(t))
            .collect())
    }

    fn name(&self) -> &'static str {
        "mbbank"
    }
}

/// Request reference the bank expects: `{ACCOUNT}-{yyyyMMddHHmmss}{centis}`.
fn make_ref_no(account: &str, now: DateTime<FixedOffset>) -> String {
    format!(
        "{}-{}{:02}",
        account.to_uppercase(),
        now.format("%Y%m%d%H%M%S"),
        now.timestamp_subsec_millis() / 10
    )
}

/// Amounts arrive as decimal strings; blanks and garbage become 0.
fn parse_amount(raw: &str) -> u64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0;
    }
    trimmed
        .parse::<u64>()
        .ok()
        .or_else(|| {
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| v as u64)
        })
        .unwrap_or(0)
}

fn de_amount<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(de)?;
    Ok(match v {
        serde_json::Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f as u64)
            .unwrap_or(0),
        serde_json::Value::String(s) => parse_amount(&s),
        _ => 0,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRequest<'a> {
    account_no: &'a str,
    from_date: String,
    to_date: String,
    session_id: &'a str,
    ref_no: &'a str,
    device_id_common: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryReply {
    result: ReplyStatus,
    #[serde(default)]
    transaction_history_list: Vec<RawTransaction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyStatus {
    #[serde(default)]
    response_code: String,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    #[serde(default)]
    ref_no: String,
    #[serde(default, deserialize_with = "de_amount")]
    credit_amount: u64,
    #[serde(default, deserialize_with = "de_amount")]
    debit_amount: u64,
    #[serde(default)]
    description: String,
    #[serde(default)]
    transaction_date: String,
    #[serde(default)]
    account_no: String,
    #[serde(default)]
    ben_account_no: String,
    #[serde(default)]
    ben_account_name: String,
}
