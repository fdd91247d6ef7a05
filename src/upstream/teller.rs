use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::core;
use crate::settings::Settings;
use crate::upstream::{AccountSource, Error, Result, TransactionSource};

const PAGE_SIZE: usize = 250;
const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const BASE_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct Institution {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub currency: String,
    pub r#type: String,
    pub subtype: Option<String>,
    pub status: String,
    pub last_four: Option<String>,
    pub enrollment_id: Option<String>,
    pub institution: Institution,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Counterparty {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub ty: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Details {
    pub category: Option<String>,
    pub processing_status: Option<String>,
    pub counterparty: Option<Counterparty>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    pub amount: String,
    pub date: String,
    pub description: String,
    pub status: String,
    pub r#type: Option<String>,
    pub running_balance: Option<String>,
    #[serde(default)]
    pub details: Details,
}

/// Teller API client. Authenticates with HTTP Basic using the access token as
/// the username, optionally presenting a client certificate for mutual TLS.
pub struct Client {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl Client {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if let (Some(cert), Some(key)) = (&settings.cert_file, &settings.key_file) {
            let mut pem = std::fs::read(cert)?;
            pem.extend(std::fs::read(key)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }

        Ok(Self {
            http: builder.build()?,
            token: settings.access_token.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Lazy, restartable page walk over an account's transaction history.
    pub fn pages(&self, account_id: &str) -> TransactionPages {
        TransactionPages {
            client: self,
            account_id: account_id.to_string(),
            from_id: None,
            done: false,
        }
    }

    /// Derives the current balance from the most recent running balance the
    /// provider reports. Accounts with no posted running balance have none.
    pub async fn balance(&self, account_id: &str) -> Result<Option<Decimal>> {
        let body = self
            .get(
                &format!("/accounts/{}/transactions", account_id),
                &[("count", "20".to_string())],
            )
            .await?;
        let entries = body
            .as_array()
            .ok_or_else(|| Error::Malformed("expected transaction array".into()))?;

        Ok(latest_running_balance(entries))
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let sent = self
                .http
                .get(&url)
                .basic_auth(&self.token, None::<&str>)
                .query(query)
                .send()
                .await;

            let resp = match sent {
                Ok(resp) => resp,
                Err(e) if retryable_transport(&e) && attempt < MAX_ATTEMPTS => {
                    warn!(error = %e, attempt, "transport error, backing off");
                    sleep(backoff(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(Error::Auth(format!("{} from {}", status, url)));
            }
            if retryable_status(status) {
                if attempt < MAX_ATTEMPTS {
                    warn!(%status, attempt, "retrying after backoff");
                    sleep(backoff(attempt)).await;
                    continue;
                }

                return Err(Error::RateLimited(attempt));
            }

            let body: serde_json::Value = resp.json().await?;
            if let Some(err) = body.get("error") {
                let code = err
                    .get("code")
                    .and_then(|c| c.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let message = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string();

                if code == "unauthorized" || code == "forbidden" {
                    return Err(Error::Auth(message));
                }

                return Err(Error::Api { code, message });
            }
            if !status.is_success() {
                return Err(Error::Api {
                    code: status.to_string(),
                    message: url,
                });
            }

            return Ok(body);
        }
    }
}

/// Cursor over an account's transaction pages, newest first. Each call to
/// `next_page` issues one request; the walk ends on an empty or short page.
pub struct TransactionPages<'a> {
    client: &'a Client,
    account_id: String,
    from_id: Option<String>,
    done: bool,
}

impl<'a> TransactionPages<'a> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<Transaction>>> {
        if self.done {
            return Ok(None);
        }

        let mut query: Vec<(&str, String)> = vec![("count", PAGE_SIZE.to_string())];
        if let Some(id) = &self.from_id {
            query.push(("from_id", id.clone()));
        }

        let body = self
            .client
            .get(&format!("/accounts/{}/transactions", self.account_id), &query)
            .await?;
        let entries = body
            .as_array()
            .ok_or_else(|| Error::Malformed("expected transaction array".into()))?;

        if entries.is_empty() {
            self.done = true;
            return Ok(None);
        }
        if entries.len() < PAGE_SIZE {
            self.done = true;
        }

        match entries.last().and_then(|e| e.get("id")).and_then(|v| v.as_str()) {
            Some(id) => self.from_id = Some(id.to_string()),
            None => self.done = true,
        }

        let mut page = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<Transaction>(entry.clone()) {
                Ok(tx) => page.push(tx),
                Err(e) => warn!(error = %e, "skipping malformed transaction entry"),
            }
        }

        debug!(account = %self.account_id, count = page.len(), "fetched transaction page");

        Ok(Some(page))
    }
}

/// Most recent parseable running balance, newest entries first. Malformed
/// values are skipped so one bad entry does not hide the next one.
fn latest_running_balance(entries: &[serde_json::Value]) -> Option<Decimal> {
    for entry in entries {
        if let Some(raw) = entry.get("running_balance").and_then(|v| v.as_str()) {
            match Decimal::from_str(raw) {
                Ok(balance) => return Some(balance),
                Err(e) => warn!(error = %e, "skipping malformed running balance"),
            }
        }
    }

    None
}

/// The balance is a best-effort snapshot; losing it on one account must not
/// take the other accounts down with it. Only credential and certificate
/// errors escape.
fn tolerate_balance_error(
    result: Result<Option<Decimal>>,
    account_id: &str,
) -> Result<Option<Decimal>> {
    match result {
        Err(e) if !e.is_fatal() => {
            warn!(account = %account_id, error = %e, "balance unavailable");
            Ok(None)
        }
        other => other,
    }
}

fn to_canonical(tx: &Transaction) -> Result<core::Transaction> {
    let date = NaiveDate::parse_from_str(&tx.date, "%Y-%m-%d")
        .map_err(|e| Error::Malformed(format!("transaction {}: {}", tx.id, e)))?;
    let amount = Decimal::from_str(&tx.amount)
        .map_err(|e| Error::Malformed(format!("transaction {}: {}", tx.id, e)))?;
    let running_balance = match &tx.running_balance {
        Some(v) => Some(
            Decimal::from_str(v)
                .map_err(|e| Error::Malformed(format!("transaction {}: {}", tx.id, e)))?,
        ),
        None => None,
    };

    Ok(core::Transaction {
        id: tx.id.clone(),
        account_id: tx.account_id.clone(),
        date,
        amount,
        description: tx.description.clone(),
        status: if tx.status == "pending" {
            core::Status::Pending
        } else {
            core::Status::Posted
        },
        ty: tx.r#type.clone(),
        category: tx.details.category.clone(),
        counterparty: tx.details.counterparty.as_ref().and_then(|c| c.name.clone()),
        running_balance,
    })
}

fn to_canonical_account(account: &Account, balance: Option<Decimal>) -> core::Account {
    core::Account {
        id: account.id.clone(),
        institution: core::Institution {
            id: account.institution.id.clone(),
            name: account.institution.name.clone(),
        },
        enrollment_id: account.enrollment_id.clone(),
        name: account.name.clone(),
        ty: account.r#type.clone(),
        subtype: account.subtype.clone(),
        status: account.status.clone(),
        currency: account.currency.clone(),
        last_four: account.last_four.clone(),
        balance,
    }
}

#[async_trait]
impl AccountSource for Client {
    async fn accounts(&self) -> Result<Vec<core::Account>> {
        let body = self.get("/accounts", &[]).await?;
        let entries = body
            .as_array()
            .ok_or_else(|| Error::Malformed("expected account array".into()))?;

        let mut accounts = Vec::with_capacity(entries.len());
        for entry in entries {
            let wire: Account = match serde_json::from_value(entry.clone()) {
                Ok(account) => account,
                Err(e) => {
                    warn!(error = %e, "skipping malformed account entry");
                    continue;
                }
            };
            let balance = tolerate_balance_error(self.balance(&wire.id).await, &wire.id)?;
            accounts.push(to_canonical_account(&wire, balance));
        }

        Ok(accounts)
    }
}

#[async_trait]
impl TransactionSource for Client {
    async fn transactions(
        &self,
        account_id: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<core::Transaction>> {
        let mut pages = self.pages(account_id);
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        while let Some(page) = pages.next_page().await? {
            let mut oldest: Option<NaiveDate> = None;

            for wire in &page {
                if wire.status == "pending" {
                    continue;
                }

                let tx = match to_canonical(wire) {
                    Ok(tx) => tx,
                    Err(e) => {
                        warn!(error = %e, "skipping transaction");
                        continue;
                    }
                };

                oldest = Some(oldest.map_or(tx.date, |d: NaiveDate| d.min(tx.date)));
                // Cursor pages can overlap by one entry.
                if seen.insert(tx.id.clone()) {
                    out.push(tx);
                }
            }

            if let (Some(bound), Some(date)) = (since, oldest) {
                if date < bound {
                    break;
                }
            }
        }

        Ok(out)
    }
}

fn retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500..=599)
}

fn retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(8);
    Duration::from_millis(BASE_BACKOFF_MS << exp)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    const TXN_JSON: &str = r#"{
        "id": "txn_o1",
        "account_id": "acc_1",
        "amount": "-42.17",
        "date": "2023-07-14",
        "description": "COFFEE SHOP",
        "status": "posted",
        "type": "card_payment",
        "running_balance": "1201.33",
        "details": {
            "category": "dining",
            "processing_status": "complete",
            "counterparty": {"name": "COFFEE SHOP", "type": "organization"}
        },
        "links": {"self": "https://api.teller.io/accounts/acc_1/transactions/txn_o1"}
    }"#;

    #[test]
    fn parses_wire_transaction() {
        let tx: Transaction = serde_json::from_str(TXN_JSON).unwrap();

        assert_eq!(tx.amount, "-42.17");
        assert_eq!(tx.details.category.as_deref(), Some("dining"));
        assert_eq!(
            tx.details.counterparty.unwrap().name.as_deref(),
            Some("COFFEE SHOP")
        );
    }

    #[test]
    fn canonical_transaction_keeps_cent_precision() {
        let wire: Transaction = serde_json::from_str(TXN_JSON).unwrap();
        let tx = to_canonical(&wire).unwrap();

        assert_eq!(tx.amount, dec!(-42.17));
        assert_eq!(tx.running_balance, Some(dec!(1201.33)));
        assert_eq!(tx.date, NaiveDate::from_ymd_opt(2023, 7, 14).unwrap());
        assert_eq!(tx.status, core::Status::Posted);
    }

    #[test]
    fn canonical_transaction_rejects_bad_amount() {
        let mut wire: Transaction = serde_json::from_str(TXN_JSON).unwrap();
        wire.amount = "not-a-number".to_string();

        assert!(matches!(to_canonical(&wire), Err(Error::Malformed(_))));
    }

    #[test]
    fn backoff_grows_and_is_bounded() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_millis(1000));
        assert_eq!(backoff(3), Duration::from_millis(2000));
        assert!(backoff(100) <= Duration::from_millis(BASE_BACKOFF_MS << 8));
    }

    #[test]
    fn running_balance_scan_skips_malformed_values() {
        let entries: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {"id": "txn_3", "running_balance": null},
                {"id": "txn_2", "running_balance": "garbage"},
                {"id": "txn_1", "running_balance": "1201.33"}
            ]"#,
        )
        .unwrap();

        assert_eq!(latest_running_balance(&entries), Some(dec!(1201.33)));
        assert_eq!(latest_running_balance(&entries[..2]), None);
    }

    #[test]
    fn balance_fetch_failures_degrade_to_no_balance() {
        assert_eq!(
            tolerate_balance_error(Err(Error::RateLimited(3)), "acc_1").unwrap(),
            None
        );
        assert_eq!(
            tolerate_balance_error(
                Err(Error::Malformed("expected transaction array".into())),
                "acc_1"
            )
            .unwrap(),
            None
        );
        assert_eq!(
            tolerate_balance_error(Ok(Some(dec!(10.00))), "acc_1").unwrap(),
            Some(dec!(10.00))
        );
        assert!(tolerate_balance_error(Err(Error::Auth("nope".into())), "acc_1").is_err());
    }

    #[test]
    fn auth_errors_are_fatal() {
        assert!(Error::Auth("nope".into()).is_fatal());
        assert!(!Error::RateLimited(3).is_fatal());
        assert!(!Error::Api {
            code: "enrollment.disconnected".into(),
            message: "reauthenticate".into()
        }
        .is_fatal());
    }
}
