pub mod teller;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::core::{Account, Transaction};

#[derive(Debug, Error)]
pub enum Error {
    #[error("credentials rejected: {0}")]
    Auth(String),
    #[error("reading client certificate: {0}")]
    Certificate(#[from] std::io::Error),
    #[error("rate limited, gave up after {0} attempts")]
    RateLimited(u32),
    #[error("teller api error {code}: {message}")]
    Api { code: String, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl Error {
    /// Errors that invalidate the whole run rather than a single account.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Certificate(_))
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

#[async_trait]
pub trait AccountSource {
    async fn accounts(&self) -> Result<Vec<Account>>;
}

#[async_trait]
pub trait TransactionSource {
    /// Returns posted transactions for an account, newest first. `since`
    /// bounds how far back the provider must page; entries older than it may
    /// still appear in the result and are filtered by the caller.
    async fn transactions(
        &self,
        account_id: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<Transaction>>;
}
