mod account;
mod institution;
mod run;
mod txn;

pub use account::{OpenAccount, SyncState};
pub use txn::Upsert;

use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("malformed amount: {0}")]
    Amount(#[from] rust_decimal::Error),
    #[error("malformed date: {0}")]
    Date(#[from] chrono::ParseError),
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.to_string() == other.to_string()
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

pub struct SqliteStore {
    conn: Arc<sqlx::pool::Pool<sqlx::sqlite::Sqlite>>,
}

impl SqliteStore {
    pub async fn new(uri: &str) -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new().connect(uri).await?;

        let mut conn = pool.acquire().await?;
        sqlx::migrate!("./migrations").run(&mut conn).await?;

        Ok(Self {
            conn: Arc::new(pool),
        })
    }

    pub fn institutions(&mut self) -> institution::Store {
        institution::Store::new(self)
    }

    pub fn accounts(&mut self) -> account::Store {
        account::Store::new(self)
    }

    pub fn txns(&mut self) -> txn::Store {
        txn::Store::new(self)
    }

    pub fn runs(&mut self) -> run::Store {
        run::Store::new(self)
    }
}

fn parse_amount(value: &str) -> Result<Decimal> {
    Ok(Decimal::from_str(value)?)
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(value, "%Y-%m-%d")?)
}

fn parse_datetime(value: &str) -> Result<NaiveDateTime> {
    Ok(NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")?)
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
