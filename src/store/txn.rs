use chrono::NaiveDate;
use rust_decimal::Decimal;
use sea_query::{Iden, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::Row;

use crate::core::{Status, Transaction};

use super::{parse_amount, parse_date, Result, SqliteStore};

#[derive(Iden)]
enum Transactions {
    Table,
    Id,
    AccountId,
    Date,
    Amount,
    Description,
    Status,
    Type,
    Category,
    Counterparty,
    RunningBalance,
    CreatedAt,
}

/// Whether an upsert touched an existing row or created one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// Transaction joined with account and institution names, for reports.
pub struct JoinedRow {
    pub date: String,
    pub account_name: String,
    pub institution_name: String,
    pub description: String,
    pub amount: String,
    pub category: Option<String>,
    pub counterparty: Option<String>,
    pub running_balance: Option<String>,
    pub status: String,
}

/// Posted transaction with its account attached, for monthly aggregation.
pub struct PostedWithAccount {
    pub date: NaiveDate,
    pub amount: Decimal,
    pub category: Option<String>,
    pub account_name: String,
    pub account_type: String,
}

/// Row as persisted, for the CSV exporter.
pub struct TxnRow {
    pub id: String,
    pub account_id: String,
    pub date: String,
    pub amount: String,
    pub description: String,
    pub status: String,
    pub ty: Option<String>,
    pub category: Option<String>,
    pub counterparty: Option<String>,
    pub running_balance: Option<String>,
    pub created_at: String,
}

pub struct Store<'a>(&'a mut SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a mut SqliteStore) -> Self {
        Self(store)
    }

    pub async fn exists(&mut self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM transactions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(row.is_some())
    }

    /// Insert-or-update keyed by the upstream transaction id. Mutable fields
    /// are refreshed in place so description cleanups and enrichment changes
    /// upstream propagate without duplicating the row.
    pub async fn upsert(&mut self, tx: &Transaction) -> Result<Upsert> {
        let existed = self.exists(&tx.id).await?;

        let (query, values) = Query::insert()
            .into_table(Transactions::Table)
            .columns([
                Transactions::Id,
                Transactions::AccountId,
                Transactions::Date,
                Transactions::Amount,
                Transactions::Description,
                Transactions::Status,
                Transactions::Type,
                Transactions::Category,
                Transactions::Counterparty,
                Transactions::RunningBalance,
            ])
            .values_panic(vec![
                tx.id.as_str().into(),
                tx.account_id.as_str().into(),
                tx.date.format("%Y-%m-%d").to_string().into(),
                tx.amount.to_string().into(),
                tx.description.as_str().into(),
                tx.status.as_str().into(),
                tx.ty.clone().into(),
                tx.category.clone().into(),
                tx.counterparty.clone().into(),
                tx.running_balance.map(|b| b.to_string()).into(),
            ])
            .on_conflict(
                OnConflict::column(Transactions::Id)
                    .update_columns([
                        Transactions::Amount,
                        Transactions::Description,
                        Transactions::Status,
                        Transactions::Category,
                        Transactions::Counterparty,
                        Transactions::RunningBalance,
                    ])
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(if existed {
            Upsert::Updated
        } else {
            Upsert::Inserted
        })
    }

    /// All posted transactions, newest first within each account.
    pub async fn posted(&mut self) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT id, account_id, date, amount, description, status, type,
                    category, counterparty, running_balance
             FROM transactions
             WHERE status = 'posted'
             ORDER BY account_id, date DESC",
        )
        .fetch_all(&mut self.0.conn.acquire().await?)
        .await?;

        rows.iter().map(row_to_txn).collect()
    }

    /// Earliest and latest posted transaction dates, or None when empty.
    pub async fn date_range(&mut self) -> Result<Option<(NaiveDate, NaiveDate)>> {
        let row = sqlx::query(
            "SELECT MIN(date) AS earliest, MAX(date) AS latest
             FROM transactions WHERE status = 'posted'",
        )
        .fetch_one(&mut self.0.conn.acquire().await?)
        .await?;

        let earliest: Option<String> = row.try_get("earliest")?;
        let latest: Option<String> = row.try_get("latest")?;

        match (earliest, latest) {
            (Some(e), Some(l)) => Ok(Some((parse_date(&e)?, parse_date(&l)?))),
            _ => Ok(None),
        }
    }

    /// Posted outflows whose description contains the pattern, oldest first.
    /// Used to find transfers out to a brokerage.
    pub async fn transfers_matching(&mut self, pattern: &str) -> Result<Vec<Transaction>> {
        let needle = format!("%{}%", pattern.to_lowercase());
        let rows = sqlx::query(
            "SELECT id, account_id, date, amount, description, status, type,
                    category, counterparty, running_balance
             FROM transactions
             WHERE status = 'posted'
               AND CAST(amount AS REAL) < 0
               AND LOWER(description) LIKE ?
             ORDER BY date ASC",
        )
        .bind(needle)
        .fetch_all(&mut self.0.conn.acquire().await?)
        .await?;

        rows.iter().map(row_to_txn).collect()
    }

    pub async fn recent_with_names(&mut self, limit: i64) -> Result<Vec<JoinedRow>> {
        let rows = sqlx::query(
            "SELECT t.date, a.name AS account_name, i.name AS institution_name,
                    t.description, t.amount, t.category, t.counterparty,
                    t.running_balance, t.status
             FROM transactions t
             JOIN accounts a ON t.account_id = a.id
             JOIN institutions i ON a.institution_id = i.id
             ORDER BY t.date DESC, t.created_at DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut self.0.conn.acquire().await?)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(JoinedRow {
                date: row.try_get("date")?,
                account_name: row.try_get("account_name")?,
                institution_name: row.try_get("institution_name")?,
                description: row.try_get("description")?,
                amount: row.try_get("amount")?,
                category: row.try_get("category")?,
                counterparty: row.try_get("counterparty")?,
                running_balance: row.try_get("running_balance")?,
                status: row.try_get("status")?,
            });
        }

        Ok(out)
    }

    pub async fn posted_with_account(&mut self) -> Result<Vec<PostedWithAccount>> {
        let rows = sqlx::query(
            "SELECT t.date, t.amount, t.category, a.name AS account_name,
                    a.type AS account_type
             FROM transactions t
             JOIN accounts a ON t.account_id = a.id
             WHERE t.status = 'posted'
             ORDER BY t.date",
        )
        .fetch_all(&mut self.0.conn.acquire().await?)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let date: String = row.try_get("date")?;
            let amount: String = row.try_get("amount")?;
            out.push(PostedWithAccount {
                date: parse_date(&date)?,
                amount: parse_amount(&amount)?,
                category: row.try_get("category")?,
                account_name: row.try_get("account_name")?,
                account_type: row.try_get("account_type")?,
            });
        }

        Ok(out)
    }

    pub async fn dump(&mut self) -> Result<Vec<TxnRow>> {
        let rows = sqlx::query(
            "SELECT id, account_id, date, amount, description, status, type,
                    category, counterparty, running_balance, created_at
             FROM transactions ORDER BY date DESC, id",
        )
        .fetch_all(&mut self.0.conn.acquire().await?)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TxnRow {
                id: row.try_get("id")?,
                account_id: row.try_get("account_id")?,
                date: row.try_get("date")?,
                amount: row.try_get("amount")?,
                description: row.try_get("description")?,
                status: row.try_get("status")?,
                ty: row.try_get("type")?,
                category: row.try_get("category")?,
                counterparty: row.try_get("counterparty")?,
                running_balance: row.try_get("running_balance")?,
                created_at: row.try_get("created_at")?,
            });
        }

        Ok(out)
    }
}

fn row_to_txn(row: &sqlx::sqlite::SqliteRow) -> Result<Transaction> {
    let date: String = row.try_get("date")?;
    let amount: String = row.try_get("amount")?;
    let status: String = row.try_get("status")?;
    let running_balance: Option<String> = row.try_get("running_balance")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        date: parse_date(&date)?,
        amount: parse_amount(&amount)?,
        description: row.try_get("description")?,
        status: Status::from(status),
        ty: row.try_get("type")?,
        category: row.try_get("category")?,
        counterparty: row.try_get("counterparty")?,
        running_balance: running_balance.as_deref().map(parse_amount).transpose()?,
    })
}
