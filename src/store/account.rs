use chrono::NaiveDate;
use rust_decimal::Decimal;
use sea_query::{Expr, Iden, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::Row;

use crate::core::{Account, Transaction};

use super::{now, parse_amount, parse_date, Result, SqliteStore};

#[derive(Iden)]
enum Accounts {
    Table,
    Id,
    InstitutionId,
    EnrollmentId,
    Name,
    Type,
    Subtype,
    Status,
    Currency,
    LastFour,
    BalanceAmount,
    BalanceUpdatedAt,
    LastTransactionDate,
    LastTransactionId,
    LastSyncedAt,
}

/// Incremental sync bookkeeping for a single account.
#[derive(Debug, Default, Clone)]
pub struct SyncState {
    pub last_transaction_date: Option<NaiveDate>,
    pub last_transaction_id: Option<String>,
}

/// Open account joined with its institution, balances parsed.
#[derive(Debug, Clone)]
pub struct OpenAccount {
    pub id: String,
    pub name: String,
    pub ty: String,
    pub institution: String,
    pub balance: Decimal,
}

/// Row as persisted, for the CSV exporter.
pub struct AccountRow {
    pub id: String,
    pub institution_id: String,
    pub enrollment_id: Option<String>,
    pub name: String,
    pub ty: String,
    pub subtype: Option<String>,
    pub status: String,
    pub currency: String,
    pub last_four: Option<String>,
    pub balance_amount: Option<String>,
    pub balance_updated_at: Option<String>,
    pub last_transaction_date: Option<String>,
    pub last_transaction_id: Option<String>,
    pub last_synced_at: Option<String>,
}

pub struct Store<'a>(&'a mut SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a mut SqliteStore) -> Self {
        Self(store)
    }

    /// Insert-or-update keyed by the upstream account id. Name, status, and
    /// the balance snapshot are refreshed on every sync; watermark columns
    /// are left alone.
    pub async fn save(&mut self, account: &Account) -> Result<()> {
        let balance = account.balance.map(|b| b.to_string());
        let balance_updated_at = account.balance.map(|_| now());

        let (query, values) = Query::insert()
            .into_table(Accounts::Table)
            .columns([
                Accounts::Id,
                Accounts::InstitutionId,
                Accounts::EnrollmentId,
                Accounts::Name,
                Accounts::Type,
                Accounts::Subtype,
                Accounts::Status,
                Accounts::Currency,
                Accounts::LastFour,
                Accounts::BalanceAmount,
                Accounts::BalanceUpdatedAt,
            ])
            .values_panic(vec![
                account.id.as_str().into(),
                account.institution.id.as_str().into(),
                account.enrollment_id.clone().into(),
                account.name.as_str().into(),
                account.ty.as_str().into(),
                account.subtype.clone().into(),
                account.status.as_str().into(),
                account.currency.as_str().into(),
                account.last_four.clone().into(),
                balance.into(),
                balance_updated_at.into(),
            ])
            .on_conflict(
                OnConflict::column(Accounts::Id)
                    .update_columns([
                        Accounts::Name,
                        Accounts::Status,
                        Accounts::BalanceAmount,
                        Accounts::BalanceUpdatedAt,
                    ])
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(())
    }

    pub async fn sync_state(&mut self, id: &str) -> Result<SyncState> {
        let (query, values) = Query::select()
            .columns([Accounts::LastTransactionDate, Accounts::LastTransactionId])
            .from(Accounts::Table)
            .and_where(Expr::col(Accounts::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&query, values)
            .fetch_optional(&mut self.0.conn.acquire().await?)
            .await?;

        match row {
            Some(row) => {
                let date: Option<String> = row.try_get("last_transaction_date")?;
                Ok(SyncState {
                    last_transaction_date: date.as_deref().map(parse_date).transpose()?,
                    last_transaction_id: row.try_get("last_transaction_id")?,
                })
            }
            None => Ok(SyncState::default()),
        }
    }

    /// Records the newest transaction seen for the account and stamps
    /// `last_synced_at`. With no new transactions only the stamp moves.
    pub async fn advance_watermark(
        &mut self,
        id: &str,
        latest: Option<&Transaction>,
    ) -> Result<()> {
        let mut columns: Vec<(Accounts, sea_query::SimpleExpr)> =
            vec![(Accounts::LastSyncedAt, now().into())];
        if let Some(tx) = latest {
            columns.push((
                Accounts::LastTransactionDate,
                tx.date.format("%Y-%m-%d").to_string().into(),
            ));
            columns.push((Accounts::LastTransactionId, tx.id.as_str().into()));
        }

        let (query, values) = Query::update()
            .table(Accounts::Table)
            .values(columns)
            .and_where(Expr::col(Accounts::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(())
    }

    pub async fn open_with_balance(&mut self) -> Result<Vec<OpenAccount>> {
        let rows = sqlx::query(
            "SELECT a.id, a.name, a.type, a.balance_amount, i.name AS institution
             FROM accounts a
             JOIN institutions i ON a.institution_id = i.id
             WHERE a.status = 'open'
             ORDER BY a.name",
        )
        .fetch_all(&mut self.0.conn.acquire().await?)
        .await?;

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            let balance: Option<String> = row.try_get("balance_amount")?;
            accounts.push(OpenAccount {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                ty: row.try_get("type")?,
                institution: row.try_get("institution")?,
                balance: balance
                    .as_deref()
                    .map(parse_amount)
                    .transpose()?
                    .unwrap_or(Decimal::ZERO),
            });
        }

        Ok(accounts)
    }

    pub async fn dump(&mut self) -> Result<Vec<AccountRow>> {
        let rows = sqlx::query(
            "SELECT id, institution_id, enrollment_id, name, type, subtype, status,
                    currency, last_four, balance_amount, balance_updated_at,
                    last_transaction_date, last_transaction_id, last_synced_at
             FROM accounts ORDER BY name",
        )
        .fetch_all(&mut self.0.conn.acquire().await?)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AccountRow {
                id: row.try_get("id")?,
                institution_id: row.try_get("institution_id")?,
                enrollment_id: row.try_get("enrollment_id")?,
                name: row.try_get("name")?,
                ty: row.try_get("type")?,
                subtype: row.try_get("subtype")?,
                status: row.try_get("status")?,
                currency: row.try_get("currency")?,
                last_four: row.try_get("last_four")?,
                balance_amount: row.try_get("balance_amount")?,
                balance_updated_at: row.try_get("balance_updated_at")?,
                last_transaction_date: row.try_get("last_transaction_date")?,
                last_transaction_id: row.try_get("last_transaction_id")?,
                last_synced_at: row.try_get("last_synced_at")?,
            });
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use crate::core::Institution;

    use super::*;

    fn checking(balance: Option<Decimal>) -> Account {
        Account {
            id: "acc_1".to_string(),
            institution: Institution {
                id: "ins_1".to_string(),
                name: "First Bank".to_string(),
            },
            enrollment_id: Some("enr_1".to_string()),
            name: "Everyday Checking".to_string(),
            ty: "depository".to_string(),
            subtype: Some("checking".to_string()),
            status: "open".to_string(),
            currency: "USD".to_string(),
            last_four: Some("4321".to_string()),
            balance,
        }
    }

    async fn test_store() -> SqliteStore {
        let mut store = SqliteStore::new("sqlite::memory:").await.unwrap();
        store
            .institutions()
            .save(&Institution {
                id: "ins_1".to_string(),
                name: "First Bank".to_string(),
            })
            .await
            .unwrap();

        store
    }

    #[tokio::test]
    async fn save_refreshes_balance_snapshot() {
        let mut store = test_store().await;

        store.accounts().save(&checking(Some(dec!(100.00)))).await.unwrap();
        store.accounts().save(&checking(Some(dec!(250.50)))).await.unwrap();

        let accounts = store.accounts().open_with_balance().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].balance, dec!(250.50));
    }

    #[tokio::test]
    async fn watermark_round_trips() {
        let mut store = test_store().await;
        store.accounts().save(&checking(None)).await.unwrap();

        let tx = Transaction {
            id: "txn_9".to_string(),
            account_id: "acc_1".to_string(),
            date: NaiveDate::from_ymd_opt(2023, 7, 14).unwrap(),
            amount: dec!(-12.00),
            description: "LUNCH".to_string(),
            status: crate::core::Status::Posted,
            ty: None,
            category: None,
            counterparty: None,
            running_balance: None,
        };
        store
            .accounts()
            .advance_watermark("acc_1", Some(&tx))
            .await
            .unwrap();

        let state = store.accounts().sync_state("acc_1").await.unwrap();
        assert_eq!(
            state.last_transaction_date,
            NaiveDate::from_ymd_opt(2023, 7, 14)
        );
        assert_eq!(state.last_transaction_id.as_deref(), Some("txn_9"));
    }

    #[tokio::test]
    async fn sync_state_defaults_for_unknown_account() {
        let mut store = test_store().await;

        let state = store.accounts().sync_state("acc_missing").await.unwrap();
        assert!(state.last_transaction_date.is_none());
        assert!(state.last_transaction_id.is_none());
    }
}
