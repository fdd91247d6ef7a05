use sea_query::{Expr, Iden, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::Row;

use crate::core::{Mode, RunStats, RunStatus, SyncRun};

use super::{now, parse_datetime, Result, SqliteStore};

#[derive(Iden)]
enum SyncRuns {
    Table,
    Id,
    StartedAt,
    CompletedAt,
    Status,
    Mode,
    AccountsSynced,
    TransactionsFetched,
    TransactionsInserted,
    TransactionsUpdated,
    Error,
}

pub struct Store<'a>(&'a mut SqliteStore);

impl<'a> Store<'a> {
    pub fn new(store: &'a mut SqliteStore) -> Self {
        Self(store)
    }

    /// Opens an audit row in the running state and returns its id.
    pub async fn start(&mut self, mode: Mode) -> Result<i64> {
        let (query, values) = Query::insert()
            .into_table(SyncRuns::Table)
            .columns([SyncRuns::StartedAt, SyncRuns::Status, SyncRuns::Mode])
            .values_panic(vec![
                now().into(),
                RunStatus::Running.as_str().into(),
                mode.as_str().into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(result.last_insert_rowid())
    }

    /// Closes the run with its counters. A non-empty `error` marks account
    /// level failures on an otherwise completed run.
    pub async fn complete(
        &mut self,
        id: i64,
        stats: &RunStats,
        error: Option<&str>,
    ) -> Result<()> {
        let (query, values) = Query::update()
            .table(SyncRuns::Table)
            .values(vec![
                (SyncRuns::CompletedAt, now().into()),
                (SyncRuns::Status, RunStatus::Completed.as_str().into()),
                (SyncRuns::AccountsSynced, stats.accounts_synced.into()),
                (SyncRuns::TransactionsFetched, stats.fetched.into()),
                (SyncRuns::TransactionsInserted, stats.inserted.into()),
                (SyncRuns::TransactionsUpdated, stats.updated.into()),
                (SyncRuns::Error, error.into()),
            ])
            .and_where(Expr::col(SyncRuns::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(())
    }

    pub async fn fail(&mut self, id: i64, error: &str) -> Result<()> {
        let (query, values) = Query::update()
            .table(SyncRuns::Table)
            .values(vec![
                (SyncRuns::CompletedAt, now().into()),
                (SyncRuns::Status, RunStatus::Failed.as_str().into()),
                (SyncRuns::Error, error.into()),
            ])
            .and_where(Expr::col(SyncRuns::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&query, values)
            .execute(&mut self.0.conn.acquire().await?)
            .await?;

        Ok(())
    }

    pub async fn last_completed(&mut self) -> Result<Option<SyncRun>> {
        let row = sqlx::query(
            "SELECT id, started_at, completed_at, status, mode, accounts_synced,
                    transactions_fetched, transactions_inserted,
                    transactions_updated, error
             FROM sync_runs
             WHERE status = 'completed'
             ORDER BY completed_at DESC
             LIMIT 1",
        )
        .fetch_optional(&mut self.0.conn.acquire().await?)
        .await?;

        row.as_ref().map(row_to_run).transpose()
    }

    /// Most recent runs first. A negative limit returns every run.
    pub async fn list(&mut self, limit: i64) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            "SELECT id, started_at, completed_at, status, mode, accounts_synced,
                    transactions_fetched, transactions_inserted,
                    transactions_updated, error
             FROM sync_runs
             ORDER BY started_at DESC, id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut self.0.conn.acquire().await?)
        .await?;

        rows.iter().map(row_to_run).collect()
    }
}

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<SyncRun> {
    let started_at: String = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let status: String = row.try_get("status")?;
    let mode: String = row.try_get("mode")?;

    let accounts_synced: i64 = row.try_get("accounts_synced")?;
    let fetched: i64 = row.try_get("transactions_fetched")?;
    let inserted: i64 = row.try_get("transactions_inserted")?;
    let updated: i64 = row.try_get("transactions_updated")?;

    Ok(SyncRun {
        id: row.try_get("id")?,
        started_at: parse_datetime(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
        status: RunStatus::from(status),
        mode: Mode::from(mode),
        stats: RunStats {
            accounts_synced: accounts_synced as u32,
            fetched: fetched as u32,
            inserted: inserted as u32,
            updated: updated as u32,
        },
        error: row.try_get("error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn start_then_complete_closes_the_run() {
        let mut store = test_store().await;

        let id = store.runs().start(Mode::Full).await.unwrap();
        let stats = RunStats {
            accounts_synced: 2,
            fetched: 40,
            inserted: 38,
            updated: 2,
        };
        store.runs().complete(id, &stats, None).await.unwrap();

        let run = store.runs().last_completed().await.unwrap().unwrap();
        assert_eq!(run.id, id);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.mode, Mode::Full);
        assert_eq!(run.stats.inserted, 38);
        assert!(run.completed_at.is_some());
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn failed_runs_never_become_the_watermark() {
        let mut store = test_store().await;

        let id = store.runs().start(Mode::Incremental).await.unwrap();
        store.runs().fail(id, "credentials rejected").await.unwrap();

        assert!(store.runs().last_completed().await.unwrap().is_none());

        let runs = store.runs().list(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("credentials rejected"));
    }

    #[tokio::test]
    async fn list_honors_the_limit() {
        let mut store = test_store().await;
        for _ in 0..3 {
            let id = store.runs().start(Mode::Full).await.unwrap();
            store
                .runs()
                .complete(id, &RunStats::default(), None)
                .await
                .unwrap();
        }

        assert_eq!(store.runs().list(2).await.unwrap().len(), 2);
        assert_eq!(store.runs().list(-1).await.unwrap().len(), 3);
    }
}
