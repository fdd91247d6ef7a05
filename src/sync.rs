use std::io::Write;

use anyhow::Result;
use chrono::Utc;
use clap::ArgMatches;
use tabwriter::TabWriter;
use tracing::{info, warn};

use crate::core::{Mode, RunStats, Transaction};
use crate::settings::Settings;
use crate::store::SqliteStore;
use crate::upstream::{teller, AccountSource, TransactionSource};

/// Incremental state older than this is not trusted; the next run refetches
/// everything to catch late edits and reversals.
const FULL_SYNC_AFTER_DAYS: i64 = 7;

pub(crate) async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()?).await?;
    let client = teller::Client::new(&settings)?;

    let mode = select_mode(&mut store, matches.is_present("full")).await?;
    info!(mode = mode.as_str(), "starting sync");

    let stats = sync_accounts(&mut store, &client, mode).await?;

    println!(
        "{} sync complete: {} accounts, {} fetched, {} inserted, {} updated",
        mode.as_str(),
        stats.accounts_synced,
        stats.fetched,
        stats.inserted,
        stats.updated,
    );

    Ok(())
}

pub(crate) async fn runs(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()?).await?;

    let limit: i64 = match matches.value_of("limit") {
        Some(value) => value.parse()?,
        None => 10,
    };
    let runs = store.runs().list(limit).await?;

    let mut tw = TabWriter::new(vec![]);
    writeln!(
        tw,
        "ID\tStarted\tStatus\tMode\tAccounts\tFetched\tInserted\tUpdated\tError"
    )?;
    for run in runs {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            run.id,
            run.started_at,
            run.status.as_str(),
            run.mode.as_str(),
            run.stats.accounts_synced,
            run.stats.fetched,
            run.stats.inserted,
            run.stats.updated,
            run.error.as_deref().unwrap_or("-"),
        )?;
    }
    tw.flush()?;

    println!("{}", String::from_utf8(tw.into_inner()?)?);

    Ok(())
}

/// Picks incremental only when a completed run exists and is recent enough.
async fn select_mode(store: &mut SqliteStore, force_full: bool) -> Result<Mode> {
    if force_full {
        return Ok(Mode::Full);
    }

    let last = match store.runs().last_completed().await? {
        Some(run) => run,
        None => return Ok(Mode::Full),
    };

    let completed_at = match last.completed_at {
        Some(ts) => ts,
        None => return Ok(Mode::Full),
    };

    let age = Utc::now().naive_utc() - completed_at;
    if age.num_days() >= FULL_SYNC_AFTER_DAYS {
        info!(days = age.num_days(), "incremental state is stale");
        return Ok(Mode::Full);
    }

    Ok(Mode::Incremental)
}

/// Pulls every account from the source into the store under a sync_runs audit
/// row. Account-level upstream failures are recorded without aborting the
/// run; credential and certificate failures abort it.
pub(crate) async fn sync_accounts<S>(
    store: &mut SqliteStore,
    source: &S,
    mode: Mode,
) -> Result<RunStats>
where
    S: AccountSource + TransactionSource + Sync,
{
    let run_id = store.runs().start(mode).await?;

    match sync_inner(store, source, mode).await {
        Ok((stats, failures)) => {
            let joined = failures.join("; ");
            let error = (!joined.is_empty()).then_some(joined.as_str());
            store.runs().complete(run_id, &stats, error).await?;

            Ok(stats)
        }
        Err(e) => {
            store.runs().fail(run_id, &e.to_string()).await?;

            Err(e)
        }
    }
}

async fn sync_inner<S>(
    store: &mut SqliteStore,
    source: &S,
    mode: Mode,
) -> Result<(RunStats, Vec<String>)>
where
    S: AccountSource + TransactionSource + Sync,
{
    let accounts = source.accounts().await?;

    let mut stats = RunStats::default();
    let mut failures = Vec::new();

    for account in &accounts {
        store.institutions().save(&account.institution).await?;
        store.accounts().save(account).await?;

        let state = store.accounts().sync_state(&account.id).await?;
        let since = match mode {
            Mode::Incremental => state.last_transaction_date,
            Mode::Full => None,
        };

        let fetched = match source.transactions(&account.id, since).await {
            Ok(txns) => txns,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(account = %account.id, error = %e, "skipping account");
                failures.push(format!("{}: {}", account.id, e));
                continue;
            }
        };

        let mut latest: Option<Transaction> = None;
        for tx in fetched {
            stats.fetched += 1;

            // Incremental pulls overlap at the watermark date; anything at
            // or before it that we already hold is not new.
            if let Some(last_date) = since {
                if tx.date < last_date {
                    continue;
                }
                if tx.date == last_date
                    && (state.last_transaction_id.as_deref() == Some(&tx.id)
                        || store.txns().exists(&tx.id).await?)
                {
                    continue;
                }
            }

            match store.txns().upsert(&tx).await? {
                crate::store::Upsert::Inserted => stats.inserted += 1,
                crate::store::Upsert::Updated => stats.updated += 1,
            }

            if latest.as_ref().map_or(true, |l| tx.date > l.date) {
                latest = Some(tx);
            }
        }

        store
            .accounts()
            .advance_watermark(&account.id, latest.as_ref())
            .await?;
        stats.accounts_synced += 1;
    }

    Ok((stats, failures))
}
