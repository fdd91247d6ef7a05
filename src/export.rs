use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{Datelike, Local};
use clap::ArgMatches;
use rust_decimal::Decimal;

use crate::settings::Settings;
use crate::store::SqliteStore;

const RECENT_LIMIT: i64 = 1000;

pub(crate) fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

pub(crate) async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()?).await?;

    let base = matches
        .value_of("out")
        .unwrap_or(settings.reports_dir.as_str());
    let dir = export_all(&mut store, Path::new(base)).await?;

    println!("exported to {}", dir.display());

    Ok(())
}

/// Writes every table plus the derived reports into a fresh timestamped
/// folder under `base`, and a README.txt summarizing what landed there.
pub async fn export_all(store: &mut SqliteStore, base: &Path) -> Result<PathBuf> {
    let dir = base.join(format!("export_{}", timestamp()));
    std::fs::create_dir_all(&dir)?;

    let institutions = store.institutions().dump().await?;
    let mut writer = csv::Writer::from_path(dir.join("institutions.csv"))?;
    writer.write_record(["id", "name", "created_at"])?;
    for row in &institutions {
        writer.write_record([&row.id, &row.name, &row.created_at])?;
    }
    writer.flush()?;

    let accounts = store.accounts().dump().await?;
    let mut writer = csv::Writer::from_path(dir.join("accounts.csv"))?;
    writer.write_record([
        "id",
        "institution_id",
        "enrollment_id",
        "name",
        "type",
        "subtype",
        "status",
        "currency",
        "last_four",
        "balance_amount",
        "balance_updated_at",
        "last_transaction_date",
        "last_transaction_id",
        "last_synced_at",
    ])?;
    for row in &accounts {
        writer.write_record([
            row.id.as_str(),
            row.institution_id.as_str(),
            row.enrollment_id.as_deref().unwrap_or(""),
            row.name.as_str(),
            row.ty.as_str(),
            row.subtype.as_deref().unwrap_or(""),
            row.status.as_str(),
            row.currency.as_str(),
            row.last_four.as_deref().unwrap_or(""),
            row.balance_amount.as_deref().unwrap_or(""),
            row.balance_updated_at.as_deref().unwrap_or(""),
            row.last_transaction_date.as_deref().unwrap_or(""),
            row.last_transaction_id.as_deref().unwrap_or(""),
            row.last_synced_at.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush()?;

    let txns = store.txns().dump().await?;
    let mut writer = csv::Writer::from_path(dir.join("transactions.csv"))?;
    writer.write_record([
        "id",
        "account_id",
        "date",
        "amount",
        "description",
        "status",
        "type",
        "category",
        "counterparty",
        "running_balance",
        "created_at",
    ])?;
    for row in &txns {
        writer.write_record([
            row.id.as_str(),
            row.account_id.as_str(),
            row.date.as_str(),
            row.amount.as_str(),
            row.description.as_str(),
            row.status.as_str(),
            row.ty.as_deref().unwrap_or(""),
            row.category.as_deref().unwrap_or(""),
            row.counterparty.as_deref().unwrap_or(""),
            row.running_balance.as_deref().unwrap_or(""),
            row.created_at.as_str(),
        ])?;
    }
    writer.flush()?;

    let runs = store.runs().list(-1).await?;
    let mut writer = csv::Writer::from_path(dir.join("sync_runs.csv"))?;
    writer.write_record([
        "id",
        "started_at",
        "completed_at",
        "status",
        "mode",
        "accounts_synced",
        "transactions_fetched",
        "transactions_inserted",
        "transactions_updated",
        "error",
    ])?;
    for run in &runs {
        writer.write_record([
            run.id.to_string(),
            run.started_at.to_string(),
            run.completed_at.map(|c| c.to_string()).unwrap_or_default(),
            run.status.as_str().to_string(),
            run.mode.as_str().to_string(),
            run.stats.accounts_synced.to_string(),
            run.stats.fetched.to_string(),
            run.stats.inserted.to_string(),
            run.stats.updated.to_string(),
            run.error.clone().unwrap_or_default(),
        ])?;
    }
    writer.flush()?;

    write_monthly_spending(store, &dir).await?;
    write_recent(store, &dir).await?;
    write_readme(store, &dir, institutions.len(), txns.len(), runs.len()).await?;

    Ok(dir)
}

#[derive(Default)]
struct MonthlyAgg {
    count: u32,
    net: Decimal,
    volume: Decimal,
}

async fn write_monthly_spending(store: &mut SqliteStore, dir: &Path) -> Result<()> {
    let posted = store.txns().posted_with_account().await?;

    type Key = (i32, u32, String, String, String);
    let mut groups: BTreeMap<Key, MonthlyAgg> = BTreeMap::new();
    for tx in &posted {
        let key = (
            tx.date.year(),
            tx.date.month(),
            tx.account_name.clone(),
            tx.account_type.clone(),
            tx.category.clone().unwrap_or_else(|| "uncategorized".to_string()),
        );
        let agg = groups.entry(key).or_default();
        agg.count += 1;
        agg.net += tx.amount;
        agg.volume += tx.amount.abs();
    }

    let mut rows: Vec<(Key, MonthlyAgg)> = groups.into_iter().collect();
    rows.sort_by(|a, b| {
        (b.0 .0, b.0 .1)
            .cmp(&(a.0 .0, a.0 .1))
            .then(b.1.volume.cmp(&a.1.volume))
    });

    let mut writer = csv::Writer::from_path(dir.join("monthly_spending.csv"))?;
    writer.write_record([
        "year", "month", "account", "type", "category", "count", "net", "volume",
    ])?;
    for ((year, month, account, ty, category), agg) in &rows {
        writer.write_record([
            year.to_string(),
            month.to_string(),
            account.clone(),
            ty.clone(),
            category.clone(),
            agg.count.to_string(),
            agg.net.to_string(),
            agg.volume.to_string(),
        ])?;
    }
    writer.flush()?;

    Ok(())
}

async fn write_recent(store: &mut SqliteStore, dir: &Path) -> Result<()> {
    let recent = store.txns().recent_with_names(RECENT_LIMIT).await?;

    let mut writer = csv::Writer::from_path(dir.join("recent_transactions.csv"))?;
    writer.write_record([
        "date",
        "account",
        "institution",
        "description",
        "amount",
        "category",
        "counterparty",
        "running_balance",
        "status",
    ])?;
    for row in &recent {
        writer.write_record([
            row.date.as_str(),
            row.account_name.as_str(),
            row.institution_name.as_str(),
            row.description.as_str(),
            row.amount.as_str(),
            row.category.as_deref().unwrap_or(""),
            row.counterparty.as_deref().unwrap_or(""),
            row.running_balance.as_deref().unwrap_or(""),
            row.status.as_str(),
        ])?;
    }
    writer.flush()?;

    Ok(())
}

async fn write_readme(
    store: &mut SqliteStore,
    dir: &Path,
    institutions: usize,
    transactions: usize,
    runs: usize,
) -> Result<()> {
    let accounts = store.accounts().open_with_balance().await?;
    let posted = store.txns().posted_with_account().await?;
    let range = store.txns().date_range().await?;

    let mut by_type: BTreeMap<&str, (u32, Decimal)> = BTreeMap::new();
    for account in &accounts {
        let entry = by_type.entry(account.ty.as_str()).or_default();
        entry.0 += 1;
        entry.1 += account.balance;
    }

    let mut by_category: BTreeMap<&str, Decimal> = BTreeMap::new();
    for tx in &posted {
        if tx.amount < Decimal::ZERO {
            if let Some(category) = tx.category.as_deref() {
                *by_category.entry(category).or_default() += tx.amount;
            }
        }
    }
    let mut top: Vec<(&str, Decimal)> = by_category.into_iter().collect();
    top.sort_by(|a, b| a.1.cmp(&b.1));
    top.truncate(5);

    let mut body = String::new();
    writeln!(body, "Export generated {}", Local::now().format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(body)?;
    writeln!(body, "institutions.csv: {institutions} rows")?;
    writeln!(body, "accounts.csv: {} rows", accounts.len())?;
    writeln!(body, "transactions.csv: {transactions} rows")?;
    writeln!(body, "sync_runs.csv: {runs} rows")?;
    writeln!(body)?;
    writeln!(body, "Open accounts by type:")?;
    for (ty, (count, total)) in &by_type {
        writeln!(body, "  {ty}: {count} accounts, {total} total")?;
    }
    if let Some((earliest, latest)) = range {
        writeln!(body)?;
        writeln!(
            body,
            "Posted transactions span {earliest} through {latest} ({} rows)",
            posted.len()
        )?;
    }
    if !top.is_empty() {
        writeln!(body)?;
        writeln!(body, "Top spending categories:")?;
        for (category, net) in &top {
            writeln!(body, "  {category}: {}", net.abs())?;
        }
    }

    std::fs::write(dir.join("README.txt"), body)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    use crate::core::{Account, Institution, Mode, RunStats, Status, Transaction};

    use super::*;

    async fn seeded_store() -> SqliteStore {
        let mut store = SqliteStore::new("sqlite::memory:").await.unwrap();

        let ins = Institution {
            id: "ins_1".to_string(),
            name: "First Bank".to_string(),
        };
        store.institutions().save(&ins).await.unwrap();
        store
            .accounts()
            .save(&Account {
                id: "acc_1".to_string(),
                institution: ins,
                enrollment_id: None,
                name: "Everyday Checking".to_string(),
                ty: "depository".to_string(),
                subtype: Some("checking".to_string()),
                status: "open".to_string(),
                currency: "USD".to_string(),
                last_four: Some("4321".to_string()),
                balance: Some(dec!(1000.00)),
            })
            .await
            .unwrap();

        for (id, day, amount, category) in [
            ("txn_1", 1, dec!(-50.00), Some("groceries")),
            ("txn_2", 2, dec!(-12.50), Some("dining")),
            ("txn_3", 3, dec!(2000.00), None),
        ] {
            store
                .txns()
                .upsert(&Transaction {
                    id: id.to_string(),
                    account_id: "acc_1".to_string(),
                    date: NaiveDate::from_ymd_opt(2023, 7, day).unwrap(),
                    amount,
                    description: "ROW".to_string(),
                    status: Status::Posted,
                    ty: None,
                    category: category.map(str::to_string),
                    counterparty: None,
                    running_balance: None,
                })
                .await
                .unwrap();
        }

        let run_id = store.runs().start(Mode::Full).await.unwrap();
        store
            .runs()
            .complete(run_id, &RunStats::default(), None)
            .await
            .unwrap();

        store
    }

    fn data_rows(path: &Path) -> usize {
        csv::Reader::from_path(path).unwrap().records().count()
    }

    #[tokio::test]
    async fn export_writes_every_table_and_report() {
        let mut store = seeded_store().await;
        let tmp = tempfile::tempdir().unwrap();

        let dir = export_all(&mut store, tmp.path()).await.unwrap();

        assert_eq!(data_rows(&dir.join("institutions.csv")), 1);
        assert_eq!(data_rows(&dir.join("accounts.csv")), 1);
        assert_eq!(data_rows(&dir.join("transactions.csv")), 3);
        assert_eq!(data_rows(&dir.join("sync_runs.csv")), 1);
        assert_eq!(data_rows(&dir.join("recent_transactions.csv")), 3);

        // Three categories land in the same month, so three grouped rows.
        assert_eq!(data_rows(&dir.join("monthly_spending.csv")), 3);

        let readme = std::fs::read_to_string(dir.join("README.txt")).unwrap();
        assert!(readme.contains("transactions.csv: 3 rows"));
        assert!(readme.contains("depository: 1 accounts, 1000.00 total"));
        assert!(readme.contains("groceries: 50.00"));
    }
}
