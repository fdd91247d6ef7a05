use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use clap::ArgMatches;
use rust_decimal::Decimal;

use crate::core::Transaction;
use crate::settings::Settings;
use crate::store::{OpenAccount, SqliteStore};

/// End-of-day balances per account, oldest day first. The first row is the
/// day before the earliest transaction, so the series opens on the balance
/// the accounts held before any recorded activity.
pub struct DailySeries {
    pub account_names: Vec<String>,
    pub rows: Vec<DayRow>,
}

pub struct DayRow {
    pub date: NaiveDate,
    pub total: Decimal,
    pub change: Option<Decimal>,
    pub balances: Vec<Decimal>,
}

/// Replays posted transactions backwards from each account's current balance
/// snapshot. Days with no activity carry the previous balance forward.
///
/// The snapshot is assumed current as of the latest transaction date; a stale
/// snapshot shifts the whole series by the unseen activity.
pub fn reconstruct(accounts: &[OpenAccount], txns: &[Transaction]) -> Option<DailySeries> {
    // Closed accounts are not part of the series; their transactions must
    // not stretch the date range either.
    let ids: HashSet<&str> = accounts.iter().map(|a| a.id.as_str()).collect();
    let txns: Vec<&Transaction> = txns
        .iter()
        .filter(|t| ids.contains(t.account_id.as_str()))
        .collect();

    let latest = txns.iter().map(|t| t.date).max()?;
    let earliest = txns.iter().map(|t| t.date).min()?;

    // (account, date) -> net posted amount for that day
    let mut daily: HashMap<(&str, NaiveDate), Decimal> = HashMap::new();
    for tx in &txns {
        *daily
            .entry((tx.account_id.as_str(), tx.date))
            .or_insert(Decimal::ZERO) += tx.amount;
    }

    let mut balances: Vec<Decimal> = accounts.iter().map(|a| a.balance).collect();
    let mut rows = Vec::new();

    let mut date = latest;
    let floor = earliest - Duration::days(1);
    loop {
        let total: Decimal = balances.iter().sum();
        rows.push(DayRow {
            date,
            total,
            change: None,
            balances: balances.clone(),
        });

        if date == floor {
            break;
        }

        for (i, account) in accounts.iter().enumerate() {
            if let Some(sum) = daily.get(&(account.id.as_str(), date)) {
                balances[i] -= *sum;
            }
        }
        date -= Duration::days(1);
    }

    rows.reverse();
    for i in (1..rows.len()).rev() {
        rows[i].change = Some(rows[i].total - rows[i - 1].total);
    }

    Some(DailySeries {
        account_names: accounts.iter().map(|a| a.name.clone()).collect(),
        rows,
    })
}

pub fn write_csv(series: &DailySeries, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec!["date".to_string(), "total_portfolio".to_string()];
    header.push("portfolio_change".to_string());
    header.extend(series.account_names.iter().cloned());
    writer.write_record(&header)?;

    for row in &series.rows {
        let mut record = vec![
            row.date.format("%Y-%m-%d").to_string(),
            row.total.to_string(),
            row.change.map(|c| c.to_string()).unwrap_or_default(),
        ];
        record.extend(row.balances.iter().map(|b| b.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;

    Ok(())
}

pub(crate) async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()?).await?;

    let accounts = store.accounts().open_with_balance().await?;
    let txns = store.txns().posted().await?;

    let series = match reconstruct(&accounts, &txns) {
        Some(series) => series,
        None => {
            println!("no posted transactions to reconstruct from");
            return Ok(());
        }
    };

    let base = matches
        .value_of("out")
        .unwrap_or(settings.reports_dir.as_str());
    std::fs::create_dir_all(base)?;

    let path = Path::new(base).join(format!(
        "daily_balances_{}.csv",
        crate::export::timestamp()
    ));
    write_csv(&series, &path)?;

    println!(
        "wrote {} days across {} accounts to {}",
        series.rows.len(),
        series.account_names.len(),
        path.display()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use crate::core::Status;

    use super::*;

    fn open_account(id: &str, name: &str, balance: Decimal) -> OpenAccount {
        OpenAccount {
            id: id.to_string(),
            name: name.to_string(),
            ty: "depository".to_string(),
            institution: "First Bank".to_string(),
            balance,
        }
    }

    fn txn(id: &str, account_id: &str, date: (i32, u32, u32), amount: Decimal) -> Transaction {
        Transaction {
            id: id.to_string(),
            account_id: account_id.to_string(),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            amount,
            description: "GROCERIES".to_string(),
            status: Status::Posted,
            ty: None,
            category: None,
            counterparty: None,
            running_balance: None,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn replays_backwards_from_the_snapshot() {
        let accounts = vec![open_account("acc_1", "Checking", dec!(1000.00))];
        let txns = vec![
            txn("txn_1", "acc_1", (2023, 7, 2), dec!(-50.00)),
            txn("txn_2", "acc_1", (2023, 7, 3), dec!(20.00)),
        ];

        let series = reconstruct(&accounts, &txns).unwrap();
        assert_eq!(series.rows.len(), 3);

        assert_eq!(series.rows[0].date, date(2023, 7, 1));
        assert_eq!(series.rows[0].total, dec!(1030.00));
        assert_eq!(series.rows[0].change, None);

        assert_eq!(series.rows[1].date, date(2023, 7, 2));
        assert_eq!(series.rows[1].total, dec!(980.00));
        assert_eq!(series.rows[1].change, Some(dec!(-50.00)));

        assert_eq!(series.rows[2].date, date(2023, 7, 3));
        assert_eq!(series.rows[2].total, dec!(1000.00));
        assert_eq!(series.rows[2].change, Some(dec!(20.00)));
    }

    #[test]
    fn quiet_days_carry_the_balance_forward() {
        let accounts = vec![open_account("acc_1", "Checking", dec!(500.00))];
        let txns = vec![
            txn("txn_1", "acc_1", (2023, 7, 1), dec!(-100.00)),
            txn("txn_2", "acc_1", (2023, 7, 5), dec!(-100.00)),
        ];

        let series = reconstruct(&accounts, &txns).unwrap();
        assert_eq!(series.rows.len(), 6);

        // Quiet days hold at the 7/1 close.
        for row in &series.rows[1..4] {
            assert_eq!(row.total, dec!(600.00));
        }
        assert_eq!(series.rows[4].change, Some(dec!(0.00)));
        assert_eq!(series.rows[5].total, dec!(500.00));
    }

    #[test]
    fn daily_change_equals_the_net_of_that_day() {
        let accounts = vec![
            open_account("acc_1", "Checking", dec!(1000.00)),
            open_account("acc_2", "Savings", dec!(5000.00)),
        ];
        let txns = vec![
            txn("txn_1", "acc_1", (2023, 7, 2), dec!(-50.00)),
            txn("txn_2", "acc_1", (2023, 7, 2), dec!(-25.50)),
            txn("txn_3", "acc_2", (2023, 7, 2), dec!(100.00)),
        ];

        let series = reconstruct(&accounts, &txns).unwrap();
        assert_eq!(series.rows[1].change, Some(dec!(24.50)));
        assert_eq!(series.rows[1].balances, vec![dec!(1000.00), dec!(5000.00)]);
        assert_eq!(series.rows[0].balances, vec![dec!(1075.50), dec!(4900.00)]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(reconstruct(&[], &[]).is_none());
    }

    #[test]
    fn closed_account_activity_does_not_stretch_the_range() {
        let accounts = vec![open_account("acc_1", "Checking", dec!(1000.00))];
        let txns = vec![
            txn("txn_1", "acc_1", (2023, 7, 2), dec!(-50.00)),
            // acc_closed is not in the account set; its old activity is out.
            txn("txn_2", "acc_closed", (2023, 1, 1), dec!(-999.00)),
        ];

        let series = reconstruct(&accounts, &txns).unwrap();
        assert_eq!(series.rows.len(), 2);
        assert_eq!(series.rows[0].date, date(2023, 7, 1));
        assert_eq!(series.rows[0].total, dec!(1050.00));
        assert_eq!(series.rows[1].total, dec!(1000.00));
    }
}
