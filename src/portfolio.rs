use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use clap::ArgMatches;
use rust_decimal::Decimal;
use tracing::info;

use crate::history;
use crate::marketdata::{PriceSource, YahooProvider};
use crate::settings::Settings;
use crate::store::SqliteStore;

/// Cash that left a bank account for the brokerage, as a positive amount.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub date: NaiveDate,
    pub amount: Decimal,
}

/// Trading can settle a few days after the cash leaves the bank.
const SETTLEMENT_WINDOW_DAYS: i64 = 5;

/// Values a buy-and-hold position as if every transfer had bought the index
/// at the first close on or after the transfer date. Returns the position's
/// value per trading day, starting at the first purchase.
pub fn simulate(
    transfers: &[Transfer],
    closes: &BTreeMap<NaiveDate, Decimal>,
) -> BTreeMap<NaiveDate, Decimal> {
    let mut buys: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
    for transfer in transfers {
        let window = transfer.date..=transfer.date + Duration::days(SETTLEMENT_WINDOW_DAYS);
        if let Some((date, price)) = closes.range(window).next() {
            *buys.entry(*date).or_insert(Decimal::ZERO) += transfer.amount / price;
        }
    }

    let mut shares = Decimal::ZERO;
    let mut values = BTreeMap::new();
    for (date, price) in closes {
        if let Some(bought) = buys.get(date) {
            shares += *bought;
        }
        if !shares.is_zero() {
            values.insert(*date, (shares * price).round_dp(2));
        }
    }

    values
}

/// Position value as of `day`: the most recent trading day at or before it,
/// zero before the first purchase.
pub fn carried(values: &BTreeMap<NaiveDate, Decimal>, day: NaiveDate) -> Decimal {
    values
        .range(..=day)
        .next_back()
        .map(|(_, v)| *v)
        .unwrap_or(Decimal::ZERO)
}

pub(crate) async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()?).await?;

    let symbol = matches.value_of("symbol").unwrap_or("SPY");
    let pattern = matches.value_of("pattern").unwrap_or("robinhood");

    let accounts = store.accounts().open_with_balance().await?;
    let txns = store.txns().posted().await?;
    let series = match history::reconstruct(&accounts, &txns) {
        Some(series) => series,
        None => {
            println!("no posted transactions to reconstruct from");
            return Ok(());
        }
    };

    let transfers: Vec<Transfer> = store
        .txns()
        .transfers_matching(pattern)
        .await?
        .into_iter()
        .map(|t| Transfer {
            date: t.date,
            amount: -t.amount,
        })
        .collect();

    let values = if let Some(first) = transfers.first() {
        info!(
            count = transfers.len(),
            symbol, "pricing transfers against the index"
        );
        let provider = YahooProvider::new()?;
        let end = series.rows.last().map(|r| r.date).unwrap_or(first.date);
        let closes = provider
            .daily_closes(symbol, first.date - Duration::days(30), end)
            .await?;

        simulate(&transfers, &closes)
    } else {
        println!("no outgoing transfers match '{pattern}'; index column will be zero");
        BTreeMap::new()
    };

    let base = matches
        .value_of("out")
        .unwrap_or(settings.reports_dir.as_str());
    std::fs::create_dir_all(base)?;
    let path = Path::new(base).join(format!(
        "complete_portfolio_{}.csv",
        crate::export::timestamp()
    ));

    write_csv(&series, &values, &path)?;

    println!(
        "wrote {} days (banks plus simulated {}) to {}",
        series.rows.len(),
        symbol,
        path.display()
    );

    Ok(())
}

fn write_csv(
    series: &history::DailySeries,
    values: &BTreeMap<NaiveDate, Decimal>,
    path: &Path,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec![
        "date".to_string(),
        "total_portfolio".to_string(),
        "portfolio_change".to_string(),
        "index_simulation".to_string(),
    ];
    header.extend(series.account_names.iter().cloned());
    writer.write_record(&header)?;

    let mut previous: Option<Decimal> = None;
    for row in &series.rows {
        let position = carried(values, row.date);
        let total = row.total + position;
        let change = previous.map(|p| (total - p).to_string()).unwrap_or_default();
        previous = Some(total);

        let mut record = vec![
            row.date.format("%Y-%m-%d").to_string(),
            total.to_string(),
            change,
            position.to_string(),
        ];
        record.extend(row.balances.iter().map(|b| b.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn closes(entries: &[((i32, u32, u32), Decimal)]) -> BTreeMap<NaiveDate, Decimal> {
        entries
            .iter()
            .map(|((y, m, d), price)| (date(*y, *m, *d), *price))
            .collect()
    }

    #[test]
    fn transfers_buy_at_the_next_close() {
        // Saturday transfer settles at Monday's close.
        let closes = closes(&[
            ((2023, 7, 14), dec!(100.00)),
            ((2023, 7, 17), dec!(110.00)),
            ((2023, 7, 18), dec!(121.00)),
        ]);
        let transfers = vec![Transfer {
            date: date(2023, 7, 15),
            amount: dec!(1100.00),
        }];

        let values = simulate(&transfers, &closes);
        assert_eq!(values.get(&date(2023, 7, 14)), None);
        assert_eq!(values.get(&date(2023, 7, 17)), Some(&dec!(1100.00)));
        assert_eq!(values.get(&date(2023, 7, 18)), Some(&dec!(1210.00)));
    }

    #[test]
    fn later_transfers_add_to_the_position() {
        let closes = closes(&[
            ((2023, 7, 3), dec!(100.00)),
            ((2023, 7, 10), dec!(200.00)),
            ((2023, 7, 17), dec!(100.00)),
        ]);
        let transfers = vec![
            Transfer {
                date: date(2023, 7, 3),
                amount: dec!(1000.00),
            },
            Transfer {
                date: date(2023, 7, 10),
                amount: dec!(1000.00),
            },
        ];

        let values = simulate(&transfers, &closes);
        // 10 shares, then 5 more at the doubled price.
        assert_eq!(values.get(&date(2023, 7, 10)), Some(&dec!(3000.00)));
        assert_eq!(values.get(&date(2023, 7, 17)), Some(&dec!(1500.00)));
    }

    #[test]
    fn transfers_outside_the_settlement_window_are_dropped() {
        let closes = closes(&[((2023, 7, 31), dec!(100.00))]);
        let transfers = vec![Transfer {
            date: date(2023, 7, 1),
            amount: dec!(1000.00),
        }];

        assert!(simulate(&transfers, &closes).is_empty());
    }

    #[test]
    fn carried_holds_over_weekends() {
        let values = closes(&[
            ((2023, 7, 14), dec!(1000.00)),
            ((2023, 7, 17), dec!(1010.00)),
        ]);

        assert_eq!(carried(&values, date(2023, 7, 13)), Decimal::ZERO);
        assert_eq!(carried(&values, date(2023, 7, 14)), dec!(1000.00));
        assert_eq!(carried(&values, date(2023, 7, 16)), dec!(1000.00));
        assert_eq!(carried(&values, date(2023, 7, 17)), dec!(1010.00));
    }
}
