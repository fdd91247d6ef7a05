use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Daily close prices for a symbol over a date range, keyed by trading day.
/// Non-trading days are simply absent.
#[async_trait]
pub trait PriceSource {
    async fn daily_closes(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, Decimal>>;
}

pub struct YahooProvider {
    client: reqwest::Client,
}

impl YahooProvider {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("bursar/0.1")
            .build()?;

        Ok(Self { client })
    }
}

#[derive(Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
}

#[derive(Deserialize)]
struct ChartResult {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Deserialize)]
struct Indicators {
    quote: Vec<QuoteBlock>,
}

#[derive(Deserialize)]
struct QuoteBlock {
    close: Option<Vec<Option<f64>>>,
}

#[async_trait]
impl PriceSource for YahooProvider {
    async fn daily_closes(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, Decimal>> {
        let period1 = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
        let period2 = (end + chrono::Duration::days(1))
            .and_time(chrono::NaiveTime::MIN)
            .and_utc()
            .timestamp();

        let url = format!("https://query1.finance.yahoo.com/v8/finance/chart/{symbol}");
        let response: ChartResponse = self
            .client
            .get(&url)
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", "1d".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let result = response
            .chart
            .result
            .and_then(|mut r| (!r.is_empty()).then(|| r.remove(0)))
            .ok_or_else(|| anyhow!("no chart data for {symbol}"))?;

        let timestamps = result.timestamp.unwrap_or_default();
        let closes = result
            .indicators
            .quote
            .into_iter()
            .next()
            .and_then(|q| q.close)
            .unwrap_or_default();

        let mut out = BTreeMap::new();
        for (ts, close) in timestamps.iter().zip(closes) {
            let close = match close {
                Some(c) => c,
                None => continue,
            };
            let date = match DateTime::from_timestamp(*ts, 0) {
                Some(dt) => dt.date_naive(),
                None => continue,
            };
            if let Some(price) = Decimal::from_f64_retain(close) {
                out.insert(date, price.round_dp(4));
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn chart_payload_parses_into_dated_closes() {
        let body = r#"{
            "chart": {
                "result": [{
                    "timestamp": [1689292800, 1689379200],
                    "indicators": {
                        "quote": [{"close": [449.28, null]}]
                    }
                }],
                "error": null
            }
        }"#;

        let response: ChartResponse = serde_json::from_str(body).unwrap();
        let result = &response.chart.result.as_ref().unwrap()[0];
        assert_eq!(result.timestamp.as_ref().unwrap().len(), 2);

        let closes = result.indicators.quote[0].close.as_ref().unwrap();
        assert_eq!(closes[0], Some(449.28));
        assert_eq!(closes[1], None);

        let date = DateTime::from_timestamp(1689292800, 0).unwrap().date_naive();
        assert_eq!(date, NaiveDate::from_ymd_opt(2023, 7, 14).unwrap());

        let price = Decimal::from_f64_retain(449.28).unwrap().round_dp(4);
        assert_eq!(price, dec!(449.2800));
    }

    #[test]
    fn empty_result_is_an_error() {
        let body = r#"{"chart": {"result": null, "error": {"code": "Not Found"}}}"#;
        let response: ChartResponse = serde_json::from_str(body).unwrap();
        assert!(response.chart.result.is_none());
    }
}
