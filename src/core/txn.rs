use chrono::NaiveDate;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Posted,
    Pending,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Posted => "posted",
            Status::Pending => "pending",
        }
    }
}

impl From<String> for Status {
    fn from(value: String) -> Status {
        match value.as_str() {
            "posted" => Status::Posted,
            "pending" => Status::Pending,
            _ => unreachable!("unexpected status value"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub status: Status,
    pub ty: Option<String>,
    pub category: Option<String>,
    pub counterparty: Option<String>,
    pub running_balance: Option<Decimal>,
}
