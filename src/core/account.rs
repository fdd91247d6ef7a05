use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Institution {
    pub id: String,
    pub name: String,
}

/// Canonical account representation, independent of the upstream wire format.
/// The balance is the provider's most recent snapshot at sync time.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub institution: Institution,
    pub enrollment_id: Option<String>,
    pub name: String,
    pub ty: String,
    pub subtype: Option<String>,
    pub status: String,
    pub currency: String,
    pub last_four: Option<String>,
    pub balance: Option<Decimal>,
}
