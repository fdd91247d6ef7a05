mod account;
mod run;
mod txn;

pub use account::{Account, Institution};
pub use run::{Mode, RunStats, RunStatus, SyncRun};
pub use txn::{Status, Transaction};
