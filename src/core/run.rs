use chrono::NaiveDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Full,
    Incremental,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Full => "full",
            Mode::Incremental => "incremental",
        }
    }
}

impl From<String> for Mode {
    fn from(value: String) -> Mode {
        match value.as_str() {
            "full" => Mode::Full,
            "incremental" => Mode::Incremental,
            _ => unreachable!("unexpected mode value"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl From<String> for RunStatus {
    fn from(value: String) -> RunStatus {
        match value.as_str() {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => unreachable!("unexpected run status value"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub accounts_synced: u32,
    pub fetched: u32,
    pub inserted: u32,
    pub updated: u32,
}

/// One row of the append-only sync audit log.
#[derive(Debug, Clone)]
pub struct SyncRun {
    pub id: i64,
    pub started_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub status: RunStatus,
    pub mode: Mode,
    pub stats: RunStats,
    pub error: Option<String>,
}
