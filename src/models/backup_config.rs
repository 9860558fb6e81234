use super::DumpOptions;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

/// Per-database automatic backup settings, stored as JSON on the database config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomaticBackupConfig {
    #[serde(default)]
    pub enabled: bool,
    pub frequency: Frequency,
    /// Earliest hour of the day (0-23) at which a backup may start.
    pub hour: Option<u32>,
    /// Earliest day of the week, Monday = 1 ... Sunday = 7.
    pub day_of_week: Option<u32>,
    /// Earliest day of the month (1-31). Clamped to the month's last day.
    pub day_of_month: Option<u32>,
    pub keep_last: Option<u32>,
    pub err: Option<String>,
    /// Cloud credential; local disk when unset.
    pub credential_id: Option<i64>,
    pub dump_options: DumpOptions,
}

impl AutomaticBackupConfig {
    pub fn is_local(&self) -> bool {
        self.credential_id.is_none()
    }
}
