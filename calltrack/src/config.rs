//! Engine configuration constants
//!
//! Central location for the constants, limits and fixed strings used
//! throughout the engine.

// ===== Projects =====

/// Name given to the project synthesized when the store holds none.
pub const DEFAULT_PROJECT_NAME: &str = "Default Project";

/// Maximum length of a project name.
pub const MAX_PROJECT_NAME_LENGTH: usize = 120;

// ===== Records =====

/// Prefix of identifiers assigned to optimistic entries before the store
/// confirms them. Store-assigned ids never carry it.
pub const TEMP_ID_PREFIX: &str = "local-";

/// Follow-up count given to new records that do not specify one.
pub const DEFAULT_FOLLOW_UP_COUNT: u32 = 1;

// ===== Reminders =====

/// Title of the platform notification raised for a due callback.
pub const REMINDER_NOTIFICATION_TITLE: &str = "Call Reminder";

// ===== Import =====

/// Spreadsheet serial dates count days from this date (UTC midnight).
pub const SPREADSHEET_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// Milliseconds in one spreadsheet day.
pub const MS_PER_DAY: f64 = 86_400_000.0;

/// Upper bound on rows accepted from a single import file.
pub const MAX_IMPORT_ROWS: usize = 50_000;

// ===== Storage =====

/// File name of the SQLite database inside the data directory.
pub const DATABASE_FILE_NAME: &str = "calltrack.db";

/// Connections in the store pool.
pub const DB_MAX_CONNECTIONS: u32 = 5;

/// Seconds a connection waits on a locked database before failing.
pub const DB_BUSY_TIMEOUT_SECS: u64 = 5;

/// File name of the local preferences file inside the data directory.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment variable naming the data directory for the binary.
pub const DATA_DIR_ENV: &str = "CALLTRACK_DATA_DIR";

/// Data directory used when `DATA_DIR_ENV` is unset.
pub const DEFAULT_DATA_DIR: &str = "./calltrack-data";
