use std::time::Duration;

/** The reaper advances the timeout clock every REAPER_INTERVAL. */
pub static REAPER_INTERVAL: Duration = Duration::from_millis(200);

/** Purge watch lists once the registered-vs-pending gap exceeds this many operations. */
pub const DEFAULT_PURGE_INTERVAL: usize = 1000;

pub type DelayMs = u64; // operation delay / deadline type, milliseconds on the timer's clock
