use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

/// seconds since the unix epoch
pub fn epoch() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time before unix epoch")
        .map(|duration| duration.as_secs())
}
