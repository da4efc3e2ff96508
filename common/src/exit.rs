use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};

pub static EXIT: AtomicBool = AtomicBool::new(false);
pub static TERM: AtomicBool = AtomicBool::new(false);

/// clean exit on signals
pub fn signal_exit_point() -> Result<()> {
    if EXIT.load(Ordering::Relaxed) {
        if TERM.load(Ordering::Relaxed) {
            ::log::warn!("forced target stop");
        }
        bail!("stopping after term signal");
    }

    Ok(())
}

pub fn exit_requested() -> bool {
    EXIT.load(Ordering::Relaxed)
}
