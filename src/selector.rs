use anyhow::{Result, bail};
use std::sync::{Mutex, PoisonError};

/// Round-robin cursor over the configured backend ports.
///
/// Each call to [`TargetSelector::next_target`] hands out the port under the
/// cursor and advances it, wrapping at the end of the list. Calls from
/// concurrent handlers are serialized, so any run of `N` consecutive calls
/// (in global order) covers every port exactly once.
#[derive(Debug)]
pub struct TargetSelector {
    ports: Vec<u16>,
    cursor: Mutex<usize>,
}

impl TargetSelector {
    pub fn new(ports: Vec<u16>) -> Result<Self> {
        if ports.is_empty() {
            bail!("Target selector needs at least one port");
        }
        Ok(Self {
            ports,
            cursor: Mutex::new(0),
        })
    }

    #[must_use]
    pub fn next_target(&self) -> u16 {
        // A handler that panicked elsewhere cannot leave the cursor out of range.
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let port = self.ports[*cursor];
        *cursor = (*cursor + 1) % self.ports.len();
        port
    }

    #[must_use]
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}
