//! Round-robin rotation over the configured Live API keys.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Hands out keys in order, wrapping around. Shared by reference; the cursor is atomic.
#[derive(Debug, Default)]
pub struct CredentialRotation {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl CredentialRotation {
    /// Blank and duplicate keys are dropped; order of first appearance is kept.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for key in keys {
            let key = key.into().trim().to_string();
            if !key.is_empty() && !unique.contains(&key) {
                unique.push(key);
            }
        }
        Self {
            keys: unique,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Next key in rotation, or `None` when no key is configured.
    pub fn next(&self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        debug!("🔑 Using Live API key #{} of {}", index + 1, self.keys.len());
        self.keys.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
