//! Session identifier type.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global counter for session ID generation.
static COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a shell session.
///
/// Displayed as `shell-XXXXXXXX`. Each ID also carries a salt that makes the
/// completion markers of its commands unguessable for the commands
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    seq: u64,
    salt: u64,
}

impl SessionId {
    /// Create a new unique session ID.
    pub fn new() -> Self {
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut hasher = DefaultHasher::new();
        seq.hash(&mut hasher);
        std::process::id().hash(&mut hasher);
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .hash(&mut hasher);
        Self {
            seq,
            salt: hasher.finish(),
        }
    }

    /// Get the sequence number.
    pub fn as_u64(&self) -> u64 {
        self.seq
    }

    /// Marker token for the `n`th command of this session.
    pub(crate) fn marker_token(&self, n: u64) -> String {
        format!("__UNISHELL_{:x}_{:016x}_{}__", self.seq, self.salt, n)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shell-{:08x}", self.seq)
    }
}
