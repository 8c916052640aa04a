//! Correlation tokens for commands.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide counter; makes tokens unique within this process.
static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a new correlation token.
///
/// The hex prefix spreads tokens from different processes apart; the
/// counter suffix guarantees no two calls in this process collide.
pub fn next_identifier() -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    h.write_u64(n);
    format!("{:012x}-{n}", h.finish() & 0xffff_ffff_ffff)
}
