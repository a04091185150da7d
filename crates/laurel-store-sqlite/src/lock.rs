//! Per-user advisory locks.
//!
//! Maps a user id (and optionally a scoping id such as a lesson id)
//! deterministically to a pair of `u32` keys via SHA-256, then try-acquires
//! an exclusive in-process lock on that key pair. Acquisition never blocks:
//! it succeeds immediately or fails immediately, which bounds worst-case
//! latency and avoids lock convoys when one user double-submits.
//!
//! The guard is held across exactly one store transaction and released on
//! drop (commit or rollback), never across a response to the caller.

use std::{
  collections::HashSet,
  sync::{Arc, Mutex},
};

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The two-key form mirrors classic advisory-lock primitives.
pub type LockKey = (u32, u32);

/// Stable hash of `user_id` (and the optional scoping id) to a key pair.
pub fn lock_key(user_id: Uuid, reference_id: Option<Uuid>) -> LockKey {
  let mut hasher = Sha256::new();
  hasher.update(user_id.as_bytes());
  if let Some(reference_id) = reference_id {
    hasher.update(reference_id.as_bytes());
  }
  let digest = hasher.finalize();

  let a = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
  let b = u32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]);
  (a, b)
}

/// A keyed try-lock map. Cloning is cheap; clones share the held set.
#[derive(Clone, Default)]
pub struct LockManager {
  held: Arc<Mutex<HashSet<LockKey>>>,
}

impl LockManager {
  pub fn new() -> Self { Self::default() }

  /// Non-blocking acquisition. `None` means the key pair is already held
  /// and the caller should fail fast with `lock_not_acquired`.
  pub fn try_acquire(
    &self,
    user_id: Uuid,
    reference_id: Option<Uuid>,
  ) -> Option<LockGuard> {
    let key = lock_key(user_id, reference_id);
    let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
    if !held.insert(key) {
      return None;
    }
    Some(LockGuard { held: Arc::clone(&self.held), key })
  }
}

/// Releases the key pair on drop.
pub struct LockGuard {
  held: Arc<Mutex<HashSet<LockKey>>>,
  key:  LockKey,
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
    held.remove(&self.key);
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
