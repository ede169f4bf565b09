//! File-backed persistence of task states.
//!
//! The state file holds one record per task id. Writes go through a
//! temporary file that is renamed over the real one, and every read or
//! write of the file happens while holding an advisory lock on a sibling
//! `.lock` file, so several processes can share one state file.

mod lock;
mod manager;

pub use lock::{lock_path, StateLockGuard};
pub use manager::{StateManager, StateRecord};
