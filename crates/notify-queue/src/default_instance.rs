//! Process-wide shared instance, grounded on the teacher's leadership-cell
//! pattern (`fc-standby`): a lazily-initialized cell holding a swappable
//! `Option<Arc<..>>` so tests can reset it between runs instead of relying on
//! module-initialization order.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::{NotificationQueue, NotifyConfig};

static CELL: OnceLock<RwLock<Option<Arc<NotificationQueue>>>> = OnceLock::new();

fn cell() -> &'static RwLock<Option<Arc<NotificationQueue>>> {
    CELL.get_or_init(|| RwLock::new(None))
}

/// Return the process-wide default queue, constructing it with
/// `NotifyConfig::default()` on first access.
pub fn default_instance() -> Arc<NotificationQueue> {
    if let Some(existing) = cell().read().clone() {
        return existing;
    }
    let mut guard = cell().write();
    if let Some(existing) = guard.clone() {
        return existing;
    }
    let queue = NotificationQueue::new(NotifyConfig::default()).expect("default NotifyConfig is always valid");
    *guard = Some(queue.clone());
    queue
}

/// Clear the default instance so the next `default_instance()` call builds a
/// fresh one. Intended for test isolation between cases that rely on the
/// singleton.
pub fn reset_default_instance_for_test() {
    *cell().write() = None;
}
