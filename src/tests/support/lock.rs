// The orchestrator's current-config pointer is process-global, so every
// test that loads a config serializes on this lock.

use once_cell::sync::Lazy;
use tokio::sync::{Mutex, MutexGuard};

static GLOBAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub async fn acquire() -> MutexGuard<'static, ()> {
    GLOBAL.lock().await
}
