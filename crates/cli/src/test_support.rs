use std::sync::{Mutex, MutexGuard, OnceLock};

fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    // A test that panicked while holding the lock leaves the environment usable.
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serializes environment and working-directory mutation across tests.
pub(crate) fn with_locked_env<R>(run: impl FnOnce() -> R) -> R {
    let _guard = env_lock();
    run()
}

/// Only call inside `with_locked_env`.
pub(crate) fn set_env_var(key: &str, value: &str) {
    // SAFETY: callers hold the env lock, so no other test thread touches the environment.
    unsafe {
        std::env::set_var(key, value);
    }
}

/// Only call inside `with_locked_env`.
pub(crate) fn remove_env_var(key: &str) {
    // SAFETY: callers hold the env lock, so no other test thread touches the environment.
    unsafe {
        std::env::remove_var(key);
    }
}
