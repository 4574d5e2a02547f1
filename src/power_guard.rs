//! Platform sleep-prevention hook: a ref-counted guard held while any job
//! is running, released once the last one terminates.
//!
//! Windows behavior uses `SetThreadExecutionState(ES_CONTINUOUS |
//! ES_SYSTEM_REQUIRED)`, deliberately without `ES_DISPLAY_REQUIRED` so the
//! display may still turn off. Other platforms are a no-op.

use std::sync::atomic::{AtomicU32, Ordering};

/// Global ref-count of jobs currently holding the sleep-prevention hook.
static ACTIVE_JOBS: AtomicU32 = AtomicU32::new(0);

/// RAII handle: acquire when a job starts running, drop when it stops
/// (success, failure, or cancellation all count as "stopped").
pub struct PowerGuard {
    _private: (),
}

impl PowerGuard {
    /// Increments the active-job count; enables the platform hook on the
    /// 0 -> 1 transition.
    pub fn acquire() -> Self {
        if ACTIVE_JOBS.fetch_add(1, Ordering::SeqCst) == 0 {
            platform::enable_prevent_sleep();
        }
        Self { _private: () }
    }
}

impl Drop for PowerGuard {
    fn drop(&mut self) {
        if ACTIVE_JOBS.fetch_sub(1, Ordering::SeqCst) == 1 {
            platform::disable_prevent_sleep();
        }
    }
}

#[cfg(windows)]
mod platform {
    use windows::Win32::System::Threading::{
        SetThreadExecutionState, ES_CONTINUOUS, ES_SYSTEM_REQUIRED,
    };

    pub fn enable_prevent_sleep() {
        // SAFETY: SetThreadExecutionState has no preconditions beyond a
        // valid flag combination; ES_CONTINUOUS|ES_SYSTEM_REQUIRED is.
        unsafe {
            SetThreadExecutionState(ES_CONTINUOUS | ES_SYSTEM_REQUIRED);
        }
        tracing::info!("prevent-sleep enabled (display may still turn off)");
    }

    pub fn disable_prevent_sleep() {
        unsafe {
            SetThreadExecutionState(ES_CONTINUOUS);
        }
        tracing::info!("prevent-sleep disabled");
    }
}

#[cfg(not(windows))]
mod platform {
    pub fn enable_prevent_sleep() {
        tracing::info!("prevent-sleep is not supported on this platform");
    }

    pub fn disable_prevent_sleep() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_guards_keep_hook_active_until_all_dropped() {
        assert_eq!(ACTIVE_JOBS.load(Ordering::SeqCst), 0);
        let first = PowerGuard::acquire();
        let second = PowerGuard::acquire();
        assert_eq!(ACTIVE_JOBS.load(Ordering::SeqCst), 2);
        drop(first);
        assert_eq!(ACTIVE_JOBS.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(ACTIVE_JOBS.load(Ordering::SeqCst), 0);
    }
}
