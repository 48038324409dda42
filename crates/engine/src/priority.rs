//! Pump thread priority.

/// Set the niceness of the calling thread. Returns whether the OS accepted it.
#[cfg(target_os = "linux")]
pub(crate) fn apply_nice(nice: i32) -> bool {
    // A thread id addresses a single thread, not the whole process.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, nice) };
    if rc != 0 {
        tracing::warn!(
            nice,
            error = %std::io::Error::last_os_error(),
            "Cannot set pump thread priority"
        );
        return false;
    }
    tracing::debug!(nice, "Pump thread priority set");
    true
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn apply_nice(nice: i32) -> bool {
    tracing::debug!(nice, "Pump thread priority is only applied on Linux");
    false
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::thread;

    fn current_nice() -> i32 {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
        unsafe { libc::getpriority(libc::PRIO_PROCESS, tid) }
    }

    #[test]
    fn test_lowering_priority_applies_to_calling_thread_only() {
        let before = current_nice();
        let target = (before + 1).min(19);
        let (applied, after) = thread::spawn(move || (apply_nice(target), current_nice()))
            .join()
            .unwrap();
        assert!(applied);
        assert_eq!(after, target);
        assert_eq!(current_nice(), before);
    }
}
