//! Cross-process wake primitive over a 32-bit counter in shared memory.
//!
//! On Linux this is a shared (non-private) futex, so waiters and wakers may
//! live in different processes mapping the same segment. Other targets
//! fall back to short sleeps.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a single [`wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken (or the word already differed from `expected`).
    Woken,
    /// The timeout elapsed.
    TimedOut,
}

/// Block while `word == expected`, for at most `timeout` (forever if `None`).
///
/// Spurious wakeups are possible; callers re-check their condition.
#[cfg(target_os = "linux")]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: `word` points into a live mapping for the duration of the
    // call; FUTEX_WAIT only reads the word and sleeps.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == 0 {
        return WaitOutcome::Woken;
    }
    match nix::errno::Errno::last() {
        nix::errno::Errno::ETIMEDOUT => WaitOutcome::TimedOut,
        // EAGAIN: value already changed. EINTR: signal; caller re-checks.
        _ => WaitOutcome::Woken,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let start = Instant::now();
    loop {
        if word.load(Ordering::Acquire) != expected {
            return WaitOutcome::Woken;
        }
        if let Some(t) = timeout {
            if start.elapsed() >= t {
                return WaitOutcome::TimedOut;
            }
        }
        std::thread::sleep(Duration::from_micros(100));
    }
}

/// Wake every waiter blocked on `word`.
#[cfg(target_os = "linux")]
pub fn wake_all(word: &AtomicU32) {
    // SAFETY: FUTEX_WAKE does not access the word's memory beyond its address.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wake_all(_word: &AtomicU32) {}

/// Wait until `word` no longer reads `seen`, or `deadline` passes.
///
/// Each sleep is capped at `slice` so callers that also poll process
/// liveness get control back regularly. Returns the new value, or `None`
/// on deadline.
pub fn wait_for_change(
    word: &AtomicU32,
    seen: u32,
    deadline: Option<Instant>,
    slice: Duration,
) -> Option<u32> {
    loop {
        let current = word.load(Ordering::Acquire);
        if current != seen {
            return Some(current);
        }
        let nap = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return None;
                }
                (d - now).min(slice)
            }
            None => slice,
        };
        wait(word, seen, Some(nap));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_immediately_on_mismatch() {
        let word = AtomicU32::new(5);
        let start = Instant::now();
        wait(&word, 4, Some(Duration::from_secs(2)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(0);
        let outcome = wait(&word, 0, Some(Duration::from_millis(20)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let w = Arc::clone(&word);
        let waiter = thread::spawn(move || {
            wait_for_change(&w, 0, Some(Instant::now() + Duration::from_secs(5)), Duration::from_secs(5))
        });
        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake_all(&word);
        assert_eq!(waiter.join().unwrap(), Some(1));
    }

    #[test]
    fn wait_for_change_honours_deadline() {
        let word = AtomicU32::new(9);
        let deadline = Instant::now() + Duration::from_millis(30);
        assert_eq!(
            wait_for_change(&word, 9, Some(deadline), Duration::from_millis(5)),
            None
        );
        assert!(Instant::now() >= deadline);
    }
}
