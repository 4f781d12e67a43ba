//! Futex-backed waiter (Linux, Android).
//!
//! The kernel keys the wait queue on the physical page behind the shared
//! word, so every process that maps the same object sleeps on one queue no
//! matter where the mapping landed in its address space. The `PRIVATE`
//! optimization flag must stay off for exactly that reason.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use rustix::io::Errno;
use rustix::thread::futex;

use super::waiter::{WaitOutcome, Waiter};

pub(crate) struct FutexWaiter {
    word: NonNull<AtomicU32>,
}

// SAFETY: the word lives in a shared mapping with no thread affinity; all
// access goes through the atomic.
unsafe impl Send for FutexWaiter {}
unsafe impl Sync for FutexWaiter {}

impl FutexWaiter {
    /// # Safety
    ///
    /// `word` must point to an `AtomicU32` inside a shared mapping that
    /// outlives the waiter.
    pub(crate) unsafe fn new(word: NonNull<AtomicU32>) -> Self {
        Self { word }
    }

    fn word(&self) -> &AtomicU32 {
        // SAFETY: valid for self's lifetime per the constructor contract.
        unsafe { self.word.as_ref() }
    }
}

/// FUTEX_WAIT takes a relative timeout; clamp rather than overflow the
/// kernel's timespec for absurdly large durations.
fn timespec_from(timeout: Duration) -> futex::Timespec {
    futex::Timespec {
        tv_sec: timeout.as_secs().min(i64::MAX as u64) as i64,
        tv_nsec: timeout.subsec_nanos() as _,
    }
}

impl Waiter for FutexWaiter {
    fn wait(&self, expected: u32, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
        let ts = timeout.map(timespec_from);
        match futex::wait(
            self.word(),
            futex::Flags::empty(),
            expected,
            ts.as_ref(),
        ) {
            Ok(()) => Ok(WaitOutcome::Woken),
            // AGAIN: the word changed before the kernel could sleep.
            // INTR: signal delivery; the caller retries against its
            // deadline.
            Err(err) if err == Errno::AGAIN || err == Errno::INTR => Ok(WaitOutcome::Spurious),
            Err(err) if err == Errno::TIMEDOUT => Ok(WaitOutcome::TimedOut),
            Err(err) => Err(err.into()),
        }
    }

    fn wake(&self, count: u32) -> io::Result<()> {
        futex::wake(self.word(), futex::Flags::empty(), count)
            .map(|_woken| ())
            .map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn wait_on_changed_word_is_spurious() {
        let word = Box::new(AtomicU32::new(7));
        let waiter = unsafe { FutexWaiter::new(NonNull::from(word.as_ref())) };

        // Expected value does not match: must return without blocking.
        let outcome = waiter.wait(3, None).unwrap();
        assert_eq!(outcome, WaitOutcome::Spurious);
        assert_eq!(word.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn wait_times_out_when_nobody_wakes() {
        let word = Box::new(AtomicU32::new(2));
        let waiter = unsafe { FutexWaiter::new(NonNull::from(word.as_ref())) };

        let outcome = waiter
            .wait(2, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn wake_with_no_sleepers_is_a_noop() {
        let word = Box::new(AtomicU32::new(0));
        let waiter = unsafe { FutexWaiter::new(NonNull::from(word.as_ref())) };
        waiter.wake(1).unwrap();
    }
}
