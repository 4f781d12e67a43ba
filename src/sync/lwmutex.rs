//! The lightweight cross-process mutex: Drepper's three-state protocol.
//!
//! The whole mutex is one `AtomicU32` in shared memory plus a [`Waiter`]
//! that can sleep on it:
//!
//! - `0` - unlocked.
//! - `1` - locked, nobody waiting.
//! - `2` - locked, somebody may be sleeping.
//!
//! The fast path is a single compare-and-swap; the kernel is only entered
//! under contention. State `2` is sticky: every contender that reaches the
//! slow path exchanges the word to `2`, so the holder knows on release
//! whether a wakeup is owed. Sleeping always passes `expected = 2` to the
//! waiter, which refuses to sleep if a concurrent unlock already zeroed
//! the word - that check is what closes the lost-wakeup race. One wakeup
//! per release suffices for any number of sleepers: the woken contender
//! either takes the lock or puts the word back to `2`, restoring the
//! release-will-wake invariant for the rest.
//!
//! Acquisition uses `Acquire` ordering, release uses `Release`, so a
//! successful `unlock` happens-before the acquisition that observes the
//! zero. No fairness is promised; the kernel picks who wakes.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use minstant::Instant;

use super::waiter::{WaitOutcome, Waiter};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A mutex over a shared word, parametric over the blocking primitive.
///
/// The concrete wrappers own the mapping the word lives in and construct
/// this on top; it never outlives them.
pub(crate) struct LightMutex<W: Waiter> {
    state: NonNull<AtomicU32>,
    waiter: W,
}

impl<W: Waiter> LightMutex<W> {
    /// # Safety
    ///
    /// `state` must point to an `AtomicU32` inside a shared mapping that
    /// outlives the mutex, and every process operating on that word must
    /// do so through this protocol.
    pub(crate) unsafe fn new(state: NonNull<AtomicU32>, waiter: W) -> Self {
        Self { state, waiter }
    }

    fn state(&self) -> &AtomicU32 {
        // SAFETY: valid for self's lifetime per the constructor contract.
        unsafe { self.state.as_ref() }
    }

    /// Writes the initial unlocked state. Called exactly once, by the
    /// process that created the backing object; openers of an existing
    /// object must not overwrite live state.
    pub(crate) fn init(&self) {
        self.state().store(UNLOCKED, Ordering::Release);
    }

    /// Acquires the lock, sleeping under contention.
    pub(crate) fn lock(&self) {
        let mut c = self.acquire_fast();
        if c == UNLOCKED {
            return;
        }
        if c != CONTENDED {
            c = self.state().swap(CONTENDED, Ordering::Acquire);
        }
        while c != UNLOCKED {
            match self.waiter.wait(CONTENDED, None) {
                Ok(_) => {}
                Err(err) => fatal("wait", &err),
            }
            c = self.state().swap(CONTENDED, Ordering::Acquire);
        }
    }

    /// One attempt to take the lock; never sleeps.
    #[must_use]
    pub(crate) fn try_lock(&self) -> bool {
        self.acquire_fast() == UNLOCKED
    }

    /// Acquires the lock, giving up after `timeout`. Returns true on
    /// acquisition. A zero (or exhausted) timeout on a held mutex returns
    /// false without touching the waiter.
    #[must_use]
    pub(crate) fn lock_timeout(&self, timeout: Duration) -> bool {
        let mut c = self.acquire_fast();
        if c == UNLOCKED {
            return true;
        }
        let start = Instant::now();
        if c != CONTENDED {
            c = self.state().swap(CONTENDED, Ordering::Acquire);
        }
        while c != UNLOCKED {
            let Some(remaining) = timeout.checked_sub(start.elapsed()) else {
                return false;
            };
            if remaining.is_zero() {
                return false;
            }
            match self.waiter.wait(CONTENDED, Some(remaining)) {
                Ok(WaitOutcome::TimedOut) => return false,
                Ok(_) => {}
                Err(err) => fatal("wait", &err),
            }
            c = self.state().swap(CONTENDED, Ordering::Acquire);
        }
        true
    }

    /// Releases the lock, waking one sleeper if the state says anybody
    /// may be parked.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked. The shared word is beyond
    /// repair at that point and hiding it would corrupt every process
    /// attached to the same object.
    pub(crate) fn unlock(&self) {
        let old = self.state().fetch_sub(1, Ordering::Release);
        match old {
            LOCKED => {}
            CONTENDED => {
                self.state().store(UNLOCKED, Ordering::Release);
                if let Err(err) = self.waiter.wake(1) {
                    fatal("wake", &err);
                }
            }
            _ => panic!("unlock of an unlocked cross-process mutex (state was {old})"),
        }
    }

    /// The uncontended acquisition attempt: CAS `0 -> 1`, returning the
    /// observed value.
    fn acquire_fast(&self) -> u32 {
        match self
            .state()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => UNLOCKED,
            Err(observed) => observed,
        }
    }
}

/// A waiter syscall failed in a way that has no protocol-level answer.
/// The shared word may already be inconsistent with what other processes
/// believe, so fail loudly rather than limp on.
#[cold]
fn fatal(op: &str, err: &std::io::Error) -> ! {
    crate::trace::error!(op, %err, "cross-process mutex waiter failed");
    panic!("cross-process mutex {op} failed: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::io;

    /// Scripted waiter: records every call and plays back a list of
    /// prepared outcomes, optionally mutating the word first (to model a
    /// concurrent unlocker).
    struct ScriptWaiter<'a> {
        word: &'a AtomicU32,
        script: RefCell<Vec<ScriptStep>>,
        waits: Cell<usize>,
        wakes: Cell<u32>,
    }

    enum ScriptStep {
        /// Store this value into the word, then report Woken.
        ReleaseAndWake(u32),
        Outcome(WaitOutcome),
    }

    impl<'a> ScriptWaiter<'a> {
        fn new(word: &'a AtomicU32, script: Vec<ScriptStep>) -> Self {
            Self {
                word,
                script: RefCell::new(script),
                waits: Cell::new(0),
                wakes: Cell::new(0),
            }
        }
    }

    impl Waiter for ScriptWaiter<'_> {
        fn wait(&self, expected: u32, _timeout: Option<Duration>) -> io::Result<WaitOutcome> {
            self.waits.set(self.waits.get() + 1);
            if self.word.load(Ordering::Acquire) != expected {
                return Ok(WaitOutcome::Spurious);
            }
            match self.script.borrow_mut().remove(0) {
                ScriptStep::ReleaseAndWake(value) => {
                    self.word.store(value, Ordering::Release);
                    Ok(WaitOutcome::Woken)
                }
                ScriptStep::Outcome(outcome) => Ok(outcome),
            }
        }

        fn wake(&self, count: u32) -> io::Result<()> {
            self.wakes.set(self.wakes.get() + count);
            Ok(())
        }
    }

    fn mutex_over<'a>(
        word: &'a AtomicU32,
        script: Vec<ScriptStep>,
    ) -> LightMutex<ScriptWaiter<'a>> {
        let waiter = ScriptWaiter::new(word, script);
        unsafe { LightMutex::new(NonNull::from(word), waiter) }
    }

    #[test]
    fn uncontended_lock_never_calls_the_waiter() {
        let word = AtomicU32::new(0);
        let m = mutex_over(&word, vec![]);

        m.lock();
        assert_eq!(word.load(Ordering::Relaxed), 1);
        assert_eq!(m.waiter.waits.get(), 0);

        m.unlock();
        assert_eq!(word.load(Ordering::Relaxed), 0);
        assert_eq!(m.waiter.wakes.get(), 0, "no sleeper, no wakeup");
    }

    #[test]
    fn try_lock_succeeds_once_then_fails() {
        let word = AtomicU32::new(0);
        let m = mutex_over(&word, vec![]);

        assert!(m.try_lock());
        assert!(!m.try_lock());
        assert_eq!(word.load(Ordering::Relaxed), 1, "failed try_lock left state alone");

        m.unlock();
        assert!(m.try_lock());
        m.unlock();
    }

    #[test]
    fn contended_lock_upgrades_to_sticky_state() {
        // Holder present (state 1); the scripted holder releases during
        // our first sleep.
        let word = AtomicU32::new(1);
        let m = mutex_over(&word, vec![ScriptStep::ReleaseAndWake(0)]);

        m.lock();
        // We re-exchanged to 2 after the wakeup: we hold the lock and the
        // word stays conservative about other sleepers.
        assert_eq!(word.load(Ordering::Relaxed), 2);
        assert_eq!(m.waiter.waits.get(), 1);

        m.unlock();
        assert_eq!(word.load(Ordering::Relaxed), 0);
        assert_eq!(m.waiter.wakes.get(), 1, "contended release owes one wakeup");
    }

    #[test]
    fn contended_unlock_wakes_exactly_one() {
        let word = AtomicU32::new(0);
        let m = mutex_over(&word, vec![]);

        m.lock();
        // A contender arrives and parks: it would exchange the word to 2.
        word.store(2, Ordering::Release);

        m.unlock();
        assert_eq!(word.load(Ordering::Relaxed), 0);
        assert_eq!(m.waiter.wakes.get(), 1);
    }

    #[test]
    fn zero_timeout_on_held_mutex_fails_without_waiting() {
        let word = AtomicU32::new(1);
        let m = mutex_over(&word, vec![]);

        assert!(!m.lock_timeout(Duration::ZERO));
        assert_eq!(m.waiter.waits.get(), 0);
    }

    #[test]
    fn zero_timeout_on_free_mutex_still_acquires() {
        let word = AtomicU32::new(0);
        let m = mutex_over(&word, vec![]);

        assert!(m.lock_timeout(Duration::ZERO));
        m.unlock();
    }

    #[test]
    fn timed_out_wait_fails_the_lock() {
        let word = AtomicU32::new(1);
        let m = mutex_over(&word, vec![ScriptStep::Outcome(WaitOutcome::TimedOut)]);

        assert!(!m.lock_timeout(Duration::from_millis(5)));
        assert_eq!(m.waiter.waits.get(), 1);
        // We left the word contended; the holder will wake someone on
        // release even though we gave up. Harmless by design.
        assert_eq!(word.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn spurious_wakeups_retry_until_acquired() {
        let word = AtomicU32::new(1);
        let m = mutex_over(
            &word,
            vec![
                ScriptStep::Outcome(WaitOutcome::Spurious),
                ScriptStep::ReleaseAndWake(0),
            ],
        );

        m.lock();
        assert_eq!(m.waiter.waits.get(), 2);
        m.unlock();
    }

    #[test]
    #[should_panic(expected = "unlock of an unlocked cross-process mutex")]
    fn unlock_of_unlocked_mutex_panics() {
        let word = AtomicU32::new(0);
        let m = mutex_over(&word, vec![]);
        m.unlock();
    }

    #[test]
    fn creator_init_writes_zero() {
        let word = AtomicU32::new(0xDEAD_BEEF);
        let m = mutex_over(&word, vec![]);
        m.init();
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }
}
