//! Thin platform primitives shared by the rest of the crate.
//!
//! These wrap `parking_lot` rather than `std::sync` directly, matching the approach
//! `disruptor::wait_strategy` takes for its blocking wait strategy: non-poisoning locks,
//! timed waits, and a condvar that can be broadcast to wake every blocked thread at once.

use parking_lot::{ Condvar, Mutex };
use std::thread::JoinHandle;
use std::time::{ Duration, Instant };

/// A 32-bit bitset that threads can wait on with an AND or OR mask.
///
/// Modeled on the original's `event_flag`: `send` ORs bits in and wakes every waiter,
/// `wait_any`/`wait_all` block (with an optional timeout) until the mask matches,
/// optionally clearing the matched bits before returning.
pub struct EventFlag {
    state: Mutex<u32>,
    condition: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Return as soon as any bit in the mask is set.
    Any,
    /// Return only once every bit in the mask is set.
    All,
}

impl EventFlag {
    pub fn new() -> Self {
        Self { state: Mutex::new(0), condition: Condvar::new() }
    }

    /// OR `bits` into the flag and wake every waiter.
    pub fn send(&self, bits: u32) {
        let mut state = self.state.lock();
        *state |= bits;
        self.condition.notify_all();
    }

    /// AND `bits` out of the flag. Does not wake anyone (clearing bits can't satisfy a wait).
    pub fn clear(&self, bits: u32) {
        *self.state.lock() &= !bits;
    }

    pub fn peek(&self) -> u32 {
        *self.state.lock()
    }

    /// Block until `mask` is satisfied according to `mode`, or `timeout` elapses.
    /// When `auto_clear` is set, the matched bits are cleared before returning `Some`.
    pub fn wait(&self, mask: u32, mode: WaitMode, auto_clear: bool, timeout: Option<Duration>) -> Option<u32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            let satisfied = match mode {
                WaitMode::Any => *state & mask != 0,
                WaitMode::All => *state & mask == mask,
            };
            if satisfied {
                let matched = *state & mask;
                if auto_clear {
                    *state &= !mask;
                }
                return Some(matched);
            }
            match deadline {
                None => {
                    self.condition.wait(&mut state);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let timed_out = self.condition.wait_for(&mut state, deadline - now).timed_out();
                    if timed_out {
                        return None;
                    }
                }
            }
        }
    }
}

impl Default for EventFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// A degenerate `EventFlag` fixed to bit 0, auto-clearing on a successful wait.
pub struct Signal {
    flag: EventFlag,
}

const SIGNAL_BIT: u32 = 1;

impl Signal {
    pub fn new() -> Self {
        Self { flag: EventFlag::new() }
    }

    pub fn raise(&self) {
        self.flag.send(SIGNAL_BIT);
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.flag.wait(SIGNAL_BIT, WaitMode::Any, true, timeout).is_some()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a named worker thread. Priority hints are accepted for parity with the
/// original thread contract but are not applied on platforms without a stable, safe API
/// for it; callers should not rely on them for correctness.
pub fn spawn_named<F>(name: impl Into<String>, f: F) -> std::io::Result<JoinHandle<()>>
    where F: FnOnce() + Send + 'static
{
    std::thread::Builder::new().name(name.into()).spawn(f)
}

/// A point in time `timeout` away from now, or never, matching the spec's
/// "0 = try, None = forever, N = block up to N" timeout convention.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    Try,
    Forever,
    After(Instant),
}

impl Deadline {
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            None => Self::Forever,
            Some(d) if d.is_zero() => Self::Try,
            Some(d) => Self::After(Instant::now() + d),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Try => Some(Duration::ZERO),
            Self::Forever => None,
            Self::After(when) => Some(when.saturating_duration_since(Instant::now())),
        }
    }

    pub fn expired(&self) -> bool {
        match self {
            Self::Try => true,
            Self::Forever => false,
            Self::After(when) => Instant::now() >= *when,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_flag_any_wakes_on_matching_bit() {
        let flag = EventFlag::new();
        flag.send(0b010);
        assert_eq!(flag.wait(0b010, WaitMode::Any, false, Some(Duration::from_millis(10))), Some(0b010));
    }

    #[test]
    fn event_flag_all_requires_every_bit() {
        let flag = EventFlag::new();
        flag.send(0b001);
        assert!(flag.wait(0b011, WaitMode::All, false, Some(Duration::from_millis(10))).is_none());
        flag.send(0b010);
        assert!(flag.wait(0b011, WaitMode::All, false, Some(Duration::from_millis(10))).is_some());
    }

    #[test]
    fn event_flag_auto_clear() {
        let flag = EventFlag::new();
        flag.send(0b1);
        assert!(flag.wait(0b1, WaitMode::Any, true, None).is_some());
        assert_eq!(flag.peek(), 0);
    }

    #[test]
    fn event_flag_timeout_elapses() {
        let flag = EventFlag::new();
        assert!(flag.wait(0b1, WaitMode::Any, false, Some(Duration::from_millis(5))).is_none());
    }

    #[test]
    fn signal_raise_and_wait() {
        let signal = Signal::new();
        signal.raise();
        assert!(signal.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn deadline_try_is_immediately_expired() {
        assert!(Deadline::from_timeout(Some(Duration::ZERO)).expired());
    }

    #[test]
    fn deadline_forever_never_expires_immediately() {
        assert!(!Deadline::from_timeout(None).expired());
    }
}
