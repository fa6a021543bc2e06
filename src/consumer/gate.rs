//! Admission Gate
//!
//! Separates "may new work start" (open/closed) from "is work already in
//! flight" (the count of callers inside). Pausing closes the gate and drains
//! the callers already inside; closing additionally ejects everyone still
//! waiting to get in.

use parking_lot::{Condvar, Mutex};
use log::trace;
use crate::consumer::deadline::Deadline;

/// Why a caller did not get through the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRefused {
    /// The deadline expired while the gate was closed
    TimedOut,
    /// Waiters were aborted, or the gate was retired
    Aborted,
}

#[derive(Debug)]
struct GateState {
    open: bool,
    inside: usize,
    waiting: usize,
    /// Bumped by every abort; a waiter that sees it change was aborted
    abort_epoch: u64,
    retired: bool,
}

/// Binary admission gate with drain support
#[derive(Debug)]
pub struct AdmissionGate {
    state: Mutex<GateState>,
    admitted: Condvar,
    cleared: Condvar,
}

/// Proof of entry; leaving the protected region is dropping the pass
#[must_use = "dropping the pass exits the gate immediately"]
#[derive(Debug)]
pub struct GatePass<'a> {
    gate: &'a AdmissionGate,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.exit();
    }
}

impl AdmissionGate {
    /// Create a gate, initially open or closed
    pub fn new(open: bool) -> Self {
        Self {
            state: Mutex::new(GateState {
                open,
                inside: 0,
                waiting: 0,
                abort_epoch: 0,
                retired: false,
            }),
            admitted: Condvar::new(),
            cleared: Condvar::new(),
        }
    }

    /// Let new callers in, releasing everyone blocked in `enter`
    pub fn open(&self) {
        let mut state = self.state.lock();
        if state.retired {
            return;
        }
        state.open = true;
        self.admitted.notify_all();
    }

    /// Stop admitting new callers; callers already inside are unaffected
    pub fn close(&self) {
        self.state.lock().open = false;
    }

    /// Pass the gate, blocking while it is closed.
    ///
    /// Returns a [`GatePass`] once admitted. A closed gate is waited on until
    /// it opens, the deadline expires or waiters are aborted.
    pub fn enter(&self, deadline: &Deadline) -> Result<GatePass<'_>, EntryRefused> {
        let mut state = self.state.lock();
        let epoch = state.abort_epoch;
        state.waiting += 1;

        let outcome = loop {
            if state.retired || state.abort_epoch != epoch {
                break Err(EntryRefused::Aborted);
            }
            if state.open {
                state.inside += 1;
                break Ok(());
            }
            match deadline.remaining() {
                None => self.admitted.wait(&mut state),
                Some(left) if left.is_zero() => break Err(EntryRefused::TimedOut),
                Some(left) => {
                    self.admitted.wait_for(&mut state, left);
                }
            }
        };

        state.waiting -= 1;
        drop(state);
        match outcome {
            Ok(()) => Ok(GatePass { gate: self }),
            Err(refused) => {
                trace!("gate entry refused: {:?}", refused);
                Err(refused)
            }
        }
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.inside > 0, "gate exit without matching entry");
        state.inside = state.inside.saturating_sub(1);
        if state.inside == 0 {
            self.cleared.notify_all();
        }
    }

    /// Make every caller currently blocked in `enter` return `Aborted`
    pub fn abort_waiters(&self) {
        let mut state = self.state.lock();
        state.abort_epoch = state.abort_epoch.wrapping_add(1);
        self.admitted.notify_all();
    }

    /// Close the gate for good: abort current waiters and refuse all future
    /// callers. Callers already inside still leave normally.
    pub fn retire(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.retired = true;
        state.abort_epoch = state.abort_epoch.wrapping_add(1);
        self.admitted.notify_all();
    }

    /// Block until nobody is inside or the deadline expires.
    ///
    /// Returns `true` if the gate cleared.
    pub fn wait_to_clear(&self, deadline: &Deadline) -> bool {
        let mut state = self.state.lock();
        while state.inside > 0 {
            match deadline.remaining() {
                None => self.cleared.wait(&mut state),
                Some(left) if left.is_zero() => return false,
                Some(left) => {
                    self.cleared.wait_for(&mut state, left);
                }
            }
        }
        true
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of callers between a successful `enter` and their exit
    pub fn inside_count(&self) -> usize {
        self.state.lock().inside
    }

    /// Number of callers currently blocked in `enter`
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for_waiters(gate: &AdmissionGate, count: usize) {
        let start = Instant::now();
        while gate.waiting_count() < count {
            assert!(start.elapsed() < Duration::from_secs(5), "waiters never arrived");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_open_gate_admits_immediately() {
        let gate = AdmissionGate::new(true);
        let pass = gate.enter(&Deadline::zero()).unwrap();
        assert_eq!(gate.inside_count(), 1);
        drop(pass);
        assert_eq!(gate.inside_count(), 0);
    }

    #[test]
    fn test_closed_gate_times_out() {
        let gate = AdmissionGate::new(false);
        let start = Instant::now();
        let result = gate.enter(&Deadline::after(Duration::from_millis(30)));
        assert_eq!(result.unwrap_err(), EntryRefused::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(gate.inside_count(), 0);
        assert_eq!(gate.waiting_count(), 0);
    }

    #[test]
    fn test_closed_gate_zero_deadline_does_not_wait() {
        let gate = AdmissionGate::new(false);
        let start = Instant::now();
        assert_eq!(gate.enter(&Deadline::zero()).unwrap_err(), EntryRefused::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn test_open_releases_waiter() {
        let gate = Arc::new(AdmissionGate::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.enter(&Deadline::forever()).map(|_pass| ()))
        };
        wait_for_waiters(&gate, 1);
        gate.open();
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(gate.inside_count(), 0);
    }

    #[test]
    fn test_abort_waiters_wakes_forever_waiter() {
        let gate = Arc::new(AdmissionGate::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.enter(&Deadline::forever()).map(|_pass| ()))
        };
        wait_for_waiters(&gate, 1);
        gate.abort_waiters();
        assert_eq!(waiter.join().unwrap(), Err(EntryRefused::Aborted));
        assert!(!gate.is_open());
    }

    #[test]
    fn test_abort_does_not_affect_callers_inside() {
        let gate = AdmissionGate::new(true);
        let pass = gate.enter(&Deadline::zero()).unwrap();
        gate.close();
        gate.abort_waiters();
        assert_eq!(gate.inside_count(), 1);
        drop(pass);
        assert_eq!(gate.inside_count(), 0);
    }

    #[test]
    fn test_abort_is_not_sticky_but_retire_is() {
        let gate = AdmissionGate::new(true);
        gate.abort_waiters();
        assert!(gate.enter(&Deadline::zero()).is_ok());

        gate.retire();
        assert_eq!(gate.enter(&Deadline::forever()).unwrap_err(), EntryRefused::Aborted);
        gate.open();
        assert!(!gate.is_open());
    }

    #[test]
    fn test_wait_to_clear_waits_for_exit() {
        let gate = Arc::new(AdmissionGate::new(true));
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(0);
        let holder = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _pass = gate.enter(&Deadline::zero()).unwrap();
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(40));
            })
        };
        entered_rx.recv().unwrap();
        gate.close();

        let start = Instant::now();
        assert!(gate.wait_to_clear(&Deadline::after(Duration::from_secs(5))));
        assert!(start.elapsed() >= Duration::from_millis(20));
        holder.join().unwrap();
    }

    #[test]
    fn test_wait_to_clear_times_out() {
        let gate = AdmissionGate::new(true);
        let _pass = gate.enter(&Deadline::zero()).unwrap();
        assert!(!gate.wait_to_clear(&Deadline::after(Duration::from_millis(20))));
        assert!(!gate.wait_to_clear(&Deadline::zero()));
    }

    #[test]
    fn test_wait_to_clear_on_empty_gate() {
        let gate = AdmissionGate::new(false);
        assert!(gate.wait_to_clear(&Deadline::zero()));
    }
}
