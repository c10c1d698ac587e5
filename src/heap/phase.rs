//! GC phase bookkeeping. The phase is mirrored in a lock-free atomic for
//! hot-path reads; transitions go through a monitor so parked worker
//! threads can be woken, and are fenced sequentially consistent so no
//! thread observes sweep state before the mark writes that produced it.

use atomic::Atomic;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::NoUninit, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Idle,
    Mark,
    Sweep,
    Shutdown,
}

struct PhaseState {
    phase: Phase,
    /// Bumped on every transition; lets a worker that finished a phase
    /// park until the next one instead of spinning on a stale phase.
    epoch: u64,
}

pub struct PhaseControl {
    current: Atomic<Phase>,
    /// Marker threads with id below this participate in the current mark
    /// phase; the master raises it as the packet backlog grows.
    worker_target: AtomicUsize,
    monitor: Mutex<PhaseState>,
    wakeup: Condvar,
}

impl PhaseControl {
    pub fn new() -> Self {
        Self {
            current: Atomic::new(Phase::Idle),
            worker_target: AtomicUsize::new(0),
            monitor: Mutex::new(PhaseState {
                phase: Phase::Idle,
                epoch: 0,
            }),
            wakeup: Condvar::new(),
        }
    }

    pub fn current(&self) -> Phase {
        self.current.load(Ordering::Acquire)
    }

    /// Transition to `phase` with `worker_target` eligible workers and
    /// wake everyone parked on the monitor.
    pub fn request(&self, phase: Phase, worker_target: usize) {
        let mut state = self.monitor.lock().unwrap();
        state.phase = phase;
        state.epoch += 1;
        self.worker_target.store(worker_target, Ordering::SeqCst);
        self.current.store(phase, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        self.wakeup.notify_all();
    }

    pub fn worker_target(&self) -> usize {
        self.worker_target.load(Ordering::SeqCst)
    }

    /// Raise (never lower mid-phase) the number of eligible workers.
    pub fn set_worker_target(&self, target: usize) {
        let previous = self.worker_target.fetch_max(target, Ordering::SeqCst);
        if target > previous {
            let _state = self.monitor.lock().unwrap();
            self.wakeup.notify_all();
        }
    }

    /// Park until a phase newer than `last_epoch` has work for this
    /// worker. Shutdown is always returned immediately.
    pub fn wait_for_work(&self, worker_id: usize, last_epoch: u64) -> (Phase, u64) {
        let mut state = self.monitor.lock().unwrap();
        loop {
            if state.phase == Phase::Shutdown {
                return (Phase::Shutdown, state.epoch);
            }
            let eligible = match state.phase {
                Phase::Mark => worker_id < self.worker_target.load(Ordering::SeqCst),
                Phase::Sweep => true,
                Phase::Idle | Phase::Shutdown => false,
            };
            if state.epoch != last_epoch && eligible {
                fence(Ordering::SeqCst);
                return (state.phase, state.epoch);
            }
            state = self.wakeup.wait(state).unwrap();
        }
    }
}

impl Default for PhaseControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn phase_names() {
        assert_eq!(Phase::Mark.to_string(), "mark");
        assert_eq!(Phase::Sweep.to_string(), "sweep");
    }

    #[test]
    fn starts_idle() {
        let control = PhaseControl::new();
        assert_eq!(control.current(), Phase::Idle);
    }

    #[test]
    fn request_updates_mirror() {
        let control = PhaseControl::new();
        control.request(Phase::Mark, 1);
        assert_eq!(control.current(), Phase::Mark);
        assert_eq!(control.worker_target(), 1);
    }

    #[test]
    fn workers_wake_on_request_and_shutdown() {
        let control = Arc::new(PhaseControl::new());
        let worker = {
            let control = control.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                let mut epoch = 0;
                loop {
                    let (phase, e) = control.wait_for_work(0, epoch);
                    epoch = e;
                    seen.push(phase);
                    if phase == Phase::Shutdown {
                        return seen;
                    }
                }
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        control.request(Phase::Sweep, 1);
        std::thread::sleep(Duration::from_millis(10));
        control.request(Phase::Shutdown, 0);
        let seen = worker.join().unwrap();
        assert_eq!(seen, vec![Phase::Sweep, Phase::Shutdown]);
    }

    #[test]
    fn target_gates_mark_eligibility() {
        let control = Arc::new(PhaseControl::new());
        control.request(Phase::Mark, 1);
        // Worker 2 is not eligible yet and must not return for mark.
        let late_worker = {
            let control = control.clone();
            std::thread::spawn(move || control.wait_for_work(2, 0).0)
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(!late_worker.is_finished());
        control.set_worker_target(4);
        assert_eq!(late_worker.join().unwrap(), Phase::Mark);
    }
}
