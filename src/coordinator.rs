//! Cross-thread coordination: the abort channel, reusable barriers,
//! execute-once funnels, transfer start/end hooks and the version
//! negotiation status. One `ThreadsController` is shared by all sender
//! threads of a transfer; it is handed to each thread at construction, never
//! reached through globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::ErrorCode;

pub const VERSION_MISMATCH_BARRIER: &str = "version-mismatch-barrier";
pub const VERSION_MISMATCH_FUNNEL: &str = "version-mismatch-funnel";

/// Transfer-wide state of protocol version renegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NegotiationStatus {
    /// Waiting for every thread to contribute its peer-proposed version.
    VMismatchWait = 0,
    /// A funnel winner committed a new version; reconnect with it.
    VMismatchResolved = 1,
    /// Renegotiation is impossible; all threads must end.
    VMismatchFailed = 2,
}

impl NegotiationStatus {
    fn from_u8(v: u8) -> NegotiationStatus {
        match v {
            1 => NegotiationStatus::VMismatchResolved,
            2 => NegotiationStatus::VMismatchFailed,
            _ => NegotiationStatus::VMismatchWait,
        }
    }
}

/// All-or-nothing rendezvous for the threads still registered with the
/// controller. Reusable: each release starts a new generation. Threads that
/// finish deregister and stop being counted.
pub struct Barrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

struct BarrierState {
    expected: usize,
    arrived: usize,
    generation: u64,
}

impl Barrier {
    fn new(expected: usize) -> Barrier {
        Barrier {
            state: Mutex::new(BarrierState {
                expected,
                arrived: 0,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Arrive and block until every expected thread has arrived.
    pub fn execute(&self) {
        let mut state = self.state.lock();
        state.arrived += 1;
        let generation = state.generation;
        if state.arrived >= state.expected {
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
            return;
        }
        while state.generation == generation {
            self.cond.wait(&mut state);
        }
    }

    /// A thread deregistered; it will never arrive. Release waiters if it
    /// was the last one outstanding.
    fn remove_one(&self) {
        let mut state = self.state.lock();
        if state.expected > 0 {
            state.expected -= 1;
        }
        if state.arrived > 0 && state.arrived >= state.expected {
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelStatus {
    /// Caller won the funnel and must perform the work.
    FunnelStart,
    /// Another caller is performing the work; wait for it.
    FunnelProgress,
    /// Work already performed; observe the result and move on.
    FunnelEnd,
}

#[derive(PartialEq)]
enum FunnelState {
    Waiting,
    Progress,
    End,
}

/// Exactly-one execution among competing threads.
pub struct Funnel {
    state: Mutex<FunnelState>,
    cond: Condvar,
}

impl Funnel {
    fn new() -> Funnel {
        Funnel {
            state: Mutex::new(FunnelState::Waiting),
            cond: Condvar::new(),
        }
    }

    pub fn get_status(&self) -> FunnelStatus {
        let mut state = self.state.lock();
        match *state {
            FunnelState::Waiting => {
                *state = FunnelState::Progress;
                FunnelStatus::FunnelStart
            }
            FunnelState::Progress => FunnelStatus::FunnelProgress,
            FunnelState::End => FunnelStatus::FunnelEnd,
        }
    }

    /// Block while the winner is still executing.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while *state == FunnelState::Progress {
            self.cond.wait(&mut state);
        }
    }

    pub fn notify_success(&self) {
        let mut state = self.state.lock();
        *state = FunnelState::End;
        self.cond.notify_all();
    }
}

pub struct ThreadsController {
    abort_code: AtomicU8,
    negotiation_status: AtomicU8,
    state: Mutex<ControllerState>,
    barriers: Mutex<HashMap<&'static str, Arc<Barrier>>>,
    funnels: Mutex<HashMap<&'static str, Arc<Funnel>>>,
}

struct ControllerState {
    num_threads: usize,
    active_threads: usize,
    started: bool,
    ended: bool,
}

impl ThreadsController {
    pub fn new(num_threads: usize) -> Arc<ThreadsController> {
        Arc::new(ThreadsController {
            abort_code: AtomicU8::new(ErrorCode::Ok.to_wire()),
            negotiation_status: AtomicU8::new(NegotiationStatus::VMismatchWait as u8),
            state: Mutex::new(ControllerState {
                num_threads,
                active_threads: num_threads,
                started: false,
                ended: false,
            }),
            barriers: Mutex::new(HashMap::new()),
            funnels: Mutex::new(HashMap::new()),
        })
    }

    // -- abort channel ------------------------------------------------------

    /// Broadcast an abort. First writer wins; later codes are dropped so
    /// every thread observes the same cause.
    pub fn abort(&self, code: ErrorCode) {
        let _ = self.abort_code.compare_exchange(
            ErrorCode::Ok.to_wire(),
            code.to_wire(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn abort_code(&self) -> ErrorCode {
        ErrorCode::from_wire(self.abort_code.load(Ordering::Acquire))
    }

    /// Reset after a successful version-mismatch recovery.
    pub fn clear_abort(&self) {
        self.abort_code
            .store(ErrorCode::Ok.to_wire(), Ordering::Release);
    }

    // -- negotiation status -------------------------------------------------

    pub fn negotiation_status(&self) -> NegotiationStatus {
        NegotiationStatus::from_u8(self.negotiation_status.load(Ordering::Acquire))
    }

    pub fn set_negotiation_status(&self, status: NegotiationStatus) {
        self.negotiation_status
            .store(status as u8, Ordering::Release);
    }

    // -- barriers and funnels ----------------------------------------------

    pub fn get_barrier(&self, name: &'static str) -> Arc<Barrier> {
        let mut barriers = self.barriers.lock();
        if let Some(barrier) = barriers.get(name) {
            return Arc::clone(barrier);
        }
        let expected = self.state.lock().active_threads;
        let barrier = Arc::new(Barrier::new(expected));
        barriers.insert(name, Arc::clone(&barrier));
        barrier
    }

    pub fn get_funnel(&self, name: &'static str) -> Arc<Funnel> {
        let mut funnels = self.funnels.lock();
        Arc::clone(
            funnels
                .entry(name)
                .or_insert_with(|| Arc::new(Funnel::new())),
        )
    }

    // -- lifecycle hooks ----------------------------------------------------

    /// Run `f` on the first caller only (transfer-open hook).
    pub fn execute_at_start<F: FnOnce()>(&self, f: F) {
        let run = {
            let mut state = self.state.lock();
            if state.started {
                false
            } else {
                state.started = true;
                true
            }
        };
        if run {
            f();
        }
    }

    /// Deregister the calling thread and run `f` if it was the last one
    /// (transfer-close hook). Barriers stop expecting the thread.
    pub fn de_register_thread<F: FnOnce()>(&self, f: F) {
        let run = {
            let mut state = self.state.lock();
            if state.active_threads > 0 {
                state.active_threads -= 1;
            }
            if state.active_threads == 0 && !state.ended {
                state.ended = true;
                true
            } else {
                false
            }
        };
        for barrier in self.barriers.lock().values() {
            barrier.remove_one();
        }
        if run {
            f();
        }
    }

    pub fn num_active_threads(&self) -> usize {
        self.state.lock().active_threads
    }

    pub fn num_threads(&self) -> usize {
        self.state.lock().num_threads
    }
}
