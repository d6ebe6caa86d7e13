//! Barrier and abort core shared by every collective scope of one worker
//! group.

use std::sync::{Condvar, Mutex};

use crate::error::NmfkError;

struct Phase {
    waiting: usize,
    generation: u64,
}

struct SyncState {
    phases: Vec<Phase>,
    abort: Option<(usize, String)>,
}

/// One mutex/condvar pair serves every barrier in the group, so an abort
/// posted by any rank wakes every waiter no matter which scope it is parked
/// in. Barriers are identified by index and sized by the caller.
pub(crate) struct WorldSync {
    state: Mutex<SyncState>,
    cond: Condvar,
}

impl WorldSync {
    pub(crate) fn new(num_barriers: usize) -> Self {
        let phases = (0..num_barriers)
            .map(|_| Phase {
                waiting: 0,
                generation: 0,
            })
            .collect();
        WorldSync {
            state: Mutex::new(SyncState {
                phases,
                abort: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until all `members` participants of `barrier` have arrived, or
    /// until the group is aborted.
    pub(crate) fn wait(&self, barrier: usize, members: usize) -> Result<(), NmfkError> {
        let mut state = self.state.lock().unwrap();
        if let Some((origin, reason)) = &state.abort {
            return Err(NmfkError::GroupAborted {
                origin: *origin,
                reason: reason.clone(),
            });
        }
        let arrival_generation = state.phases[barrier].generation;
        state.phases[barrier].waiting += 1;
        if state.phases[barrier].waiting == members {
            state.phases[barrier].waiting = 0;
            state.phases[barrier].generation = arrival_generation.wrapping_add(1);
            self.cond.notify_all();
            return Ok(());
        }
        loop {
            state = self.cond.wait(state).unwrap();
            if let Some((origin, reason)) = &state.abort {
                return Err(NmfkError::GroupAborted {
                    origin: *origin,
                    reason: reason.clone(),
                });
            }
            if state.phases[barrier].generation != arrival_generation {
                return Ok(());
            }
        }
    }

    /// Posts a group abort. The first posted reason wins; every current and
    /// future waiter returns `GroupAborted`.
    pub(crate) fn abort(&self, origin: usize, reason: &str) {
        let mut state = self.state.lock().unwrap();
        if state.abort.is_none() {
            state.abort = Some((origin, reason.to_string()));
        }
        self.cond.notify_all();
    }
}
