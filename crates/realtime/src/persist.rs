//! Debounced, coalescing persistence per room.
//!
//! The `(timer, in_flight, requested)` triple guarantees at most one store
//! write in flight per room, while every dirty-mark after the last
//! successful flush eventually produces another attempt.

use std::sync::{Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::room::Room;

/// Quiescence window after the last accepted update.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(1200);
/// Shorter cadence once a flush failed or coalesced work is pending.
const FLUSH_RETRY: Duration = Duration::from_millis(600);

#[derive(Default)]
pub(crate) struct PersistScheduler {
    state: Mutex<SchedulerState>,
    room: OnceLock<Weak<Room>>,
}

#[derive(Default)]
struct SchedulerState {
    timer: Option<JoinHandle<()>>,
    in_flight: bool,
    requested: bool,
}

impl PersistScheduler {
    pub(crate) fn bind(&self, room: Weak<Room>) {
        let _ = self.room.set(room);
    }

    /// Marks the room dirty and arms the debounce timer unless one is
    /// already pending.
    pub(crate) fn schedule_flush(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.requested = true;
        if state.timer.is_none() {
            state.timer = Some(self.arm(FLUSH_DEBOUNCE));
        }
    }

    fn arm(&self, delay: Duration) -> JoinHandle<()> {
        let room = self.room.get().cloned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(room) = room.and_then(|weak| weak.upgrade()) else {
                return;
            };
            room.scheduler.clear_timer();
            room.flush().await;
        })
    }

    fn clear_timer(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .timer
            .take();
    }

    pub(crate) fn abort_timer(&self) {
        if let Some(timer) = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .timer
            .take()
        {
            timer.abort();
        }
    }
}

impl Room {
    /// One pass of the flush state machine: skip when idle or already in
    /// flight, otherwise write the current snapshot and re-arm on demand.
    pub(crate) async fn flush(self: &std::sync::Arc<Self>) {
        {
            let mut state = self
                .scheduler
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if state.in_flight {
                state.requested = true;
                return;
            }
            if !state.requested {
                return;
            }
            state.in_flight = true;
            state.requested = false;
        }

        let snapshot = self.persist_snapshot().await;
        let result = self
            .store()
            .persist_project_state(self.room_id(), &snapshot)
            .await;

        let mut state = self
            .scheduler
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Err(error) = result {
            tracing::warn!(room = self.room_id(), %error, "persist failed, re-requesting flush");
            state.requested = true;
        }
        state.in_flight = false;
        if state.requested && state.timer.is_none() {
            state.timer = Some(self.scheduler.arm(FLUSH_RETRY));
        }
    }

    /// Teardown flush: cancel the pending timer, wait out any in-flight
    /// write, then run exactly one final attempt.
    pub(crate) async fn final_flush(self: &std::sync::Arc<Self>) {
        {
            let mut state = self
                .scheduler
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.requested = true;
        }

        loop {
            let in_flight = self
                .scheduler
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .in_flight;
            if !in_flight {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.flush().await;
        self.scheduler.abort_timer();
    }
}
