//! Process-wide room registry.
//!
//! Guarantees at most one live `Room` per id: lookups hit the `rooms` map,
//! concurrent creations share a single in-flight future, and teardown
//! re-checks emptiness under the registry lock so a racing attach wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use coderoom_storage::ProjectStore;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;

use crate::room::{OutboundSender, Room};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("room initialization failed: {0}")]
    Init(String),
}

type PendingRoom = Shared<BoxFuture<'static, Result<Arc<Room>, RegistryError>>>;

#[derive(Clone)]
pub struct RoomRegistry {
    shared: Arc<RegistryShared>,
}

struct RegistryShared {
    store: Arc<dyn ProjectStore>,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<String, Arc<Room>>,
    pending: HashMap<String, PendingRoom>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                store,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Returns the live room for `room_id`, creating it exactly once even
    /// under concurrent acquisition storms.
    pub async fn get_or_create(&self, room_id: &str) -> Result<Arc<Room>, RegistryError> {
        let pending = {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = state.rooms.get(room_id) {
                return Ok(Arc::clone(room));
            }
            if let Some(pending) = state.pending.get(room_id) {
                pending.clone()
            } else {
                let pending = self.spawn_create(room_id.to_owned());
                state.pending.insert(room_id.to_owned(), pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Creation runs in its own task so it completes even when every
    /// awaiter goes away mid-flight.
    fn spawn_create(&self, room_id: String) -> PendingRoom {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let result = Room::open(room_id.clone(), Arc::clone(&registry.shared.store))
                .await
                .map_err(|error| RegistryError::Init(error.to_string()));

            let mut state = registry
                .shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Ok(room) = &result {
                state.rooms.insert(room_id.clone(), Arc::clone(room));
            }
            state.pending.remove(&room_id);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(RegistryError::Init(join_error.to_string())),
            }
        }
        .boxed()
        .shared()
    }

    /// Acquires the room and registers the socket, retrying when the room
    /// loses a teardown race between lookup and attach.
    pub async fn attach(
        &self,
        room_id: &str,
        conn_id: &str,
        sender: OutboundSender,
    ) -> Result<Arc<Room>, RegistryError> {
        loop {
            let room = self.get_or_create(room_id).await?;
            if room.attach_socket(conn_id, sender.clone()) {
                return Ok(room);
            }
        }
    }

    /// Detaches a socket, revokes its presence clients, and destroys the
    /// room after a final flush when this was the last socket.
    pub async fn release(&self, room: &Arc<Room>, conn_id: &str, claimed_clients: &[u64]) {
        room.detach_socket(conn_id);
        if !claimed_clients.is_empty() {
            room.remove_presence(claimed_clients, conn_id);
        }
        if !room.is_empty() {
            return;
        }

        room.final_flush().await;

        let removed = {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if room.mark_closed() {
                state.rooms.remove(room.room_id());
                true
            } else {
                false
            }
        };
        if removed {
            tracing::debug!(room = room.room_id(), "room destroyed");
            room.teardown();
        }
    }

    #[must_use]
    pub fn live_rooms(&self) -> Vec<Arc<Room>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rooms
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rooms
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shutdown sequence: flush every live room, close its sockets with the
    /// restart code, and drop the map.
    pub async fn shutdown_all(&self, close_code: u16, reason: &'static str) {
        let rooms = self.live_rooms();
        for room in &rooms {
            room.final_flush().await;
            room.close_all_sockets(close_code, reason);
            room.teardown();
        }
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rooms
            .clear();
    }
}
