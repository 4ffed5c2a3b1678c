use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use coderoom_core::protocol::{self, PresenceDecodeError, PresenceUpdate};
use coderoom_core::{Role, UserIdentity};
use coderoom_doc::{DocError, Origin, ProjectDoc, Subscription};
use coderoom_storage::ProjectStore;
use tokio::sync::{mpsc, Mutex};

use crate::persist::PersistScheduler;
use crate::presence::PresenceRegistry;

const OUTBOUND_CHANNEL_SIZE: usize = 64;

pub type OutboundSender = mpsc::Sender<OutboundFrame>;
pub type OutboundReceiver = mpsc::Receiver<OutboundFrame>;

/// Frames queued towards one socket's writer task. Sends are fire-and-forget;
/// a full or closed channel drops the frame and the reader's own teardown
/// cleans the socket up.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Binary(Arc<[u8]>),
    Text(Arc<str>),
    Close { code: u16, reason: &'static str },
}

pub fn outbound_channel() -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(OUTBOUND_CHANNEL_SIZE)
}

/// One project's live collaboration context.
///
/// All CRDT access is serialized through the doc mutex; the socket map and
/// permission table use their own short-lived locks so the update observer
/// can broadcast synchronously from inside a doc transaction.
pub struct Room {
    room_id: String,
    store: Arc<dyn ProjectStore>,
    doc: Mutex<ProjectDoc>,
    presence: PresenceRegistry,
    sockets: std::sync::Mutex<HashMap<String, OutboundSender>>,
    perms: std::sync::RwLock<HashMap<String, Role>>,
    pub(crate) scheduler: PersistScheduler,
    closed: AtomicBool,
    _doc_subscription: std::sync::Mutex<Option<Subscription>>,
}

impl Room {
    /// Loads persisted state and builds the live room, wiring the doc update
    /// observer that re-broadcasts accepted updates and marks the room dirty.
    pub(crate) async fn open(
        room_id: String,
        store: Arc<dyn ProjectStore>,
    ) -> Result<Arc<Self>, DocError> {
        let state = store.load_project_state(&room_id).await;

        let doc = ProjectDoc::new();
        doc.seed(&state.files, &state.suggestions);

        let room = Arc::new(Self {
            room_id,
            store,
            doc: Mutex::new(doc),
            presence: PresenceRegistry::default(),
            sockets: std::sync::Mutex::new(HashMap::new()),
            perms: std::sync::RwLock::new(state.permissions),
            scheduler: PersistScheduler::default(),
            closed: AtomicBool::new(false),
            _doc_subscription: std::sync::Mutex::new(None),
        });

        room.scheduler.bind(Arc::downgrade(&room));
        let observer_room = Arc::downgrade(&room);
        let subscription = room.doc.lock().await.observe_updates(move |update, origin| {
            if let Some(room) = observer_room.upgrade() {
                room.on_doc_update(&update, origin.as_ref());
            }
        })?;
        *room
            ._doc_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(subscription);

        Ok(room)
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub(crate) fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    /// Per-user permission override layered on top of the token role.
    #[must_use]
    pub fn effective_role(&self, user: &UserIdentity) -> Role {
        self.perms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user.user_id)
            .copied()
            .unwrap_or(user.role)
    }

    /// Visible to authorization checks as soon as this returns.
    pub fn set_permission(&self, user_id: &str, role: Role) {
        self.perms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.to_owned(), role);
    }

    // -- socket membership ---------------------------------------------------

    /// Registers a socket. `false` means the room lost its teardown race and
    /// the caller must re-acquire a fresh room from the registry.
    pub(crate) fn attach_socket(&self, conn_id: &str, sender: OutboundSender) -> bool {
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        sockets.insert(conn_id.to_owned(), sender);
        true
    }

    pub(crate) fn detach_socket(&self, conn_id: &str) {
        self.sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conn_id);
    }

    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.socket_count() == 0
    }

    /// Marks the room closed iff it is still empty, so a racing attach can
    /// be turned away. Caller holds the registry lock.
    pub(crate) fn mark_closed(&self) -> bool {
        let sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        if !sockets.is_empty() {
            return false;
        }
        self.closed.store(true, Ordering::SeqCst);
        true
    }

    /// Drops presence state and any armed timer after registry removal.
    pub(crate) fn teardown(&self) {
        self.presence.clear();
        self.scheduler.abort_timer();
        self.sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    // -- document ------------------------------------------------------------

    /// Full doc state for the connect-time SYNC frame.
    pub async fn encode_doc_state(&self) -> Vec<u8> {
        self.doc.lock().await.encode_full_state()
    }

    /// Applies a client's SYNC payload. The broadcast to the other sockets
    /// and the dirty-mark happen synchronously inside the update observer
    /// before this returns.
    pub async fn apply_sync(&self, update: &[u8], conn_id: &str) -> Result<(), DocError> {
        let doc = self.doc.lock().await;
        doc.apply_update(update, Some(conn_id))
    }

    /// Approves a suggestion in a single doc transaction. The observer
    /// broadcast reaches every socket (no origin) and schedules the flush.
    pub async fn approve_suggestion(
        &self,
        suggestion_id: &str,
        approved_by: &str,
        approved_at: &str,
    ) -> bool {
        let doc = self.doc.lock().await;
        doc.approve_suggestion(suggestion_id, approved_by, approved_at)
    }

    pub(crate) async fn persist_snapshot(&self) -> coderoom_doc::DocSnapshot {
        self.doc.lock().await.persist_snapshot()
    }

    fn on_doc_update(&self, update: &[u8], origin: Option<&Origin>) {
        self.broadcast_binary(&protocol::sync_frame(update), origin);
        self.scheduler.schedule_flush();
    }

    // -- presence ------------------------------------------------------------

    /// Applies a presence payload from `conn_id`, broadcasting accepted
    /// changes to everyone else. Returns the client ids the payload touched
    /// so the socket can revoke them on disconnect.
    pub fn apply_presence(
        &self,
        payload: &[u8],
        conn_id: &str,
    ) -> Result<Vec<u64>, PresenceDecodeError> {
        let update = PresenceUpdate::decode(payload)?;
        let claimed = update.client_ids();
        let accepted = self.presence.apply(&update);
        if !accepted.is_empty() {
            self.broadcast_binary(
                &protocol::awareness_frame(&accepted.encode()),
                Some(&Origin::from(conn_id)),
            );
        }
        Ok(claimed)
    }

    /// Revokes presence clients (socket teardown) and broadcasts the
    /// removals with the leaving socket as origin.
    pub fn remove_presence(&self, client_ids: &[u64], conn_id: &str) {
        let removed = self.presence.remove_clients(client_ids);
        if !removed.is_empty() {
            self.broadcast_binary(
                &protocol::awareness_frame(&removed.encode()),
                Some(&Origin::from(conn_id)),
            );
        }
    }

    /// AWARENESS frame describing all present clients, if any.
    #[must_use]
    pub fn presence_snapshot_frame(&self) -> Option<Vec<u8>> {
        let snapshot = self.presence.snapshot();
        if snapshot.is_empty() {
            return None;
        }
        Some(protocol::awareness_frame(&snapshot.encode()))
    }

    // -- fan-out -------------------------------------------------------------

    fn broadcast_binary(&self, frame: &[u8], origin: Option<&Origin>) {
        let payload: Arc<[u8]> = Arc::from(frame.to_vec());
        let sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        for (conn_id, sender) in sockets.iter() {
            if let Some(origin) = origin {
                if *origin == Origin::from(conn_id.as_str()) {
                    continue;
                }
            }
            let _ = sender.try_send(OutboundFrame::Binary(Arc::clone(&payload)));
        }
    }

    /// Chat echoes back to the sender as a delivery confirmation, so this
    /// fan-out has no origin exclusion.
    pub fn broadcast_text_all(&self, text: &str) {
        let payload: Arc<str> = Arc::from(text);
        let sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        for sender in sockets.values() {
            let _ = sender.try_send(OutboundFrame::Text(Arc::clone(&payload)));
        }
    }

    pub fn close_all_sockets(&self, code: u16, reason: &'static str) {
        let sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        for sender in sockets.values() {
            let _ = sender.try_send(OutboundFrame::Close { code, reason });
        }
    }
}
