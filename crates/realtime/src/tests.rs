use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coderoom_core::protocol::{
    parse_binary_frame, BinaryFrame, PresenceEntry, PresenceUpdate,
};
use coderoom_core::{Role, UserIdentity};
use coderoom_doc::{DocSnapshot, ProjectDoc};
use coderoom_storage::{ProjectState, ProjectStore, StorageError, UserProfile};

use crate::{outbound_channel, OutboundFrame, OutboundReceiver, RoomRegistry};

#[derive(Default)]
struct StubStore {
    persist_calls: AtomicUsize,
    persist_failures_left: AtomicUsize,
    persist_delay_ms: u64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    last_snapshot: Mutex<Option<DocSnapshot>>,
}

impl StubStore {
    fn failing(times: usize) -> Self {
        Self {
            persist_failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    fn slow(delay_ms: u64) -> Self {
        Self {
            persist_delay_ms: delay_ms,
            ..Self::default()
        }
    }

    fn persist_count(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProjectStore for StubStore {
    async fn ensure_connection(&self) -> bool {
        true
    }

    async fn load_project_state(&self, _room_id: &str) -> ProjectState {
        ProjectState::default()
    }

    async fn persist_project_state(
        &self,
        _room_id: &str,
        snapshot: &DocSnapshot,
    ) -> Result<(), StorageError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if self.persist_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.persist_delay_ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .persist_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(StorageError::Database("injected failure".to_owned()));
        }
        *self.last_snapshot.lock().expect("lock snapshot") = Some(snapshot.clone());
        Ok(())
    }

    async fn set_project_permission(
        &self,
        _room_id: &str,
        _user_id: &str,
        _role: Role,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn login_user(&self, username: &str) -> Result<UserProfile, StorageError> {
        Ok(UserProfile {
            user_id: format!("u-{username}"),
            username: username.to_owned(),
            avatar: None,
            role: Role::Editor,
        })
    }
}

fn drain(receiver: &mut OutboundReceiver) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = receiver.try_recv() {
        frames.push(frame);
    }
    frames
}

fn sync_payloads(frames: &[OutboundFrame]) -> Vec<Vec<u8>> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            OutboundFrame::Binary(bytes) => match parse_binary_frame(bytes) {
                Some(BinaryFrame::Sync(payload)) => Some(payload.to_vec()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

fn awareness_payloads(frames: &[OutboundFrame]) -> Vec<PresenceUpdate> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            OutboundFrame::Binary(bytes) => match parse_binary_frame(bytes) {
                Some(BinaryFrame::Awareness(payload)) => PresenceUpdate::decode(payload).ok(),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

fn foreign_edit(file_id: &str, content: &str) -> Vec<u8> {
    let doc = ProjectDoc::new();
    doc.insert_file(file_id, content);
    doc.encode_full_state()
}

#[tokio::test]
async fn concurrent_acquisitions_share_one_room() {
    let registry = RoomRegistry::new(Arc::new(StubStore::default()));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        handles.push(tokio::spawn(
            async move { registry.get_or_create("storm").await },
        ));
    }

    let mut rooms = Vec::new();
    for handle in handles {
        rooms.push(handle.await.expect("join").expect("room"));
    }

    for room in &rooms {
        assert!(Arc::ptr_eq(room, &rooms[0]));
    }
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn distinct_room_ids_get_distinct_rooms() {
    let registry = RoomRegistry::new(Arc::new(StubStore::default()));
    let left = registry.get_or_create("left").await.expect("room");
    let right = registry.get_or_create("right").await.expect("room");
    assert!(!Arc::ptr_eq(&left, &right));
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn sync_broadcast_excludes_the_origin_socket() {
    let registry = RoomRegistry::new(Arc::new(StubStore::default()));
    let (sender_a, mut receiver_a) = outbound_channel();
    let (sender_b, mut receiver_b) = outbound_channel();
    let room = registry.attach("collab", "conn-a", sender_a).await.expect("attach a");
    registry.attach("collab", "conn-b", sender_b).await.expect("attach b");

    let update = foreign_edit("f-1", "allowed edit");
    room.apply_sync(&update, "conn-a").await.expect("apply");

    let to_a = sync_payloads(&drain(&mut receiver_a));
    let to_b = sync_payloads(&drain(&mut receiver_b));
    assert!(to_a.is_empty(), "origin socket must not receive its own update");
    assert_eq!(to_b.len(), 1, "peer receives exactly one SYNC frame");

    let replica = ProjectDoc::new();
    replica.apply_update(&to_b[0], None).expect("replay");
    assert_eq!(replica.file_contents()["f-1"], "allowed edit");
}

#[tokio::test]
async fn chat_broadcast_includes_the_sender() {
    let registry = RoomRegistry::new(Arc::new(StubStore::default()));
    let (sender_a, mut receiver_a) = outbound_channel();
    let (sender_b, mut receiver_b) = outbound_channel();
    let room = registry.attach("chat", "conn-a", sender_a).await.expect("attach a");
    registry.attach("chat", "conn-b", sender_b).await.expect("attach b");

    room.broadcast_text_all("{\"type\":\"chat\"}");

    for receiver in [&mut receiver_a, &mut receiver_b] {
        let frames = drain(receiver);
        assert!(
            matches!(frames.as_slice(), [OutboundFrame::Text(_)]),
            "every socket, sender included, gets the chat frame"
        );
    }
}

#[tokio::test]
async fn presence_updates_fan_out_and_disconnect_revokes() {
    let registry = RoomRegistry::new(Arc::new(StubStore::default()));
    let (sender_a, _receiver_a) = outbound_channel();
    let (sender_b, mut receiver_b) = outbound_channel();
    let room = registry.attach("presence", "conn-a", sender_a).await.expect("attach a");
    registry.attach("presence", "conn-b", sender_b).await.expect("attach b");

    let update = PresenceUpdate::new(vec![PresenceEntry {
        client_id: 7,
        clock: 1,
        state: "{\"cursor\":3}".to_owned(),
    }]);
    let claimed = room
        .apply_presence(&update.encode(), "conn-a")
        .expect("apply presence");
    assert_eq!(claimed, vec![7]);

    let seen = awareness_payloads(&drain(&mut receiver_b));
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].entries[0].client_id, 7);

    registry.release(&room, "conn-a", &claimed).await;

    let removals = awareness_payloads(&drain(&mut receiver_b));
    assert_eq!(removals.len(), 1);
    let removed: Vec<u64> = removals[0]
        .entries
        .iter()
        .filter(|entry| entry.is_removal())
        .map(|entry| entry.client_id)
        .collect();
    assert_eq!(removed, vec![7]);
    assert!(room.presence_snapshot_frame().is_none());
}

#[tokio::test]
async fn effective_role_prefers_permission_override() {
    let registry = RoomRegistry::new(Arc::new(StubStore::default()));
    let room = registry.get_or_create("perm").await.expect("room");
    let user = UserIdentity {
        user_id: "u-1".to_owned(),
        username: "alice".to_owned(),
        role: Role::Viewer,
    };

    assert_eq!(room.effective_role(&user), Role::Viewer);
    room.set_permission("u-1", Role::Admin);
    assert_eq!(room.effective_role(&user), Role::Admin);
    room.set_permission("u-1", Role::Viewer);
    assert_eq!(room.effective_role(&user), Role::Viewer);
}

#[tokio::test]
async fn last_disconnect_flushes_and_destroys_the_room() {
    let store = Arc::new(StubStore::default());
    let registry = RoomRegistry::new(Arc::clone(&store) as Arc<dyn ProjectStore>);
    let (sender, _receiver) = outbound_channel();
    let room = registry.attach("ephemeral", "conn-a", sender).await.expect("attach");

    room.apply_sync(&foreign_edit("f-1", "content"), "conn-a")
        .await
        .expect("apply");
    registry.release(&room, "conn-a", &[]).await;

    assert!(registry.is_empty(), "room removed after last disconnect");
    assert!(store.persist_count() >= 1, "teardown ran a final flush");
    let snapshot = store
        .last_snapshot
        .lock()
        .expect("lock snapshot")
        .clone()
        .expect("snapshot persisted");
    assert_eq!(snapshot.files.len(), 1);
    assert_eq!(snapshot.files[0].content, "content");
}

#[tokio::test(start_paused = true)]
async fn rapid_edits_coalesce_into_one_flush() {
    let store = Arc::new(StubStore::default());
    let registry = RoomRegistry::new(Arc::clone(&store) as Arc<dyn ProjectStore>);
    let room = registry.get_or_create("debounce").await.expect("room");

    for index in 0..3 {
        room.apply_sync(&foreign_edit(&format!("f-{index}"), "x"), "conn-a")
            .await
            .expect("apply");
    }
    assert_eq!(store.persist_count(), 0, "nothing flushes inside the window");

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(store.persist_count(), 1, "one flush after quiescence");

    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(store.persist_count(), 1, "no timer left armed");
}

#[tokio::test(start_paused = true)]
async fn failed_flush_retries_on_the_short_cadence() {
    let store = Arc::new(StubStore::failing(1));
    let registry = RoomRegistry::new(Arc::clone(&store) as Arc<dyn ProjectStore>);
    let room = registry.get_or_create("retry").await.expect("room");

    room.apply_sync(&foreign_edit("f-1", "x"), "conn-a")
        .await
        .expect("apply");

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(store.persist_count(), 1, "first attempt failed");

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(store.persist_count(), 2, "retry fired on the 600ms cadence");

    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(store.persist_count(), 2, "success stops the cycle");
}

#[tokio::test(start_paused = true)]
async fn edits_during_a_flush_produce_a_follow_up_flush() {
    let store = Arc::new(StubStore::slow(500));
    let registry = RoomRegistry::new(Arc::clone(&store) as Arc<dyn ProjectStore>);
    let room = registry.get_or_create("coalesce").await.expect("room");

    room.apply_sync(&foreign_edit("f-1", "first"), "conn-a")
        .await
        .expect("apply");
    // Land inside the in-flight window of the first flush (1200..1700ms).
    tokio::time::sleep(Duration::from_millis(1250)).await;
    room.apply_sync(&foreign_edit("f-2", "second"), "conn-a")
        .await
        .expect("apply");

    tokio::time::sleep(Duration::from_millis(4000)).await;
    assert_eq!(store.persist_count(), 2, "pending request flushed again");
    assert_eq!(
        store.max_in_flight.load(Ordering::SeqCst),
        1,
        "never more than one persist in flight"
    );
    let snapshot = store
        .last_snapshot
        .lock()
        .expect("lock snapshot")
        .clone()
        .expect("snapshot persisted");
    assert_eq!(snapshot.files.len(), 2, "final store state matches the doc");
}

#[tokio::test]
async fn shutdown_flushes_and_closes_every_room() {
    let store = Arc::new(StubStore::default());
    let registry = RoomRegistry::new(Arc::clone(&store) as Arc<dyn ProjectStore>);
    let (sender, mut receiver) = outbound_channel();
    let room = registry.attach("live", "conn-a", sender).await.expect("attach");
    room.apply_sync(&foreign_edit("f-1", "x"), "conn-a")
        .await
        .expect("apply");

    registry.shutdown_all(1012, "server shutting down").await;

    assert!(registry.is_empty());
    assert!(store.persist_count() >= 1);
    let frames = drain(&mut receiver);
    assert!(frames
        .iter()
        .any(|frame| matches!(frame, OutboundFrame::Close { code: 1012, .. })));
}
