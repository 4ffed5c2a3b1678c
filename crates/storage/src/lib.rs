#![forbid(unsafe_code)]

//! Persistence gateway to the external document store.
//!
//! All operations are safe to call without a configured store: they degrade
//! to no-ops while the rest of the server keeps running in ephemeral mode.
//! While a room is live the CRDT document is the source of truth; the store
//! records mirror it.

mod mongo;

pub use mongo::MongoGateway;

use std::collections::HashMap;

use async_trait::async_trait;
use coderoom_core::Role;
use coderoom_doc::{DocSnapshot, FileState, SuggestionState};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("store unavailable")]
    Unavailable,
    #[error("database error: {0}")]
    Database(String),
}

/// A registered user as the login endpoint sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    pub avatar: Option<String>,
    pub role: Role,
}

/// Everything a fresh room needs from the store.
#[derive(Debug, Clone, Default)]
pub struct ProjectState {
    pub permissions: HashMap<String, Role>,
    pub files: Vec<FileState>,
    pub suggestions: Vec<SuggestionState>,
}

/// Seam between room lifecycle / REST handlers and the concrete store.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Establishes (and caches) the store connection. `false` means the
    /// process runs ephemeral for its lifetime.
    async fn ensure_connection(&self) -> bool;

    /// Upserts the project record and reads its files, suggestions and
    /// permissions. Store failures degrade to an empty state.
    async fn load_project_state(&self, room_id: &str) -> ProjectState;

    /// Writes the snapshot back, upserting records by id and deleting
    /// store-side records absent from the snapshot.
    async fn persist_project_state(
        &self,
        room_id: &str,
        snapshot: &DocSnapshot,
    ) -> Result<(), StorageError>;

    /// Sets one entry of the project's permission map.
    async fn set_project_permission(
        &self,
        room_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<(), StorageError>;

    /// Upserts a user by unique username. The first user becomes admin when
    /// no admin exists yet; later users default to editor.
    async fn login_user(&self, username: &str) -> Result<UserProfile, StorageError>;
}
