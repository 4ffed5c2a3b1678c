use std::collections::HashMap;

use async_trait::async_trait;
use coderoom_core::Role;
use coderoom_doc::{DocSnapshot, FileState, SuggestionState};
use futures_util::TryStreamExt;
use mongodb::bson::{doc, DateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, Database};
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use uuid::Uuid;

use crate::{ProjectState, ProjectStore, StorageError, UserProfile};

const USERS: &str = "users";
const PROJECTS: &str = "projects";
const FILES: &str = "files";
const SUGGESTIONS: &str = "suggestions";

const DUPLICATE_KEY: i32 = 11000;

/// MongoDB-backed [`ProjectStore`]. Without a configured URI (or after a
/// failed first connect) every call is a no-op and logins are served from an
/// in-process directory so the server stays usable in ephemeral mode.
pub struct MongoGateway {
    uri: Option<String>,
    connection: OnceCell<Option<Database>>,
    ephemeral_users: RwLock<HashMap<String, UserProfile>>,
}

impl MongoGateway {
    #[must_use]
    pub fn new(uri: Option<String>) -> Self {
        Self {
            uri,
            connection: OnceCell::new(),
            ephemeral_users: RwLock::new(HashMap::new()),
        }
    }

    async fn database(&self) -> Option<&Database> {
        self.connection
            .get_or_init(|| async {
                let uri = self.uri.as_deref()?;
                let client = match Client::with_uri_str(uri).await {
                    Ok(client) => client,
                    Err(error) => {
                        tracing::warn!(%error, "store connect failed, running ephemeral");
                        return None;
                    }
                };
                let database = client
                    .default_database()
                    .unwrap_or_else(|| client.database("coderoom"));
                if let Err(error) = database.run_command(doc! { "ping": 1 }).await {
                    tracing::warn!(%error, "store ping failed, running ephemeral");
                    return None;
                }
                tracing::info!(db = %database.name(), "store connected");
                Some(database)
            })
            .await
            .as_ref()
    }

    async fn load_inner(
        &self,
        database: &Database,
        room_id: &str,
    ) -> Result<ProjectState, StorageError> {
        let projects = database.collection::<ProjectRecord>(PROJECTS);
        let now = DateTime::now();
        projects
            .update_one(
                doc! { "_id": room_id },
                doc! {
                    "$setOnInsert": { "name": room_id, "createdAt": now, "permissions": {} },
                    "$set": { "updatedAt": now },
                },
            )
            .upsert(true)
            .await
            .map_err(db_error)?;

        let record = projects
            .find_one(doc! { "_id": room_id })
            .await
            .map_err(db_error)?;
        let permissions = record
            .map(|record| {
                record
                    .permissions
                    .iter()
                    .filter_map(|(user_id, role)| {
                        role.parse::<Role>().ok().map(|role| (user_id.clone(), role))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut files = Vec::new();
        let mut cursor = database
            .collection::<FileRecord>(FILES)
            .find(doc! { "projectId": room_id })
            .await
            .map_err(db_error)?;
        while let Some(file) = cursor.try_next().await.map_err(db_error)? {
            files.push(FileState {
                id: file.id,
                path: file.path,
                content: file.content,
            });
        }

        let mut suggestions = Vec::new();
        let mut cursor = database
            .collection::<SuggestionRecord>(SUGGESTIONS)
            .find(doc! { "projectId": room_id })
            .await
            .map_err(db_error)?;
        while let Some(suggestion) = cursor.try_next().await.map_err(db_error)? {
            suggestions.push(SuggestionState {
                id: suggestion.id,
                file_id: suggestion.file_id,
                author_id: suggestion.creator_id,
                text: suggestion.text,
                votes: suggestion.votes.into_iter().collect(),
            });
        }

        Ok(ProjectState {
            permissions,
            files,
            suggestions,
        })
    }

    async fn persist_inner(
        &self,
        database: &Database,
        room_id: &str,
        snapshot: &DocSnapshot,
    ) -> Result<(), StorageError> {
        let files = database.collection::<FileRecord>(FILES);
        let mut kept_file_ids = Vec::with_capacity(snapshot.files.len());
        for file in &snapshot.files {
            let record = FileRecord {
                id: file.id.clone(),
                project_id: room_id.to_owned(),
                path: file.path.clone(),
                content: file.content.clone(),
            };
            files
                .replace_one(doc! { "_id": &file.id }, &record)
                .upsert(true)
                .await
                .map_err(db_error)?;
            kept_file_ids.push(file.id.clone());
        }
        files
            .delete_many(doc! { "projectId": room_id, "_id": { "$nin": kept_file_ids } })
            .await
            .map_err(db_error)?;

        let suggestions = database.collection::<SuggestionRecord>(SUGGESTIONS);
        let mut kept_suggestion_ids = Vec::with_capacity(snapshot.suggestions.len());
        for suggestion in &snapshot.suggestions {
            let record = SuggestionRecord {
                id: suggestion.id.clone(),
                project_id: room_id.to_owned(),
                file_id: suggestion.file_id.clone(),
                creator_id: suggestion.author_id.clone(),
                text: suggestion.text.clone(),
                votes: suggestion.votes.clone().into_iter().collect(),
            };
            suggestions
                .replace_one(doc! { "_id": &suggestion.id }, &record)
                .upsert(true)
                .await
                .map_err(db_error)?;
            kept_suggestion_ids.push(suggestion.id.clone());
        }
        suggestions
            .delete_many(doc! { "projectId": room_id, "_id": { "$nin": kept_suggestion_ids } })
            .await
            .map_err(db_error)?;

        database
            .collection::<ProjectRecord>(PROJECTS)
            .update_one(
                doc! { "_id": room_id },
                doc! { "$set": { "updatedAt": DateTime::now() } },
            )
            .await
            .map_err(db_error)?;

        Ok(())
    }

    async fn login_ephemeral(&self, username: &str) -> UserProfile {
        let mut users = self.ephemeral_users.write().await;
        if let Some(profile) = users.get(username) {
            return profile.clone();
        }

        let has_admin = users.values().any(|profile| profile.role == Role::Admin);
        let profile = UserProfile {
            user_id: Uuid::new_v4().to_string(),
            username: username.to_owned(),
            avatar: None,
            role: if has_admin { Role::Editor } else { Role::Admin },
        };
        users.insert(username.to_owned(), profile.clone());
        profile
    }

    async fn login_stored(
        &self,
        database: &Database,
        username: &str,
    ) -> Result<UserProfile, StorageError> {
        let users = database.collection::<UserRecord>(USERS);
        if let Some(record) = users
            .find_one(doc! { "username": username })
            .await
            .map_err(db_error)?
        {
            return Ok(record.into_profile());
        }

        let has_admin = users
            .find_one(doc! { "role": Role::Admin.as_str() })
            .await
            .map_err(db_error)?
            .is_some();
        let role = if has_admin { Role::Editor } else { Role::Admin };
        let record = UserRecord {
            id: Uuid::new_v4().to_string(),
            username: username.to_owned(),
            avatar: None,
            join_date: DateTime::now(),
            role: role.as_str().to_owned(),
        };

        match users.insert_one(&record).await {
            Ok(_) => Ok(record.into_profile()),
            // Lost a concurrent first-login race; the winner's record stands.
            Err(error) if is_duplicate_key(&error) => users
                .find_one(doc! { "username": username })
                .await
                .map_err(db_error)?
                .map(UserRecord::into_profile)
                .ok_or(StorageError::Unavailable),
            Err(error) => Err(db_error(error)),
        }
    }
}

#[async_trait]
impl ProjectStore for MongoGateway {
    async fn ensure_connection(&self) -> bool {
        self.database().await.is_some()
    }

    async fn load_project_state(&self, room_id: &str) -> ProjectState {
        let Some(database) = self.database().await else {
            return ProjectState::default();
        };
        match self.load_inner(database, room_id).await {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(room = room_id, %error, "project load failed, starting empty");
                ProjectState::default()
            }
        }
    }

    async fn persist_project_state(
        &self,
        room_id: &str,
        snapshot: &DocSnapshot,
    ) -> Result<(), StorageError> {
        let Some(database) = self.database().await else {
            return Ok(());
        };
        self.persist_inner(database, room_id, snapshot).await
    }

    async fn set_project_permission(
        &self,
        room_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<(), StorageError> {
        let Some(database) = self.database().await else {
            return Ok(());
        };

        let mut set = Document::new();
        set.insert(format!("permissions.{user_id}"), role.as_str());
        set.insert("updatedAt", DateTime::now());
        database
            .collection::<ProjectRecord>(PROJECTS)
            .update_one(
                doc! { "_id": room_id },
                doc! {
                    "$setOnInsert": { "name": room_id, "createdAt": DateTime::now() },
                    "$set": set,
                },
            )
            .upsert(true)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn login_user(&self, username: &str) -> Result<UserProfile, StorageError> {
        match self.database().await {
            Some(database) => self.login_stored(database, username).await,
            None => Ok(self.login_ephemeral(username).await),
        }
    }
}

fn db_error(error: mongodb::error::Error) -> StorageError {
    StorageError::Database(error.to_string())
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    matches!(
        error.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DUPLICATE_KEY
    )
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRecord {
    #[serde(rename = "_id")]
    id: String,
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    avatar: Option<String>,
    #[serde(rename = "joinDate")]
    join_date: DateTime,
    role: String,
}

impl UserRecord {
    fn into_profile(self) -> UserProfile {
        UserProfile {
            role: self.role.parse().unwrap_or_default(),
            user_id: self.id,
            username: self.username,
            avatar: self.avatar,
        }
    }
}

/// Read-side projection of the project record; writes go through `$set`
/// documents so the stored shape (name, createdAt, updatedAt, permissions)
/// never round-trips through Rust.
#[derive(Debug, Deserialize)]
struct ProjectRecord {
    #[serde(default)]
    permissions: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "projectId")]
    project_id: String,
    path: String,
    content: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SuggestionRecord {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "projectId")]
    project_id: String,
    #[serde(rename = "fileId")]
    file_id: String,
    #[serde(rename = "creatorId")]
    creator_id: String,
    text: String,
    #[serde(default)]
    votes: HashMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_gateway() -> MongoGateway {
        MongoGateway::new(None)
    }

    #[tokio::test]
    async fn unconfigured_store_reports_unavailable_forever() {
        let gateway = ephemeral_gateway();
        assert!(!gateway.ensure_connection().await);
        assert!(!gateway.ensure_connection().await);
    }

    #[tokio::test]
    async fn ephemeral_load_returns_empty_state() {
        let gateway = ephemeral_gateway();
        let state = gateway.load_project_state("room-1").await;
        assert!(state.permissions.is_empty());
        assert!(state.files.is_empty());
        assert!(state.suggestions.is_empty());
    }

    #[tokio::test]
    async fn ephemeral_persist_and_permission_are_noops() {
        let gateway = ephemeral_gateway();
        gateway
            .persist_project_state("room-1", &DocSnapshot::default())
            .await
            .expect("persist no-op");
        gateway
            .set_project_permission("room-1", "u-1", Role::Admin)
            .await
            .expect("permission no-op");
    }

    #[tokio::test]
    async fn first_ephemeral_login_becomes_admin() {
        let gateway = ephemeral_gateway();
        let first = gateway.login_user("alice").await.expect("login");
        assert_eq!(first.role, Role::Admin);

        let second = gateway.login_user("bob").await.expect("login");
        assert_eq!(second.role, Role::Editor);
        assert_ne!(first.user_id, second.user_id);
    }

    #[tokio::test]
    async fn repeated_ephemeral_login_is_stable() {
        let gateway = ephemeral_gateway();
        let first = gateway.login_user("alice").await.expect("login");
        let again = gateway.login_user("alice").await.expect("login");
        assert_eq!(first, again);
    }
}
