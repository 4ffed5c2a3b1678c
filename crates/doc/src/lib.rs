#![forbid(unsafe_code)]

//! The shared project document: a `yrs` doc with the named containers the
//! clients collaborate on, plus the read/write surface the server needs
//! (snapshot encode, apply-with-origin, update observer, persist projection).

mod tree;

pub use tree::sanitize_segment;
pub use yrs::{Origin, Subscription};

use std::collections::BTreeMap;

use yrs::updates::decoder::Decode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector,
    TextPrelim, Transact, Update,
};

pub const FILES: &str = "editor:files";
pub const TREE_NODES: &str = "file-tree:nodes";
pub const TREE_ROOTS: &str = "file-tree:roots";
pub const SUGGESTIONS: &str = "editor:suggestions";
pub const COMMENTS: &str = "editor:comments";
pub const CONTRIB_CHARS: &str = "editor:contrib:chars";

#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("malformed document update: {0}")]
    MalformedUpdate(String),
}

/// One file as it leaves or enters the document. `path` is derived from the
/// file tree on the way out and ignored on the way in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub id: String,
    pub path: String,
    pub content: String,
}

/// The persisted projection of one suggestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestionState {
    pub id: String,
    pub file_id: String,
    pub author_id: String,
    pub text: String,
    pub votes: BTreeMap<String, i64>,
}

/// Everything a persist flush writes to the store.
#[derive(Debug, Clone, Default)]
pub struct DocSnapshot {
    pub files: Vec<FileState>,
    pub suggestions: Vec<SuggestionState>,
}

pub struct ProjectDoc {
    doc: Doc,
    files: MapRef,
    tree_nodes: MapRef,
    tree_roots: ArrayRef,
    suggestions: MapRef,
}

impl Default for ProjectDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectDoc {
    #[must_use]
    pub fn new() -> Self {
        let doc = Doc::new();
        let files = doc.get_or_insert_map(FILES);
        let tree_nodes = doc.get_or_insert_map(TREE_NODES);
        let tree_roots = doc.get_or_insert_array(TREE_ROOTS);
        let suggestions = doc.get_or_insert_map(SUGGESTIONS);
        // Client-maintained containers; instantiated up front so every root
        // type is part of the initial snapshot.
        doc.get_or_insert_map(COMMENTS);
        doc.get_or_insert_map(CONTRIB_CHARS);
        Self {
            doc,
            files,
            tree_nodes,
            tree_roots,
            suggestions,
        }
    }

    /// Full state as a single update, sent as the initial SYNC frame.
    #[must_use]
    pub fn encode_full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Applies a client update. The origin tags the transaction so the
    /// update observer can exclude the sending socket from the re-broadcast.
    pub fn apply_update(&self, update: &[u8], origin: Option<&str>) -> Result<(), DocError> {
        let update =
            Update::decode_v1(update).map_err(|error| DocError::MalformedUpdate(error.to_string()))?;
        let mut txn = match origin {
            Some(origin) => self.doc.transact_mut_with(origin),
            None => self.doc.transact_mut(),
        };
        txn.apply_update(update)
            .map_err(|error| DocError::MalformedUpdate(error.to_string()))
    }

    /// Registers an observer invoked synchronously after every committed
    /// transaction with the encoded update and its origin tag.
    pub fn observe_updates<F>(&self, callback: F) -> Result<Subscription, DocError>
    where
        F: Fn(Vec<u8>, Option<Origin>) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                callback(event.update.clone(), txn.origin().cloned());
            })
            .map_err(|error| DocError::MalformedUpdate(error.to_string()))
    }

    /// Rebuilds the shared containers from persisted state in one
    /// transaction. Only used while the document is freshly created.
    pub fn seed(&self, files: &[FileState], suggestions: &[SuggestionState]) {
        let mut txn = self.doc.transact_mut();
        for file in files {
            self.files
                .insert(&mut txn, file.id.as_str(), TextPrelim::new(file.content.as_str()));
        }
        for suggestion in suggestions {
            let entry: MapRef =
                self.suggestions
                    .insert(&mut txn, suggestion.id.as_str(), MapPrelim::default());
            entry.insert(&mut txn, "fileId", suggestion.file_id.as_str());
            entry.insert(&mut txn, "authorId", suggestion.author_id.as_str());
            entry.insert(&mut txn, "text", suggestion.text.as_str());
            let votes: MapRef = entry.insert(&mut txn, "votes", MapPrelim::default());
            for (user_id, count) in &suggestion.votes {
                votes.insert(&mut txn, user_id.as_str(), *count);
            }
        }
    }

    /// Current file-id → content mapping.
    #[must_use]
    pub fn file_contents(&self) -> BTreeMap<String, String> {
        let txn = self.doc.transact();
        let mut contents = BTreeMap::new();
        for (file_id, value) in self.files.iter(&txn) {
            if let Out::YText(text) = value {
                contents.insert(file_id.to_string(), text.get_string(&txn));
            }
        }
        contents
    }

    /// Derives the persisted path for one file from the tree, if the file
    /// participates in it.
    #[must_use]
    pub fn file_path(&self, file_id: &str) -> Option<String> {
        let txn = self.doc.transact();
        tree::file_path(&txn, &self.tree_nodes, file_id)
    }

    /// Files and suggestions as the store should see them. Files outside
    /// the tree (or inside a cyclic tree) fall back to
    /// `files/<sanitized id>.txt`.
    #[must_use]
    pub fn persist_snapshot(&self) -> DocSnapshot {
        let txn = self.doc.transact();

        let mut files = Vec::new();
        for (file_id, value) in self.files.iter(&txn) {
            let Out::YText(text) = value else { continue };
            let id = file_id.to_string();
            let path = tree::file_path(&txn, &self.tree_nodes, &id)
                .unwrap_or_else(|| tree::fallback_path(&id));
            files.push(FileState {
                content: text.get_string(&txn),
                id,
                path,
            });
        }

        let mut suggestions = Vec::new();
        for (suggestion_id, value) in self.suggestions.iter(&txn) {
            let Out::YMap(entry) = value else { continue };
            let mut votes = BTreeMap::new();
            if let Some(Out::YMap(vote_map)) = entry.get(&txn, "votes") {
                for (user_id, count) in vote_map.iter(&txn) {
                    if let Some(count) = any_int(&count) {
                        votes.insert(user_id.to_string(), count);
                    }
                }
            }
            suggestions.push(SuggestionState {
                id: suggestion_id.to_string(),
                file_id: read_string(&txn, &entry, "fileId").unwrap_or_default(),
                author_id: read_string(&txn, &entry, "authorId").unwrap_or_default(),
                text: read_string(&txn, &entry, "text").unwrap_or_default(),
                votes,
            });
        }

        DocSnapshot { files, suggestions }
    }

    #[must_use]
    pub fn has_suggestion(&self, suggestion_id: &str) -> bool {
        let txn = self.doc.transact();
        matches!(self.suggestions.get(&txn, suggestion_id), Some(Out::YMap(_)))
    }

    /// Marks a suggestion approved in a single transaction. Returns `false`
    /// when the suggestion id is absent.
    pub fn approve_suggestion(
        &self,
        suggestion_id: &str,
        approved_by: &str,
        approved_at: &str,
    ) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some(Out::YMap(entry)) = self.suggestions.get(&txn, suggestion_id) else {
            return false;
        };
        entry.insert(&mut txn, "approved", true);
        entry.insert(&mut txn, "approvedBy", approved_by);
        entry.insert(&mut txn, "approvedAt", approved_at);
        true
    }

    /// Approval fields of a suggestion, for assertions and exports.
    #[must_use]
    pub fn suggestion_approval(&self, suggestion_id: &str) -> Option<(String, String)> {
        let txn = self.doc.transact();
        let Some(Out::YMap(entry)) = self.suggestions.get(&txn, suggestion_id) else {
            return None;
        };
        let approved = matches!(
            entry.get(&txn, "approved"),
            Some(Out::Any(Any::Bool(true)))
        );
        if !approved {
            return None;
        }
        let by = read_string(&txn, &entry, "approvedBy")?;
        let at = read_string(&txn, &entry, "approvedAt")?;
        Some((by, at))
    }

    // Mutators used by seeding, demos and tests. Production edits arrive as
    // opaque client updates instead.

    pub fn insert_file(&self, file_id: &str, content: &str) {
        let mut txn = self.doc.transact_mut();
        self.files
            .insert(&mut txn, file_id, TextPrelim::new(content));
    }

    pub fn insert_tree_node(
        &self,
        node_id: &str,
        name: &str,
        kind: &str,
        parent_id: Option<&str>,
    ) {
        let mut txn = self.doc.transact_mut();
        let node: MapRef = self
            .tree_nodes
            .insert(&mut txn, node_id, MapPrelim::default());
        node.insert(&mut txn, "name", name);
        node.insert(&mut txn, "kind", kind);
        match parent_id {
            Some(parent_id) => {
                node.insert(&mut txn, "parentId", parent_id);
            }
            None => {
                node.insert(&mut txn, "parentId", Any::Null);
                self.tree_roots.push_back(&mut txn, node_id);
            }
        }
    }

    pub fn set_tree_parent(&self, node_id: &str, parent_id: Option<&str>) {
        let mut txn = self.doc.transact_mut();
        let Some(Out::YMap(node)) = self.tree_nodes.get(&txn, node_id) else {
            return;
        };
        match parent_id {
            Some(parent_id) => {
                node.insert(&mut txn, "parentId", parent_id);
            }
            None => {
                node.insert(&mut txn, "parentId", Any::Null);
            }
        }
    }

    pub fn insert_suggestion(&self, suggestion: &SuggestionState) {
        self.seed(&[], std::slice::from_ref(suggestion));
    }
}

fn read_string<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<String> {
    match map.get(txn, key)? {
        Out::Any(Any::String(value)) => Some(value.to_string()),
        _ => None,
    }
}

fn any_int(value: &Out) -> Option<i64> {
    match value {
        Out::Any(Any::Number(number)) => Some(*number as i64),
        Out::Any(Any::BigInt(number)) => Some(*number),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suggestion(id: &str, file_id: &str) -> SuggestionState {
        SuggestionState {
            id: id.to_owned(),
            file_id: file_id.to_owned(),
            author_id: "u-author".to_owned(),
            text: "use a builder here".to_owned(),
            votes: BTreeMap::from([("u-1".to_owned(), 1_i64)]),
        }
    }

    #[test]
    fn seed_restores_files_and_suggestions() {
        let doc = ProjectDoc::new();
        doc.seed(
            &[
                FileState {
                    id: "f-1".to_owned(),
                    path: String::new(),
                    content: "fn main() {}".to_owned(),
                },
                FileState {
                    id: "f-2".to_owned(),
                    path: String::new(),
                    content: String::new(),
                },
            ],
            &[suggestion("s-1", "f-1")],
        );

        let contents = doc.file_contents();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents["f-1"], "fn main() {}");

        let snapshot = doc.persist_snapshot();
        assert_eq!(snapshot.suggestions.len(), 1);
        assert_eq!(snapshot.suggestions[0], suggestion("s-1", "f-1"));
    }

    #[test]
    fn full_state_transfers_between_documents() {
        let source = ProjectDoc::new();
        source.insert_file("f-1", "hello");

        let replica = ProjectDoc::new();
        replica
            .apply_update(&source.encode_full_state(), None)
            .expect("apply");
        assert_eq!(replica.file_contents()["f-1"], "hello");
    }

    #[test]
    fn apply_update_rejects_garbage() {
        let doc = ProjectDoc::new();
        assert!(doc.apply_update(&[0xFF, 0x00, 0x13], None).is_err());
    }

    #[test]
    fn observer_reports_update_and_origin() {
        use std::sync::{Arc, Mutex};

        let doc = ProjectDoc::new();
        let seen: Arc<Mutex<Vec<Option<Origin>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = doc
            .observe_updates(move |update, origin| {
                assert!(!update.is_empty());
                sink.lock().expect("lock").push(origin);
            })
            .expect("observe");

        let other = ProjectDoc::new();
        other.insert_file("f-1", "payload");
        doc.apply_update(&other.encode_full_state(), Some("conn-9"))
            .expect("apply");

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], Some(Origin::from("conn-9")));
    }

    #[test]
    fn persist_snapshot_derives_tree_paths() {
        let doc = ProjectDoc::new();
        doc.insert_tree_node("root", "src", "folder", None);
        doc.insert_tree_node("f-1", "main.rs", "file", Some("root"));
        doc.insert_file("f-1", "fn main() {}");
        doc.insert_file("f-stray", "no tree entry");

        let snapshot = doc.persist_snapshot();
        let by_id: BTreeMap<_, _> = snapshot
            .files
            .iter()
            .map(|file| (file.id.as_str(), file.path.as_str()))
            .collect();
        assert_eq!(by_id["f-1"], "src/main.rs");
        assert_eq!(by_id["f-stray"], "files/f-stray.txt");
    }

    #[test]
    fn approve_suggestion_sets_fields_once() {
        let doc = ProjectDoc::new();
        doc.seed(&[], &[suggestion("s-1", "f-1")]);

        assert!(!doc.approve_suggestion("missing", "u-admin", "2026-01-01T00:00:00Z"));
        assert!(doc.approve_suggestion("s-1", "u-admin", "2026-01-01T00:00:00Z"));
        assert_eq!(
            doc.suggestion_approval("s-1"),
            Some(("u-admin".to_owned(), "2026-01-01T00:00:00Z".to_owned()))
        );
        assert_eq!(doc.suggestion_approval("missing"), None);
    }

    #[test]
    fn has_suggestion_matches_container_contents() {
        let doc = ProjectDoc::new();
        assert!(!doc.has_suggestion("s-1"));
        doc.seed(&[], &[suggestion("s-1", "f-1")]);
        assert!(doc.has_suggestion("s-1"));
    }
}
