//! In-memory `MailStore`. Backs `--dry-run` and the test suites.
//!
//! Keeps a flat folder list and a message map behind a mutex. Call counters
//! and a small amount of fault injection let tests observe exactly what the
//! pipeline asked the store to do.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::MailStoreError;
use crate::mail::{CandidateMessage, CandidateQuery, Folder, MailStore};

/// Id of the pre-created inbox folder.
pub const INBOX_ID: &str = "inbox";

/// Per-operation call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub find: usize,
    pub create: usize,
    pub fetch: usize,
    pub moves: usize,
    pub tags: usize,
}

impl StoreCalls {
    /// Calls that changed mailbox state.
    pub fn mutations(&self) -> usize {
        self.create + self.moves + self.tags
    }
}

/// How a scripted create conflict behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictScript {
    /// Another creator won the race; the folder exists after the conflict.
    ConcurrentCreate,
    /// The store reports a conflict but never shows the folder.
    Phantom,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    folder_id: String,
    message: CandidateMessage,
}

#[derive(Debug, Default)]
struct State {
    folders: Vec<Folder>,
    messages: HashMap<String, StoredMessage>,
    next_folder: usize,
    calls: StoreCalls,
    conflicts: HashMap<String, ConflictScript>,
    failing_finds: HashSet<String>,
    failing_creates: HashSet<String>,
    failing_moves: HashSet<String>,
    failing_tags: HashSet<String>,
}

impl State {
    fn new_folder_id(&mut self) -> String {
        self.next_folder += 1;
        format!("folder-{}", self.next_folder)
    }

    fn find(&self, parent_id: Option<&str>, display_name: &str) -> Option<Folder> {
        self.folders
            .iter()
            .find(|f| f.parent_id.as_deref() == parent_id && f.display_name == display_name)
            .cloned()
    }
}

/// Mailbox held entirely in memory.
#[derive(Debug)]
pub struct InMemoryMailStore {
    state: Mutex<State>,
}

impl InMemoryMailStore {
    /// Create a store with a single root-level `Inbox` folder.
    pub fn new() -> Self {
        let state = State {
            folders: vec![Folder {
                id: INBOX_ID.to_string(),
                display_name: "Inbox".to_string(),
                parent_id: None,
            }],
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock only ever happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a folder directly, bypassing counters. Returns its id.
    pub fn add_folder(&self, parent_id: Option<&str>, display_name: &str) -> String {
        let mut state = self.state();
        let id = state.new_folder_id();
        state.folders.push(Folder {
            id: id.clone(),
            display_name: display_name.to_string(),
            parent_id: parent_id.map(str::to_string),
        });
        id
    }

    /// Remove a folder, e.g. to simulate a user deleting it mid-run.
    pub fn remove_folder(&self, folder_id: &str) {
        self.state().folders.retain(|f| f.id != folder_id);
    }

    /// Put a message into a folder.
    pub fn add_message(&self, folder_id: &str, message: CandidateMessage) {
        self.state().messages.insert(
            message.id.clone(),
            StoredMessage {
                folder_id: folder_id.to_string(),
                message,
            },
        );
    }

    /// Make the next create of `display_name` fail with a conflict.
    pub fn script_conflict(&self, display_name: &str, script: ConflictScript) {
        self.state()
            .conflicts
            .insert(display_name.to_string(), script);
    }

    /// Make the next lookup of `display_name` fail with a server error.
    pub fn fail_next_find(&self, display_name: &str) {
        self.state()
            .failing_finds
            .insert(display_name.to_string());
    }

    /// Make the next create of `display_name` fail with a server error.
    pub fn fail_next_create(&self, display_name: &str) {
        self.state()
            .failing_creates
            .insert(display_name.to_string());
    }

    pub fn fail_moves_for(&self, message_id: &str) {
        self.state().failing_moves.insert(message_id.to_string());
    }

    pub fn fail_tags_for(&self, message_id: &str) {
        self.state().failing_tags.insert(message_id.to_string());
    }

    pub fn calls(&self) -> StoreCalls {
        self.state().calls
    }

    pub fn folder_of(&self, message_id: &str) -> Option<String> {
        self.state()
            .messages
            .get(message_id)
            .map(|m| m.folder_id.clone())
    }

    pub fn categories_of(&self, message_id: &str) -> BTreeSet<String> {
        self.state()
            .messages
            .get(message_id)
            .map(|m| m.message.categories.clone())
            .unwrap_or_default()
    }

    /// Folders named `display_name` under `parent_id`.
    pub fn folders_named(&self, parent_id: Option<&str>, display_name: &str) -> Vec<Folder> {
        self.state()
            .folders
            .iter()
            .filter(|f| f.parent_id.as_deref() == parent_id && f.display_name == display_name)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryMailStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailStore for InMemoryMailStore {
    async fn find_child_folder(
        &self,
        _owner_id: &str,
        parent_id: Option<&str>,
        display_name: &str,
    ) -> Result<Option<Folder>, MailStoreError> {
        let mut state = self.state();
        state.calls.find += 1;
        if state.failing_finds.remove(display_name) {
            return Err(MailStoreError::Http {
                status: 503,
                body: "injected find failure".into(),
            });
        }
        Ok(state.find(parent_id, display_name))
    }

    async fn create_child_folder(
        &self,
        _owner_id: &str,
        parent_id: Option<&str>,
        display_name: &str,
    ) -> Result<Folder, MailStoreError> {
        let mut state = self.state();
        state.calls.create += 1;

        if state.failing_creates.remove(display_name) {
            return Err(MailStoreError::Http {
                status: 500,
                body: "injected create failure".into(),
            });
        }

        if let Some(script) = state.conflicts.remove(display_name) {
            if script == ConflictScript::ConcurrentCreate {
                let id = state.new_folder_id();
                state.folders.push(Folder {
                    id,
                    display_name: display_name.to_string(),
                    parent_id: parent_id.map(str::to_string),
                });
            }
            return Err(MailStoreError::Conflict {
                name: display_name.to_string(),
            });
        }

        if state.find(parent_id, display_name).is_some() {
            return Err(MailStoreError::Conflict {
                name: display_name.to_string(),
            });
        }

        let folder = Folder {
            id: state.new_folder_id(),
            display_name: display_name.to_string(),
            parent_id: parent_id.map(str::to_string),
        };
        state.folders.push(folder.clone());
        Ok(folder)
    }

    async fn fetch_candidates(
        &self,
        _owner_id: &str,
        folder_id: &str,
        query: &CandidateQuery,
    ) -> Result<Vec<CandidateMessage>, MailStoreError> {
        let mut state = self.state();
        state.calls.fetch += 1;

        let mut found: Vec<CandidateMessage> = state
            .messages
            .values()
            .filter(|m| m.folder_id == folder_id)
            .filter(|m| !m.message.categories.contains(&query.exclude_category))
            .filter(|m| query.window.contains(m.message.received_at, query.now))
            .map(|m| m.message.clone())
            .collect();

        found.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        found.truncate(query.limit);
        Ok(found)
    }

    async fn move_message(
        &self,
        _owner_id: &str,
        message_id: &str,
        destination_folder_id: &str,
    ) -> Result<(), MailStoreError> {
        let mut state = self.state();
        state.calls.moves += 1;

        if state.failing_moves.contains(message_id) {
            return Err(MailStoreError::Http {
                status: 500,
                body: "injected move failure".into(),
            });
        }
        if !state.folders.iter().any(|f| f.id == destination_folder_id) {
            return Err(MailStoreError::NotFound(format!(
                "folder {destination_folder_id}"
            )));
        }

        let stored = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| MailStoreError::NotFound(format!("message {message_id}")))?;
        stored.folder_id = destination_folder_id.to_string();
        Ok(())
    }

    async fn add_categories(
        &self,
        _owner_id: &str,
        message_id: &str,
        categories: &BTreeSet<String>,
    ) -> Result<(), MailStoreError> {
        let mut state = self.state();
        state.calls.tags += 1;

        if state.failing_tags.contains(message_id) {
            return Err(MailStoreError::Http {
                status: 503,
                body: "injected tag failure".into(),
            });
        }

        let stored = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| MailStoreError::NotFound(format!("message {message_id}")))?;
        stored.message.categories.extend(categories.iter().cloned());
        Ok(())
    }
}
