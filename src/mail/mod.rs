//! Mailbox domain types and the `MailStore` collaborator trait.
//!
//! The triage pipeline never mutates a fetched `CandidateMessage`; it only
//! issues commands against the store by message id.

pub mod graph;
pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailStoreError;

pub use graph::{GraphConfig, GraphMailStore};
pub use memory::InMemoryMailStore;

/// Category that marks a message as already triaged. Messages carrying it
/// are excluded from every future fetch.
pub const REVIEW_CATEGORY: &str = "✓ AI";

/// A mailbox folder as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub display_name: String,
    /// `None` for folders directly under the mailbox root.
    pub parent_id: Option<String>,
}

/// Format of a message body as delivered by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Text,
    Html,
}

/// A mailbox item fetched for triage in the current cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateMessage {
    pub id: String,
    /// Sender email address.
    pub sender: String,
    pub subject: String,
    pub body_preview: String,
    pub body: String,
    #[serde(default)]
    pub body_format: BodyFormat,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    #[serde(default)]
    pub categories: BTreeSet<String>,
}

impl CandidateMessage {
    /// Whether the message carries an id the store can act on.
    pub fn has_usable_id(&self) -> bool {
        !self.id.trim().is_empty()
    }
}

/// Age range a message's receipt time must fall within to be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityWindow {
    pub min_age: TimeDelta,
    pub max_age: TimeDelta,
}

impl EligibilityWindow {
    pub fn new(min_age: TimeDelta, max_age: TimeDelta) -> Self {
        Self { min_age, max_age }
    }

    /// A window is usable only when `min_age < max_age`.
    pub fn is_valid(&self) -> bool {
        self.min_age < self.max_age
    }

    /// Receipt-time bounds `(oldest, newest)` relative to `now`, or `None`
    /// when the window is misconfigured and matches nothing.
    pub fn bounds(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.is_valid() {
            return None;
        }
        Some((now - self.max_age, now - self.min_age))
    }

    /// `min_age <= now - received_at <= max_age`.
    pub fn contains(&self, received_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if !self.is_valid() {
            return false;
        }
        let age = now - received_at;
        age >= self.min_age && age <= self.max_age
    }
}

/// Filter for a candidate fetch.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    /// Messages already carrying this category are skipped.
    pub exclude_category: String,
    pub window: EligibilityWindow,
    pub limit: usize,
    /// Reference time for the window. Taken once per cycle.
    pub now: DateTime<Utc>,
}

/// Mailbox operations consumed by the triage core.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Find a direct child of `parent_id` (`None` = mailbox root) whose display
    /// name matches exactly.
    async fn find_child_folder(
        &self,
        owner_id: &str,
        parent_id: Option<&str>,
        display_name: &str,
    ) -> Result<Option<Folder>, MailStoreError>;

    /// Create a child folder. Fails with `MailStoreError::Conflict` when the
    /// name is already taken under that parent.
    async fn create_child_folder(
        &self,
        owner_id: &str,
        parent_id: Option<&str>,
        display_name: &str,
    ) -> Result<Folder, MailStoreError>;

    /// Eligible messages in `folder_id`, newest received first.
    async fn fetch_candidates(
        &self,
        owner_id: &str,
        folder_id: &str,
        query: &CandidateQuery,
    ) -> Result<Vec<CandidateMessage>, MailStoreError>;

    async fn move_message(
        &self,
        owner_id: &str,
        message_id: &str,
        destination_folder_id: &str,
    ) -> Result<(), MailStoreError>;

    /// Add categories to a message, merging with the ones already present.
    async fn add_categories(
        &self,
        owner_id: &str,
        message_id: &str,
        categories: &BTreeSet<String>,
    ) -> Result<(), MailStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(min_minutes: i64, max_minutes: i64) -> EligibilityWindow {
        EligibilityWindow::new(
            TimeDelta::minutes(min_minutes),
            TimeDelta::minutes(max_minutes),
        )
    }

    #[test]
    fn too_recent_message_is_excluded() {
        let now = Utc::now();
        let w = window(5, 24 * 60);
        assert!(!w.contains(now - TimeDelta::minutes(2), now));
    }

    #[test]
    fn too_old_message_is_excluded() {
        let now = Utc::now();
        let w = window(5, 24 * 60);
        assert!(!w.contains(now - TimeDelta::days(2), now));
    }

    #[test]
    fn message_inside_window_is_included() {
        let now = Utc::now();
        let w = window(5, 24 * 60);
        assert!(w.contains(now - TimeDelta::minutes(10), now));
    }

    #[test]
    fn window_edges_are_inclusive() {
        let now = Utc::now();
        let w = window(5, 60);
        assert!(w.contains(now - TimeDelta::minutes(5), now));
        assert!(w.contains(now - TimeDelta::minutes(60), now));
    }

    #[test]
    fn inverted_window_matches_nothing() {
        let now = Utc::now();
        let w = window(60, 5);
        assert!(!w.is_valid());
        assert!(w.bounds(now).is_none());
        assert!(!w.contains(now - TimeDelta::minutes(30), now));
    }

    #[test]
    fn bounds_are_oldest_then_newest() {
        let now = Utc::now();
        let (oldest, newest) = window(5, 60).bounds(now).unwrap();
        assert_eq!(oldest, now - TimeDelta::minutes(60));
        assert_eq!(newest, now - TimeDelta::minutes(5));
    }

    #[test]
    fn blank_id_is_not_usable() {
        let msg = CandidateMessage {
            id: "  ".into(),
            sender: "a@b.com".into(),
            subject: String::new(),
            body_preview: String::new(),
            body: String::new(),
            body_format: BodyFormat::Text,
            received_at: Utc::now(),
            is_read: false,
            categories: BTreeSet::new(),
        };
        assert!(!msg.has_usable_id());
    }
}
