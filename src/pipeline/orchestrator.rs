//! One triage cycle: fetch → classify → tag.
//!
//! Two isolation boundaries: a failing message never aborts the cycle, and a
//! failing cycle never escapes `run_cycle` except as cancellation. Anything
//! left untagged is simply fetched again next cycle.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::TriageError;
use crate::folders::FolderPathResolver;
use crate::mail::{CandidateMessage, CandidateQuery, EligibilityWindow, MailStore, REVIEW_CATEGORY};
use crate::pipeline::gateway::{ClassificationDecision, ClassificationGateway};

/// What a cycle works on.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub owner_id: String,
    pub source_folder: String,
    pub window: EligibilityWindow,
    pub max_emails_per_run: usize,
}

/// Counts from one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub moved: usize,
    pub no_action: usize,
    pub errors: usize,
    pub skipped: usize,
    pub tagged: usize,
}

/// Drives a single triage cycle.
pub struct TriageOrchestrator {
    store: Arc<dyn MailStore>,
    resolver: Arc<FolderPathResolver>,
    gateway: Arc<ClassificationGateway>,
    settings: CycleSettings,
}

impl std::fmt::Debug for TriageOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriageOrchestrator").finish_non_exhaustive()
    }
}

impl TriageOrchestrator {
    pub fn new(
        store: Arc<dyn MailStore>,
        resolver: Arc<FolderPathResolver>,
        gateway: Arc<ClassificationGateway>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            store,
            resolver,
            gateway,
            settings,
        }
    }

    /// Run one cycle. Only cancellation is reported as an error.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, TriageError> {
        let span = info_span!(
            "cycle",
            cycle_id = %Uuid::new_v4(),
            owner = %self.settings.owner_id
        );
        async {
            let report = self.cycle(cancel).await?;
            info!(
                fetched = report.fetched,
                moved = report.moved,
                no_action = report.no_action,
                errors = report.errors,
                skipped = report.skipped,
                tagged = report.tagged,
                "Cycle complete"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, TriageError> {
        let mut report = CycleReport::default();
        let owner = self.settings.owner_id.as_str();

        if cancel.is_cancelled() {
            return Err(TriageError::Cancelled);
        }
        if !self.settings.window.is_valid() {
            warn!(
                min_age = %self.settings.window.min_age,
                max_age = %self.settings.window.max_age,
                "Eligibility window is empty (min_age >= max_age), nothing to fetch"
            );
            return Ok(report);
        }

        let candidates = match self.fetch(cancel).await {
            Ok(candidates) => candidates,
            Err(TriageError::Cancelled) => return Err(TriageError::Cancelled),
            Err(e) => {
                error!(
                    folder_path = %self.settings.source_folder,
                    error = %e,
                    "Cycle fetch failed"
                );
                return Ok(report);
            }
        };

        report.fetched = candidates.len();
        if candidates.is_empty() {
            debug!("No candidate messages");
            return Ok(report);
        }
        info!(count = candidates.len(), "Processing candidate messages");

        for message in &candidates {
            if cancel.is_cancelled() {
                return Err(TriageError::Cancelled);
            }
            if !message.has_usable_id() {
                warn!(subject = %message.subject, "Skipping message without an id");
                report.skipped += 1;
                continue;
            }
            self.process_message(owner, message, cancel, &mut report)
                .await?;
        }

        Ok(report)
    }

    /// The source folder is only looked up; a missing one fails the fetch.
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<CandidateMessage>, TriageError> {
        let owner = self.settings.owner_id.as_str();
        let source_id = cancel
            .run_until_cancelled(self.resolver.lookup(owner, &self.settings.source_folder))
            .await
            .ok_or(TriageError::Cancelled)??;

        let query = CandidateQuery {
            exclude_category: REVIEW_CATEGORY.to_string(),
            window: self.settings.window,
            limit: self.settings.max_emails_per_run,
            now: Utc::now(),
        };
        cancel
            .run_until_cancelled(self.store.fetch_candidates(owner, &source_id, &query))
            .await
            .ok_or(TriageError::Cancelled)?
            .map_err(TriageError::Fetch)
    }

    /// Classify and tag one message. Failures are logged and counted; only
    /// cancellation is returned.
    async fn process_message(
        &self,
        owner: &str,
        message: &CandidateMessage,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<(), TriageError> {
        let decision = match self.gateway.classify(message, cancel).await {
            Ok(decision) => decision,
            Err(TriageError::Cancelled) => {
                warn!(message_id = %message.id, "Classification cancelled");
                return Err(TriageError::Cancelled);
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Classification failed");
                report.errors += 1;
                return Ok(());
            }
        };

        match &decision {
            ClassificationDecision::MoveToFolder { folder_path, explanation } => {
                report.moved += 1;
                info!(
                    message_id = %message.id,
                    decision = decision.label(),
                    folder_path = %folder_path,
                    explanation = %explanation,
                    "Message classified"
                );
            }
            ClassificationDecision::NoAction { explanation } => {
                report.no_action += 1;
                info!(
                    message_id = %message.id,
                    decision = decision.label(),
                    explanation = %explanation,
                    "Message classified"
                );
            }
            ClassificationDecision::ClassifierError { message: reason } => {
                report.errors += 1;
                warn!(
                    message_id = %message.id,
                    decision = decision.label(),
                    error = %reason,
                    "Classifier failed, leaving message untagged"
                );
                return Ok(());
            }
        }

        let categories = BTreeSet::from([REVIEW_CATEGORY.to_string()]);
        let tagged = cancel
            .run_until_cancelled(self.store.add_categories(owner, &message.id, &categories))
            .await
            .ok_or(TriageError::Cancelled)?;

        match tagged {
            Ok(()) => {
                report.tagged += 1;
                debug!(message_id = %message.id, "Tagged as reviewed");
            }
            Err(source) => {
                let e = TriageError::Tag {
                    message_id: message.id.clone(),
                    source,
                };
                error!(message_id = %message.id, error = %e, "Tagging failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeDelta;

    use crate::error::{LlmError, MailStoreError};
    use crate::folders::{DestinationCatalog, FolderCache, WellKnownFolders};
    use crate::llm::{FinishReason, LlmProvider, ToolCompletionRequest, ToolCompletionResponse};
    use crate::mail::memory::{INBOX_ID, InMemoryMailStore};
    use crate::mail::{BodyFormat, Folder};
    use crate::pipeline::gateway::NO_ACTION_PHRASE;
    use crate::pipeline::prompt::DecisionPrompt;
    use crate::pipeline::render::{MessageRenderer, RenderLimits};
    use crate::tools::ToolRegistry;

    /// Always declines to act.
    struct DecliningLlm;

    #[async_trait]
    impl LlmProvider for DecliningLlm {
        fn model_name(&self) -> &str {
            "declining"
        }

        async fn complete_with_tools(
            &self,
            _request: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            Ok(ToolCompletionResponse {
                content: Some(NO_ACTION_PHRASE.to_string()),
                tool_calls: vec![],
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    /// Folder lookups work, every fetch fails.
    struct BrokenFetchStore;

    #[async_trait]
    impl MailStore for BrokenFetchStore {
        async fn find_child_folder(
            &self,
            _owner_id: &str,
            _parent_id: Option<&str>,
            display_name: &str,
        ) -> Result<Option<Folder>, MailStoreError> {
            Ok(Some(Folder {
                id: display_name.to_lowercase(),
                display_name: display_name.to_string(),
                parent_id: None,
            }))
        }

        async fn create_child_folder(
            &self,
            _owner_id: &str,
            _parent_id: Option<&str>,
            display_name: &str,
        ) -> Result<Folder, MailStoreError> {
            Err(MailStoreError::Conflict {
                name: display_name.to_string(),
            })
        }

        async fn fetch_candidates(
            &self,
            _owner_id: &str,
            _folder_id: &str,
            _query: &CandidateQuery,
        ) -> Result<Vec<CandidateMessage>, MailStoreError> {
            Err(MailStoreError::Auth("token expired".into()))
        }

        async fn move_message(
            &self,
            _owner_id: &str,
            _message_id: &str,
            _destination_folder_id: &str,
        ) -> Result<(), MailStoreError> {
            Ok(())
        }

        async fn add_categories(
            &self,
            _owner_id: &str,
            _message_id: &str,
            _categories: &BTreeSet<String>,
        ) -> Result<(), MailStoreError> {
            Ok(())
        }
    }

    fn settings(window: EligibilityWindow) -> CycleSettings {
        CycleSettings {
            owner_id: "me".into(),
            source_folder: "Inbox".into(),
            window,
            max_emails_per_run: 20,
        }
    }

    fn default_window() -> EligibilityWindow {
        EligibilityWindow::new(TimeDelta::minutes(5), TimeDelta::hours(72))
    }

    fn orchestrator(store: Arc<dyn MailStore>, window: EligibilityWindow) -> TriageOrchestrator {
        let resolver = Arc::new(FolderPathResolver::new(
            store.clone(),
            FolderCache::new(),
            WellKnownFolders::default(),
        ));
        let catalog: DestinationCatalog = [("newsletter", "Mailman/Newsletter")]
            .into_iter()
            .collect();
        let gateway = Arc::new(ClassificationGateway::new(
            Arc::new(DecliningLlm),
            Arc::new(ToolRegistry::new()),
            DecisionPrompt::embedded(None).unwrap(),
            MessageRenderer::new(RenderLimits::default()).unwrap(),
            catalog,
            "me",
        ));
        TriageOrchestrator::new(store, resolver, gateway, settings(window))
    }

    fn message(id: &str, minutes_ago: i64) -> CandidateMessage {
        CandidateMessage {
            id: id.to_string(),
            sender: "someone@example.com".into(),
            subject: format!("Message {id}"),
            body_preview: "Hello".into(),
            body: "Hello there".into(),
            body_format: BodyFormat::Text,
            received_at: Utc::now() - TimeDelta::minutes(minutes_ago),
            is_read: false,
            categories: Default::default(),
        }
    }

    #[tokio::test]
    async fn no_action_messages_are_tagged() {
        let store = Arc::new(InMemoryMailStore::new());
        store.add_message(INBOX_ID, message("m1", 10));
        let report = orchestrator(store.clone(), default_window())
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.fetched, 1);
        assert_eq!(report.no_action, 1);
        assert_eq!(report.tagged, 1);
        assert!(store.categories_of("m1").contains(REVIEW_CATEGORY));
    }

    #[tokio::test]
    async fn messages_outside_window_are_not_fetched() {
        let store = Arc::new(InMemoryMailStore::new());
        store.add_message(INBOX_ID, message("too-new", 2));
        store.add_message(INBOX_ID, message("too-old", 60 * 24 * 2));
        store.add_message(INBOX_ID, message("eligible", 10));

        let window = EligibilityWindow::new(TimeDelta::minutes(5), TimeDelta::days(1));
        let report = orchestrator(store.clone(), window)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.fetched, 1);
        assert!(store.categories_of("eligible").contains(REVIEW_CATEGORY));
        assert!(store.categories_of("too-new").is_empty());
        assert!(store.categories_of("too-old").is_empty());
    }

    #[tokio::test]
    async fn inverted_window_yields_empty_cycle() {
        let store = Arc::new(InMemoryMailStore::new());
        store.add_message(INBOX_ID, message("m1", 10));
        let window = EligibilityWindow::new(TimeDelta::hours(2), TimeDelta::hours(1));

        let report = orchestrator(store.clone(), window)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(store.calls().fetch, 0);
    }

    #[tokio::test]
    async fn blank_ids_are_skipped() {
        let store = Arc::new(InMemoryMailStore::new());
        store.add_message(INBOX_ID, message("  ", 10));
        store.add_message(INBOX_ID, message("m1", 11));

        let report = orchestrator(store.clone(), default_window())
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.tagged, 1);
    }

    #[tokio::test]
    async fn fetch_failure_ends_cycle_quietly() {
        let report = orchestrator(Arc::new(BrokenFetchStore), default_window())
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, CycleReport::default());
    }

    #[tokio::test]
    async fn missing_source_folder_is_not_created() {
        let store = Arc::new(InMemoryMailStore::new());
        store.add_message(INBOX_ID, message("m1", 10));
        let mut orchestrator = orchestrator(store.clone(), default_window());
        orchestrator.settings.source_folder = "Inbox/Typo".into();

        let report = orchestrator
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(store.calls().create, 0);
        assert_eq!(store.calls().fetch, 0);
        assert!(store.folders_named(Some(INBOX_ID), "Typo").is_empty());
    }

    #[tokio::test]
    async fn tag_failure_does_not_stop_cycle() {
        let store = Arc::new(InMemoryMailStore::new());
        store.add_message(INBOX_ID, message("m1", 10));
        store.add_message(INBOX_ID, message("m2", 20));
        store.fail_tags_for("m1");

        let report = orchestrator(store.clone(), default_window())
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.no_action, 2);
        assert_eq!(report.tagged, 1);
        assert!(store.categories_of("m2").contains(REVIEW_CATEGORY));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_fetch() {
        let store = Arc::new(InMemoryMailStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator(store.clone(), default_window())
            .run_cycle(&cancel)
            .await;
        assert!(matches!(result, Err(TriageError::Cancelled)));
        assert_eq!(store.calls().fetch, 0);
    }
}
