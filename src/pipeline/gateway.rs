//! Classification gateway: one message in, one decision out.
//!
//! Renders the message into a decision prompt, lets the model call the
//! `move_email` tool at most once, and derives a [`ClassificationDecision`]
//! from the tool receipt. The model's final text is kept only as an
//! explanation, except for two markers that are still honored: a leading
//! `Error:` and the literal no-action phrase.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ToolError, TriageError};
use crate::folders::DestinationCatalog;
use crate::llm::{ChatMessage, LlmProvider, ToolCall, ToolCompletionRequest};
use crate::mail::CandidateMessage;
use crate::pipeline::prompt::DecisionPrompt;
use crate::pipeline::render::MessageRenderer;
use crate::tools::{MOVE_EMAIL_TOOL, MoveReceipt, ToolContext, ToolRegistry};

/// The exact reply the model gives when it decides to leave a message alone.
pub const NO_ACTION_PHRASE: &str = "No action needed.";

/// Prefix of a final reply that reports failure.
pub const ERROR_PREFIX: &str = "Error:";

/// Default bound on model round trips per message.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 4;

/// Max tokens per classification call.
const CLASSIFY_MAX_TOKENS: u32 = 512;

/// Temperature for classification (deterministic-ish).
const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Outcome of classifying one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationDecision {
    /// The message was moved into `folder_path`.
    MoveToFolder {
        folder_path: String,
        explanation: String,
    },
    /// The model left the message where it is.
    NoAction { explanation: String },
    /// The model or tool path failed. Never tagged as reviewed.
    ClassifierError { message: String },
}

impl ClassificationDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::MoveToFolder { .. } => "move",
            Self::NoAction { .. } => "no_action",
            Self::ClassifierError { .. } => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::ClassifierError { .. })
    }

    fn error(message: impl Into<String>) -> Self {
        Self::ClassifierError {
            message: message.into(),
        }
    }
}

/// Tool activity observed during one classification.
#[derive(Debug, Default)]
struct MoveOutcome {
    receipt: Option<MoveReceipt>,
    failure: Option<String>,
}

/// Asks the model what to do with a candidate message.
pub struct ClassificationGateway {
    llm: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    prompt: DecisionPrompt,
    renderer: MessageRenderer,
    catalog: DestinationCatalog,
    owner_id: String,
    max_tool_rounds: usize,
}

impl ClassificationGateway {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        prompt: DecisionPrompt,
        renderer: MessageRenderer,
        catalog: DestinationCatalog,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            tools,
            prompt,
            renderer,
            catalog,
            owner_id: owner_id.into(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    /// Classify one message.
    ///
    /// Model and tool failures come back as `ClassifierError`; the only
    /// `Err` is cancellation.
    pub async fn classify(
        &self,
        message: &CandidateMessage,
        cancel: &CancellationToken,
    ) -> Result<ClassificationDecision, TriageError> {
        let rendered = self.renderer.render(message);
        let folders = self.catalog.paths();
        let user_prompt =
            match self
                .prompt
                .render(&folders, MOVE_EMAIL_TOOL, NO_ACTION_PHRASE, &rendered)
            {
                Ok(text) => text,
                Err(e) => {
                    return Ok(ClassificationDecision::error(format!(
                        "prompt rendering failed: {e}"
                    )));
                }
            };

        let mut messages = vec![
            ChatMessage::system(self.prompt.system_policy()),
            ChatMessage::user(user_prompt),
        ];
        let tools = self.tools.tool_definitions().await;
        let ctx = ToolContext::new(&self.owner_id, &message.id);
        let mut outcome = MoveOutcome::default();

        for round in 1..=self.max_tool_rounds {
            let request = ToolCompletionRequest::new(messages.clone(), tools.clone())
                .with_max_tokens(CLASSIFY_MAX_TOKENS)
                .with_temperature(CLASSIFY_TEMPERATURE);

            let response = match cancel
                .run_until_cancelled(self.llm.complete_with_tools(request))
                .await
            {
                None => return Err(TriageError::Cancelled),
                Some(Err(e)) => {
                    warn!(message_id = %message.id, error = %e, "Classifier call failed");
                    return Ok(ClassificationDecision::error(e.to_string()));
                }
                Some(Ok(response)) => response,
            };

            debug!(
                message_id = %message.id,
                round,
                tool_calls = response.tool_calls.len(),
                input_tokens = response.input_tokens,
                output_tokens = response.output_tokens,
                "Classifier round complete"
            );

            if response.tool_calls.is_empty() {
                let text = response.content.unwrap_or_default();
                return Ok(decide(&text, outcome));
            }

            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content,
                response.tool_calls.clone(),
            ));
            for call in response.tool_calls {
                let reply = self.run_tool(&call, &ctx, &mut outcome, cancel).await?;
                messages.push(reply);
            }
        }

        warn!(
            message_id = %message.id,
            rounds = self.max_tool_rounds,
            "Classifier did not finish within the tool round limit"
        );
        Ok(match outcome.receipt {
            // The move already happened; report what the mailbox now looks like.
            Some(receipt) => ClassificationDecision::MoveToFolder {
                folder_path: receipt.folder_path,
                explanation: "tool round limit reached after move".into(),
            },
            None => ClassificationDecision::error(format!(
                "no final answer after {} rounds",
                self.max_tool_rounds
            )),
        })
    }

    /// Run one requested tool call and build the tool-result message.
    async fn run_tool(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        outcome: &mut MoveOutcome,
        cancel: &CancellationToken,
    ) -> Result<ChatMessage, TriageError> {
        let is_move = call.name == MOVE_EMAIL_TOOL;
        if is_move && outcome.receipt.is_some() {
            warn!(message_id = %ctx.message_id, "Rejected second move for one message");
            return Ok(ChatMessage::tool_error(
                &call.id,
                &call.name,
                format!("{ERROR_PREFIX} this email was already moved"),
            ));
        }

        let result = cancel
            .run_until_cancelled(self.tools.execute(&call.name, call.arguments.clone(), ctx))
            .await
            .ok_or(TriageError::Cancelled)?;

        match result {
            Ok(output) => {
                if is_move {
                    match serde_json::from_value::<MoveReceipt>(output.result.clone()) {
                        Ok(receipt) if receipt.is_moved() => {
                            info!(
                                message_id = %ctx.message_id,
                                folder_path = %receipt.folder_path,
                                duration_ms = output.duration.as_millis() as u64,
                                "Classifier moved message"
                            );
                            outcome.receipt = Some(receipt);
                        }
                        _ => outcome.failure = Some("unrecognized move receipt".into()),
                    }
                }
                Ok(ChatMessage::tool_result(
                    &call.id,
                    &call.name,
                    output.to_model_text(),
                ))
            }
            Err(e) => {
                warn!(
                    message_id = %ctx.message_id,
                    tool = %call.name,
                    error = %e,
                    "Tool call failed"
                );
                // Rejected arguments leave the mailbox untouched; the model
                // may still settle on no action.
                if is_move && matches!(e, ToolError::ExecutionFailed { .. }) {
                    outcome.failure = Some(e.to_string());
                }
                Ok(ChatMessage::tool_error(
                    &call.id,
                    &call.name,
                    format!("{ERROR_PREFIX} {e}"),
                ))
            }
        }
    }
}

/// Turn the final reply plus observed tool activity into a decision.
fn decide(text: &str, outcome: MoveOutcome) -> ClassificationDecision {
    let text = text.trim();

    if text.starts_with(ERROR_PREFIX) {
        return ClassificationDecision::error(text);
    }
    if let Some(receipt) = outcome.receipt {
        return ClassificationDecision::MoveToFolder {
            folder_path: receipt.folder_path,
            explanation: text.to_string(),
        };
    }
    if let Some(failure) = outcome.failure {
        return ClassificationDecision::error(format!("move failed: {failure}"));
    }
    if !text.contains(NO_ACTION_PHRASE) {
        debug!(reply = %text, "Reply without move or no-action phrase, treating as no action");
    }
    ClassificationDecision::NoAction {
        explanation: text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::error::LlmError;
    use crate::folders::{FolderCache, FolderPathResolver, WellKnownFolders};
    use crate::llm::{FinishReason, ToolCompletionResponse};
    use crate::mail::memory::{INBOX_ID, InMemoryMailStore};
    use crate::mail::BodyFormat;
    use crate::pipeline::render::RenderLimits;
    use crate::tools::MoveEmailTool;

    /// Mock LLM that replays scripted responses and records requests.
    struct MockClassifierLlm {
        responses: Mutex<VecDeque<Result<ToolCompletionResponse, LlmError>>>,
        requests: Mutex<Vec<ToolCompletionRequest>>,
    }

    impl MockClassifierLlm {
        fn new(responses: Vec<Result<ToolCompletionResponse, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<ToolCompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for MockClassifierLlm {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn complete_with_tools(
            &self,
            request: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(text(NO_ACTION_PHRASE)))
        }
    }

    /// Never answers; used for cancellation.
    struct HangingLlm;

    #[async_trait]
    impl LlmProvider for HangingLlm {
        fn model_name(&self) -> &str {
            "hanging"
        }

        async fn complete_with_tools(
            &self,
            _request: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            std::future::pending().await
        }
    }

    fn text(content: &str) -> ToolCompletionResponse {
        ToolCompletionResponse {
            content: Some(content.to_string()),
            tool_calls: vec![],
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: FinishReason::Stop,
        }
    }

    fn move_call(id: &str, message_id: &str, folder_path: &str) -> ToolCompletionResponse {
        ToolCompletionResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: MOVE_EMAIL_TOOL.to_string(),
                arguments: serde_json::json!({
                    "message_id": message_id,
                    "folder_path": folder_path,
                }),
            }],
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: FinishReason::ToolUse,
        }
    }

    fn candidate(id: &str) -> CandidateMessage {
        CandidateMessage {
            id: id.to_string(),
            sender: "news@example.com".into(),
            subject: "Weekly digest".into(),
            body_preview: "Top stories".into(),
            body: "<p>Top stories this week</p>".into(),
            body_format: BodyFormat::Html,
            received_at: Utc::now(),
            is_read: false,
            categories: Default::default(),
        }
    }

    fn gateway(
        store: &Arc<InMemoryMailStore>,
        llm: Arc<dyn LlmProvider>,
    ) -> ClassificationGateway {
        let catalog: DestinationCatalog = [("newsletter", "Mailman/Newsletter")]
            .into_iter()
            .collect();
        let resolver = Arc::new(FolderPathResolver::new(
            store.clone(),
            FolderCache::new(),
            WellKnownFolders::default(),
        ));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(MoveEmailTool::new(
            resolver,
            store.clone(),
            catalog.clone(),
        )));
        let tools = Arc::new(tools);
        ClassificationGateway::new(
            llm,
            tools,
            DecisionPrompt::embedded(None).unwrap(),
            MessageRenderer::new(RenderLimits::default()).unwrap(),
            catalog,
            "me",
        )
    }

    fn store_with(id: &str) -> Arc<InMemoryMailStore> {
        let store = Arc::new(InMemoryMailStore::new());
        store.add_message(INBOX_ID, candidate(id));
        store
    }

    #[tokio::test]
    async fn move_then_confirmation_is_move_decision() {
        let store = store_with("m1");
        let llm = Arc::new(MockClassifierLlm::new(vec![
            Ok(move_call("call-1", "m1", "Mailman/Newsletter")),
            Ok(text("Moved to Mailman/Newsletter: weekly digest.")),
        ]));
        let decision = gateway(&store, llm.clone())
            .classify(&candidate("m1"), &CancellationToken::new())
            .await
            .unwrap();

        match decision {
            ClassificationDecision::MoveToFolder { folder_path, explanation } => {
                assert_eq!(folder_path, "Mailman/Newsletter");
                assert!(explanation.contains("weekly digest"));
            }
            other => panic!("Expected MoveToFolder, got {other:?}"),
        }
        assert_ne!(store.folder_of("m1").as_deref(), Some(INBOX_ID));

        // Second round carries the tool result back to the model.
        let requests = llm.requests();
        assert_eq!(requests.len(), 2);
        let last = requests[1].messages.last().unwrap();
        assert_eq!(last.tool_call_id.as_deref(), Some("call-1"));
        assert!(!last.is_error);
    }

    #[tokio::test]
    async fn no_action_phrase_is_no_action() {
        let store = store_with("m1");
        let llm = Arc::new(MockClassifierLlm::new(vec![Ok(text(NO_ACTION_PHRASE))]));
        let decision = gateway(&store, llm)
            .classify(&candidate("m1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision.label(), "no_action");
        assert_eq!(store.folder_of("m1").as_deref(), Some(INBOX_ID));
    }

    #[tokio::test]
    async fn error_prefix_is_classifier_error() {
        let store = store_with("m1");
        let llm = Arc::new(MockClassifierLlm::new(vec![Ok(text(
            "Error: could not decide",
        ))]));
        let decision = gateway(&store, llm)
            .classify(&candidate("m1"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(decision.is_error());
    }

    #[tokio::test]
    async fn llm_failure_is_classifier_error() {
        let store = store_with("m1");
        let llm = Arc::new(MockClassifierLlm::new(vec![Err(
            LlmError::RequestFailed {
                provider: "mock".into(),
                reason: "boom".into(),
            },
        )]));
        let decision = gateway(&store, llm)
            .classify(&candidate("m1"), &CancellationToken::new())
            .await
            .unwrap();
        match decision {
            ClassificationDecision::ClassifierError { message } => assert!(message.contains("boom")),
            other => panic!("Expected ClassifierError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_move_is_classifier_error_even_without_prefix() {
        let store = store_with("m1");
        store.fail_moves_for("m1");
        let llm = Arc::new(MockClassifierLlm::new(vec![
            Ok(move_call("call-1", "m1", "Mailman/Newsletter")),
            Ok(text("I tried to move it.")),
        ]));
        let decision = gateway(&store, llm.clone())
            .classify(&candidate("m1"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(decision.is_error());
        assert!(llm.requests()[1].messages.last().unwrap().is_error);
    }

    #[tokio::test]
    async fn path_outside_catalog_never_moves() {
        let store = store_with("m1");
        let llm = Arc::new(MockClassifierLlm::new(vec![
            Ok(move_call("call-1", "m1", "Invented/Folder")),
            Ok(text(NO_ACTION_PHRASE)),
        ]));
        let decision = gateway(&store, llm)
            .classify(&candidate("m1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision.label(), "no_action");
        assert_eq!(store.folder_of("m1").as_deref(), Some(INBOX_ID));
        assert_eq!(store.calls().create, 0);
    }

    #[tokio::test]
    async fn second_move_is_rejected() {
        let store = store_with("m1");
        let llm = Arc::new(MockClassifierLlm::new(vec![
            Ok(move_call("call-1", "m1", "Mailman/Newsletter")),
            Ok(move_call("call-2", "m1", "Mailman/Newsletter")),
            Ok(text("Done.")),
        ]));
        let decision = gateway(&store, llm.clone())
            .classify(&candidate("m1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(decision.label(), "move");
        assert_eq!(store.calls().moves, 1);
        assert!(llm.requests()[2].messages.last().unwrap().is_error);
    }

    #[tokio::test]
    async fn round_limit_without_move_is_error() {
        let store = store_with("m1");
        let llm = Arc::new(MockClassifierLlm::new(vec![
            Ok(move_call("c1", "m1", "Nope")),
            Ok(move_call("c2", "m1", "Nope")),
        ]));
        let decision = gateway(&store, llm.clone())
            .with_max_tool_rounds(2)
            .classify(&candidate("m1"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(decision.is_error());
        assert_eq!(llm.requests().len(), 2);
    }

    #[tokio::test]
    async fn prompt_lists_catalog_and_message_id() {
        let store = store_with("m1");
        let llm = Arc::new(MockClassifierLlm::new(vec![Ok(text(NO_ACTION_PHRASE))]));
        gateway(&store, llm.clone())
            .classify(&candidate("m1"), &CancellationToken::new())
            .await
            .unwrap();

        let request = &llm.requests()[0];
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].name, MOVE_EMAIL_TOOL);
        let user = request.messages[1].content.as_deref().unwrap();
        assert!(user.contains("Mailman/Newsletter"));
        assert!(user.contains("m1"));
        assert!(user.contains("Top stories this week"));
        assert!(!user.contains("<p>"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_model_call() {
        let store = store_with("m1");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = gateway(&store, Arc::new(HangingLlm))
            .classify(&candidate("m1"), &cancel)
            .await;
        assert!(matches!(result, Err(TriageError::Cancelled)));
    }

    #[test]
    fn decide_prefers_error_prefix_over_receipt() {
        let outcome = MoveOutcome {
            receipt: Some(MoveReceipt {
                status: MoveReceipt::MOVED.into(),
                message_id: "m1".into(),
                folder_path: "A/B".into(),
                folder_id: "f1".into(),
            }),
            failure: None,
        };
        assert!(decide("Error: something", outcome).is_error());
    }
}
