//! The `move_email` tool.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MailStoreError, ToolError};
use crate::folders::{DestinationCatalog, FolderPathResolver};
use crate::mail::MailStore;
use crate::tools::{Tool, ToolContext, ToolOutput, require_str};

pub const MOVE_EMAIL_TOOL: &str = "move_email";

/// Structured result of a successful move, returned to the model and read
/// back by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveReceipt {
    pub status: String,
    pub message_id: String,
    pub folder_path: String,
    pub folder_id: String,
}

impl MoveReceipt {
    pub const MOVED: &'static str = "moved";

    pub fn is_moved(&self) -> bool {
        self.status == Self::MOVED
    }
}

/// Moves the message under classification into one of the catalog folders.
pub struct MoveEmailTool {
    resolver: Arc<FolderPathResolver>,
    store: Arc<dyn MailStore>,
    catalog: DestinationCatalog,
}

impl MoveEmailTool {
    pub fn new(
        resolver: Arc<FolderPathResolver>,
        store: Arc<dyn MailStore>,
        catalog: DestinationCatalog,
    ) -> Self {
        Self {
            resolver,
            store,
            catalog,
        }
    }

    fn failed(reason: impl Into<String>) -> ToolError {
        ToolError::ExecutionFailed {
            name: MOVE_EMAIL_TOOL.to_string(),
            reason: reason.into(),
        }
    }

    async fn resolve(&self, owner_id: &str, folder_path: &str) -> Result<String, ToolError> {
        self.resolver
            .resolve(owner_id, folder_path)
            .await
            .map_err(|e| Self::failed(e.to_string()))
    }

    /// Resolve and move. A stale cached id is dropped, re-resolved and the
    /// move retried once.
    async fn move_to(
        &self,
        owner_id: &str,
        message_id: &str,
        folder_path: &str,
    ) -> Result<String, ToolError> {
        let folder_id = self.resolve(owner_id, folder_path).await?;

        match self
            .store
            .move_message(owner_id, message_id, &folder_id)
            .await
        {
            Ok(()) => Ok(folder_id),
            Err(MailStoreError::NotFound(what)) => {
                warn!(
                    message_id = %message_id,
                    folder_path = %folder_path,
                    folder_id = %folder_id,
                    "Move target not found ({}), re-resolving",
                    what
                );
                self.resolver.invalidate(owner_id, folder_path).await;
                let fresh = self.resolve(owner_id, folder_path).await?;
                if fresh == folder_id {
                    return Err(Self::failed(format!("not found: {what}")));
                }
                self.store
                    .move_message(owner_id, message_id, &fresh)
                    .await
                    .map_err(|e| Self::failed(e.to_string()))?;
                Ok(fresh)
            }
            Err(e) => Err(Self::failed(e.to_string())),
        }
    }
}

#[async_trait]
impl Tool for MoveEmailTool {
    fn name(&self) -> &str {
        MOVE_EMAIL_TOOL
    }

    fn description(&self) -> &str {
        "Move the email being classified into one of the listed destination folders. \
         Call at most once, with the folder path copied exactly from the list."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message_id": {
                    "type": "string",
                    "description": "Id of the email being classified"
                },
                "folder_path": {
                    "type": "string",
                    "description": "Destination folder path",
                    "enum": self.catalog.paths()
                }
            },
            "required": ["message_id", "folder_path"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let message_id = require_str(MOVE_EMAIL_TOOL, &params, "message_id")?;
        let folder_path = require_str(MOVE_EMAIL_TOOL, &params, "folder_path")?;

        if message_id != ctx.message_id {
            return Err(ToolError::InvalidParameters {
                name: MOVE_EMAIL_TOOL.to_string(),
                reason: format!(
                    "message_id '{message_id}' is not the email under classification"
                ),
            });
        }
        if !self.catalog.contains_path(folder_path) {
            return Err(ToolError::InvalidParameters {
                name: MOVE_EMAIL_TOOL.to_string(),
                reason: format!("'{folder_path}' is not a listed destination folder"),
            });
        }

        let folder_id = self
            .move_to(&ctx.owner_id, message_id, folder_path)
            .await?;

        info!(
            message_id = %message_id,
            folder_path = %folder_path,
            folder_id = %folder_id,
            "Moved email"
        );

        let receipt = MoveReceipt {
            status: MoveReceipt::MOVED.to_string(),
            message_id: message_id.to_string(),
            folder_path: folder_path.to_string(),
            folder_id,
        };
        let result = serde_json::to_value(&receipt)
            .map_err(|e| Self::failed(format!("receipt serialization: {e}")))?;
        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folders::{FolderCache, WellKnownFolders};
    use crate::mail::memory::{INBOX_ID, InMemoryMailStore};
    use crate::mail::{BodyFormat, CandidateMessage};
    use chrono::Utc;

    fn message(id: &str) -> CandidateMessage {
        CandidateMessage {
            id: id.to_string(),
            sender: "news@example.com".to_string(),
            subject: "Weekly digest".to_string(),
            body_preview: "This week".to_string(),
            body: "This week in news".to_string(),
            body_format: BodyFormat::Text,
            received_at: Utc::now(),
            is_read: false,
            categories: Default::default(),
        }
    }

    fn setup() -> (Arc<InMemoryMailStore>, MoveEmailTool) {
        let store = Arc::new(InMemoryMailStore::new());
        store.add_message(INBOX_ID, message("m1"));
        let resolver = Arc::new(FolderPathResolver::new(
            store.clone(),
            FolderCache::new(),
            WellKnownFolders::default(),
        ));
        let catalog: DestinationCatalog = [("newsletter", "Mailman/Newsletter")]
            .into_iter()
            .collect();
        let tool = MoveEmailTool::new(resolver, store.clone(), catalog);
        (store, tool)
    }

    fn ctx() -> ToolContext {
        ToolContext::new("me", "m1")
    }

    #[tokio::test]
    async fn moves_into_catalog_folder() {
        let (store, tool) = setup();
        let out = tool
            .execute(
                serde_json::json!({"message_id": "m1", "folder_path": "Mailman/Newsletter"}),
                &ctx(),
            )
            .await
            .unwrap();

        let receipt: MoveReceipt = serde_json::from_value(out.result).unwrap();
        assert!(receipt.is_moved());
        assert_eq!(receipt.folder_path, "Mailman/Newsletter");
        assert_eq!(store.folder_of("m1"), Some(receipt.folder_id));
    }

    #[tokio::test]
    async fn rejects_path_outside_catalog() {
        let (store, tool) = setup();
        let err = tool
            .execute(
                serde_json::json!({"message_id": "m1", "folder_path": "Spam/Elsewhere"}),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters { .. }));
        assert_eq!(store.calls().mutations(), 0);
    }

    #[tokio::test]
    async fn rejects_other_message_id() {
        let (store, tool) = setup();
        let err = tool
            .execute(
                serde_json::json!({"message_id": "m2", "folder_path": "Mailman/Newsletter"}),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters { .. }));
        assert_eq!(store.calls().moves, 0);
    }

    #[tokio::test]
    async fn missing_parameter_is_invalid() {
        let (_store, tool) = setup();
        let err = tool
            .execute(serde_json::json!({"message_id": "m1"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn stale_cached_folder_is_recreated() {
        let (store, tool) = setup();
        store.add_message(INBOX_ID, message("m2"));

        let first = tool
            .execute(
                serde_json::json!({"message_id": "m2", "folder_path": "Mailman/Newsletter"}),
                &ToolContext::new("me", "m2"),
            )
            .await
            .unwrap();
        let first: MoveReceipt = serde_json::from_value(first.result).unwrap();
        store.remove_folder(&first.folder_id);

        let second = tool
            .execute(
                serde_json::json!({"message_id": "m1", "folder_path": "Mailman/Newsletter"}),
                &ctx(),
            )
            .await
            .unwrap();
        let second: MoveReceipt = serde_json::from_value(second.result).unwrap();
        assert_ne!(first.folder_id, second.folder_id);
        assert_eq!(store.folder_of("m1"), Some(second.folder_id));
    }

    #[tokio::test]
    async fn store_failure_is_execution_failure() {
        let (store, tool) = setup();
        store.fail_moves_for("m1");
        let err = tool
            .execute(
                serde_json::json!({"message_id": "m1", "folder_path": "Mailman/Newsletter"}),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }
}
