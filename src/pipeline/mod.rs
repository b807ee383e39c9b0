//! Triage pipeline.
//!
//! Every candidate message flows through:
//! 1. `TriageOrchestrator` fetches eligible, untagged mail from the source folder
//! 2. `ClassificationGateway` renders it into a prompt and lets the model decide,
//!    moving it through the `move_email` tool if it belongs elsewhere
//! 3. The orchestrator tags the message as reviewed unless classification failed
//!
//! `CycleScheduler` repeats this on a fixed interval until cancelled.

pub mod gateway;
pub mod orchestrator;
pub mod prompt;
pub mod render;
pub mod scheduler;

pub use gateway::{ClassificationDecision, ClassificationGateway, NO_ACTION_PHRASE};
pub use orchestrator::{CycleReport, CycleSettings, TriageOrchestrator};
pub use prompt::DecisionPrompt;
pub use render::{MessageRenderer, RenderLimits};
pub use scheduler::CycleScheduler;

use std::sync::Arc;

use crate::config::TriageConfig;
use crate::error::Result;
use crate::folders::{FolderCache, FolderPathResolver, WellKnownFolders};
use crate::llm::create_provider;
use crate::mail::MailStore;
use crate::tools::{MoveEmailTool, ToolRegistry};

/// Wire resolver, move tool, classifier and orchestrator over `store`.
pub fn build_orchestrator(
    config: &TriageConfig,
    store: Arc<dyn MailStore>,
) -> Result<TriageOrchestrator> {
    let cache = match config.folder_ttl()? {
        Some(ttl) => FolderCache::with_ttl(ttl),
        None => FolderCache::new(),
    };
    let resolver = Arc::new(FolderPathResolver::new(
        Arc::clone(&store),
        cache,
        WellKnownFolders::default(),
    ));

    let llm = create_provider(&config.llm_config()?)?;
    let catalog = config.catalog();

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(MoveEmailTool::new(
        Arc::clone(&resolver),
        Arc::clone(&store),
        catalog.clone(),
    )));

    let policy = config.classifier.system_policy.clone();
    let prompt = match config.classifier.prompt_template {
        Some(ref path) => DecisionPrompt::from_file(path, policy)?,
        None => DecisionPrompt::embedded(policy)?,
    };
    let renderer = MessageRenderer::new(RenderLimits::default())?;

    let gateway = Arc::new(
        ClassificationGateway::new(
            llm,
            Arc::new(tools),
            prompt,
            renderer,
            catalog,
            &config.mailbox.owner_id,
        )
        .with_max_tool_rounds(config.classifier.max_tool_rounds),
    );

    Ok(TriageOrchestrator::new(
        store,
        resolver,
        gateway,
        CycleSettings {
            owner_id: config.mailbox.owner_id.clone(),
            source_folder: config.mailbox.source_folder.clone(),
            window: config.window()?,
            max_emails_per_run: config.schedule.max_emails_per_run,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use secrecy::SecretString;
    use tokio_util::sync::CancellationToken;

    use crate::error::{ConfigError, Error};
    use crate::mail::memory::InMemoryMailStore;

    fn config() -> TriageConfig {
        let mut config = TriageConfig::from_toml_str(
            r#"
[mailbox]
owner_id = "me@example.com"

[mailbox.destinations]
newsletter = "Mailman/Newsletter"
"#,
        )
        .unwrap();
        config.classifier.api_key = Some(SecretString::from("sk-test"));
        config
    }

    #[tokio::test]
    async fn built_pipeline_runs_an_empty_cycle() {
        let store = Arc::new(InMemoryMailStore::new());
        let orchestrator = build_orchestrator(&config(), store.clone()).unwrap();

        let report = orchestrator
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(store.calls().fetch, 1);
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let mut config = config();
        config.classifier.api_key = None;
        let err = build_orchestrator(&config, Arc::new(InMemoryMailStore::new())).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::MissingRequired { .. })));
    }

    #[test]
    fn unreadable_template_is_config_error() {
        let mut config = config();
        config.classifier.prompt_template = Some(PathBuf::from("/nonexistent/classify.hbs"));
        let err = build_orchestrator(&config, Arc::new(InMemoryMailStore::new())).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::Template(_))));
    }
}
