//! CLI route: run context and command dispatch. Builds the engine from
//! configuration and hands results to presentation.

use crate::api::ExplorationApi;
use crate::cli::parse::{Commands, OutputFormat};
use crate::cli::presentation::{
    format_conversation_text, format_graph_text, format_json, format_status_text,
};
use crate::config::{CanopyConfig, ConfigLoader, StorageBackend};
use crate::engine::Engine;
use crate::error::ExploreError;
use crate::explorer::Explorer;
use crate::provider::{http_capabilities, unconfigured_capabilities, OpenAiClient};
use crate::store::{MemoryNodeStore, NodeStore, SledNodeStore};
use crate::types::NodeId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Runtime context for CLI execution: loaded configuration plus the
/// exploration API over the configured store.
pub struct RunContext {
    api: ExplorationApi,
    config: CanopyConfig,
}

impl RunContext {
    /// Load configuration, open the store and wire capabilities. A missing
    /// API key is not an error here; commands that call the provider will
    /// report it.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ExploreError> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        if let Err(errors) = config.validate() {
            let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Err(ExploreError::ConfigError(joined.join("; ")));
        }

        let store = open_store(&config, &workspace_root)?;
        let capabilities = match OpenAiClient::new(config.provider.clone()) {
            Ok(client) => http_capabilities(Arc::new(client)),
            Err(err) => {
                warn!(error = %err, "Provider unavailable, generation calls will fail");
                unconfigured_capabilities(err.to_string())
            }
        };

        let engine = Engine::new(
            store,
            capabilities,
            config.run_configuration(),
            config.explorer.engine_options(),
        );
        Ok(Self {
            api: ExplorationApi::new(engine),
            config,
        })
    }

    pub fn api(&self) -> &ExplorationApi {
        &self.api
    }

    pub async fn execute(&self, command: &Commands) -> Result<String, ExploreError> {
        match command {
            Commands::Run { seed } => self.run(seed.as_deref()).await,
            Commands::Seed { prompt } => {
                let id = self.api.seed(prompt.as_str()).await?;
                self.api.engine().store().flush()?;
                Ok(format!("Seeded root {}", id))
            }
            Commands::Graph { format } => {
                let mut nodes = self.api.engine().store().list_all()?;
                nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                Ok(match format {
                    OutputFormat::Text => format_graph_text(&nodes),
                    OutputFormat::Json => format_json(&self.api.graph()?),
                })
            }
            Commands::Conversation { id, format } => {
                let node_id: NodeId = id
                    .parse()
                    .map_err(|e| ExploreError::ConfigError(format!("Invalid node id {}: {}", id, e)))?;
                let view = self.api.conversation(&node_id)?;
                let prompts = &self.config.provider.prompts;
                Ok(match format {
                    OutputFormat::Text => {
                        format_conversation_text(&view, &prompts.human_label, &prompts.agent_label)
                    }
                    OutputFormat::Json => format_json(&view),
                })
            }
            Commands::Status { format } => {
                self.api.recover()?;
                let status = self.api.status()?;
                Ok(match format {
                    OutputFormat::Text => format_status_text(&status),
                    OutputFormat::Json => format_json(&status),
                })
            }
        }
    }

    async fn run(&self, seed: Option<&str>) -> Result<String, ExploreError> {
        let admitted = self.api.recover()?;
        if let Some(prompt) = seed {
            let id = self.api.seed(prompt).await?;
            info!(node_id = %id, "Seeded root from command line");
        } else if admitted == 0 && self.api.engine().store().count()? == 0 {
            warn!("Store is empty; the explorer will idle until a root is seeded");
        }

        let explorer = Explorer::new(self.api.engine().clone(), self.config.explorer.clone());
        explorer.start();

        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Could not listen for Ctrl-C, stopping");
        }
        info!("Shutdown requested");
        explorer.stop().await;

        let status = self.api.status()?;
        Ok(format_status_text(&status))
    }
}

fn open_store(config: &CanopyConfig, workspace_root: &Path) -> Result<Arc<dyn NodeStore>, ExploreError> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryNodeStore::new())),
        StorageBackend::Sled => {
            let mut path = config.storage.store_path()?;
            if path.is_relative() {
                path = workspace_root.join(path);
            }
            std::fs::create_dir_all(&path).map_err(crate::error::StorageError::IoError)?;
            info!(path = %path.display(), "Opening node store");
            Ok(Arc::new(SledNodeStore::new(&path)?))
        }
    }
}
