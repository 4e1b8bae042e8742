//! `visualboard` subcommands. Each one runs the Side Panel controller over
//! the file-backed store, with no browser: the board is a sink that prints
//! every envelope as one JSON line on stdout.

pub mod analyze;
pub mod board;
pub mod config;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use colored::Colorize;
use tokio::sync::mpsc;

use crate::cli::Cli;
use crate::config::Config;
use crate::error::{Result, VisualboardError};
use crate::protocol::iframe::FrameEnvelope;
use crate::protocol::runtime::{FailureReason, LastAiMessageResponse, RouterLink};
use crate::sidepanel::{
    BoardFrame, HttpAnalysisClient, NoticeLevel, PanelNotice, PanelSettings, SidePanelController,
};
use crate::storage::FileStore;

/// Board frame that writes envelopes to stdout.
#[derive(Debug, Default)]
pub struct PrintFrame {
    src: Mutex<String>,
}

impl BoardFrame for PrintFrame {
    fn is_ready(&self) -> bool {
        true
    }

    fn post(&self, envelope: &FrameEnvelope) -> Result<()> {
        println!("{}", serde_json::to_string(envelope)?);
        Ok(())
    }

    fn load(&self, src: &str) {
        if let Ok(mut current) = self.src.lock() {
            *current = src.to_string();
        }
        tracing::debug!("Board source {}", src);
    }
}

/// No tabs outside the browser: every request reports a missing chat tab.
pub struct OfflineRouter;

#[async_trait]
impl RouterLink for OfflineRouter {
    async fn request_last_ai_message(&self, _provider: &str) -> Result<LastAiMessageResponse> {
        Ok(LastAiMessageResponse::failure(FailureReason::NoActiveRofanChatTab))
    }

    async fn active_tab_url(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

pub fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config.clone().unwrap_or_else(Config::config_path);
    let mut config = Config::load_from(&path)?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }
    Ok(config)
}

pub fn open_store(config: &Config) -> Arc<FileStore> {
    Arc::new(FileStore::new(config.data_dir()))
}

/// A controller over the file store, environment already loaded.
pub async fn open_panel(
    cli: &Cli,
) -> Result<(Arc<SidePanelController>, mpsc::UnboundedReceiver<PanelNotice>)> {
    let config = load_config(cli)?;
    let store = open_store(&config);
    let analysis = HttpAnalysisClient::from_config(&config)?;
    let settings = PanelSettings::from_config(&config, None);
    let (panel, notices) = SidePanelController::new(
        config,
        settings,
        store,
        Arc::new(analysis),
        Arc::new(OfflineRouter),
        Arc::new(PrintFrame::default()),
    );
    panel.reload_environment(None).await;
    Ok((panel, notices))
}

/// Print queued notices on stderr so stdout stays machine readable.
pub fn print_notices(notices: &mut mpsc::UnboundedReceiver<PanelNotice>) {
    while let Ok(notice) = notices.try_recv() {
        match &notice {
            PanelNotice::Toast {
                level: NoticeLevel::Success,
                message,
            } => eprintln!("{} {}", "✓".green(), message),
            PanelNotice::Toast {
                level: NoticeLevel::Error,
                message,
            } => eprintln!("{} {}", "✗".red(), message),
            PanelNotice::Persistent(message) | PanelNotice::AutoUpdateDisabled(message) => {
                eprintln!("{} {}", "!".yellow(), message)
            }
        }
    }
}

pub(crate) fn not_found(what: &str, key: &str) -> VisualboardError {
    VisualboardError::Other(format!("No {} stored for {}", what, key))
}
