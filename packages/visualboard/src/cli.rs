use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands;
use crate::config::ServerEnv;
use crate::error::Result;

/// Rofan Visualboard - drive the side panel state machine from a terminal
#[derive(Parser)]
#[command(name = "visualboard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory of the file-backed extension storage
    #[arg(long, env = "VISUALBOARD_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file (defaults to the user config directory)
    #[arg(long, env = "VISUALBOARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze a chat turn and push the result to the board
    Analyze {
        /// Turn text ("[USER]\n...\n\n[AI]\n...")
        text: Option<String>,

        /// Read the turn text from a file
        #[arg(short, long, conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Scenario key (chat page origin + path)
        #[arg(short = 'k', long)]
        scenario_key: String,

        /// Skip the restore/skip decision and always analyze
        #[arg(long)]
        force: bool,

        /// Behave like an automatic update instead of a button click
        #[arg(long, conflicts_with = "force")]
        auto: bool,

        /// Upstream message id, used as the turn id when present
        #[arg(long)]
        message_id: Option<String>,
    },

    /// Push the last successful state of a scenario to the board
    Restore {
        /// Scenario key
        scenario_key: String,
    },

    /// Show the last success record of a scenario
    Record {
        /// Scenario key
        scenario_key: String,
    },

    /// Show the cast store of a scenario
    Cast {
        /// Scenario key
        scenario_key: String,
    },

    /// Send a board reset (storage is left untouched)
    Reset,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Select the analysis server environment
    SetEnv {
        /// dev or prod
        env: ServerEnv,
    },

    /// Show configuration file path
    Path,
}

impl Cli {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Analyze {
                text,
                file,
                scenario_key,
                force,
                auto,
                message_id,
            } => {
                commands::analyze::run(
                    self,
                    commands::analyze::AnalyzeArgs {
                        text: text.clone(),
                        file: file.clone(),
                        scenario_key: scenario_key.clone(),
                        force: *force,
                        auto: *auto,
                        message_id: message_id.clone(),
                    },
                )
                .await
            }
            Commands::Restore { scenario_key } => commands::board::restore(self, scenario_key).await,
            Commands::Record { scenario_key } => commands::board::record(self, scenario_key).await,
            Commands::Cast { scenario_key } => commands::board::cast(self, scenario_key).await,
            Commands::Reset => commands::board::reset(self).await,
            Commands::Config { command } => commands::config::run(self, command).await,
        }
    }
}
