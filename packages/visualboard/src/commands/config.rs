use colored::Colorize;

use super::{load_config, open_store};
use crate::cli::{Cli, ConfigCommands};
use crate::config::{board_frame_src, Config, ServerEnv};
use crate::error::{Result, VisualboardError};
use crate::storage::BoardStore;

pub async fn run(cli: &Cli, command: &ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => show(cli).await,
        ConfigCommands::SetEnv { env } => set_env(cli, *env).await,
        ConfigCommands::Path => path(cli).await,
    }
}

async fn show(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let board = BoardStore::new(open_store(&config));
    let env = board.server_env().await?.unwrap_or(config.server.env);
    let base_url = config.base_url_for(env);

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "config": config,
                "effective": {
                    "env": env,
                    "baseUrl": base_url,
                    "boardSrc": board_frame_src(&base_url),
                    "dataDir": config.data_dir(),
                }
            })
        );
    } else {
        let toml_str = toml::to_string_pretty(&config)
            .map_err(|e| VisualboardError::ConfigError(e.to_string()))?;
        println!("{}", toml_str);
        println!("{} {} ({})", "Effective env:".bold(), env, base_url);
        println!("{} {}", "Data dir:".bold(), config.data_dir().display());
    }

    Ok(())
}

/// Persist the global `server_env` setting, the way the options page does.
async fn set_env(cli: &Cli, env: ServerEnv) -> Result<()> {
    let config = load_config(cli)?;
    let board = BoardStore::new(open_store(&config));
    board.set_server_env(env).await?;
    println!(
        "{} server_env = {} ({})",
        "✓".green(),
        env,
        config.base_url_for(env)
    );
    Ok(())
}

async fn path(cli: &Cli) -> Result<()> {
    let path = cli.config.clone().unwrap_or_else(Config::config_path);

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "path": path,
                "exists": path.exists()
            })
        );
    } else {
        println!("{}", path.display());
    }

    Ok(())
}
