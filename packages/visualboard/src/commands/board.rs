use colored::Colorize;

use super::{load_config, not_found, open_panel, open_store, print_notices};
use crate::cli::Cli;
use crate::error::Result;
use crate::model::ScenarioKey;
use crate::storage::BoardStore;

pub async fn restore(cli: &Cli, scenario_key: &str) -> Result<()> {
    let (panel, mut notices) = open_panel(cli).await?;
    let key = ScenarioKey::new(scenario_key);
    let record = panel
        .board_store()
        .last_success(&key)
        .await?
        .filter(|r| r.state.is_some())
        .ok_or_else(|| not_found("last success record", scenario_key))?;

    panel.handle_scenario_change(Some(&key)).await;
    let restored = panel.restore(&record).await?;
    print_notices(&mut notices);
    if restored {
        eprintln!("{} {}", "✓".green(), crate::sidepanel::TOAST_RESTORED);
    } else {
        eprintln!("{} Board did not accept the state", "✗".red());
    }
    Ok(())
}

pub async fn record(cli: &Cli, scenario_key: &str) -> Result<()> {
    let config = load_config(cli)?;
    let board = BoardStore::new(open_store(&config));
    let record = board
        .last_success(&ScenarioKey::new(scenario_key))
        .await?
        .ok_or_else(|| not_found("last success record", scenario_key))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("{} {}", "Scenario:".bold(), record.scenario_key);
    println!("{} {}", "Turn:".bold(), record.turn_id);
    println!(
        "{} {}",
        "Saved:".bold(),
        chrono::DateTime::from_timestamp_millis(record.saved_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| record.saved_at.to_string())
    );
    match &record.state {
        Some(state) => println!(
            "{} {} scene(s), locations: {}",
            "State:".bold(),
            state.scenes.len(),
            state.location_names().join(", ")
        ),
        None => println!("{} {}", "State:".bold(), "(none)".dimmed()),
    }
    println!("{} {} character(s)", "Cast:".bold(), record.cast.len());
    if let Some(err) = &record.last_error {
        println!("{} {}", "Last error:".red().bold(), err);
    }
    Ok(())
}

pub async fn cast(cli: &Cli, scenario_key: &str) -> Result<()> {
    let config = load_config(cli)?;
    let board = BoardStore::new(open_store(&config));
    let cast = board.cast(&ScenarioKey::new(scenario_key)).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&cast)?);
        return Ok(());
    }

    if cast.is_empty() {
        println!("{}", "(no characters)".dimmed());
        return Ok(());
    }
    for (id, entry) in &cast.characters_by_id {
        let ghost = if entry.is_ghost == Some(true) { " ghost".yellow().to_string() } else { String::new() };
        println!(
            "{} {} [{}]{}",
            entry.canonical_name.bold(),
            id.dimmed(),
            entry.resolved_gender(),
            ghost
        );
        if !entry.aliases.is_empty() {
            println!("  aliases: {}", entry.aliases.join(", "));
        }
    }
    Ok(())
}

pub async fn reset(cli: &Cli) -> Result<()> {
    let (panel, mut notices) = open_panel(cli).await?;
    panel.reset_board().await?;
    print_notices(&mut notices);
    Ok(())
}
