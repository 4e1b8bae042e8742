use std::path::PathBuf;

use colored::Colorize;

use super::{open_panel, print_notices};
use crate::cli::Cli;
use crate::error::{Result, VisualboardError};
use crate::model::ScenarioKey;
use crate::sidepanel::{PostOutcome, Trigger, TurnInput, TurnOutcome, TOAST_FORCED, TOAST_RESTORED, TOAST_UPDATED};

pub struct AnalyzeArgs {
    pub text: Option<String>,
    pub file: Option<PathBuf>,
    pub scenario_key: String,
    pub force: bool,
    pub auto: bool,
    pub message_id: Option<String>,
}

pub async fn run(cli: &Cli, args: AnalyzeArgs) -> Result<()> {
    let text = match (&args.text, &args.file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path).await?,
        (None, None) => {
            return Err(VisualboardError::Other(
                "Provide the turn text or --file".to_string(),
            ))
        }
    };

    let (panel, mut notices) = open_panel(cli).await?;
    let trigger = if args.auto {
        Trigger::auto()
    } else {
        Trigger::manual(args.force)
    };
    let input = TurnInput::new(text)
        .with_scenario_key(Some(ScenarioKey::new(args.scenario_key.clone())))
        .with_message_id(args.message_id.clone());

    let result = panel.process_turn(input, trigger).await;
    print_notices(&mut notices);
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e.user_message());
            return Err(e);
        }
    };

    let turn = panel.turn_id().await.map(|t| t.to_string());
    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "outcome": outcome_name(&outcome),
                "scenarioKey": args.scenario_key,
                "turnId": turn,
            })
        );
    } else {
        let message = match &outcome {
            TurnOutcome::Restored => TOAST_RESTORED,
            TurnOutcome::Skipped => "이미 최신 턴이 표시되어 있습니다.",
            TurnOutcome::Analyzed { .. } if args.force => TOAST_FORCED,
            TurnOutcome::Analyzed { .. } => TOAST_UPDATED,
        };
        eprintln!("{} {}", "✓".green(), message);
        if let Some(turn) = turn {
            eprintln!("  {} {}", "turn:".dimmed(), turn);
        }
    }
    Ok(())
}

fn outcome_name(outcome: &TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::Restored => "restored",
        TurnOutcome::Skipped => "skipped",
        TurnOutcome::Analyzed {
            post: Some(PostOutcome::Duplicate),
        } => "duplicate",
        TurnOutcome::Analyzed { .. } => "analyzed",
    }
}
