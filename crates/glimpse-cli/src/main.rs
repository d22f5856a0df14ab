use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use glimpse_contracts::analysis::{AnalysisOutcome, LifecycleStatus, DEFAULT_PROMPT};
use glimpse_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use glimpse_engine::{
    default_analyzer_registry, resolve_analyzer, AnalysisSession, AnalyzerConfig,
    AnalyzerRegistry, ImageSelection, LifecycleController,
};
use serde_json::{json, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "glimpse", version, about = "Ask a vision model about an image")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Analyze(AnalyzeArgs),
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Print the final session view as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("glimpse error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
    }
}

struct Workspace {
    config: AnalyzerConfig,
    analyzers: AnalyzerRegistry,
    session: AnalysisSession,
}

/// Resolves the analyzer for `model` and opens a session around it. A
/// missing API key for a Gemini model is fatal here.
fn open_session(model: Option<String>, events: Option<PathBuf>, mode: &str) -> Result<Workspace> {
    let config = AnalyzerConfig::from_env().with_model(model);
    let analyzers = default_analyzer_registry(&config)?;
    let resolved = resolve_analyzer(&config, &analyzers, None)?;
    if config.model.is_some() {
        if let Some(reason) = resolved.fallback_reason.as_deref() {
            eprintln!("{reason} Using {}.", resolved.model.name);
        }
    }
    tracing::debug!(
        model = %resolved.model.name,
        analyzer = resolved.analyzer.name(),
        "analyzer resolved"
    );

    let controller = LifecycleController::new(resolved.analyzer, resolved.model.name);
    let mut session = AnalysisSession::new(controller);
    if let Some(path) = events {
        session = session.with_events_path(path);
    }
    emit_session_event(
        &session,
        "session_started",
        json!({
            "mode": mode,
            "model": session.controller().model(),
            "analyzer": session.controller().analyzer_name(),
        }),
    )?;
    Ok(Workspace {
        config,
        analyzers,
        session,
    })
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let Workspace { mut session, .. } = open_session(args.model, args.events, "analyze")?;
    session.select_path(&args.image)?;
    session.set_prompt(args.prompt);
    session.submit();
    let status = session.wait(None);

    emit_session_event(&session, "session_finished", json!({ "status": status }))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&session.view())?);
    } else {
        match session.outcome() {
            Some(AnalysisOutcome::Text { text }) => println!("{text}"),
            Some(AnalysisOutcome::Failed { message, .. }) => eprintln!("{message}"),
            None => {}
        }
    }
    Ok(if status == LifecycleStatus::Succeeded { 0 } else { 1 })
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let Workspace {
        config,
        analyzers,
        mut session,
    } = open_session(args.model, args.events, "chat")?;

    let stdin = io::stdin();
    let mut line = String::new();

    println!(
        "Glimpse chat started ({}). Type /help for commands.",
        session.controller().model()
    );

    loop {
        if session.poll() {
            print_outcome(&session);
        }
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => {}
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                println!("Any other line sets the prompt and analyzes the selected image.");
            }
            "select_image" => {
                let path = intent.arg("path").unwrap_or_default();
                if path.is_empty() {
                    println!("/image requires a path");
                    continue;
                }
                match session.select_path(path) {
                    Ok(()) => {
                        if let Some(selection) = session.selection() {
                            println!("Image selected: {}", selection_summary(selection));
                        }
                    }
                    Err(err) => println!("Image not selected: {err:#}"),
                }
            }
            "remove_image" => {
                let had_selection = session.selection().is_some();
                session.remove();
                if had_selection {
                    println!("Image removed.");
                } else {
                    println!("No image selected.");
                }
            }
            "set_prompt" => {
                session.set_prompt(intent.arg("prompt").unwrap_or_default());
                println!("Prompt set to: {}", session.prompt());
            }
            "set_model" => {
                let requested = intent.arg("model").unwrap_or_default();
                if requested.is_empty() {
                    println!("Model: {}", session.controller().model());
                    continue;
                }
                match resolve_analyzer(&config, &analyzers, Some(requested)) {
                    Ok(resolved) => {
                        if let Some(reason) = resolved.fallback_reason.as_deref() {
                            println!("{reason}");
                        }
                        session
                            .controller_mut()
                            .set_analyzer(resolved.analyzer, resolved.model.name.clone());
                        println!("Model set to {}", resolved.model.name);
                    }
                    Err(err) => println!("Model not changed: {err:#}"),
                }
            }
            "analyze" => submit_and_report(&mut session),
            "ask" => {
                session.set_prompt(intent.prompt.clone().unwrap_or_default());
                submit_and_report(&mut session);
            }
            "status" => print_status(&session),
            "wait" => {
                if session.status() == LifecycleStatus::Pending {
                    session.wait(None);
                }
                print_outcome(&session);
            }
            "quit" => break,
            _ => {
                let command = intent.arg("command").unwrap_or_default();
                println!("Unknown command: /{command}. Type /help for commands.");
            }
        }
    }

    emit_session_event(
        &session,
        "session_finished",
        json!({ "status": session.status() }),
    )?;
    Ok(())
}

fn submit_and_report(session: &mut AnalysisSession) {
    session.submit();
    if session.status() == LifecycleStatus::Pending {
        println!("Analyzing... (/wait to block for the result)");
    } else {
        print_outcome(session);
    }
}

fn print_outcome(session: &AnalysisSession) {
    match session.outcome() {
        Some(outcome) => println!("{}", format_outcome(outcome)),
        None => println!("Status: {}", session.status()),
    }
}

fn print_status(session: &AnalysisSession) {
    let view = session.view();
    println!("Status: {}", view.status);
    println!("Model: {}", view.model);
    println!("Prompt: {}", view.prompt);
    match session.selection() {
        Some(selection) => println!("Image: {}", selection_summary(selection)),
        None => println!("Image: none"),
    }
}

fn format_outcome(outcome: &AnalysisOutcome) -> String {
    match outcome {
        AnalysisOutcome::Text { text } => format!("Result: {text}"),
        AnalysisOutcome::Failed { message, .. } => format!("Error: {message}"),
    }
}

fn selection_summary(selection: &ImageSelection) -> String {
    let mut summary = format!(
        "{} ({}",
        selection.source().label(),
        selection.media_type()
    );
    if let Some((width, height)) = selection.preview().dimensions() {
        summary.push_str(&format!(", {width}x{height}"));
    }
    summary.push(')');
    summary
}

fn emit_session_event(session: &AnalysisSession, event_type: &str, payload: Value) -> Result<()> {
    if let Some(events) = session.events() {
        events.emit_json(event_type, payload)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clap::{CommandFactory, Parser};
    use glimpse_contracts::analysis::{FailureKind, NO_IMAGE_MESSAGE};
    use glimpse_engine::{DryrunAnalyzer, LifecycleController};

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn analyze_defaults_to_the_standard_prompt() {
        let cli = Cli::try_parse_from(["glimpse", "analyze", "--image", "cat.png"]).unwrap();
        let Command::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.prompt, "What is this?");
        assert_eq!(args.image, PathBuf::from("cat.png"));
        assert!(args.model.is_none());
        assert!(!args.json);
    }

    #[test]
    fn analyze_requires_an_image() {
        assert!(Cli::try_parse_from(["glimpse", "analyze"]).is_err());
    }

    #[test]
    fn outcome_lines() {
        assert_eq!(
            format_outcome(&AnalysisOutcome::Text {
                text: "A cat.".to_string()
            }),
            "Result: A cat."
        );
        assert_eq!(
            format_outcome(&AnalysisOutcome::failed(FailureKind::NoImage, NO_IMAGE_MESSAGE)),
            format!("Error: {NO_IMAGE_MESSAGE}")
        );
    }

    #[test]
    fn selection_summary_lists_media_type() {
        let controller = LifecycleController::new(Arc::new(DryrunAnalyzer), "dryrun-vision-1");
        let mut session = AnalysisSession::new(controller);
        session.select(vec![1u8, 2], "image/gif");
        let selection = session.selection().unwrap();
        assert_eq!(selection_summary(selection), "<2 bytes> (image/gif)");
    }

    #[test]
    fn session_events_carry_the_session_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let controller = LifecycleController::new(Arc::new(DryrunAnalyzer), "dryrun-vision-1");
        let session = AnalysisSession::new(controller).with_events_path(&events_path);
        emit_session_event(&session, "session_started", json!({ "mode": "chat" }))?;

        let raw = std::fs::read_to_string(&events_path)?;
        let row: Value = serde_json::from_str(raw.trim())?;
        assert_eq!(row["type"], "session_started");
        assert_eq!(row["mode"], "chat");
        assert_eq!(row["session_id"], session.id());
        Ok(())
    }
}
