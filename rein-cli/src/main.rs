mod session_log;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rein_core::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use session_log::SessionLogger;

#[derive(Parser)]
#[command(name = "rein", about = "Phase-driven coding agent")]
struct Args {
    /// What the agent should do
    task: Option<String>,

    /// OpenRouter API key
    #[arg(long, env = "OPENROUTER_API_KEY")]
    api_key: Option<String>,

    /// OpenAI-compatible endpoint; replaces OpenRouter when set
    #[arg(long, env = "REIN_BASE_URL")]
    base_url: Option<String>,

    /// Model for every phase without its own override
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    discovery_model: Option<String>,

    #[arg(long)]
    strategy_model: Option<String>,

    #[arg(long)]
    execute_model: Option<String>,

    /// Maximum model turns before giving up
    #[arg(long)]
    max_turns: Option<usize>,

    /// Project directory to work in (defaults to the current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Command the agent should use to run tests
    #[arg(long)]
    test_cmd: Option<String>,

    /// Command the agent should use to type-check
    #[arg(long)]
    typecheck_cmd: Option<String>,

    /// Override the model's context window, in tokens
    #[arg(long)]
    context_length: Option<usize>,

    /// Print events as JSON lines instead of text
    #[arg(long)]
    json: bool,

    /// Log to stderr instead of ~/.rein/rein.log
    #[arg(long)]
    log_stderr: bool,

    /// Store the resolved provider and options in ~/.rein/config.json
    #[arg(long)]
    save: bool,

    /// Delete ~/.rein/config.json and exit
    #[arg(long)]
    reset: bool,

    /// Check that the model exists and exit
    #[arg(long)]
    validate: bool,
}

fn init_tracing(log_stderr: bool) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("REIN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    if log_stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        let log_dir = session_log::rein_dir();
        std::fs::create_dir_all(&log_dir).ok();
        let log_file = std::fs::File::create(log_dir.join("rein.log"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(log_file)
            .with_ansi(false)
            .init();
    }
    Ok(())
}

/// CLI flags win over the stored config; an explicit base URL selects a generic endpoint.
fn resolve_provider(args: &Args, stored: Option<&ReinConfig>) -> anyhow::Result<Provider> {
    if let Some(base_url) = &args.base_url {
        let model = args
            .model
            .clone()
            .or_else(|| stored.map(|c| c.provider.default_model().to_string()))
            .ok_or_else(|| anyhow::anyhow!("--model is required with --base-url"))?;
        return Ok(Provider::OpenAiCompatible {
            api_key: args.api_key.clone(),
            base_url: base_url.clone(),
            model,
        });
    }
    if let Some(api_key) = &args.api_key {
        return Ok(Provider::OpenRouter {
            api_key: api_key.clone(),
            base_url: "https://openrouter.ai/api/v1".into(),
        });
    }
    stored.map(|c| c.provider.clone()).ok_or_else(|| {
        anyhow::anyhow!("no provider configured: set OPENROUTER_API_KEY or pass --api-key")
    })
}

fn print_event(event: &AgentEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }
    match event {
        AgentEvent::TextDelta { content } => {
            print!("{content}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::TurnStarted { turn, phase, model } => {
            eprintln!("\n── turn {turn} · {phase} · {model}");
        }
        AgentEvent::ActionResult {
            tag,
            success,
            preview,
            ..
        } => {
            let mark = if *success { "ok" } else { "FAILED" };
            let first = preview.lines().next().unwrap_or_default();
            eprintln!("\n  [{tag}] {mark} {first}");
        }
        AgentEvent::PhaseChanged { from, to, model } => {
            eprintln!("\n── phase {from} → {to} ({model})");
        }
        AgentEvent::Retrying {
            attempt,
            max_attempts,
            delay_ms,
            error,
        } => {
            eprintln!("retry {attempt}/{max_attempts} in {delay_ms}ms: {error}");
        }
        AgentEvent::ContextEvicted {
            tokens_before,
            tokens_after,
        } => {
            eprintln!("context trimmed: ~{tokens_before} → ~{tokens_after} tokens");
        }
        AgentEvent::Error { message } => eprintln!("error: {message}"),
        AgentEvent::Done { .. } => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_stderr)?;

    if args.reset {
        ReinConfig::clear()?;
        eprintln!("removed {}", ReinConfig::config_path().display());
        return Ok(());
    }

    let stored = ReinConfig::load();
    let provider = resolve_provider(&args, stored.as_ref())?;

    let cli_models = PhaseModels {
        discovery: args.discovery_model.clone(),
        strategy: args.strategy_model.clone(),
        execute: args.execute_model.clone(),
    };
    let phase_models = match &stored {
        Some(config) => cli_models.or(&config.phase_models()),
        None => cli_models,
    };
    let test_command = args
        .test_cmd
        .clone()
        .or_else(|| stored.as_ref().and_then(|c| c.test_command.clone()));
    let typecheck_command = args
        .typecheck_cmd
        .clone()
        .or_else(|| stored.as_ref().and_then(|c| c.typecheck_command.clone()));
    let max_turns = args
        .max_turns
        .or_else(|| stored.as_ref().and_then(|c| c.max_turns));

    if args.save {
        let mut config = ReinConfig::new(provider.clone());
        config.phase_models = Some(phase_models.clone());
        config.test_command = test_command.clone();
        config.typecheck_command = typecheck_command.clone();
        config.max_turns = max_turns;
        config.save()?;
        eprintln!("saved {}", ReinConfig::config_path().display());
    }

    let default_model = args
        .model
        .clone()
        .unwrap_or_else(|| provider.default_model().to_string());

    let mut transport = OpenAiCompatible::from_provider(&provider);
    if let Some(tokens) = args.context_length {
        transport = transport.with_context_length(tokens);
    }
    let transport = Arc::new(transport);

    if args.validate {
        if transport.validate_model(&default_model).await? {
            eprintln!("model {default_model} is available");
            return Ok(());
        }
        anyhow::bail!("model {default_model} is not offered by {}", provider.base_url());
    }

    let Some(task) = args.task.clone() else {
        if args.save {
            return Ok(());
        }
        anyhow::bail!("no task given");
    };

    let cwd = match &args.cwd {
        Some(dir) => dir.canonicalize()?,
        None => std::env::current_dir()?,
    };

    let mut config = AgentConfig {
        default_model: default_model.clone(),
        phase_models,
        context_length: args.context_length,
        prompt_args: PromptArgs::for_dir(&cwd).with_commands(test_command, typecheck_command),
        ..Default::default()
    };
    if let Some(turns) = max_turns {
        config.max_turns = turns;
    }

    let mut agent = Agent::new(transport, Toolbox::local(&cwd), config);
    tracing::info!(agent_id = agent.agent_id(), cwd = %cwd.display(), "agent ready");

    let mut logger = match SessionLogger::create(&session_log::sessions_dir(), &default_model, &cwd, &task) {
        Ok(logger) => Some(logger),
        Err(e) => {
            tracing::warn!(error = %e, "session log disabled");
            None
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let json = args.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(logger) = logger.as_mut() {
                logger.log_event(&event);
            }
            print_event(&event, json);
        }
        logger
    });

    let result = agent.run(&task, tx, cancel).await;
    if let Ok(Some(logger)) = printer.await {
        tracing::debug!(path = %logger.path().display(), "session log closed");
    }
    println!();

    match result {
        Ok(RunOutcome::Completed { summary }) => {
            eprintln!("done: {summary}");
            Ok(())
        }
        Ok(RunOutcome::Idle { .. }) => Ok(()),
        Ok(RunOutcome::TurnLimit { turns }) => {
            eprintln!("stopped after {turns} turns without finishing");
            std::process::exit(2);
        }
        Err(AgentError::Cancelled) => {
            eprintln!("cancelled");
            std::process::exit(130);
        }
        Err(e) => Err(e.into()),
    }
}
