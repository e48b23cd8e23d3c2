use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use revloop_agent::{
    AskAgent, LlmGenerator, MemoryReviewStore, ReviewOrchestrator, SqlAgent, SqliteReviewStore,
};
use revloop_core::config::{AppConfig, StoreKind};
use revloop_core::event::EventBus;
use revloop_core::review::{ReviewPolicy, SessionSnapshot};
use revloop_core::traits::{LlmClient, ReviewStore};
use revloop_core::types::SessionId;
use revloop_core::RevloopError;
use revloop_tools::SqlDatabase;

#[derive(Parser)]
#[command(name = "revloop", version, about = "Human-in-the-loop review for LLM output")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "revloop.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single prompt (or start a prompt loop when none is given)
    Ask {
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Start, resume and inspect review sessions
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },
    /// Answer questions about a SQLite database
    Sql {
        /// Let the model call tools instead of the fixed translate/execute pipeline
        #[arg(long)]
        tools: bool,
        /// Database file (overrides [sql].database)
        #[arg(long)]
        database: Option<PathBuf>,
        #[arg(trailing_var_arg = true)]
        question: Vec<String>,
    },
    /// Start the HTTP review API
    Serve,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ReviewAction {
    /// Generate a first candidate and suspend for a decision
    Start {
        /// Use this session id instead of a generated one
        #[arg(long)]
        id: Option<String>,
        #[arg(trailing_var_arg = true, required = true)]
        input: Vec<String>,
    },
    /// Supply a decision for a suspended session
    Resume {
        id: String,
        /// approve or reject
        decision: String,
        /// Reviewer comment (used with reject)
        #[arg(short, long)]
        feedback: Option<String>,
    },
    /// Show a session without changing it
    Show { id: String },
    /// List live sessions
    List,
    /// Delete a session
    Discard { id: String },
    /// Run the whole review loop at the terminal
    Interactive,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("revloop=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "revloop", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let llm: Arc<dyn LlmClient> = Arc::from(revloop_llm::create_client(&config.model));
    let generator = Arc::new(LlmGenerator::new(llm.clone(), config.model.clone()));

    match cli.command {
        Some(Commands::Config) => {
            let mut shown = config.clone();
            if shown.model.api_key.is_some() {
                shown.model.api_key = Some("********".into());
            }
            println!("{}", toml::to_string_pretty(&shown)?);
        }
        Some(Commands::Ask { prompt }) => {
            let agent = AskAgent::new(generator);
            let text = prompt.join(" ");
            if text.trim().is_empty() {
                run_ask_loop(&agent).await?;
            } else {
                println!("{}", agent.ask(&text).await?);
            }
        }
        Some(Commands::Review { action }) => {
            let store: Arc<dyn ReviewStore> =
                Arc::new(SqliteReviewStore::open(&config.review_db_path())?);
            let orchestrator = build_orchestrator(&config, generator, store);
            run_review(&orchestrator, action).await?;
        }
        Some(Commands::Sql {
            tools,
            database,
            question,
        }) => {
            let path = database.unwrap_or_else(|| config.sql_db_path());
            let db = Arc::new(SqlDatabase::open(&path)?);
            info!(path = %path.display(), "SQL database opened");
            let agent = SqlAgent::new(llm, config.model.clone(), db)
                .with_table_hint(config.sql.table_hint.clone());
            let text = question.join(" ");
            if text.trim().is_empty() {
                run_sql_loop(&agent, tools).await?;
            } else {
                println!("{}", answer_sql(&agent, tools, &text).await?);
            }
        }
        Some(Commands::Serve) => {
            let store: Arc<dyn ReviewStore> = match config.review.store {
                StoreKind::Memory => Arc::new(MemoryReviewStore::new()),
                StoreKind::Sqlite => Arc::new(SqliteReviewStore::open(&config.review_db_path())?),
            };
            let event_bus = Arc::new(EventBus::default());
            let orchestrator = Arc::new(
                ReviewOrchestrator::new(generator, store, event_bus.clone())
                    .with_policy(ReviewPolicy::new(config.review.max_attempts))
                    .with_session_ttl(config.review.session_ttl_secs),
            );

            info!(bind = %config.gateway.bind, store = ?config.review.store, "Starting review API");
            let server =
                revloop_gateway::GatewayServer::new(config.gateway.clone(), orchestrator, event_bus);
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Some(Commands::Completions { .. }) => unreachable!("handled before config load"),
        None => {
            let agent = AskAgent::new(generator);
            run_ask_loop(&agent).await?;
        }
    }

    Ok(())
}

/// `--config` path, then `~/.revloop/config.toml`, then environment variables.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = revloop_core::config::dirs_home() {
        let home_config = home.join(".revloop").join("config.toml");
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!("No config file found, using environment (GROQ_API_KEY, OPENAI_API_KEY, or local Ollama)");
    Ok(AppConfig::from_env())
}

fn build_orchestrator(
    config: &AppConfig,
    generator: Arc<LlmGenerator>,
    store: Arc<dyn ReviewStore>,
) -> ReviewOrchestrator {
    ReviewOrchestrator::new(generator, store, Arc::new(EventBus::default()))
        .with_policy(ReviewPolicy::new(config.review.max_attempts))
        .with_session_ttl(config.review.session_ttl_secs)
}

async fn run_ask_loop(agent: &AskAgent) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("Enter your prompt (type 'exit' or 'q' to quit): ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        if revloop_agent::ask::is_exit_command(&line) {
            println!("Goodbye!");
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        match agent.ask(line.trim()).await {
            Ok(answer) => println!("\n{}\n", answer),
            Err(e) => eprintln!("Error: {}", e),
        }
    }
    Ok(())
}

async fn answer_sql(agent: &SqlAgent, tools: bool, question: &str) -> anyhow::Result<String> {
    let answer = if tools {
        agent.answer_with_tools(question).await?
    } else {
        agent.answer_pipeline(question).await?
    };
    Ok(answer)
}

async fn run_sql_loop(agent: &SqlAgent, tools: bool) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("Ask a question about your data (type 'exit' or 'q' to quit): ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        if revloop_agent::ask::is_exit_command(&line) {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        match answer_sql(agent, tools, line.trim()).await {
            Ok(answer) => println!("\n{}\n", answer),
            Err(e) => eprintln!("Error: {}", e),
        }
    }
    Ok(())
}

async fn run_review(orchestrator: &ReviewOrchestrator, action: ReviewAction) -> anyhow::Result<()> {
    match action {
        ReviewAction::Start { id, input } => {
            let input = input.join(" ");
            let snapshot = match id {
                Some(id) => {
                    orchestrator
                        .start_with_id(SessionId::from_string(&id), &input)
                        .await?
                }
                None => orchestrator.start(&input).await?,
            };
            print_snapshot(&snapshot);
            println!(
                "\nResume with: revloop review resume {} <approve|reject> [--feedback TEXT]",
                snapshot.session_id
            );
        }
        ReviewAction::Resume {
            id,
            decision,
            feedback,
        } => {
            let session_id = SessionId::from_string(&id);
            match orchestrator
                .resume(&session_id, &decision, feedback.as_deref())
                .await
            {
                Ok(snapshot) => print_snapshot(&snapshot),
                Err(RevloopError::TerminalSession { snapshot, .. }) => {
                    println!("Session already finished; nothing changed.\n");
                    print_snapshot(&snapshot);
                }
                Err(e) => return Err(e.into()),
            }
        }
        ReviewAction::Show { id } => {
            let snapshot = orchestrator.snapshot(&SessionId::from_string(&id)).await?;
            print_snapshot(&snapshot);
        }
        ReviewAction::List => {
            let sessions = orchestrator.list().await?;
            if sessions.is_empty() {
                println!("No review sessions.");
            }
            for s in sessions {
                println!(
                    "{}  {:<18} attempt {}  {}",
                    s.session_id,
                    s.status.as_str(),
                    s.attempt,
                    truncate(s.input.lines().next().unwrap_or(""), 48)
                );
            }
        }
        ReviewAction::Discard { id } => {
            orchestrator.discard(&SessionId::from_string(&id)).await?;
            println!("Discarded {}", id);
        }
        ReviewAction::Interactive => run_interactive_review(orchestrator).await?,
    }
    Ok(())
}

async fn run_interactive_review(orchestrator: &ReviewOrchestrator) -> anyhow::Result<()> {
    let input: String = dialoguer::Input::new()
        .with_prompt("Enter your prompt")
        .interact_text()?;

    let mut snapshot = orchestrator.start(&input).await?;
    while !snapshot.terminal {
        print_snapshot(&snapshot);

        let choice = dialoguer::Select::new()
            .with_prompt("Your decision")
            .items(&["approve", "reject"])
            .default(0)
            .interact()?;

        let (decision, feedback) = if choice == 0 {
            ("approve", None)
        } else {
            let comment: String = dialoguer::Input::new()
                .with_prompt("Feedback (optional)")
                .allow_empty(true)
                .interact_text()?;
            ("reject", Some(comment))
        };

        snapshot = match orchestrator
            .resume(&snapshot.session_id, decision, feedback.as_deref())
            .await
        {
            Ok(s) => s,
            Err(RevloopError::GenerationFailure(e)) => {
                eprintln!("Generation failed: {}. Decide again to retry.", e);
                snapshot
            }
            Err(e) => return Err(e.into()),
        };
    }

    println!();
    print_snapshot(&snapshot);
    Ok(())
}

fn print_snapshot(s: &SessionSnapshot) {
    println!("Session:  {}", s.session_id);
    println!("Status:   {}", s.status);
    println!("Attempt:  {}", s.attempt);
    if !s.decision.as_str().is_empty() {
        println!("Decision: {}", s.decision);
    }
    println!("\n{}", s.candidate);
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
