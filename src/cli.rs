use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use cypher_query::backend::sqlite::create_sample_database;
use cypher_query::cache::ConnectionCache;
use cypher_query::config::{BackendChoice, ConnectionParams, DispatchSettings};
use cypher_query::conversation::ConversationTurn;
use cypher_query::dispatcher::{Dispatcher, QueryOutcome};
use cypher_query::llm::client_from_env;
use cypher_query::resolve_sample_db_path;

#[derive(Parser)]
#[command(
    name = "cypher-query-cli",
    about = "CypherQuery: ask SQLite, MySQL, Neo4j and MongoDB questions in plain language"
)]
struct Cli {
    /// Output machine-readable JSON (default: human-readable)
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Backend to query
    #[arg(long, global = true, value_enum, default_value = "sqlite")]
    backend: BackendChoice,
    /// MySQL host (host or host:port)
    #[arg(long, global = true, env = "CYPHERQUERY_HOST")]
    host: Option<String>,
    /// MySQL user or Neo4j username
    #[arg(long, global = true, env = "CYPHERQUERY_USER")]
    user: Option<String>,
    /// MySQL or Neo4j password
    #[arg(long, global = true, env = "CYPHERQUERY_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Database name (Neo4j defaults to "neo4j")
    #[arg(long, global = true, env = "CYPHERQUERY_DATABASE")]
    database: Option<String>,
    /// Neo4j HTTP URL or MongoDB connection string
    #[arg(long, global = true, env = "CYPHERQUERY_URI", hide_env_values = true)]
    uri: Option<String>,
    /// MongoDB collection
    #[arg(long, global = true, env = "CYPHERQUERY_COLLECTION")]
    collection: Option<String>,
    /// Sample SQLite database path
    #[arg(long, global = true)]
    path: Option<PathBuf>,
}

impl From<ConnectionArgs> for ConnectionParams {
    fn from(args: ConnectionArgs) -> Self {
        Self {
            backend: Some(args.backend),
            host: args.host,
            user: args.user,
            password: args.password,
            database: args.database,
            uri: args.uri,
            collection: args.collection,
            path: args.path.map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ask a single question
    Ask {
        /// Question in plain language (positional, collects remaining args)
        question: Vec<String>,
    },
    /// Interactive session (:history, :reset, :quit)
    Chat,
    /// Show the fields the selected backend exposes
    Schema,
    /// Create the sample STUDENT database
    InitSample,
}

// ============================================================================
// Output
// ============================================================================

fn print_outcome(outcome: &QueryOutcome, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    match outcome {
        QueryOutcome::Answer { answer, result } => {
            println!("{answer}");
            if let Some(result) = result {
                for record in &result.records {
                    println!("  {}", serde_json::to_string(record)?);
                }
                if result.truncated {
                    println!("  ... (truncated at {} records)", result.records.len());
                }
            }
        }
        QueryOutcome::Error { kind, message } => {
            eprintln!("Error ({kind:?}): {message}");
        }
    }
    Ok(())
}

fn print_history(turns: &[ConversationTurn], json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(turns)?);
    } else {
        for turn in turns {
            let who = serde_json::to_value(turn.role)?;
            println!("[{}] {}", who.as_str().unwrap_or("?"), turn.content);
        }
    }
    Ok(())
}

/// Ask one question, cancelling it on Ctrl-C.
async fn ask(dispatcher: &mut Dispatcher, question: &str) -> QueryOutcome {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    let outcome = dispatcher.ask_with_cancel(question, &cancel).await;
    watcher.abort();
    outcome
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let sample_db = resolve_sample_db_path();

    if let Command::InitSample = cli.command {
        let path = cli.connection.path.unwrap_or(sample_db);
        let inserted = create_sample_database(&path).await?;
        if cli.json {
            println!(
                "{}",
                serde_json::json!({ "path": path.display().to_string(), "inserted": inserted })
            );
        } else if inserted == 0 {
            eprintln!("Sample database already populated at {}", path.display());
        } else {
            eprintln!("Created {} ({inserted} rows)", path.display());
        }
        return Ok(());
    }

    let llm = client_from_env().map_err(|e| {
        format!("{e}\n\nQuestions are translated by a model; set GROQ_API_KEY or ANTHROPIC_API_KEY.")
    })?;

    let settings = DispatchSettings::from_env();
    let cache = Arc::new(ConnectionCache::native(settings.connection_ttl));
    let mut dispatcher = Dispatcher::new(cache.clone(), Arc::from(llm), settings);

    let config = ConnectionParams::from(cli.connection).into_config(sample_db);
    let label = config.label();
    dispatcher.select_backend(config).await?;

    let mut failed = false;
    let result: Result<(), Box<dyn std::error::Error>> = match cli.command {
        Command::Ask { question } => {
            let question = question.join(" ");
            if question.trim().is_empty() {
                Err("Provide a question, e.g. `cypher-query-cli ask how many students are in AIML`".into())
            } else {
                let outcome = ask(&mut dispatcher, question.trim()).await;
                failed = outcome.error_kind().is_some();
                print_outcome(&outcome, cli.json)
            }
        }
        Command::Chat => chat(&mut dispatcher, &label, cli.json).await,
        Command::Schema => match dispatcher.describe_schema().await {
            Ok(schema) if cli.json => serde_json::to_string_pretty(&schema)
                .map(|s| println!("{s}"))
                .map_err(Into::into),
            Ok(schema) => {
                println!("{}", schema.render());
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        Command::InitSample => Ok(()),
    };

    cache.shutdown().await;
    result?;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn chat(
    dispatcher: &mut Dispatcher,
    label: &str,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Connected to {label}. Commands: :history, :reset, :quit");
    print_history(dispatcher.history(), json)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            ":quit" | ":exit" => break,
            ":history" => print_history(dispatcher.history(), json)?,
            ":reset" => print_history(dispatcher.reset_history(), json)?,
            question => {
                let outcome = ask(dispatcher, question).await;
                print_outcome(&outcome, json)?;
            }
        }
    }
    Ok(())
}
