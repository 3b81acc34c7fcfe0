use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use assessor_core::{
    Dispatcher, GoogleProviderFactory, HistoryStore, OriginLabel, ProviderFactory, Services, resolve_session,
};
use assessor_gateway::{GatewayServer, GatewayState};
use assessor_knowledge::{GoogleEmbedder, KnowledgeDb, KnowledgeRetriever, Ledger, QaPair, SqliteMemoryStore};

mod config;

use config::AssessorConfig;

#[derive(Parser)]
#[command(name = "assessor")]
#[command(version)]
#[command(about = "Assessor: multi-agent assistant for water treatment plant teams")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Start,

    /// Send a one-shot message through the full dispatch flow
    Ask {
        /// Email of the requesting employee
        #[arg(short, long)]
        email: String,

        /// The message to send
        message: String,
    },

    /// Initialize config directory and default config
    Init,

    /// Show current configuration (secrets masked)
    Config,

    /// Load question/answer pairs from a JSON array of {question, answer}
    Ingest {
        file: PathBuf,
    },

    /// Manage employees
    Employee {
        #[command(subcommand)]
        command: EmployeeCommands,
    },
}

#[derive(Subcommand)]
enum EmployeeCommands {
    /// Register an employee
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },

    /// List registered employees
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
        Commands::Ask { email, message } => cmd_ask(&cli.config, &email, &message).await,
        Commands::Ingest { file } => cmd_ingest(&cli.config, &file).await,
        Commands::Employee { command } => cmd_employee(&cli.config, command).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        config::write_default(&config_path)?;
        info!("Created default config at {}", config_path.display());
    }

    println!("Assessor initialized at {}", config_dir.display());
    println!("Set ASSESSOR_API_TOKEN and GOOGLE_API_KEY, or edit {}.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = AssessorConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.redacted())?);
    Ok(())
}

fn open_db(cfg: &AssessorConfig) -> Result<KnowledgeDb> {
    let db_path = cfg.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data dir: {}", parent.display()))?;
    }
    KnowledgeDb::open(&db_path)
}

fn build_services(cfg: &AssessorConfig, db: KnowledgeDb) -> Result<Services> {
    let google = &cfg.providers.google;
    if google.api_key.trim().is_empty() {
        warn!("providers.google.api_key is empty; knowledge retrieval will fail");
    }
    let embedder = GoogleEmbedder::new(
        google.api_key.clone(),
        google.embedding_model.clone(),
        google.embedding_dimensions,
    )?;

    Ok(Services {
        ledger: Ledger::new(db.clone()),
        memory: Arc::new(SqliteMemoryStore::new(db.clone())),
        retriever: KnowledgeRetriever::new(db, Arc::new(embedder)),
        histories: Arc::new(HistoryStore::new()),
    })
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = AssessorConfig::load(config_path)?;
    if cfg.gateway.api_token.trim().is_empty() {
        bail!("gateway.api_token is empty. Set ASSESSOR_API_TOKEN or configure a token before starting.");
    }
    info!("Starting assessor...");

    let db = open_db(&cfg)?;
    let services = build_services(&cfg, db)?;
    match services.retriever.count().await {
        Ok(n) => info!("Knowledge base holds {} Q&A pair(s)", n),
        Err(e) => warn!("Could not count knowledge base entries: {}", e),
    }

    let bind: SocketAddr = format!("{}:{}", cfg.gateway.bind, cfg.gateway.port)
        .parse()
        .with_context(|| format!("Invalid gateway address {}:{}", cfg.gateway.bind, cfg.gateway.port))?;

    let state = GatewayState {
        factory: Arc::new(GoogleProviderFactory::new(cfg.providers.google.settings())),
        services,
        settings: cfg.dispatch.clone(),
        auth_token: cfg.gateway.api_token.clone(),
    };
    let server = GatewayServer::new(bind, state, cfg.gateway.allowed_origins.clone());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let server_task = tokio::spawn(server.run(async move { shutdown.cancelled().await }));

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    server_task.await.context("Server task panicked")??;

    println!("Assessor stopped.");
    Ok(())
}

async fn cmd_ask(config_path: &Option<PathBuf>, email: &str, message: &str) -> Result<()> {
    let cfg = AssessorConfig::load(config_path)?;
    let db = open_db(&cfg)?;
    let services = build_services(&cfg, db)?;

    let factory = GoogleProviderFactory::new(cfg.providers.google.settings());
    let backends = factory.build(&cfg.providers.google.api_key)?;
    let session_id = resolve_session(&services.ledger, email, cfg.dispatch.call_timeout()).await?;

    let dispatcher = Dispatcher::new(backends, services, cfg.dispatch.clone());
    let outcome = dispatcher.handle_or_error(&session_id, message).await;

    println!("{}", outcome.text);
    if outcome.origin == OriginLabel::Erro {
        bail!("dispatch failed");
    }
    info!("origin: {}", outcome.origin);
    Ok(())
}

async fn cmd_ingest(config_path: &Option<PathBuf>, file: &PathBuf) -> Result<()> {
    let cfg = AssessorConfig::load(config_path)?;
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let pairs: Vec<QaPair> =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON array of {{question, answer}}", file.display()))?;

    let db = open_db(&cfg)?;
    let services = build_services(&cfg, db)?;
    let stored = services.retriever.ingest(pairs).await?;
    let total = services.retriever.count().await?;

    println!("Ingested {} pair(s); knowledge base now holds {}.", stored, total);
    Ok(())
}

async fn cmd_employee(config_path: &Option<PathBuf>, command: EmployeeCommands) -> Result<()> {
    let cfg = AssessorConfig::load(config_path)?;
    let ledger = Ledger::new(open_db(&cfg)?);

    match command {
        EmployeeCommands::Add { name, email } => {
            let id = ledger.add_employee(&name, &email).await?;
            println!("Employee {} <{}> registered with id {}", name, email, id);
        }
        EmployeeCommands::List => {
            let employees = ledger.list_employees(false).await?;
            if employees.is_empty() {
                println!("No employees registered.");
            }
            for e in employees {
                println!("{}\t{}\t{}", e.id, e.name, e.email);
            }
        }
    }
    Ok(())
}
