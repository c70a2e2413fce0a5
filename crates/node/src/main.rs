use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use moltlink_core::{
    BlobStore, FileBlobStore, MemoryBlobStore, MemoryTransport, PeerRef, ProtocolConfig,
    StrategyDocument,
};
use moltlink_session::SessionEngine;
use moltlink_skill::{
    Delegation, DelegationCoordinator, Responder, Skill, SkillRegistry, TaskHandler, TaskReply,
    TaskRequest, Taxonomy,
};

mod config;

use config::NodeConfig;

const CODER: &str = "Code_Agent_Alpha";
const COORDINATOR: &str = "Coordination_Prime";

#[derive(Parser)]
#[command(name = "moltlinkd")]
#[command(about = "moltlink agent daemon - skill discovery and delegation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (defaults to moltlink.json in the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a coordinator and a coder agent against an in-memory feed
    Demo {
        /// Delegation timeout, overriding the configuration
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Keep the coder from answering, to watch a delegation time out
        #[arg(long)]
        silent: bool,

        /// Persist the strategy document under this directory
        #[arg(long)]
        strategy_dir: Option<PathBuf>,
    },
    /// Print the embedded skill taxonomy
    Taxonomy,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = NodeConfig::load(cli.config.as_deref())?;
    if let Some(path) = &config.source {
        info!("Loaded configuration from {}", path.display());
    }

    match cli.command {
        Some(Commands::Demo {
            timeout_ms,
            silent,
            strategy_dir,
        }) => {
            let mut protocol = config.protocol;
            if let Some(timeout_ms) = timeout_ms {
                protocol.delegation.timeout_ms = timeout_ms;
                protocol.validate()?;
            }
            run_demo(protocol, silent, strategy_dir).await?;
        }
        Some(Commands::Taxonomy) => {
            println!("{}", serde_json::to_string_pretty(&Taxonomy::embedded()?)?);
        }
        Some(Commands::Config) | None => {
            println!("{}", serde_json::to_string_pretty(&config.protocol)?);
        }
    }

    Ok(())
}

/// Answers code generation tasks and refuses anything else
struct DemoHandler;

#[async_trait]
impl TaskHandler for DemoHandler {
    async fn handle(&self, request: &TaskRequest, from: &PeerRef) -> TaskReply {
        info!("{} asked for '{}': {}", from, request.skill, request.task);
        match request.skill.as_str() {
            "code_generation" | "code_review" => TaskReply::success("done"),
            other => TaskReply::failure(format!("{} is not offered here", other)),
        }
    }
}

struct DemoAgent {
    engine: Arc<SessionEngine>,
    registry: Arc<SkillRegistry>,
}

fn demo_agent(
    name: &str,
    bio: &str,
    feed: &Arc<MemoryTransport>,
    protocol: &ProtocolConfig,
) -> Result<DemoAgent, Box<dyn Error>> {
    feed.register_agent(name, bio);
    let engine = Arc::new(SessionEngine::new(
        PeerRef::new(name),
        feed.clone(),
        protocol.session.clone(),
        protocol.retry.clone(),
    ));
    let registry = Arc::new(SkillRegistry::new(
        Arc::clone(&engine),
        Taxonomy::embedded()?,
        protocol.registry.clone(),
    ));
    Ok(DemoAgent { engine, registry })
}

async fn run_demo(
    protocol: ProtocolConfig,
    silent: bool,
    strategy_dir: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    info!("🦞 moltlink demo");
    info!("   Delegation timeout: {}ms", protocol.delegation.timeout_ms);

    let feed = Arc::new(MemoryTransport::new());

    let coder = demo_agent(CODER, "code generation and review", &feed, &protocol)?;
    coder
        .registry
        .register_skill(Skill::standard("code_generation").with_confidence(0.9));
    coder
        .registry
        .register_skill(Skill::standard("code_review").with_confidence(0.7));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let responder = if silent {
        warn!("{} will not answer", CODER);
        None
    } else {
        let responder = Responder::new(
            Arc::clone(&coder.engine),
            Arc::clone(&coder.registry),
            Arc::new(DemoHandler),
        );
        Some(tokio::spawn(async move { responder.run(shutdown_rx).await }))
    };

    let boss = demo_agent(COORDINATOR, "plans and hands out work", &feed, &protocol)?;
    let coordinator =
        DelegationCoordinator::new(Arc::clone(&boss.registry), protocol.delegation.clone());

    let store: Arc<dyn BlobStore> = match &strategy_dir {
        Some(dir) => Arc::new(FileBlobStore::new(dir)),
        None => Arc::new(MemoryBlobStore::new()),
    };
    let strategy = StrategyDocument::load(store, "strategy")?;

    let found = boss.registry.discover_agents(Some("code")).await?;
    for profile in &found {
        let skills: Vec<&str> = profile.skills.iter().map(|s| s.name.as_str()).collect();
        info!("📚 {} ({:?}): {:?}", profile.peer, profile.source, skills);
    }

    let results = coordinator
        .delegate_all(&[
            ("code_generation", "implement login"),
            ("review", "review the login handler"),
            ("translation", "translate the release notes"),
        ])
        .await?;

    {
        let mut writer = strategy.writer().await;
        for delegation in &results {
            writer.append(&format!(
                "{} -> {}",
                delegation.required_skill, delegation.state
            ));
        }
    }
    if strategy.checkpoint()? {
        info!("Strategy document saved");
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = responder {
        handle.await?;
    }

    println!();
    println!("Delegation audit trail");
    println!("══════════════════════");
    for delegation in coordinator.history() {
        print_delegation(&delegation);
    }
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&coordinator.metrics())?
    );

    Ok(())
}

fn print_delegation(delegation: &Delegation) {
    let assignee = delegation
        .assignee
        .as_ref()
        .map(PeerRef::to_string)
        .unwrap_or_else(|| "-".to_string());
    let path: Vec<&str> = delegation.transitions.iter().map(|s| s.label()).collect();

    println!("{}  {}", delegation.id, delegation.task);
    println!("    skill:    {}", delegation.required_skill);
    println!("    assignee: {}", assignee);
    println!("    state:    {}", delegation.state);
    println!("    path:     {}", path.join(" -> "));
    if let Some(result) = &delegation.result {
        println!("    result:   {}", result);
    }
    if let Some(ms) = delegation.response_time_ms() {
        println!("    answered in {}ms", ms);
    }
}
