//! Custodes: custody testing and gated proposals for AI personas.
//!
//! Four personas (Imperium, Guardian, Sandbox, Conquest) take recurring
//! custody tests. Their results feed per-persona metrics, and two pure gates
//! read those metrics:
//!
//! - **level-up**: a persona levels only while its recent pass rate holds.
//! - **proposal generation**: a persona may file code-change proposals only
//!   while it keeps passing custody tests.
//!
//! Proposals move through a review lifecycle (`pending` → `approved` →
//! `test-passed` → `applied`) and are written to the workspace only when
//! the target file still matches what was analyzed.
//!
//! # Architecture
//!
//! All state lives in one store directory (`~/.custodes/` or
//! `<repo>/.custodes/`) holding a SQLite database, the broker audit log
//! (`broker.events.jsonl`) and `custodes.toml`. Every read and write goes
//! through [`core::broker::DbBroker`].
//!
//! Background work runs as independent fixed-interval loops in
//! [`plugins::scheduler`]; a failing iteration is logged and the loop keeps
//! going.
//!
//! # Examples
//!
//! ```bash
//! custodes init
//! custodes custody test --persona guardian
//! custodes gate --persona guardian
//! custodes agent run --persona guardian
//! custodes proposal list --status pending
//! custodes serve
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: store, broker, schemas, config, logging, time helpers
//! - [`plugins`]: personas, metrics, gates, custody tests, proposals, loops

pub mod core;
pub mod plugins;
pub mod subsystems;

use core::{
    config::Config,
    error::CustodesError,
    logging::{self, LogFormat, LogOptions},
    output,
    store::Store,
    time,
};
use plugins::{
    agents, auto_apply,
    custody::CustodyService,
    eligibility,
    generators::TestCategory,
    learning, metrics,
    persona::Persona,
    proposals::{self, ProposalFilter, ProposalStatus},
    repo,
    scheduler::{Scheduler, ServiceContext},
};

use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(
    name = "custodes",
    version = env!("CARGO_PKG_VERSION"),
    about = "Custody testing, eligibility gates and proposals for AI personas"
)]
struct Cli {
    /// Store root (defaults to ./.custodes if present, else ~/.custodes).
    #[clap(long, global = true)]
    store: Option<PathBuf>,
    /// Config file (defaults to <store>/custodes.toml).
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    /// Log filter, e.g. `info` or `custodes=debug`. Overrides RUST_LOG.
    #[clap(long, global = true)]
    log_level: Option<String>,
    #[clap(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,
    /// Append logs to this file instead of stderr.
    #[clap(long, global = true)]
    log_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store, its tables and a default config file.
    Init,
    /// Run every enabled background loop until Ctrl-C.
    Serve,
    /// Persona metrics.
    Metrics(MetricsCli),
    /// Print the level-up and proposal-generation verdicts.
    Gate {
        /// Omit to print every persona.
        #[clap(long)]
        persona: Option<Persona>,
    },
    /// Custody tests.
    Custody(CustodyCli),
    /// Persona analysis passes.
    Agent(AgentCli),
    /// Code-change proposals.
    Proposal(ProposalCli),
    /// One auto-apply pass over tested proposals.
    Apply {
        /// Report what would be written without touching files.
        #[clap(long)]
        dry_run: bool,
    },
    /// One learning cycle over every persona.
    Learn,
}

#[derive(clap::Args, Debug)]
struct MetricsCli {
    #[clap(subcommand)]
    command: MetricsCommand,
}

#[derive(Subcommand, Debug)]
enum MetricsCommand {
    Show {
        #[clap(long)]
        persona: Option<Persona>,
    },
    /// Most recent custody test rows, newest first.
    History {
        #[clap(long)]
        persona: Persona,
        #[clap(long, default_value = "20")]
        limit: usize,
    },
    /// Zero a persona's counters and delete its test history.
    Reset {
        #[clap(long)]
        persona: Persona,
    },
}

#[derive(clap::Args, Debug)]
struct CustodyCli {
    #[clap(subcommand)]
    command: CustodyCommand,
}

#[derive(Subcommand, Debug)]
enum CustodyCommand {
    Test {
        /// Omit to test every persona.
        #[clap(long)]
        persona: Option<Persona>,
        #[clap(long)]
        category: Option<TestCategory>,
    },
    Olympic,
    Collab,
}

#[derive(clap::Args, Debug)]
struct AgentCli {
    #[clap(subcommand)]
    command: AgentCommand,
}

#[derive(Subcommand, Debug)]
enum AgentCommand {
    Run {
        /// Omit to run every persona.
        #[clap(long)]
        persona: Option<Persona>,
    },
}

#[derive(clap::Args, Debug)]
struct ProposalCli {
    #[clap(subcommand)]
    command: ProposalCommand,
}

#[derive(Subcommand, Debug)]
enum ProposalCommand {
    List {
        #[clap(long)]
        persona: Option<Persona>,
        #[clap(long)]
        status: Option<ProposalStatus>,
        #[clap(long)]
        limit: Option<usize>,
    },
    Show {
        #[clap(long)]
        id: String,
    },
    Approve {
        #[clap(long)]
        id: String,
    },
    Reject {
        #[clap(long)]
        id: String,
        #[clap(long)]
        reason: Option<String>,
    },
    /// Run the static checks on an approved proposal.
    Test {
        #[clap(long)]
        id: String,
    },
}

fn emit<T: serde::Serialize>(cmd: &str, key: &str, value: &T) -> Result<(), CustodesError> {
    let mut extra = serde_json::Map::new();
    extra.insert(key.to_string(), serde_json::to_value(value)?);
    let envelope = time::command_envelope(cmd, "ok", serde_json::Value::Object(extra));
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime, CustodesError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn personas(only: Option<Persona>) -> Vec<Persona> {
    match only {
        Some(p) => vec![p],
        None => Persona::ALL.to_vec(),
    }
}

async fn serve(store: Store, config: Arc<Config>) -> Result<(), CustodesError> {
    let custody = Arc::new(CustodyService::from_config(store.clone(), config.clone())?);
    let source = repo::build_source(&config)?;
    tracing::info!(store = %store.root.display(), source = %source.describe(), "custodes service starting");
    let ctx = Arc::new(ServiceContext {
        store,
        config,
        custody,
        source,
    });

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("interrupt received; shutting down"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl-C; shutting down"),
        }
        shutdown.cancel();
    });

    let stats = Scheduler::from_context(ctx, token).run().await;
    emit("serve", "loops", &stats)
}

pub fn run() -> Result<(), CustodesError> {
    let cli = Cli::parse();
    logging::init_logging(&LogOptions {
        level: cli.log_level.clone(),
        format: cli.log_format,
        file: cli.log_file.clone(),
    })?;

    let cwd = std::env::current_dir()?;
    let store = Store::resolve(cli.store.as_deref(), &cwd);
    let config_path = cli.config.clone().unwrap_or_else(|| store.config_path());

    let config = Arc::new(Config::load(&config_path)?);
    subsystems::initialize_all_dbs(&store.root)?;
    tracing::debug!(store = %store.root.display(), config = %config_path.display(), "store ready");

    match cli.command {
        Command::Init => {
            if !config_path.exists() {
                fs::write(&config_path, Config::default_toml()?)?;
                tracing::info!(path = %config_path.display(), "default config written");
            }
            emit(
                "init",
                "store",
                &serde_json::json!({
                    "root": store.root,
                    "config": config_path,
                    "subsystems": subsystems::SUBSYSTEMS.iter().map(|s| s.name).collect::<Vec<_>>(),
                }),
            )?;
        }
        Command::Serve => runtime()?.block_on(serve(store, config))?,
        Command::Metrics(m) => match m.command {
            MetricsCommand::Show { persona } => {
                let all = personas(persona)
                    .into_iter()
                    .map(|p| metrics::get_or_create(&store, p))
                    .collect::<Result<Vec<_>, _>>()?;
                emit("metrics.show", "metrics", &all)?;
            }
            MetricsCommand::History { persona, limit } => {
                let rows = metrics::test_history(&store, persona, limit)?;
                emit("metrics.history", "tests", &rows)?;
            }
            MetricsCommand::Reset { persona } => {
                let fresh = metrics::reset(&store, persona)?;
                emit("metrics.reset", "metrics", &fresh)?;
            }
        },
        Command::Gate { persona } => {
            let now = time::now_secs();
            let mut verdicts = Vec::new();
            for p in personas(persona) {
                let m = metrics::get_or_create_at(&store, p, now)?;
                let level_up = eligibility::level_up(&m, &config.gate, now);
                let proposals = eligibility::proposal_generation(&m, &config.gate, now);
                eprintln!(
                    "{}",
                    output::verdict_line(&format!("{} level-up", p), level_up.eligible, &level_up.reasons)
                );
                eprintln!(
                    "{}",
                    output::verdict_line(
                        &format!("{} proposals", p),
                        proposals.eligible,
                        &proposals.reasons
                    )
                );
                verdicts.push(serde_json::json!({
                    "persona": p,
                    "level_up": level_up,
                    "proposal_generation": proposals,
                }));
            }
            emit("gate", "verdicts", &verdicts)?;
        }
        Command::Custody(c) => {
            let service = CustodyService::from_config(store.clone(), config.clone())?;
            let rt = runtime()?;
            match c.command {
                CustodyCommand::Test { persona, category } => {
                    let reports = rt.block_on(async {
                        let mut out = Vec::new();
                        for p in personas(persona) {
                            out.push(service.administer(p, category).await?);
                        }
                        Ok::<_, CustodesError>(out)
                    })?;
                    emit("custody.test", "reports", &reports)?;
                }
                CustodyCommand::Olympic => {
                    let report = rt.block_on(service.olympic_event())?;
                    emit("custody.olympic", "report", &report)?;
                }
                CustodyCommand::Collab => {
                    let report = rt.block_on(service.collaborative_test())?;
                    emit("custody.collab", "report", &report)?;
                }
            }
        }
        Command::Agent(a) => match a.command {
            AgentCommand::Run { persona } => {
                let source = repo::build_source(&config)?;
                let outcomes = runtime()?.block_on(async {
                    let mut out = Vec::new();
                    for p in personas(persona) {
                        out.push(agents::run_persona(&store, &config, p, source.as_ref()).await?);
                    }
                    Ok::<_, CustodesError>(out)
                })?;
                emit("agent.run", "outcomes", &outcomes)?;
            }
        },
        Command::Proposal(p) => match p.command {
            ProposalCommand::List {
                persona,
                status,
                limit,
            } => {
                let list = proposals::list(
                    &store,
                    &ProposalFilter {
                        persona,
                        status,
                        limit,
                    },
                )?;
                emit("proposal.list", "proposals", &list)?;
            }
            ProposalCommand::Show { id } => {
                emit("proposal.show", "proposal", &proposals::get(&store, &id)?)?;
            }
            ProposalCommand::Approve { id } => {
                emit("proposal.approve", "proposal", &proposals::approve(&store, &id)?)?;
            }
            ProposalCommand::Reject { id, reason } => {
                let rejected = proposals::reject(&store, &id, reason.as_deref())?;
                emit("proposal.reject", "proposal", &rejected)?;
            }
            ProposalCommand::Test { id } => {
                let report = proposals::test_proposal(&store, &id)?;
                eprintln!("{}", report.render());
                emit("proposal.test", "report", &report)?;
            }
        },
        Command::Apply { dry_run } => {
            let report = auto_apply::apply_ready(&store, &config.apply_workspace(), dry_run)?;
            emit("apply", "report", &report)?;
        }
        Command::Learn => {
            let insights = learning::learning_cycle(&store, &config.gate)?;
            emit("learn", "insights", &insights)?;
        }
    }
    Ok(())
}
