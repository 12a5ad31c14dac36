use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use stepwise::config::Config;
use stepwise::decompose::Decomposer;
use stepwise::executor::{SubprocessExecutor, SubprocessFailure};
use stepwise::models::{build_lm_client, Cancelled, LmFailure};
use stepwise::orchestrator::baseline::BaselineOrchestrator;
use stepwise::orchestrator::routing::RoutingOptions;
use stepwise::orchestrator::{Orchestrator, RunReport};
use stepwise::plan::store::PlanStore;
use stepwise::skills::SkillRegistry;
use stepwise::utils::truncate_str;

#[derive(Parser, Debug)]
#[command(name = "stepwise", version, about = "Stable-prompt agent orchestration runtime")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct RunArgs {
    /// User query; read from stdin when omitted
    #[arg(long)]
    query: Option<String>,

    /// Use the baseline tool-loop orchestrator instead of stable-prompt mode
    #[arg(long)]
    baseline: bool,

    /// Overall deadline for the request, in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a query through the orchestrator (default)
    Run(RunArgs),
    /// Inspect the plan file
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },
    /// Inspect the skill registry
    Skills {
        #[command(subcommand)]
        action: SkillsAction,
    },
}

#[derive(Subcommand, Debug)]
enum PlanAction {
    /// List all plans with header metadata
    List,
    /// Show a full plan by id
    Show {
        /// Plan id (uuid)
        plan_id: String,
    },
    /// Find plans whose stored query matches the text
    Find {
        text: String,
        /// Require an exact (case-insensitive) match
        #[arg(long)]
        exact: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SkillsAction {
    /// List discovered skills
    List,
}

#[tokio::main]
async fn main() {
    {
        use tracing_subscriber::EnvFilter;
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| stepwise::stepwise_home().join("config.yaml"));

    let code = match dispatch(cli, &config_path).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            classify_error(&e)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli, config_path: &std::path::Path) -> anyhow::Result<i32> {
    let cfg = Config::load(config_path).await?;

    match cli.command {
        Some(Command::Plan { action }) => {
            let store = PlanStore::open(&cfg.plans_dir, &cfg.plan_file).await?;
            plan_command(&store, action).await?;
            Ok(0)
        }
        Some(Command::Skills { action }) => {
            let registry = SkillRegistry::discover(&cfg.skills_dir, &cfg.exclude_skills)?;
            match action {
                SkillsAction::List => {
                    for skill in registry.list_skills(groups(&cfg)) {
                        println!("- {} ({}): {}", skill.name, skill.version, skill.description);
                    }
                }
            }
            Ok(0)
        }
        Some(Command::Run(args)) => run_command(&cfg, args).await,
        None => run_command(&cfg, cli.run).await,
    }
}

fn groups(cfg: &Config) -> Option<&[String]> {
    if cfg.user_groups.is_empty() {
        None
    } else {
        Some(&cfg.user_groups)
    }
}

async fn plan_command(store: &PlanStore, action: PlanAction) -> anyhow::Result<()> {
    match action {
        PlanAction::List => {
            for p in store.list().await? {
                println!(
                    "{}  {}  steps={}  multi={}  {}",
                    p.plan_number,
                    p.plan_id,
                    p.total_steps,
                    p.multi_steps,
                    truncate_str(&p.query, 60)
                );
            }
        }
        PlanAction::Show { plan_id } => match store.get(&plan_id).await? {
            Some(plan) => println!("{}", serde_json::to_string_pretty(&plan)?),
            None => anyhow::bail!("no plan with id {plan_id}"),
        },
        PlanAction::Find { text, exact } => {
            for id in store.find_by_query(&text, exact).await? {
                println!("{id}");
            }
        }
    }
    Ok(())
}

async fn run_command(cfg: &Config, args: RunArgs) -> anyhow::Result<i32> {
    let query = match args.query {
        Some(q) => q,
        None => {
            use tokio::io::AsyncReadExt;
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("reading query from stdin")?;
            buf.trim().to_string()
        }
    };

    let mut registry = SkillRegistry::discover(&cfg.skills_dir, &cfg.exclude_skills)?;
    info!(skills = registry.len(), "skill registry loaded");

    let store = Arc::new(PlanStore::open(&cfg.plans_dir, &cfg.plan_file).await?);
    let lm = build_lm_client(&cfg.model)?;
    let executor = Arc::new(SubprocessExecutor::new());
    let step_timeout = Duration::from_secs(cfg.step_timeout_secs);

    // Wire Ctrl-C into the cancellation token.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl-C, cancelling request");
                cancel.cancel();
            }
        });
    }

    let report = if args.baseline {
        registry.refresh_tool_descriptors(&executor).await;
        let registry = Arc::new(registry);
        let decomposer = Decomposer::new(lm.clone(), &registry, groups(cfg));
        let orchestrator = BaselineOrchestrator::new(
            registry,
            store,
            lm,
            executor,
            decomposer,
            if cfg.user_groups.is_empty() { None } else { Some(cfg.user_groups.clone()) },
            cfg.max_lm_calls,
            step_timeout,
        );
        orchestrator.run(&query, cancel).await?
    } else {
        let registry = Arc::new(registry);
        let decomposer = Decomposer::new(lm.clone(), &registry, groups(cfg));
        let routing = RoutingOptions {
            safe_mode: cfg.safe_mode,
            max_find_results: cfg.max_find_results,
        };
        let orchestrator = Orchestrator::new(
            registry,
            store,
            lm,
            executor,
            decomposer,
            routing,
            step_timeout,
        );
        orchestrator
            .run(&query, args.timeout_secs.map(Duration::from_secs), cancel)
            .await?
    };

    finish(report)
}

fn finish(report: RunReport) -> anyhow::Result<i32> {
    if !report.output.is_empty() {
        println!("{}", report.output);
    }
    if report.cancelled {
        eprintln!("request cancelled; partial plan state preserved");
        return Ok(130);
    }
    info!(
        plan_id = %report.plan_id,
        steps = report.step_count,
        failed = report.failed_step_count,
        "request complete"
    );
    Ok(0)
}

/// Map a terminal error to the documented exit codes.
fn classify_error(e: &anyhow::Error) -> i32 {
    if e.downcast_ref::<Cancelled>().is_some() {
        130
    } else if e.downcast_ref::<LmFailure>().is_some() {
        2
    } else if e.downcast_ref::<SubprocessFailure>().is_some() {
        3
    } else {
        1
    }
}
