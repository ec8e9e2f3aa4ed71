use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;

use spendguard_core::{ManualClock, OperationType, Scope, Tier};
use spendguard_runtime::{
    BudgetAnalytics, ExecutionError, ExecutionOutput, ExecutionRequest, FnExecutor,
    GovernanceService, JsonFileStore, PrimaryExecutor, RuntimeConfig, StateStore, SubmitRequest,
    SystemHealth,
};

#[derive(Parser, Debug)]
#[command(name = "spendguard")]
#[command(about = "Validate configs, simulate load and inspect governance snapshots")]
#[command(version)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a runtime config file against the schema and its invariants.
    Validate {
        /// Config path (.yaml, .yml or .json)
        config: PathBuf,
    },
    /// Replay seeded synthetic traffic through a governed service.
    Simulate {
        /// Config path; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of submissions
        #[arg(long, default_value_t = 200)]
        requests: usize,
        /// Number of distinct callers
        #[arg(long, default_value_t = 10)]
        callers: usize,
        /// Probability that a primary call fails
        #[arg(long, default_value_t = 0.1)]
        failure_rate: f64,
        /// Simulated seconds between submissions
        #[arg(long, default_value_t = 2)]
        step_secs: u64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Save the final state here
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Print budget analytics from a saved snapshot.
    Inspect {
        snapshot: PathBuf,
        /// Show one caller instead of the global scope
        #[arg(long)]
        caller: Option<String>,
        /// Config the snapshot was taken under
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    match cli.command {
        Command::Validate { config } => validate(&config),
        Command::Simulate {
            config,
            requests,
            callers,
            failure_rate,
            step_secs,
            seed,
            snapshot,
        } => {
            let options = SimulationOptions {
                requests,
                callers: callers.max(1),
                failure_rate,
                step: Duration::from_secs(step_secs),
                seed,
            };
            simulate(load_config(config.as_deref())?, options, snapshot).await
        }
        Command::Inspect {
            snapshot,
            caller,
            config,
        } => inspect(&snapshot, caller, load_config(config.as_deref())?).await,
    }
}

fn init_logging(verbose: bool, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose { "spendguard=debug" } else { "spendguard=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

// --- validate ---

fn validate(path: &Path) -> Result<()> {
    let config = RuntimeConfig::from_file(path)
        .with_context(|| format!("{} is not a valid config", path.display()))?;
    let registry = config.tier_registry()?;

    println!("ok: {}", path.display());
    for (tier, limits) in registry.limits_table() {
        println!(
            "  {:<10} daily ${:.2} (+${:.2} overage)  monthly ${:.2}  concurrency {}  {} req/window",
            tier,
            limits.daily_budget,
            limits.max_overage,
            limits.monthly_budget,
            limits.max_concurrency,
            limits.requests_per_window
        );
    }
    println!(
        "  global     daily ${:.2}  emergency cap ${:.2}",
        config.global.daily_budget, config.global.emergency_cap
    );
    Ok(())
}

// --- simulate ---

struct SimulationOptions {
    requests: usize,
    callers: usize,
    failure_rate: f64,
    step: Duration,
    seed: u64,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    submitted: usize,
    accepted: usize,
    denied: BTreeMap<&'static str, usize>,
    executed: usize,
    global: BudgetAnalytics,
    health: SystemHealth,
}

/// Fails when the submission marked the payload to fail.
fn simulated_executor() -> Arc<dyn PrimaryExecutor> {
    Arc::new(FnExecutor::new("simulated", |request: ExecutionRequest| async move {
        if request.payload["fail"].as_bool().unwrap_or(false) {
            return Err(ExecutionError::Upstream("simulated upstream failure".to_string()));
        }
        Ok(ExecutionOutput::new(json!({
            "caller": request.caller_id,
            "operation": request.operation,
            "quality": request.quality,
        })))
    }))
}

async fn simulate(
    config: RuntimeConfig,
    options: SimulationOptions,
    snapshot: Option<PathBuf>,
) -> Result<()> {
    if !(0.0..=1.0).contains(&options.failure_rate) {
        bail!("--failure-rate must be between 0 and 1");
    }

    let clock = ManualClock::shared(Utc::now());
    let health_every = config.intervals.health_check;
    let cleanup_every = config.intervals.cleanup;

    let mut builder = GovernanceService::builder(config)
        .clock(clock.clone())
        .default_executor(simulated_executor());
    if let Some(path) = &snapshot {
        builder = builder.store(Arc::new(JsonFileStore::new(path)));
    }
    let service = builder.build().await?;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let callers: Vec<String> = (0..options.callers).map(|n| format!("caller-{n:03}")).collect();
    for (n, caller) in callers.iter().enumerate() {
        let tier = match n % 10 {
            0 => Tier::Enterprise,
            1..=3 => Tier::Premium,
            _ => Tier::Free,
        };
        service.set_tier(caller, tier)?;
    }

    let mut report = SimulationReport {
        submitted: 0,
        accepted: 0,
        denied: BTreeMap::new(),
        executed: 0,
        global: service.budget_analytics(&Scope::Global),
        health: service.system_health(),
    };
    let mut since_health = Duration::ZERO;
    let mut since_cleanup = Duration::ZERO;

    for n in 0..options.requests {
        let caller = &callers[rng.gen_range(0..callers.len())];
        let operation = OperationType::ALL[rng.gen_range(0..OperationType::ALL.len())];
        let cost = (rng.gen_range(0.01..0.25_f64) * 100.0).round() / 100.0;
        let fail = rng.gen_bool(options.failure_rate);

        report.submitted += 1;
        let request = SubmitRequest::new(caller.clone(), operation, cost, json!({ "n": n, "fail": fail }));
        match service.submit(request) {
            Ok(_) => report.accepted += 1,
            Err(err) => *report.denied.entry(err.kind()).or_default() += 1,
        }
        report.executed += service.process_ready().await;

        clock.advance(options.step);
        since_health += options.step;
        since_cleanup += options.step;
        if since_health >= health_every {
            since_health = Duration::ZERO;
            service.run_health_check();
        }
        if since_cleanup >= cleanup_every {
            since_cleanup = Duration::ZERO;
            service.run_cleanup().await;
        }
    }

    report.executed += service.drain().await;
    service.run_health_check();
    report.global = service.budget_analytics(&Scope::Global);
    report.health = service.system_health();

    if snapshot.is_some() {
        service.persist().await?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// --- inspect ---

#[derive(Debug, Serialize)]
struct Inspection {
    analytics: BudgetAnalytics,
    callers: BTreeMap<String, f64>,
}

async fn inspect(path: &Path, caller: Option<String>, config: RuntimeConfig) -> Result<()> {
    let Some(snapshot) = JsonFileStore::new(path).load().await? else {
        bail!("no snapshot at {}", path.display());
    };

    let mut callers: BTreeMap<String, f64> = BTreeMap::new();
    for record in &snapshot.ledger.records {
        *callers.entry(record.caller_id.clone()).or_default() += record.amount;
    }

    // Analytics are computed as of the moment the snapshot was taken.
    let clock = ManualClock::shared(snapshot.taken_at);
    let service = GovernanceService::builder(config)
        .clock(clock)
        .default_executor(simulated_executor())
        .build()
        .await?;
    service.restore(snapshot)?;

    let scope = match caller {
        Some(caller) => Scope::caller(caller),
        None => Scope::Global,
    };
    let inspection = Inspection {
        analytics: service.budget_analytics(&scope),
        callers,
    };
    println!("{}", serde_json::to_string_pretty(&inspection)?);
    Ok(())
}
