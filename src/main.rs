use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::*;

use genesis_kernel::cli::Args;
use genesis_kernel::config::{GeneratorKind, KernelConfig, ReviewPolicy};
use genesis_kernel::error::KernelError;
use genesis_kernel::logging::init_logging;
use genesis_kernel::providers::{HttpProposalGenerator, SimulatedGenerator};
use genesis_kernel::self_modify::invariants::InvariantChecker;
use genesis_kernel::self_modify::memory::MemoryConsolidator;
use genesis_kernel::self_modify::merge::{FsArtifactStore, Integrator, ManifestEntryPoints};
use genesis_kernel::self_modify::orchestrator::{Orchestrator, OrchestratorConfig, PipelineParts, TaskClient};
use genesis_kernel::self_modify::planner::{Planner, ProposalGenerator};
use genesis_kernel::self_modify::registry::TaskStatus;
use genesis_kernel::self_modify::verify::{AssumePassHarness, Verifier};
use genesis_kernel::self_tune::goal_engine::GoalEngine;
use genesis_kernel::self_tune::homeostasis::{HomeostasisMonitor, ProcMemoryProbe};
use genesis_kernel::store::KernelStore;
use genesis_kernel::web;

fn print_banner(cfg: &KernelConfig, generator: &str) {
    eprintln!("{}", "=".repeat(50).bright_blue());
    eprintln!("{} {}", "genesis-kernel".bright_cyan().bold(), web::KERNEL_VERSION.dimmed());
    eprintln!("  generator : {}", generator.bright_green());
    eprintln!("  review    : {}", cfg.pipeline.review.to_string().bright_yellow());
    eprintln!("  store     : {}", cfg.storage.db_path.display());
    eprintln!("{}", "=".repeat(50).bright_blue());
}

fn build_generator(cfg: &KernelConfig) -> Result<Arc<dyn ProposalGenerator>, KernelError> {
    match cfg.generator.kind {
        GeneratorKind::Simulated => Ok(Arc::new(SimulatedGenerator::new())),
        GeneratorKind::Http => {
            let endpoint = cfg.generator.endpoint.clone().ok_or_else(|| {
                KernelError::Config("generator.endpoint is required when generator.kind = \"http\"".into())
            })?;
            let timeout = Duration::from_secs(cfg.generator.timeout_secs);
            Ok(Arc::new(HttpProposalGenerator::new(endpoint, timeout)?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let cfg = args.load_config()?;
    init_logging(&args.log_level);

    let goal_engine = Arc::new(GoalEngine::new(&cfg.goal_engine));
    goal_engine.spawn_estimator(cfg.goal_engine.estimate_interval());

    let homeostasis = HomeostasisMonitor::new(cfg.homeostasis.clone(), Box::new(ProcMemoryProbe));
    homeostasis.start();

    let memory = MemoryConsolidator::spawn(&cfg.memory);
    let generator = build_generator(&cfg)?;
    print_banner(&cfg, generator.name());

    let planner = Planner::new(generator, Arc::clone(&goal_engine), memory.clone())
        .with_homeostasis(homeostasis.clone());
    let integrator = Integrator::new(
        Arc::new(FsArtifactStore::new(cfg.storage.artifact_dir.clone())),
        Arc::new(ManifestEntryPoints::new(cfg.storage.integration_manifest.clone())),
    );
    let orc = Orchestrator::new(
        OrchestratorConfig::from(&cfg.pipeline),
        PipelineParts {
            planner,
            checker: InvariantChecker::new(&cfg.invariants),
            verifier: Verifier::new(&cfg.verifier, Box::new(AssumePassHarness)),
            integrator,
            goal_engine,
            memory: memory.clone(),
            homeostasis: Some(homeostasis),
        },
    );

    let store = Arc::new(KernelStore::open(&cfg.storage.db_path)?);
    orc.restore_from(&store).await?;
    orc.spawn_persistence(Arc::clone(&store), cfg.storage.sync_interval());

    let client: Arc<dyn TaskClient> = Arc::new(orc.clone());

    if let Some(request) = args.implement.as_deref() {
        if orc.review_policy() == ReviewPolicy::Required {
            // A reviewer needs somewhere to approve from.
            eprintln!("{} review required; decide at http://{}/reviews", "note:".yellow(), cfg.server.addr);
            let addr = cfg.server.addr.clone();
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                if let Err(e) = web::serve(&addr, client).await {
                    tracing::error!(target: "kernel::web", error = %e, "server stopped");
                }
            });
        }

        let id = orc.implement(request);
        let task = orc
            .wait_terminal(&id, Duration::from_millis(50))
            .await
            .ok_or_else(|| KernelError::Aborted(format!("task {id} vanished")))?;
        memory.flush().await;
        orc.sync_to(&store).await?;

        println!("{}", serde_json::to_string_pretty(&task)?);
        if task.status == TaskStatus::Failed {
            std::process::exit(1);
        }
        return Ok(());
    }

    tokio::select! {
        res = web::serve(&cfg.server.addr, client) => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target: "kernel", "shutting down");
        }
    }
    memory.flush().await;
    orc.sync_to(&store).await?;
    Ok(())
}
