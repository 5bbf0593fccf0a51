mod cli;
mod ui;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::Mutex;
use tracing::info;

use cli::{Cli, Command};
use fsm_orchestrator::agent::PayloadAgent;
use fsm_orchestrator::config::OrchestratorConfig;
use fsm_orchestrator::event::Event;
use fsm_orchestrator::orchestrator::{Orchestrator, ProjectStatus};
use fsm_orchestrator::pipeline;
use fsm_orchestrator::scheduler::{SchedulerService, TaskQueue, WorkerPool};
use fsm_orchestrator::state_machine::{Context, TickContext, TransitionProposal};
use fsm_orchestrator::telemetry::init_tracing;
use ui::SimulationProgress;

// Tokens declared per tick and per agent task in the simulation.
const TICK_TOKENS: u64 = 500;
const TASK_TOKENS: u64 = 800;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = OrchestratorConfig::load()?;
    init_tracing(if cli.verbose { "debug" } else { config.log_filter.as_str() });

    match cli.command {
        Command::Simulate {
            projects,
            rounds,
            token_budget,
        } => {
            if let Some(budget) = token_budget {
                config.token_budget = budget;
            }
            simulate(&config, projects, rounds).await?;
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

/// Projects 1, 3, 5... advance on ticks alone and end up oscillating between
/// implementation and review; projects 2, 4, 6... are driven by agent tasks
/// along the forward path.
async fn simulate(config: &OrchestratorConfig, projects: usize, rounds: usize) -> Result<()> {
    let queue = Arc::new(Mutex::new(TaskQueue::new()));
    let orchestrator = Orchestrator::new(config).with_task_queue(queue.clone());

    let pool = Arc::new(WorkerPool::new(
        Arc::new(PayloadAgent::new("pipeline-agent", 0.000_01)),
        orchestrator.event_sender(),
        config.max_concurrent_dispatches,
        Duration::from_millis(config.dispatch_timeout_ms),
    ));
    let mut scheduler =
        SchedulerService::new(config, queue.clone(), orchestrator.cost_monitor(), pool.clone());

    for n in 1..=projects {
        orchestrator
            .register_project(
                format!("project-{n}"),
                format!("Pipeline {n}"),
                pipeline::build_engine()?,
                pipeline::IDEATION,
                Context::new(),
            )
            .await?;
    }
    info!(projects, rounds, "simulation started");

    let progress = SimulationProgress::start(rounds);
    for round in 1..=rounds {
        scheduler.requeue_postponed().await;

        for (index, view) in orchestrator.projects().await.into_iter().enumerate() {
            if view.status == ProjectStatus::Halted {
                continue;
            }
            if index % 2 == 0 {
                let context = TickContext {
                    est_tokens: TICK_TOKENS,
                    ..TickContext::new(0.5, 0.6, 0.4)
                };
                orchestrator.enqueue_event(Event::tick(view.id, context));
                continue;
            }

            let busy = {
                let queue = queue.lock().await;
                queue.pending(&view.id) > 0 || queue.in_flight().any(|t| t.project_id == view.id)
            };
            let next = view.current_state.as_deref().and_then(|state| {
                pipeline::next_stage(state).map(|target| (state.to_string(), target))
            });
            if let (false, Some((from, to))) = (busy, next) {
                let proposal = TransitionProposal::new(from, to, 0.9, 0.7, 0.8, 1.0);
                scheduler
                    .enqueue(PayloadAgent::task(&view.id, &proposal, TASK_TOKENS))
                    .await;
            }
        }

        let dispatch = scheduler.run().await?;
        // Give dispatched agents a moment so their results land in this round.
        for _ in 0..50 {
            if pool.running() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::task::yield_now().await;

        let report = orchestrator.tick().await;
        progress.round(round, &report, &dispatch);
    }
    progress.finish();

    let mut rows = Vec::new();
    for view in orchestrator.projects().await {
        let cost = orchestrator.cost_report(&view.id).await?;
        rows.push((view, cost));
    }
    progress.print_projects(&rows);
    Ok(())
}
