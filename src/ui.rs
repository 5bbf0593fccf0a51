//! Interface de terminal da simulação: barra de progresso e tabela de status.
//!
//! Usa `indicatif` para a barra de rodadas e `console` para as cores.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use fsm_orchestrator::cost::CostReport;
use fsm_orchestrator::orchestrator::{ProjectStatus, ProjectView, TickOutcome, TickReport};
use fsm_orchestrator::scheduler::DispatchRound;

/// Acompanha as rodadas da simulação no terminal.
pub struct SimulationProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl SimulationProgress {
    pub fn start(rounds: usize) -> Self {
        let pb = ProgressBar::new(rounds as u64);
        let style = ProgressStyle::default_bar()
            .template("{bar:30.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Imprime o resultado de uma rodada acima da barra e avança.
    pub fn round(&self, round: usize, report: &TickReport, dispatch: &DispatchRound) {
        for (project_id, outcome) in &report.outcomes {
            let line = format!("r{round:<3} {project_id:<12} {outcome}");
            let styled = match outcome {
                TickOutcome::Committed { .. } => self.green.apply_to(line),
                TickOutcome::DeadlockDetected { .. } | TickOutcome::Rejected { .. } => {
                    self.red.apply_to(line)
                }
                TickOutcome::BudgetExceeded { .. } | TickOutcome::Halted => self.yellow.apply_to(line),
                TickOutcome::NoProposals => self.dim.apply_to(line),
            };
            self.pb.println(styled.to_string());
        }
        for (task_id, reason) in &dispatch.postponed {
            self.pb.println(
                self.yellow
                    .apply_to(format!("r{round:<3} task {task_id} postponed: {reason}"))
                    .to_string(),
            );
        }
        for (project_id, error) in &report.errors {
            self.pb.println(
                self.red
                    .apply_to(format!("r{round:<3} {project_id:<12} error: {error}"))
                    .to_string(),
            );
        }
        self.pb.set_message(format!(
            "{} committed, {} dispatched",
            report.committed(),
            dispatch.dispatched.len()
        ));
        self.pb.inc(1);
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }

    /// Tabela final com estado, status e consumo de cada projeto.
    pub fn print_projects(&self, projects: &[(ProjectView, CostReport)]) {
        println!();
        println!(
            "{}",
            self.dim.apply_to(format!(
                "{:<12} {:<16} {:<8} {:>6} {:>14}",
                "PROJECT", "STATE", "STATUS", "MOVES", "TOKENS"
            ))
        );
        for (view, cost) in projects {
            let status = match view.status {
                ProjectStatus::Active => self.green.apply_to(format!("{:<8}", view.status)),
                ProjectStatus::Idle => self.dim.apply_to(format!("{:<8}", view.status)),
                ProjectStatus::Halted => self.red.apply_to(format!("{:<8}", view.status)),
            };
            println!(
                "{:<12} {:<16} {} {:>6} {:>14}",
                view.id,
                view.current_state.as_deref().unwrap_or("-"),
                status,
                view.transitions,
                format!("{}/{}", cost.tokens_used, cost.token_budget),
            );
        }
    }
}
