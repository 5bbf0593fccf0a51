//! Interface de linha de comando baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (simulate, config)
//! e a flag global `--verbose`.

use clap::{Parser, Subcommand};

/// Núcleo de orquestração multi-projeto com máquinas de estado hierárquicas.
#[derive(Debug, Parser)]
#[command(name = "fsm-orchestrator", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o pipeline embutido em vários projetos por algumas rodadas.
    Simulate {
        /// Quantidade de projetos simulados.
        #[arg(long, default_value_t = 4)]
        projects: usize,

        /// Quantidade de rodadas (tick do orquestrador + rodada do scheduler).
        #[arg(long, default_value_t = 10)]
        rounds: usize,

        /// Sobrescreve o orçamento de tokens por projeto.
        #[arg(long)]
        token_budget: Option<u64>,
    },

    /// Mostra a configuração efetiva em TOML.
    Config,
}
