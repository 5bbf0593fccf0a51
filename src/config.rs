//! Configuração do orquestrador carregada a partir de `orchestrator.toml`.
//!
//! A struct [`OrchestratorConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `ORCHESTRATOR_TOKEN_BUDGET` e `ORCHESTRATOR_LOG`
//! têm precedência sobre o arquivo.

use std::path::Path;

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};

use crate::cost::Budget;

/// Configuração de nível superior carregada de `orchestrator.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Orçamento padrão de tokens por projeto.
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,

    /// Orçamento padrão em dólares por projeto (acompanhado, não imposto).
    #[serde(default = "default_dollar_budget")]
    pub dollar_budget: f64,

    /// Teto semanal de tokens por projeto usado pelo backpressure.
    #[serde(default = "default_weekly_token_cap")]
    pub weekly_token_cap: u64,

    /// Fração do teto semanal a partir da qual tarefas são adiadas.
    #[serde(default = "default_backpressure_ratio")]
    pub backpressure_ratio: f64,

    /// Repetições de um mesmo par (origem, destino) que sinalizam deadlock.
    #[serde(default = "default_deadlock_threshold")]
    pub deadlock_threshold: usize,

    /// Tamanho da janela quente usada por `retrieve`.
    #[serde(default = "default_hot_window")]
    pub hot_window: usize,

    /// Quantidade de resumos mornos devolvidos por `retrieve`.
    #[serde(default = "default_retrieve_top")]
    pub retrieve_top: usize,

    /// Marcador de mensagens de decisão.
    #[serde(default = "default_decision_tag")]
    pub decision_tag: String,

    /// Prazo máximo de uma tarefa despachada, em milissegundos.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    /// Máximo de tarefas executando ao mesmo tempo no pool de workers.
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,

    /// Intervalo entre ticks do laço principal, em milissegundos.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Filtro padrão do `tracing` (sobrescrito por `ORCHESTRATOR_LOG`).
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

// Valor padrão do orçamento de tokens: 100 000.
fn default_token_budget() -> u64 {
    100_000
}

// Valor padrão do orçamento em dólares: 50.
fn default_dollar_budget() -> f64 {
    50.0
}

// Valor padrão do teto semanal: 100 000 tokens.
fn default_weekly_token_cap() -> u64 {
    100_000
}

// Backpressure a partir de 80% do teto.
fn default_backpressure_ratio() -> f64 {
    0.8
}

fn default_deadlock_threshold() -> usize {
    3
}

fn default_hot_window() -> usize {
    20
}

fn default_retrieve_top() -> usize {
    3
}

fn default_decision_tag() -> String {
    crate::memory::DEFAULT_DECISION_TAG.to_string()
}

// Cinco minutos por tarefa despachada.
fn default_dispatch_timeout_ms() -> u64 {
    300_000
}

fn default_max_concurrent_dispatches() -> usize {
    4
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            dollar_budget: default_dollar_budget(),
            weekly_token_cap: default_weekly_token_cap(),
            backpressure_ratio: default_backpressure_ratio(),
            deadlock_threshold: default_deadlock_threshold(),
            hot_window: default_hot_window(),
            retrieve_top: default_retrieve_top(),
            decision_tag: default_decision_tag(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            tick_interval_ms: default_tick_interval_ms(),
            log_filter: default_log_filter(),
        }
    }
}

impl OrchestratorConfig {
    /// Carrega a configuração de `orchestrator.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("orchestrator.toml"))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<OrchestratorConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo.
        if let Ok(raw) = std::env::var("ORCHESTRATOR_TOKEN_BUDGET")
            && !raw.is_empty()
        {
            config.token_budget = raw
                .parse()
                .with_context(|| format!("ORCHESTRATOR_TOKEN_BUDGET is not a number: {raw}"))?;
        }
        if let Ok(filter) = std::env::var("ORCHESTRATOR_LOG")
            && !filter.is_empty()
        {
            config.log_filter = filter;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações que tornariam o scheduler ou o detector inúteis.
    pub fn validate(&self) -> Result<()> {
        if !(self.backpressure_ratio > 0.0 && self.backpressure_ratio <= 1.0) {
            bail!(
                "backpressure_ratio must be in (0, 1], got {}",
                self.backpressure_ratio
            );
        }
        if self.deadlock_threshold == 0 {
            bail!("deadlock_threshold must be at least 1");
        }
        if self.max_concurrent_dispatches == 0 {
            bail!("max_concurrent_dispatches must be at least 1");
        }
        Ok(())
    }

    pub fn budget(&self) -> Budget {
        Budget {
            token_budget: self.token_budget,
            dollar_budget: self.dollar_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_config_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.token_budget, 100_000);
        assert_eq!(config.weekly_token_cap, 100_000);
        assert_eq!(config.backpressure_ratio, 0.8);
        assert_eq!(config.deadlock_threshold, 3);
        assert_eq!(config.hot_window, 20);
        assert_eq!(config.retrieve_top, 3);
        assert_eq!(config.decision_tag, "@DECISION");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            token_budget = 5000
            deadlock_threshold = 2
        "#;
        let config: OrchestratorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.token_budget, 5000);
        assert_eq!(config.deadlock_threshold, 2);
        assert_eq!(config.backpressure_ratio, 0.8);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "weekly_token_cap = 2000\nhot_window = 5").unwrap();
        let config = OrchestratorConfig::load_from(file.path()).unwrap();
        assert_eq!(config.weekly_token_cap, 2000);
        assert_eq!(config.hot_window, 5);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.deadlock_threshold, 3);
    }

    #[test]
    fn load_rejects_invalid_ratio() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backpressure_ratio = 1.5").unwrap();
        assert!(OrchestratorConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = OrchestratorConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: OrchestratorConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
