//! # Módulo de Telemetria
//!
//! Inicializa o logging estruturado do orquestrador: uma layer de
//! console (apenas no modo de saída `log`) e uma layer de arquivo que
//! grava `factory_flow_orchestrator.log` no diretório de log da
//! execução.
//!
//! Os logs por tipo de dispositivo (`compute_factory_flow.log`,
//! `switch_factory_flow.log`) não passam por aqui: são gravados pela
//! camada de dispositivos, que conhece o destino de cada operação.
//!
//! ## Configuração:
//!
//! O filtro respeita `RUST_LOG` quando definido; caso contrário usa o
//! nível configurado (INFO por padrão).

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Nome do log de nível de engine dentro do diretório de log.
pub const ORCHESTRATOR_LOG: &str = "factory_flow_orchestrator.log";

/// Configuração do sistema de logging.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Diretório de log da execução.
    pub log_dir: PathBuf,

    /// Se deve emitir logs no console (modo de saída `log`).
    pub console: bool,

    /// Nível mínimo de log quando RUST_LOG não está definido.
    pub log_level: Level,
}

impl TelemetryConfig {
    pub fn new<P: AsRef<Path>>(log_dir: P, console: bool) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            console,
            log_level: Level::INFO,
        }
    }
}

/// Inicializa o tracing com as layers de arquivo e console.
///
/// Deve ser chamado uma única vez, antes do engine partir.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    let log_path = config.log_dir.join(ORCHESTRATOR_LOG);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("falha ao abrir {}", log_path.display()))?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Arc::new(file));

    let console_layer = config
        .console
        .then(|| tracing_subscriber::fmt::layer().compact());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("falha ao inicializar logging: {}", e))?;

    tracing::info!(log_dir = %config.log_dir.display(), "Telemetria inicializada");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let config = TelemetryConfig::new("/var/log/rackflow", true);
        assert!(config.console);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(
            config.log_dir.join(ORCHESTRATOR_LOG),
            PathBuf::from("/var/log/rackflow/factory_flow_orchestrator.log")
        );
    }
}
