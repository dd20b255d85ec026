//! # rackflow - Orquestrador de Atualização de Firmware
//!
//! Este é o **ponto de entrada principal** do rackflow, o orquestrador
//! fora de banda de atualizações de firmware para plataformas de
//! servidores de IA em escala de rack (trays de computação e de switch).
//!
//! ## O que este arquivo faz?
//!
//! 1. **Processa argumentos da linha de comando** (CLI) usando a biblioteca `clap`
//! 2. **Carrega** a configuração da plataforma e o arquivo de flow (YAML)
//! 3. **Expande variáveis** `${nome}` e **valida** o flow estaticamente
//! 4. **Executa o flow** com o engine (retries, jumps, optional flows,
//!    paralelismo)
//! 5. **Emite os artefatos** no diretório de log e a linha
//!    `Error Code: <n>` para scripts da fábrica
//!
//! ## Exemplo de uso:
//!
//! ```bash
//! rackflow factory_mode -c config.yaml -f flow.yaml -l ./logs
//! rackflow factory_mode -c config.yaml -f flow.yaml -l ./logs --output-mode json
//! ```
//!
//! ## Arquitetura:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           main.rs                                │
//! │  (CLI, wiring, código de saída)                                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!          ┌──────────────────────┼──────────────────────┐
//!          ▼                      ▼                      ▼
//!    ┌──────────┐          ┌──────────┐           ┌──────────┐
//!    │ loader/  │          │ engine/  │           │   ops/   │
//!    │ expand/  │          │ (sched.) │           │ (Redfish,│
//!    │ validat. │          │          │           │  wait)   │
//!    └──────────┘          └──────────┘           └──────────┘
//! ```

// ============================================================================
// DECLARAÇÃO DE MÓDULOS
// ============================================================================

/// Módulo de configuração: variáveis, conexões, settings.
mod config;

/// Módulo de dispositivos: cache de handles e logs por tipo.
mod devices;

/// Módulo do engine: o scheduler unificado.
mod engine;

/// Módulo de erros: códigos estruturados (E1xxx, E2xxx, etc.).
mod errors;

/// Módulo de expansão: interpolação de ${variáveis}.
mod expand;

/// Módulo de flow: estruturas de dados do grafo e da telemetria.
mod flow;

/// Módulo de handlers: registry de error handlers.
mod handlers;

/// Módulo de carregamento: lê e parseia arquivos de flow.
mod loader;

/// Módulo de operações: capabilities Redfish e wait.
mod ops;

/// Módulo de saída: renderizadores none/gui/log/json.
mod output;

/// Módulo de progresso: telemetria thread-safe e flow_progress.json.
mod progress;

/// Módulo de telemetria: logging estruturado.
mod telemetry;

/// Módulo de validação: passes estáticos sobre o flow.
mod validation;

// ============================================================================
// IMPORTS
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::Configuration;
use devices::DeviceRegistry;
use engine::Engine;
use errors::{ErrorCode, StructuredError};
use loader::LoadError;
use output::OutputMode;
use progress::ProgressTracker;
use telemetry::TelemetryConfig;

// ============================================================================
// DEFINIÇÃO DA CLI
// ============================================================================

/// Estrutura principal da CLI.
#[derive(Parser)]
#[command(name = "rackflow")]
#[command(about = "Orquestrador fora de banda de atualizações de firmware", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Subcomandos disponíveis.
#[derive(Subcommand)]
enum Commands {
    /// Executa um factory flow declarativo.
    #[command(name = "factory_mode")]
    FactoryMode {
        /// YAML de configuração da plataforma (conexões, variáveis, settings).
        #[arg(short = 'c', long = "config")]
        config: PathBuf,

        /// YAML do flow a executar.
        #[arg(short = 'f', long = "flow")]
        flow: PathBuf,

        /// Diretório de log (criado se não existir).
        #[arg(short = 'l', long = "log-dir")]
        log_dir: PathBuf,

        /// Sobrescreve configuration.variables.output_mode.
        ///
        /// Valores: none, gui, log, json.
        #[arg(long = "output-mode")]
        output_mode: Option<String>,
    },
}

// ============================================================================
// FUNÇÃO PRINCIPAL
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let exit_code = match &cli.command {
        Commands::FactoryMode {
            config,
            flow,
            log_dir,
            output_mode,
        } => run_factory_mode(config, flow, log_dir, output_mode.as_deref()).await,
    };

    // Linha estável para automação da fábrica.
    println!("Error Code: {}", exit_code);
    std::process::exit(exit_code);
}

// ============================================================================
// FACTORY MODE
// ============================================================================

/// Orquestra uma execução completa e devolve o código de saída.
async fn run_factory_mode(
    config_path: &PathBuf,
    flow_path: &PathBuf,
    log_dir: &PathBuf,
    output_mode_arg: Option<&str>,
) -> i32 {
    // 1. Diretório de log primeiro: todos os artefatos dependem dele.
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        let err = StructuredError::new(
            ErrorCode::LOG_DIR_ERROR,
            format!("falha ao criar diretório de log '{}': {}", log_dir.display(), e),
        );
        eprintln!("{}", err);
        return err.code.process_exit_code();
    }

    // 2. Configuração da plataforma.
    let config = match Configuration::from_file(config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            let err = StructuredError::new(ErrorCode::CONFIG_FILE_ERROR, e.to_string());
            eprintln!("{}", err);
            return err.code.process_exit_code();
        }
    };

    // 3. Modo de saída: CLI vence a configuração; o padrão é `log`.
    let output_mode = resolve_output_mode(output_mode_arg, &config);

    // 4. Telemetria: arquivo sempre; console apenas no modo `log`.
    //    Se falhar, cai para logging simples no console.
    let telemetry_config = TelemetryConfig::new(log_dir, output_mode.console_tracing());
    if let Err(e) = telemetry::init_telemetry(telemetry_config) {
        eprintln!("Warning: falha ao inicializar telemetria: {}", e);
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    info!(
        config = %config_path.display(),
        flow = %flow_path.display(),
        log_dir = %log_dir.display(),
        output_mode = %output_mode,
        "rackflow factory_mode iniciando"
    );

    // 5. Registries, populados uma vez no start.
    let ops = Arc::new(ops::builtin_registry());
    let handler_registry = Arc::new(handlers::builtin_registry());

    // 6. Carga e validação do flow. Erros aqui são fatais e precedem
    //    qualquer contato com dispositivos.
    let flow = match loader::load_flow_file(flow_path, &config, &ops, &handler_registry) {
        Ok(flow) => Arc::new(flow),
        Err(LoadError::Validation(validation_errors)) => {
            error!(
                code = %ErrorCode::INVALID_FLOW_FORMAT,
                "Validação do flow falhou com {} erro(s):",
                validation_errors.len()
            );
            for err in &validation_errors {
                error!("  - {}", err);
                eprintln!("  - {}", err);
            }
            return ErrorCode::INVALID_FLOW_FORMAT.process_exit_code();
        }
        Err(LoadError::Expand(e)) => {
            error!(code = %ErrorCode::VARIABLE_NOT_DEFINED, error = %e, "Expansão de variáveis falhou");
            eprintln!("[{}] {}", ErrorCode::VARIABLE_NOT_DEFINED, e);
            return ErrorCode::VARIABLE_NOT_DEFINED.process_exit_code();
        }
        Err(e @ LoadError::Parse { .. }) => {
            error!(code = %ErrorCode::INVALID_FLOW_FORMAT, error = %e, "Flow com formato inválido");
            eprintln!("[{}] {}", ErrorCode::INVALID_FLOW_FORMAT, e);
            return ErrorCode::INVALID_FLOW_FORMAT.process_exit_code();
        }
        Err(e @ LoadError::Io { .. }) => {
            error!(code = %ErrorCode::FLOW_FILE_ERROR, error = %e, "Falha ao ler o arquivo de flow");
            eprintln!("[{}] {}", ErrorCode::FLOW_FILE_ERROR, e);
            return ErrorCode::FLOW_FILE_ERROR.process_exit_code();
        }
    };
    info!("Validação do flow passou");

    // 7. Estado compartilhado da execução.
    let tracker = Arc::new(ProgressTracker::new(log_dir));
    let device_registry = Arc::new(DeviceRegistry::new(Arc::clone(&config), log_dir));
    let sink = output::make_sink(output_mode);

    // Ctrl-C propaga o cancelamento para o engine e as operações.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(code = %ErrorCode::CANCELLED, "Interrupção recebida, cancelando execução");
                cancel.cancel();
            }
        });
    }

    // 8. Execução.
    let engine = Engine::new(
        config,
        flow,
        ops,
        device_registry,
        handler_registry,
        tracker,
        sink,
        cancel,
        log_dir.clone(),
    );

    let outcome = engine.run().await;
    info!(outcome = ?outcome, "Execução encerrada");
    outcome.exit_code()
}

/// CLI vence `configuration.variables.output_mode`; valores inválidos
/// caem para `log` com warning.
fn resolve_output_mode(arg: Option<&str>, config: &Configuration) -> OutputMode {
    if let Some(value) = arg {
        if let Some(mode) = OutputMode::parse(value) {
            return mode;
        }
        eprintln!(
            "Warning: --output-mode '{}' desconhecido, usando 'log'",
            value
        );
        return OutputMode::Log;
    }

    if let Some(value) = config.variable_str("output_mode") {
        if let Some(mode) = OutputMode::parse(&value) {
            return mode;
        }
        eprintln!(
            "Warning: variables.output_mode '{}' desconhecido, usando 'log'",
            value
        );
    }

    OutputMode::Log
}
