//! # Módulo de Saída
//!
//! O engine emite os mesmos eventos independente da apresentação; este
//! módulo contém os renderizadores selecionáveis por
//! `configuration.variables.output_mode` (ou `--output-mode` na CLI):
//!
//! - `none` - nada no console; log em arquivo e flow_progress.json
//!   continuam sendo gravados
//! - `gui`  - tabela de progresso viva (uma barra por flow)
//! - `log`  - linhas estruturadas coloridas no console
//! - `json` - uma linha por step finalizado, para automação

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tracing::info;

use crate::flow::{FlowProgress, FlowStatus, StepExecution, StepStatus};

// ============================================================================
// MODO DE SAÍDA
// ============================================================================

/// Modo de apresentação do console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    None,
    Gui,
    Log,
    Json,
}

impl OutputMode {
    /// Interpreta o valor vindo da CLI ou de configuration.variables.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "none" => Some(Self::None),
            "gui" => Some(Self::Gui),
            "log" => Some(Self::Log),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// O modo `log` é o único que quer as linhas de tracing no console.
    pub fn console_tracing(&self) -> bool {
        matches!(self, Self::Log)
    }
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Gui => "gui",
            Self::Log => "log",
            Self::Json => "json",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// SINK DE EVENTOS
// ============================================================================

/// Assinante dos eventos do engine. Implementações devem ser baratas:
/// são chamadas do caminho quente da execução.
pub trait OutputSink: Send + Sync {
    fn flow_started(&self, _flow: &str, _total_steps: usize) {}
    fn step_started(&self, _flow: &str, _step: &str, _attempt: u32) {}
    fn step_finished(&self, _flow: &str, _record: &StepExecution) {}
    fn flow_finished(&self, _flow: &str, _status: FlowStatus) {}

    /// Resumo humano impresso no encerramento.
    fn summary(&self, _progress: &FlowProgress, _elapsed: Duration) {}
}

/// Constrói o sink do modo selecionado.
pub fn make_sink(mode: OutputMode) -> Arc<dyn OutputSink> {
    match mode {
        OutputMode::None => Arc::new(SilentSink),
        OutputMode::Gui => Arc::new(GuiSink::new()),
        OutputMode::Log => Arc::new(LogSink),
        OutputMode::Json => Arc::new(JsonSink),
    }
}

// ============================================================================
// NONE
// ============================================================================

/// Nenhuma saída de console.
pub struct SilentSink;

impl OutputSink for SilentSink {}

// ============================================================================
// LOG
// ============================================================================

/// Linhas coloridas no console, uma por evento relevante.
pub struct LogSink;

impl OutputSink for LogSink {
    fn flow_started(&self, flow: &str, total_steps: usize) {
        info!(flow = %flow, total_steps = total_steps, "Flow iniciado");
    }

    fn step_started(&self, flow: &str, step: &str, attempt: u32) {
        if attempt == 0 {
            info!(flow = %flow, step = %step, "Step iniciado");
        } else {
            info!(flow = %flow, step = %step, attempt = attempt, "Retry de step");
        }
    }

    fn step_finished(&self, flow: &str, record: &StepExecution) {
        match record.status {
            StepStatus::Completed => println!(
                "{} {} / {} ({:.2}s)",
                "✔".green(),
                flow,
                record.step_name,
                record.duration_seconds
            ),
            StepStatus::Failed => println!(
                "{} {} / {} ({:.2}s): {}",
                "✘".red(),
                flow,
                record.step_name,
                record.duration_seconds,
                record.error_messages.last().map(|s| s.as_str()).unwrap_or("")
            ),
            StepStatus::Skipped => println!(
                "{} {} / {} (pulado por jump)",
                "↷".yellow(),
                flow,
                record.step_name
            ),
        }
    }

    fn flow_finished(&self, flow: &str, status: FlowStatus) {
        match status {
            FlowStatus::Completed => println!("{} flow {} completado", "✔".green(), flow),
            FlowStatus::Failed => println!("{} flow {} falhou", "✘".red(), flow),
            _ => {}
        }
    }

    fn summary(&self, progress: &FlowProgress, elapsed: Duration) {
        print_summary(progress, elapsed);
    }
}

// ============================================================================
// JSON
// ============================================================================

/// Uma linha por step finalizado, formato estável para automação.
pub struct JsonSink;

impl OutputSink for JsonSink {
    fn step_finished(&self, _flow: &str, record: &StepExecution) {
        let verdict = match record.status {
            StepStatus::Completed => "SUCCESS",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => return,
        };
        println!(
            "[{}] - {} ({:.2}s)",
            verdict, record.step_name, record.duration_seconds
        );
    }

    fn summary(&self, progress: &FlowProgress, elapsed: Duration) {
        print_summary(progress, elapsed);
    }
}

// ============================================================================
// GUI
// ============================================================================

/// Tabela de progresso viva: uma barra por flow.
pub struct GuiSink {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl GuiSink {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:20!} [{bar:30}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}

impl Default for GuiSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for GuiSink {
    fn flow_started(&self, flow: &str, total_steps: usize) {
        let bar = self.multi.add(ProgressBar::new(total_steps as u64));
        bar.set_style(Self::bar_style());
        bar.set_prefix(flow.to_string());

        let mut bars = match self.bars.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        bars.insert(flow.to_string(), bar);
    }

    fn step_started(&self, flow: &str, step: &str, attempt: u32) {
        let bars = match self.bars.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(bar) = bars.get(flow) {
            if attempt == 0 {
                bar.set_message(step.to_string());
            } else {
                bar.set_message(format!("{} (retry {})", step, attempt));
            }
        }
    }

    fn step_finished(&self, flow: &str, record: &StepExecution) {
        let bars = match self.bars.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(bar) = bars.get(flow) {
            if record.status == StepStatus::Completed {
                bar.inc(1);
            }
        }
    }

    fn flow_finished(&self, flow: &str, status: FlowStatus) {
        let bars = match self.bars.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(bar) = bars.get(flow) {
            match status {
                FlowStatus::Completed => bar.finish_with_message("completado"),
                FlowStatus::Failed => bar.abandon_with_message("falhou"),
                _ => {}
            }
        }
    }

    fn summary(&self, progress: &FlowProgress, elapsed: Duration) {
        print_summary(progress, elapsed);
    }
}

// ============================================================================
// RESUMO
// ============================================================================

fn print_summary(progress: &FlowProgress, elapsed: Duration) {
    let mut executed = 0usize;
    let mut failed = 0usize;
    let mut retries = 0u32;

    for info in progress.flows.values() {
        count_flow(info, &mut executed, &mut failed, &mut retries);
    }

    println!();
    println!("--- Resumo da execução ---");
    println!("Steps executados: {}", executed);
    println!("Steps com falha:  {}", failed);
    println!("Retries:          {}", retries);
    println!("Tempo total:      {:.1}s", elapsed.as_secs_f64());
}

fn count_flow(
    info: &crate::flow::FlowInfo,
    executed: &mut usize,
    failed: &mut usize,
    retries: &mut u32,
) {
    *executed += info
        .steps_executed
        .iter()
        .filter(|r| r.status != StepStatus::Skipped)
        .count();
    *failed += info.failed_steps_count as usize;
    *retries += info.retries_executed;

    for child in info.optional_flows.values() {
        count_flow(child, executed, failed, retries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_mode_parse() {
        assert_eq!(OutputMode::parse("log"), Some(OutputMode::Log));
        assert_eq!(OutputMode::parse("GUI"), Some(OutputMode::Gui));
        assert_eq!(OutputMode::parse("json"), Some(OutputMode::Json));
        assert_eq!(OutputMode::parse("none"), Some(OutputMode::None));
        assert_eq!(OutputMode::parse("quiet"), None);
    }

    #[test]
    fn test_console_tracing_only_in_log_mode() {
        assert!(OutputMode::Log.console_tracing());
        assert!(!OutputMode::Gui.console_tracing());
        assert!(!OutputMode::Json.console_tracing());
        assert!(!OutputMode::None.console_tracing());
    }
}
