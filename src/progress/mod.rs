//! # Módulo de Progresso
//!
//! Acumulação thread-safe da telemetria de execução e serialização sob
//! demanda para o `flow_progress.json`.
//!
//! ## Para todos entenderem:
//!
//! Enquanto o engine atualiza firmware, este módulo mantém o "diário de
//! bordo": quais steps rodaram, quantos retries, quais jumps, quanto
//! tempo cada um levou. A automação da fábrica lê o JSON resultante
//! para decidir se o rack está pronto.
//!
//! ## Regras de concorrência:
//!
//! - Um único lock protege todo o estado; seções críticas curtas.
//! - O lock nunca é mantido através de I/O: o snapshot é serializado
//!   sob o lock e gravado em disco depois de soltá-lo.
//! - Os agregados derivados (médias, contagens) são recalculados a cada
//!   snapshot a partir dos registros brutos; dois snapshots consecutivos
//!   sem eventos no meio são byte-idênticos.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::errors::ErrorCode;
use crate::flow::{FlowInfo, FlowProgress, FlowStatus, JumpKind, StepExecution, StepStatus};

// ============================================================================
// CHAVE DE FLOW
// ============================================================================

/// Endereço de um flow dentro da árvore de telemetria.
///
/// O primeiro segmento é o flow de nível superior; os seguintes são
/// optional flows aninhados (um flow de recuperação pode disparar outro).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey(Vec<String>);

impl FlowKey {
    pub fn root(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    /// Profundidade de aninhamento (1 = flow de nível superior).
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Último segmento: o nome exibido do flow.
    pub fn leaf(&self) -> &str {
        self.0.last().map(|s| s.as_str()).unwrap_or("")
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

// ============================================================================
// ESTADO INTERNO
// ============================================================================

/// Registro mutável de um flow. Só dados simples, nenhuma referência
/// viva ao estado do engine: o snapshot é uma cópia barata.
#[derive(Debug, Default)]
struct FlowEntry {
    status: Option<FlowStatus>,
    caller: Option<String>,
    current_step: Option<String>,
    total_steps: u32,
    completed_steps: u32,
    jump_on_success: u32,
    jump_on_failure: u32,
    steps_executed: Vec<StepExecution>,
    optional_flows: BTreeMap<String, FlowEntry>,
}

impl FlowEntry {
    fn status(&self) -> FlowStatus {
        self.status.unwrap_or(FlowStatus::Pending)
    }
}

#[derive(Default)]
struct TrackerState {
    flows: BTreeMap<String, FlowEntry>,
}

impl TrackerState {
    /// Caminha até a entrada do flow, criando os níveis que faltam.
    fn entry_mut(&mut self, key: &FlowKey) -> &mut FlowEntry {
        let mut segments = key.0.iter();
        let root = segments.next().expect("FlowKey sem segmentos");
        let mut entry = self.flows.entry(root.clone()).or_default();
        for segment in segments {
            entry = entry.optional_flows.entry(segment.clone()).or_default();
        }
        entry
    }
}

// ============================================================================
// PROGRESS TRACKER
// ============================================================================

/// Acumulador thread-safe de telemetria de execução.
pub struct ProgressTracker {
    inner: Mutex<TrackerState>,
    snapshot_path: Option<PathBuf>,
}

impl ProgressTracker {
    /// Cria um tracker que grava snapshots em `<log_dir>/flow_progress.json`.
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Self {
        Self {
            inner: Mutex::new(TrackerState::default()),
            snapshot_path: Some(log_dir.as_ref().join("flow_progress.json")),
        }
    }

    /// Tracker sem arquivo de snapshot (para testes do engine).
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(TrackerState::default()),
            snapshot_path: None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ------------------------------------------------------------------
    // Eventos de flow
    // ------------------------------------------------------------------

    /// Registra o flow antes da execução (status Pending).
    pub fn flow_registered(&self, key: &FlowKey, total_steps: usize) {
        let mut state = self.lock();
        let entry = state.entry_mut(key);
        entry.total_steps = total_steps as u32;
        entry.status.get_or_insert(FlowStatus::Pending);
    }

    pub fn flow_started(&self, key: &FlowKey, total_steps: usize) {
        let mut state = self.lock();
        let entry = state.entry_mut(key);
        entry.total_steps = total_steps as u32;
        entry.status = Some(FlowStatus::Running);
    }

    pub fn flow_finished(&self, key: &FlowKey, status: FlowStatus) {
        let mut state = self.lock();
        let entry = state.entry_mut(key);
        entry.status = Some(status);
        entry.current_step = None;
    }

    // ------------------------------------------------------------------
    // Eventos de step
    // ------------------------------------------------------------------

    pub fn step_started(&self, key: &FlowKey, step_name: &str) {
        let mut state = self.lock();
        let entry = state.entry_mut(key);
        entry.current_step = Some(step_name.to_string());
    }

    /// Acrescenta o registro de um cluster de tentativas. Registros nunca
    /// são mutados depois de acrescentados.
    pub fn step_finished(&self, key: &FlowKey, record: StepExecution) {
        let mut state = self.lock();
        let entry = state.entry_mut(key);
        entry.steps_executed.push(record);
    }

    /// O flow avançou além de um slot do escopo (sucesso, jump ou
    /// recuperação por handler).
    pub fn slot_processed(&self, key: &FlowKey) {
        let mut state = self.lock();
        let entry = state.entry_mut(key);
        entry.completed_steps += 1;
    }

    pub fn jump_recorded(&self, key: &FlowKey, kind: JumpKind, _from: &str, _to: &str) {
        let mut state = self.lock();
        let entry = state.entry_mut(key);
        match kind {
            JumpKind::Success => entry.jump_on_success += 1,
            JumpKind::Failure => entry.jump_on_failure += 1,
        }
    }

    // ------------------------------------------------------------------
    // Eventos de optional flow
    // ------------------------------------------------------------------

    /// Abre o sub-registro de um optional flow disparado por `caller`.
    ///
    /// Devolve a chave efetiva: se o mesmo optional flow já foi disparado
    /// antes neste escopo, o novo registro ganha um sufixo `#n` para que
    /// cada disparo preserve seu próprio caller.
    pub fn optional_flow_started(
        &self,
        parent: &FlowKey,
        caller: &str,
        name: &str,
        total_steps: usize,
    ) -> FlowKey {
        let mut state = self.lock();
        let parent_entry = state.entry_mut(parent);

        let mut effective = name.to_string();
        let mut counter = 1;
        while parent_entry.optional_flows.contains_key(&effective) {
            counter += 1;
            effective = format!("{}#{}", name, counter);
        }

        let child = parent_entry.optional_flows.entry(effective.clone()).or_default();
        child.caller = Some(caller.to_string());
        child.total_steps = total_steps as u32;
        child.status = Some(FlowStatus::Running);

        parent.child(effective)
    }

    pub fn optional_flow_finished(&self, key: &FlowKey, status: FlowStatus) {
        self.flow_finished(key, status);
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Constrói o documento de progresso, recomputando os agregados.
    pub fn snapshot(&self) -> FlowProgress {
        let state = self.lock();
        FlowProgress {
            flows: state
                .flows
                .iter()
                .map(|(name, entry)| (name.clone(), build_info(entry)))
                .collect(),
        }
    }

    /// Snapshot serializado como JSON legível.
    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    /// Grava o snapshot no diretório de log. Serializa sob o lock (via
    /// `snapshot`), grava depois de soltá-lo. Falhas de I/O são logadas
    /// e engolidas: a telemetria nunca derruba o flow.
    pub fn write_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };

        let json = match self.snapshot_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(code = %ErrorCode::SERIALIZATION_ERROR, error = %e, "Falha ao serializar snapshot");
                return;
            }
        };

        if let Err(e) = std::fs::write(path, json) {
            warn!(path = %path.display(), error = %e, "Falha ao gravar flow_progress.json");
        }
    }
}

// ============================================================================
// AGREGADOS DERIVADOS
// ============================================================================

/// Converte uma entrada mutável no registro imutável do snapshot,
/// recomputando os agregados a partir dos registros brutos.
fn build_info(entry: &FlowEntry) -> FlowInfo {
    let records = &entry.steps_executed;

    let retries_executed: u32 = records.iter().map(|r| r.retry_attempts).sum();
    let failed_steps_count =
        records.iter().filter(|r| r.status == StepStatus::Failed).count() as u32;

    let executed: Vec<&StepExecution> = records
        .iter()
        .filter(|r| r.status != StepStatus::Skipped)
        .collect();

    let total_testtime_seconds: f64 = executed.iter().map(|r| r.duration_seconds).sum();
    let average_step_duration_seconds = if executed.is_empty() {
        0.0
    } else {
        total_testtime_seconds / executed.len() as f64
    };
    let longest_step_duration_seconds = executed
        .iter()
        .map(|r| r.duration_seconds)
        .fold(0.0, f64::max);

    let step_with_most_retries = executed
        .iter()
        .filter(|r| r.retry_attempts > 0)
        .max_by_key(|r| r.retry_attempts)
        .map(|r| r.step_name.clone());

    FlowInfo {
        status: entry.status(),
        current_step: entry.current_step.clone(),
        completed_steps: entry.completed_steps,
        total_steps: entry.total_steps,
        total_testtime_seconds,
        steps_executed: records.clone(),
        caller: entry.caller.clone(),
        optional_flows: entry
            .optional_flows
            .iter()
            .map(|(name, child)| (name.clone(), build_info(child)))
            .collect(),
        retries_executed,
        jump_on_success_executed: entry.jump_on_success,
        jump_on_failure_executed: entry.jump_on_failure,
        failed_steps_count,
        average_step_duration_seconds,
        longest_step_duration_seconds,
        step_with_most_retries,
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceType;
    use serde_json::json;

    fn record(name: &str, status: StepStatus, retries: u32, duration: f64) -> StepExecution {
        StepExecution {
            execution_id: uuid::Uuid::new_v4().to_string(),
            step_name: name.to_string(),
            operation: "show_version".to_string(),
            device_type: DeviceType::Compute,
            device_id: "tray0".to_string(),
            parameters: json!({}),
            start_ts: "2025-01-01T00:00:00Z".to_string(),
            duration_seconds: duration,
            retry_attempts: retries,
            final_result: status == StepStatus::Completed,
            status,
            error_messages: vec![],
            jump_taken: None,
            optional_flows_triggered: vec![],
        }
    }

    #[test]
    fn test_flow_lifecycle() {
        let tracker = ProgressTracker::in_memory();
        let key = FlowKey::root("main");

        tracker.flow_registered(&key, 2);
        assert_eq!(tracker.snapshot().flows["main"].status, FlowStatus::Pending);

        tracker.flow_started(&key, 2);
        tracker.step_started(&key, "s1");
        let snap = tracker.snapshot();
        assert_eq!(snap.flows["main"].status, FlowStatus::Running);
        assert_eq!(snap.flows["main"].current_step.as_deref(), Some("s1"));

        tracker.step_finished(&key, record("s1", StepStatus::Completed, 0, 1.0));
        tracker.slot_processed(&key);
        tracker.flow_finished(&key, FlowStatus::Completed);

        let snap = tracker.snapshot();
        let info = &snap.flows["main"];
        assert_eq!(info.status, FlowStatus::Completed);
        assert_eq!(info.completed_steps, 1);
        assert!(info.current_step.is_none());
    }

    #[test]
    fn test_derived_aggregates() {
        let tracker = ProgressTracker::in_memory();
        let key = FlowKey::root("main");
        tracker.flow_started(&key, 3);

        tracker.step_finished(&key, record("a", StepStatus::Completed, 0, 2.0));
        tracker.step_finished(&key, record("b", StepStatus::Completed, 3, 4.0));
        tracker.step_finished(&key, record("c", StepStatus::Failed, 1, 6.0));
        tracker.step_finished(&key, record("d", StepStatus::Skipped, 0, 0.0));

        let info = &tracker.snapshot().flows["main"];
        assert_eq!(info.retries_executed, 4);
        assert_eq!(info.failed_steps_count, 1);
        assert_eq!(info.total_testtime_seconds, 12.0);
        assert_eq!(info.average_step_duration_seconds, 4.0); // skipped fora da média
        assert_eq!(info.longest_step_duration_seconds, 6.0);
        assert_eq!(info.step_with_most_retries.as_deref(), Some("b"));
    }

    #[test]
    fn test_jump_counters() {
        let tracker = ProgressTracker::in_memory();
        let key = FlowKey::root("main");
        tracker.flow_started(&key, 4);

        tracker.jump_recorded(&key, JumpKind::Success, "a", "c");
        tracker.jump_recorded(&key, JumpKind::Failure, "b", "d");
        tracker.jump_recorded(&key, JumpKind::Failure, "c", "d");

        let info = &tracker.snapshot().flows["main"];
        assert_eq!(info.jump_on_success_executed, 1);
        assert_eq!(info.jump_on_failure_executed, 2);
    }

    #[test]
    fn test_optional_flow_nesting_and_caller() {
        let tracker = ProgressTracker::in_memory();
        let main = FlowKey::root("main");
        tracker.flow_started(&main, 1);

        let recover = tracker.optional_flow_started(&main, "update_bmc", "recover", 1);
        assert_eq!(recover.leaf(), "recover");

        tracker.step_finished(&recover, record("pc", StepStatus::Completed, 0, 1.0));
        tracker.optional_flow_finished(&recover, FlowStatus::Completed);

        let snap = tracker.snapshot();
        let sub = &snap.flows["main"].optional_flows["recover"];
        assert_eq!(sub.status, FlowStatus::Completed);
        assert_eq!(sub.caller.as_deref(), Some("update_bmc"));
        assert_eq!(sub.steps_executed.len(), 1);
    }

    #[test]
    fn test_optional_flow_retrigger_gets_suffix() {
        let tracker = ProgressTracker::in_memory();
        let main = FlowKey::root("main");
        tracker.flow_started(&main, 2);

        let first = tracker.optional_flow_started(&main, "step_a", "recover", 1);
        let second = tracker.optional_flow_started(&main, "step_b", "recover", 1);

        assert_eq!(first.leaf(), "recover");
        assert_eq!(second.leaf(), "recover#2");

        let snap = tracker.snapshot();
        assert_eq!(
            snap.flows["main"].optional_flows["recover"].caller.as_deref(),
            Some("step_a")
        );
        assert_eq!(
            snap.flows["main"].optional_flows["recover#2"].caller.as_deref(),
            Some("step_b")
        );
    }

    #[test]
    fn test_snapshot_idempotent_without_events() {
        let tracker = ProgressTracker::in_memory();
        let key = FlowKey::root("main");
        tracker.flow_started(&key, 1);
        tracker.step_finished(&key, record("a", StepStatus::Completed, 2, 1.5));

        let first = tracker.snapshot_json().unwrap();
        let second = tracker.snapshot_json().unwrap();
        assert_eq!(first, second); // byte-idênticos
    }

    #[test]
    fn test_write_snapshot_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProgressTracker::new(dir.path());
        let key = FlowKey::root("main");
        tracker.flow_started(&key, 1);
        tracker.write_snapshot();

        let content = std::fs::read_to_string(dir.path().join("flow_progress.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["flows"]["main"]["status"], "Running");
    }

    #[test]
    fn test_concurrent_appends() {
        use std::sync::Arc;

        let tracker = Arc::new(ProgressTracker::in_memory());
        let key_x = FlowKey::root("x");
        let key_y = FlowKey::root("y");
        tracker.flow_started(&key_x, 50);
        tracker.flow_started(&key_y, 50);

        let mut handles = Vec::new();
        for (key, prefix) in [(key_x.clone(), "x"), (key_y.clone(), "y")] {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    tracker.step_finished(
                        &key,
                        record(&format!("{}{}", prefix, i), StepStatus::Completed, 0, 0.1),
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = tracker.snapshot();
        assert_eq!(snap.flows["x"].steps_executed.len(), 50);
        assert_eq!(snap.flows["y"].steps_executed.len(), 50);
    }
}
