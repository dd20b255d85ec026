//! # Módulo do Engine de Execução
//!
//! O scheduler unificado: consome o grafo de flow carregado e o dirige
//! até o fim, honrando retries, jumps, optional flows, paralelismo e
//! error handlers.
//!
//! ## Para todos entenderem:
//!
//! O nível superior do flow é normalizado antes de executar: corridas de
//! steps consecutivos já chegam embrulhadas como um flow independente
//! sequencial, então TUDO que o engine agenda é um flow independente.
//! Esse caminho único de execução é o que mantém o scheduler testável.
//!
//! ```text
//! [Run main] [Group: tray0_flow | tray1_flow] [Run main_2]
//!     │              │ (concorrente)              │
//!     ▼              ▼                            ▼
//!   lote 1        lote 2                       lote 3
//! ```
//!
//! ## Dentro de um flow independente:
//!
//! Um ponteiro de instrução percorre os slots do escopo. Cada step
//! executa com seu cluster de tentativas; em caso de falha o protocolo
//! multi-nível decide o destino, na ordem, parando no primeiro que se
//! aplica:
//!
//! 1. **Optional flow** - sub-flow de recuperação; sucesso compra um
//!    cluster de tentativas novo para o step original
//! 2. **jump_on_failure** - move o ponteiro; nenhum handler dispara
//! 3. **Handler de step** - `true` significa recuperado, o flow avança
//! 4. **Flow falha** - todo o nível superior aborta; o handler de nível
//!    de flow roda uma única vez para coleta/limpeza
//!
//! Um mapa `slot → visitas` por flow aborta jumps em loop quando um slot
//! excede `settings.max_step_visits`.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Configuration;
use crate::devices::DeviceRegistry;
use crate::errors::ErrorCode;
use crate::flow::{
    Flow, FlowStatus, FlowStep, IndependentFlow, JumpKind, JumpRecord, ParallelStep, ScopeStep,
    StepExecution, StepStatus, TopItem,
};
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::ops::{OpContext, OperationRegistry};
use crate::output::OutputSink;
use crate::progress::{FlowKey, ProgressTracker};

/// Profundidade máxima de optional flows aninhados. Cadeias de
/// recuperação mais fundas que isso indicam flows se disparando em ciclo.
const MAX_OPTIONAL_DEPTH: usize = 8;

// ============================================================================
// RESULTADO DO ENGINE
// ============================================================================

/// Desfecho da execução completa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl EngineOutcome {
    /// Código para a linha `Error Code: <n>`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Failed => ErrorCode::OPERATION_FAILED.process_exit_code(),
            Self::Cancelled => ErrorCode::CANCELLED.process_exit_code(),
        }
    }
}

// ============================================================================
// TIPOS INTERNOS
// ============================================================================

/// Como um slot foi resolvido depois do protocolo de falha.
enum StepResolution {
    /// Avança o ponteiro em um.
    Advance,
    /// Move o ponteiro para o slot alvo do jump.
    JumpTo(usize),
    /// O flow independente falhou.
    FlowFailed,
}

/// Resultado de um cluster de tentativas de um step.
struct ClusterOutcome {
    ok: bool,
    retry_attempts: u32,
    error_messages: Vec<String>,
    start_ts: String,
    duration_seconds: f64,
}

type ScopeFuture = Pin<Box<dyn Future<Output = FlowStatus> + Send + 'static>>;

// ============================================================================
// ENGINE
// ============================================================================

struct EngineInner {
    config: Arc<Configuration>,
    flow: Arc<Flow>,
    ops: Arc<OperationRegistry>,
    devices: Arc<DeviceRegistry>,
    handlers: Arc<HandlerRegistry>,
    tracker: Arc<ProgressTracker>,
    sink: Arc<dyn OutputSink>,
    cancel: CancellationToken,
    log_dir: PathBuf,
    last_error: StdMutex<Option<String>>,
}

/// O scheduler. Clonável barato: todas as partes são compartilhadas.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Configuration>,
        flow: Arc<Flow>,
        ops: Arc<OperationRegistry>,
        devices: Arc<DeviceRegistry>,
        handlers: Arc<HandlerRegistry>,
        tracker: Arc<ProgressTracker>,
        sink: Arc<dyn OutputSink>,
        cancel: CancellationToken,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                flow,
                ops,
                devices,
                handlers,
                tracker,
                sink,
                cancel,
                log_dir,
                last_error: StdMutex::new(None),
            }),
        }
    }

    // ========================================================================
    // NÍVEL SUPERIOR
    // ========================================================================

    /// Executa o flow completo até o fim ou a primeira falha.
    pub async fn run(&self) -> EngineOutcome {
        let started = Instant::now();
        let flow = Arc::clone(&self.inner.flow);

        // Todos os flows aparecem no snapshot desde o início, como Pending.
        for batch in Self::batches(&flow.items) {
            for scope in &batch {
                self.inner
                    .tracker
                    .flow_registered(&FlowKey::root(&scope.name), scope.steps.len());
            }
        }
        self.inner.tracker.write_snapshot();

        let mut overall = FlowStatus::Completed;

        for batch in Self::batches(&flow.items) {
            if self.inner.cancel.is_cancelled() {
                self.set_last_error("execução cancelada pelo operador");
                overall = FlowStatus::Failed;
                break;
            }

            let batch_ok = if batch.len() == 1 {
                // Lote de tamanho 1 roda na task corrente.
                let scope = Arc::clone(&batch[0]);
                let key = FlowKey::root(&scope.name);
                self.run_scope(scope, key).await == FlowStatus::Completed
            } else {
                self.run_concurrent_batch(batch).await
            };

            // Qualquer flow falho aborta o nível superior inteiro.
            if !batch_ok {
                overall = FlowStatus::Failed;
                break;
            }
        }

        let cancelled = self.inner.cancel.is_cancelled();
        if cancelled {
            overall = FlowStatus::Failed;
        }

        // Teardown: handler de nível de flow, snapshot final, resumo,
        // fechamento de handles. Roda em todo caminho de saída.
        if overall != FlowStatus::Completed {
            self.invoke_flow_handler().await;
        }
        self.inner.tracker.write_snapshot();

        let progress = self.inner.tracker.snapshot();
        self.inner.sink.summary(&progress, started.elapsed());
        self.inner.devices.close_all().await;

        if cancelled {
            EngineOutcome::Cancelled
        } else if overall == FlowStatus::Completed {
            EngineOutcome::Completed
        } else {
            EngineOutcome::Failed
        }
    }

    /// Passe de loteamento: grupos consecutivos de flows independentes se
    /// fundem em um lote concorrente; corridas sequenciais viram lotes de
    /// tamanho 1.
    fn batches(items: &[TopItem]) -> Vec<Vec<Arc<IndependentFlow>>> {
        let mut batches = Vec::new();
        let mut current: Vec<Arc<IndependentFlow>> = Vec::new();

        for item in items {
            match item {
                TopItem::Run(scope) => {
                    if !current.is_empty() {
                        batches.push(std::mem::take(&mut current));
                    }
                    batches.push(vec![Arc::clone(scope)]);
                }
                TopItem::Group(scopes) => {
                    current.extend(scopes.iter().cloned());
                }
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Executa um lote de flows independentes concorrentemente e espera
    /// todos terminarem.
    async fn run_concurrent_batch(&self, batch: Vec<Arc<IndependentFlow>>) -> bool {
        info!(flows = batch.len(), "Executando lote de flows independentes");

        let mut join_set = JoinSet::new();
        for scope in batch {
            let engine = self.clone();
            let key = FlowKey::root(&scope.name);
            join_set.spawn(engine.run_scope(scope, key));
        }

        let mut all_ok = true;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(FlowStatus::Completed) => {}
                Ok(_) => all_ok = false,
                Err(e) => {
                    error!(code = %ErrorCode::INTERNAL_ERROR, error = %e, "Task de flow abortou");
                    self.set_last_error(&format!("task de flow abortou: {}", e));
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    // ========================================================================
    // EXECUÇÃO DE UM FLOW INDEPENDENTE
    // ========================================================================

    /// Dirige um escopo do início ao fim com o ponteiro de instrução.
    ///
    /// Devolve um future `'static` (em Box) para permitir tanto o spawn
    /// em lotes concorrentes quanto a recursão via optional flows.
    fn run_scope(&self, scope: Arc<IndependentFlow>, key: FlowKey) -> ScopeFuture {
        let engine = self.clone();
        Box::pin(async move {
            engine.inner.tracker.flow_started(&key, scope.steps.len());
            engine
                .inner
                .sink
                .flow_started(&key.to_string(), scope.steps.len());
            info!(flow = %key, steps = scope.steps.len(), "Flow iniciado");

            let max_visits = engine.inner.flow.settings.max_step_visits;
            let mut visits: HashMap<usize, u32> = HashMap::new();
            let mut pointer = 0usize;
            let mut status = FlowStatus::Completed;

            while pointer < scope.steps.len() {
                if engine.inner.cancel.is_cancelled() {
                    engine.set_last_error("execução cancelada pelo operador");
                    status = FlowStatus::Failed;
                    break;
                }

                // Prevenção de loop: cada visita ao slot conta, inclusive
                // um jump do slot para ele mesmo.
                let visit_count = visits.entry(pointer).or_insert(0);
                *visit_count += 1;
                if *visit_count > max_visits {
                    let message = format!(
                        "slot '{}' visitado {} vezes; limite é {}",
                        scope.steps[pointer].name(),
                        visit_count,
                        max_visits
                    );
                    error!(code = %ErrorCode::LOOP_DETECTED, flow = %key, "{}", message);
                    engine.set_last_error(&message);
                    status = FlowStatus::Failed;
                    break;
                }

                match &scope.steps[pointer] {
                    ScopeStep::Parallel(block) => {
                        let ok = engine.run_parallel(block, &key).await;
                        engine.inner.tracker.write_snapshot();
                        if ok {
                            engine.inner.tracker.slot_processed(&key);
                            pointer += 1;
                        } else {
                            engine
                                .set_last_error(&format!("bloco paralelo '{}' falhou", block.name));
                            status = FlowStatus::Failed;
                            break;
                        }
                    }
                    ScopeStep::Single(step) => {
                        let resolution = engine.run_step(step, &scope, &key).await;
                        engine.inner.tracker.write_snapshot();
                        match resolution {
                            StepResolution::Advance => {
                                engine.inner.tracker.slot_processed(&key);
                                pointer += 1;
                            }
                            StepResolution::JumpTo(target) => {
                                engine.inner.tracker.slot_processed(&key);
                                // Slots pulados para frente entram como skipped.
                                if target > pointer + 1 {
                                    engine.record_skipped(&scope, &key, pointer + 1, target);
                                }
                                pointer = target;
                            }
                            StepResolution::FlowFailed => {
                                status = FlowStatus::Failed;
                                break;
                            }
                        }
                    }
                }
            }

            engine.inner.tracker.flow_finished(&key, status);
            engine.inner.sink.flow_finished(&key.to_string(), status);
            engine.inner.tracker.write_snapshot();
            info!(flow = %key, status = ?status, "Flow finalizado");
            status
        })
    }

    /// Registros skipped para os slots simples pulados por um jump
    /// para frente.
    fn record_skipped(&self, scope: &IndependentFlow, key: &FlowKey, from: usize, to: usize) {
        for index in from..to.min(scope.steps.len()) {
            if let ScopeStep::Single(step) = &scope.steps[index] {
                let record = StepExecution {
                    execution_id: Uuid::new_v4().to_string(),
                    step_name: step.name.clone(),
                    operation: step.operation.clone(),
                    device_type: step.device_type,
                    device_id: step.device_id.clone(),
                    parameters: step.parameters.clone(),
                    start_ts: Utc::now().to_rfc3339(),
                    duration_seconds: 0.0,
                    retry_attempts: 0,
                    final_result: false,
                    status: StepStatus::Skipped,
                    error_messages: Vec::new(),
                    jump_taken: None,
                    optional_flows_triggered: Vec::new(),
                };
                self.inner.sink.step_finished(&key.to_string(), &record);
                self.inner.tracker.step_finished(key, record);
            }
        }
    }

    // ========================================================================
    // EXECUÇÃO DE UM STEP (PROTOCOLO MULTI-NÍVEL)
    // ========================================================================

    /// Executa um step simples: cluster de tentativas e, em caso de
    /// falha, o protocolo de níveis A-D.
    async fn run_step(
        &self,
        step: &FlowStep,
        scope: &IndependentFlow,
        key: &FlowKey,
    ) -> StepResolution {
        let outcome = self.run_attempt_cluster(step, key).await;
        if outcome.ok {
            return self.finish_success(step, scope, key, outcome).await;
        }

        // Nível A: optional flow de recuperação.
        if let Some(optional_name) = &step.execute_optional_flow {
            let Some(optional_scope) = self.inner.flow.optional_flows.get(optional_name) else {
                // Inalcançável depois da validação.
                self.set_last_error(&format!("optional flow '{}' inexistente", optional_name));
                return StepResolution::FlowFailed;
            };

            let optional_key = self.inner.tracker.optional_flow_started(
                key,
                &step.name,
                optional_name,
                optional_scope.steps.len(),
            );

            // O cluster falho ganha seu registro antes do sub-flow rodar.
            let record = self.make_record(
                step,
                &outcome,
                StepStatus::Failed,
                None,
                vec![optional_key.leaf().to_string()],
            );
            self.inner.sink.step_finished(&key.to_string(), &record);
            self.inner.tracker.step_finished(key, record);
            self.inner.tracker.write_snapshot();

            let optional_status = if optional_key.depth() > MAX_OPTIONAL_DEPTH {
                error!(
                    code = %ErrorCode::OPTIONAL_FLOW_FAILED,
                    flow = %optional_key,
                    "Profundidade máxima de optional flows excedida"
                );
                self.inner
                    .tracker
                    .optional_flow_finished(&optional_key, FlowStatus::Failed);
                FlowStatus::Failed
            } else {
                info!(flow = %key, optional = %optional_name, caller = %step.name, "Disparando optional flow");
                self.run_scope(Arc::clone(optional_scope), optional_key.clone())
                    .await
            };

            if optional_status != FlowStatus::Completed {
                // Recuperação falhou: o flow principal falha imediatamente,
                // sem passar pelos níveis B-D.
                self.set_last_error(&format!("optional flow '{}' falhou", optional_name));
                return StepResolution::FlowFailed;
            }

            // Recuperação completou: um cluster de tentativas novo,
            // independente do contador do cluster original.
            let retry_outcome = self.run_attempt_cluster(step, key).await;
            if retry_outcome.ok {
                return self.finish_success(step, scope, key, retry_outcome).await;
            }
            return self.handle_failure_tail(step, scope, key, retry_outcome).await;
        }

        self.handle_failure_tail(step, scope, key, outcome).await
    }

    /// Níveis B (jump_on_failure), C (handler de step) e D (flow falha).
    async fn handle_failure_tail(
        &self,
        step: &FlowStep,
        scope: &IndependentFlow,
        key: &FlowKey,
        outcome: ClusterOutcome,
    ) -> StepResolution {
        let last_error = outcome
            .error_messages
            .last()
            .cloned()
            .unwrap_or_else(|| "falha sem mensagem".to_string());

        // Nível B: o jump vence; handlers não disparam.
        if let Some(target_tag) = &step.jump_on_failure {
            let Some(&target) = scope.tag_index.get(target_tag) else {
                self.set_last_error(&format!("tag '{}' inexistente no escopo", target_tag));
                return StepResolution::FlowFailed;
            };

            let record = self.make_record(
                step,
                &outcome,
                StepStatus::Failed,
                Some(JumpRecord {
                    kind: JumpKind::Failure,
                    target: target_tag.clone(),
                }),
                Vec::new(),
            );
            self.inner.sink.step_finished(&key.to_string(), &record);
            self.inner.tracker.step_finished(key, record);
            self.inner
                .tracker
                .jump_recorded(key, JumpKind::Failure, &step.name, target_tag);

            warn!(flow = %key, step = %step.name, target = %target_tag, "Jump on failure");
            return StepResolution::JumpTo(target);
        }

        let record = self.make_record(step, &outcome, StepStatus::Failed, None, Vec::new());
        self.inner.sink.step_finished(&key.to_string(), &record);
        self.inner.tracker.step_finished(key, record);

        // Nível C: handler de step pode declarar o step recuperado.
        if let Some(handler_name) = &step.execute_on_error {
            if self.invoke_step_handler(handler_name, step, &last_error).await {
                info!(flow = %key, step = %step.name, handler = %handler_name, "Step recuperado pelo handler");
                return StepResolution::Advance;
            }
        }

        // Nível D: sem recuperação.
        self.set_last_error(&last_error);
        StepResolution::FlowFailed
    }

    /// Caminho de sucesso: registro, jump_on_success e wait_after.
    async fn finish_success(
        &self,
        step: &FlowStep,
        scope: &IndependentFlow,
        key: &FlowKey,
        outcome: ClusterOutcome,
    ) -> StepResolution {
        let mut jump_taken = None;
        let mut resolution = StepResolution::Advance;

        if let Some(target_tag) = &step.jump_on_success {
            match scope.tag_index.get(target_tag) {
                Some(&target) => {
                    jump_taken = Some(JumpRecord {
                        kind: JumpKind::Success,
                        target: target_tag.clone(),
                    });
                    resolution = StepResolution::JumpTo(target);
                }
                None => {
                    self.set_last_error(&format!("tag '{}' inexistente no escopo", target_tag));
                    resolution = StepResolution::FlowFailed;
                }
            }
        }

        let record = self.make_record(
            step,
            &outcome,
            StepStatus::Completed,
            jump_taken.clone(),
            Vec::new(),
        );
        self.inner.sink.step_finished(&key.to_string(), &record);
        self.inner.tracker.step_finished(key, record);

        if let Some(jump) = &jump_taken {
            self.inner
                .tracker
                .jump_recorded(key, JumpKind::Success, &step.name, &jump.target);
        }

        if step.wait_after_seconds > 0 {
            self.sleep_cancellable(step.wait_after_seconds).await;
        }

        resolution
    }

    // ========================================================================
    // CLUSTER DE TENTATIVAS
    // ========================================================================

    /// Até `1 + retry_count` tentativas, com espera entre elas e coleta
    /// das mensagens de erro de cada falha.
    async fn run_attempt_cluster(&self, step: &FlowStep, key: &FlowKey) -> ClusterOutcome {
        let start_ts = Utc::now().to_rfc3339();
        let started = Instant::now();
        let max_attempts = step.retry_count + 1;

        let mut error_messages = Vec::new();
        let mut failures = 0u32;
        let mut ok = false;

        loop {
            self.inner
                .sink
                .step_started(&key.to_string(), &step.name, failures);
            self.inner.tracker.step_started(key, &step.name);

            match self.invoke_capability(step).await {
                Ok(()) => {
                    ok = true;
                    break;
                }
                Err(message) => {
                    warn!(
                        code = %ErrorCode::OPERATION_FAILED,
                        flow = %key,
                        step = %step.name,
                        device = %step.device_key(),
                        attempt = failures + 1,
                        max_attempts = max_attempts,
                        error = %message,
                        "Tentativa falhou"
                    );
                    error_messages.push(message);
                    failures += 1;

                    if failures >= max_attempts || self.inner.cancel.is_cancelled() {
                        break;
                    }
                    if step.wait_between_retries_seconds > 0 {
                        self.sleep_cancellable(step.wait_between_retries_seconds).await;
                    }
                    if self.inner.cancel.is_cancelled() {
                        break;
                    }
                }
            }
        }

        // retry_attempts conta retries, não tentativas: passou de primeira = 0.
        let retry_attempts = if ok { failures } else { failures.saturating_sub(1) };

        ClusterOutcome {
            ok,
            retry_attempts,
            error_messages,
            start_ts,
            duration_seconds: started.elapsed().as_secs_f64(),
        }
    }

    /// Resolve a capability e o handle e invoca a operação.
    async fn invoke_capability(&self, step: &FlowStep) -> Result<(), String> {
        let Some(capability) = self.inner.ops.get(step.device_type, &step.operation) else {
            return Err(format!(
                "operação '{}' não registrada para {}",
                step.operation, step.device_type
            ));
        };

        let device = self
            .inner
            .devices
            .get(step.device_type, &step.device_id)
            .await
            .map_err(|e| format!("{:#}", e))?;

        let ctx = OpContext {
            timeout: step.timeout_seconds.map(Duration::from_secs),
            cancel: self.inner.cancel.clone(),
            log: self.inner.devices.logs(),
        };

        capability
            .invoke(&device, &step.parameters, &ctx)
            .await
            .map_err(|e| format!("{:#}", e))
    }

    // ========================================================================
    // BLOCO PARALELO
    // ========================================================================

    /// Executa os filhos concorrentemente, limitados por `max_workers`.
    /// O bloco tem sucesso somente se todos os filhos têm sucesso.
    async fn run_parallel(&self, block: &ParallelStep, key: &FlowKey) -> bool {
        if block.children.is_empty() {
            return true;
        }

        info!(
            flow = %key,
            block = %block.name,
            children = block.children.len(),
            max_workers = block.max_workers,
            "Executando bloco paralelo"
        );

        let semaphore = Arc::new(Semaphore::new(block.max_workers));
        let mut join_set = JoinSet::new();

        for child in block.children.iter().cloned() {
            let engine = self.clone();
            let key = key.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                engine.run_parallel_child(child, key).await
            });
        }

        let mut all_ok = true;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(true) => {}
                Ok(false) => all_ok = false,
                Err(e) => {
                    error!(code = %ErrorCode::INTERNAL_ERROR, error = %e, "Task de filho paralelo abortou");
                    self.set_last_error(&format!("task de filho paralelo abortou: {}", e));
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    /// Protocolo de falha de um filho paralelo: retries, optional flow e
    /// handler de step. Filhos não têm tags nem jumps.
    async fn run_parallel_child(&self, step: FlowStep, key: FlowKey) -> bool {
        let outcome = self.run_attempt_cluster(&step, &key).await;
        if outcome.ok {
            let record =
                self.make_record(&step, &outcome, StepStatus::Completed, None, Vec::new());
            self.inner.sink.step_finished(&key.to_string(), &record);
            self.inner.tracker.step_finished(&key, record);
            self.inner.tracker.write_snapshot();
            if step.wait_after_seconds > 0 {
                self.sleep_cancellable(step.wait_after_seconds).await;
            }
            return true;
        }

        // Nível A do filho.
        let outcome = if let Some(optional_name) = &step.execute_optional_flow {
            let Some(optional_scope) = self.inner.flow.optional_flows.get(optional_name) else {
                self.set_last_error(&format!("optional flow '{}' inexistente", optional_name));
                return false;
            };

            let optional_key = self.inner.tracker.optional_flow_started(
                &key,
                &step.name,
                optional_name,
                optional_scope.steps.len(),
            );
            let record = self.make_record(
                &step,
                &outcome,
                StepStatus::Failed,
                None,
                vec![optional_key.leaf().to_string()],
            );
            self.inner.sink.step_finished(&key.to_string(), &record);
            self.inner.tracker.step_finished(&key, record);

            let optional_status = if optional_key.depth() > MAX_OPTIONAL_DEPTH {
                self.inner
                    .tracker
                    .optional_flow_finished(&optional_key, FlowStatus::Failed);
                FlowStatus::Failed
            } else {
                self.run_scope(Arc::clone(optional_scope), optional_key.clone())
                    .await
            };

            if optional_status != FlowStatus::Completed {
                self.set_last_error(&format!("optional flow '{}' falhou", optional_name));
                return false;
            }

            let retry_outcome = self.run_attempt_cluster(&step, &key).await;
            if retry_outcome.ok {
                let record = self.make_record(
                    &step,
                    &retry_outcome,
                    StepStatus::Completed,
                    None,
                    Vec::new(),
                );
                self.inner.sink.step_finished(&key.to_string(), &record);
                self.inner.tracker.step_finished(&key, record);
                self.inner.tracker.write_snapshot();
                if step.wait_after_seconds > 0 {
                    self.sleep_cancellable(step.wait_after_seconds).await;
                }
                return true;
            }
            retry_outcome
        } else {
            outcome
        };

        let last_error = outcome
            .error_messages
            .last()
            .cloned()
            .unwrap_or_else(|| "falha sem mensagem".to_string());

        let record = self.make_record(&step, &outcome, StepStatus::Failed, None, Vec::new());
        self.inner.sink.step_finished(&key.to_string(), &record);
        self.inner.tracker.step_finished(&key, record);
        self.inner.tracker.write_snapshot();

        // Nível C do filho.
        if let Some(handler_name) = &step.execute_on_error {
            if self.invoke_step_handler(handler_name, &step, &last_error).await {
                return true;
            }
        }

        self.set_last_error(&format!("filho paralelo '{}' falhou", step.name));
        false
    }

    // ========================================================================
    // ERROR HANDLERS
    // ========================================================================

    /// Invoca um handler de nível de step. Um handler que retorna erro é
    /// tratado como `false`; a falha nunca escapa.
    async fn invoke_step_handler(&self, name: &str, step: &FlowStep, error: &str) -> bool {
        let Some(handler) = self.inner.handlers.get(name) else {
            return false;
        };

        let ctx = self.handler_context().await;
        match handler.handle(Some(step), error, &ctx).await {
            Ok(recovered) => recovered,
            Err(e) => {
                error!(
                    code = %ErrorCode::HANDLER_ERROR,
                    handler = %name,
                    error = %format!("{:#}", e),
                    "Error handler falhou"
                );
                false
            }
        }
    }

    /// Invoca o handler de nível de flow uma única vez, ignorando o
    /// retorno. Chamado somente no teardown de execuções falhas.
    async fn invoke_flow_handler(&self) {
        let Some(name) = self.inner.flow.settings.execute_on_error.clone() else {
            return;
        };
        let Some(handler) = self.inner.handlers.get(&name) else {
            return;
        };

        let error = self
            .last_error()
            .unwrap_or_else(|| "flow falhou".to_string());
        info!(handler = %name, "Invocando error handler de nível de flow");

        let ctx = self.handler_context().await;
        if let Err(e) = handler.handle(None, &error, &ctx).await {
            error!(
                code = %ErrorCode::HANDLER_ERROR,
                handler = %name,
                error = %format!("{:#}", e),
                "Error handler de flow falhou"
            );
        }
    }

    async fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            variables: self.inner.config.variables.clone(),
            log_dir: self.inner.log_dir.clone(),
            devices: self.inner.devices.touched().await,
        }
    }

    // ========================================================================
    // AUXILIARES
    // ========================================================================

    fn make_record(
        &self,
        step: &FlowStep,
        outcome: &ClusterOutcome,
        status: StepStatus,
        jump_taken: Option<JumpRecord>,
        optional_flows_triggered: Vec<String>,
    ) -> StepExecution {
        StepExecution {
            execution_id: Uuid::new_v4().to_string(),
            step_name: step.name.clone(),
            operation: step.operation.clone(),
            device_type: step.device_type,
            device_id: step.device_id.clone(),
            parameters: step.parameters.clone(),
            start_ts: outcome.start_ts.clone(),
            duration_seconds: outcome.duration_seconds,
            retry_attempts: outcome.retry_attempts,
            final_result: status == StepStatus::Completed,
            status,
            error_messages: outcome.error_messages.clone(),
            jump_taken,
            optional_flows_triggered,
        }
    }

    /// Dorme respondendo ao token de cancelamento.
    async fn sleep_cancellable(&self, seconds: u64) {
        tokio::select! {
            _ = sleep(Duration::from_secs(seconds)) => {}
            _ = self.inner.cancel.cancelled() => {}
        }
    }

    fn set_last_error(&self, message: &str) {
        let mut guard = match self.inner.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(message.to_string());
    }

    fn last_error(&self) -> Option<String> {
        match self.inner.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceType, Transport};
    use crate::devices::DeviceHandle;
    use crate::handlers::{self, ErrorHandler, HandlerContext as HCtx, HandlerRegistry};
    use crate::loader;
    use crate::ops::{Capability, OperationRegistry};
    use crate::output::SilentSink;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::{HashMap as StdHashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};

    // ------------------------------------------------------------------
    // Infra de teste: operação roteirizada e handler com contador
    // ------------------------------------------------------------------

    /// Operação cujos resultados vêm de um roteiro. Roteiro esgotado
    /// significa sucesso dali em diante.
    struct ScriptedOp {
        op_name: String,
        script: StdMutex<VecDeque<Result<(), String>>>,
        calls: Arc<AtomicU32>,
        delay: Duration,
    }

    impl ScriptedOp {
        fn new(op_name: &str, script: Vec<Result<(), String>>) -> (Arc<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let op = Arc::new(Self {
                op_name: op_name.to_string(),
                script: StdMutex::new(script.into_iter().collect()),
                calls: Arc::clone(&calls),
                delay: Duration::ZERO,
            });
            (op, calls)
        }

        fn with_delay(op_name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                op_name: op_name.to_string(),
                script: StdMutex::new(VecDeque::new()),
                calls: Arc::new(AtomicU32::new(0)),
                delay,
            })
        }
    }

    #[async_trait]
    impl Capability for ScriptedOp {
        fn name(&self) -> &str {
            &self.op_name
        }

        async fn invoke(
            &self,
            _device: &DeviceHandle,
            _parameters: &serde_json::Value,
            _ctx: &OpContext,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Err(message)) => Err(anyhow!(message)),
                _ => Ok(()),
            }
        }
    }

    /// Handler que sempre devolve o mesmo veredito e conta invocações.
    struct FlagHandler {
        handler_name: String,
        verdict: bool,
        invocations: Arc<AtomicU32>,
    }

    impl FlagHandler {
        fn new(handler_name: &str, verdict: bool) -> (Arc<Self>, Arc<AtomicU32>) {
            let invocations = Arc::new(AtomicU32::new(0));
            let handler = Arc::new(Self {
                handler_name: handler_name.to_string(),
                verdict,
                invocations: Arc::clone(&invocations),
            });
            (handler, invocations)
        }
    }

    #[async_trait]
    impl ErrorHandler for FlagHandler {
        fn name(&self) -> &str {
            &self.handler_name
        }

        async fn handle(
            &self,
            _step: Option<&FlowStep>,
            _error: &str,
            _ctx: &HCtx,
        ) -> anyhow::Result<bool> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdict)
        }
    }

    fn test_config() -> Configuration {
        let transport = Transport {
            ip: "10.0.0.1".to_string(),
            user: "admin".to_string(),
            password: "secret".to_string(),
            port: 443,
            protocol: "https".to_string(),
            tunnel_port: None,
        };

        let mut compute = StdHashMap::new();
        compute.insert("tray0".to_string(), transport.clone());
        compute.insert("tray1".to_string(), transport.clone());
        let mut switch = StdHashMap::new();
        switch.insert("nvsw0".to_string(), transport);

        let mut connection = StdHashMap::new();
        connection.insert(DeviceType::Compute, compute);
        connection.insert(DeviceType::Switch, switch);

        Configuration {
            connection,
            ..Default::default()
        }
    }

    struct Harness {
        engine: Engine,
        tracker: Arc<ProgressTracker>,
        _dir: tempfile::TempDir,
    }

    fn harness(yaml: &str, ops: OperationRegistry, handlers: HandlerRegistry) -> Harness {
        harness_with_cancel(yaml, ops, handlers, CancellationToken::new())
    }

    fn harness_with_cancel(
        yaml: &str,
        ops: OperationRegistry,
        handlers: HandlerRegistry,
        cancel: CancellationToken,
    ) -> Harness {
        let config = Arc::new(test_config());
        let ops = Arc::new(ops);
        let handlers = Arc::new(handlers);

        let flow = Arc::new(
            loader::load_flow_str(yaml, "<teste>", &config, &ops, &handlers)
                .expect("flow de teste válido"),
        );

        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(ProgressTracker::new(dir.path()));
        let devices = Arc::new(DeviceRegistry::new(Arc::clone(&config), dir.path()));

        let engine = Engine::new(
            config,
            flow,
            ops,
            devices,
            handlers,
            Arc::clone(&tracker),
            Arc::new(SilentSink),
            cancel,
            dir.path().to_path_buf(),
        );

        Harness {
            engine,
            tracker,
            _dir: dir,
        }
    }

    fn ok_op(name: &str) -> Arc<ScriptedOp> {
        ScriptedOp::new(name, vec![]).0
    }

    // ------------------------------------------------------------------
    // Cenário 1: caminho feliz com dois steps lineares
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_happy_path_two_linear_steps() {
        let mut ops = OperationRegistry::new();
        ops.register(DeviceType::Compute, ok_op("op"));

        let h = harness(
            r#"
steps:
  - { name: s1, device_type: compute, device_id: tray0, operation: op }
  - { name: s2, device_type: compute, device_id: tray0, operation: op }
"#,
            ops,
            handlers::builtin_registry(),
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Completed);
        assert_eq!(outcome.exit_code(), 0);

        let snap = h.tracker.snapshot();
        let main = &snap.flows["main"];
        assert_eq!(main.status, FlowStatus::Completed);
        assert_eq!(main.completed_steps, 2);
        assert_eq!(main.total_steps, 2);
        assert_eq!(main.steps_executed.len(), 2);
        assert_eq!(main.steps_executed[0].step_name, "s1"); // ordem declarada
        assert_eq!(main.steps_executed[1].step_name, "s2");
        assert_eq!(main.retries_executed, 0);
        assert_eq!(main.jump_on_success_executed, 0);
        assert_eq!(main.jump_on_failure_executed, 0);
        assert!(main.optional_flows.is_empty());
    }

    // ------------------------------------------------------------------
    // Cenário 2: retry e depois sucesso
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_retry_then_success() {
        let mut ops = OperationRegistry::new();
        let (op, calls) = ScriptedOp::new(
            "op",
            vec![Err("e1".to_string()), Err("e2".to_string()), Ok(())],
        );
        ops.register(DeviceType::Compute, op);

        let h = harness(
            r#"
steps:
  - { name: s1, device_type: compute, device_id: tray0, operation: op, retry_count: 2 }
"#,
            ops,
            handlers::builtin_registry(),
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3); // 2 falhas + 1 sucesso

        let snap = h.tracker.snapshot();
        let main = &snap.flows["main"];
        assert_eq!(main.steps_executed.len(), 1);

        let record = &main.steps_executed[0];
        assert_eq!(record.retry_attempts, 2);
        assert!(record.final_result);
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.error_messages, vec!["e1", "e2"]);
        assert_eq!(main.retries_executed, 2);
        assert_eq!(main.step_with_most_retries.as_deref(), Some("s1"));
    }

    // ------------------------------------------------------------------
    // Cenário 3: optional flow resgata o step
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_optional_flow_rescues_step() {
        let mut ops = OperationRegistry::new();
        let (op_a, _) = ScriptedOp::new("op_a", vec![Err("fail1".to_string()), Ok(())]);
        ops.register(DeviceType::Compute, op_a);
        ops.register(DeviceType::Compute, ok_op("op_r"));

        let h = harness(
            r#"
optional_flows:
  R:
    - { name: rescue, device_type: compute, device_id: tray0, operation: op_r }
steps:
  - name: A
    device_type: compute
    device_id: tray0
    operation: op_a
    retry_count: 0
    execute_optional_flow: R
"#,
            ops,
            handlers::builtin_registry(),
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Completed);

        let snap = h.tracker.snapshot();
        let main = &snap.flows["main"];
        assert_eq!(main.status, FlowStatus::Completed);

        // Dois registros para A: o cluster falho e o re-executado.
        assert_eq!(main.steps_executed.len(), 2);
        let first = &main.steps_executed[0];
        assert_eq!(first.status, StepStatus::Failed);
        assert!(!first.final_result);
        assert_eq!(first.optional_flows_triggered, vec!["R"]);
        assert_eq!(first.error_messages, vec!["fail1"]);

        let second = &main.steps_executed[1];
        assert_eq!(second.status, StepStatus::Completed);
        assert!(second.final_result);

        // Sub-registro do optional flow, ligado ao caller.
        let sub = &main.optional_flows["R"];
        assert_eq!(sub.status, FlowStatus::Completed);
        assert_eq!(sub.caller.as_deref(), Some("A"));
        assert_eq!(sub.steps_executed.len(), 1);
    }

    // ------------------------------------------------------------------
    // Cenário 3b: optional flow falha → flow principal falha na hora
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_optional_flow_failure_fails_main_flow() {
        let mut ops = OperationRegistry::new();
        let (op_a, calls_a) = ScriptedOp::new("op_a", vec![Err("boom".to_string())]);
        let (op_r, _) = ScriptedOp::new("op_r", vec![Err("rescue failed".to_string())]);
        ops.register(DeviceType::Compute, op_a);
        ops.register(DeviceType::Compute, op_r);

        // O handler de step NÃO deve disparar: a falha do optional flow
        // encerra o protocolo.
        let (handler, invocations) = FlagHandler::new("h", true);
        let mut handlers = handlers::builtin_registry();
        handlers.register(handler);

        let h = harness(
            r#"
optional_flows:
  R:
    - { device_type: compute, device_id: tray0, operation: op_r }
steps:
  - name: A
    device_type: compute
    device_id: tray0
    operation: op_a
    execute_optional_flow: R
    execute_on_error: h
"#,
            ops,
            handlers,
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Failed);
        assert_eq!(calls_a.load(Ordering::SeqCst), 1); // sem cluster novo
        assert_eq!(invocations.load(Ordering::SeqCst), 0); // níveis B-D não rodam

        let snap = h.tracker.snapshot();
        assert_eq!(snap.flows["main"].status, FlowStatus::Failed);
        assert_eq!(
            snap.flows["main"].optional_flows["R"].status,
            FlowStatus::Failed
        );
    }

    // ------------------------------------------------------------------
    // Cenário 4: jump_on_failure vence o handler
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_jump_on_failure_bypasses_handler() {
        let mut ops = OperationRegistry::new();
        ops.register(DeviceType::Compute, ok_op("op_ok"));
        let (op_b, _) = ScriptedOp::new("op_b", vec![Err("boom".to_string())]);
        ops.register(DeviceType::Compute, op_b);

        let (handler, invocations) = FlagHandler::new("h", true);
        let mut handlers = handlers::builtin_registry();
        handlers.register(handler);

        let h = harness(
            r#"
steps:
  - { name: A, device_type: compute, device_id: tray0, operation: op_ok, tag: start }
  - name: B
    device_type: compute
    device_id: tray0
    operation: op_b
    tag: mid
    jump_on_failure: end
    execute_on_error: h
  - { name: C, device_type: compute, device_id: tray0, operation: op_ok, tag: tail }
  - { name: D, device_type: compute, device_id: tray0, operation: op_ok, tag: end }
"#,
            ops,
            handlers,
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Completed);
        assert_eq!(invocations.load(Ordering::SeqCst), 0); // handler nunca chamado

        let snap = h.tracker.snapshot();
        let main = &snap.flows["main"];
        assert_eq!(main.status, FlowStatus::Completed);
        assert_eq!(main.jump_on_failure_executed, 1);

        let record_b = main
            .steps_executed
            .iter()
            .find(|r| r.step_name == "B")
            .unwrap();
        let jump = record_b.jump_taken.as_ref().unwrap();
        assert_eq!(jump.kind, JumpKind::Failure);
        assert_eq!(jump.target, "end");

        // C foi pulado pelo jump.
        let record_c = main
            .steps_executed
            .iter()
            .find(|r| r.step_name == "C")
            .unwrap();
        assert_eq!(record_c.status, StepStatus::Skipped);

        // D executou.
        let record_d = main
            .steps_executed
            .iter()
            .find(|r| r.step_name == "D")
            .unwrap();
        assert_eq!(record_d.status, StepStatus::Completed);
    }

    // ------------------------------------------------------------------
    // Cenário 5: handler de step recupera; handler de flow não dispara
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_step_handler_recovers_flow_handler_silent() {
        let mut ops = OperationRegistry::new();
        let (op_a, calls) = ScriptedOp::new(
            "op_a",
            vec![Err("e1".to_string()), Err("e2".to_string())],
        );
        ops.register(DeviceType::Compute, op_a);
        ops.register(DeviceType::Compute, ok_op("op_ok"));

        let (recover, recover_count) = FlagHandler::new("recover", true);
        let (flow_handler, flow_count) = FlagHandler::new("flow_h", false);
        let mut handlers = handlers::builtin_registry();
        handlers.register(recover);
        handlers.register(flow_handler);

        let h = harness(
            r#"
settings:
  execute_on_error: flow_h
steps:
  - name: A
    device_type: compute
    device_id: tray0
    operation: op_a
    retry_count: 1
    execute_on_error: recover
  - { name: B, device_type: compute, device_id: tray0, operation: op_ok }
"#,
            ops,
            handlers,
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2); // ambas as tentativas
        assert_eq!(recover_count.load(Ordering::SeqCst), 1);
        assert_eq!(flow_count.load(Ordering::SeqCst), 0); // flow completou

        let snap = h.tracker.snapshot();
        let main = &snap.flows["main"];
        assert_eq!(main.status, FlowStatus::Completed);

        // O registro de A fica como failed, mas o ponteiro avançou.
        let record_a = main
            .steps_executed
            .iter()
            .find(|r| r.step_name == "A")
            .unwrap();
        assert_eq!(record_a.status, StepStatus::Failed);
        assert_eq!(record_a.retry_attempts, 1);

        let record_b = main
            .steps_executed
            .iter()
            .find(|r| r.step_name == "B")
            .unwrap();
        assert_eq!(record_b.status, StepStatus::Completed);
    }

    // ------------------------------------------------------------------
    // Cenário 6: flows independentes executam concorrentemente
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_independent_flows_run_concurrently() {
        let mut ops = OperationRegistry::new();
        ops.register(
            DeviceType::Compute,
            ScriptedOp::with_delay("slow_op", Duration::from_millis(150)),
        );

        let h = harness(
            r#"
steps:
  - name: grupo
    independent_flows:
      - name: X
        steps:
          - { device_type: compute, device_id: tray0, operation: slow_op }
      - name: Y
        steps:
          - { device_type: compute, device_id: tray1, operation: slow_op }
"#,
            ops,
            handlers::builtin_registry(),
        );

        let started = Instant::now();
        let outcome = h.engine.run().await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, EngineOutcome::Completed);
        // Sequencial seria ~300ms; concorrente fica perto de 150ms.
        assert!(
            elapsed < Duration::from_millis(290),
            "execução demorou {:?}",
            elapsed
        );

        let snap = h.tracker.snapshot();
        assert_eq!(snap.flows["X"].status, FlowStatus::Completed);
        assert_eq!(snap.flows["Y"].status, FlowStatus::Completed);
    }

    // ------------------------------------------------------------------
    // Fronteiras
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_retry_count_zero_means_one_attempt() {
        let mut ops = OperationRegistry::new();
        let (op, calls) = ScriptedOp::new("op", vec![Err("boom".to_string())]);
        ops.register(DeviceType::Compute, op);

        let h = harness(
            r#"
steps:
  - { device_type: compute, device_id: tray0, operation: op, retry_count: 0 }
"#,
            ops,
            handlers::builtin_registry(),
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1); // exatamente uma tentativa

        let snap = h.tracker.snapshot();
        let record = &snap.flows["main"].steps_executed[0];
        assert_eq!(record.retry_attempts, 0);
    }

    #[tokio::test]
    async fn test_empty_flow_completes_immediately() {
        let h = harness(
            "steps: []",
            OperationRegistry::new(),
            handlers::builtin_registry(),
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Completed);
        assert_eq!(outcome.exit_code(), 0);
        assert!(h.tracker.snapshot().flows.is_empty());
    }

    #[tokio::test]
    async fn test_empty_parallel_block_succeeds() {
        let h = harness(
            r#"
steps:
  - name: vazio
    parallel: []
"#,
            OperationRegistry::new(),
            handlers::builtin_registry(),
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Completed);

        let snap = h.tracker.snapshot();
        let main = &snap.flows["main"];
        assert_eq!(main.status, FlowStatus::Completed);
        assert_eq!(main.completed_steps, 1);
    }

    #[tokio::test]
    async fn test_parallel_block_runs_children_and_fails_on_any_child() {
        let mut ops = OperationRegistry::new();
        ops.register(DeviceType::Compute, ok_op("op_ok"));
        let (op_bad, _) = ScriptedOp::new("op_bad", vec![Err("child down".to_string())]);
        ops.register(DeviceType::Compute, op_bad);

        let h = harness(
            r#"
steps:
  - name: bloco
    parallel:
      - { name: c1, device_type: compute, device_id: tray0, operation: op_ok }
      - { name: c2, device_type: compute, device_id: tray1, operation: op_bad }
    max_workers: 2
"#,
            ops,
            handlers::builtin_registry(),
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Failed);

        let snap = h.tracker.snapshot();
        let main = &snap.flows["main"];
        assert_eq!(main.status, FlowStatus::Failed);
        assert_eq!(main.steps_executed.len(), 2); // um registro por filho
        assert_eq!(main.failed_steps_count, 1);
    }

    #[tokio::test]
    async fn test_self_jump_counts_toward_loop_cap() {
        let mut ops = OperationRegistry::new();
        let (op, calls) = ScriptedOp::new("op", vec![]);
        ops.register(DeviceType::Compute, op);

        let h = harness(
            r#"
settings:
  max_step_visits: 3
steps:
  - { name: L, device_type: compute, device_id: tray0, operation: op, tag: here, jump_on_success: here }
"#,
            ops,
            handlers::builtin_registry(),
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 3); // 3 visitas, a 4ª aborta

        let snap = h.tracker.snapshot();
        let main = &snap.flows["main"];
        assert_eq!(main.status, FlowStatus::Failed);
        assert_eq!(main.jump_on_success_executed, 3);
    }

    #[tokio::test]
    async fn test_failed_batch_aborts_remaining_batches() {
        let mut ops = OperationRegistry::new();
        let (op_bad, _) = ScriptedOp::new("op_bad", vec![Err("boom".to_string())]);
        ops.register(DeviceType::Compute, op_bad);
        let (op_later, later_calls) = ScriptedOp::new("op_later", vec![]);
        ops.register(DeviceType::Compute, op_later);

        let h = harness(
            r#"
steps:
  - { name: first, device_type: compute, device_id: tray0, operation: op_bad }
  - name: grupo
    independent_flows:
      - name: later
        steps:
          - { device_type: compute, device_id: tray1, operation: op_later }
"#,
            ops,
            handlers::builtin_registry(),
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Failed);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0); // lote nunca partiu

        let snap = h.tracker.snapshot();
        assert_eq!(snap.flows["main"].status, FlowStatus::Failed);
        assert_eq!(snap.flows["later"].status, FlowStatus::Pending);
    }

    #[tokio::test]
    async fn test_flow_handler_invoked_once_on_failure() {
        let mut ops = OperationRegistry::new();
        let (op_bad, _) = ScriptedOp::new("op_bad", vec![Err("boom".to_string())]);
        ops.register(DeviceType::Compute, op_bad);

        let (flow_handler, flow_count) = FlagHandler::new("flow_h", false);
        let mut handlers = handlers::builtin_registry();
        handlers.register(flow_handler);

        let h = harness(
            r#"
settings:
  execute_on_error: flow_h
steps:
  - { device_type: compute, device_id: tray0, operation: op_bad }
"#,
            ops,
            handlers,
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Failed);
        assert_eq!(flow_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_before_run() {
        let mut ops = OperationRegistry::new();
        let (op, calls) = ScriptedOp::new("op", vec![]);
        ops.register(DeviceType::Compute, op);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let h = harness_with_cancel(
            r#"
steps:
  - { device_type: compute, device_id: tray0, operation: op }
"#,
            ops,
            handlers::builtin_registry(),
            cancel,
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Cancelled);
        assert_eq!(outcome.exit_code(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snapshot_file_written_at_teardown() {
        let mut ops = OperationRegistry::new();
        ops.register(DeviceType::Compute, ok_op("op"));

        let h = harness(
            r#"
steps:
  - { name: only, device_type: compute, device_id: tray0, operation: op }
"#,
            ops,
            handlers::builtin_registry(),
        );

        h.engine.run().await;

        let content =
            std::fs::read_to_string(h._dir.path().join("flow_progress.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["flows"]["main"]["status"], "Completed");
        assert_eq!(parsed["flows"]["main"]["completed_steps"], 1);
    }

    #[tokio::test]
    async fn test_jump_on_success_moves_pointer() {
        let mut ops = OperationRegistry::new();
        let (op, calls) = ScriptedOp::new("op", vec![]);
        ops.register(DeviceType::Compute, op);

        let h = harness(
            r#"
steps:
  - { name: A, device_type: compute, device_id: tray0, operation: op, jump_on_success: fim }
  - { name: B, device_type: compute, device_id: tray0, operation: op }
  - { name: C, device_type: compute, device_id: tray0, operation: op, tag: fim }
"#,
            ops,
            handlers::builtin_registry(),
        );

        let outcome = h.engine.run().await;
        assert_eq!(outcome, EngineOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2); // A e C; B pulado

        let snap = h.tracker.snapshot();
        let main = &snap.flows["main"];
        assert_eq!(main.jump_on_success_executed, 1);
        let record_b = main
            .steps_executed
            .iter()
            .find(|r| r.step_name == "B")
            .unwrap();
        assert_eq!(record_b.status, StepStatus::Skipped);
    }
}
