//! # Módulo de Flow - Estruturas de Dados
//!
//! Este módulo define todas as **estruturas de dados** que representam
//! um factory flow: o grafo tipado executado pelo engine e os registros
//! de telemetria que alimentam o `flow_progress.json`.
//!
//! ## O que é um factory flow?
//!
//! É o "roteiro" declarativo que descreve a sequência de operações de
//! atualização de firmware em um rack: em qual dispositivo executar,
//! quantas vezes tentar, para onde saltar em caso de falha, e qual
//! sub-flow de recuperação disparar.
//!
//! ## Estrutura de um arquivo de flow:
//!
//! ```yaml
//! settings:
//!   default_retry_count: 2
//! optional_flows:
//!   recover_bmc:
//!     - device_type: compute
//!       device_id: tray0
//!       operation: power_cycle
//! steps:
//!   - device_type: compute
//!     device_id: tray0
//!     operation: update_firmware
//!     parameters: { package: "${fw_bundle}" }
//!     tag: update
//!     retry_count: 1
//!     execute_optional_flow: recover_bmc
//!   - name: update switches
//!     parallel:
//!       - { device_type: switch, device_id: nvsw0, operation: update_firmware }
//!       - { device_type: switch, device_id: nvsw1, operation: update_firmware }
//!     max_workers: 2
//!   - name: trays em paralelo
//!     independent_flows:
//!       - name: tray0_flow
//!         steps: [...]
//!       - name: tray1_flow
//!         steps: [...]
//! ```
//!
//! ## Hierarquia de Tipos:
//!
//! ```text
//! Flow
//! ├── TopItem::Run(IndependentFlow)     <- corrida de steps sequenciais
//! ├── TopItem::Group([IndependentFlow]) <- grupo agendável em paralelo
//! └── optional_flows: nome → IndependentFlow
//!     IndependentFlow
//!     └── ScopeStep::Single(FlowStep) | ScopeStep::Parallel(ParallelStep)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{DeviceType, Settings, SettingsOverride};

// ============================================================================
// FORMAS BRUTAS (DESSERIALIZAÇÃO DO YAML)
// ============================================================================

/// Arquivo de flow como desserializado, antes da validação.
#[derive(Debug, Deserialize)]
pub struct FlowFile {
    /// Sobrescritas de settings específicas deste flow.
    #[serde(default)]
    pub settings: SettingsOverride,

    /// Sub-flows de recuperação, disparáveis por `execute_optional_flow`.
    #[serde(default)]
    pub optional_flows: BTreeMap<String, Vec<RawScopeItem>>,

    /// Lista ordenada de itens do nível superior.
    #[serde(default)]
    pub steps: Vec<RawTopItem>,
}

/// Um item do nível superior do arquivo de flow.
///
/// A distinção é estrutural (untagged): um mapa com `parallel` é um bloco
/// paralelo, um mapa com `independent_flows` é um grupo, qualquer outro
/// mapa com `device_type`/`operation` é um step simples.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawTopItem {
    Parallel(RawParallel),
    IndependentGroup(RawIndependentGroup),
    Step(RawFlowStep),
}

/// Item permitido dentro de um escopo (flow independente ou optional flow).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawScopeItem {
    Parallel(RawParallel),
    Step(RawFlowStep),
}

/// Step bruto: a unidade atômica do flow.
#[derive(Debug, Deserialize)]
pub struct RawFlowStep {
    /// Nome exibido em logs e telemetria. Padrão: o nome da operação.
    #[serde(default)]
    pub name: Option<String>,

    pub device_type: DeviceType,
    pub device_id: String,
    pub operation: String,

    /// Parâmetros da operação, já pós-expansão de variáveis.
    #[serde(default)]
    pub parameters: serde_yaml::Value,

    /// Identificador único dentro do escopo, alvo de jumps.
    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub wait_after_seconds: Option<u64>,
    #[serde(default)]
    pub wait_between_retries_seconds: Option<u64>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub jump_on_success: Option<String>,
    #[serde(default)]
    pub jump_on_failure: Option<String>,

    /// Sub-flow de recuperação disparado quando os retries se esgotam.
    #[serde(default)]
    pub execute_optional_flow: Option<String>,

    /// Error handler de nível de step.
    #[serde(default)]
    pub execute_on_error: Option<String>,
}

/// Bloco paralelo bruto.
#[derive(Debug, Deserialize)]
pub struct RawParallel {
    #[serde(default)]
    pub name: Option<String>,
    pub parallel: Vec<RawFlowStep>,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

/// Grupo bruto de flows independentes.
#[derive(Debug, Deserialize)]
pub struct RawIndependentGroup {
    #[serde(default)]
    pub name: Option<String>,
    pub independent_flows: Vec<RawIndependentFlow>,
}

/// Flow independente bruto.
#[derive(Debug, Deserialize)]
pub struct RawIndependentFlow {
    pub name: String,
    pub steps: Vec<RawScopeItem>,
}

// ============================================================================
// GRAFO TIPADO (PÓS-VALIDAÇÃO)
// ============================================================================

/// Step validado, com defaults propagados e parâmetros em JSON.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStep {
    pub name: String,
    pub device_type: DeviceType,
    pub device_id: String,
    pub operation: String,
    pub parameters: serde_json::Value,
    pub tag: Option<String>,
    pub retry_count: u32,
    pub wait_after_seconds: u64,
    pub wait_between_retries_seconds: u64,
    pub timeout_seconds: Option<u64>,
    pub jump_on_success: Option<String>,
    pub jump_on_failure: Option<String>,
    pub execute_optional_flow: Option<String>,
    pub execute_on_error: Option<String>,
}

impl FlowStep {
    /// Identificação "tipo/id" do dispositivo alvo, para logs.
    pub fn device_key(&self) -> String {
        format!("{}/{}", self.device_type, self.device_id)
    }
}

/// Bloco de steps executados concorrentemente.
///
/// Filhos não têm tags e não podem saltar; o bloco só tem sucesso
/// quando todos os filhos têm sucesso.
#[derive(Debug, Clone)]
pub struct ParallelStep {
    pub name: String,
    pub children: Vec<FlowStep>,
    pub max_workers: usize,
}

/// Um slot do escopo de execução: step simples ou bloco paralelo.
#[derive(Debug, Clone)]
pub enum ScopeStep {
    Single(FlowStep),
    Parallel(ParallelStep),
}

impl ScopeStep {
    pub fn name(&self) -> &str {
        match self {
            ScopeStep::Single(step) => &step.name,
            ScopeStep::Parallel(block) => &block.name,
        }
    }
}

/// Flow independente: escopo auto-contido com ponteiro de instrução próprio.
///
/// Tags são locais a este escopo; `tag_index` mapeia tag → índice do slot.
#[derive(Debug, Clone)]
pub struct IndependentFlow {
    pub name: String,
    pub steps: Vec<ScopeStep>,
    pub tag_index: HashMap<String, usize>,
}

/// Item do nível superior depois da construção de escopos.
#[derive(Debug, Clone)]
pub enum TopItem {
    /// Corrida de steps simples/paralelos consecutivos, executada
    /// sequencialmente como um único escopo.
    Run(Arc<IndependentFlow>),

    /// Grupo explícito de flows independentes. Grupos consecutivos são
    /// agendados concorrentemente pelo engine.
    Group(Vec<Arc<IndependentFlow>>),
}

/// Flow completo, imutável durante a execução.
#[derive(Debug, Clone)]
pub struct Flow {
    pub items: Vec<TopItem>,
    pub optional_flows: BTreeMap<String, Arc<IndependentFlow>>,
    pub settings: Settings,
}

// ============================================================================
// TELEMETRIA: STATUS
// ============================================================================

/// Status final de um registro de execução de step.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step executou e a operação teve sucesso.
    Completed,

    /// Step executou e falhou após todos os retries.
    Failed,

    /// Step foi pulado por um jump.
    Skipped,
}

/// Status de um flow (principal, independente ou optional).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum FlowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Tipo de jump registrado.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JumpKind {
    Success,
    Failure,
}

/// Jump efetivado por um step.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct JumpRecord {
    pub kind: JumpKind,
    pub target: String,
}

// ============================================================================
// TELEMETRIA: REGISTROS
// ============================================================================

/// Registro de um cluster de tentativas de um step.
///
/// Um step rescatado por optional flow gera dois registros: o cluster
/// que falhou (com `optional_flows_triggered` preenchido) e o cluster
/// re-executado depois da recuperação.
#[derive(Debug, Clone, Serialize)]
pub struct StepExecution {
    /// UUID único deste registro.
    pub execution_id: String,

    pub step_name: String,
    pub operation: String,
    pub device_type: DeviceType,
    pub device_id: String,
    pub parameters: serde_json::Value,

    /// Início do cluster, ISO8601.
    pub start_ts: String,

    /// Duração total do cluster em segundos.
    pub duration_seconds: f64,

    /// Retries efetivamente executados (0 = passou de primeira).
    pub retry_attempts: u32,

    /// Resultado final do cluster.
    pub final_result: bool,

    pub status: StepStatus,

    /// Mensagens de erro de cada tentativa falha, em ordem.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<String>,

    /// Jump efetivado a partir deste step, se houver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jump_taken: Option<JumpRecord>,

    /// Optional flows disparados por este cluster.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub optional_flows_triggered: Vec<String>,
}

/// Telemetria agregada de um flow.
///
/// Os campos derivados (médias, contagens) são recalculados a cada
/// snapshot a partir de `steps_executed`.
#[derive(Debug, Clone, Serialize)]
pub struct FlowInfo {
    pub status: FlowStatus,

    /// Step em execução no momento do snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    /// Slots do escopo já processados (o flow avançou além deles).
    pub completed_steps: u32,

    /// Total de slots do escopo.
    pub total_steps: u32,

    /// Soma das durações de todos os clusters executados, em segundos.
    pub total_testtime_seconds: f64,

    pub steps_executed: Vec<StepExecution>,

    /// Step que disparou este optional flow (ausente no flow principal).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,

    /// Optional flows disparados a partir deste flow.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_flows: BTreeMap<String, FlowInfo>,

    // ------------------------------------------------------------------
    // Agregados derivados
    // ------------------------------------------------------------------
    pub retries_executed: u32,
    pub jump_on_success_executed: u32,
    pub jump_on_failure_executed: u32,
    pub failed_steps_count: u32,
    pub average_step_duration_seconds: f64,
    pub longest_step_duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_with_most_retries: Option<String>,
}

/// Documento raiz do `flow_progress.json`.
#[derive(Debug, Clone, Serialize)]
pub struct FlowProgress {
    pub flows: BTreeMap<String, FlowInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flow_file_shapes() {
        let yaml = r#"
settings:
  default_retry_count: 1
optional_flows:
  recover:
    - device_type: compute
      device_id: tray0
      operation: power_cycle
steps:
  - device_type: compute
    device_id: tray0
    operation: update_firmware
    parameters: { package: /firmware/a.fwpkg }
    tag: update
  - name: switches
    parallel:
      - { device_type: switch, device_id: nvsw0, operation: update_firmware }
    max_workers: 2
  - name: trays
    independent_flows:
      - name: tray0_flow
        steps:
          - { device_type: compute, device_id: tray0, operation: show_version }
"#;
        let file: FlowFile = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(file.settings.default_retry_count, Some(1));
        assert_eq!(file.optional_flows.len(), 1);
        assert_eq!(file.steps.len(), 3);

        assert!(matches!(file.steps[0], RawTopItem::Step(_)));
        assert!(matches!(file.steps[1], RawTopItem::Parallel(_)));
        assert!(matches!(file.steps[2], RawTopItem::IndependentGroup(_)));

        if let RawTopItem::Step(step) = &file.steps[0] {
            assert_eq!(step.tag.as_deref(), Some("update"));
            assert_eq!(step.operation, "update_firmware");
        }
        if let RawTopItem::Parallel(block) = &file.steps[1] {
            assert_eq!(block.parallel.len(), 1);
            assert_eq!(block.max_workers, Some(2));
        }
    }

    #[test]
    fn test_step_status_serialization() {
        assert_eq!(
            serde_json::to_string(&StepStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&FlowStatus::Running).unwrap(),
            "\"Running\""
        );
        assert_eq!(
            serde_json::to_string(&JumpKind::Failure).unwrap(),
            "\"failure\""
        );
    }

    #[test]
    fn test_empty_flow_file() {
        let file: FlowFile = serde_yaml::from_str("{}").unwrap();
        assert!(file.steps.is_empty());
        assert!(file.optional_flows.is_empty());
    }
}
