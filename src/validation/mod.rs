//! # Módulo de Validação de Flow
//!
//! Valida o arquivo de flow antes da execução e constrói o grafo tipado.
//! Nada executa se qualquer passe falhar: a carga nunca é parcial.
//!
//! ## Para todos entenderem:
//!
//! Uma atualização de firmware mal dirigida pode inutilizar um tray
//! inteiro. Por isso todo problema detectável estaticamente é detectado
//! aqui, antes de tocar qualquer dispositivo.
//!
//! ## Passes de validação (em ordem):
//!
//! 1. **Shape**: campos obrigatórios presentes, tipos corretos
//! 2. **Registries**: toda conexão `(tipo, id)` existe; toda operação é
//!    registrada para o tipo de dispositivo
//! 3. **Escopos**: cada lista de steps (corrida principal, cada optional
//!    flow, cada flow independente) forma um escopo de tags próprio,
//!    com índice sequencial por slot
//! 4. **Unicidade de tags** por escopo
//! 5. **Resolução de referências**: jumps dentro do escopo; optional
//!    flows e error handlers globalmente
//! 6. **Propagação de defaults**: retry/wait ausentes herdam dos settings
//!
//! Todo erro carrega o caminho do campo no arquivo
//! (ex.: `steps[2].jump_on_failure`), para correção rápida.
//!
//! ## Nota sobre escopos da corrida principal:
//!
//! Steps simples e blocos paralelos consecutivos no nível superior
//! formam uma única corrida sequencial com escopo de tags compartilhado.
//! Um grupo `independent_flows` encerra a corrida corrente: jumps não
//! atravessam grupos.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::config::{Configuration, Settings};
use crate::flow::{
    Flow, FlowFile, FlowStep, IndependentFlow, ParallelStep, RawFlowStep, RawParallel,
    RawScopeItem, RawTopItem, ScopeStep, TopItem,
};
use crate::handlers::HandlerRegistry;
use crate::ops::OperationRegistry;

// ============================================================================
// TIPOS DE ERRO
// ============================================================================

/// Erros de validação do flow. Cada variante carrega o caminho do campo.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Dois steps do mesmo escopo declaram a mesma tag.
    #[error("{path}: tag '{tag}' duplicada no escopo")]
    DuplicateTag { path: String, tag: String },

    /// Jump aponta para tag que não existe no escopo do step.
    #[error("{path}: alvo de jump '{target}' não existe no escopo")]
    UnresolvedJump { path: String, target: String },

    /// execute_optional_flow referencia flow não definido.
    #[error("{path}: optional flow '{name}' não está definido em optional_flows")]
    UnknownOptionalFlow { path: String, name: String },

    /// execute_on_error referencia handler não registrado.
    #[error("{path}: error handler '{name}' não está registrado")]
    UnknownErrorHandler { path: String, name: String },

    /// Dispositivo sem entrada de conexão na configuração.
    #[error("{path}: conexão não definida para {device_type}/{device_id}")]
    UnknownConnection {
        path: String,
        device_type: String,
        device_id: String,
    },

    /// Operação não registrada para o tipo de dispositivo.
    #[error("{path}: operação '{operation}' não registrada para {device_type}")]
    UnknownOperation {
        path: String,
        operation: String,
        device_type: String,
    },

    /// Valor fora do domínio do campo.
    #[error("{path}: {detail}")]
    InvalidField { path: String, detail: String },
}

// ============================================================================
// CONSTRUÇÃO DO FLOW
// ============================================================================

/// Contexto compartilhado entre os passes.
struct BuildContext<'a> {
    config: &'a Configuration,
    ops: &'a OperationRegistry,
    handlers: &'a HandlerRegistry,
    settings: Settings,
    optional_names: Vec<String>,
    errors: Vec<ValidationError>,
}

/// Valida o arquivo de flow e constrói o grafo tipado.
///
/// Coleta TODOS os erros encontrados ao invés de parar no primeiro,
/// para que o operador corrija o arquivo em uma única rodada.
pub fn build_flow(
    file: FlowFile,
    config: &Configuration,
    ops: &OperationRegistry,
    handlers: &HandlerRegistry,
) -> Result<Flow, Vec<ValidationError>> {
    let settings = config.settings.merged(&file.settings);

    let optional_names: Vec<String> = file.optional_flows.keys().cloned().collect();

    let mut ctx = BuildContext {
        config,
        ops,
        handlers,
        settings: settings.clone(),
        optional_names,
        errors: Vec::new(),
    };

    // Handler de nível de flow precisa existir no registry.
    if let Some(name) = &settings.execute_on_error {
        if !handlers.contains(name) {
            ctx.errors.push(ValidationError::UnknownErrorHandler {
                path: "settings.execute_on_error".to_string(),
                name: name.clone(),
            });
        }
    }

    // Optional flows: cada um é um escopo independente.
    let mut optional_flows = BTreeMap::new();
    for (name, raw_steps) in file.optional_flows {
        let scope = build_scope(
            &mut ctx,
            &name,
            &format!("optional_flows.{}", name),
            raw_steps,
            Some(name.as_str()),
        );
        optional_flows.insert(name, Arc::new(scope));
    }

    // Nível superior: corridas de steps consecutivos viram escopos
    // sequenciais; grupos de flows independentes entram como grupos.
    let mut items = Vec::new();
    let mut run_buffer: Vec<(usize, RawScopeItem)> = Vec::new();
    let mut run_count = 0usize;
    let mut flow_names: HashMap<String, String> = HashMap::new();

    for (index, item) in file.steps.into_iter().enumerate() {
        match item {
            RawTopItem::Step(step) => {
                run_buffer.push((index, RawScopeItem::Step(step)));
            }
            RawTopItem::Parallel(block) => {
                run_buffer.push((index, RawScopeItem::Parallel(block)));
            }
            RawTopItem::IndependentGroup(group) => {
                flush_run(&mut ctx, &mut items, &mut run_buffer, &mut run_count);

                let mut flows = Vec::new();
                for (j, raw_flow) in group.independent_flows.into_iter().enumerate() {
                    let path = format!("steps[{}].independent_flows[{}]", index, j);
                    let name = raw_flow.name;
                    if let Some(previous) = flow_names.get(&name) {
                        ctx.errors.push(ValidationError::InvalidField {
                            path: path.clone(),
                            detail: format!("nome de flow '{}' já usado em {}", name, previous),
                        });
                    } else {
                        flow_names.insert(name.clone(), path.clone());
                    }

                    let scope = build_scope(
                        &mut ctx,
                        &name,
                        &format!("{}.steps", path),
                        raw_flow.steps,
                        None,
                    );
                    flows.push(Arc::new(scope));
                }
                items.push(TopItem::Group(flows));
            }
        }
    }
    flush_run(&mut ctx, &mut items, &mut run_buffer, &mut run_count);

    if ctx.errors.is_empty() {
        Ok(Flow {
            items,
            optional_flows,
            settings,
        })
    } else {
        Err(ctx.errors)
    }
}

// ============================================================================
// CONSTRUÇÃO DE ESCOPOS
// ============================================================================

/// Fecha a corrida corrente de steps do nível superior, se houver,
/// preservando os índices originais de `steps[...]` nos caminhos de erro.
fn flush_run(
    ctx: &mut BuildContext,
    items: &mut Vec<TopItem>,
    buffer: &mut Vec<(usize, RawScopeItem)>,
    run_count: &mut usize,
) {
    if buffer.is_empty() {
        return;
    }
    *run_count += 1;
    let name = if *run_count == 1 {
        "main".to_string()
    } else {
        format!("main_{}", run_count)
    };

    let (indexes, raw_items): (Vec<usize>, Vec<RawScopeItem>) =
        std::mem::take(buffer).into_iter().unzip();
    let scope = build_scope_inner(ctx, &name, raw_items, indexes, "steps", None);
    items.push(TopItem::Run(Arc::new(scope)));
}

/// Constrói um escopo cujos itens são indexados de 0 em diante
/// (optional flows e flows independentes).
fn build_scope(
    ctx: &mut BuildContext,
    name: &str,
    path_prefix: &str,
    raw_items: Vec<RawScopeItem>,
    owning_optional: Option<&str>,
) -> IndependentFlow {
    let count = raw_items.len();
    build_scope_inner(
        ctx,
        name,
        raw_items,
        (0..count).collect(),
        path_prefix,
        owning_optional,
    )
}

fn build_scope_inner(
    ctx: &mut BuildContext,
    name: &str,
    raw_items: Vec<RawScopeItem>,
    path_indexes: Vec<usize>,
    path_prefix: &str,
    owning_optional: Option<&str>,
) -> IndependentFlow {
    let mut steps = Vec::with_capacity(raw_items.len());
    let mut tag_index: HashMap<String, usize> = HashMap::new();

    // Primeira passada: converte itens e coleta tags.
    for (slot, item) in raw_items.into_iter().enumerate() {
        let path = format!("{}[{}]", path_prefix, path_indexes[slot]);
        match item {
            RawScopeItem::Step(raw) => {
                let step = convert_step(ctx, raw, &path, false, owning_optional);
                if let Some(tag) = &step.tag {
                    if tag_index.contains_key(tag) {
                        ctx.errors.push(ValidationError::DuplicateTag {
                            path: format!("{}.tag", path),
                            tag: tag.clone(),
                        });
                    } else {
                        tag_index.insert(tag.clone(), slot);
                    }
                }
                steps.push(ScopeStep::Single(step));
            }
            RawScopeItem::Parallel(raw) => {
                let block = convert_parallel(ctx, raw, &path, owning_optional);
                steps.push(ScopeStep::Parallel(block));
            }
        }
    }

    // Segunda passada: jumps resolvem dentro do escopo.
    for (slot, step) in steps.iter().enumerate() {
        if let ScopeStep::Single(step) = step {
            let path = format!("{}[{}]", path_prefix, path_indexes[slot]);
            for (field, target) in [
                ("jump_on_success", &step.jump_on_success),
                ("jump_on_failure", &step.jump_on_failure),
            ] {
                if let Some(target) = target {
                    if !tag_index.contains_key(target) {
                        ctx.errors.push(ValidationError::UnresolvedJump {
                            path: format!("{}.{}", path, field),
                            target: target.clone(),
                        });
                    }
                }
            }
        }
    }

    IndependentFlow {
        name: name.to_string(),
        steps,
        tag_index,
    }
}

// ============================================================================
// CONVERSÃO DE STEP INDIVIDUAL
// ============================================================================

/// Converte um step bruto, aplicando defaults e checando registries.
fn convert_step(
    ctx: &mut BuildContext,
    raw: RawFlowStep,
    path: &str,
    parallel_child: bool,
    owning_optional: Option<&str>,
) -> FlowStep {
    // Conexão precisa existir.
    if ctx.config.transport(raw.device_type, &raw.device_id).is_none() {
        ctx.errors.push(ValidationError::UnknownConnection {
            path: format!("{}.device_id", path),
            device_type: raw.device_type.to_string(),
            device_id: raw.device_id.clone(),
        });
    }

    // Operação precisa estar registrada para o tipo.
    if !ctx.ops.contains(raw.device_type, &raw.operation) {
        ctx.errors.push(ValidationError::UnknownOperation {
            path: format!("{}.operation", path),
            operation: raw.operation.clone(),
            device_type: raw.device_type.to_string(),
        });
    }

    // Filhos de bloco paralelo não têm tag e não saltam.
    if parallel_child {
        if raw.tag.is_some() {
            ctx.errors.push(ValidationError::InvalidField {
                path: format!("{}.tag", path),
                detail: "filho de bloco paralelo não pode ter tag".to_string(),
            });
        }
        for (field, value) in [
            ("jump_on_success", &raw.jump_on_success),
            ("jump_on_failure", &raw.jump_on_failure),
        ] {
            if value.is_some() {
                ctx.errors.push(ValidationError::InvalidField {
                    path: format!("{}.{}", path, field),
                    detail: "filho de bloco paralelo não pode saltar".to_string(),
                });
            }
        }
    }

    // Optional flow referenciado precisa existir.
    if let Some(name) = &raw.execute_optional_flow {
        if !ctx.optional_names.iter().any(|n| n == name) {
            ctx.errors.push(ValidationError::UnknownOptionalFlow {
                path: format!("{}.execute_optional_flow", path),
                name: name.clone(),
            });
        }
        // Auto-referência dispararia recursão sem fim.
        if owning_optional == Some(name.as_str()) {
            ctx.errors.push(ValidationError::InvalidField {
                path: format!("{}.execute_optional_flow", path),
                detail: format!("optional flow '{}' não pode disparar a si mesmo", name),
            });
        }
    }

    // Handler de nível de step precisa estar registrado.
    if let Some(name) = &raw.execute_on_error {
        if !ctx.handlers.contains(name) {
            ctx.errors.push(ValidationError::UnknownErrorHandler {
                path: format!("{}.execute_on_error", path),
                name: name.clone(),
            });
        }
    }

    // Parâmetros: mapeamento YAML → JSON.
    let parameters = match &raw.parameters {
        serde_yaml::Value::Null => serde_json::json!({}),
        value @ serde_yaml::Value::Mapping(_) => match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => {
                ctx.errors.push(ValidationError::InvalidField {
                    path: format!("{}.parameters", path),
                    detail: format!("parâmetros não conversíveis para JSON: {}", e),
                });
                serde_json::json!({})
            }
        },
        _ => {
            ctx.errors.push(ValidationError::InvalidField {
                path: format!("{}.parameters", path),
                detail: "parameters deve ser um mapeamento".to_string(),
            });
            serde_json::json!({})
        }
    };

    let settings = &ctx.settings;
    FlowStep {
        name: raw.name.unwrap_or_else(|| raw.operation.clone()),
        device_type: raw.device_type,
        device_id: raw.device_id,
        operation: raw.operation,
        parameters,
        tag: raw.tag,
        retry_count: raw.retry_count.unwrap_or(settings.default_retry_count),
        wait_after_seconds: raw
            .wait_after_seconds
            .unwrap_or(settings.default_wait_after_seconds),
        wait_between_retries_seconds: raw
            .wait_between_retries_seconds
            .unwrap_or(settings.default_wait_between_retries_seconds),
        timeout_seconds: raw.timeout_seconds,
        jump_on_success: raw.jump_on_success,
        jump_on_failure: raw.jump_on_failure,
        execute_optional_flow: raw.execute_optional_flow,
        execute_on_error: raw.execute_on_error,
    }
}

/// Converte um bloco paralelo e seus filhos.
fn convert_parallel(
    ctx: &mut BuildContext,
    raw: RawParallel,
    path: &str,
    owning_optional: Option<&str>,
) -> ParallelStep {
    let child_count = raw.parallel.len();

    let max_workers = match raw.max_workers {
        Some(0) => {
            ctx.errors.push(ValidationError::InvalidField {
                path: format!("{}.max_workers", path),
                detail: "max_workers deve ser maior que zero".to_string(),
            });
            1
        }
        Some(n) => n,
        // Sem limite declarado: todos os filhos ao mesmo tempo.
        None => child_count.max(1),
    };

    let mut children = Vec::with_capacity(child_count);
    for (i, child) in raw.parallel.into_iter().enumerate() {
        let child_path = format!("{}.parallel[{}]", path, i);
        children.push(convert_step(ctx, child, &child_path, true, owning_optional));
    }

    ParallelStep {
        name: raw.name.unwrap_or_else(|| "parallel".to_string()),
        children,
        max_workers,
    }
}

// ============================================================================
// TESTES
// ============================================================================
