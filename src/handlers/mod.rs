//! # Módulo de Error Handlers
//!
//! Handlers de erro referenciados por nome no YAML do flow. O registry é
//! populado uma vez no início do programa; o YAML fica hermético, sem
//! código embutido.
//!
//! ## Dois papéis, um registro:
//!
//! - **Nível de step** (`execute_on_error` no step): recebe o step que
//!   falhou; retornar `true` significa "recuperado, o flow continua".
//! - **Nível de flow** (`settings.execute_on_error`): invocado uma vez
//!   quando o flow inteiro falha, com step ausente; o retorno é ignorado.
//!   Uso típico: coleta de logs de diagnóstico.
//!
//! Um handler que retorna erro é logado e tratado como se tivesse
//! retornado `false` (step) ou como no-op (flow); a falha do handler
//! nunca vaza para fora do engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::{DeviceType, Transport};
use crate::flow::FlowStep;

// ============================================================================
// CONTEXTO DO HANDLER
// ============================================================================

/// Contexto passado a todo handler: variáveis da configuração, diretório
/// de log e os dispositivos tocados pelo flow até o momento da falha.
pub struct HandlerContext {
    pub variables: HashMap<String, serde_yaml::Value>,
    pub log_dir: PathBuf,
    pub devices: Vec<(DeviceType, String, Transport)>,
}

impl HandlerContext {
    /// Lê uma variável textual do contexto.
    pub fn variable_str(&self, name: &str) -> Option<String> {
        match self.variables.get(name) {
            Some(serde_yaml::Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

// ============================================================================
// TRAIT E REGISTRY
// ============================================================================

/// Contrato de um error handler.
///
/// `step` é `Some` na invocação de nível de step e `None` na de nível
/// de flow. O `bool` retornado só é considerado no nível de step.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        step: Option<&FlowStep>,
        error: &str,
        ctx: &HandlerContext,
    ) -> Result<bool>;
}

/// Registry `nome → handler`, imutável após o start.
pub struct HandlerRegistry {
    map: HashMap<String, Arc<dyn ErrorHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.map.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ErrorHandler>> {
        self.map.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Constrói o registry com os handlers embutidos.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(DefaultErrorHandler));
    registry.register(Arc::new(CollectNvdebugLogs));
    registry
}

// ============================================================================
// DEFAULT ERROR HANDLER
// ============================================================================

/// Handler padrão: loga o erro e não recupera.
pub struct DefaultErrorHandler;

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    fn name(&self) -> &str {
        "default_error_handler"
    }

    async fn handle(
        &self,
        step: Option<&FlowStep>,
        error: &str,
        _ctx: &HandlerContext,
    ) -> Result<bool> {
        match step {
            Some(step) => error!(
                step = %step.name,
                device = %step.device_key(),
                error = %error,
                "Step falhou"
            ),
            None => error!(error = %error, "Flow falhou"),
        }
        Ok(false)
    }
}

// ============================================================================
// COLETA DE LOGS NVDEBUG
// ============================================================================

/// Invoca o binário de diagnóstico externo contra cada dispositivo tocado
/// pelo flow e grava a saída no diretório de log.
///
/// O caminho do binário vem de `configuration.variables.nvdebug_path`.
/// Tipicamente configurado como handler de nível de flow.
pub struct CollectNvdebugLogs;

#[async_trait]
impl ErrorHandler for CollectNvdebugLogs {
    fn name(&self) -> &str {
        "error_handler_collect_nvdebug_logs"
    }

    async fn handle(
        &self,
        step: Option<&FlowStep>,
        error: &str,
        ctx: &HandlerContext,
    ) -> Result<bool> {
        if let Some(step) = step {
            info!(step = %step.name, "Coletando logs de diagnóstico após falha de step");
        } else {
            info!(error = %error, "Coletando logs de diagnóstico após falha de flow");
        }

        let nvdebug_path = ctx
            .variable_str("nvdebug_path")
            .context("variável 'nvdebug_path' ausente em configuration.variables")?;

        for (device_type, device_id, transport) in &ctx.devices {
            let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
            let output_path = ctx
                .log_dir
                .join(format!("nvdebug_{}_{}_{}.log", device_type, device_id, stamp));

            let result = Command::new(&nvdebug_path)
                .arg("--ip")
                .arg(&transport.ip)
                .arg("--user")
                .arg(&transport.user)
                .arg("--password")
                .arg(&transport.password)
                .arg("--platform")
                .arg(device_type.as_str())
                .output()
                .await;

            match result {
                Ok(output) => {
                    let mut content = output.stdout;
                    if !output.stderr.is_empty() {
                        content.extend_from_slice(b"\n--- stderr ---\n");
                        content.extend_from_slice(&output.stderr);
                    }
                    if let Err(e) = tokio::fs::write(&output_path, &content).await {
                        warn!(path = %output_path.display(), error = %e, "Falha ao gravar saída do nvdebug");
                    } else {
                        info!(
                            device = %format!("{}/{}", device_type, device_id),
                            path = %output_path.display(),
                            "Diagnóstico coletado"
                        );
                    }
                }
                Err(e) => {
                    // Um dispositivo inacessível não impede a coleta dos demais.
                    warn!(
                        device = %format!("{}/{}", device_type, device_id),
                        error = %e,
                        "Falha ao executar nvdebug"
                    );
                }
            }
        }

        Ok(false)
    }
}
