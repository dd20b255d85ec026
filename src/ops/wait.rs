//! # Operação Wait - Pausas no Flow
//!
//! Esta operação implementa pausas declarativas dentro de um flow.
//! É útil para aguardar a estabilização de um dispositivo depois de um
//! reset, ou dar tempo para um job interno do BMC terminar.
//!
//! ## Casos de uso:
//! - **Pós power_cycle**: aguardar o BMC voltar a responder
//! - **Ativação de firmware**: esperar o slot novo assumir
//! - **Ritmo de fábrica**: espaçar operações em lote
//!
//! ## Exemplo de uso no flow:
//!
//! ```yaml
//! - device_type: compute
//!   device_id: tray0
//!   operation: wait
//!   parameters:
//!     seconds: 120
//! ```

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use crate::devices::DeviceHandle;

use super::{Capability, OpContext};

// ============================================================================
// PARÂMETROS DO WAIT
// ============================================================================

/// Parâmetros esperados para a operação `wait`.
///
/// ## Formatos aceitos:
/// - `{ "seconds": 120 }` - formato canônico
/// - `{ "duration_seconds": 120 }` - alias
///
/// Se ambos forem fornecidos, `seconds` tem precedência.
#[derive(Debug, Deserialize)]
struct WaitParams {
    /// Duração da pausa em segundos (formato canônico).
    #[serde(default)]
    seconds: Option<u64>,

    /// Duração da pausa em segundos (alias).
    #[serde(default)]
    duration_seconds: Option<u64>,
}

impl WaitParams {
    fn get_duration(&self) -> Option<u64> {
        self.seconds.or(self.duration_seconds)
    }
}

// ============================================================================
// WAIT OPERATION
// ============================================================================

/// Operação `wait`, registrada para todos os tipos de dispositivo.
///
/// Não toca o dispositivo: apenas pausa o flow que a contém. A pausa
/// responde ao token de cancelamento, então um Ctrl-C do operador não
/// fica preso atrás de uma espera longa.
pub struct WaitOperation;

#[async_trait]
impl Capability for WaitOperation {
    fn name(&self) -> &str {
        "wait"
    }

    async fn invoke(
        &self,
        device: &DeviceHandle,
        parameters: &serde_json::Value,
        ctx: &OpContext,
    ) -> Result<()> {
        let params: WaitParams = serde_json::from_value(parameters.clone()).map_err(|e| {
            anyhow!(
                "parâmetros inválidos para wait: {}. Esperado: {{ \"seconds\": <número> }}",
                e
            )
        })?;

        let seconds = params
            .get_duration()
            .ok_or_else(|| anyhow!("parâmetros incompletos para wait: forneça 'seconds'"))?;

        info!(
            device = %format!("{}/{}", device.device_type, device.device_id),
            seconds = seconds,
            "⏳ Aguardando..."
        );

        tokio::select! {
            _ = sleep(Duration::from_secs(seconds)) => Ok(()),
            _ = ctx.cancel.cancelled() => {
                bail!("wait cancelado pelo operador")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceType, Transport};
    use crate::devices::DeviceLogs;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn test_handle() -> DeviceHandle {
        DeviceHandle {
            device_type: DeviceType::Compute,
            device_id: "tray0".to_string(),
            transport: Transport {
                ip: "10.0.0.1".to_string(),
                user: "admin".to_string(),
                password: "secret".to_string(),
                port: 443,
                protocol: "https".to_string(),
                tunnel_port: None,
            },
            http: reqwest::Client::new(),
        }
    }

    fn test_ctx(cancel: CancellationToken) -> OpContext {
        let dir = tempfile::tempdir().unwrap();
        OpContext {
            timeout: None,
            cancel,
            log: Arc::new(DeviceLogs::new(dir.path())),
        }
    }

    #[tokio::test]
    async fn test_wait_completes() {
        let op = WaitOperation;
        let ctx = test_ctx(CancellationToken::new());

        let start = std::time::Instant::now();
        op.invoke(&test_handle(), &json!({ "seconds": 0 }), &ctx)
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_alias() {
        let op = WaitOperation;
        let ctx = test_ctx(CancellationToken::new());

        op.invoke(&test_handle(), &json!({ "duration_seconds": 0 }), &ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_missing_duration() {
        let op = WaitOperation;
        let ctx = test_ctx(CancellationToken::new());

        let result = op.invoke(&test_handle(), &json!({}), &ctx).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("seconds"));
    }

    #[tokio::test]
    async fn test_wait_honors_cancellation() {
        let op = WaitOperation;
        let cancel = CancellationToken::new();
        let ctx = test_ctx(cancel.clone());

        cancel.cancel();
        let start = std::time::Instant::now();
        let result = op
            .invoke(&test_handle(), &json!({ "seconds": 3600 }), &ctx)
            .await;

        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(2)); // não esperou a hora toda
    }
}
