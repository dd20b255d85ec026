//! # Operações Redfish
//!
//! Operações fora de banda contra o serviço Redfish do BMC/HMC do
//! dispositivo: consulta de inventário de firmware, push de pacote,
//! reset e acompanhamento de task.
//!
//! ## Fluxo típico de uma atualização:
//!
//! 1. `show_version` - registra as versões atuais no log do dispositivo
//! 2. `update_firmware` - envia o pacote para o UpdateService
//! 3. `wait_task` - acompanha a task Redfish até terminar
//! 4. `power_cycle` - reinicia para ativar o novo firmware
//! 5. `show_version` - confirma as versões novas
//!
//! Cada operação aplica o deadline do step como timeout da requisição;
//! o cliente do handle carrega o timeout Redfish padrão da configuração.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::devices::DeviceHandle;

use super::{Capability, OpContext};

// ============================================================================
// PARÂMETROS
// ============================================================================

/// Parâmetros de `show_version`.
#[derive(Debug, Deserialize)]
struct ShowVersionParams {
    /// Componente específico do inventário (ex.: "HGX_FW_BMC_0").
    /// Sem componente, lista o inventário completo.
    #[serde(default)]
    component: Option<String>,
}

/// Parâmetros de `update_firmware`.
#[derive(Debug, Deserialize)]
struct UpdateFirmwareParams {
    /// Caminho local do pacote de firmware.
    package: String,

    /// URIs de alvo opcionais (atualização seletiva de APs).
    #[serde(default)]
    target_uris: Vec<String>,
}

/// Parâmetros de `power_cycle`.
#[derive(Debug, Deserialize)]
struct PowerCycleParams {
    /// Tipo de reset Redfish.
    #[serde(default = "default_reset_type")]
    reset_type: String,

    /// Recurso alvo da ação de reset.
    #[serde(default = "default_reset_target")]
    target: String,
}

fn default_reset_type() -> String {
    "ForceRestart".to_string()
}

fn default_reset_target() -> String {
    "/redfish/v1/Systems/System_0/Actions/ComputerSystem.Reset".to_string()
}

/// Parâmetros de `wait_task`.
#[derive(Debug, Deserialize)]
struct WaitTaskParams {
    /// Id da task Redfish a acompanhar.
    task_id: String,

    /// Intervalo entre consultas, em segundos.
    #[serde(default = "default_poll_interval")]
    poll_interval_seconds: u64,
}

fn default_poll_interval() -> u64 {
    10
}

/// Corpo parcial de uma task Redfish.
#[derive(Debug, Deserialize)]
struct TaskBody {
    #[serde(rename = "TaskState", default)]
    task_state: String,
    #[serde(rename = "PercentComplete", default)]
    percent_complete: Option<u8>,
}

// ============================================================================
// HELPERS
// ============================================================================

fn parse_params<T: serde::de::DeserializeOwned>(operation: &str, params: &Value) -> Result<T> {
    serde_json::from_value(params.clone())
        .map_err(|e| anyhow!("parâmetros inválidos para {}: {}", operation, e))
}

/// Envia um GET autenticado e devolve o corpo JSON.
async fn get_json(
    device: &DeviceHandle,
    path: &str,
    timeout: Option<Duration>,
) -> Result<Value> {
    let url = format!("{}{}", device.base_url(), path);
    let mut request = device
        .http
        .get(&url)
        .header(AUTHORIZATION, device.authorization());
    if let Some(t) = timeout {
        request = request.timeout(t);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("GET {} falhou", url))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .with_context(|| format!("resposta de {} não é JSON", url))?;

    if !status.is_success() {
        bail!("GET {} retornou {}: {}", url, status, excerpt(&body));
    }
    Ok(body)
}

fn excerpt(body: &Value) -> String {
    let text = body.to_string();
    if text.len() > 200 {
        format!("{}...", &text[..200])
    } else {
        text
    }
}

// ============================================================================
// SHOW VERSION
// ============================================================================

/// Lê o inventário de firmware e registra as versões no log do
/// tipo de dispositivo.
pub struct ShowVersion;

#[async_trait]
impl Capability for ShowVersion {
    fn name(&self) -> &str {
        "show_version"
    }

    async fn invoke(
        &self,
        device: &DeviceHandle,
        parameters: &Value,
        ctx: &OpContext,
    ) -> Result<()> {
        let params: ShowVersionParams = parse_params(self.name(), parameters)?;

        let path = match &params.component {
            Some(component) => format!(
                "/redfish/v1/UpdateService/FirmwareInventory/{}",
                urlencoding::encode(component)
            ),
            None => "/redfish/v1/UpdateService/FirmwareInventory?$expand=.".to_string(),
        };

        let body = get_json(device, &path, ctx.timeout).await?;

        match &params.component {
            Some(component) => {
                let version = body
                    .get("Version")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<desconhecida>");
                ctx.log.append(
                    device.device_type,
                    &format!(
                        "show_version {}: {} = {}",
                        device.device_id, component, version
                    ),
                );
            }
            None => {
                let members = body
                    .get("Members")
                    .and_then(|m| m.as_array())
                    .map(|m| m.len())
                    .unwrap_or(0);
                ctx.log.append(
                    device.device_type,
                    &format!(
                        "show_version {}: {} componentes no inventário",
                        device.device_id, members
                    ),
                );
            }
        }

        Ok(())
    }
}

// ============================================================================
// UPDATE FIRMWARE
// ============================================================================

/// Envia o pacote de firmware para o UpdateService (push URI).
///
/// O corpo da resposta carrega a task criada; o id é registrado no log
/// do dispositivo para acompanhamento posterior com `wait_task`.
pub struct UpdateFirmware;

#[async_trait]
impl Capability for UpdateFirmware {
    fn name(&self) -> &str {
        "update_firmware"
    }

    async fn invoke(
        &self,
        device: &DeviceHandle,
        parameters: &Value,
        ctx: &OpContext,
    ) -> Result<()> {
        let params: UpdateFirmwareParams = parse_params(self.name(), parameters)?;

        let package = tokio::fs::read(&params.package)
            .await
            .with_context(|| format!("falha ao ler pacote '{}'", params.package))?;

        info!(
            device = %format!("{}/{}", device.device_type, device.device_id),
            package = %params.package,
            size = package.len(),
            "Enviando pacote de firmware"
        );

        let url = format!("{}/redfish/v1/UpdateService/update", device.base_url());
        let mut request = device
            .http
            .post(&url)
            .header(AUTHORIZATION, device.authorization())
            .header("Content-Type", "application/octet-stream")
            .body(package);

        if !params.target_uris.is_empty() {
            // Atualização seletiva: os alvos vão no header de targets
            // aceito pelo UpdateService multipart/simple-update.
            request = request.header(
                "X-UpdateService-Targets",
                params.target_uris.join(","),
            );
        }
        if let Some(t) = ctx.timeout {
            request = request.timeout(t);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("POST {} falhou", url))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            bail!("push de firmware retornou {}: {}", status, excerpt(&body));
        }

        let task_id = body
            .get("Id")
            .and_then(|v| v.as_str())
            .unwrap_or("<sem task>");
        ctx.log.append(
            device.device_type,
            &format!(
                "update_firmware {}: pacote {} aceito, task {}",
                device.device_id, params.package, task_id
            ),
        );

        Ok(())
    }
}

// ============================================================================
// POWER CYCLE
// ============================================================================

/// Dispara a ação de reset do recurso alvo.
pub struct PowerCycle;

#[async_trait]
impl Capability for PowerCycle {
    fn name(&self) -> &str {
        "power_cycle"
    }

    async fn invoke(
        &self,
        device: &DeviceHandle,
        parameters: &Value,
        ctx: &OpContext,
    ) -> Result<()> {
        let params: PowerCycleParams = parse_params(self.name(), parameters)?;

        let url = format!("{}{}", device.base_url(), params.target);
        let mut request = device
            .http
            .post(&url)
            .header(AUTHORIZATION, device.authorization())
            .json(&serde_json::json!({ "ResetType": params.reset_type }));
        if let Some(t) = ctx.timeout {
            request = request.timeout(t);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("POST {} falhou", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("reset retornou {}", status);
        }

        ctx.log.append(
            device.device_type,
            &format!(
                "power_cycle {}: {} disparado",
                device.device_id, params.reset_type
            ),
        );
        Ok(())
    }
}

// ============================================================================
// WAIT TASK
// ============================================================================

/// Acompanha uma task Redfish até o estado terminal.
///
/// `Completed` encerra com sucesso; `Exception`, `Killed` e `Cancelled`
/// encerram com falha. O deadline do step limita a espera total.
pub struct WaitTask;

#[async_trait]
impl Capability for WaitTask {
    fn name(&self) -> &str {
        "wait_task"
    }

    async fn invoke(
        &self,
        device: &DeviceHandle,
        parameters: &Value,
        ctx: &OpContext,
    ) -> Result<()> {
        let params: WaitTaskParams = parse_params(self.name(), parameters)?;
        let deadline = ctx.timeout.map(|t| tokio::time::Instant::now() + t);
        let poll = Duration::from_secs(params.poll_interval_seconds.max(1));

        loop {
            if ctx.cancel.is_cancelled() {
                bail!("wait_task cancelado pelo operador");
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    bail!(
                        "task {} não terminou dentro do deadline",
                        params.task_id
                    );
                }
            }

            let path = format!(
                "/redfish/v1/TaskService/Tasks/{}",
                urlencoding::encode(&params.task_id)
            );
            let body = get_json(device, &path, Some(poll.max(Duration::from_secs(5)))).await?;
            let task: TaskBody = serde_json::from_value(body)
                .with_context(|| format!("corpo de task inválido para {}", params.task_id))?;

            debug!(
                task_id = %params.task_id,
                state = %task.task_state,
                percent = ?task.percent_complete,
                "Estado da task"
            );

            match task.task_state.as_str() {
                "Completed" => {
                    ctx.log.append(
                        device.device_type,
                        &format!("wait_task {}: task {} completada", device.device_id, params.task_id),
                    );
                    return Ok(());
                }
                "Exception" | "Killed" | "Cancelled" => {
                    bail!(
                        "task {} terminou em estado {}",
                        params.task_id,
                        task.task_state
                    );
                }
                _ => {
                    sleep(poll).await;
                }
            }
        }
    }
}
