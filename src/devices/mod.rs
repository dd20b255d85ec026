//! # Módulo de Dispositivos
//!
//! Cache preguiçoso de handles de dispositivo: a primeira operação que
//! toca `(device_type, device_id)` constrói o handle a partir da entrada
//! de conexão da configuração; o teardown do engine fecha todos.
//!
//! Um handle agrupa o transporte (IP, credenciais) e o cliente HTTP
//! reutilizável para as chamadas Redfish. BMCs de fábrica usam
//! certificados autoassinados, então o cliente aceita certificados
//! inválidos.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Configuration, DeviceType, Transport};

// ============================================================================
// LOG POR TIPO DE DISPOSITIVO
// ============================================================================

/// Sink de log por tipo de dispositivo.
///
/// Cada tipo grava em `<tipo>_factory_flow.log` dentro do diretório de
/// log. Os arquivos são abertos sob demanda e compartilhados entre as
/// operações concorrentes do mesmo tipo.
pub struct DeviceLogs {
    log_dir: PathBuf,
    files: StdMutex<HashMap<DeviceType, File>>,
}

impl DeviceLogs {
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            files: StdMutex::new(HashMap::new()),
        }
    }

    /// Acrescenta uma linha com timestamp ao log do tipo de dispositivo.
    /// Falhas de I/O são logadas e engolidas: o log de operação nunca
    /// derruba o flow.
    pub fn append(&self, device_type: DeviceType, line: &str) {
        let mut files = match self.files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !files.contains_key(&device_type) {
            let path = self
                .log_dir
                .join(format!("{}_factory_flow.log", device_type));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    files.insert(device_type, file);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Falha ao abrir log de dispositivo");
                    return;
                }
            }
        }

        if let Some(file) = files.get_mut(&device_type) {
            let stamp = chrono::Utc::now().to_rfc3339();
            if let Err(e) = writeln!(file, "{} {}", stamp, line) {
                warn!(error = %e, "Falha ao gravar log de dispositivo");
            }
        }
    }
}

// ============================================================================
// DEVICE HANDLE
// ============================================================================

/// Conexão viva com um dispositivo.
#[derive(Debug)]
pub struct DeviceHandle {
    pub device_type: DeviceType,
    pub device_id: String,
    pub transport: Transport,
    /// Cliente HTTP reutilizável (connection pool por dispositivo).
    pub http: reqwest::Client,
}

impl DeviceHandle {
    fn connect(
        device_type: DeviceType,
        device_id: &str,
        transport: Transport,
        redfish_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(redfish_timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .with_context(|| format!("falha ao criar cliente HTTP para {}", device_id))?;

        Ok(Self {
            device_type,
            device_id: device_id.to_string(),
            transport,
            http,
        })
    }

    /// URL base do serviço de gerenciamento.
    ///
    /// Com `tunnel_port` presente, o acesso é indireto via localhost.
    pub fn base_url(&self) -> String {
        match self.transport.tunnel_port {
            Some(tunnel) => format!("{}://127.0.0.1:{}", self.transport.protocol, tunnel),
            None => format!(
                "{}://{}:{}",
                self.transport.protocol, self.transport.ip, self.transport.port
            ),
        }
    }

    /// Valor do header `Authorization` para HTTP Basic.
    pub fn authorization(&self) -> String {
        let credentials = format!("{}:{}", self.transport.user, self.transport.password);
        format!("Basic {}", BASE64.encode(credentials))
    }

    /// Encerra a sessão. O pool HTTP é drenado no drop; aqui só
    /// registramos o encerramento.
    pub async fn close(&self) {
        debug!(
            device = %format!("{}/{}", self.device_type, self.device_id),
            "Fechando handle de dispositivo"
        );
    }
}

// ============================================================================
// DEVICE REGISTRY
// ============================================================================

/// Registry de handles: criação preguiçosa, cache por `(tipo, id)`.
///
/// Handles de ids distintos são independentes; o mesmo handle não é
/// compartilhado entre flows concorrentes (responsabilidade de autoria
/// dos flows).
pub struct DeviceRegistry {
    config: Arc<Configuration>,
    handles: Mutex<HashMap<(DeviceType, String), Arc<DeviceHandle>>>,
    logs: Arc<DeviceLogs>,
}

impl DeviceRegistry {
    pub fn new<P: AsRef<Path>>(config: Arc<Configuration>, log_dir: P) -> Self {
        Self {
            config,
            handles: Mutex::new(HashMap::new()),
            logs: Arc::new(DeviceLogs::new(log_dir)),
        }
    }

    pub fn logs(&self) -> Arc<DeviceLogs> {
        Arc::clone(&self.logs)
    }

    /// Obtém o handle do dispositivo, construindo-o na primeira chamada.
    pub async fn get(&self, device_type: DeviceType, device_id: &str) -> Result<Arc<DeviceHandle>> {
        let mut handles = self.handles.lock().await;

        let key = (device_type, device_id.to_string());
        if let Some(handle) = handles.get(&key) {
            return Ok(Arc::clone(handle));
        }

        let transport = self
            .config
            .transport(device_type, device_id)
            .cloned()
            .with_context(|| {
                format!("conexão não definida para {}/{}", device_type, device_id)
            })?;

        let timeout = Duration::from_secs(self.config.settings.redfish_timeout);
        let handle = Arc::new(DeviceHandle::connect(
            device_type,
            device_id,
            transport,
            timeout,
        )?);

        info!(device = %format!("{}/{}", device_type, device_id), "Handle de dispositivo criado");
        handles.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Dispositivos tocados até agora (entrada para coleta de diagnóstico).
    pub async fn touched(&self) -> Vec<(DeviceType, String, Transport)> {
        let handles = self.handles.lock().await;
        handles
            .values()
            .map(|h| (h.device_type, h.device_id.clone(), h.transport.clone()))
            .collect()
    }

    /// Fecha todos os handles em cache. Chamado em todo caminho de saída
    /// do engine; erros de close são logados e engolidos.
    pub async fn close_all(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.values() {
            handle.close().await;
        }
        handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn test_config() -> Arc<Configuration> {
        let mut compute = StdHashMap::new();
        compute.insert(
            "tray0".to_string(),
            Transport {
                ip: "10.0.0.1".to_string(),
                user: "admin".to_string(),
                password: "secret".to_string(),
                port: 443,
                protocol: "https".to_string(),
                tunnel_port: None,
            },
        );
        let mut connection = StdHashMap::new();
        connection.insert(DeviceType::Compute, compute);

        Arc::new(Configuration {
            connection,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_lazy_handle_cache() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(test_config(), dir.path());

        assert!(registry.touched().await.is_empty());

        let a = registry.get(DeviceType::Compute, "tray0").await.unwrap();
        let b = registry.get(DeviceType::Compute, "tray0").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b)); // mesmo handle, sem reconexão

        let touched = registry.touched().await;
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].1, "tray0");
    }

    #[tokio::test]
    async fn test_unknown_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(test_config(), dir.path());

        let result = registry.get(DeviceType::Switch, "nvsw0").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_all_clears_cache() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(test_config(), dir.path());

        registry.get(DeviceType::Compute, "tray0").await.unwrap();
        registry.close_all().await;
        assert!(registry.touched().await.is_empty());
    }

    #[test]
    fn test_base_url_direct_and_tunnel() {
        let direct = DeviceHandle::connect(
            DeviceType::Compute,
            "tray0",
            Transport {
                ip: "10.0.0.1".to_string(),
                user: "admin".to_string(),
                password: "secret".to_string(),
                port: 443,
                protocol: "https".to_string(),
                tunnel_port: None,
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(direct.base_url(), "https://10.0.0.1:443");

        let tunneled = DeviceHandle::connect(
            DeviceType::Compute,
            "tray0",
            Transport {
                ip: "10.0.0.1".to_string(),
                user: "admin".to_string(),
                password: "secret".to_string(),
                port: 443,
                protocol: "https".to_string(),
                tunnel_port: Some(2201),
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(tunneled.base_url(), "https://127.0.0.1:2201");
    }

    #[test]
    fn test_authorization_header() {
        let handle = DeviceHandle::connect(
            DeviceType::Compute,
            "tray0",
            Transport {
                ip: "10.0.0.1".to_string(),
                user: "admin".to_string(),
                password: "secret".to_string(),
                port: 443,
                protocol: "https".to_string(),
                tunnel_port: None,
            },
            Duration::from_secs(5),
        )
        .unwrap();
        // base64("admin:secret")
        assert_eq!(handle.authorization(), "Basic YWRtaW46c2VjcmV0");
    }

    #[test]
    fn test_device_logs_append() {
        let dir = tempfile::tempdir().unwrap();
        let logs = DeviceLogs::new(dir.path());

        logs.append(DeviceType::Compute, "show_version tray0: ok");
        logs.append(DeviceType::Compute, "update_firmware tray0: iniciado");

        let content =
            std::fs::read_to_string(dir.path().join("compute_factory_flow.log")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("show_version tray0: ok"));
    }
}
