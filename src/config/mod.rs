//! # Módulo de Configuração
//!
//! Carrega e representa o YAML de configuração da plataforma: variáveis
//! para interpolação, mapa de conexões por dispositivo, settings globais
//! e blocos específicos de classe de dispositivo.
//!
//! ## Estrutura do arquivo:
//!
//! ```yaml
//! variables:
//!   output_mode: log
//!   nvdebug_path: /usr/local/bin/nvdebug
//!   fw_bundle: /firmware/rack_bundle.fwpkg
//! connection:
//!   compute:
//!     tray0:
//!       ip: 10.0.10.1
//!       user: admin
//!       password: "${ENV_BMC_PASSWORD}"
//!   switch:
//!     nvsw0:
//!       ip: 10.0.20.1
//!       user: admin
//!       password: admin
//! settings:
//!   default_retry_count: 2
//!   redfish_timeout: 60
//!   execute_on_error: error_handler_collect_nvdebug_logs
//! compute:
//!   post_logging_enabled: true
//! ```
//!
//! A configuração é imutável após o load. Chaves desconhecidas no topo
//! são ignoradas sem erro.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// TIPO DE DISPOSITIVO
// ============================================================================

/// Classe de dispositivo alcançável pelo orquestrador.
///
/// Cada tipo tem seu próprio conjunto de operações registradas e seu
/// próprio arquivo de log (`compute_factory_flow.log` etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Tray de computação (BMC/HMC via Redfish).
    Compute,
    /// Tray de switch de rede.
    Switch,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Switch => "switch",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// TRANSPORTE
// ============================================================================

/// Descritor de transporte de uma conexão fora de banda.
///
/// Uma entrada por dispositivo em `connection.<tipo>.<id>`.
#[derive(Debug, Clone, Deserialize)]
pub struct Transport {
    /// Endereço IP do controlador de gerenciamento.
    pub ip: String,

    /// Usuário de autenticação.
    pub user: String,

    /// Senha de autenticação.
    pub password: String,

    /// Porta do serviço (443 por padrão).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Protocolo de acesso ("https" por padrão).
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Porta de túnel opcional (acesso indireto via head node).
    #[serde(default)]
    pub tunnel_port: Option<u16>,
}

fn default_port() -> u16 {
    443
}

fn default_protocol() -> String {
    "https".to_string()
}

// ============================================================================
// SETTINGS
// ============================================================================

/// Settings globais de execução.
///
/// Valem para todos os steps que não declaram o campo correspondente.
/// O arquivo de flow pode sobrescrever qualquer um via seu bloco `settings`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Retries padrão por step (0 = uma única tentativa).
    #[serde(default)]
    pub default_retry_count: u32,

    /// Espera padrão após sucesso de um step, em segundos.
    #[serde(default)]
    pub default_wait_after_seconds: u64,

    /// Espera padrão entre tentativas de retry, em segundos.
    #[serde(default)]
    pub default_wait_between_retries_seconds: u64,

    /// Timeout de sessão SSH, em segundos.
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout: u64,

    /// Timeout de requisição Redfish, em segundos.
    #[serde(default = "default_redfish_timeout")]
    pub redfish_timeout: u64,

    /// Error handler de nível de flow, invocado uma vez quando o flow
    /// inteiro falha (coleta de logs, limpeza).
    #[serde(default)]
    pub execute_on_error: Option<String>,

    /// Limite de visitas por step antes de abortar por loop de jumps.
    #[serde(default = "default_max_step_visits")]
    pub max_step_visits: u32,
}

fn default_ssh_timeout() -> u64 {
    30
}

fn default_redfish_timeout() -> u64 {
    60
}

fn default_max_step_visits() -> u32 {
    100
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_retry_count: 0,
            default_wait_after_seconds: 0,
            default_wait_between_retries_seconds: 0,
            ssh_timeout: default_ssh_timeout(),
            redfish_timeout: default_redfish_timeout(),
            execute_on_error: None,
            max_step_visits: default_max_step_visits(),
        }
    }
}

/// Sobrescritas parciais de settings vindas do arquivo de flow.
///
/// Somente os campos presentes no YAML substituem o valor da configuração.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsOverride {
    #[serde(default)]
    pub default_retry_count: Option<u32>,
    #[serde(default)]
    pub default_wait_after_seconds: Option<u64>,
    #[serde(default)]
    pub default_wait_between_retries_seconds: Option<u64>,
    #[serde(default)]
    pub ssh_timeout: Option<u64>,
    #[serde(default)]
    pub redfish_timeout: Option<u64>,
    #[serde(default)]
    pub execute_on_error: Option<String>,
    #[serde(default)]
    pub max_step_visits: Option<u32>,
}

impl Settings {
    /// Aplica as sobrescritas do arquivo de flow sobre esta base.
    pub fn merged(&self, over: &SettingsOverride) -> Settings {
        Settings {
            default_retry_count: over.default_retry_count.unwrap_or(self.default_retry_count),
            default_wait_after_seconds: over
                .default_wait_after_seconds
                .unwrap_or(self.default_wait_after_seconds),
            default_wait_between_retries_seconds: over
                .default_wait_between_retries_seconds
                .unwrap_or(self.default_wait_between_retries_seconds),
            ssh_timeout: over.ssh_timeout.unwrap_or(self.ssh_timeout),
            redfish_timeout: over.redfish_timeout.unwrap_or(self.redfish_timeout),
            execute_on_error: over
                .execute_on_error
                .clone()
                .or_else(|| self.execute_on_error.clone()),
            max_step_visits: over.max_step_visits.unwrap_or(self.max_step_visits),
        }
    }
}

// ============================================================================
// CONFIGURAÇÃO
// ============================================================================

/// Configuração completa da plataforma, imutável após o load.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    /// Variáveis para interpolação `${nome}` no arquivo de flow.
    #[serde(default)]
    pub variables: HashMap<String, serde_yaml::Value>,

    /// Conexões: tipo de dispositivo → id → transporte.
    #[serde(default)]
    pub connection: HashMap<DeviceType, HashMap<String, Transport>>,

    /// Settings globais de execução.
    #[serde(default)]
    pub settings: Settings,

    /// Bloco específico da classe compute (DOT, post_logging_enabled, ...).
    /// Mantido bruto: consumido pelas operações, não pelo engine.
    #[serde(default)]
    pub compute: Option<serde_yaml::Value>,

    /// Bloco específico da classe switch.
    #[serde(default)]
    pub switch: Option<serde_yaml::Value>,
}

/// Erro de carga da configuração.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("falha ao ler '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("falha ao parsear '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl Configuration {
    /// Carrega a configuração de um arquivo YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path_str.clone(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path_str,
            source,
        })
    }

    /// Busca a conexão de um dispositivo.
    pub fn transport(&self, device_type: DeviceType, device_id: &str) -> Option<&Transport> {
        self.connection
            .get(&device_type)
            .and_then(|m| m.get(device_id))
    }

    /// Lê uma variável como string, se existir e for escalar textual.
    pub fn variable_str(&self, name: &str) -> Option<String> {
        match self.variables.get(name) {
            Some(serde_yaml::Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
variables:
  output_mode: log
  fw_bundle: /firmware/rack.fwpkg
connection:
  compute:
    tray0:
      ip: 10.0.10.1
      user: admin
      password: secret
  switch:
    nvsw0:
      ip: 10.0.20.1
      user: admin
      password: admin
      port: 8443
      protocol: https
      tunnel_port: 2201
settings:
  default_retry_count: 2
  default_wait_between_retries_seconds: 5
  execute_on_error: default_error_handler
compute:
  post_logging_enabled: true
unknown_top_level: ignored
"#;

    #[test]
    fn test_parse_full_configuration() {
        let config: Configuration = serde_yaml::from_str(SAMPLE).unwrap();

        assert_eq!(config.variable_str("output_mode").as_deref(), Some("log"));

        let tray0 = config.transport(DeviceType::Compute, "tray0").unwrap();
        assert_eq!(tray0.ip, "10.0.10.1");
        assert_eq!(tray0.port, 443); // padrão
        assert_eq!(tray0.protocol, "https");

        let nvsw0 = config.transport(DeviceType::Switch, "nvsw0").unwrap();
        assert_eq!(nvsw0.port, 8443);
        assert_eq!(nvsw0.tunnel_port, Some(2201));

        assert_eq!(config.settings.default_retry_count, 2);
        assert_eq!(config.settings.default_wait_between_retries_seconds, 5);
        assert_eq!(config.settings.redfish_timeout, 60); // padrão
        assert_eq!(
            config.settings.execute_on_error.as_deref(),
            Some("default_error_handler")
        );

        assert!(config.compute.is_some());
        assert!(config.switch.is_none());
    }

    #[test]
    fn test_missing_transport() {
        let config: Configuration = serde_yaml::from_str(SAMPLE).unwrap();
        assert!(config.transport(DeviceType::Compute, "tray9").is_none());
    }

    #[test]
    fn test_settings_merge() {
        let base = Settings {
            default_retry_count: 2,
            redfish_timeout: 60,
            ..Default::default()
        };
        let over = SettingsOverride {
            default_retry_count: Some(5),
            execute_on_error: Some("error_handler_collect_nvdebug_logs".to_string()),
            ..Default::default()
        };

        let merged = base.merged(&over);
        assert_eq!(merged.default_retry_count, 5); // sobrescrito
        assert_eq!(merged.redfish_timeout, 60); // mantido
        assert_eq!(
            merged.execute_on_error.as_deref(),
            Some("error_handler_collect_nvdebug_logs")
        );
    }

    #[test]
    fn test_empty_configuration_defaults() {
        let config: Configuration = serde_yaml::from_str("{}").unwrap();
        assert!(config.variables.is_empty());
        assert_eq!(config.settings.max_step_visits, 100);
        assert_eq!(config.settings.default_retry_count, 0);
    }
}
