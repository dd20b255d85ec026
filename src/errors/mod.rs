//! # Módulo de Códigos de Erro Estruturados
//!
//! Define códigos de erro padronizados para melhor UX e integração
//! com automação externa (scripts de fábrica, CI de manufatura, dashboards).
//!
//! ## Para todos entenderem:
//!
//! Quando algo dá errado durante uma atualização de firmware, este módulo
//! fornece códigos únicos que identificam exatamente o que aconteceu.
//!
//! É como ter um "número do erro" que a esteira de fábrica pode
//! pesquisar na documentação ou usar para decidir o próximo passo.
//!
//! ## Categorias de Erro
//!
//! | Faixa  | Categoria        | Descrição                              |
//! |--------|------------------|----------------------------------------|
//! | E1xxx  | Validação        | Erro no arquivo de flow                |
//! | E2xxx  | Operação         | Falha de uma operação no dispositivo   |
//! | E3xxx  | Engine           | Falha de controle do flow              |
//! | E4xxx  | Configuração     | Problema de setup/ambiente             |
//! | E5xxx  | Interno          | Bug no próprio orquestrador            |
//!
//! ## Exemplo:
//!
//! ```text
//! Error E2001: operação update_firmware falhou
//!   Step: update_bmc
//!   Dispositivo: compute/tray0
//! ```
//!
//! A linha final `Error Code: <n>` impressa no stdout usa o código de
//! processo derivado da categoria (ver [`ErrorCode::process_exit_code`]).

use std::fmt;

// ============================================================================
// CÓDIGO DE ERRO
// ============================================================================

/// Código de erro estruturado com categoria e número.
///
/// O código é um número de 4 dígitos onde:
/// - Primeiro dígito: categoria (1-5)
/// - Últimos 3 dígitos: erro específico (001-999)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // ========================================================================
    // E1xxx: Validação do flow
    // ========================================================================
    // Erros que acontecem antes de executar qualquer coisa.
    // Problema está no arquivo de flow.

    /// Tag duplicada dentro de um escopo.
    /// Causa: dois steps do mesmo escopo declaram a mesma tag.
    pub const DUPLICATE_TAG: Self = Self(1001);

    /// Alvo de jump não resolvido.
    /// Causa: jump_on_success/jump_on_failure aponta para tag inexistente.
    pub const UNRESOLVED_JUMP: Self = Self(1002);

    /// Optional flow desconhecido.
    /// Causa: execute_optional_flow referencia flow não definido.
    pub const UNKNOWN_OPTIONAL_FLOW: Self = Self(1003);

    /// Operação não registrada para o tipo de dispositivo.
    pub const UNKNOWN_OPERATION: Self = Self(1004);

    /// Conexão ausente para (device_type, device_id).
    pub const UNKNOWN_CONNECTION: Self = Self(1005);

    /// Error handler desconhecido.
    /// Causa: execute_on_error referencia handler não registrado.
    pub const UNKNOWN_HANDLER: Self = Self(1006);

    /// Campo inválido em um step.
    /// Causa: valor fora do domínio (ex.: max_workers = 0, tag em filho paralelo).
    pub const INVALID_FIELD: Self = Self(1007);

    /// YAML de flow com formato inválido.
    pub const INVALID_FLOW_FORMAT: Self = Self(1008);

    // ========================================================================
    // E2xxx: Operações em dispositivos
    // ========================================================================
    // Erros ao executar uma operação contra BMC/switch.
    // Problema pode ser na rede, no dispositivo, ou no pacote de firmware.

    /// Operação reportou falha.
    pub const OPERATION_FAILED: Self = Self(2001);

    /// Operação abortou por deadline.
    pub const OPERATION_TIMEOUT: Self = Self(2002);

    /// Erro de conexão (DNS, rede, TLS).
    pub const CONNECTION_ERROR: Self = Self(2003);

    /// Resposta Redfish inesperada.
    pub const INVALID_RESPONSE: Self = Self(2004);

    // ========================================================================
    // E3xxx: Controle do engine
    // ========================================================================

    /// Limite de visitas por step excedido (loop de jumps).
    pub const LOOP_DETECTED: Self = Self(3001);

    /// Execução cancelada pelo operador.
    pub const CANCELLED: Self = Self(3002);

    /// Optional flow de recuperação falhou.
    pub const OPTIONAL_FLOW_FAILED: Self = Self(3003);

    // ========================================================================
    // E4xxx: Configuração/Ambiente
    // ========================================================================

    /// Variável referenciada com ${...} não definida.
    pub const VARIABLE_NOT_DEFINED: Self = Self(4001);

    /// Arquivo de configuração ausente ou ilegível.
    pub const CONFIG_FILE_ERROR: Self = Self(4002);

    /// Arquivo de flow ausente ou ilegível.
    pub const FLOW_FILE_ERROR: Self = Self(4003);

    /// Diretório de log inacessível.
    pub const LOG_DIR_ERROR: Self = Self(4004);

    // ========================================================================
    // E5xxx: Erros Internos
    // ========================================================================
    // Bugs no próprio orquestrador. Se você ver esses, reporte!

    /// Erro interno inesperado.
    pub const INTERNAL_ERROR: Self = Self(5001);

    /// Error handler lançou erro ao invés de retornar veredito.
    pub const HANDLER_ERROR: Self = Self(5002);

    /// Erro de serialização do snapshot de progresso.
    pub const SERIALIZATION_ERROR: Self = Self(5003);

    // ========================================================================
    // MÉTODOS
    // ========================================================================

    /// Retorna o código numérico.
    pub fn code(&self) -> u16 {
        self.0
    }

    /// Retorna o código formatado com prefixo "E".
    ///
    /// Exemplo: ErrorCode::LOOP_DETECTED.formatted() == "E3001"
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    /// Retorna a categoria do erro baseado no primeiro dígito.
    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Validation,
            2 => ErrorCategory::DeviceOperation,
            3 => ErrorCategory::Engine,
            4 => ErrorCategory::Configuration,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Código de saída do processo para a linha `Error Code: <n>`.
    ///
    /// 0 é reservado para execução completada; falha de flow sai com 1.
    pub fn process_exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Validation => 2,
            ErrorCategory::DeviceOperation => 1,
            ErrorCategory::Engine => {
                if *self == Self::CANCELLED {
                    4
                } else {
                    1
                }
            }
            ErrorCategory::Configuration => 3,
            ErrorCategory::Internal | ErrorCategory::Unknown => 5,
        }
    }

    /// Retorna uma descrição curta do erro.
    pub fn description(&self) -> &'static str {
        match self.0 {
            1001 => "Tag duplicada no escopo",
            1002 => "Alvo de jump não resolvido",
            1003 => "Optional flow desconhecido",
            1004 => "Operação não registrada",
            1005 => "Conexão não definida",
            1006 => "Error handler desconhecido",
            1007 => "Campo inválido",
            1008 => "Formato de flow inválido",
            2001 => "Operação falhou",
            2002 => "Timeout de operação",
            2003 => "Erro de conexão",
            2004 => "Resposta Redfish inválida",
            3001 => "Loop de jumps detectado",
            3002 => "Execução cancelada",
            3003 => "Optional flow falhou",
            4001 => "Variável não definida",
            4002 => "Erro no arquivo de configuração",
            4003 => "Erro no arquivo de flow",
            4004 => "Diretório de log inacessível",
            5001 => "Erro interno",
            5002 => "Error handler lançou erro",
            5003 => "Erro de serialização",
            _ => "Erro desconhecido",
        }
    }
}

/// Permite usar ErrorCode em format!() e println!().
impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

// ============================================================================
// CATEGORIA DE ERRO
// ============================================================================

/// Categoria de erro baseada no primeiro dígito do código.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Erros de validação do flow (E1xxx).
    Validation,

    /// Erros de operação em dispositivo (E2xxx).
    DeviceOperation,

    /// Erros de controle do engine (E3xxx).
    Engine,

    /// Erros de configuração/ambiente (E4xxx).
    Configuration,

    /// Erros internos (E5xxx).
    Internal,

    /// Código fora das faixas conhecidas.
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "Validação"),
            Self::DeviceOperation => write!(f, "Operação"),
            Self::Engine => write!(f, "Engine"),
            Self::Configuration => write!(f, "Configuração"),
            Self::Internal => write!(f, "Interno"),
            Self::Unknown => write!(f, "Desconhecido"),
        }
    }
}

/// Erro estruturado com código, mensagem e contexto.
#[derive(Debug)]
pub struct StructuredError {
    /// Código do erro.
    pub code: ErrorCode,
    /// Mensagem detalhada.
    pub message: String,
    /// Contexto adicional (step, dispositivo).
    pub context: Option<ErrorContext>,
}

/// Contexto adicional do erro.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Nome do step onde ocorreu o erro.
    pub step_name: Option<String>,
    /// Dispositivo relacionado ("compute/tray0").
    pub device: Option<String>,
    /// Caminho do campo no arquivo de flow.
    pub path: Option<String>,
}

impl StructuredError {
    /// Cria um novo erro estruturado.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    /// Adiciona step_name ao contexto.
    pub fn with_step(mut self, step_name: impl Into<String>) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        ctx.step_name = Some(step_name.into());
        self
    }

    /// Adiciona o dispositivo ao contexto.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        ctx.device = Some(device.into());
        self
    }

    /// Formata o erro para exibição ao operador.
    pub fn user_message(&self) -> String {
        let mut msg = format!("[{}] {}", self.code, self.message);

        if let Some(ctx) = &self.context {
            if let Some(step) = &ctx.step_name {
                msg.push_str(&format!(" (step: {})", step));
            }
            if let Some(device) = &ctx.device {
                msg.push_str(&format!(" (dispositivo: {})", device));
            }
            if let Some(path) = &ctx.path {
                msg.push_str(&format!(" (em: {})", path));
            }
        }

        msg
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for StructuredError {}
