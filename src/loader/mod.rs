// Module: Loader
// Reads the flow file, expands variables, and hands the tree to validation.

use std::path::Path;

use thiserror::Error;

use crate::config::Configuration;
use crate::expand::{self, ExpandError};
use crate::flow::{Flow, FlowFile};
use crate::handlers::HandlerRegistry;
use crate::ops::OperationRegistry;
use crate::validation::{self, ValidationError};

#[derive(Debug, Error)]
pub enum LoadError {
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

    #[error(transparent)]
    Expand(#[from] ExpandError),

    #[error("flow inválido ({} erro(s))", .0.len())]
    Validation(Vec<ValidationError>),
}

/// Pipeline de carga: ler → expandir `${...}` → desserializar → validar.
/// Nunca devolve um flow parcialmente construído.
pub fn load_flow_file<P: AsRef<Path>>(
    path: P,
    config: &Configuration,
    ops: &OperationRegistry,
    handlers: &HandlerRegistry,
) -> Result<Flow, LoadError> {
    let path_str = path.as_ref().display().to_string();
    let content = std::fs::read_to_string(&path).map_err(|source| LoadError::Io {
        path: path_str.clone(),
        source,
    })?;

    load_flow_str(&content, &path_str, config, ops, handlers)
}

/// Variante a partir de texto já em memória (usada por testes).
pub fn load_flow_str(
    content: &str,
    origin: &str,
    config: &Configuration,
    ops: &OperationRegistry,
    handlers: &HandlerRegistry,
) -> Result<Flow, LoadError> {
    let tree: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|source| LoadError::Parse {
            path: origin.to_string(),
            source,
        })?;

    let expanded = expand::expand_tree(&tree, &config.variables)?;

    let file: FlowFile =
        serde_yaml::from_value(expanded).map_err(|source| LoadError::Parse {
            path: origin.to_string(),
            source,
        })?;

    validation::build_flow(file, config, ops, handlers).map_err(LoadError::Validation)
}
