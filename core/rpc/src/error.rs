// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::classifier::{CallShape, ContextStyle, ResultStyle};

/// Errors building a service contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("duplicate operation name '{name}' in service {service}")]
    DuplicateOperation { service: String, name: String },

    #[error("method {method} of {contract} is marked as an operation but matches no call shape")]
    NotAnOperation { contract: String, method: String },
}

/// Errors resolving a marshaller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshallerError {
    #[error("no marshaller available for type {0}")]
    Unavailable(&'static str),
}

/// Errors constructing a client proxy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("operation {operation}: {source}")]
    Marshaller {
        operation: String,
        #[source]
        source: MarshallerError,
    },

    #[error(
        "no reshaping adapter for operation {operation} \
         ({shape}, {context:?}, {result:?}, void response: {response_is_void})"
    )]
    NoAdapter {
        operation: String,
        shape: CallShape,
        context: ContextStyle,
        result: ResultStyle,
        response_is_void: bool,
    },
}

/// Errors loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}
