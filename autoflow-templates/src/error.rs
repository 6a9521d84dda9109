//! ABOUTME: Error taxonomy for the template registry, distinct from `autoflow_core::Error`
//! ABOUTME: since failures here (unknown template, missing parameter) predate any run

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("no template registered with name '{0}'")]
    UnknownTemplate(String),

    #[error("template '{template}' already registered")]
    DuplicateTemplate { template: String },

    #[error("template '{template}' is missing required parameter '{parameter}'")]
    MissingParameter { template: String, parameter: String },

    #[error("materialised document for template '{template}' is not a valid workflow: {source}")]
    InvalidDocument {
        template: String,
        #[source]
        source: autoflow_core::Error,
    },

    #[error("writing materialised template to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TemplateError>;
