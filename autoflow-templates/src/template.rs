//! ABOUTME: `Template` — a parameterised workflow document: raw `{{ param }}`-bearing
//! ABOUTME: frontmatter+Markdown text plus the declared parameters that fill it in

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateCategory {
    DataPipeline,
    Notification,
    Integration,
    Scheduling,
    Custom,
}

/// One declared parameter a template expects. Distinct from a workflow's
/// own `inputs` schema: a parameter is filled in once, at
/// materialisation time, becoming literal text in the produced document —
/// it is not resolved per-run like a workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

impl TemplateParameter {
    #[must_use]
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            required: true,
            default: None,
        }
    }

    #[must_use]
    pub fn optional(name: impl Into<String>, default: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            required: false,
            default: Some(default),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub name: String,
    pub description: String,
    pub category: TemplateCategory,
    pub parameters: Vec<TemplateParameter>,
}

/// A parameterised workflow document. `document` is the literal
/// frontmatter+Markdown source (same shape `autoflow_document::parse`
/// consumes) with `{{ parameter }}` placeholders standing in for whatever
/// the caller supplies at materialisation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub metadata: TemplateMetadata,
    pub document: String,
}

impl Template {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: TemplateCategory,
        document: impl Into<String>,
    ) -> Self {
        Self {
            metadata: TemplateMetadata {
                name: name.into(),
                description: description.into(),
                category,
                parameters: Vec::new(),
            },
            document: document.into(),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, parameter: TemplateParameter) -> Self {
        self.metadata.parameters.push(parameter);
        self
    }
}
