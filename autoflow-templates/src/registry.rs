//! ABOUTME: `TemplateRegistry` — resolves a template's `{{ param }}` placeholders against
//! ABOUTME: supplied values and materialises the result to disk as a concrete workflow document

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, TemplateError};
use crate::template::{Template, TemplateMetadata};

/// In-memory catalog of [`Template`]s, keyed by name. Registration is the
/// only write path; lookups and materialisation never mutate it, so a
/// single `TemplateRegistry` can be shared read-only across threads behind
/// an `Arc` the way the executor registry is (no internal locking needed
/// here since nothing is ever removed after startup).
#[derive(Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Template>,
}

impl TemplateRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from [`builtin_templates`] instead of empty.
    #[must_use]
    pub fn with_builtin_templates() -> Self {
        let mut registry = Self::new();
        for template in builtin_templates() {
            registry
                .register(template)
                .expect("builtin template names are distinct");
        }
        registry
    }

    /// # Errors
    /// Returns [`TemplateError::DuplicateTemplate`] if a template with the
    /// same name is already registered.
    pub fn register(&mut self, template: Template) -> Result<()> {
        let name = template.metadata.name.clone();
        if self.templates.contains_key(&name) {
            return Err(TemplateError::DuplicateTemplate { template: name });
        }
        self.templates.insert(name, template);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    #[must_use]
    pub fn list_metadata(&self) -> Vec<TemplateMetadata> {
        let mut metadata: Vec<_> = self.templates.values().map(|t| t.metadata.clone()).collect();
        metadata.sort_by(|a, b| a.name.cmp(&b.name));
        metadata
    }

    /// Fills in `name`'s declared `{{ param }}` placeholders from `params`,
    /// applying defaults for omitted optional ones, and parses the result
    /// through `autoflow_document::parse_str` to confirm it is a valid
    /// workflow document before returning the rendered text.
    ///
    /// Only placeholders matching a *declared template parameter* are
    /// substituted; every other `{{ ... }}` segment in `document` — a
    /// workflow input, a loop variable, anything the engine itself resolves
    /// per-run — passes through untouched. A template parameter is filled
    /// in once, here, while the surrounding workflow document still needs
    /// its own `{{ }}` expressions live for the engine to evaluate on
    /// every run.
    ///
    /// # Errors
    /// [`TemplateError::UnknownTemplate`] if `name` isn't registered,
    /// [`TemplateError::MissingParameter`] if a required parameter is
    /// omitted, [`TemplateError::InvalidDocument`] if the rendered text
    /// isn't a well-formed workflow document.
    pub fn render(&self, name: &str, params: &HashMap<String, serde_json::Value>) -> Result<String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))?;

        let mut resolved: HashMap<&str, serde_json::Value> = HashMap::new();
        for parameter in &template.metadata.parameters {
            let value = params
                .get(&parameter.name)
                .cloned()
                .or_else(|| parameter.default.clone());
            match value {
                Some(value) => {
                    resolved.insert(parameter.name.as_str(), value);
                }
                None if parameter.required => {
                    return Err(TemplateError::MissingParameter {
                        template: name.to_string(),
                        parameter: parameter.name.clone(),
                    });
                }
                None => {}
            }
        }

        let rendered = substitute_declared_params(&template.document, &resolved);

        autoflow_document::parse_str(&rendered).map_err(|source| TemplateError::InvalidDocument {
            template: name.to_string(),
            source,
        })?;

        Ok(rendered)
    }

    /// As [`Self::render`], writing the result to `output_path`.
    ///
    /// # Errors
    /// As [`Self::render`], plus [`TemplateError::Io`] on a write failure.
    pub fn materialize(
        &self,
        name: &str,
        params: &HashMap<String, serde_json::Value>,
        output_path: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let rendered = self.render(name, params)?;
        let output_path = output_path.as_ref().to_path_buf();
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| TemplateError::Io {
                path: output_path.display().to_string(),
                source,
            })?;
        }
        std::fs::write(&output_path, rendered).map_err(|source| TemplateError::Io {
            path: output_path.display().to_string(),
            source,
        })?;
        tracing::info!(template = name, path = %output_path.display(), "materialised workflow template");
        Ok(output_path)
    }
}

/// Scans `document` for `{{ ... }}` segments and replaces only those whose
/// trimmed contents exactly match a key in `resolved`; every other segment
/// (and all text outside `{{ }}`) is copied through verbatim.
fn substitute_declared_params(document: &str, resolved: &HashMap<&str, serde_json::Value>) -> String {
    let mut out = String::with_capacity(document.len());
    let mut rest = document;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str("{{");
            rest = after_open;
            continue;
        };
        let inner = &after_open[..end];
        let key = inner.trim();
        match resolved.get(key) {
            Some(value) => out.push_str(&autoflow_core::Value::from(value.clone()).to_template_string()),
            None => {
                out.push_str("{{");
                out.push_str(inner);
                out.push_str("}}");
            }
        }
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    out
}

/// A handful of ready-to-use templates covering the common shapes a
/// workflow author reaches for first: an action -> map -> action
/// pipeline, and a switch-routed notification dispatch.
#[must_use]
pub fn builtin_templates() -> Vec<Template> {
    vec![
        Template::new(
            "data-pipeline",
            "Fetch a collection, transform it, and hand off the aggregate to a sink action",
            crate::template::TemplateCategory::DataPipeline,
            DATA_PIPELINE_DOCUMENT,
        )
        .with_parameter(
            crate::template::TemplateParameter::required("source_tool")
                .with_description("tool.op that fetches the source collection"),
        )
        .with_parameter(
            crate::template::TemplateParameter::required("sink_tool")
                .with_description("tool.op that receives the aggregated result"),
        )
        .with_parameter(crate::template::TemplateParameter::optional(
            "batch_concurrency",
            serde_json::json!(1),
        )),
        Template::new(
            "priority-notification",
            "Route a notification to a queue based on an input priority field",
            crate::template::TemplateCategory::Notification,
            PRIORITY_NOTIFICATION_DOCUMENT,
        )
        .with_parameter(
            crate::template::TemplateParameter::required("notify_tool")
                .with_description("tool.op that delivers the routed notification"),
        ),
    ]
}

const DATA_PIPELINE_DOCUMENT: &str = "\
---
workflow:
  id: data-pipeline
  name: Data Pipeline
inputs:
  items:
    type: array
    required: true
steps:
  - id: fetch
    type: action
    action: \"{{ source_tool }}\"
    inputs:
      items: \"{{ items }}\"
    output_variable: fetched
  - id: transform
    type: map
    input: \"{{ fetched }}\"
    expression: item
    concurrency: {{ batch_concurrency }}
    output_variable: transformed
  - id: sink
    type: action
    action: \"{{ sink_tool }}\"
    inputs:
      items: \"{{ transformed }}\"
---
Generated data pipeline: fetch via `{{ source_tool }}`, transform, sink via `{{ sink_tool }}`.
";

const PRIORITY_NOTIFICATION_DOCUMENT: &str = "\
---
workflow:
  id: priority-notification
  name: Priority Notification
inputs:
  priority:
    type: string
    required: true
  message:
    type: string
    required: true
steps:
  - id: route
    type: switch
    expression: priority
    cases:
      high:
        - id: notify-urgent
          type: action
          action: \"{{ notify_tool }}\"
          inputs:
            queue: urgent
            message: \"{{ message }}\"
    default:
      - id: notify-normal
        type: action
        action: \"{{ notify_tool }}\"
        inputs:
          queue: normal
          message: \"{{ message }}\"
---
Routes `message` to an urgent or normal queue based on `priority` via `{{ notify_tool }}`.
";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_registry_lists_every_template() {
        let registry = TemplateRegistry::with_builtin_templates();
        let names: Vec<_> = registry.list_metadata().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["data-pipeline", "priority-notification"]);
    }

    #[test]
    fn materialize_rejects_missing_required_parameter() {
        let registry = TemplateRegistry::with_builtin_templates();
        let err = registry.render("data-pipeline", &HashMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingParameter { .. }));
    }

    #[test]
    fn render_leaves_workflow_level_placeholders_untouched() {
        let registry = TemplateRegistry::with_builtin_templates();
        let mut params = HashMap::new();
        params.insert("source_tool".to_string(), json!("http.get"));
        params.insert("sink_tool".to_string(), json!("slack.post"));

        let rendered = registry.render("data-pipeline", &params).unwrap();
        assert!(rendered.contains("http.get"));
        assert!(rendered.contains("slack.post"));
        // `items`/`fetched`/`transformed` are workflow inputs/outputs, not
        // template parameters: they must survive rendering as live `{{ }}`
        // expressions for the engine to resolve on every run.
        assert!(rendered.contains("{{ items }}"));
        assert!(rendered.contains("{{ fetched }}"));
        assert!(rendered.contains("{{ transformed }}"));
    }

    #[test]
    fn materialize_writes_a_valid_document_to_disk() {
        let registry = TemplateRegistry::with_builtin_templates();
        let mut params = HashMap::new();
        params.insert("source_tool".to_string(), json!("http.get"));
        params.insert("sink_tool".to_string(), json!("slack.post"));

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("pipeline.md");
        let path = registry.materialize("data-pipeline", &params, &output).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        autoflow_document::parse_str(&contents).unwrap();
    }

    #[test]
    fn unknown_template_name_is_an_error() {
        let registry = TemplateRegistry::new();
        let err = registry.render("does-not-exist", &HashMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownTemplate(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = TemplateRegistry::new();
        let template = Template::new(
            "dup",
            "test",
            crate::template::TemplateCategory::Custom,
            "---\nworkflow:\n  id: dup\n  name: Dup\nsteps: []\n---\n",
        );
        registry.register(template.clone()).unwrap();
        assert!(registry.register(template).is_err());
    }
}
