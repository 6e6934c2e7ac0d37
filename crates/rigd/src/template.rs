//! Template resolution and rendering.
//!
//! Templates are JSON documents with `{{ .scenario }}`, `{{ .instance }}`,
//! and `{{ .inputs.<key> }}` placeholders. Rendering is plain text
//! substitution; a placeholder that does not resolve is an error, not an
//! empty string.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use rig_core::types::Component;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template {name:?} not found")]
    NotFound { name: String },
    #[error("template {name:?} has an unresolved placeholder {placeholder:?}")]
    UnresolvedPlaceholder { name: String, placeholder: String },
    #[error("template {name:?} did not render to a valid document: {reason}")]
    BadDocument { name: String, reason: String },
}

/// Substitution scheme for one rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scheme {
    pub scenario: String,
    pub instance: String,
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub spec: serde_json::Value,
    /// Telemetry agents the template declares; a non-empty list makes the
    /// scenario install the telemetry overlay.
    pub telemetry: Vec<String>,
    pub component: Component,
}

pub trait TemplateResolver: Send + Sync {
    fn resolve(
        &self,
        namespace: &str,
        name: &str,
        scheme: &Scheme,
    ) -> Result<RenderedTemplate, TemplateError>;
}

#[derive(Debug, Clone)]
pub struct TemplateDef {
    pub body: String,
    pub telemetry: Vec<String>,
    pub component: Component,
}

impl TemplateDef {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            telemetry: Vec::new(),
            component: Component::Sut,
        }
    }

    pub fn with_telemetry(mut self, agent: impl Into<String>) -> Self {
        self.telemetry.push(agent.into());
        self
    }

    pub fn system(mut self) -> Self {
        self.component = Component::Sys;
        self
    }
}

/// In-memory template catalog.
#[derive(Debug, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, TemplateDef>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, def: TemplateDef) {
        self.templates.insert(name.into(), def);
    }
}

impl TemplateResolver for TemplateCatalog {
    fn resolve(
        &self,
        _namespace: &str,
        name: &str,
        scheme: &Scheme,
    ) -> Result<RenderedTemplate, TemplateError> {
        let def = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::NotFound {
                name: name.to_string(),
            })?;

        let rendered = render(name, &def.body, scheme)?;
        let spec =
            serde_json::from_str(&rendered).map_err(|err| TemplateError::BadDocument {
                name: name.to_string(),
                reason: err.to_string(),
            })?;

        Ok(RenderedTemplate {
            spec,
            telemetry: def.telemetry.clone(),
            component: def.component,
        })
    }
}

pub fn render(name: &str, body: &str, scheme: &Scheme) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::UnresolvedPlaceholder {
                name: name.to_string(),
                placeholder: after.trim().to_string(),
            });
        };

        let placeholder = after[..end].trim();
        let value = match placeholder {
            ".scenario" => Some(scheme.scenario.as_str()),
            ".instance" => Some(scheme.instance.as_str()),
            key => key
                .strip_prefix(".inputs.")
                .and_then(|input| scheme.inputs.get(input))
                .map(String::as_str),
        };

        let Some(value) = value else {
            return Err(TemplateError::UnresolvedPlaceholder {
                name: name.to_string(),
                placeholder: placeholder.to_string(),
            });
        };

        out.push_str(value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Round-scoped cache of rendered templates, keyed by the template name and
/// a digest of the substitution scheme.
#[derive(Debug, Default)]
pub struct RenderCache {
    entries: HashMap<String, RenderedTemplate>,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(
        &mut self,
        resolver: &dyn TemplateResolver,
        namespace: &str,
        name: &str,
        scheme: &Scheme,
    ) -> Result<RenderedTemplate, TemplateError> {
        let key = cache_key(name, scheme);
        if let Some(hit) = self.entries.get(&key) {
            return Ok(hit.clone());
        }

        let rendered = resolver.resolve(namespace, name, scheme)?;
        self.entries.insert(key, rendered.clone());
        Ok(rendered)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn cache_key(name: &str, scheme: &Scheme) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0]);
    hasher.update(scheme.scenario.as_bytes());
    hasher.update([0]);
    hasher.update(scheme.instance.as_bytes());
    for (key, value) in &scheme.inputs {
        hasher.update([0]);
        hasher.update(key.as_bytes());
        hasher.update([1]);
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
