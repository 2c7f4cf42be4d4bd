//! Template engine with named templates and shared components
//!
//! For applications that render the same handful of templates many times:
//! - Templates are compiled once and rendered by name
//! - `<template:Name>` definitions from any added template are shared
//! - Helpers, globals, config and limits are set once for every render

use indexmap::IndexMap;
use log::{debug, warn};

use crate::compile::{CompileOptions, CompiledTemplate, compile};
use crate::helpers::HelperRegistry;
use crate::limits::ResourceLimits;
use crate::render::{RenderConfig, RenderError, RenderOptions, RenderResult, render};
use crate::value::Value;
use crate::WeftError;

/// Template engine with named templates and shared components
///
/// # Example
///
/// ```ignore
/// let mut engine = TemplateEngine::new();
/// engine.add_components(r#"<template:Badge label>[${label}]</template:Badge>"#)?;
/// engine.add_template("user", r#"<p>${name} <Badge label=${role} /></p>"#)?;
///
/// // Custom helpers see the calling scope
/// engine.helpers().register_fn("shout", |args| Ok(format!("{}!", args[0].to_output_string()).into()));
///
/// let out = engine.render("user", json!({"name": "Ada", "role": "admin"}))?;
/// assert_eq!(out.html, "<p>Ada [admin]</p>");
/// ```
pub struct TemplateEngine {
    /// Globals, helpers, config, limits and the shared component map
    options: RenderOptions,

    compile_options: CompileOptions,

    /// Compiled templates by name, in insertion order
    templates: IndexMap<String, CompiledTemplate>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self {
            options: RenderOptions::default(),
            compile_options: CompileOptions::default(),
            templates: IndexMap::new(),
        }
    }

    /// Helper registry used by every render (builtins preloaded)
    pub fn helpers(&mut self) -> &mut HelperRegistry {
        &mut self.options.helpers
    }

    pub fn set_globals(&mut self, globals: impl Into<Value>) {
        self.options.globals = globals.into();
    }

    /// Replace the render config. Rejected configs leave the old one in place.
    pub fn set_config(&mut self, config: RenderConfig) -> Result<(), WeftError> {
        config.validate()?;
        self.options.config = config;
        Ok(())
    }

    pub fn set_limits(&mut self, limits: ResourceLimits) {
        self.options.limits = limits;
    }

    /// Compile future templates in strict mode
    pub fn set_strict(&mut self, strict: bool) {
        self.compile_options.strict = strict;
    }

    /// Compile and store a template
    ///
    /// Its component definitions become available to every template.
    /// A template with error diagnostics is not stored.
    pub fn add_template(
        &mut self,
        name: impl Into<String>,
        source: &str,
    ) -> Result<&CompiledTemplate, WeftError> {
        let name = name.into();
        let template = self.compile_checked(&name, source)?;
        self.share_components(&template);
        debug!("added template '{name}'");

        let (index, _) = self.templates.insert_full(name, template);
        Ok(&self.templates[index])
    }

    /// Register every `<template:Name>` definition in `source`; anything else
    /// in it is ignored. Returns the number of definitions added.
    pub fn add_components(&mut self, source: &str) -> Result<usize, WeftError> {
        let template = self.compile_checked("components", source)?;
        if template.root.iter().any(|n| !n.is_blank_text()) {
            warn!("component source has content outside definitions; ignoring it");
        }
        self.share_components(&template);
        Ok(template.components.len())
    }

    /// Remove a template. Components it defined stay registered.
    pub fn remove_template(&mut self, name: &str) -> Option<CompiledTemplate> {
        self.templates.shift_remove(name)
    }

    pub fn template(&self, name: &str) -> Option<&CompiledTemplate> {
        self.templates.get(name)
    }

    /// Render a stored template
    pub fn render(&self, name: &str, data: impl Into<Value>) -> Result<RenderResult, WeftError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| WeftError::UnknownTemplate(name.to_string()))?;
        Ok(render(template, data, &self.options)?)
    }

    /// Compile and render without storing
    pub fn render_source(
        &self,
        source: &str,
        data: impl Into<Value>,
    ) -> Result<RenderResult, WeftError> {
        let template = compile(source, &self.known_components());
        Ok(render(&template, data, &self.options)?)
    }

    /// Get names of all stored templates
    pub fn template_names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    /// Get names of all shared components
    pub fn component_names(&self) -> Vec<String> {
        self.options.components.keys().cloned().collect()
    }

    fn known_components(&self) -> CompileOptions {
        self.compile_options
            .clone()
            .with_components(&self.options.components)
    }

    fn compile_checked(&self, name: &str, source: &str) -> Result<CompiledTemplate, WeftError> {
        let template = compile(source, &self.known_components().with_source_name(name));
        if template.has_errors() {
            warn!("template '{name}' has {} error(s)", template.errors().count());
            return Err(RenderError::InvalidTemplate {
                diagnostics: template.errors().cloned().collect(),
            }
            .into());
        }
        Ok(template)
    }

    fn share_components(&mut self, template: &CompiledTemplate) {
        for (name, def) in &template.components {
            if self.options.components.insert(name.clone(), def.clone()).is_some() {
                debug!("component <{name}> redefined");
            }
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn components_are_shared_across_templates() {
        let mut engine = TemplateEngine::new();
        engine
            .add_components("<template:Badge label>[${label}]</template:Badge>")
            .unwrap();
        engine
            .add_template("user", "<p>${name} <Badge label=${role} /></p>")
            .unwrap();
        let out = engine
            .render("user", json!({"name": "Ada", "role": "admin"}))
            .unwrap();
        assert_eq!(out.html, "<p>Ada [admin]</p>");
        assert_eq!(engine.component_names(), vec!["Badge"]);
    }

    #[test]
    fn rejects_broken_templates_and_unknown_names() {
        let mut engine = TemplateEngine::new();
        let err = engine.add_template("bad", "<div>${a +}</div>").unwrap_err();
        assert_eq!(err.code(), "INVALID_TEMPLATE");
        assert!(engine.template("bad").is_none());

        let err = engine.render("missing", json!({})).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_TEMPLATE");
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut engine = TemplateEngine::new();
        let err = engine
            .set_config(RenderConfig::new().with_source_tracking("9x"))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[test]
    fn custom_helpers_and_globals() {
        let mut engine = TemplateEngine::new();
        engine
            .helpers()
            .register_fn("shout", |args| Ok(format!("{}!", args[0].to_output_string()).into()));
        engine.set_globals(json!({"site": "weft"}));
        let out = engine.render_source("${shout($.site)}", json!({})).unwrap();
        assert_eq!(out.html, "weft!");
    }
}
