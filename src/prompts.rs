use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

const DEFAULT_REVIEW: &str = include_str!("default_prompts/review.md");
const DEFAULT_FASTPATH: &str = include_str!("default_prompts/fastpath.md");
const VERDICT_SCHEMA: &str = include_str!("default_prompts/_verdict-schema.md");

pub const UNTRUSTED_BEGIN: &str = "<<<UNTRUSTED INPUT BEGIN>>>";
pub const UNTRUSTED_END: &str = "<<<UNTRUSTED INPUT END>>>";

fn default_template(name: &str) -> Option<&'static str> {
    match name {
        "review" => Some(DEFAULT_REVIEW),
        "fastpath" => Some(DEFAULT_FASTPATH),
        _ => None,
    }
}

/// Wrap PR-supplied text in explicit untrusted-input markers so the system
/// prompt can tell the model to treat it as data only. Embedded marker
/// strings are defanged so the author cannot fake an early close.
pub fn wrap_untrusted(input: &str) -> String {
    let sanitized = input
        .replace(UNTRUSTED_BEGIN, "<untrusted-begin>")
        .replace(UNTRUSTED_END, "<untrusted-end>");
    format!("{UNTRUSTED_BEGIN}\n{sanitized}\n{UNTRUSTED_END}")
}

/// Prompt template engine with embedded defaults and user overrides.
pub struct PromptEngine {
    override_dir: Option<String>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<String>) -> Self {
        Self { override_dir }
    }

    /// Load a prompt template by name. User overrides in `override_dir`
    /// take precedence over defaults.
    pub fn load_template(&self, name: &str) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(format!("{name}.md"));
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                })?;
                return Ok(content);
            }
        }

        default_template(name)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Prompt(format!("unknown prompt template: {name}")))
    }

    /// Load a template and render it with the given variables.
    ///
    /// The output-contract block (`findings_schema`) is auto-injected when
    /// not already supplied.
    pub fn render(&self, name: &str, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.load_template(name)?;
        let mut all_vars = vars.clone();
        all_vars
            .entry("findings_schema".to_string())
            .or_insert_with(|| VERDICT_SCHEMA.to_string());
        render_template(&template, &all_vars)
    }
}

/// Render a template string using the `upon` engine.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::to_value(vars).map_err(|e| Error::Prompt(e.to_string()))?,
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}
