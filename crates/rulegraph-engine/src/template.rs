use crate::MergedContent;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rulegraph_core::{ModelFormat, RenderContext, RenderingSettings, RuleType};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// `{{ ident }}` with optional padding inside the braces
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Any brace pair, valid or not
static BRACED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("brace pattern is valid"));

const DEFAULT_MODEL: &str = "default";

/// Variable names referenced by `template`
pub fn extract_variables(template: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// `{{ ... }}` sequences that are not valid placeholders, e.g. `{{ user.name }}`
pub fn find_malformed(template: &str) -> Vec<String> {
    BRACED
        .find_iter(template)
        .filter(|m| !PLACEHOLDER.is_match(m.as_str()))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Result of substituting one template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub unresolved: BTreeSet<String>,
}

/// Substitute placeholders from `context` in a single pass.
///
/// Substituted values are never scanned again, so a context value containing
/// `{{x}}` stays literal. Placeholders without a value are left in place and
/// reported.
pub fn render(template: &str, context: &RenderContext) -> Rendered {
    let mut unresolved = BTreeSet::new();
    let text = PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match context.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                unresolved.insert(caps[1].to_string());
                caps[0].to_string()
            }
        })
        .into_owned();
    Rendered { text, unresolved }
}

/// Reserved variables a composite template uses to place its children
pub fn slot_names(child_type: RuleType) -> [String; 2] {
    [
        child_type.as_str().to_string(),
        format!("{}_rules", child_type.as_str()),
    ]
}

fn child_separator(child_type: Option<RuleType>) -> &'static str {
    match child_type {
        Some(RuleType::Primitive) => "\n",
        _ => "\n\n",
    }
}

/// Text after applying a model's framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatted {
    pub text: String,
    pub warning: Option<String>,
}

/// Fully rendered hierarchy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderedPrompt {
    pub text: String,
    /// Every variable referenced by any template in the hierarchy
    pub template_variables: Vec<String>,
    pub unresolved_variables: Vec<String>,
}

/// Placeholder substitution and per-model framing
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    models: BTreeMap<String, ModelFormat>,
}

impl TemplateRenderer {
    pub fn new(settings: &RenderingSettings) -> Self {
        let models = settings
            .models
            .iter()
            .map(|(name, format)| (name.to_lowercase(), format.clone()))
            .collect();
        Self { models }
    }

    pub fn supported_models(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    /// Wrap `text` in the framing configured for `model_name`.
    ///
    /// Unknown models degrade to pass-through with a warning.
    pub fn format_for_model(&self, text: &str, model_name: &str) -> Formatted {
        let key = model_name.trim().to_lowercase();
        match self.models.get(&key) {
            Some(format) => Formatted {
                text: format!("{}{}{}", format.prefix, text, format.suffix),
                warning: None,
            },
            None if key.is_empty() || key == DEFAULT_MODEL => Formatted {
                text: text.to_string(),
                warning: None,
            },
            None => {
                warn!("Unknown target model '{}'; prompt left unformatted", model_name);
                Formatted {
                    text: text.to_string(),
                    warning: Some(format!(
                        "Unknown target model '{}'; prompt returned without model-specific formatting",
                        model_name
                    )),
                }
            }
        }
    }

    /// Render merged fragments bottom-up into one prompt.
    ///
    /// Fragments arrive in post-order, so each composite finds its rendered
    /// children on top of the stack. Children are bound to the slot variables
    /// of their tier; a parent that names no slot gets them appended.
    pub fn render_merged(&self, merged: &MergedContent, context: &RenderContext) -> RenderedPrompt {
        let mut stack: Vec<String> = Vec::with_capacity(merged.fragments.len());
        let mut template_variables = BTreeSet::new();
        let mut unresolved = BTreeSet::new();

        for fragment in &merged.fragments {
            let split_at = stack.len().saturating_sub(fragment.child_count);
            let children = stack.split_off(split_at);

            let referenced = extract_variables(&fragment.template);

            let mut vars = fragment.attributes.clone();
            vars.extend(context.iter().map(|(k, v)| (k.clone(), v.clone())));
            vars.extend(
                fragment
                    .effective_override
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );

            let child_type = fragment.rule_type.child_type();
            let block = children.join(child_separator(child_type));
            let mut uses_slot = false;
            if let Some(child_type) = child_type {
                for slot in slot_names(child_type) {
                    uses_slot |= referenced.contains(&slot);
                    vars.insert(slot, block.clone());
                }
            }

            let rendered = render(&fragment.template, &vars);
            unresolved.extend(rendered.unresolved);
            template_variables.extend(referenced);

            let text = if uses_slot || block.is_empty() {
                rendered.text
            } else if rendered.text.trim().is_empty() {
                block
            } else {
                format!("{}\n\n{}", rendered.text.trim_end(), block)
            };
            stack.push(text);
        }

        if stack.len() > 1 {
            debug!("{} root fragments after merge; joining", stack.len());
        }

        RenderedPrompt {
            text: stack.join("\n\n"),
            template_variables: template_variables.into_iter().collect(),
            unresolved_variables: unresolved.into_iter().collect(),
        }
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new(&RenderingSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> RenderContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_variables() {
        let vars = extract_variables("{{tone}} and {{ audience }} but not {{1bad}} or {{a.b}}");
        assert_eq!(
            vars.into_iter().collect::<Vec<_>>(),
            vec!["audience".to_string(), "tone".to_string()]
        );
    }

    #[test]
    fn test_render_substitutes_and_reports_missing() {
        let rendered = render("Hi {{name}}, {{missing}}!", &ctx(&[("name", "Ada")]));
        assert_eq!(rendered.text, "Hi Ada, {{missing}}!");
        assert!(rendered.unresolved.contains("missing"));
    }

    #[test]
    fn test_render_is_single_pass() {
        let rendered = render(
            "{{a}} {{b}}",
            &ctx(&[("a", "{{b}}"), ("b", "{{__import__}}")]),
        );
        assert_eq!(rendered.text, "{{b}} {{__import__}}");
        assert!(rendered.unresolved.is_empty());
    }

    #[test]
    fn test_find_malformed() {
        let bad = find_malformed("ok {{ fine }} {{ user.name }} {{}} {{ 9lives }}");
        assert_eq!(bad, vec!["{{ user.name }}", "{{}}", "{{ 9lives }}"]);
    }

    #[test]
    fn test_format_for_model() {
        let renderer = TemplateRenderer::default();

        let claude = renderer.format_for_model("body", "Claude");
        assert!(claude.text.starts_with("<thinking>"));
        assert!(claude.text.ends_with("body"));
        assert!(claude.warning.is_none());

        let plain = renderer.format_for_model("body", "default");
        assert_eq!(plain.text, "body");
        assert!(plain.warning.is_none());

        let unknown = renderer.format_for_model("body", "mystery-llm");
        assert_eq!(unknown.text, "body");
        assert!(unknown.warning.is_some());
    }
}
