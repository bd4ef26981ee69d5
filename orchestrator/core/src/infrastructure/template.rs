// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Prompt Template Resolution
//!
//! Resolves brace-wrapped placeholders (`{name}`) against the runtime
//! context. Placeholders that name a missing context key stay literal so
//! agents see exactly what the author wrote. String values substitute raw;
//! other JSON values substitute as compact JSON.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::handlers::TemplateResolver;

pub struct BraceTemplateResolver {
    placeholder: Regex,
}

impl BraceTemplateResolver {
    pub fn new() -> Self {
        Self {
            // Single-brace names: letters, digits, underscore, dot, dash.
            placeholder: Regex::new(r"\{([A-Za-z0-9_.\-]+)\}").expect("static regex"),
        }
    }
}

impl Default for BraceTemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateResolver for BraceTemplateResolver {
    fn resolve(&self, template: &str, context: &HashMap<String, Value>) -> String {
        self.placeholder
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let key = &caps[1];
                match context.get(key) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_resolves_string_values_raw() {
        let resolver = BraceTemplateResolver::new();
        let context = ctx(&[("topic", json!("compilers"))]);
        assert_eq!(
            resolver.resolve("Write about {topic}.", &context),
            "Write about compilers."
        );
    }

    #[test]
    fn test_unresolved_placeholders_stay_literal() {
        let resolver = BraceTemplateResolver::new();
        assert_eq!(
            resolver.resolve("Hello {missing}!", &HashMap::new()),
            "Hello {missing}!"
        );
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        let resolver = BraceTemplateResolver::new();
        let context = ctx(&[("count", json!(3)), ("flags", json!({"a": true}))]);
        assert_eq!(resolver.resolve("{count}", &context), "3");
        assert_eq!(resolver.resolve("{flags}", &context), r#"{"a":true}"#);
    }

    #[test]
    fn test_multiple_placeholders() {
        let resolver = BraceTemplateResolver::new();
        let context = ctx(&[("a", json!("x")), ("b", json!("y"))]);
        assert_eq!(resolver.resolve("{a}-{b}-{a}", &context), "x-y-x");
    }
}
