//! Prompt template rendering — `{{path.to.var}}` substitution.
//!
//! Variables resolve by dotted path into a JSON object; unknown paths
//! render as empty strings so a missing variable never fails a run.

use serde_json::Value;

fn resolve_path<'a>(variables: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = variables;
    for token in path.split('.') {
        current = current.as_object()?.get(token)?;
    }
    Some(current)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every `{{ var }}` placeholder in `template` with the value at
/// its dotted path in `variables`.
pub fn render_prompt_template(template: &str, variables: &Value) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let key = after_open[..close].trim();
                if let Some(value) = resolve_path(variables, key) {
                    output.push_str(&render_value(value));
                }
                rest = &after_open[close + 2..];
            }
            None => {
                // Unbalanced braces: emit the remainder verbatim.
                output.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_substitution() {
        let variables = json!({ "topic": "spring sale", "offer": "20% off" });
        assert_eq!(
            render_prompt_template("Write about {{topic}} with CTA {{offer}}.", &variables),
            "Write about spring sale with CTA 20% off."
        );
    }

    #[test]
    fn test_dotted_paths() {
        let variables = json!({ "brand": { "voice": "friendly", "tone": { "formality": "casual" } } });
        assert_eq!(
            render_prompt_template("Voice: {{brand.voice}}, {{brand.tone.formality}}", &variables),
            "Voice: friendly, casual"
        );
    }

    #[test]
    fn test_missing_path_renders_empty() {
        let variables = json!({ "topic": "x" });
        assert_eq!(
            render_prompt_template("A {{missing}} B {{topic.deeper}} C", &variables),
            "A  B  C"
        );
    }

    #[test]
    fn test_whitespace_in_braces() {
        let variables = json!({ "topic": "launch" });
        assert_eq!(
            render_prompt_template("{{ topic }}!", &variables),
            "launch!"
        );
    }

    #[test]
    fn test_non_string_values_serialized() {
        let variables = json!({ "count": 3, "flags": ["a", "b"] });
        assert_eq!(
            render_prompt_template("{{count}} and {{flags}}", &variables),
            "3 and [\"a\",\"b\"]"
        );
    }

    #[test]
    fn test_unbalanced_braces_pass_through() {
        let variables = json!({});
        assert_eq!(
            render_prompt_template("before {{never closed", &variables),
            "before {{never closed"
        );
    }
}
