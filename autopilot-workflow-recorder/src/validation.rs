//! Clean-up pass applied to every step before it is stored.

use std::sync::LazyLock;

use autopilot::{StepKind, WorkflowStep};
use regex::Regex;

// A class token starting with a digit, e.g. the `.3f9a` in `.card.3f9a`.
static NUMERIC_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[0-9][A-Za-z0-9_-]*").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Drops digit-prefixed class fragments and collapses whitespace outside of
/// quoted values. Falls back to the trimmed input if nothing would be left.
pub fn improve_selector(selector: &str) -> String {
    let mut out = String::with_capacity(selector.len());
    let mut plain = String::new();
    let mut quote: Option<char> = None;

    for c in selector.chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '"' || c == '\'' => {
                out.push_str(&clean_plain(&plain));
                plain.clear();
                out.push(c);
                quote = Some(c);
            }
            None => plain.push(c),
        }
    }
    out.push_str(&clean_plain(&plain));

    let improved = out.trim();
    if improved.is_empty() {
        selector.trim().to_string()
    } else {
        improved.to_string()
    }
}

fn clean_plain(text: &str) -> String {
    let stripped = NUMERIC_CLASS.replace_all(text, "");
    WHITESPACE.replace_all(&stripped, " ").into_owned()
}

/// Strips markup delimiters from typed text.
pub fn sanitize_input(value: &str) -> String {
    value.replace(['<', '>'], "").trim().to_string()
}

/// Applies the clean-up pass. Never fails; a step that is still malformed
/// afterwards is left for the caller to drop.
pub fn validate_step(mut step: WorkflowStep) -> WorkflowStep {
    if let Some(selector) = step.selector.take() {
        step.selector = Some(improve_selector(&selector));
    }
    if step.kind == StepKind::Input {
        step.value = step.value.map(|v| sanitize_input(&v));
    }
    step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_numeric_class_fragments() {
        assert_eq!(improve_selector(".card.3f9a"), ".card");
        assert_eq!(improve_selector("  div.item.42   >  span "), "div.item > span");
        assert_eq!(improve_selector("#login"), "#login");
    }

    #[test]
    fn leaves_quoted_values_alone() {
        assert_eq!(
            improve_selector(r#"[data-version="1.2"]"#),
            r#"[data-version="1.2"]"#
        );
        assert_eq!(
            improve_selector(r#"button:contains("Pay  9.99")"#),
            r#"button:contains("Pay  9.99")"#
        );
    }

    #[test]
    fn never_empties_a_selector() {
        assert_eq!(improve_selector(".123"), ".123");
    }

    #[test]
    fn sanitizes_input_values_only() {
        let step = validate_step(WorkflowStep::input(" #bio ", " <b>hi</b> "));
        assert_eq!(step.selector.as_deref(), Some("#bio"));
        assert_eq!(step.value.as_deref(), Some("bhi/b"));

        let key = validate_step(WorkflowStep::keypress(">", None));
        assert_eq!(key.value.as_deref(), Some(">"));
    }
}
