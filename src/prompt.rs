//! Prompt templating.
//!
//! Templates use `{name}` placeholders, where `name` is an identifier of
//! ASCII letters, digits and underscores. `{{` and `}}` produce literal
//! braces. Anything else in braces (e.g. `{ "a": 1 }`) is copied through.
//!
//! Rendering is a single left-to-right pass: substituted values are never
//! re-scanned, so a stage output that happens to contain `{market_research}`
//! is inserted verbatim.

use std::collections::BTreeMap;
use std::fmt;

/// A template referenced a placeholder with no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unbound(pub String);

impl fmt::Display for Unbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no value for placeholder '{{{}}}'", self.0)
    }
}

impl std::error::Error for Unbound {}

enum Token<'a> {
    Literal(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Walk `template`, handing each token to `visit`. Stops at the first error.
fn scan<'a, E>(
    template: &'a str,
    mut visit: impl FnMut(Token<'a>) -> Result<(), E>,
) -> Result<(), E> {
    let mut rest = template;
    while let Some(pos) = rest.find(|c: char| c == '{' || c == '}') {
        visit(Token::Literal(&rest[..pos]))?;
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            visit(Token::Brace('{'))?;
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with("}}") {
            visit(Token::Brace('}'))?;
            rest = &tail[2..];
            continue;
        }
        if let Some(end) = tail[1..].find('}').filter(|_| tail.starts_with('{')) {
            let name = &tail[1..1 + end];
            if is_identifier(name) {
                visit(Token::Placeholder(name))?;
                rest = &tail[end + 2..];
                continue;
            }
        }

        // Lone brace: both `{` and `}` are one byte.
        visit(Token::Literal(&tail[..1]))?;
        rest = &tail[1..];
    }
    visit(Token::Literal(rest))
}

/// Distinct placeholder names in `template`, in order of first appearance.
///
/// # Example
///
/// ```
/// use prfaq_pipeline::prompt::placeholders;
///
/// let names = placeholders("Idea: {product_idea}\nResearch: {market_research}\n{{literal}}");
/// assert_eq!(names, vec!["product_idea", "market_research"]);
/// ```
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let _: Result<(), ()> = scan(template, |token| {
        if let Token::Placeholder(name) = token {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        Ok(())
    });
    names
}

/// Fill `template` from `vars`.
///
/// Fails on the first placeholder with no entry in `vars`. Extra entries are
/// ignored.
///
/// # Example
///
/// ```
/// use prfaq_pipeline::prompt::render;
/// use std::collections::BTreeMap;
///
/// let mut vars = BTreeMap::new();
/// vars.insert("name".to_string(), "Alice".to_string());
/// let result = render("Hello {name}, JSON: {{\"key\": \"val\"}}", &vars).unwrap();
/// assert_eq!(result, r#"Hello Alice, JSON: {"key": "val"}"#);
/// ```
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, Unbound> {
    let mut out = String::with_capacity(template.len());
    scan(template, |token| {
        match token {
            Token::Literal(s) => out.push_str(s),
            Token::Brace(c) => out.push(c),
            Token::Placeholder(name) => match vars.get(name) {
                Some(value) => out.push_str(value),
                None => return Err(Unbound(name.to_string())),
            },
        }
        Ok(())
    })?;
    Ok(out)
}
