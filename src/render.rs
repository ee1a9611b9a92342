//! Template rendering for prompt axes.
//!
//! Templates use `{name}` placeholders with `{{` / `}}` as literal braces.
//! Anything after `:` or `!` inside a placeholder is accepted and ignored.
//! Structured values render the way the prompt templates were authored against:
//! lists as `['a', 'b']`, dialogue turns as `{0: 'a', 1: 'b'}`, and label
//! definitions as `{'label': 'definition'}`.

use std::collections::BTreeSet;
use std::fmt::Write as FmtWrite;
use thiserror::Error;

/// Errors raised while parsing or rendering a template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Unknown placeholder `{0}` in template")]
    UnknownPlaceholder(String),

    #[error("Unbalanced brace at byte {0}")]
    UnbalancedBrace(usize),

    #[error("Invalid literal mapping: {0}")]
    InvalidLiteral(String),
}

/// A value that can be substituted into a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Plain text, substituted verbatim
    Text(String),
    /// Ordered list of strings
    List(Vec<String>),
    /// Dialogue turns keyed by position
    Turns(Vec<String>),
    /// Ordered string-to-string mapping
    Mapping(Vec<(String, String)>),
}

impl FieldValue {
    /// Whether the value counts as empty for conditional formatting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::List(items) | Self::Turns(items) => items.is_empty(),
            Self::Mapping(pairs) => pairs.is_empty(),
        }
    }

    /// Render the value as it appears inside a prompt
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::List(items) => render_list(items),
            Self::Turns(items) => {
                let body: Vec<String> = items
                    .iter()
                    .enumerate()
                    .map(|(i, turn)| format!("{i}: {}", quote_literal(turn)))
                    .collect();
                format!("{{{}}}", body.join(", "))
            }
            Self::Mapping(pairs) => render_mapping(pairs),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

fn parse(template: &str) -> Result<Vec<Segment>, RenderError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => {
                if chars.peek().map(|&(_, next)| next) == Some('{') {
                    chars.next();
                    literal.push('{');
                    continue;
                }

                let mut field = String::new();
                let mut closed = false;
                for (_, next) in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    field.push(next);
                }
                if !closed {
                    return Err(RenderError::UnbalancedBrace(pos));
                }

                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                let name = field
                    .split([':', '!'])
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                segments.push(Segment::Field(name));
            }
            '}' => {
                if chars.peek().map(|&(_, next)| next) == Some('}') {
                    chars.next();
                    literal.push('}');
                    continue;
                }
                return Err(RenderError::UnbalancedBrace(pos));
            }
            _ => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

/// Collect the placeholder names a template declares
///
/// # Errors
///
/// Returns `RenderError::UnbalancedBrace` for malformed templates.
pub fn placeholders(template: &str) -> Result<BTreeSet<String>, RenderError> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Field(name) if !name.is_empty() => Some(name),
            _ => None,
        })
        .collect())
}

/// Format a template with only the fields it declares and that carry a value.
///
/// The substitution set is `declared placeholders ∩ non-empty provided fields`.
/// Declared placeholders outside that set render as the empty string, so a
/// template that never mentions `{subject}` does not care whether a subject
/// exists, and an empty field never injects an empty expansion of its own.
///
/// # Errors
///
/// Returns `RenderError::UnbalancedBrace` for malformed templates.
pub fn conditional_format(
    template: &str,
    fields: &[(&str, Option<&FieldValue>)],
) -> Result<String, RenderError> {
    let segments = parse(template)?;
    let declared: BTreeSet<&str> = segments
        .iter()
        .filter_map(|segment| match segment {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
        .collect();

    let relevant: Vec<(&str, String)> = fields
        .iter()
        .filter(|(name, _)| declared.contains(name))
        .filter_map(|(name, value)| {
            value
                .filter(|v| !v.is_empty())
                .map(|v| (*name, v.render()))
        })
        .collect();

    let mut output = String::with_capacity(template.len());
    for segment in &segments {
        match segment {
            Segment::Literal(text) => output.push_str(text),
            Segment::Field(name) => {
                if let Some((_, value)) = relevant.iter().find(|(n, _)| *n == name.as_str()) {
                    output.push_str(value);
                }
            }
        }
    }

    Ok(output)
}

/// Format a template where every placeholder must be supplied
///
/// # Errors
///
/// Returns `RenderError::UnknownPlaceholder` when the template names a field
/// that is not in `fields`, or `RenderError::UnbalancedBrace` for malformed
/// templates.
pub fn format_strict(template: &str, fields: &[(&str, &str)]) -> Result<String, RenderError> {
    let mut output = String::with_capacity(template.len());
    for segment in parse(template)? {
        match segment {
            Segment::Literal(text) => output.push_str(&text),
            Segment::Field(name) => {
                let value = fields
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| *v)
                    .ok_or_else(|| RenderError::UnknownPlaceholder(name.clone()))?;
                output.push_str(value);
            }
        }
    }
    Ok(output)
}

/// Single-quote a string, switching to double quotes when it holds only single quotes
#[must_use]
pub fn quote_literal(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };

    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Render a list of strings as `['a', 'b']`
#[must_use]
pub fn render_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| quote_literal(s)).collect();
    format!("[{}]", quoted.join(", "))
}

/// Render an ordered mapping as `{'k': 'v'}`
#[must_use]
pub fn render_mapping(pairs: &[(String, String)]) -> String {
    let mut out = String::from("{");
    for (i, (key, value)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write!(out, "{}: {}", quote_literal(key), quote_literal(value)).ok();
    }
    out.push('}');
    out
}

/// Parse a literal string-to-string mapping such as `{'joy': 'feeling of pleasure'}`.
///
/// Typographic single quotes are normalized to `'` before parsing. Keys and
/// values must be single- or double-quoted strings; a trailing comma is allowed.
///
/// # Errors
///
/// Returns `RenderError::InvalidLiteral` if the text is not such a mapping.
pub fn parse_literal_mapping(source: &str) -> Result<Vec<(String, String)>, RenderError> {
    let normalized = source.replace(['\u{2018}', '\u{2019}'], "'");
    let mut parser = LiteralParser {
        chars: normalized.chars().collect(),
        pos: 0,
    };

    parser.skip_ws();
    parser.expect('{')?;
    let mut pairs = Vec::new();

    loop {
        parser.skip_ws();
        if parser.eat('}') {
            break;
        }
        let key = parser.string()?;
        parser.skip_ws();
        parser.expect(':')?;
        parser.skip_ws();
        let value = parser.string()?;
        pairs.push((key, value));
        parser.skip_ws();
        if parser.eat(',') {
            continue;
        }
        parser.skip_ws();
        parser.expect('}')?;
        break;
    }

    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(RenderError::InvalidLiteral(format!(
            "trailing input at offset {}",
            parser.pos
        )));
    }

    Ok(pairs)
}

struct LiteralParser {
    chars: Vec<char>,
    pos: usize,
}

impl LiteralParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), RenderError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(RenderError::InvalidLiteral(format!(
                "expected `{expected}` at offset {}",
                self.pos
            )))
        }
    }

    fn string(&mut self) -> Result<String, RenderError> {
        let quote = match self.peek() {
            Some(q @ ('\'' | '"')) => q,
            _ => {
                return Err(RenderError::InvalidLiteral(format!(
                    "expected quoted string at offset {}",
                    self.pos
                )))
            }
        };
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == quote {
                return Ok(out);
            }
            if c == '\\' {
                let escaped = self.peek().ok_or_else(|| {
                    RenderError::InvalidLiteral("dangling escape".to_string())
                })?;
                self.pos += 1;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
            } else {
                out.push(c);
            }
        }

        Err(RenderError::InvalidLiteral("unterminated string".to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // =========================================================================
    // Placeholder extraction
    // =========================================================================

    #[test]
    fn test_placeholders_basic() {
        let names = placeholders("Text: {context} about {subject}").unwrap();
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["context".to_string(), "subject".to_string()]
        );
    }

    #[test]
    fn test_placeholders_ignore_escapes_and_specs() {
        let names = placeholders("{{literal}} {context:>10} {label_list!r}").unwrap();
        assert!(names.contains("context"));
        assert!(names.contains("label_list"));
        assert!(!names.contains("literal"));
    }

    #[test]
    fn test_unbalanced_brace() {
        assert_eq!(
            placeholders("oops {context"),
            Err(RenderError::UnbalancedBrace(5))
        );
        assert!(placeholders("oops }").is_err());
    }

    // =========================================================================
    // Conditional formatting
    // =========================================================================

    #[test]
    fn test_conditional_format_substitutes_declared_fields() {
        let context = FieldValue::from("I feel great");
        let out = conditional_format("Post: {context}", &[("context", Some(&context))]).unwrap();
        assert_eq!(out, "Post: I feel great");
    }

    #[test]
    fn test_conditional_format_ignores_undeclared_missing_fields() {
        let context = FieldValue::from("hello");
        let out = conditional_format(
            "Post: {context}",
            &[("context", Some(&context)), ("subject", None)],
        )
        .unwrap();
        assert_eq!(out, "Post: hello");
    }

    #[test]
    fn test_conditional_format_empty_value_renders_nothing() {
        let subject = FieldValue::from("");
        let out =
            conditional_format("Subject: [{subject}]", &[("subject", Some(&subject))]).unwrap();
        assert_eq!(out, "Subject: []");
    }

    #[test]
    fn test_conditional_format_is_idempotent() {
        let labels = FieldValue::List(vec!["yes".into(), "no".into()]);
        let fields = [("label_list", Some(&labels))];
        let first = conditional_format("Choose from {label_list}.", &fields).unwrap();
        let second = conditional_format("Choose from {label_list}.", &fields).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "Choose from ['yes', 'no'].");
    }

    #[test]
    fn test_conditional_format_keeps_literal_braces() {
        let out = conditional_format("{{\"label\": ...}}", &[]).unwrap();
        assert_eq!(out, "{\"label\": ...}");
    }

    #[test]
    fn test_format_strict_unknown_placeholder() {
        let err = format_strict("{system_instruction}{extra}", &[("system_instruction", "x")])
            .unwrap_err();
        assert_eq!(err, RenderError::UnknownPlaceholder("extra".to_string()));
    }

    #[test]
    fn test_format_strict_all_fields() {
        let out = format_strict("[{a}|{b}]", &[("a", "1"), ("b", "2")]).unwrap();
        assert_eq!(out, "[1|2]");
    }

    // =========================================================================
    // Value rendering
    // =========================================================================

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("joy"), "'joy'");
        assert_eq!(quote_literal("don't"), "\"don't\"");
        assert_eq!(quote_literal("say \"hi\" it's"), "'say \"hi\" it\\'s'");
        assert_eq!(quote_literal("a\nb"), "'a\\nb'");
    }

    #[test]
    fn test_render_turns() {
        let turns = FieldValue::Turns(vec!["Hi".into(), "Hello".into()]);
        assert_eq!(turns.render(), "{0: 'Hi', 1: 'Hello'}");
    }

    #[test]
    fn test_render_mapping() {
        let mapping = FieldValue::Mapping(vec![("joy".into(), "happiness".into())]);
        assert_eq!(mapping.render(), "{'joy': 'happiness'}");
    }

    #[test]
    fn test_empty_values() {
        assert!(FieldValue::List(Vec::new()).is_empty());
        assert!(FieldValue::Mapping(Vec::new()).is_empty());
        assert!(!FieldValue::from("x").is_empty());
    }

    // =========================================================================
    // Literal mapping parsing
    // =========================================================================

    #[test]
    fn test_parse_literal_mapping() {
        let pairs = parse_literal_mapping("{'yes': 'stressed', \"no\": 'not stressed',}").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("yes".to_string(), "stressed".to_string()),
                ("no".to_string(), "not stressed".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_literal_mapping_typographic_quotes() {
        let pairs = parse_literal_mapping("{\u{2018}joy\u{2019}: \u{2018}pleasure\u{2019}}").unwrap();
        assert_eq!(pairs, vec![("joy".to_string(), "pleasure".to_string())]);
    }

    #[test]
    fn test_parse_literal_mapping_empty() {
        assert!(parse_literal_mapping("{}").unwrap().is_empty());
        assert!(parse_literal_mapping("  { }  ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_literal_mapping_invalid() {
        assert!(parse_literal_mapping("none").is_err());
        assert!(parse_literal_mapping("{'a' 'b'}").is_err());
        assert!(parse_literal_mapping("{'a': 'b'").is_err());
        assert!(parse_literal_mapping("{'a': 'b'} extra").is_err());
    }
}
