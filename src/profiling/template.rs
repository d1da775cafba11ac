//! Fingerprint templates.
//!
//! A template is literal text with embedded `#{...}` expressions. An
//! expression starts at `args` (the argument vector) or `invokedObject`
//! (the receiver) and continues with `[n]` indexing and `.field` access:
//!
//! ```text
//! svc(#{args[0]}-#{args[1]}-#{invokedObject.countryCode})
//! ```
//!
//! Strings render without quotes, missing values render as `null`, other
//! values render as JSON.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("Unterminated expression starting at {position} in '{template}'")]
    Unterminated { template: String, position: usize },

    #[error("Empty expression at {position} in '{template}'")]
    EmptyExpression { template: String, position: usize },

    #[error("Unknown root '{root}' in expression '{expression}', expected 'args' or 'invokedObject'")]
    UnknownRoot { expression: String, root: String },

    #[error("Invalid expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Args,
    InvokedObject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Accessor {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Expression {
    root: Root,
    path: Vec<Accessor>,
}

impl Expression {
    fn parse(source: &str) -> Result<Self, TemplateError> {
        let invalid = |reason: &str| TemplateError::InvalidExpression {
            expression: source.to_string(),
            reason: reason.to_string(),
        };
        let text = source.trim();
        let root_len = identifier_len(text);
        let root = match &text[..root_len] {
            "args" => Root::Args,
            "invokedObject" => Root::InvokedObject,
            other => {
                return Err(TemplateError::UnknownRoot {
                    expression: source.to_string(),
                    root: other.to_string(),
                })
            }
        };

        let mut path = Vec::new();
        let mut rest = &text[root_len..];
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let len = identifier_len(after);
                if len == 0 {
                    return Err(invalid("expected a field name after '.'"));
                }
                path.push(Accessor::Field(after[..len].to_string()));
                rest = &after[len..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let close = after.find(']').ok_or_else(|| invalid("missing ']'"))?;
                let index = after[..close]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("index must be a non-negative integer"))?;
                path.push(Accessor::Index(index));
                rest = &after[close + 1..];
            } else {
                return Err(invalid("expected '.' or '['"));
            }
        }
        Ok(Self { root, path })
    }

    fn evaluate<'a>(&self, args: &'a [Value], receiver: &'a Value) -> Option<&'a Value> {
        let mut path = self.path.iter();
        let mut current = match self.root {
            Root::InvokedObject => receiver,
            Root::Args => match path.next() {
                None => return None,
                Some(Accessor::Index(i)) => args.get(*i)?,
                Some(Accessor::Field(_)) => return None,
            },
        };
        for accessor in path {
            current = match accessor {
                Accessor::Field(name) => current.get(name.as_str())?,
                Accessor::Index(i) => current.get(*i)?,
            };
        }
        Some(current)
    }
}

fn identifier_len(text: &str) -> usize {
    text.char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Expression(Expression),
}

/// A parsed fingerprint template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;
        while let Some(start) = rest.find("#{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let body = &rest[start + 2..];
            let end = body.find('}').ok_or_else(|| TemplateError::Unterminated {
                template: source.to_string(),
                position: offset + start,
            })?;
            if body[..end].trim().is_empty() {
                return Err(TemplateError::EmptyExpression {
                    template: source.to_string(),
                    position: offset + start,
                });
            }
            segments.push(Segment::Expression(Expression::parse(&body[..end])?));
            let consumed = start + 2 + end + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// A template rendering `source` verbatim.
    pub fn literal(source: &str) -> Self {
        Self {
            source: source.to_string(),
            segments: vec![Segment::Literal(source.to_string())],
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template contains no expression.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn render(&self, args: &[Value], receiver: &Value) -> String {
        if self.is_literal() {
            return self.source.clone();
        }
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expression(expression) => {
                    out.push_str(&render_value(expression.evaluate(args, receiver)))
                }
            }
        }
        out
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
