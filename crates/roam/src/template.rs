//! `{name}` message templates.
//!
//! Placeholders are brace-delimited names; `{{` and `}}` produce literal
//! braces. A template is parsed once and rendered many times. Rendering
//! with a name that has no binding is an error, never a silent drop.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unclosed placeholder starting at byte {position}")]
    UnclosedPlaceholder { position: usize },
    #[error("single '}}' at byte {position}; use '}}}}' for a literal brace")]
    UnmatchedClosingBrace { position: usize },
    #[error("empty placeholder at byte {position}")]
    EmptyPlaceholder { position: usize },
    #[error("no value bound for placeholder '{{{name}}}'")]
    MissingBinding { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, ch)) = chars.next() {
            match ch {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(TemplateError::UnmatchedClosingBrace { position: pos }),
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some((_, '}')) => break,
                            Some((_, '{')) | None => {
                                return Err(TemplateError::UnclosedPlaceholder { position: pos })
                            }
                            Some((_, c)) => name.push(c),
                        }
                    }
                    if name.is_empty() {
                        return Err(TemplateError::EmptyPlaceholder { position: pos });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names referenced by the template, in order of first appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for seg in &self.segments {
            if let Segment::Placeholder(name) = seg {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn render(&self, bindings: &TemplateBindings) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = bindings
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingBinding { name: name.clone() })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Placeholder name to rendered value. Later inserts win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateBindings(BTreeMap<String, String>);

impl TemplateBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the fields of a serializable argument value.
    ///
    /// Struct and map fields bind by name, sequence elements by index,
    /// and a lone scalar binds as `0`. `()` and `None` bind nothing.
    pub fn from_args<A: Serialize + ?Sized>(args: &A) -> Self {
        let mut bindings = Self::new();
        match serde_json::to_value(args) {
            Ok(Value::Object(fields)) => {
                for (key, value) in fields {
                    bindings.insert(key, stringify(value));
                }
            }
            Ok(Value::Array(items)) => {
                for (idx, value) in items.into_iter().enumerate() {
                    bindings.insert(idx.to_string(), stringify(value));
                }
            }
            Ok(Value::Null) => {}
            Ok(scalar) => bindings.insert("0", stringify(scalar)),
            Err(err) => {
                tracing::warn!(error = %err, "arguments could not be bound into template values");
            }
        }
        bindings
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TemplateBindings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bindings = Self::new();
        for (k, v) in iter {
            bindings.insert(k, v);
        }
        bindings
    }
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
