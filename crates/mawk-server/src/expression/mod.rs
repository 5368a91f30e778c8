//! Template expressions for response bodies, headers and JWT claims.
//!
//! A template is plain text with `${ expr }` interpolations; `$${` writes a
//! literal `${`. A template made of exactly one interpolation evaluates to the
//! raw value (so `${now()}` is a number), anything else renders to a string.
//!
//! ## Module Structure
//!
//! - `parser`: lexer and recursive-descent parser producing [`Expr`]
//! - `eval`: evaluation of an [`Expr`] against a [`Context`]
//! - `functions`: the built-in function table (`now`, `duration`, `unix`,
//!   `file`, `env`, `text`)
//! - `context`: request facts turned into namespaced variables

mod context;
mod eval;
mod functions;
mod parser;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use context::RequestFacts;
pub use functions::builtin_functions;
pub use parser::{parse_expression, BinOp, Expr, Segment};

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("unknown variable {0}")]
    UnknownVariable(String),
    #[error("unknown function {0}")]
    UnknownFunction(String),
    #[error("{function}(): {message}")]
    Function { function: String, message: String },
    #[error("type error: {0}")]
    Type(String),
}

impl EvalError {
    pub fn function(function: &str, message: impl Into<String>) -> Self {
        EvalError::Function {
            function: function.to_string(),
            message: message.into(),
        }
    }
}

/// Nesting limit for `text()` blocks rendering other blocks.
pub const MAX_TEXT_DEPTH: usize = 32;

/// A callable exposed to templates.
pub type Function = Arc<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>;

/// Functions and text blocks available to every template of a loaded config.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, Function>,
    texts: HashMap<String, Template>,
}

impl FunctionTable {
    pub fn register(&mut self, name: impl Into<String>, function: Function) {
        self.functions.insert(name.into(), function);
    }

    pub fn add_text(&mut self, name: impl Into<String>, template: Template) {
        self.texts.insert(name.into(), template);
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&Template> {
        self.texts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        name == "text" || self.functions.contains_key(name)
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable")
            .field("functions", &names)
            .field("texts", &self.texts.len())
            .finish()
    }
}

/// Variables and functions a template is evaluated against.
#[derive(Debug, Clone)]
pub struct Context {
    vars: Map<String, Value>,
    functions: Arc<FunctionTable>,
    text_depth: usize,
}

impl Context {
    pub fn new(vars: Map<String, Value>, functions: Arc<FunctionTable>) -> Self {
        Self {
            vars,
            functions,
            text_depth: 0,
        }
    }

    /// Context with functions only, used for load-time values such as key
    /// material.
    pub fn empty(functions: Arc<FunctionTable>) -> Self {
        Self::new(Map::new(), functions)
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    pub fn with_var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    /// Context for rendering a `text()` block one level deeper.
    fn enter_text(&self, name: &str) -> Result<Self, EvalError> {
        if self.text_depth >= MAX_TEXT_DEPTH {
            return Err(EvalError::function(
                "text",
                format!("{name:?} nests deeper than {MAX_TEXT_DEPTH} levels"),
            ));
        }
        let mut nested = self.clone();
        nested.text_depth += 1;
        Ok(nested)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Expr(Expr),
}

/// A parsed text template.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, EvalError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let bytes = source.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if source[i..].starts_with("$${") {
                literal.push_str("${");
                i += 3;
                continue;
            }
            if source[i..].starts_with("${") {
                let start = i + 2;
                let end = find_closing_brace(source, start).ok_or_else(|| EvalError::Syntax {
                    position: i,
                    message: "unterminated ${".to_string(),
                })?;
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                parts.push(Part::Expr(parse_expression(&source[start..end])?));
                i = end + 1;
                continue;
            }
            // advance one full character
            let ch_len = source[i..].chars().next().map(char::len_utf8).unwrap_or(1);
            literal.push_str(&source[i..i + ch_len]);
            i += ch_len;
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template contains no interpolation.
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    pub fn render(&self, ctx: &Context) -> Result<Value, EvalError> {
        match self.parts.as_slice() {
            [] => Ok(Value::String(String::new())),
            [Part::Expr(expr)] => eval::evaluate(expr, ctx),
            parts => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        Part::Literal(text) => out.push_str(text),
                        Part::Expr(expr) => out.push_str(&stringify(&eval::evaluate(expr, ctx)?)),
                    }
                }
                Ok(Value::String(out))
            }
        }
    }

    pub fn render_string(&self, ctx: &Context) -> Result<String, EvalError> {
        self.render(ctx).map(|v| stringify(&v))
    }
}

fn find_closing_brace(source: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (offset, ch) in source[start..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '{' => depth += 1,
            '}' if depth == 0 => return Some(start + offset),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Render a value the way it appears inside a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A structured value whose string leaves are templates, used for bodies
/// declared as YAML maps or lists.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueTemplate {
    Text(Template),
    Array(Vec<ValueTemplate>),
    Object(Vec<(String, ValueTemplate)>),
    Literal(Value),
}

impl ValueTemplate {
    pub fn compile(value: &Value) -> Result<Self, EvalError> {
        Ok(match value {
            Value::String(s) => ValueTemplate::Text(Template::parse(s)?),
            Value::Array(items) => ValueTemplate::Array(
                items
                    .iter()
                    .map(ValueTemplate::compile)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => ValueTemplate::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), ValueTemplate::compile(v)?)))
                    .collect::<Result<_, EvalError>>()?,
            ),
            other => ValueTemplate::Literal(other.clone()),
        })
    }

    pub fn render(&self, ctx: &Context) -> Result<Value, EvalError> {
        Ok(match self {
            ValueTemplate::Text(t) => t.render(ctx)?,
            ValueTemplate::Literal(v) => v.clone(),
            ValueTemplate::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.render(ctx))
                    .collect::<Result<_, _>>()?,
            ),
            ValueTemplate::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.render(ctx)?);
                }
                Value::Object(map)
            }
        })
    }
}
