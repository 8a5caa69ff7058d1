//! The story format template language.
//!
//! A format's `source` is an HTML document with tags in double braces:
//!
//! - `{{path}}` inserts a value, HTML-escaped. `{{{path}}}` and `{{& path}}` insert it unescaped.
//! - `{{#if path}}…{{else}}…{{/if}}` and `{{#unless path}}…{{/unless}}` test truthiness.
//! - `{{#each path}}…{{else}}…{{/each}}` repeats its body per list item. Inside, names
//!   resolve against the item first, and `@index`, `@number`, `@first`, `@last` describe the loop.
//! - `{{! comment}}` is dropped.
//!
//! Format sources embed large amounts of JavaScript, so a `{{` that doesn't
//! form a valid tag on its line is kept as literal text. Unbalanced blocks are
//! an error at parse time. Values missing from the context render empty and
//! are reported as [RenderWarning]s.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::escape::escape_html;

/// A value available to templates.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    /// Plain text, escaped on output.
    Text(String),
    /// Trusted HTML, inserted as is.
    Markup(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn markup(html: impl Into<String>) -> Self {
        Value::Markup(html.into())
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Text(s) | Value::Markup(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    /// Looks up a map field, or a list item by index.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            Value::List(l) => key.parse::<usize>().ok().and_then(|i| l.get(i)),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Text(s.clone())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        o.map_or(Value::Null, Into::into)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(a) => Value::List(a.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(o) => Value::Map(o.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

/// The named values a template is rendered against.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    root: Value,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            root: Value::Map(BTreeMap::new()),
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if let Value::Map(m) = &mut self.root {
            m.insert(key.into(), value.into());
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }
}

/// Ways a template can be malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateErrorKind {
    #[error("{{{{#{0}}}}} is never closed")]
    UnclosedBlock(String),
    #[error("{{{{/{found}}}}} closes {{{{#{expected}}}}}")]
    MismatchedClose { expected: String, found: String },
    #[error("{{{{/{0}}}}} has no matching opening tag")]
    UnexpectedClose(String),
    #[error("{{{{else}}}} outside of a block")]
    UnexpectedElse,
    #[error("unknown block {{{{#{0}}}}}")]
    UnknownBlock(String),
}

/// A template could not be parsed. Fatal to the render.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed story format template: {kind} (line {line}, column {column})")]
pub struct TemplateError {
    pub kind: TemplateErrorKind,
    pub line: usize,
    pub column: usize,
}

/// Non-fatal problems found while rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderWarning {
    /// The path doesn't exist in the context and was rendered empty.
    MissingValue { path: String, line: usize },
    /// The path names a map, which has no text form.
    NotPrintable { path: String, line: usize },
    /// `#each` was given something other than a list.
    NotIterable { path: String, line: usize },
}

impl fmt::Display for RenderWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderWarning::MissingValue { path, line } => write!(f, "line {}: \"{}\" is not defined and was left empty", line, path),
            RenderWarning::NotPrintable { path, line } => write!(f, "line {}: \"{}\" cannot be printed and was left empty", line, path),
            RenderWarning::NotIterable { path, line } => write!(f, "line {}: \"{}\" is not a list", line, path),
        }
    }
}

/// The output of a render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub output: String,
    pub warnings: Vec<RenderWarning>,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Value { path: String, raw: bool, line: usize },
    If { path: String, negate: bool, then: Vec<Node>, otherwise: Vec<Node> },
    Each { path: String, body: Vec<Node>, otherwise: Vec<Node>, line: usize },
}

#[derive(Debug, PartialEq)]
enum TokenKind {
    Text(String),
    Value { path: String, raw: bool },
    Comment,
    Open { keyword: String, path: String },
    Close(String),
    Else,
}

#[derive(Debug)]
struct Token {
    kind: TokenKind,
    line: usize,
    column: usize,
}

fn path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\.|@(?:index|number|first|last)|[A-Za-z_][\w-]*(?:\.(?:[A-Za-z_][\w-]*|\d+))*)$")
            .expect("path pattern is valid")
    })
}

fn is_path(s: &str) -> bool {
    path_pattern().is_match(s)
}

fn is_keyword(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic())
}

/// Maps byte offsets to 1-based line and column numbers.
struct Lines {
    starts: Vec<usize>,
}

impl Lines {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    fn position(&self, source: &str, offset: usize) -> (usize, usize) {
        let line = self.starts.partition_point(|&s| s <= offset);
        let start = self.starts[line - 1];
        (line, source[start..offset].chars().count() + 1)
    }
}

fn classify(content: &str) -> Option<TokenKind> {
    if content.starts_with('!') {
        return Some(TokenKind::Comment);
    }
    if content == "else" {
        return Some(TokenKind::Else);
    }
    if let Some(rest) = content.strip_prefix('#') {
        let (keyword, path) = rest.split_once(char::is_whitespace)?;
        let path = path.trim();
        if !is_keyword(keyword) || !is_path(path) {
            return None;
        }
        return Some(TokenKind::Open {
            keyword: keyword.to_string(),
            path: path.to_string(),
        });
    }
    if let Some(rest) = content.strip_prefix('/') {
        let keyword = rest.trim();
        return is_keyword(keyword).then(|| TokenKind::Close(keyword.to_string()));
    }
    if let Some(rest) = content.strip_prefix('&') {
        let path = rest.trim();
        return is_path(path).then(|| TokenKind::Value {
            path: path.to_string(),
            raw: true,
        });
    }
    is_path(content).then(|| TokenKind::Value {
        path: content.to_string(),
        raw: false,
    })
}

/// Reads the tag starting at `start` (which points at `{{`). Returns the tag
/// and the offset just past it, or `None` if this isn't a tag.
fn read_tag(source: &str, start: usize) -> Option<(TokenKind, usize)> {
    let line_end = |from: usize| source[from..].find('\n').map_or(source.len(), |i| from + i);
    if source[start..].starts_with("{{{") {
        let inner = start + 3;
        let close = source[inner..line_end(inner)].find("}}}")?;
        let path = source[inner..inner + close].trim();
        return is_path(path).then(|| {
            (
                TokenKind::Value {
                    path: path.to_string(),
                    raw: true,
                },
                inner + close + 3,
            )
        });
    }
    let inner = start + 2;
    let close = source[inner..line_end(inner)].find("}}")?;
    let kind = classify(source[inner..inner + close].trim())?;
    Some((kind, inner + close + 2))
}

fn tokenize(source: &str) -> Vec<Token> {
    let lines = Lines::new(source);
    let mut tokens = vec![];
    let mut text = String::new();
    let mut text_start = 0;
    let mut i = 0;
    while let Some(found) = source[i..].find("{{") {
        let start = i + found;
        match read_tag(source, start) {
            Some((kind, end)) => {
                text.push_str(&source[i..start]);
                if !text.is_empty() {
                    let (line, column) = lines.position(source, text_start);
                    tokens.push(Token {
                        kind: TokenKind::Text(std::mem::take(&mut text)),
                        line,
                        column,
                    });
                }
                let (line, column) = lines.position(source, start);
                tokens.push(Token { kind, line, column });
                i = end;
                text_start = end;
            }
            None => {
                text.push_str(&source[i..start + 2]);
                i = start + 2;
            }
        }
    }
    text.push_str(&source[i..]);
    if !text.is_empty() {
        let (line, column) = lines.position(source, text_start);
        tokens.push(Token {
            kind: TokenKind::Text(text),
            line,
            column,
        });
    }
    tokens
}

/// Why a node sequence ended early.
enum Stop {
    Else { line: usize, column: usize },
    Close { keyword: String, line: usize, column: usize },
}

struct Parser {
    tokens: std::vec::IntoIter<Token>,
}

fn error(kind: TemplateErrorKind, line: usize, column: usize) -> TemplateError {
    TemplateError { kind, line, column }
}

impl Parser {
    fn sequence(&mut self) -> Result<(Vec<Node>, Option<Stop>), TemplateError> {
        let mut nodes = vec![];
        while let Some(token) = self.tokens.next() {
            let Token { kind, line, column } = token;
            match kind {
                TokenKind::Text(t) => nodes.push(Node::Text(t)),
                TokenKind::Comment => {}
                TokenKind::Value { path, raw } => nodes.push(Node::Value { path, raw, line }),
                TokenKind::Else => return Ok((nodes, Some(Stop::Else { line, column }))),
                TokenKind::Close(keyword) => return Ok((nodes, Some(Stop::Close { keyword, line, column }))),
                TokenKind::Open { keyword, path } => nodes.push(self.block(keyword, path, line, column)?),
            }
        }
        Ok((nodes, None))
    }

    /// Parses the rest of a block up to and including its closing tag.
    fn closed_by(&mut self, keyword: &str, line: usize, column: usize, allow_else: bool) -> Result<(Vec<Node>, bool), TemplateError> {
        let (nodes, stop) = self.sequence()?;
        match stop {
            None => Err(error(TemplateErrorKind::UnclosedBlock(keyword.to_string()), line, column)),
            Some(Stop::Close { keyword: found, .. }) if found == keyword => Ok((nodes, false)),
            Some(Stop::Close { keyword: found, line, column }) => Err(error(
                TemplateErrorKind::MismatchedClose {
                    expected: keyword.to_string(),
                    found,
                },
                line,
                column,
            )),
            Some(Stop::Else { .. }) if allow_else => Ok((nodes, true)),
            Some(Stop::Else { line, column }) => Err(error(TemplateErrorKind::UnexpectedElse, line, column)),
        }
    }

    fn block(&mut self, keyword: String, path: String, line: usize, column: usize) -> Result<Node, TemplateError> {
        if !matches!(keyword.as_str(), "if" | "unless" | "each") {
            return Err(error(TemplateErrorKind::UnknownBlock(keyword), line, column));
        }
        let (body, has_else) = self.closed_by(&keyword, line, column, true)?;
        let otherwise = if has_else {
            self.closed_by(&keyword, line, column, false)?.0
        } else {
            vec![]
        };
        Ok(match keyword.as_str() {
            "each" => Node::Each {
                path,
                body,
                otherwise,
                line,
            },
            _ => Node::If {
                path,
                negate: keyword == "unless",
                then: body,
                otherwise,
            },
        })
    }
}

/// A parsed template, ready to render any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

struct Scope<'a> {
    value: &'a Value,
    /// Position and length of the enclosing loop.
    index: Option<(usize, usize)>,
}

fn lookup<'a>(scopes: &[Scope<'a>], path: &str) -> Option<Cow<'a, Value>> {
    let innermost = scopes.last()?;
    let position = || scopes.iter().rev().find_map(|s| s.index);
    match path {
        "." | "this" => return Some(Cow::Borrowed(innermost.value)),
        "@index" => return position().map(|(i, _)| Cow::Owned(Value::from(i))),
        "@number" => return position().map(|(i, _)| Cow::Owned(Value::from(i + 1))),
        "@first" => return position().map(|(i, _)| Cow::Owned(Value::Bool(i == 0))),
        "@last" => return position().map(|(i, len)| Cow::Owned(Value::Bool(i + 1 == len))),
        _ => {}
    }
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = if first == "this" {
        innermost.value
    } else {
        scopes.iter().rev().find_map(|s| s.value.get(first))?
    };
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(Cow::Borrowed(current))
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Writes `value`, returning false if it has no text form.
fn write_value(out: &mut String, value: &Value, raw: bool) -> bool {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&format_number(*n)),
        Value::Text(s) if raw => out.push_str(s),
        Value::Text(s) => out.push_str(&escape_html(s)),
        Value::Markup(s) => out.push_str(s),
        Value::List(items) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                if !write_value(out, item, raw) {
                    return false;
                }
            }
        }
        Value::Map(_) => return false,
    }
    true
}

impl Template {
    /// Parses `source`. Fails if block tags are unbalanced.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut parser = Parser {
            tokens: tokenize(source).into_iter(),
        };
        let (nodes, stop) = parser.sequence()?;
        match stop {
            None => Ok(Self { nodes }),
            Some(Stop::Else { line, column }) => Err(error(TemplateErrorKind::UnexpectedElse, line, column)),
            Some(Stop::Close { keyword, line, column }) => Err(error(TemplateErrorKind::UnexpectedClose(keyword), line, column)),
        }
    }

    pub fn render(&self, context: &Context) -> Rendered {
        let mut rendered = Rendered {
            output: String::new(),
            warnings: vec![],
        };
        let mut scopes = vec![Scope {
            value: &context.root,
            index: None,
        }];
        render_nodes(&self.nodes, &mut scopes, &mut rendered);
        rendered
    }
}

fn render_nodes<'a>(nodes: &[Node], scopes: &mut Vec<Scope<'a>>, rendered: &mut Rendered) {
    for node in nodes {
        match node {
            Node::Text(t) => rendered.output.push_str(t),
            Node::Value { path, raw, line } => match lookup(scopes, path) {
                Some(value) => {
                    let mut out = String::new();
                    if write_value(&mut out, &value, *raw) {
                        rendered.output.push_str(&out);
                    } else {
                        rendered.warnings.push(RenderWarning::NotPrintable {
                            path: path.clone(),
                            line: *line,
                        });
                    }
                }
                None => {
                    tracing::warn!(%path, line, "Template value is not defined");
                    rendered.warnings.push(RenderWarning::MissingValue {
                        path: path.clone(),
                        line: *line,
                    });
                }
            },
            Node::If {
                path,
                negate,
                then,
                otherwise,
            } => {
                let truthy = lookup(scopes, path).is_some_and(|v| v.is_truthy());
                if truthy != *negate {
                    render_nodes(then, scopes, rendered);
                } else {
                    render_nodes(otherwise, scopes, rendered);
                }
            }
            Node::Each {
                path,
                body,
                otherwise,
                line,
            } => match lookup(scopes, path) {
                Some(Cow::Borrowed(Value::List(items))) if !items.is_empty() => {
                    for (i, item) in items.iter().enumerate() {
                        scopes.push(Scope {
                            value: item,
                            index: Some((i, items.len())),
                        });
                        render_nodes(body, scopes, rendered);
                        scopes.pop();
                    }
                }
                found => {
                    match found {
                        None => rendered.warnings.push(RenderWarning::MissingValue {
                            path: path.clone(),
                            line: *line,
                        }),
                        Some(v) if !matches!(*v, Value::List(_) | Value::Null) => rendered.warnings.push(RenderWarning::NotIterable {
                            path: path.clone(),
                            line: *line,
                        }),
                        Some(_) => {}
                    }
                    render_nodes(otherwise, scopes, rendered);
                }
            },
        }
    }
}

/// Parses and renders `source` in one step.
pub fn render(source: &str, context: &Context) -> Result<Rendered, TemplateError> {
    Ok(Template::parse(source)?.render(context))
}
