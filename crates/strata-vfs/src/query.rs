//! Structured watch queries.
//!
//! A query is a JSON object. Its optional `expression` member selects which files a subscription
//! reports; other members are carried along (they are part of the query's identity) but do not
//! affect matching. Supported terms:
//!
//! - `"true"`, `"false"`
//! - `["allof", e...]`, `["anyof", e...]`, `["not", e]`
//! - `["suffix", s]` / `["suffix", [s...]]`: extension, case-insensitive, without the dot
//! - `["name", n | [n...], scope?]`: exact name match
//! - `["match", glob, scope?]`: glob match
//! - `["dirname", d]`: path is below directory `d`
//! - `["type", "f" | "d"]`
//!
//! `scope` is `"basename"` (default) or `"wholename"` (the root-relative path).
//!
//! Parsing only checks that the text is a JSON object; terms are checked when a subscription
//! compiles the query.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

use globset::{Glob, GlobBuilder, GlobMatcher};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("watch query is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("watch query must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("unsupported watch query term `{0}`")]
    UnsupportedTerm(String),
    #[error("malformed `{term}` term: {message}")]
    InvalidTerm { term: String, message: String },
    #[error("invalid glob in watch query: {0}")]
    Glob(#[from] globset::Error),
}

/// A parsed watch query.
///
/// Equality and hashing use the canonical serialization (object keys sorted, insignificant
/// whitespace removed), so queries that differ only in formatting compare equal.
#[derive(Debug, Clone)]
pub struct WatchQuery {
    value: Value,
    canonical: String,
}

impl WatchQuery {
    /// Parses query text. Empty (or all-whitespace) text means "no query".
    pub fn parse(text: &str) -> Result<Option<Self>, QueryError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value).map(Some)
    }

    pub fn from_value(value: Value) -> Result<Self, QueryError> {
        if !value.is_object() {
            return Err(QueryError::NotAnObject(json_kind(&value)));
        }
        let canonical = value.to_string();
        Ok(Self { value, canonical })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Checks every term and builds a matcher.
    pub fn compile(&self) -> Result<CompiledQuery, QueryError> {
        let expr = match self.value.get("expression") {
            Some(expression) => Expr::compile(expression)?,
            None => Expr::True,
        };
        Ok(CompiledQuery { expr })
    }
}

impl PartialEq for WatchQuery {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for WatchQuery {}

impl Hash for WatchQuery {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for WatchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// A query whose terms have been validated.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    expr: Expr,
}

impl CompiledQuery {
    /// Matches every file.
    pub fn all() -> Self {
        Self { expr: Expr::True }
    }

    /// Whether the root-relative `path` is selected.
    pub fn matches(&self, path: &Path, is_dir: bool) -> bool {
        let wholename = path.to_string_lossy().replace('\\', "/");
        let basename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let candidate = Candidate {
            path,
            wholename: &wholename,
            basename: &basename,
            is_dir,
        };
        self.expr.matches(&candidate)
    }
}

struct Candidate<'a> {
    path: &'a Path,
    wholename: &'a str,
    basename: &'a str,
    is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Basename,
    Wholename,
}

#[derive(Debug, Clone)]
enum Expr {
    True,
    False,
    AllOf(Vec<Expr>),
    AnyOf(Vec<Expr>),
    Not(Box<Expr>),
    Suffix(Vec<String>),
    Name(Vec<String>, Scope),
    Match(GlobMatcher, Scope),
    Dirname(String),
    Type { dir: bool },
}

impl Expr {
    fn compile(value: &Value) -> Result<Self, QueryError> {
        match value {
            Value::String(term) => match term.as_str() {
                "true" => Ok(Expr::True),
                "false" => Ok(Expr::False),
                other => Err(QueryError::UnsupportedTerm(other.to_owned())),
            },
            Value::Array(items) => {
                let Some((head, args)) = items.split_first() else {
                    return Err(invalid("expression", "empty term"));
                };
                let Some(term) = head.as_str() else {
                    return Err(invalid("expression", "term name must be a string"));
                };
                Self::compile_term(term, args)
            }
            other => Err(invalid(
                "expression",
                format!("expected a string or array, got {}", json_kind(other)),
            )),
        }
    }

    fn compile_term(term: &str, args: &[Value]) -> Result<Self, QueryError> {
        match term {
            "true" if args.is_empty() => Ok(Expr::True),
            "false" if args.is_empty() => Ok(Expr::False),
            "allof" => Ok(Expr::AllOf(
                args.iter().map(Expr::compile).collect::<Result<_, _>>()?,
            )),
            "anyof" => Ok(Expr::AnyOf(
                args.iter().map(Expr::compile).collect::<Result<_, _>>()?,
            )),
            "not" => match args {
                [inner] => Ok(Expr::Not(Box::new(Expr::compile(inner)?))),
                _ => Err(invalid(term, "expected exactly one operand")),
            },
            "suffix" => {
                let [suffixes] = args else {
                    return Err(invalid(term, "expected one operand"));
                };
                let suffixes = string_list(term, suffixes)?
                    .into_iter()
                    .map(|suffix| suffix.trim_start_matches('.').to_ascii_lowercase())
                    .collect();
                Ok(Expr::Suffix(suffixes))
            }
            "name" => {
                let (names, scope) = match args {
                    [names] => (names, Scope::Basename),
                    [names, scope] => (names, parse_scope(term, scope)?),
                    _ => return Err(invalid(term, "expected a name and an optional scope")),
                };
                Ok(Expr::Name(string_list(term, names)?, scope))
            }
            "match" => {
                let (pattern, scope) = match args {
                    [pattern] => (pattern, Scope::Basename),
                    [pattern, scope] => (pattern, parse_scope(term, scope)?),
                    _ => return Err(invalid(term, "expected a glob and an optional scope")),
                };
                let Some(pattern) = pattern.as_str() else {
                    return Err(invalid(term, "glob must be a string"));
                };
                let glob = match scope {
                    Scope::Basename => Glob::new(pattern)?,
                    Scope::Wholename => GlobBuilder::new(pattern)
                        .literal_separator(true)
                        .build()?,
                };
                Ok(Expr::Match(glob.compile_matcher(), scope))
            }
            "dirname" => {
                let [dir] = args else {
                    return Err(invalid(term, "expected one directory operand"));
                };
                let Some(dir) = dir.as_str() else {
                    return Err(invalid(term, "directory must be a string"));
                };
                Ok(Expr::Dirname(dir.trim_matches('/').to_owned()))
            }
            "type" => match args {
                [Value::String(kind)] if kind == "f" => Ok(Expr::Type { dir: false }),
                [Value::String(kind)] if kind == "d" => Ok(Expr::Type { dir: true }),
                _ => Err(invalid(term, "expected \"f\" or \"d\"")),
            },
            other => Err(QueryError::UnsupportedTerm(other.to_owned())),
        }
    }

    fn matches(&self, candidate: &Candidate<'_>) -> bool {
        match self {
            Expr::True => true,
            Expr::False => false,
            Expr::AllOf(exprs) => exprs.iter().all(|expr| expr.matches(candidate)),
            Expr::AnyOf(exprs) => exprs.iter().any(|expr| expr.matches(candidate)),
            Expr::Not(expr) => !expr.matches(candidate),
            Expr::Suffix(suffixes) => candidate
                .path
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
                .is_some_and(|ext| suffixes.iter().any(|suffix| *suffix == ext)),
            Expr::Name(names, scope) => {
                let subject = scoped(candidate, *scope);
                names.iter().any(|name| name == subject)
            }
            Expr::Match(glob, scope) => glob.is_match(scoped(candidate, *scope)),
            Expr::Dirname(dir) => {
                dir.is_empty()
                    || candidate
                        .wholename
                        .strip_prefix(dir.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            Expr::Type { dir } => candidate.is_dir == *dir,
        }
    }
}

fn scoped<'a>(candidate: &Candidate<'a>, scope: Scope) -> &'a str {
    match scope {
        Scope::Basename => candidate.basename,
        Scope::Wholename => candidate.wholename,
    }
}

fn parse_scope(term: &str, value: &Value) -> Result<Scope, QueryError> {
    match value.as_str() {
        Some("basename") => Ok(Scope::Basename),
        Some("wholename") => Ok(Scope::Wholename),
        _ => Err(invalid(term, "scope must be \"basename\" or \"wholename\"")),
    }
}

fn string_list(term: &str, value: &Value) -> Result<Vec<String>, QueryError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| invalid(term, "expected a list of strings"))
            })
            .collect(),
        _ => Err(invalid(term, "expected a string or a list of strings")),
    }
}

fn invalid(term: &str, message: impl Into<String>) -> QueryError {
    QueryError::InvalidTerm {
        term: term.to_owned(),
        message: message.into(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
