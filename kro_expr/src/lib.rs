#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Kro_expr parses, type-checks and evaluates the `${...}` expressions embedded in resource
//! templates.
//!
//! The expression language is CEL with a restricted environment: the only top-level names are
//! the ones bound by the caller (the instance `schema` plus one name per resource node), and
//! only a whitelisted set of functions is callable. Parsing and type-checking run at analysis
//! time with no live values; evaluation runs during reconciliation against a [`Bindings`]
//! snapshot of live objects.

use std::fmt;

use cel::Program;

mod eval;
mod typecheck;

pub use eval::{Bindings, eval_fragments};
pub use typecheck::{TypeEnv, check_fragments};

pub use kro_schema::Type;

/// Error covers parse, type and evaluation failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Parse indicates the expression source does not compile.
    #[error("parse error in {src:?}: {msg}")]
    Parse {
        /// The offending source.
        src: String,
        /// The parser's message.
        msg: String,
    },
    /// Unterminated indicates a `${` with no matching `}`.
    #[error("unterminated expression placeholder in {0:?}")]
    Unterminated(String),
    /// UnknownFunction indicates a call outside the whitelist.
    #[error("function {0:?} is not available in templates")]
    UnknownFunction(String),
    /// UnknownName indicates a top-level name with no binding.
    #[error("unknown name {0:?}")]
    UnknownName(String),
    /// Type indicates a static type mismatch.
    #[error("type error: {0}")]
    Type(String),
    /// Eval indicates the expression could not be evaluated against the live values. During
    /// reconciliation this usually means a referent has not materialized yet.
    #[error("evaluation error in {src:?}: {msg}")]
    Eval {
        /// The offending source.
        src: String,
        /// The interpreter's message.
        msg: String,
    },
}

/// Result typedef for expression work.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Functions callable from templates, beyond the operators and comprehension macros.
pub static FUNCTION_WHITELIST: &[&str] = &[
    "has", "size", "startsWith", "endsWith", "contains", "matches", "string", "int", "uint",
    "double", "bool", "default", "join", "map", "filter", "all", "exists", "exists_one",
];

/// Reference is one `(root, path)` pair read by an expression.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Reference {
    /// The top-level name: `schema` or a resource id.
    pub root: String,
    /// The member path below the root, possibly empty.
    pub path: Vec<String>,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for seg in &self.path {
            write!(f, ".{seg}")?;
        }
        Ok(())
    }
}

/// Expression is one compiled `${...}` body.
pub struct Expression {
    source: String,
    program: Program,
    references: Vec<Reference>,
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("source", &self.source)
            .finish()
    }
}

impl Expression {
    /// Parse compiles the source and rejects calls outside the whitelist.
    pub fn parse(src: &str) -> Result<Expression> {
        let program = Program::compile(src).map_err(|err| Error::Parse {
            src: src.to_string(),
            msg: err.to_string(),
        })?;
        for func in program.references().functions() {
            if !function_allowed(func) {
                return Err(Error::UnknownFunction(func.to_string()));
            }
        }
        let references = typecheck::extract_references(&program);
        Ok(Expression {
            source: src.to_string(),
            program,
            references,
        })
    }

    /// Source is the original expression text, without the `${}` wrapper.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// References reports every `(root, path)` the expression reads.
    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// Check type-checks the expression against `env` and reports its result type.
    pub fn check(&self, env: &TypeEnv) -> Result<Type> {
        typecheck::check(&self.program, &self.source, env)
    }

    /// Eval evaluates against a live value snapshot.
    pub fn eval(&self, bindings: &Bindings) -> Result<serde_json::Value> {
        eval::eval(&self.program, &self.source, bindings)
    }
}

fn function_allowed(name: &str) -> bool {
    // Operator functions carry non-identifier names like `_&&_` or `@in`.
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') || name.starts_with('_') {
        return true;
    }
    FUNCTION_WHITELIST.contains(&name)
}

/// Fragment is one piece of a scanned template string.
#[derive(Debug)]
pub enum Fragment {
    /// Literal text, emitted verbatim.
    Literal(String),
    /// A compiled placeholder.
    Expr(Expression),
}

/// Scan decomposes a template string into literal and expression fragments.
///
/// `$${` escapes a literal `${`. A string with no placeholders yields a single literal
/// fragment.
pub fn scan(src: &str) -> Result<Vec<Fragment>> {
    let mut out: Vec<Fragment> = Vec::new();
    let mut literal = String::new();
    let mut rest = src;

    while let Some(at) = rest.find("${") {
        if rest[..at].ends_with('$') {
            // "$${" is an escaped literal "${".
            literal.push_str(&rest[..at.saturating_sub(1)]);
            literal.push_str("${");
            rest = &rest[at.saturating_add(2)..];
            continue;
        }
        literal.push_str(&rest[..at]);
        let body = &rest[at.saturating_add(2)..];
        let end = placeholder_end(body).ok_or_else(|| Error::Unterminated(src.to_string()))?;
        if !literal.is_empty() {
            out.push(Fragment::Literal(std::mem::take(&mut literal)));
        }
        out.push(Fragment::Expr(Expression::parse(body[..end].trim())?));
        rest = &body[end.saturating_add(1)..];
    }
    literal.push_str(rest);
    if !literal.is_empty() || out.is_empty() {
        out.push(Fragment::Literal(literal));
    }
    Ok(out)
}

/// Find the index of the `}` closing a placeholder body, honoring nested braces and CEL
/// string literals.
fn placeholder_end(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '{') => depth = depth.saturating_add(1),
            (None, '}') => {
                if depth == 0 {
                    return Some(i);
                }
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
    }
    None
}

/// Whole reports the single expression when the scan produced exactly `${expr}` and nothing
/// else. Such values keep the expression's type instead of coercing to string.
pub fn whole(fragments: &[Fragment]) -> Option<&Expression> {
    match fragments {
        [Fragment::Expr(e)] => Some(e),
        _ => None,
    }
}

/// Has_placeholders is a cheap pre-check before scanning.
pub fn has_placeholders(s: &str) -> bool {
    let mut rest = s;
    while let Some(at) = rest.find("${") {
        if at == 0 || !rest[..at].ends_with('$') {
            return true;
        }
        rest = &rest[at.saturating_add(2)..];
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exprs(fragments: &[Fragment]) -> Vec<&str> {
        fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::Expr(e) => Some(e.source()),
                Fragment::Literal(_) => None,
            })
            .collect()
    }

    #[test]
    fn scan_literal_only() {
        let frags = scan("plain text").unwrap();
        assert!(matches!(&frags[..], [Fragment::Literal(s)] if s == "plain text"));
    }

    #[test]
    fn scan_whole_expression() {
        let frags = scan("${schema.replicas}").unwrap();
        assert_eq!(exprs(&frags), vec!["schema.replicas"]);
        assert!(whole(&frags).is_some());
    }

    #[test]
    fn scan_interpolation() {
        let frags = scan("${schema.name}-svc-${schema.env}").unwrap();
        assert_eq!(exprs(&frags), vec!["schema.name", "schema.env"]);
        assert!(whole(&frags).is_none());
        assert_eq!(frags.len(), 3);
    }

    #[test]
    fn scan_nested_braces_and_strings() {
        let frags = scan(r#"${{"a": 1}["a"]}"#).unwrap();
        assert_eq!(exprs(&frags), vec![r#"{"a": 1}["a"]"#]);

        let frags = scan(r#"${schema.name == "}"}"#).unwrap();
        assert_eq!(exprs(&frags), vec![r#"schema.name == "}""#]);
    }

    #[test]
    fn scan_escape() {
        let frags = scan("$${literal}").unwrap();
        assert!(matches!(&frags[..], [Fragment::Literal(s)] if s == "${literal}"));
    }

    #[test]
    fn scan_unterminated() {
        assert!(matches!(scan("${schema.name"), Err(Error::Unterminated(_))));
    }

    #[test]
    fn parse_rejects_unlisted_functions() {
        let err = Expression::parse("dyn(schema.name)").unwrap_err();
        assert!(matches!(err, Error::UnknownFunction(f) if f == "dyn"));
    }

    #[test]
    fn parse_collects_references() {
        let e = Expression::parse("deployment.metadata.name + string(schema.replicas)").unwrap();
        let refs: Vec<String> = e.references().iter().map(|r| r.to_string()).collect();
        assert!(refs.contains(&"deployment.metadata.name".to_string()));
        assert!(refs.contains(&"schema.replicas".to_string()));
    }

    #[test]
    fn has_placeholders_ignores_escapes() {
        assert!(has_placeholders("${x}"));
        assert!(has_placeholders("a ${x} b"));
        assert!(!has_placeholders("$${x}"));
        assert!(!has_placeholders("plain"));
    }
}
