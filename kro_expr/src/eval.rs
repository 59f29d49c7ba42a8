//! Evaluation of compiled expressions against live value snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use cel::extractors::This;
use cel::objects::Key;
use cel::{Context, Program, Value};

use crate::{Error, Fragment, Result};

/// Bindings is a snapshot of live values, one JSON document per top-level name.
#[derive(Clone, Debug, Default)]
pub struct Bindings {
    values: BTreeMap<String, serde_json::Value>,
}

impl Bindings {
    /// New creates an empty snapshot.
    pub fn new() -> Bindings {
        Bindings::default()
    }

    /// Bind adds or replaces a top-level name.
    pub fn bind<S: ToString>(&mut self, name: S, value: serde_json::Value) {
        self.values.insert(name.to_string(), value);
    }

    /// Contains reports whether a name is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Get reports the value bound to a name.
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.values.get(name)
    }
}

pub(crate) fn eval(
    program: &Program,
    src: &str,
    bindings: &Bindings,
) -> Result<serde_json::Value> {
    let mut ctx = Context::default();
    register_functions(&mut ctx);
    for (name, value) in &bindings.values {
        let v = cel::to_value(value).map_err(|err| Error::Eval {
            src: src.to_string(),
            msg: err.to_string(),
        })?;
        ctx.add_variable_from_value(name.as_str(), v);
    }
    let out = program.execute(&ctx).map_err(|err| {
        tracing::trace!("failed to evaluate expression: {}", err);
        Error::Eval {
            src: src.to_string(),
            msg: err.to_string(),
        }
    })?;
    value_to_json(&out, src)
}

fn register_functions(ctx: &mut Context) {
    // default(value, fallback) guards null; a wholly-missing member still surfaces as an
    // evaluation error, which reconciliation treats as not-yet-available.
    ctx.add_function(
        "default",
        |value: Value, fallback: Value| -> Result<Value, cel::ExecutionError> {
            Ok(if value == Value::Null { fallback } else { value })
        },
    );
    ctx.add_function(
        "join",
        |This(items): This<Arc<Vec<Value>>>, sep: Arc<String>| -> String {
            items
                .iter()
                .map(scalar_to_string)
                .collect::<Vec<_>>()
                .join(&sep)
        },
    );
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => format!("{other:?}"),
    }
}

fn value_to_json(v: &Value, src: &str) -> Result<serde_json::Value> {
    use serde_json::json;
    Ok(match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::UInt(u) => json!(u),
        Value::Float(f) => json!(f),
        Value::String(s) => json!(s.as_str()),
        Value::List(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|v| value_to_json(v, src))
                .collect::<Result<_>>()?,
        ),
        Value::Map(m) => {
            let mut out = serde_json::Map::new();
            for (k, v) in m.map.iter() {
                out.insert(key_to_string(k), value_to_json(v, src)?);
            }
            serde_json::Value::Object(out)
        }
        other => {
            return Err(Error::Eval {
                src: src.to_string(),
                msg: format!("value {other:?} cannot be embedded in a manifest"),
            });
        }
    })
}

fn key_to_string(k: &Key) -> String {
    match k {
        Key::String(s) => s.to_string(),
        Key::Int(i) => i.to_string(),
        Key::Uint(u) => u.to_string(),
        Key::Bool(b) => b.to_string(),
    }
}

/// Eval_fragments renders a scanned template string against live values.
///
/// A whole-string expression yields its value unchanged, upgrading the node to whatever the
/// expression produced; an interpolation coerces each piece to string and concatenates.
pub fn eval_fragments(fragments: &[Fragment], bindings: &Bindings) -> Result<serde_json::Value> {
    if let Some(e) = crate::whole(fragments) {
        return e.eval(bindings);
    }
    let mut out = String::new();
    for fragment in fragments {
        match fragment {
            Fragment::Literal(s) => out.push_str(s),
            Fragment::Expr(e) => match e.eval(bindings)? {
                serde_json::Value::String(s) => out.push_str(&s),
                serde_json::Value::Number(n) => out.push_str(&n.to_string()),
                serde_json::Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),
                other => {
                    return Err(Error::Eval {
                        src: e.source().to_string(),
                        msg: format!("cannot interpolate {other} into a string"),
                    });
                }
            },
        }
    }
    Ok(serde_json::Value::String(out))
}
