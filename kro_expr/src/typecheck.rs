//! Static analysis over the compiled CEL AST: reference extraction and type inference.

use std::collections::BTreeMap;

use cel::Program;
use cel::common::ast::{EntryExpr, Expr};

use kro_schema::{Scalar, Type};

use crate::{Error, Fragment, Reference, Result};

/// TypeEnv is the typing environment: one [`Type`] per top-level name.
#[derive(Clone, Debug, Default)]
pub struct TypeEnv {
    roots: BTreeMap<String, Type>,
}

impl TypeEnv {
    /// New creates an empty environment.
    pub fn new() -> TypeEnv {
        TypeEnv::default()
    }

    /// Bind adds or replaces a top-level name.
    pub fn bind<S: ToString>(&mut self, name: S, ty: Type) {
        self.roots.insert(name.to_string(), ty);
    }

    /// Root reports the type bound to a top-level name.
    pub fn root(&self, name: &str) -> Option<&Type> {
        self.roots.get(name)
    }

    /// Names iterates the bound top-level names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }

    /// Resolve types a `(root, path)` reference, erroring on unknown roots and missing
    /// members.
    pub fn resolve(&self, reference: &Reference) -> Result<Type> {
        let mut cur = self
            .root(&reference.root)
            .ok_or_else(|| Error::UnknownName(reference.root.clone()))?;
        for seg in &reference.path {
            cur = cur.field(seg).ok_or_else(|| {
                Error::Type(format!("no member {seg:?} on {cur} (in {reference})"))
            })?;
        }
        Ok(cur.clone())
    }
}

/// Extract_references walks the AST and collects every `(root, path)` pair rooted at a
/// top-level name. Comprehension iteration variables are tracked and excluded.
pub(crate) fn extract_references(program: &Program) -> Vec<Reference> {
    let mut out = Vec::new();
    let mut bound = Vec::new();
    collect(&program.expression().expr, &mut bound, &mut out);
    out.sort();
    out.dedup();
    out
}

fn collect(exp: &Expr, bound: &mut Vec<String>, out: &mut Vec<Reference>) {
    use Expr::*;
    match exp {
        Unspecified | Literal(_) => {}
        Ident(v) => push_reference(v.as_str(), Vec::new(), bound, out),
        Select(e) => match chain(exp) {
            Some((root, path)) => push_reference(&root, path, bound, out),
            // Not a pure member chain; the interesting parts are below the operand.
            None => collect(&e.operand.expr, bound, out),
        },
        Call(call) => {
            if let Some(t) = &call.target {
                collect(&t.expr, bound, out);
            }
            for arg in &call.args {
                collect(&arg.expr, bound, out);
            }
        }
        Comprehension(c) => {
            collect(&c.iter_range.expr, bound, out);
            bound.push(c.iter_var.to_string());
            collect(&c.loop_step.expr, bound, out);
            bound.pop();
        }
        List(e) => {
            for elem in &e.elements {
                collect(&elem.expr, bound, out);
            }
        }
        Map(v) => {
            for entry in &v.entries {
                match &entry.expr {
                    EntryExpr::StructField(field) => collect(&field.value.expr, bound, out),
                    EntryExpr::MapEntry(map_entry) => collect(&map_entry.value.expr, bound, out),
                }
            }
        }
        Struct(v) => {
            for entry in &v.entries {
                match &entry.expr {
                    EntryExpr::StructField(field) => collect(&field.value.expr, bound, out),
                    EntryExpr::MapEntry(map_entry) => collect(&map_entry.value.expr, bound, out),
                }
            }
        }
    }
}

fn push_reference(root: &str, path: Vec<String>, bound: &[String], out: &mut Vec<Reference>) {
    if root.starts_with('@') || bound.iter().any(|b| b == root) {
        return;
    }
    out.push(Reference {
        root: root.to_string(),
        path,
    });
}

/// Chain flattens a pure `Ident.a.b.c` member chain, or reports that the expression is not
/// one.
fn chain(exp: &Expr) -> Option<(String, Vec<String>)> {
    match exp {
        Expr::Ident(v) => Some((v.to_string(), Vec::new())),
        Expr::Select(e) => {
            let (root, mut path) = chain(&e.operand.expr)?;
            path.push(e.field.to_string());
            Some((root, path))
        }
        _ => None,
    }
}

/// Check infers the result type of a program against `env`.
pub(crate) fn check(program: &Program, src: &str, env: &TypeEnv) -> Result<Type> {
    let mut checker = Checker {
        env,
        src,
        locals: Vec::new(),
    };
    checker.infer(&program.expression().expr)
}

/// Check_fragments types a scanned template string.
///
/// A whole-string expression keeps its own type; an interpolation coerces every fragment to
/// string and yields string.
pub fn check_fragments(fragments: &[Fragment], env: &TypeEnv) -> Result<Type> {
    if let Some(e) = crate::whole(fragments) {
        return e.check(env);
    }
    for fragment in fragments {
        if let Fragment::Expr(e) = fragment {
            let ty = e.check(env)?;
            if !matches!(ty, Type::Scalar(_) | Type::Any) {
                return Err(Error::Type(format!(
                    "cannot interpolate {ty} into a string (in {:?})",
                    e.source()
                )));
            }
        }
    }
    Ok(Type::Scalar(Scalar::String))
}

struct Checker<'a> {
    env: &'a TypeEnv,
    src: &'a str,
    locals: Vec<(String, Type)>,
}

impl Checker<'_> {
    fn infer(&mut self, exp: &Expr) -> Result<Type> {
        use Expr::*;
        Ok(match exp {
            Unspecified | Literal(_) => Type::Any,
            Ident(v) => self.ident(v.as_str())?,
            Select(e) => {
                let base = self.infer(&e.operand.expr)?;
                base.field(e.field.as_str())
                    .ok_or_else(|| {
                        Error::Type(format!(
                            "no member {:?} on {base} (in {:?})",
                            e.field.as_str(),
                            self.src
                        ))
                    })?
                    .clone()
            }
            Call(call) => {
                let target = match &call.target {
                    Some(t) => Some(self.infer(&t.expr)?),
                    None => None,
                };
                let mut args = Vec::new();
                for arg in &call.args {
                    args.push(self.infer(&arg.expr)?);
                }
                self.apply(call.func_name.as_str(), target, args)?
            }
            Comprehension(c) => {
                let range = self.infer(&c.iter_range.expr)?;
                let element = range.element().cloned().ok_or_else(|| {
                    Error::Type(format!("cannot iterate over {range} (in {:?})", self.src))
                })?;
                self.locals.push((c.iter_var.to_string(), element));
                let step = self.infer(&c.loop_step.expr)?;
                self.locals.pop();
                // Predicate macros fold to a boolean step; everything else stays loose.
                match step {
                    Type::Scalar(Scalar::Boolean) => Type::Scalar(Scalar::Boolean),
                    _ => Type::Any,
                }
            }
            List(e) => {
                let mut element: Option<Type> = None;
                for elem in &e.elements {
                    let ty = self.infer(&elem.expr)?;
                    element = Some(match element {
                        None => ty,
                        Some(prev) => unify(prev, ty),
                    });
                }
                Type::Array(Box::new(element.unwrap_or(Type::Any)))
            }
            Map(v) => {
                for entry in &v.entries {
                    match &entry.expr {
                        EntryExpr::StructField(field) => {
                            self.infer(&field.value.expr)?;
                        }
                        EntryExpr::MapEntry(map_entry) => {
                            self.infer(&map_entry.value.expr)?;
                        }
                    }
                }
                Type::Any
            }
            Struct(v) => {
                for entry in &v.entries {
                    match &entry.expr {
                        EntryExpr::StructField(field) => {
                            self.infer(&field.value.expr)?;
                        }
                        EntryExpr::MapEntry(map_entry) => {
                            self.infer(&map_entry.value.expr)?;
                        }
                    }
                }
                Type::Any
            }
        })
    }

    fn ident(&self, name: &str) -> Result<Type> {
        if let Some((_, ty)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Ok(ty.clone());
        }
        if name.starts_with('@') {
            return Ok(Type::Any);
        }
        self.env
            .root(name)
            .cloned()
            .ok_or_else(|| Error::UnknownName(name.to_string()))
    }

    fn apply(&self, name: &str, target: Option<Type>, args: Vec<Type>) -> Result<Type> {
        let mut all = Vec::new();
        all.extend(target);
        all.extend(args);

        Ok(match name {
            "_&&_" | "_||_" => {
                for t in &all {
                    self.want_bool(t)?;
                }
                Type::Scalar(Scalar::Boolean)
            }
            "!_" => {
                self.want_bool(&all[0])?;
                Type::Scalar(Scalar::Boolean)
            }
            "_==_" | "_!=_" | "_<_" | "_<=_" | "_>_" | "_>=_" | "@in" | "_in_" => {
                Type::Scalar(Scalar::Boolean)
            }
            "_+_" => self.add(&all[0], &all[1])?,
            "_-_" | "_*_" | "_/_" | "_%_" => self.arith(&all[0], &all[1])?,
            "-_" => self.arith(&all[0], &all[0])?,
            "_[_]" => match &all[0] {
                Type::Object(_) | Type::OpenObject(_) => Type::Any,
                other => other
                    .element()
                    .cloned()
                    .ok_or_else(|| {
                        Error::Type(format!("cannot index into {other} (in {:?})", self.src))
                    })?,
            },
            "_?_:_" => {
                self.want_bool(&all[0])?;
                unify(all[1].clone(), all[2].clone())
            }
            "has" | "@not_strictly_false" => Type::Scalar(Scalar::Boolean),
            "size" => Type::Scalar(Scalar::Integer),
            "startsWith" | "endsWith" | "matches" | "contains" => {
                if let Some(t) = all.first() {
                    if !matches!(
                        t,
                        Type::Scalar(Scalar::String) | Type::Array(_) | Type::Map(..) | Type::Any
                    ) {
                        return Err(Error::Type(format!(
                            "{name} is not applicable to {t} (in {:?})",
                            self.src
                        )));
                    }
                }
                Type::Scalar(Scalar::Boolean)
            }
            "string" => Type::Scalar(Scalar::String),
            "int" | "uint" => Type::Scalar(Scalar::Integer),
            "double" => Type::Scalar(Scalar::Number),
            "bool" => Type::Scalar(Scalar::Boolean),
            "join" => Type::Scalar(Scalar::String),
            "default" => unify(all[0].clone(), all[1].clone()),
            "map" => Type::Array(Box::new(Type::Any)),
            "filter" => all[0].clone(),
            "all" | "exists" | "exists_one" => Type::Scalar(Scalar::Boolean),
            other if !other.chars().all(|c| c.is_ascii_alphanumeric()) => Type::Any,
            other => return Err(Error::UnknownFunction(other.to_string())),
        })
    }

    fn want_bool(&self, t: &Type) -> Result<()> {
        match t {
            Type::Scalar(Scalar::Boolean) | Type::Any => Ok(()),
            other => Err(Error::Type(format!(
                "expected boolean, found {other} (in {:?})",
                self.src
            ))),
        }
    }

    fn add(&self, a: &Type, b: &Type) -> Result<Type> {
        match (a, b) {
            (Type::Any, _) | (_, Type::Any) => Ok(Type::Any),
            (Type::Scalar(Scalar::String), Type::Scalar(Scalar::String)) => {
                Ok(Type::Scalar(Scalar::String))
            }
            (Type::Array(_), Type::Array(_)) => Ok(a.clone()),
            _ => self.arith(a, b),
        }
    }

    fn arith(&self, a: &Type, b: &Type) -> Result<Type> {
        if !a.is_numeric() || !b.is_numeric() {
            return Err(Error::Type(format!(
                "arithmetic on {a} and {b} (in {:?})",
                self.src
            )));
        }
        Ok(match (a, b) {
            (Type::Scalar(Scalar::Integer), Type::Scalar(Scalar::Integer)) => {
                Type::Scalar(Scalar::Integer)
            }
            (Type::Any, Type::Any) => Type::Any,
            _ => Type::Scalar(Scalar::Number),
        })
    }
}

/// Unify two branch types; mismatched branches degrade to `Any` rather than erroring, since
/// CEL itself is happy to mix them.
fn unify(a: Type, b: Type) -> Type {
    if a == b {
        return a;
    }
    match (&a, &b) {
        (Type::Any, _) => b,
        (_, Type::Any) => a,
        (Type::Scalar(Scalar::Integer | Scalar::Number), Type::Scalar(Scalar::Integer | Scalar::Number)) => {
            Type::Scalar(Scalar::Number)
        }
        _ => Type::Any,
    }
}
