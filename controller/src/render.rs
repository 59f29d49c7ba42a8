//! Render materializes a node's template against a live value snapshot.

use serde_json::Value;

use kro_expr::{Bindings, eval_fragments};
use kro_graph::{NodeAnalysis, PathSegment};

/// Render deep-clones the node's template and substitutes every expression site.
///
/// A whole-string placeholder replaces its node with whatever value the expression yielded;
/// interpolations always yield strings. Any unresolved reference aborts the render, which the
/// reconciler treats as the node not being ready to apply yet.
pub fn render(node: &NodeAnalysis, bindings: &Bindings) -> Result<Value, kro_expr::Error> {
    let mut doc = Value::Object(node.template.clone().unwrap_or_default());
    for site in &node.sites {
        let value = eval_fragments(&site.fragments, bindings)?;
        set_path(&mut doc, &site.path, value);
    }
    Ok(doc)
}

fn set_path(doc: &mut Value, path: &[PathSegment], value: Value) {
    match path {
        [] => *doc = value,
        [head, rest @ ..] => {
            let slot = match (head, doc) {
                (PathSegment::Key(k), Value::Object(map)) => map.get_mut(k),
                (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i),
                _ => None,
            };
            if let Some(slot) = slot {
                set_path(slot, rest, value);
            }
        }
    }
}
