//! Nested op calls: resolution, param binding and output extraction.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::{CallContext, Caller};
use crate::data::resolve_relative;
use crate::error::CallError;
use crate::interpreter::{interpret_value, ref_to_name};
use crate::spec::{OpCallSpec, OpSpec, ParamSpec};
use crate::types::{Lineage, OpCall, Scope, Value, ValueKind};

impl Caller {
    pub(super) async fn call_op(
        self: &Arc<Self>,
        ctx: &CallContext,
        lineage: Lineage,
        op: &OpCall,
        spec: &OpCallSpec,
        scope: Scope,
        parent_op_ref: &str,
    ) -> Result<Scope, CallError> {
        let reference = resolve_relative(parent_op_ref, &op.reference);
        let handle = self
            .resolver
            .resolve(&reference, op.pull_creds.as_ref())
            .await?;
        let op_spec = handle.op_spec().await?;

        let inputs = bind_params(&scope, &op_spec, spec)?;
        tracing::debug!(
            call_id = %lineage.id,
            op_ref = handle.reference(),
            inputs = inputs.len(),
            "Op inputs bound"
        );

        let op_outputs = self
            .call(
                ctx,
                lineage.child(),
                inputs,
                op_spec.run.as_ref(),
                handle.reference(),
            )
            .await?;

        Ok(extract_outputs(&op_outputs, &op_spec.outputs, &spec.outputs))
    }
}

/// Bind `op`'s declared inputs for a call from `scope`.
///
/// Each input takes its explicit expression, else the same-named scope
/// variable, else its default. Every problem (missing input, wrong type,
/// undeclared input or output binding) is reported in one validation error.
pub(crate) fn bind_params(
    scope: &Scope,
    op: &OpSpec,
    call: &OpCallSpec,
) -> Result<Scope, CallError> {
    let mut problems: Vec<String> = Vec::new();

    for name in call.inputs.keys() {
        if !op.inputs.contains_key(name) {
            problems.push(format!("{name}: not a declared input"));
        }
    }
    for (local, source) in &call.outputs {
        let source = source.as_deref().map(ref_to_name).unwrap_or(local.as_str());
        if !op.outputs.contains_key(source) {
            problems.push(format!("{local}: {source} is not a declared output"));
        }
    }

    let mut bound = Scope::new();
    for (name, param) in &op.inputs {
        let explicit = match call.inputs.get(name) {
            Some(Some(expr)) => match interpret_value(scope, expr, &format!("inputs.{name}")) {
                Ok(value) => Some(value),
                Err(err) => {
                    problems.push(format!("{name}: {err}"));
                    continue;
                }
            },
            _ => None,
        };

        let value = explicit
            .or_else(|| scope.get(name).cloned())
            .or_else(|| param.default.as_ref().and_then(Value::from_json));
        let Some(value) = value else {
            problems.push(format!("{name}: required"));
            continue;
        };

        match check_kind(value, param) {
            Ok(value) => {
                bound.insert(name.clone(), value);
            }
            Err(actual) => problems.push(format!(
                "{name}: expected {}, got {actual}",
                param.kind.map(|k| k.as_str()).unwrap_or_default()
            )),
        }
    }

    if problems.is_empty() {
        Ok(bound)
    } else {
        Err(CallError::Validation(
            problems.iter().map(|p| format!("\n- {p}")).collect(),
        ))
    }
}

/// Coerce `value` to the param's declared kind where a lossless conversion
/// exists. Returns the actual kind on mismatch.
fn check_kind(value: Value, param: &ParamSpec) -> Result<Value, ValueKind> {
    let Some(expected) = param.kind else {
        return Ok(value);
    };
    if value.kind() == expected {
        return Ok(value);
    }
    match (value, expected) {
        (Value::String(s), ValueKind::File) => Ok(Value::File(PathBuf::from(s))),
        (Value::String(s), ValueKind::Dir) => Ok(Value::Dir(PathBuf::from(s))),
        (Value::String(s), ValueKind::Socket) => Ok(Value::Socket(s)),
        (v @ (Value::Number(_) | Value::Boolean(_)), ValueKind::String) => {
            Ok(Value::String(v.coerce_to_string()))
        }
        (other, _) => Err(other.kind()),
    }
}

/// Declared outputs present in the op's outbound scope, renamed through the
/// call's output bindings when it has any.
fn extract_outputs(
    op_outputs: &Scope,
    declared: &BTreeMap<String, ParamSpec>,
    bindings: &BTreeMap<String, Option<String>>,
) -> Scope {
    if bindings.is_empty() {
        return declared
            .keys()
            .filter_map(|name| op_outputs.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
    }
    bindings
        .iter()
        .filter_map(|(local, source)| {
            let source = source.as_deref().map(ref_to_name).unwrap_or(local.as_str());
            op_outputs.get(source).map(|v| (local.clone(), v.clone()))
        })
        .collect()
}
