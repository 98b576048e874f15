//! Call Interpreter
//!
//! Resolves a [`CallSpec`] node against a [`Scope`] into a runtime [`Call`].
//!
//! References have the form `$(name)` with optional dotted traversal into
//! objects and arrays (`$(build.outputs.0)`). A string that is exactly one
//! reference evaluates to the referenced value itself; any other string has
//! its references interpolated as text.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::CallError;
use crate::spec::{CallSpec, CallVariant, ContainerCallSpec, PredicateSpec};
use crate::types::{
    Call, CallKind, ContainerCall, ContainerImage, Lineage, LoopCall, LoopRange, OpCall, Scope,
    Value,
};

const REF_OPEN: &str = "$(";
const REF_CLOSE: char = ')';

// ─── References ───────────────────────────────────────────────

/// Strip `$(` `)` from a needs entry; bare names pass through.
pub fn ref_to_name(reference: &str) -> &str {
    reference
        .strip_prefix(REF_OPEN)
        .and_then(|r| r.strip_suffix(REF_CLOSE))
        .unwrap_or(reference)
}

/// The inner path if `expr` is exactly one `$(...)` reference.
pub fn bare_reference(expr: &str) -> Option<&str> {
    let inner = expr.strip_prefix(REF_OPEN)?.strip_suffix(REF_CLOSE)?;
    if inner.is_empty() || inner.contains(REF_OPEN) || inner.contains(REF_CLOSE) {
        return None;
    }
    Some(inner)
}

/// Look up a dotted path in scope.
pub fn lookup(scope: &Scope, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let mut current = scope.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn resolve(scope: &Scope, path: &str, field: &str) -> Result<Value, CallError> {
    lookup(scope, path).ok_or_else(|| {
        CallError::interpretation(field, format!("unable to resolve $({path}): not in scope"))
    })
}

/// Interpolate every reference in `expr` as text.
pub fn interpret_string(scope: &Scope, expr: &str, field: &str) -> Result<String, CallError> {
    let mut out = String::with_capacity(expr.len());
    let mut rest = expr;
    while let Some(start) = rest.find(REF_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + REF_OPEN.len()..];
        let end = after.find(REF_CLOSE).ok_or_else(|| {
            CallError::interpretation(field, format!("unterminated reference in \"{expr}\""))
        })?;
        out.push_str(&resolve(scope, &after[..end], field)?.coerce_to_string());
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Evaluate an op-file literal: bare references yield the referenced value,
/// strings are interpolated, containers are evaluated element-wise.
pub fn interpret_value(
    scope: &Scope,
    literal: &serde_json::Value,
    field: &str,
) -> Result<Value, CallError> {
    match literal {
        serde_json::Value::String(s) => match bare_reference(s) {
            Some(path) => resolve(scope, path, field),
            None => interpret_string(scope, s, field).map(Value::String),
        },
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| interpret_value(scope, item, field))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| interpret_value(scope, v, field).map(|v| (k.clone(), v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Value::Object),
        other => Value::from_json(other)
            .ok_or_else(|| CallError::interpretation(field, "null is not a value")),
    }
}

// ─── Predicates ───────────────────────────────────────────────

/// True when every predicate holds.
pub fn evaluate_predicates(
    scope: &Scope,
    predicates: &[PredicateSpec],
    field: &str,
) -> Result<bool, CallError> {
    for predicate in predicates {
        if !evaluate_predicate(scope, predicate, field)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn evaluate_predicate(
    scope: &Scope,
    predicate: &PredicateSpec,
    field: &str,
) -> Result<bool, CallError> {
    if let Some(operands) = &predicate.eq {
        let values = interpret_operands(scope, operands, field)?;
        return Ok(values.windows(2).all(|w| w[0] == w[1]));
    }
    if let Some(operands) = &predicate.ne {
        let values = interpret_operands(scope, operands, field)?;
        return Ok(values.windows(2).any(|w| w[0] != w[1]));
    }
    if let Some(reference) = &predicate.exists {
        return Ok(lookup(scope, ref_to_name(reference)).is_some());
    }
    if let Some(reference) = &predicate.not_exists {
        return Ok(lookup(scope, ref_to_name(reference)).is_none());
    }
    Err(CallError::interpretation(field, "empty predicate"))
}

fn interpret_operands(
    scope: &Scope,
    operands: &[serde_json::Value],
    field: &str,
) -> Result<Vec<Value>, CallError> {
    operands
        .iter()
        .map(|operand| interpret_value(scope, operand, field))
        .collect()
}

// ─── Loops ────────────────────────────────────────────────────

/// Resolve a loop range literal or reference to an iterable.
pub fn interpret_range(scope: &Scope, range: &serde_json::Value) -> Result<LoopRange, CallError> {
    match interpret_value(scope, range, "range")? {
        Value::Array(items) => Ok(LoopRange::Array(items)),
        Value::Object(map) => Ok(LoopRange::Object(map)),
        other => Err(CallError::interpretation(
            "range",
            format!("expected array or object, got {}", other.kind()),
        )),
    }
}

// ─── Calls ────────────────────────────────────────────────────

/// Interpret `spec` against `scope`.
///
/// `scratch_dir` is where unbound container files/dirs get host paths.
pub fn interpret_call(
    scope: &Scope,
    spec: &CallSpec,
    lineage: Lineage,
    op_ref: &str,
    scratch_dir: &Path,
) -> Result<Call, CallError> {
    let if_ = spec
        .if_
        .as_deref()
        .map(|predicates| evaluate_predicates(scope, predicates, "if"))
        .transpose()?;

    let variant = spec.variant()?;
    let kind = if if_ == Some(false) {
        skipped_kind(variant, lineage, op_ref)
    } else {
        interpret_kind(scope, variant, lineage, op_ref, scratch_dir)?
    };

    Ok(Call {
        id: lineage.id,
        root_id: lineage.root_id,
        parent_id: lineage.parent_id,
        name: spec.name.clone(),
        needs: spec.needs.clone(),
        if_,
        kind,
    })
}

/// Payload for a call whose `if` is false: declared values, nothing resolved,
/// since a guard commonly protects references that are not in scope.
fn skipped_kind(variant: CallVariant<'_>, lineage: Lineage, op_ref: &str) -> CallKind {
    match variant {
        CallVariant::Container(container) => CallKind::Container(ContainerCall {
            container_id: lineage.id,
            op_ref: op_ref.to_string(),
            image: ContainerImage {
                reference: container.image.reference.clone(),
                pull_creds: None,
            },
            cmd: container.cmd.clone(),
            env_vars: BTreeMap::new(),
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
            sockets: BTreeMap::new(),
            work_dir: container.work_dir.clone(),
            name: container.name.clone(),
            bound_outputs: Scope::new(),
        }),
        CallVariant::Op(op) => CallKind::Op(OpCall {
            op_id: lineage.id,
            reference: op.reference.clone(),
            pull_creds: None,
        }),
        CallVariant::Parallel(_) => CallKind::Parallel,
        CallVariant::Serial(_) => CallKind::Serial,
        CallVariant::SerialLoop(_) => CallKind::SerialLoop(LoopCall::default()),
        CallVariant::ParallelLoop(_) => CallKind::ParallelLoop(LoopCall::default()),
    }
}

fn interpret_kind(
    scope: &Scope,
    variant: CallVariant<'_>,
    lineage: Lineage,
    op_ref: &str,
    scratch_dir: &Path,
) -> Result<CallKind, CallError> {
    let kind = match variant {
        CallVariant::Container(container) => CallKind::Container(interpret_container(
            scope,
            container,
            lineage,
            op_ref,
            scratch_dir,
        )?),
        CallVariant::Op(op) => CallKind::Op(OpCall {
            op_id: lineage.id,
            reference: interpret_string(scope, &op.reference, "op.ref")?,
            pull_creds: op.pull_creds.as_ref().map(|c| c.to_creds()),
        }),
        CallVariant::Parallel(_) => CallKind::Parallel,
        CallVariant::Serial(_) => CallKind::Serial,
        CallVariant::SerialLoop(serial_loop) => CallKind::SerialLoop(LoopCall {
            range: serial_loop
                .range
                .as_ref()
                .map(|range| interpret_range(scope, range))
                .transpose()?,
        }),
        CallVariant::ParallelLoop(parallel_loop) => CallKind::ParallelLoop(LoopCall {
            range: Some(interpret_range(scope, &parallel_loop.range)?),
        }),
    };
    Ok(kind)
}

#[derive(Clone, Copy)]
enum MountKind {
    File,
    Dir,
}

impl MountKind {
    fn label(self) -> &'static str {
        match self {
            MountKind::File => "files",
            MountKind::Dir => "dirs",
        }
    }

    fn expected(self) -> &'static str {
        match self {
            MountKind::File => "file",
            MountKind::Dir => "dir",
        }
    }

    fn scratch_segment(self) -> &'static str {
        match self {
            MountKind::File => "fs",
            MountKind::Dir => "dirs",
        }
    }

    fn wrap(self, path: PathBuf) -> Value {
        match self {
            MountKind::File => Value::File(path),
            MountKind::Dir => Value::Dir(path),
        }
    }

    fn unwrap<'a>(self, value: &'a Value) -> Option<&'a PathBuf> {
        match (self, value) {
            (MountKind::File, Value::File(p)) | (MountKind::Dir, Value::Dir(p)) => Some(p),
            _ => None,
        }
    }
}

fn interpret_container(
    scope: &Scope,
    spec: &ContainerCallSpec,
    lineage: Lineage,
    op_ref: &str,
    scratch_dir: &Path,
) -> Result<ContainerCall, CallError> {
    let container_dir = scratch_dir.join(lineage.id.to_string());
    let mut bound_outputs = Scope::new();

    let cmd = spec
        .cmd
        .iter()
        .map(|arg| interpret_string(scope, arg, "cmd"))
        .collect::<Result<Vec<_>, _>>()?;

    let env_vars = spec
        .env_vars
        .iter()
        .map(|(name, literal)| {
            interpret_value(scope, literal, &format!("envVars.{name}"))
                .map(|v| (name.clone(), v.coerce_to_string()))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let files = interpret_mounts(
        scope,
        &spec.files,
        MountKind::File,
        &container_dir,
        &mut bound_outputs,
    )?;
    let dirs = interpret_mounts(
        scope,
        &spec.dirs,
        MountKind::Dir,
        &container_dir,
        &mut bound_outputs,
    )?;

    let sockets = spec
        .sockets
        .iter()
        .map(|(address, expr)| {
            let field = format!("sockets.{address}");
            match interpret_value(scope, &serde_json::Value::String(expr.clone()), &field)? {
                Value::Socket(s) | Value::String(s) => Ok((address.clone(), s)),
                other => Err(CallError::interpretation(
                    field,
                    format!("expected socket, got {}", other.kind()),
                )),
            }
        })
        .collect::<Result<BTreeMap<_, _>, CallError>>()?;

    Ok(ContainerCall {
        container_id: lineage.id,
        op_ref: op_ref.to_string(),
        image: ContainerImage {
            reference: interpret_string(scope, &spec.image.reference, "image.ref")?,
            pull_creds: spec.image.pull_creds.as_ref().map(|c| c.to_creds()),
        },
        cmd,
        env_vars,
        files,
        dirs,
        sockets,
        work_dir: spec
            .work_dir
            .as_deref()
            .map(|w| interpret_string(scope, w, "workDir"))
            .transpose()?,
        name: spec
            .name
            .as_deref()
            .map(|n| interpret_string(scope, n, "name"))
            .transpose()?,
        bound_outputs,
    })
}

fn interpret_mounts(
    scope: &Scope,
    mounts: &BTreeMap<String, Option<String>>,
    kind: MountKind,
    container_dir: &Path,
    bound_outputs: &mut Scope,
) -> Result<BTreeMap<String, PathBuf>, CallError> {
    let mut resolved = BTreeMap::new();
    for (container_path, binding) in mounts {
        let field = format!("{}.{container_path}", kind.label());
        let scratch = || {
            container_dir
                .join(kind.scratch_segment())
                .join(container_path.trim_start_matches('/'))
        };

        let host_path = match binding.as_deref().filter(|b| !b.is_empty()) {
            None => scratch(),
            Some(expr) => match bare_reference(expr) {
                Some(path) => match lookup(scope, path) {
                    Some(value) => kind.unwrap(&value).cloned().ok_or_else(|| {
                        CallError::interpretation(
                            &field,
                            format!("$({path}) is {}, expected {}", value.kind(), kind.expected()),
                        )
                    })?,
                    None if !path.contains('.') => {
                        let host_path = scratch();
                        bound_outputs.insert(path.to_string(), kind.wrap(host_path.clone()));
                        host_path
                    }
                    None => {
                        return Err(CallError::interpretation(
                            &field,
                            format!("unable to resolve $({path}): not in scope"),
                        ))
                    }
                },
                None => PathBuf::from(interpret_string(scope, expr, &field)?),
            },
        };
        resolved.insert(container_path.clone(), host_path);
    }
    Ok(resolved)
}
