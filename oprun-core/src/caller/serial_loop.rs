use std::sync::Arc;

use super::{CallContext, Caller};
use crate::error::CallError;
use crate::interpreter::evaluate_predicates;
use crate::spec::{LoopVarsSpec, SerialLoopCallSpec};
use crate::types::{Lineage, LoopCall, LoopRange, Scope, Value};

/// Bind the loop variables of iteration `index` into `scope`.
///
/// Without a range only `index` is bound.
pub(super) fn bind_loop_vars(
    scope: &mut Scope,
    vars: Option<&LoopVarsSpec>,
    range: Option<&LoopRange>,
    index: usize,
) {
    let Some(vars) = vars else {
        return;
    };
    if let Some(name) = &vars.index {
        scope.insert(name.clone(), Value::Number(index as f64));
    }
    let Some((key, value)) = range.and_then(|r| r.item(index)) else {
        return;
    };
    if let Some(name) = &vars.key {
        scope.insert(name.clone(), key);
    }
    if let Some(name) = &vars.value {
        scope.insert(name.clone(), value);
    }
}

impl Caller {
    /// Run the body once per iteration until the range is exhausted or
    /// `until` holds. Each iteration sees the previous iterations' outputs.
    /// With neither, the loop runs until the body fails or is cancelled.
    pub(super) async fn call_serial_loop(
        self: &Arc<Self>,
        ctx: &CallContext,
        lineage: Lineage,
        inbound: Scope,
        spec: &SerialLoopCallSpec,
        header: &LoopCall,
        op_ref: &str,
    ) -> Result<Scope, CallError> {
        let mut scope = inbound;
        let mut index = 0;
        loop {
            if ctx.token.is_cancelled() {
                break;
            }
            if header.range.as_ref().is_some_and(|r| index >= r.len()) {
                break;
            }

            bind_loop_vars(&mut scope, spec.vars.as_ref(), header.range.as_ref(), index);
            if let Some(until) = &spec.until {
                if evaluate_predicates(&scope, until, "serialLoop.until")? {
                    break;
                }
            }

            let outputs = self
                .call(ctx, lineage.child(), scope.clone(), Some(&spec.run), op_ref)
                .await?;
            scope.extend(outputs);
            index += 1;
        }

        tracing::debug!(call_id = %lineage.id, iterations = index, "Serial loop finished");
        Ok(scope)
    }
}
