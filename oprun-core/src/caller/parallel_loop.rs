use std::sync::Arc;

use super::parallel::Branch;
use super::serial_loop::bind_loop_vars;
use super::{CallContext, Caller};
use crate::error::CallError;
use crate::interpreter::evaluate_predicates;
use crate::spec::ParallelLoopCallSpec;
use crate::types::{Lineage, LoopCall, Scope};

impl Caller {
    /// Run one body per range item concurrently. `until` truncates the range
    /// at the first item for which it holds. Outputs merge in item order.
    pub(super) async fn call_parallel_loop(
        self: &Arc<Self>,
        ctx: &CallContext,
        lineage: Lineage,
        inbound: Scope,
        spec: &ParallelLoopCallSpec,
        header: &LoopCall,
        op_ref: &str,
    ) -> Result<Scope, CallError> {
        let range = header.range.as_ref().ok_or_else(|| {
            CallError::InvalidCallGraph("parallelLoop requires a range".to_string())
        })?;

        let mut branches = Vec::with_capacity(range.len());
        for index in 0..range.len() {
            let mut scope = inbound.clone();
            bind_loop_vars(&mut scope, spec.vars.as_ref(), Some(range), index);
            if let Some(until) = &spec.until {
                if evaluate_predicates(&scope, until, "parallelLoop.until")? {
                    break;
                }
            }
            branches.push(Branch {
                lineage: lineage.child(),
                scope,
                spec: (*spec.run).clone(),
            });
        }

        tracing::debug!(
            call_id = %lineage.id,
            iterations = branches.len(),
            "Parallel loop fan-out"
        );
        let outputs = self.fan_out(ctx, branches, false, op_ref).await?;

        let mut outbound = inbound;
        for iteration_outputs in outputs {
            outbound.extend(iteration_outputs);
        }
        Ok(outbound)
    }
}
