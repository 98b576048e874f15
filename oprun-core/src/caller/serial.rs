use std::sync::Arc;

use super::{CallContext, Caller};
use crate::error::CallError;
use crate::spec::CallSpec;
use crate::types::{Lineage, Scope};

impl Caller {
    /// Run `children` in order over one scope. Stops at the first error or
    /// once `ctx` is cancelled; later children are never started.
    pub(super) async fn call_serial(
        self: &Arc<Self>,
        ctx: &CallContext,
        lineage: Lineage,
        inbound: Scope,
        children: &[CallSpec],
        op_ref: &str,
    ) -> Result<Scope, CallError> {
        let mut scope = inbound;
        for child in children {
            if ctx.token.is_cancelled() {
                break;
            }
            let outputs = self
                .call(ctx, lineage.child(), scope.clone(), Some(child), op_ref)
                .await?;
            scope.extend(outputs);
        }
        Ok(scope)
    }
}
