//! Concurrent composition with needs-based pruning.
//!
//! All coordination state (needed-by counters, per-child tokens, recorded
//! outputs) is owned by the coordinating task. Children only report results
//! over a channel.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CallContext, Caller};
use crate::error::CallError;
use crate::interpreter::ref_to_name;
use crate::spec::CallSpec;
use crate::types::{Lineage, Scope};

/// One concurrently dispatched child.
pub(super) struct Branch {
    pub lineage: Lineage,
    pub scope: Scope,
    pub spec: CallSpec,
}

struct Report {
    index: usize,
    result: Result<Scope, CallError>,
}

impl Caller {
    pub(super) async fn call_parallel(
        self: &Arc<Self>,
        ctx: &CallContext,
        lineage: Lineage,
        inbound: Scope,
        children: &[CallSpec],
        op_ref: &str,
    ) -> Result<Scope, CallError> {
        let branches = children
            .iter()
            .map(|child| Branch {
                lineage: lineage.child(),
                scope: inbound.clone(),
                spec: child.clone(),
            })
            .collect();

        let outputs = self.fan_out(ctx, branches, true, op_ref).await?;

        let mut outbound = inbound;
        for child_outputs in outputs {
            outbound.extend(child_outputs);
        }
        Ok(outbound)
    }

    /// Run `branches` concurrently and return each one's outputs in branch
    /// order.
    ///
    /// The first branch error cancels the rest and is returned once every
    /// branch task has finished. With `prune_needs`, a named branch is
    /// cancelled as soon as every sibling that needs it has succeeded or been
    /// pruned itself, and is recorded with empty outputs.
    pub(super) async fn fan_out(
        self: &Arc<Self>,
        ctx: &CallContext,
        branches: Vec<Branch>,
        prune_needs: bool,
        op_ref: &str,
    ) -> Result<Vec<Scope>, CallError> {
        let count = branches.len();
        let group = ctx.token.child_token();

        let mut needed_by: HashMap<String, usize> = HashMap::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        let mut needs: Vec<Vec<String>> = Vec::with_capacity(count);
        let mut tokens: Vec<CancellationToken> = Vec::with_capacity(count);

        for (index, branch) in branches.iter().enumerate() {
            let named = prune_needs.then_some(branch.spec.name.as_ref()).flatten();
            match named {
                Some(name) => {
                    by_name.insert(name.clone(), index);
                    tokens.push(group.child_token());
                }
                None => tokens.push(group.clone()),
            }

            let branch_needs: Vec<String> = if prune_needs {
                branch
                    .spec
                    .needs
                    .iter()
                    .map(|n| ref_to_name(n).to_string())
                    .collect()
            } else {
                Vec::new()
            };
            for name in &branch_needs {
                *needed_by.entry(name.clone()).or_default() += 1;
            }
            needs.push(branch_needs);
        }

        let (tx, mut rx) = mpsc::channel::<Report>(count.max(1));
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(count);
        for (index, branch) in branches.into_iter().enumerate() {
            let caller = Arc::clone(self);
            let branch_ctx = ctx.with_token(tokens[index].clone());
            let op_ref = op_ref.to_string();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let result = caller
                    .call(
                        &branch_ctx,
                        branch.lineage,
                        branch.scope,
                        Some(&branch.spec),
                        &op_ref,
                    )
                    .await;
                // The coordinator stops listening once it has an answer.
                let _ = tx.send(Report { index, result }).await;
            }));
        }
        drop(tx);

        let mut recorded: Vec<Option<Scope>> = vec![None; count];
        let mut remaining = count;
        while remaining > 0 {
            let Some(report) = rx.recv().await else {
                group.cancel();
                drain(handles).await;
                return Err(CallError::Panicked(
                    "parallel child exited without reporting".to_string(),
                ));
            };
            if recorded[report.index].is_some() {
                // Already pruned.
                continue;
            }

            let outputs = match report.result {
                Ok(outputs) => outputs,
                Err(err) => {
                    group.cancel();
                    drain(handles).await;
                    return Err(err);
                }
            };
            recorded[report.index] = Some(outputs);
            remaining -= 1;

            // A pruned branch releases its own needs too, so chains unwind.
            let mut settled = vec![report.index];
            while let Some(index) = settled.pop() {
                for name in &needs[index] {
                    let Some(counter) = needed_by.get_mut(name) else {
                        continue;
                    };
                    *counter = counter.saturating_sub(1);
                    if *counter > 0 {
                        continue;
                    }
                    let Some(&needed) = by_name.get(name) else {
                        continue;
                    };
                    if recorded[needed].is_none() {
                        tracing::debug!(name = %name, "Cancelling call no longer needed");
                        tokens[needed].cancel();
                        recorded[needed] = Some(Scope::new());
                        remaining -= 1;
                        settled.push(needed);
                    }
                }
            }
        }

        drain(handles).await;
        Ok(recorded.into_iter().map(Option::unwrap_or_default).collect())
    }
}

/// Wait for every branch task so none outlives its parent call.
async fn drain(handles: Vec<JoinHandle<()>>) {
    for joined in join_all(handles).await {
        if let Err(err) = joined {
            tracing::warn!(error = %err, "Parallel branch task failed");
        }
    }
}
