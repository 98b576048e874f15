//! Call Dispatcher
//!
//! Single entry point for executing a [`CallSpec`] node. Interprets the node
//! against the inbound scope, publishes its lifecycle events and routes to the
//! variant caller. Variant callers recurse back through [`Caller::call`].
//!
//! Every call that publishes `CallStarted` publishes exactly one `CallEnded`:
//! on return through the normal path, and from [`CallEndedGuard`] when the
//! call's future is dropped before finishing.

mod container;
mod op;
mod parallel;
mod parallel_loop;
mod serial;
mod serial_loop;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthStore;
use crate::data::DataResolver;
use crate::error::CallError;
use crate::events::{
    CallEnded, CallEndedError, CallSkipped, CallStarted, EventPayload, EventSink, Outcome,
};
use crate::interpreter::interpret_call;
use crate::runtime::ContainerRuntime;
use crate::spec::{CallSpec, CallVariant};
use crate::types::{Call, CallKind, Lineage, Scope};

pub(crate) use op::bind_params;

/// Error text recorded on calls that end because their context was cancelled.
pub const KILLED_MESSAGE: &str = "call killed";

/// Cancellation scope and event destination shared down a call subtree.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub token: CancellationToken,
    pub events: EventSink,
}

impl CallContext {
    pub fn new(token: CancellationToken, events: EventSink) -> Self {
        Self { token, events }
    }

    /// Same sink, cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        self.with_token(self.token.child_token())
    }

    fn with_token(&self, token: CancellationToken) -> Self {
        Self {
            token,
            events: self.events.clone(),
        }
    }
}

pub struct Caller {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<DataResolver>,
    auths: Arc<AuthStore>,
    scratch_dir: PathBuf,
    max_line_bytes: usize,
}

impl Caller {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<DataResolver>,
        auths: Arc<AuthStore>,
        scratch_dir: PathBuf,
        max_line_bytes: usize,
    ) -> Self {
        Self {
            runtime,
            resolver,
            auths,
            scratch_dir,
            max_line_bytes,
        }
    }

    /// Execute `spec` with `lineage` against `scope`, returning its outputs.
    ///
    /// Returns without publishing anything when `spec` is `None`, when `ctx`
    /// is already cancelled, or when interpretation fails. A call whose
    /// context is cancelled while running ends `Killed` and returns empty
    /// outputs rather than an error.
    pub fn call<'a>(
        self: &'a Arc<Self>,
        ctx: &'a CallContext,
        lineage: Lineage,
        scope: Scope,
        spec: Option<&'a CallSpec>,
        op_ref: &'a str,
    ) -> BoxFuture<'a, Result<Scope, CallError>> {
        async move {
            let Some(spec) = spec else {
                return Ok(Scope::new());
            };
            if ctx.token.is_cancelled() {
                return Ok(Scope::new());
            }

            let call = interpret_call(&scope, spec, lineage, op_ref, &self.scratch_dir)?;
            if call.is_skipped() {
                tracing::debug!(call_id = %call.id, op_ref, "Call skipped");
                ctx.events
                    .emit(EventPayload::CallSkipped(CallSkipped {
                        call,
                        op_ref: op_ref.to_string(),
                    }))
                    .await;
                return Ok(Scope::new());
            }
            let variant = spec.variant()?;

            let guard = CallEndedGuard::new(ctx.events.clone(), call.clone(), op_ref);
            ctx.events
                .emit(EventPayload::CallStarted(CallStarted {
                    call: call.clone(),
                    op_ref: op_ref.to_string(),
                }))
                .await;
            tracing::debug!(
                call_id = %call.id,
                root_call_id = %call.root_id,
                kind = call.kind.as_str(),
                op_ref,
                "Call started"
            );

            let call_ctx = ctx.child();
            let _cancel_on_exit = call_ctx.token.clone().drop_guard();
            let running = self.run_variant(&call_ctx, &call, variant, scope, op_ref);
            let result = AssertUnwindSafe(running)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(CallError::Panicked(panic_message(panic.as_ref()))));

            let (outcome, error, returned) = if ctx.token.is_cancelled() {
                (Outcome::Killed, Some(KILLED_MESSAGE.to_string()), Ok(Scope::new()))
            } else {
                match result {
                    Ok(outputs) => (Outcome::Succeeded, None, Ok(outputs)),
                    Err(err) => (Outcome::Failed, Some(err.to_string()), Err(err)),
                }
            };

            match &error {
                Some(message) => tracing::info!(
                    call_id = %call.id,
                    outcome = %outcome,
                    error = %message,
                    "Call ended"
                ),
                None => tracing::info!(call_id = %call.id, outcome = %outcome, "Call ended"),
            }

            let outputs = returned.as_ref().ok().cloned().unwrap_or_default();
            guard.finish(outcome, error, outputs).await;
            returned
        }
        .boxed()
    }

    async fn run_variant(
        self: &Arc<Self>,
        ctx: &CallContext,
        call: &Call,
        variant: CallVariant<'_>,
        scope: Scope,
        op_ref: &str,
    ) -> Result<Scope, CallError> {
        let lineage = call.lineage();
        match (variant, &call.kind) {
            (CallVariant::Container(_), CallKind::Container(container)) => {
                self.call_container(ctx, container, call.root_id).await
            }
            (CallVariant::Op(spec), CallKind::Op(op)) => {
                self.call_op(ctx, lineage, op, spec, scope, op_ref).await
            }
            (CallVariant::Parallel(children), CallKind::Parallel) => {
                self.call_parallel(ctx, lineage, scope, children, op_ref).await
            }
            (CallVariant::Serial(children), CallKind::Serial) => {
                self.call_serial(ctx, lineage, scope, children, op_ref).await
            }
            (CallVariant::SerialLoop(spec), CallKind::SerialLoop(header)) => {
                self.call_serial_loop(ctx, lineage, scope, spec, header, op_ref)
                    .await
            }
            (CallVariant::ParallelLoop(spec), CallKind::ParallelLoop(header)) => {
                self.call_parallel_loop(ctx, lineage, scope, spec, header, op_ref)
                    .await
            }
            (_, kind) => Err(CallError::InvalidCallGraph(format!(
                "interpreted {} call does not match its declaration",
                kind.as_str()
            ))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─── CallEnded finalizer ──────────────────────────────────────

/// Publishes the call's `CallEnded`. Dropping it unfinished publishes
/// `Killed` from a detached send.
struct CallEndedGuard {
    events: EventSink,
    call: Option<Call>,
    op_ref: String,
}

impl CallEndedGuard {
    fn new(events: EventSink, call: Call, op_ref: &str) -> Self {
        Self {
            events,
            call: Some(call),
            op_ref: op_ref.to_string(),
        }
    }

    fn ended(
        &self,
        call: Call,
        outcome: Outcome,
        error: Option<String>,
        outputs: Scope,
    ) -> EventPayload {
        EventPayload::CallEnded(CallEnded {
            call,
            op_ref: self.op_ref.clone(),
            outcome,
            error: error.map(|message| CallEndedError { message }),
            outputs,
        })
    }

    async fn finish(mut self, outcome: Outcome, error: Option<String>, outputs: Scope) {
        if let Some(call) = self.call.take() {
            let payload = self.ended(call, outcome, error, outputs);
            self.events.emit(payload).await;
        }
    }
}

impl Drop for CallEndedGuard {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            tracing::warn!(call_id = %call.id, "Call dropped before ending");
            let payload = self.ended(
                call,
                Outcome::Killed,
                Some("call dropped before completion".to_string()),
                Scope::new(),
            );
            self.events.emit_detached(payload);
        }
    }
}
