//! Node facade
//!
//! Entry point for embedders: start an op run, kill it, register pull
//! credentials. Each run executes on its own task with its own event stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{AddAuthReq, AuthStore};
use crate::caller::{bind_params, CallContext, Caller};
use crate::config::NodeConfig;
use crate::data::{DataHandle, DataProvider, DataResolver, FsProvider};
use crate::error::CallError;
use crate::events::{EventSink, EventStream};
use crate::runtime::ContainerRuntime;
use crate::spec::{CallSpec, CredsSpec, OpCallSpec};
use crate::types::{new_call_id, CallId, Creds, Lineage, Scope};

// ─── Requests ─────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOpReq {
    /// Bound to the op's inputs by name.
    #[serde(default)]
    pub args: Scope,
    pub op: StartOpReqOp,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOpReqOp {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub pull_creds: Option<Creds>,
}

/// A run in progress.
pub struct StartedOp {
    pub root_call_id: CallId,
    /// Closes after the root call's `CallEnded`.
    pub events: EventStream,
    pub completion: RunHandle,
}

/// Resolves to the root op's outputs once the run finishes.
pub struct RunHandle {
    task: JoinHandle<Result<Scope, CallError>>,
}

impl RunHandle {
    /// A killed run completes with `Ok`.
    pub async fn wait(self) -> Result<Scope, CallError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(CallError::Panicked(err.to_string())),
        }
    }
}

// ─── Node ─────────────────────────────────────────────────────

pub struct Node {
    config: NodeConfig,
    caller: Arc<Caller>,
    resolver: Arc<DataResolver>,
    auths: Arc<AuthStore>,
    runs: Arc<Mutex<HashMap<CallId, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl Node {
    /// `providers` are consulted before the filesystem provider built from
    /// `config.op_search_paths`.
    pub fn new(
        config: NodeConfig,
        runtime: Arc<dyn ContainerRuntime>,
        providers: Vec<Arc<dyn DataProvider>>,
    ) -> Self {
        let auths = Arc::new(AuthStore::new());
        let mut providers = providers;
        providers.push(Arc::new(FsProvider::new(config.op_search_paths.clone())));
        let resolver = Arc::new(DataResolver::new(providers, auths.clone()));
        let caller = Arc::new(Caller::new(
            runtime,
            resolver.clone(),
            auths.clone(),
            config.scratch_dir(),
            config.max_line_bytes,
        ));

        tracing::info!(data_dir = %config.data_dir.display(), "Node initialized");

        Self {
            config,
            caller,
            resolver,
            auths,
            runs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn add_auth(&self, req: AddAuthReq) {
        self.auths.add(req);
    }

    pub async fn resolve_data(
        &self,
        data_ref: &str,
        pull_creds: Option<&Creds>,
    ) -> Result<Arc<dyn DataHandle>, CallError> {
        Ok(self.resolver.resolve(data_ref, pull_creds).await?)
    }

    /// Start a run of `req.op`.
    ///
    /// Resolution and argument validation fail here; everything after is
    /// reported on the returned event stream and completion.
    pub async fn start_op(&self, req: StartOpReq) -> Result<StartedOp, CallError> {
        let handle = self
            .resolver
            .resolve(&req.op.reference, req.op.pull_creds.as_ref())
            .await?;
        let op_spec = handle.op_spec().await?;

        let root = CallSpec::op(OpCallSpec {
            reference: handle.reference().to_string(),
            pull_creds: req.op.pull_creds.map(|c| CredsSpec {
                username: c.username,
                password: c.password,
            }),
            inputs: req.args.keys().map(|name| (name.clone(), None)).collect(),
            outputs: BTreeMap::new(),
        });
        if let Some(op) = &root.op {
            bind_params(&req.args, &op_spec, op)?;
        }

        let root_call_id = new_call_id();
        let (events, stream) = EventSink::channel(self.config.event_buffer);
        let token = self.shutdown.child_token();
        self.lock_runs().insert(root_call_id, token.clone());

        let op_ref = handle.reference().to_string();
        tracing::info!(root_call_id = %root_call_id, op_ref = %op_ref, "Op started");

        let caller = self.caller.clone();
        let runs = self.runs.clone();
        let args = req.args;
        let task = tokio::spawn(async move {
            let ctx = CallContext::new(token, events);
            let result = caller
                .call(&ctx, Lineage::root(root_call_id), args, Some(&root), &op_ref)
                .await;
            runs.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&root_call_id);

            match &result {
                Ok(_) => tracing::info!(root_call_id = %root_call_id, "Op finished"),
                Err(err) => {
                    tracing::warn!(root_call_id = %root_call_id, error = %err, "Op failed")
                }
            }
            result
        });

        Ok(StartedOp {
            root_call_id,
            events: stream,
            completion: RunHandle { task },
        })
    }

    /// Cancel a run. False when no such run is in progress.
    pub fn kill_op(&self, root_call_id: CallId) -> bool {
        match self.lock_runs().get(&root_call_id) {
            Some(token) => {
                tracing::info!(root_call_id = %root_call_id, "Killing op");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every run, including ones started afterwards.
    pub fn shutdown(&self) {
        tracing::info!("Node shutting down");
        self.shutdown.cancel();
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<CallId, CancellationToken>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
