//! oprun-core: call execution engine for op call graphs
//!
//! Turns a static call tree (containers, nested ops, serial and parallel
//! blocks, loops) plus an initial scope into a running call graph, and
//! publishes an ordered lifecycle event stream describing it.
//!
//! ## Architecture
//!
//! ```text
//! Node::start_op ─▶ Caller::call (dispatcher) ─┬─▶ container ─▶ ContainerRuntime
//!                        ▲                     ├─▶ op ─▶ DataResolver ─▶ DataProvider
//!                        │                     ├─▶ serial / serialLoop
//!                        └──── recursion ──────┴─▶ parallel / parallelLoop
//!
//! every call ─▶ EventSink ─▶ EventStream (single consumer)
//! ```

pub mod auth;
pub mod caller;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod node;
pub mod runtime;
pub mod spec;
pub mod stream;
pub mod types;

pub use auth::{AddAuthReq, AuthStore};
pub use caller::{CallContext, Caller};
pub use config::NodeConfig;
pub use data::{DataHandle, DataProvider, DataResolver, FsProvider, MemoryProvider};
pub use error::{CallError, ConfigError, DataError};
pub use events::{Event, EventPayload, EventSink, EventStream, Outcome};
pub use node::{Node, RunHandle, StartOpReq, StartOpReqOp, StartedOp};
pub use runtime::{ContainerRuntime, OutputWriter};
pub use spec::{CallSpec, OpSpec};
pub use types::{Call, CallId, CallKind, Creds, Lineage, Scope, Value, ValueKind};
