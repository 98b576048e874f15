use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::events::EventSink;
use crate::types::{CallId, ContainerCall};

/// Byte sink a runtime copies a container's stdout or stderr into.
pub type OutputWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Contract for container backends (Docker, Kubernetes, fakes).
///
/// Image pulling/caching and process isolation belong to the implementation.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create, start and wait on a container.
    ///
    /// Returns the exit code when the container ran to completion. The
    /// implementation must stop the container once `cancel` fires, and must
    /// drop both writers before returning so their streams reach end-of-file.
    async fn run_container(
        &self,
        cancel: CancellationToken,
        call: &ContainerCall,
        root_call_id: CallId,
        events: &EventSink,
        stdout: OutputWriter,
        stderr: OutputWriter,
    ) -> Result<Option<i64>>;

    async fn delete_container_if_exists(&self, container_id: CallId) -> Result<()>;
}
