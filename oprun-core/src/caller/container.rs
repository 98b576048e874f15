use std::borrow::Cow;
use std::panic::AssertUnwindSafe;
use std::path::Path;

use futures::FutureExt;

use super::{panic_message, CallContext, Caller};
use crate::error::CallError;
use crate::stream::{spawn_line_forwarder, StreamKind, StreamOrigin};
use crate::types::{CallId, ContainerCall, Scope};

impl Caller {
    /// Run one container and publish its output. Outputs are the scope
    /// entries bound to the container's scratch files and dirs.
    pub(super) async fn call_container(
        &self,
        ctx: &CallContext,
        container: &ContainerCall,
        root_call_id: CallId,
    ) -> Result<Scope, CallError> {
        self.prepare_scratch(container).await?;

        let stored_creds = match container.image.pull_creds {
            Some(_) => None,
            None => self.auths.try_get(&container.image.reference),
        };
        let call = match stored_creds {
            Some(creds) => {
                let mut with_creds = container.clone();
                with_creds.image.pull_creds = Some(creds);
                Cow::Owned(with_creds)
            }
            None => Cow::Borrowed(container),
        };

        let origin = StreamOrigin::for_container(container, root_call_id);
        let (stdout, stdout_task) = spawn_line_forwarder(
            ctx.events.clone(),
            StreamKind::StdOut,
            origin.clone(),
            self.max_line_bytes,
        );
        let (stderr, stderr_task) = spawn_line_forwarder(
            ctx.events.clone(),
            StreamKind::StdErr,
            origin,
            self.max_line_bytes,
        );

        let running = self.runtime.run_container(
            ctx.token.clone(),
            &call,
            root_call_id,
            &ctx.events,
            Box::new(stdout),
            Box::new(stderr),
        );
        // Caught here so a panicking runtime still lets the forwarders drain.
        let exit = AssertUnwindSafe(running).catch_unwind().await;

        // Output events must precede the call's CallEnded.
        for task in [stdout_task, stderr_task] {
            if let Err(err) = task.await {
                tracing::warn!(
                    container_id = %container.container_id,
                    error = %err,
                    "Output forwarder failed"
                );
            }
        }

        if let Err(err) = self
            .runtime
            .delete_container_if_exists(container.container_id)
            .await
        {
            tracing::warn!(
                container_id = %container.container_id,
                error = %err,
                "Failed to delete container"
            );
        }

        match exit {
            Err(panic) => Err(CallError::Panicked(panic_message(panic.as_ref()))),
            Ok(Err(err)) => Err(CallError::Runtime(format!("{err:#}"))),
            Ok(Ok(Some(code))) if code != 0 => Err(CallError::NonZeroExit(code)),
            Ok(Ok(_)) => Ok(container.bound_outputs.clone()),
        }
    }

    /// Create the host side of every scratch mount before the runtime binds it.
    async fn prepare_scratch(&self, container: &ContainerCall) -> Result<(), CallError> {
        let root = self.scratch_dir.join(container.container_id.to_string());
        let scratch_err = |path: &Path, err: std::io::Error| {
            CallError::Runtime(format!(
                "unable to create scratch path {}: {err}",
                path.display()
            ))
        };

        for path in container.dirs.values().filter(|p| p.starts_with(&root)) {
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| scratch_err(path.as_path(), e))?;
        }
        for path in container.files.values().filter(|p| p.starts_with(&root)) {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| scratch_err(parent, e))?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| scratch_err(path.as_path(), e))?;
        }
        Ok(())
    }
}
