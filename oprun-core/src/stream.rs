//! Container Output Adapters
//!
//! Turns raw byte writes from a container runtime into
//! `ContainerStdOutWrittenTo` / `ContainerStdErrWrittenTo` events, one event
//! per line. A line longer than the configured maximum is emitted in
//! maximum-sized chunks, so output is delayed until a boundary but never lost.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use crate::events::{ContainerOutput, EventPayload, EventSink};
use crate::types::{CallId, ContainerCall};

/// Longest line emitted as a single event.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4_000_000;

/// In-memory pipe capacity between the runtime and the line reader.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    StdOut,
    StdErr,
}

impl StreamKind {
    fn label(self) -> &'static str {
        match self {
            StreamKind::StdOut => "stdout",
            StreamKind::StdErr => "stderr",
        }
    }
}

/// Identity stamped on every output event of one container.
#[derive(Clone, Debug)]
pub struct StreamOrigin {
    pub image_ref: String,
    pub container_id: CallId,
    pub root_call_id: CallId,
    pub op_ref: String,
}

impl StreamOrigin {
    pub fn for_container(call: &ContainerCall, root_call_id: CallId) -> Self {
        Self {
            image_ref: call.image.reference.clone(),
            container_id: call.container_id,
            root_call_id,
            op_ref: call.op_ref.clone(),
        }
    }
}

/// Spawn a line forwarder. Write into the returned pipe; the task finishes
/// after the write half is dropped and every buffered line is published.
pub fn spawn_line_forwarder(
    events: EventSink,
    kind: StreamKind,
    origin: StreamOrigin,
    max_line_bytes: usize,
) -> (DuplexStream, JoinHandle<()>) {
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let task = tokio::spawn(forward_lines(reader, events, kind, origin, max_line_bytes));
    (writer, task)
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    events: EventSink,
    kind: StreamKind,
    origin: StreamOrigin,
    max_line_bytes: usize,
) {
    let max_line_bytes = max_line_bytes.max(1);
    let mut reader = BufReader::with_capacity(PIPE_CAPACITY, reader);
    let mut line: Vec<u8> = Vec::new();

    loop {
        let buf = match reader.fill_buf().await {
            Ok(buf) => buf,
            Err(err) => {
                tracing::warn!(
                    container_id = %origin.container_id,
                    stream = kind.label(),
                    error = %err,
                    "Container output stream failed"
                );
                break;
            }
        };
        if buf.is_empty() {
            break;
        }

        let room = max_line_bytes - line.len();
        let window = &buf[..buf.len().min(room)];
        let (taken, complete) = match window.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (window.len(), line.len() + window.len() >= max_line_bytes),
        };
        line.extend_from_slice(&window[..taken]);
        reader.consume(taken);

        if complete {
            publish(&events, kind, &origin, std::mem::take(&mut line)).await;
        }
    }

    // Publish whatever is left, even after a read error.
    if !line.is_empty() {
        publish(&events, kind, &origin, line).await;
    }
}

async fn publish(events: &EventSink, kind: StreamKind, origin: &StreamOrigin, data: Vec<u8>) {
    let output = ContainerOutput {
        image_ref: origin.image_ref.clone(),
        data,
        root_call_id: origin.root_call_id,
        container_id: origin.container_id,
        op_ref: origin.op_ref.clone(),
    };
    let payload = match kind {
        StreamKind::StdOut => EventPayload::ContainerStdOutWrittenTo(output),
        StreamKind::StdErr => EventPayload::ContainerStdErrWrittenTo(output),
    };
    events.emit(payload).await;
}
