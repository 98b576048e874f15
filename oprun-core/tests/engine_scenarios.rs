//! End-to-end runs through the Node facade against a scripted container
//! runtime and in-memory ops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use oprun_core::events::{CallEnded, CallStarted};
use oprun_core::{
    AddAuthReq, CallError, CallId, CallKind, ContainerRuntime, Creds, DataError, Event,
    EventPayload, EventSink, MemoryProvider, Node, NodeConfig, OpSpec, Outcome, OutputWriter,
    Scope, StartOpReq, StartOpReqOp, Value,
};
use oprun_core::types::ContainerCall;

// ─── Harness ──────────────────────────────────────────────────

/// Behaviour keyed by image ref:
/// `fail` exits 1, `error` fails in the runtime, `block` waits for
/// cancellation, `echo` writes its cmd to stdout, anything else exits 0.
#[derive(Default)]
struct FakeRuntime {
    deleted: Mutex<Vec<CallId>>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run_container(
        &self,
        cancel: CancellationToken,
        call: &ContainerCall,
        _root_call_id: CallId,
        _events: &EventSink,
        mut stdout: OutputWriter,
        mut stderr: OutputWriter,
    ) -> anyhow::Result<Option<i64>> {
        match call.image.reference.as_str() {
            "fail" => {
                stderr.write_all(b"boom\n").await?;
                Ok(Some(1))
            }
            "error" => Err(anyhow::anyhow!("image pull failed")),
            "block" => {
                cancel.cancelled().await;
                Ok(None)
            }
            "echo" => {
                let line = format!("{}\n", call.cmd.join(" "));
                stdout.write_all(line.as_bytes()).await?;
                Ok(Some(0))
            }
            _ => Ok(Some(0)),
        }
    }

    async fn delete_container_if_exists(&self, container_id: CallId) -> anyhow::Result<()> {
        self.deleted.lock().unwrap().push(container_id);
        Ok(())
    }
}

struct Harness {
    node: Node,
    ops: Arc<MemoryProvider>,
    runtime: Arc<FakeRuntime>,
    dir: tempfile::TempDir,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness() -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = NodeConfig {
        data_dir: dir.path().to_path_buf(),
        op_search_paths: vec![],
        ..Default::default()
    };
    let ops = Arc::new(MemoryProvider::new());
    let runtime = Arc::new(FakeRuntime::default());
    let node = Node::new(config, runtime.clone(), vec![ops.clone()]);
    Harness {
        node,
        ops,
        runtime,
        dir,
    }
}

impl Harness {
    fn op(&self, reference: &str, yaml: &str) {
        self.ops.register(reference, OpSpec::from_yaml(yaml).unwrap());
    }

    async fn run(&self, reference: &str, args: Scope) -> (Result<Scope, CallError>, Vec<Event>) {
        let started = self.node.start_op(request(reference, args)).await.unwrap();
        let mut stream = started.events;
        let result = started.completion.wait().await;

        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        assert_well_formed(&events, started.root_call_id);
        (result, events)
    }
}

fn request(reference: &str, args: Scope) -> StartOpReq {
    StartOpReq {
        args,
        op: StartOpReqOp {
            reference: reference.to_string(),
            pull_creds: None,
        },
    }
}

// ─── Event helpers ────────────────────────────────────────────

fn started(events: &[Event]) -> Vec<&CallStarted> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::CallStarted(s) => Some(s),
            _ => None,
        })
        .collect()
}

fn ended(events: &[Event]) -> Vec<&CallEnded> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::CallEnded(e) => Some(e),
            _ => None,
        })
        .collect()
}

fn image_of(kind: &CallKind) -> Option<&str> {
    match kind {
        CallKind::Container(c) => Some(c.image.reference.as_str()),
        _ => None,
    }
}

fn container_ends<'a>(events: &'a [Event], image: &str) -> Vec<&'a CallEnded> {
    ended(events)
        .into_iter()
        .filter(|e| image_of(&e.call.kind) == Some(image))
        .collect()
}

/// Every started call ends exactly once, after it started and after all of
/// its children ended; every call belongs to the run's root.
fn assert_well_formed(events: &[Event], root_call_id: CallId) {
    let mut started_at: HashMap<CallId, usize> = HashMap::new();
    let mut ended_at: HashMap<CallId, usize> = HashMap::new();
    let mut parents: HashMap<CallId, Option<CallId>> = HashMap::new();

    for (i, event) in events.iter().enumerate() {
        match &event.payload {
            EventPayload::CallStarted(s) => {
                assert_eq!(s.call.root_id, root_call_id);
                assert!(started_at.insert(s.call.id, i).is_none(), "started twice");
                parents.insert(s.call.id, s.call.parent_id);
            }
            EventPayload::CallEnded(e) => {
                assert!(started_at.contains_key(&e.call.id), "ended before started");
                assert!(ended_at.insert(e.call.id, i).is_none(), "ended twice");
            }
            EventPayload::CallSkipped(s) => {
                assert!(!started_at.contains_key(&s.call.id));
            }
            _ => {}
        }
    }

    assert_eq!(
        started_at.keys().collect::<std::collections::HashSet<_>>(),
        ended_at.keys().collect::<std::collections::HashSet<_>>(),
        "every started call ends"
    );
    for (id, parent) in &parents {
        match parent {
            None => assert_eq!(*id, root_call_id),
            Some(parent) => {
                assert!(started_at[parent] < started_at[id]);
                assert!(ended_at[parent] > ended_at[id]);
            }
        }
    }
}

fn file_output(scope: &Scope, name: &str) -> std::path::PathBuf {
    match scope.get(name) {
        Some(Value::File(path)) => path.clone(),
        other => panic!("expected file output {name}, got {other:?}"),
    }
}

// ─── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn test_parallel_containers_all_succeed() {
    let h = harness();
    h.op(
        "ops/fanout",
        r#"
outputs:
  a: {type: file}
  b: {type: file}
  c: {type: file}
run:
  parallel:
    - container:
        image: {ref: ok}
        files:
          /out: $(a)
    - container:
        image: {ref: ok}
        files:
          /out: $(b)
    - container:
        image: {ref: ok}
        files:
          /out: $(c)
"#,
    );

    let (result, events) = h.run("ops/fanout", Scope::new()).await;
    let outputs = result.unwrap();
    assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);

    let containers = container_ends(&events, "ok");
    assert_eq!(containers.len(), 3);
    assert!(containers.iter().all(|e| e.outcome == Outcome::Succeeded));
    // op, parallel, three containers
    assert_eq!(started(&events).len(), 5);
    assert_eq!(h.runtime.deleted.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_serial_stops_at_first_failure() {
    let h = harness();
    h.op(
        "ops/serial",
        r#"
run:
  serial:
    - container: {image: {ref: ok}}
    - container: {image: {ref: fail}}
    - container: {image: {ref: never}}
"#,
    );

    let (result, events) = h.run("ops/serial", Scope::new()).await;
    assert_eq!(
        result.unwrap_err().to_string(),
        "nonzero container exit code. Exit code was: 1"
    );
    assert!(started(&events)
        .iter()
        .all(|s| image_of(&s.call.kind) != Some("never")));

    let failed = container_ends(&events, "fail");
    assert_eq!(failed[0].outcome, Outcome::Failed);
    let root = ended(&events).pop().unwrap();
    assert_eq!(root.outcome, Outcome::Failed);
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::ContainerStdErrWrittenTo(out) if out.data == b"boom\n"
    )));
}

#[tokio::test]
async fn test_failed_dependency_cancels_dependent() {
    let h = harness();
    h.op(
        "ops/needs-fail",
        r#"
run:
  parallel:
    - name: a
      needs: [$(b)]
      container:
        image: {ref: block}
        files:
          /out: $(fromA)
    - name: b
      container: {image: {ref: fail}}
"#,
    );

    let (result, events) = h.run("ops/needs-fail", Scope::new()).await;
    assert!(matches!(result, Err(CallError::NonZeroExit(1))));

    let a = container_ends(&events, "block");
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].outcome, Outcome::Killed);
    assert!(a[0].outputs.is_empty());
}

#[tokio::test]
async fn test_needed_call_pruned_once_dependents_finish() {
    let h = harness();
    h.op(
        "ops/sidecar",
        r#"
outputs:
  report: {type: file}
run:
  parallel:
    - name: db
      container: {image: {ref: block}}
    - needs: [db]
      container:
        image: {ref: ok}
        files:
          /report: $(report)
"#,
    );

    let (result, events) = h.run("ops/sidecar", Scope::new()).await;
    let outputs = result.unwrap();
    file_output(&outputs, "report");

    assert_eq!(container_ends(&events, "block")[0].outcome, Outcome::Killed);
    assert_eq!(container_ends(&events, "ok")[0].outcome, Outcome::Succeeded);
    assert_eq!(ended(&events).pop().unwrap().outcome, Outcome::Succeeded);
}

#[tokio::test]
async fn test_pruning_cascades_through_chained_needs() {
    let h = harness();
    h.op(
        "ops/chain",
        r#"
outputs:
  report: {type: file}
run:
  parallel:
    - name: store
      container: {image: {ref: block}}
    - name: cache
      needs: [$(store)]
      container: {image: {ref: block}}
    - needs: [$(cache)]
      container:
        image: {ref: ok}
        files:
          /report: $(report)
"#,
    );

    let run = h.run("ops/chain", Scope::new());
    let (result, events) = tokio::time::timeout(std::time::Duration::from_secs(5), run)
        .await
        .expect("chained needs unwound");
    file_output(&result.unwrap(), "report");

    let blocked = container_ends(&events, "block");
    assert_eq!(blocked.len(), 2);
    assert!(blocked.iter().all(|e| e.outcome == Outcome::Killed));
    assert_eq!(container_ends(&events, "ok")[0].outcome, Outcome::Succeeded);
    assert_eq!(ended(&events).pop().unwrap().outcome, Outcome::Succeeded);
}

#[tokio::test]
async fn test_failed_parallel_loop_iteration_cancels_siblings() {
    let h = harness();
    h.op(
        "ops/fan",
        r#"
run:
  parallelLoop:
    range: [block, fail, block]
    vars:
      value: image
    run:
      container: {image: {ref: $(image)}}
"#,
    );

    let (result, events) = h.run("ops/fan", Scope::new()).await;
    assert!(matches!(result, Err(CallError::NonZeroExit(1))));

    let blocked = container_ends(&events, "block");
    assert!(!blocked.is_empty());
    assert!(blocked.iter().all(|e| e.outcome == Outcome::Killed));
    assert_eq!(container_ends(&events, "fail")[0].outcome, Outcome::Failed);
    let ends = ended(&events);
    assert_eq!(ends.last().unwrap().outcome, Outcome::Failed);
}

#[tokio::test]
async fn test_loops_without_iterations_run_nothing() {
    let h = harness();
    h.op(
        "ops/empty-loops",
        r#"
run:
  serial:
    - serialLoop:
        range: []
        run:
          container: {image: {ref: fail}}
    - serialLoop:
        until:
          - eq: [1, 1]
        run:
          container: {image: {ref: fail}}
    - parallelLoop:
        range: {}
        run:
          container: {image: {ref: fail}}
"#,
    );

    let (result, events) = h.run("ops/empty-loops", Scope::new()).await;
    result.unwrap();
    assert!(started(&events)
        .iter()
        .all(|s| !matches!(s.call.kind, CallKind::Container(_))));
}

#[tokio::test]
async fn test_serial_loop_binds_vars_per_iteration() {
    let h = harness();
    h.op(
        "ops/loop",
        r#"
inputs:
  targets: {type: array}
run:
  serialLoop:
    range: $(targets)
    vars:
      index: i
      value: target
    run:
      container:
        image: {ref: echo}
        cmd: [deploy, $(i), $(target)]
"#,
    );

    let targets = Value::Array(vec![
        Value::String("eu".to_string()),
        Value::String("us".to_string()),
    ]);
    let (result, events) = h
        .run("ops/loop", Scope::from([("targets".to_string(), targets)]))
        .await;
    result.unwrap();

    let lines: Vec<&[u8]> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ContainerStdOutWrittenTo(out) => Some(out.data.as_slice()),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec![b"deploy 0 eu\n".as_slice(), b"deploy 1 us\n".as_slice()]);
}

#[tokio::test]
async fn test_later_parallel_child_wins_output_collision() {
    let h = harness();
    h.op(
        "ops/collide",
        r#"
outputs:
  shared: {type: file}
run:
  parallel:
    - container:
        image: {ref: first}
        files:
          /out: $(shared)
    - container:
        image: {ref: second}
        files:
          /out: $(shared)
"#,
    );

    let (result, events) = h.run("ops/collide", Scope::new()).await;
    let shared = file_output(&result.unwrap(), "shared");

    let second = container_ends(&events, "second")[0].call.id;
    let expected_root = h.dir.path().join("dcg").join(second.to_string());
    assert!(shared.starts_with(&expected_root), "{shared:?}");
}

#[tokio::test]
async fn test_kill_ends_running_calls_killed() {
    let h = harness();
    h.op(
        "ops/forever",
        r#"
run:
  parallel:
    - container: {image: {ref: block}}
    - serial:
        - container: {image: {ref: block}}
        - container: {image: {ref: never}}
"#,
    );

    let started_op = h.node.start_op(request("ops/forever", Scope::new())).await.unwrap();
    let root_call_id = started_op.root_call_id;
    let mut stream = started_op.events;

    let mut events = Vec::new();
    let mut blocked = 0;
    while blocked < 2 {
        let event = stream.recv().await.unwrap();
        if let EventPayload::CallStarted(s) = &event.payload {
            if image_of(&s.call.kind) == Some("block") {
                blocked += 1;
            }
        }
        events.push(event);
    }

    assert!(h.node.kill_op(root_call_id));
    let outputs = started_op.completion.wait().await.unwrap();
    assert!(outputs.is_empty());

    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    assert_well_formed(&events, root_call_id);

    let ends = ended(&events);
    // op, parallel, serial, two blocked containers
    assert_eq!(ends.len(), 5);
    assert!(ends.iter().all(|e| e.outcome == Outcome::Killed));
    assert!(!h.node.kill_op(root_call_id));
}

#[tokio::test]
async fn test_false_if_emits_only_skipped() {
    let h = harness();
    h.op(
        "ops/guarded",
        r#"
inputs:
  deploy: {type: boolean, default: false}
run:
  serial:
    - if:
        - eq: [$(deploy), true]
      container: {image: {ref: fail}}
    - container: {image: {ref: ok}}
"#,
    );

    let (result, events) = h.run("ops/guarded", Scope::new()).await;
    result.unwrap();

    let skipped: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::CallSkipped(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(image_of(&skipped[0].call.kind), Some("fail"));
    assert_eq!(skipped[0].call.if_, Some(false));
    assert!(container_ends(&events, "fail").is_empty());
    assert_eq!(container_ends(&events, "ok").len(), 1);
}

#[tokio::test]
async fn test_nested_op_binds_inputs_and_renames_outputs() {
    let h = harness();
    h.op(
        "ops/parent",
        r#"
inputs:
  who: {type: string}
outputs:
  greeting: {type: file}
run:
  op:
    ref: ./greet
    inputs:
      name: $(who)
    outputs:
      greeting: $(message)
"#,
    );
    h.op(
        "ops/parent/greet",
        r#"
inputs:
  name: {type: string}
  punctuation: {type: string, default: "!"}
outputs:
  message: {type: file}
run:
  container:
    image: {ref: echo}
    cmd: [hello, "$(name)$(punctuation)"]
    files:
      /out/message: $(message)
"#,
    );

    let args = Scope::from([("who".to_string(), Value::String("world".to_string()))]);
    let (result, events) = h.run("ops/parent", args).await;
    let outputs = result.unwrap();
    assert_eq!(outputs.len(), 1);
    assert!(file_output(&outputs, "greeting").is_file());

    let stdout = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::ContainerStdOutWrittenTo(out) => Some(out),
            _ => None,
        })
        .unwrap();
    assert_eq!(stdout.data, b"hello world!\n");
    assert_eq!(stdout.op_ref, "ops/parent/greet");

    // stdout precedes the container's CallEnded
    let stdout_at = events
        .iter()
        .position(|e| matches!(e.payload, EventPayload::ContainerStdOutWrittenTo(_)))
        .unwrap();
    let ended_at = events
        .iter()
        .position(|e| match &e.payload {
            EventPayload::CallEnded(c) => image_of(&c.call.kind) == Some("echo"),
            _ => false,
        })
        .unwrap();
    assert!(stdout_at < ended_at);
}

#[tokio::test]
async fn test_start_rejects_invalid_args() {
    let h = harness();
    h.op(
        "ops/strict",
        r#"
inputs:
  count: {type: number}
run:
  container: {image: {ref: ok}}
"#,
    );

    let err = h
        .node
        .start_op(request(
            "ops/strict",
            Scope::from([("extra".to_string(), Value::Boolean(true))]),
        ))
        .await
        .err()
        .unwrap();
    let message = err.to_string();
    assert!(message.starts_with("validation error(s):"));
    assert!(message.contains("count: required"));
    assert!(message.contains("extra: not a declared input"));
}

#[tokio::test]
async fn test_unknown_op_reports_every_provider() {
    let h = harness();
    let err = h
        .node
        .start_op(request("ops/nope", Scope::new()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CallError::Data(DataError::RefResolution(_))));
    assert!(err.to_string().starts_with("unable to resolve op \"ops/nope\":"));
}

#[tokio::test]
async fn test_runtime_error_passed_through() {
    let h = harness();
    h.op("ops/broken", "run:\n  container: {image: {ref: error}}\n");

    let (result, events) = h.run("ops/broken", Scope::new()).await;
    assert_eq!(result.unwrap_err().to_string(), "image pull failed");
    let broken = container_ends(&events, "error");
    assert_eq!(broken[0].error.as_ref().unwrap().message, "image pull failed");
}

#[tokio::test]
async fn test_protected_op_uses_registered_auth() {
    let h = harness();
    let creds = Creds {
        username: "ci".to_string(),
        password: "token".to_string(),
    };
    h.ops.register_protected(
        "registry.io/acme/secure",
        OpSpec::from_yaml("run:\n  container: {image: {ref: ok}}\n").unwrap(),
        creds.clone(),
    );

    let err = h
        .node
        .start_op(request("registry.io/acme/secure", Scope::new()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CallError::Data(DataError::Authentication)));

    h.node.add_auth(AddAuthReq {
        resources: "Registry.io/acme".to_string(),
        creds,
    });
    let (result, _) = h.run("registry.io/acme/secure", Scope::new()).await;
    result.unwrap();
}

#[tokio::test]
async fn test_shutdown_kills_runs() {
    let h = harness();
    h.op("ops/idle", "run:\n  container: {image: {ref: block}}\n");

    let started_op = h.node.start_op(request("ops/idle", Scope::new())).await.unwrap();
    let mut stream = started_op.events;
    loop {
        let event = stream.recv().await.unwrap();
        if let EventPayload::CallStarted(s) = &event.payload {
            if image_of(&s.call.kind).is_some() {
                break;
            }
        }
    }

    h.node.shutdown();
    started_op.completion.wait().await.unwrap();

    let mut rest = Vec::new();
    while let Some(event) = stream.recv().await {
        rest.push(event);
    }
    let root = ended(&rest).pop().unwrap();
    assert_eq!(root.call.id, started_op.root_call_id);
    assert_eq!(root.outcome, Outcome::Killed);
}
