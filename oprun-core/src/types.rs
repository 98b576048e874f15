use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ─── Identifiers ──────────────────────────────────────────────

/// Unique identifier of a call within a run.
pub type CallId = Uuid;

/// Generate a fresh call id.
pub fn new_call_id() -> CallId {
    Uuid::now_v7()
}

/// Where a call sits in the call graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lineage {
    pub id: CallId,
    pub parent_id: Option<CallId>,
    pub root_id: CallId,
}

impl Lineage {
    /// Lineage of a root call: its own root, no parent.
    pub fn root(id: CallId) -> Self {
        Self {
            id,
            parent_id: None,
            root_id: id,
        }
    }

    /// Lineage of a fresh child of `self`.
    pub fn child(&self) -> Self {
        Self {
            id: new_call_id(),
            parent_id: Some(self.id),
            root_id: self.root_id,
        }
    }
}

// ─── Value ────────────────────────────────────────────────────

/// A value bound to a variable. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    String(String),
    Number(f64),
    Boolean(bool),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// Host path of a file.
    File(PathBuf),
    /// Host path of a directory.
    Dir(PathBuf),
    /// Socket address (unix path or host:port).
    Socket(String),
}

/// Discriminant of a [`Value`], used for param type checks and messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    File,
    Dir,
    Socket,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::File => "file",
            Self::Dir => "dir",
            Self::Socket => "socket",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::Number(_) => ValueKind::Number,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::File(_) => ValueKind::File,
            Value::Dir(_) => ValueKind::Dir,
            Value::Socket(_) => ValueKind::Socket,
        }
    }

    /// Build a value from a literal in an op file. `null` has no value form.
    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Value::Boolean(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number),
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Value::from_json)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(k, v)| Value::from_json(v).map(|v| (k.clone(), v)))
                .collect::<Option<BTreeMap<_, _>>>()
                .map(Value::Object),
        }
    }

    /// JSON form used when an array/object is interpolated into a string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) | Value::Socket(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::File(p) | Value::Dir(p) => {
                serde_json::Value::String(p.to_string_lossy().into_owned())
            }
        }
    }

    /// String coercion used for interpolation, env vars and commands.
    pub fn coerce_to_string(&self) -> String {
        match self {
            Value::String(s) | Value::Socket(s) => s.clone(),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::File(p) | Value::Dir(p) => p.to_string_lossy().into_owned(),
            Value::Array(_) | Value::Object(_) => self.to_json().to_string(),
        }
    }
}

// ─── Scope ────────────────────────────────────────────────────

/// Variable name → value bindings visible to a call.
///
/// Passed by value: every concurrent child works on its own copy and writes
/// only come back through returned outputs.
pub type Scope = BTreeMap<String, Value>;

// ─── Credentials ──────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creds {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Creds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Creds")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

// ─── Runtime call ─────────────────────────────────────────────

/// A call spec node interpreted against a scope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: CallId,
    pub root_id: CallId,
    pub parent_id: Option<CallId>,
    pub name: Option<String>,
    pub needs: Vec<String>,
    #[serde(rename = "if")]
    pub if_: Option<bool>,
    pub kind: CallKind,
}

impl Call {
    pub fn lineage(&self) -> Lineage {
        Lineage {
            id: self.id,
            parent_id: self.parent_id,
            root_id: self.root_id,
        }
    }

    /// A resolved `if` of `false` means the node is skipped.
    pub fn is_skipped(&self) -> bool {
        self.if_ == Some(false)
    }
}

/// Variant-specific resolved payload of a [`Call`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallKind {
    Container(ContainerCall),
    Op(OpCall),
    Parallel,
    ParallelLoop(LoopCall),
    Serial,
    SerialLoop(LoopCall),
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Container(_) => "container",
            CallKind::Op(_) => "op",
            CallKind::Parallel => "parallel",
            CallKind::ParallelLoop(_) => "parallelLoop",
            CallKind::Serial => "serial",
            CallKind::SerialLoop(_) => "serialLoop",
        }
    }
}

/// Resolved container invocation handed to the container runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCall {
    pub container_id: CallId,
    pub op_ref: String,
    pub image: ContainerImage,
    pub cmd: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    /// Container path → host path.
    pub files: BTreeMap<String, PathBuf>,
    /// Container path → host path.
    pub dirs: BTreeMap<String, PathBuf>,
    /// Container address → host socket.
    pub sockets: BTreeMap<String, String>,
    pub work_dir: Option<String>,
    /// Network alias.
    pub name: Option<String>,
    /// Values bound into the caller's scope when the container succeeds.
    #[serde(skip)]
    pub bound_outputs: Scope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImage {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(skip)]
    pub pull_creds: Option<Creds>,
}

/// Resolved reference to a nested op.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpCall {
    pub op_id: CallId,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(skip)]
    pub pull_creds: Option<Creds>,
}

/// Resolved loop header. `range` is bound once; `until` is re-evaluated per
/// iteration by the loop caller.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopCall {
    pub range: Option<LoopRange>,
}

/// The iterable a loop walks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopRange {
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl LoopRange {
    pub fn len(&self) -> usize {
        match self {
            LoopRange::Array(items) => items.len(),
            LoopRange::Object(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key and value of the `index`th item. Arrays use the index as key.
    pub fn item(&self, index: usize) -> Option<(Value, Value)> {
        match self {
            LoopRange::Array(items) => items
                .get(index)
                .map(|v| (Value::Number(index as f64), v.clone())),
            LoopRange::Object(map) => map
                .iter()
                .nth(index)
                .map(|(k, v)| (Value::String(k.clone()), v.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_numbers() {
        assert_eq!(Value::Number(3.0).coerce_to_string(), "3");
        assert_eq!(Value::Number(2.5).coerce_to_string(), "2.5");
        assert_eq!(Value::Boolean(true).coerce_to_string(), "true");
    }

    #[test]
    fn test_coerce_object_to_json() {
        let obj = Value::Object(BTreeMap::from([
            ("a".to_string(), Value::Number(1.0)),
            ("b".to_string(), Value::String("x".to_string())),
        ]));
        assert_eq!(obj.coerce_to_string(), r#"{"a":1.0,"b":"x"}"#);
    }

    #[test]
    fn test_from_json_rejects_null() {
        assert!(Value::from_json(&serde_json::json!(null)).is_none());
        assert!(Value::from_json(&serde_json::json!([1, null])).is_none());
        assert_eq!(
            Value::from_json(&serde_json::json!({"k": [true]})),
            Some(Value::Object(BTreeMap::from([(
                "k".to_string(),
                Value::Array(vec![Value::Boolean(true)])
            )])))
        );
    }

    #[test]
    fn test_loop_range_items() {
        let range = LoopRange::Object(BTreeMap::from([
            ("b".to_string(), Value::Number(2.0)),
            ("a".to_string(), Value::Number(1.0)),
        ]));
        assert_eq!(
            range.item(0),
            Some((Value::String("a".to_string()), Value::Number(1.0)))
        );
        assert_eq!(range.item(2), None);
    }

    #[test]
    fn test_child_lineage_keeps_root() {
        let root = Lineage::root(new_call_id());
        let child = root.child();
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(child.root_id, root.id);
        assert_ne!(child.id, root.id);
    }
}
