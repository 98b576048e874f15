//! Static call declarations
//!
//! The shapes an op file (`op.yml`) deserializes into. Every field that can
//! reference scope variables is kept as the raw literal (`serde_json::Value`
//! or string) and resolved later by the interpreter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CallError;
use crate::types::{Creds, ValueKind};

// ─── Op definition ────────────────────────────────────────────

/// An op definition: declared params plus the call graph it runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub run: Option<CallSpec>,
}

impl OpSpec {
    /// Parse an `op.yml` document.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

/// A declared input or output.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    /// Expected value kind; unchecked when absent.
    #[serde(default, rename = "type")]
    pub kind: Option<ValueKind>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

// ─── Call spec ────────────────────────────────────────────────

/// One node of a declared call graph. Exactly one variant field must be set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// All predicates must hold for the call to run.
    #[serde(default, rename = "if")]
    pub if_: Option<Vec<PredicateSpec>>,
    /// Sibling names (`name` or `$(name)`) this call depends on.
    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default)]
    pub container: Option<ContainerCallSpec>,
    #[serde(default)]
    pub op: Option<OpCallSpec>,
    #[serde(default)]
    pub parallel: Option<Vec<CallSpec>>,
    #[serde(default)]
    pub parallel_loop: Option<ParallelLoopCallSpec>,
    #[serde(default)]
    pub serial: Option<Vec<CallSpec>>,
    #[serde(default)]
    pub serial_loop: Option<SerialLoopCallSpec>,
}

/// Borrowed view of the single populated variant of a [`CallSpec`].
#[derive(Clone, Copy, Debug)]
pub enum CallVariant<'a> {
    Container(&'a ContainerCallSpec),
    Op(&'a OpCallSpec),
    Parallel(&'a [CallSpec]),
    ParallelLoop(&'a ParallelLoopCallSpec),
    Serial(&'a [CallSpec]),
    SerialLoop(&'a SerialLoopCallSpec),
}

impl CallSpec {
    /// The populated variant; none or several populated is an invalid call graph.
    pub fn variant(&self) -> Result<CallVariant<'_>, CallError> {
        let mut found = Vec::with_capacity(1);
        if let Some(c) = &self.container {
            found.push(CallVariant::Container(c));
        }
        if let Some(o) = &self.op {
            found.push(CallVariant::Op(o));
        }
        if let Some(p) = &self.parallel {
            found.push(CallVariant::Parallel(p));
        }
        if let Some(p) = &self.parallel_loop {
            found.push(CallVariant::ParallelLoop(p));
        }
        if let Some(s) = &self.serial {
            found.push(CallVariant::Serial(s));
        }
        if let Some(s) = &self.serial_loop {
            found.push(CallVariant::SerialLoop(s));
        }

        match found.as_slice() {
            [only] => Ok(*only),
            [] => Err(CallError::InvalidCallGraph(
                "call declares no variant".to_string(),
            )),
            _ => Err(CallError::InvalidCallGraph(format!(
                "call declares {} variants, expected exactly one",
                found.len()
            ))),
        }
    }

    pub fn container(spec: ContainerCallSpec) -> Self {
        Self {
            container: Some(spec),
            ..Default::default()
        }
    }

    pub fn op(spec: OpCallSpec) -> Self {
        Self {
            op: Some(spec),
            ..Default::default()
        }
    }

    pub fn parallel(children: Vec<CallSpec>) -> Self {
        Self {
            parallel: Some(children),
            ..Default::default()
        }
    }

    pub fn serial(children: Vec<CallSpec>) -> Self {
        Self {
            serial: Some(children),
            ..Default::default()
        }
    }

    pub fn serial_loop(spec: SerialLoopCallSpec) -> Self {
        Self {
            serial_loop: Some(spec),
            ..Default::default()
        }
    }

    pub fn parallel_loop(spec: ParallelLoopCallSpec) -> Self {
        Self {
            parallel_loop: Some(spec),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn needing(mut self, needs: &[&str]) -> Self {
        self.needs = needs.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn when(mut self, predicates: Vec<PredicateSpec>) -> Self {
        self.if_ = Some(predicates);
        self
    }
}

// ─── Predicates ───────────────────────────────────────────────

/// One condition of an `if` or `until` list. Exactly one field is expected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredicateSpec {
    /// All operands are equal.
    #[serde(default)]
    pub eq: Option<Vec<serde_json::Value>>,
    /// Not all operands are equal.
    #[serde(default)]
    pub ne: Option<Vec<serde_json::Value>>,
    /// Reference resolves in scope.
    #[serde(default)]
    pub exists: Option<String>,
    /// Reference does not resolve in scope.
    #[serde(default)]
    pub not_exists: Option<String>,
}

impl PredicateSpec {
    pub fn eq(operands: Vec<serde_json::Value>) -> Self {
        Self {
            eq: Some(operands),
            ..Default::default()
        }
    }

    pub fn ne(operands: Vec<serde_json::Value>) -> Self {
        Self {
            ne: Some(operands),
            ..Default::default()
        }
    }

    pub fn exists(reference: impl Into<String>) -> Self {
        Self {
            exists: Some(reference.into()),
            ..Default::default()
        }
    }

    pub fn not_exists(reference: impl Into<String>) -> Self {
        Self {
            not_exists: Some(reference.into()),
            ..Default::default()
        }
    }
}

// ─── Variant specs ────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredsSpec {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImageSpec {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub pull_creds: Option<CredsSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCallSpec {
    pub image: ContainerImageSpec,
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Env var name → expression.
    #[serde(default)]
    pub env_vars: BTreeMap<String, serde_json::Value>,
    /// Container path → binding. Empty binds a scratch file; a bare reference
    /// to an unset name binds a scratch file and exports it under that name.
    #[serde(default)]
    pub files: BTreeMap<String, Option<String>>,
    /// Container path → binding, same rules as `files`.
    #[serde(default)]
    pub dirs: BTreeMap<String, Option<String>>,
    /// Container address → socket expression.
    #[serde(default)]
    pub sockets: BTreeMap<String, String>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ContainerCallSpec {
    pub fn image(reference: impl Into<String>) -> Self {
        Self {
            image: ContainerImageSpec {
                reference: reference.into(),
                pull_creds: None,
            },
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpCallSpec {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub pull_creds: Option<CredsSpec>,
    /// Op input name → expression; `null` binds the same-named scope variable.
    #[serde(default)]
    pub inputs: BTreeMap<String, Option<serde_json::Value>>,
    /// Caller variable → op output name (or `$(name)`); `null` means same name.
    #[serde(default)]
    pub outputs: BTreeMap<String, Option<String>>,
}

/// Names the loop binds into each iteration's scope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopVarsSpec {
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialLoopCallSpec {
    /// Literal array/object or a reference to one.
    #[serde(default)]
    pub range: Option<serde_json::Value>,
    /// Loop ends before the first iteration where all predicates hold.
    #[serde(default)]
    pub until: Option<Vec<PredicateSpec>>,
    #[serde(default)]
    pub vars: Option<LoopVarsSpec>,
    pub run: Box<CallSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelLoopCallSpec {
    pub range: serde_json::Value,
    /// Truncates the iteration set at the first iteration where all hold.
    #[serde(default)]
    pub until: Option<Vec<PredicateSpec>>,
    #[serde(default)]
    pub vars: Option<LoopVarsSpec>,
    pub run: Box<CallSpec>,
}

impl CredsSpec {
    pub fn to_creds(&self) -> Creds {
        Creds {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}
