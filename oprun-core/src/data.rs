//! Op Data Resolution
//!
//! Locates op definitions behind a reference. Providers are tried in order;
//! the first one that returns a handle wins. Credentials fall back to the
//! [`AuthStore`] when the caller supplies none.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::auth::AuthStore;
use crate::error::DataError;
use crate::spec::OpSpec;
use crate::types::Creds;

/// File name of an op definition inside its directory.
pub const OP_FILE_NAME: &str = "op.yml";

/// A resolved op.
#[async_trait]
pub trait DataHandle: Send + Sync {
    /// Canonical reference; relative refs inside the op resolve against it.
    fn reference(&self) -> &str;

    async fn op_spec(&self) -> Result<OpSpec, DataError>;
}

/// A source of ops (local disk, git, registry, ...).
///
/// `Ok(None)` means "not here"; errors are reserved for failures that should
/// be reported if no other provider resolves the reference.
#[async_trait]
pub trait DataProvider: Send + Sync {
    fn label(&self) -> &str;

    async fn try_resolve(
        &self,
        data_ref: &str,
        pull_creds: Option<&Creds>,
    ) -> Result<Option<Arc<dyn DataHandle>>, DataError>;
}

// ─── Resolver ─────────────────────────────────────────────────

pub struct DataResolver {
    providers: Vec<Arc<dyn DataProvider>>,
    auths: Arc<AuthStore>,
}

impl DataResolver {
    pub fn new(providers: Vec<Arc<dyn DataProvider>>, auths: Arc<AuthStore>) -> Self {
        Self { providers, auths }
    }

    /// Resolve `data_ref` from the providers in order.
    ///
    /// When nothing resolves, an authentication/authorization failure from
    /// any provider is returned as-is so the caller can retry with
    /// credentials; otherwise every provider's failure is listed.
    pub async fn resolve(
        &self,
        data_ref: &str,
        pull_creds: Option<&Creds>,
    ) -> Result<Arc<dyn DataHandle>, DataError> {
        let stored;
        let creds = match pull_creds {
            Some(creds) => Some(creds),
            None => {
                stored = self.auths.try_get(data_ref);
                stored.as_ref()
            }
        };

        let mut failures: Vec<(String, DataError)> = Vec::new();
        for provider in &self.providers {
            match provider.try_resolve(data_ref, creds).await {
                Ok(Some(handle)) => {
                    tracing::debug!(data_ref, provider = provider.label(), "Op resolved");
                    return Ok(handle);
                }
                Ok(None) => failures.push((
                    provider.label().to_string(),
                    DataError::RefResolution("not found".to_string()),
                )),
                Err(err) => failures.push((provider.label().to_string(), err)),
            }
        }

        if let Some((_, auth_err)) = failures.iter().find(|(_, err)| err.is_auth()) {
            return Err(auth_err.clone());
        }

        let mut message = format!("unable to resolve op \"{data_ref}\":");
        for (label, err) in &failures {
            for (i, part) in err.to_string().lines().enumerate() {
                let _ = match i {
                    0 => write!(message, "\n- {label}: {part}"),
                    _ => write!(message, "\n  {part}"),
                };
            }
        }
        Err(DataError::RefResolution(message))
    }
}

/// Resolve `reference` against the directory-like `base` when it starts with
/// `./` or `../`; otherwise return it unchanged.
pub fn resolve_relative(base: &str, reference: &str) -> String {
    if !(reference.starts_with("./") || reference.starts_with("../")) {
        return reference.to_string();
    }

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(base).join(reference).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(parts.last().map(String::as_str), Some(p) if p != "/" && p != "..")
                {
                    parts.pop();
                } else if parts.is_empty() {
                    parts.push("..".to_string());
                }
            }
            Component::RootDir => parts.push("/".to_string()),
            other => parts.push(other.as_os_str().to_string_lossy().into_owned()),
        }
    }

    let mut out = PathBuf::new();
    for part in parts {
        out.push(part);
    }
    out.to_string_lossy().into_owned()
}

// ─── Filesystem provider ──────────────────────────────────────

/// Resolves ops from directories containing an `op.yml`.
pub struct FsProvider {
    search_paths: Vec<PathBuf>,
}

impl FsProvider {
    /// Relative refs are looked up under each search path in order.
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    fn candidates(&self, data_ref: &str) -> Vec<PathBuf> {
        let path = Path::new(data_ref);
        if path.is_absolute() {
            vec![path.to_path_buf()]
        } else {
            self.search_paths.iter().map(|base| base.join(path)).collect()
        }
    }
}

#[async_trait]
impl DataProvider for FsProvider {
    fn label(&self) -> &str {
        "filesystem"
    }

    async fn try_resolve(
        &self,
        data_ref: &str,
        _pull_creds: Option<&Creds>,
    ) -> Result<Option<Arc<dyn DataHandle>>, DataError> {
        for dir in self.candidates(data_ref) {
            if tokio::fs::metadata(dir.join(OP_FILE_NAME)).await.is_ok() {
                return Ok(Some(Arc::new(FsHandle {
                    reference: dir.to_string_lossy().into_owned(),
                    dir,
                })));
            }
        }
        Ok(None)
    }
}

struct FsHandle {
    reference: String,
    dir: PathBuf,
}

#[async_trait]
impl DataHandle for FsHandle {
    fn reference(&self) -> &str {
        &self.reference
    }

    async fn op_spec(&self) -> Result<OpSpec, DataError> {
        let yaml = tokio::fs::read_to_string(self.dir.join(OP_FILE_NAME))
            .await
            .map_err(|e| DataError::Read {
                reference: self.reference.clone(),
                message: e.to_string(),
            })?;
        OpSpec::from_yaml(&yaml).map_err(|e| DataError::InvalidOpFile {
            reference: self.reference.clone(),
            message: e.to_string(),
        })
    }
}

// ─── In-memory provider ───────────────────────────────────────

/// Ops registered in memory, keyed by exact reference. Optionally protected
/// by credentials.
#[derive(Default)]
pub struct MemoryProvider {
    ops: RwLock<BTreeMap<String, MemoryEntry>>,
}

#[derive(Clone)]
struct MemoryEntry {
    spec: OpSpec,
    required_creds: Option<Creds>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, reference: impl Into<String>, spec: OpSpec) {
        self.insert(reference.into(), spec, None);
    }

    /// Register an op that only resolves with `creds`.
    pub fn register_protected(&self, reference: impl Into<String>, spec: OpSpec, creds: Creds) {
        self.insert(reference.into(), spec, Some(creds));
    }

    fn insert(&self, reference: String, spec: OpSpec, required_creds: Option<Creds>) {
        self.ops
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                reference,
                MemoryEntry {
                    spec,
                    required_creds,
                },
            );
    }
}

#[async_trait]
impl DataProvider for MemoryProvider {
    fn label(&self) -> &str {
        "memory"
    }

    async fn try_resolve(
        &self,
        data_ref: &str,
        pull_creds: Option<&Creds>,
    ) -> Result<Option<Arc<dyn DataHandle>>, DataError> {
        let entry = self
            .ops
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(data_ref)
            .cloned();
        let Some(entry) = entry else {
            return Ok(None);
        };

        match (&entry.required_creds, pull_creds) {
            (Some(_), None) => return Err(DataError::Authentication),
            (Some(required), Some(given)) if required != given => {
                return Err(DataError::Authorization)
            }
            _ => {}
        }

        Ok(Some(Arc::new(MemoryHandle {
            reference: data_ref.to_string(),
            spec: entry.spec,
        })))
    }
}

struct MemoryHandle {
    reference: String,
    spec: OpSpec,
}

#[async_trait]
impl DataHandle for MemoryHandle {
    fn reference(&self) -> &str {
        &self.reference
    }

    async fn op_spec(&self) -> Result<OpSpec, DataError> {
        Ok(self.spec.clone())
    }
}
