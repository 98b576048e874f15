//! Pull credential registry
//!
//! Credentials are registered against a resource prefix (e.g. `github.com/org`)
//! and looked up by op or image reference. Case-insensitive; the longest
//! matching prefix wins.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::types::Creds;

/// Request to register credentials for references starting with `resources`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAuthReq {
    pub resources: String,
    #[serde(flatten)]
    pub creds: Creds,
}

#[derive(Debug, Default)]
pub struct AuthStore {
    by_prefix: RwLock<BTreeMap<String, Creds>>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, req: AddAuthReq) {
        let prefix = req.resources.to_lowercase();
        tracing::info!(resources = %prefix, "Auth added");
        self.by_prefix
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prefix, req.creds);
    }

    /// Credentials for the longest registered prefix of `reference`.
    pub fn try_get(&self, reference: &str) -> Option<Creds> {
        let reference = reference.to_lowercase();
        self.by_prefix
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(prefix, _)| reference.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, creds)| creds.clone())
    }
}
