//! Manifest artifact ingestion.
//!
//! At startup the runtime ingests a bundle of handler manifests, module
//! manifests, schemas, and version edges from a JSON file tree. The
//! in-memory shapes are normative; the file serialization is simply their
//! serde form. Content hashes are verified during ingestion.

use crate::manifest::{HandlerManifest, ModuleManifest};
use crate::store::ManifestStore;
use gati_core::error::GatiError;
use gati_core::schema::GType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A version edge as it appears in artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub path: String,
    pub from: String,
    pub to: String,
    pub transformer: String,
}

/// One artifact file. All sections are optional so a bundle can be split
/// across files however the tooling prefers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub handlers: Vec<HandlerManifest>,
    #[serde(default)]
    pub modules: Vec<ModuleManifest>,
    #[serde(default)]
    pub schemas: BTreeMap<String, GType>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

impl Bundle {
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
            && self.modules.is_empty()
            && self.schemas.is_empty()
            && self.edges.is_empty()
    }
}

/// Ingest a bundle into the store. Modules and schemas land first so
/// handler dependency validation can see them; edges land last.
pub fn ingest(store: &ManifestStore, bundle: Bundle) -> Result<(), GatiError> {
    for module in bundle.modules {
        store.store_module(module)?;
    }
    for (id, schema) in bundle.schemas {
        store.store_schema(id, schema)?;
    }
    for handler in bundle.handlers {
        store.store_manifest(handler)?;
    }
    for edge in bundle.edges {
        store.store_version_edge(&edge.path, &edge.from, &edge.to, &edge.transformer)?;
    }
    Ok(())
}

/// Load every `.json` file under `root` (recursively, sorted for
/// determinism) and ingest it.
pub fn load_tree(store: &ManifestStore, root: &Path) -> Result<usize, GatiError> {
    let mut files = Vec::new();
    collect_json_files(root, &mut files)
        .map_err(|err| GatiError::Internal(format!("{}: {err}", root.display())))?;
    files.sort();
    let mut loaded = 0;
    for file in files {
        let text = std::fs::read_to_string(&file)
            .map_err(|err| GatiError::Internal(format!("{}: {err}", file.display())))?;
        let bundle: Bundle = serde_json::from_str(&text)
            .map_err(|err| GatiError::Internal(format!("{}: {err}", file.display())))?;
        if bundle.is_empty() {
            tracing::warn!(file = %file.display(), "artifact file contains no manifests");
            continue;
        }
        ingest(store, bundle)?;
        loaded += 1;
    }
    Ok(loaded)
}

fn collect_json_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_json_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}
