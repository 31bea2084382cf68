//! Manifest sources and their resolution into ready-to-apply objects
//!
//! A feature lists manifest sources: a base location plus the files or
//! directories under it that belong to the feature. File names decide how a
//! manifest is treated:
//! - `*.tmpl.*` is rendered with the feature's data context first
//! - `*.patch.*` is merge-patched onto an existing object instead of applied
//!
//! Directories are walked recursively in lexical order.

use std::fs;
use std::path::{Path, PathBuf};

use kube::api::DynamicObject;
#[cfg(test)]
use mockall::automock;
use plinth_common::template::TemplateEngine;
use plinth_common::yaml::parse_yaml_documents;
use plinth_common::{Error, Result};
use serde_json::Value;

/// Where a feature's manifests live
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestSource {
    /// Base directory
    pub location: PathBuf,
    /// Files or directories relative to `location`; empty means all of it
    pub includes: Vec<PathBuf>,
}

impl ManifestSource {
    /// Source rooted at `location`
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            includes: Vec::new(),
        }
    }

    /// Add a file or directory under the base location
    pub fn include(mut self, path: impl Into<PathBuf>) -> Self {
        self.includes.push(path.into());
        self
    }
}

/// How a rendered object reaches the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    /// Server-side apply, creating the object if needed
    Apply,
    /// Merge patch onto an object that must already exist
    Patch,
}

/// One object ready to be sent to the cluster
#[derive(Clone, Debug)]
pub struct RenderedManifest {
    /// File the object came from
    pub path: PathBuf,
    /// The object
    pub object: DynamicObject,
    /// How to send it
    pub mode: ApplyMode,
}

/// Turns manifest sources into objects
#[cfg_attr(test, automock)]
pub trait ManifestResolver: Send + Sync {
    /// Resolve every manifest of `source`, rendering templates with `context`
    fn resolve(&self, source: &ManifestSource, context: &Value) -> Result<Vec<RenderedManifest>>;
}

/// Resolver reading manifests from the local filesystem
#[derive(Default)]
pub struct FsManifestResolver {
    engine: TemplateEngine,
}

impl FsManifestResolver {
    /// Create a resolver
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        let meta = fs::metadata(path)
            .map_err(|e| Error::manifest(path.display().to_string(), e.to_string()))?;
        if meta.is_file() {
            out.push(path.to_path_buf());
            return Ok(());
        }

        let mut entries = fs::read_dir(path)
            .map_err(|e| Error::manifest(path.display().to_string(), e.to_string()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| Error::manifest(path.display().to_string(), e.to_string()))?;
        entries.sort();

        for entry in entries {
            if entry.is_dir() {
                Self::collect(&entry, out)?;
            } else if is_manifest_file(&entry) {
                out.push(entry);
            }
        }
        Ok(())
    }

    fn load(&self, path: &Path, context: &Value) -> Result<Vec<RenderedManifest>> {
        let display = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|e| Error::manifest(&display, e.to_string()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let content = if file_name.contains(".tmpl.") {
            self.engine.render(&display, &raw, context)?
        } else {
            raw
        };
        let mode = if file_name.contains(".patch.") {
            ApplyMode::Patch
        } else {
            ApplyMode::Apply
        };

        parse_yaml_documents(&content)
            .map_err(|e| Error::manifest(&display, e.to_string()))?
            .into_iter()
            .map(|doc| {
                Ok(RenderedManifest {
                    path: path.to_path_buf(),
                    object: to_object(&display, doc)?,
                    mode,
                })
            })
            .collect()
    }
}

impl ManifestResolver for FsManifestResolver {
    fn resolve(&self, source: &ManifestSource, context: &Value) -> Result<Vec<RenderedManifest>> {
        let mut files = Vec::new();
        if source.includes.is_empty() {
            Self::collect(&source.location, &mut files)?;
        } else {
            for include in &source.includes {
                Self::collect(&source.location.join(include), &mut files)?;
            }
        }

        let mut manifests = Vec::new();
        for file in files {
            manifests.extend(self.load(&file, context)?);
        }
        Ok(manifests)
    }
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Validate a parsed document and convert it into a DynamicObject
fn to_object(path: &str, doc: Value) -> Result<DynamicObject> {
    for (pointer, field) in [
        ("/apiVersion", "apiVersion"),
        ("/kind", "kind"),
        ("/metadata/name", "metadata.name"),
    ] {
        if doc.pointer(pointer).and_then(Value::as_str).is_none() {
            return Err(Error::manifest(path, format!("document missing {field}")));
        }
    }
    serde_json::from_value(doc).map_err(|e| Error::manifest(path, e.to_string()))
}
