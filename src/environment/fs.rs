//! Filesystem-backed resources for a long-lived server process.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use super::module::normalize;
use super::{Backend, EnvironmentError, Module, ModuleRegistry};

/// Reads assets from a build output directory and imports modules by file path.
///
/// A module is importable when its file exists under the root and the
/// registry links code for that root-relative path. Successfully imported
/// modules are cached for the life of the backend; a failed import is
/// attempted again on the next call.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    modules: ModuleRegistry,
    loaded: DashMap<String, Module>,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>, modules: ModuleRegistry) -> Self {
        Self {
            root: root.into(),
            modules,
            loaded: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> (String, PathBuf) {
        let relative = normalize(path);
        let full = self.root.join(&relative);
        (relative, full)
    }

    fn io_error(path: &Path, source: std::io::Error) -> EnvironmentError {
        EnvironmentError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl Backend for FsBackend {
    async fn read_text(&self, path: &str) -> Result<Option<String>, EnvironmentError> {
        let (_, full) = self.resolve(path);
        match tokio::fs::read_to_string(&full).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                Ok(None)
            }
            Err(e) => Err(Self::io_error(&full, e)),
        }
    }

    async fn read_json(&self, path: &str) -> Result<Option<Value>, EnvironmentError> {
        let Some(text) = self.read_text(path).await? else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| EnvironmentError::Json {
                path: normalize(path),
                source,
            })
    }

    async fn load_module(&self, path: &str) -> Result<Option<Module>, EnvironmentError> {
        let (relative, full) = self.resolve(path);
        if let Some(module) = self.loaded.get(&relative) {
            return Ok(Some(module.clone()));
        }

        let exists = tokio::fs::try_exists(&full)
            .await
            .map_err(|e| Self::io_error(&full, e))?;
        if !exists {
            return Ok(None);
        }

        let module = self.modules.import(&relative).await?;
        debug!(path = %relative, "module imported");
        self.loaded.insert(relative, module.clone());
        Ok(Some(module))
    }
}
