//! Import-backed resources for an ephemeral isolate without a filesystem.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::module::normalize;
use super::{Backend, EnvironmentError, Module, ModuleRegistry};

type Slot = Arc<OnceCell<Option<Module>>>;

/// Resolves every resource as an import of `<root>/<path>`.
///
/// Text and JSON assets are modules whose `default` export is the value.
/// Each specifier is imported at most once per backend: the outcome,
/// including a failure (recorded as a miss), is kept for the life of the
/// instance so a partially initialized module graph is never entered twice.
#[derive(Debug)]
pub struct ImportCacheBackend {
    root: String,
    modules: ModuleRegistry,
    cache: DashMap<String, Slot>,
}

impl ImportCacheBackend {
    pub fn new(root: impl AsRef<str>, modules: ModuleRegistry) -> Self {
        Self {
            root: normalize(root.as_ref()),
            modules,
            cache: DashMap::new(),
        }
    }

    fn specifier(&self, path: &str) -> String {
        let path = normalize(path);
        if self.root.is_empty() {
            path
        } else {
            format!("{}/{}", self.root, path)
        }
    }

    async fn import_cached(&self, path: &str) -> Option<Module> {
        let specifier = self.specifier(path);
        // Clone the slot out so no map guard is held across the import.
        let slot: Slot = self.cache.entry(specifier.clone()).or_default().clone();

        slot.get_or_init(|| async {
            match self.modules.import(&specifier).await {
                Ok(module) => {
                    debug!(%specifier, "module imported");
                    Some(module)
                }
                Err(e) => {
                    warn!(%specifier, error = %e, "import failed; not retrying");
                    None
                }
            }
        })
        .await
        .clone()
    }
}

#[async_trait]
impl Backend for ImportCacheBackend {
    async fn read_text(&self, path: &str) -> Result<Option<String>, EnvironmentError> {
        let module = self.import_cached(path).await;
        Ok(module
            .as_ref()
            .and_then(Module::default_value)
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    async fn read_json(&self, path: &str) -> Result<Option<Value>, EnvironmentError> {
        let module = self.import_cached(path).await;
        Ok(module.as_ref().and_then(Module::default_value).cloned())
    }

    async fn load_module(&self, path: &str) -> Result<Option<Module>, EnvironmentError> {
        Ok(self.import_cached(path).await)
    }
}
