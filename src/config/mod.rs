//! Runtime configuration for a deployment.
//!
//! Load it from a deserialized document (any serde format) or from the
//! process environment:
//!
//! | Variable               | Field           | Default                 |
//! |------------------------|-----------------|-------------------------|
//! | `SERVER_BUILD_ROOT`    | `build_root`    | required                |
//! | `SERVER_ENVIRONMENT`   | `environment`   | unset                   |
//! | `SERVER_ORIGIN`        | `origin`        | derived per request     |
//! | `SERVER_MANIFEST_PATH` | `manifest_path` | `_expo/routes.json`     |

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::environment::DEFAULT_MANIFEST_PATH;

pub const BUILD_ROOT_VAR: &str = "SERVER_BUILD_ROOT";
pub const ENVIRONMENT_VAR: &str = "SERVER_ENVIRONMENT";
pub const ORIGIN_VAR: &str = "SERVER_ORIGIN";
pub const MANIFEST_PATH_VAR: &str = "SERVER_MANIFEST_PATH";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("setting {name} must not be empty")]
    Empty { name: &'static str },
}

/// Settings shared by every request an instance serves.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Directory (or import-specifier prefix) holding the server build output.
    pub build_root: PathBuf,

    /// Deployment tag surfaced through `scope::environment()`.
    #[serde(default)]
    pub environment: Option<String>,

    /// Fixed public origin. When unset, each request's own origin is used.
    #[serde(default)]
    pub origin: Option<String>,

    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,
}

fn default_manifest_path() -> String {
    DEFAULT_MANIFEST_PATH.to_owned()
}

impl RuntimeConfig {
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            environment: None,
            origin: None,
            manifest_path: default_manifest_path(),
        }
    }

    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn manifest_path(mut self, path: impl Into<String>) -> Self {
        self.manifest_path = path.into();
        self
    }

    /// Reads the `SERVER_*` variables from the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] without `SERVER_BUILD_ROOT`;
    /// [`ConfigError::Empty`] when a variable is set to an empty string.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &'static str| match lookup(name) {
            Some(value) if value.trim().is_empty() => Err(ConfigError::Empty { name }),
            other => Ok(other),
        };

        let build_root = read(BUILD_ROOT_VAR)?.ok_or(ConfigError::Missing(BUILD_ROOT_VAR))?;
        let mut config = Self::new(build_root);
        config.environment = read(ENVIRONMENT_VAR)?;
        config.origin = read(ORIGIN_VAR)?.map(|o| o.trim_end_matches('/').to_owned());
        if let Some(path) = read(MANIFEST_PATH_VAR)? {
            config.manifest_path = path;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn build_root_is_required() {
        assert_eq!(
            RuntimeConfig::from_lookup(lookup(&[])),
            Err(ConfigError::Missing(BUILD_ROOT_VAR))
        );
    }

    #[test]
    fn reads_every_variable() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (BUILD_ROOT_VAR, "dist/server"),
            (ENVIRONMENT_VAR, "production"),
            (ORIGIN_VAR, "https://example.com/"),
            (MANIFEST_PATH_VAR, "routes.json"),
        ]))
        .unwrap();

        assert_eq!(
            config,
            RuntimeConfig::new("dist/server")
                .environment("production")
                .origin("https://example.com")
                .manifest_path("routes.json")
        );
    }

    #[test]
    fn empty_values_are_rejected() {
        let err = RuntimeConfig::from_lookup(lookup(&[
            (BUILD_ROOT_VAR, "dist"),
            (ORIGIN_VAR, "  "),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Empty { name: ORIGIN_VAR });
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "buildRoot": "dist", "environment": "preview" }"#).unwrap();
        assert_eq!(config.manifest_path, DEFAULT_MANIFEST_PATH);
        assert_eq!(config.environment.as_deref(), Some("preview"));
        assert_eq!(config.origin, None);
    }
}
