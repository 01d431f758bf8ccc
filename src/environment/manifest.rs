//! Compiled route manifest.
//!
//! The manifest is produced at build time as JSON. Every route's `namedRegex`
//! is compiled into a [`Regex`] while deserializing, so a loaded [`Manifest`]
//! never holds an uncompiled pattern.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Named captures extracted from a matched path.
pub type RouteParams = HashMap<String, String>;

/// The full routing table of a build.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub html_routes: Vec<Route>,
    pub api_routes: Vec<Route>,
    pub not_found_routes: Vec<Route>,
    #[serde(default)]
    pub redirects: Option<Vec<Route>>,
    #[serde(default)]
    pub rewrites: Option<Vec<Route>>,
    #[serde(default)]
    pub middleware: Option<MiddlewareInfo>,
    #[serde(default)]
    pub rendering: Option<RenderingDescriptor>,
}

impl Manifest {
    /// Parses and compiles a manifest from its JSON value.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for shape mismatches and for any
    /// `namedRegex` that does not compile.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// `true` when HTML is produced per request by a server renderer.
    pub fn is_server_rendered(&self) -> bool {
        matches!(
            self.rendering,
            Some(RenderingDescriptor {
                mode: RenderingMode::Ssr,
                ..
            })
        )
    }
}

/// One routable entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Page path without extension, e.g. `/blog/[slug]` or `/index`.
    pub page: String,
    /// Module file for API routes and not-found handlers.
    #[serde(default)]
    pub file: Option<String>,
    #[serde(deserialize_with = "compile_pattern")]
    pub named_regex: Regex,
    /// Module file exporting a data `loader` for this page.
    #[serde(default)]
    pub loader: Option<String>,
    /// Redirect or rewrite target.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub permanent: Option<bool>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
}

impl Route {
    /// Matches `path` against the compiled pattern and returns its named captures.
    pub fn matches(&self, path: &str) -> Option<RouteParams> {
        let captures = self.named_regex.captures(path)?;
        let params = self
            .named_regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|value| (name.to_owned(), value.as_str().to_owned()))
            })
            .collect();
        Some(params)
    }
}

/// Pointer to the middleware module.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MiddlewareInfo {
    pub file: String,
}

/// How HTML is produced for this build.
#[derive(Debug, Clone, Deserialize)]
pub struct RenderingDescriptor {
    pub mode: RenderingMode,
    /// Rendering module, loaded once per environment in server mode.
    pub file: String,
    #[serde(default)]
    pub assets: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderingMode {
    Ssr,
    Ssg,
}

fn compile_pattern<'de, D>(deserializer: D) -> Result<Regex, D::Error>
where
    D: Deserializer<'de>,
{
    let source = String::deserialize(deserializer)?;
    Regex::new(&source).map_err(|e| {
        serde::de::Error::custom(format!("invalid route pattern `{source}`: {e}"))
    })
}
