//! Resource access for routing and rendering, independent of the hosting shape.
//!
//! An [`Environment`] answers four questions for the request adapter: what
//! the routes are, what HTML a page renders to, which module serves an API
//! route, and whether middleware is installed. It gets its raw resources from
//! a [`Backend`]:
//!
//! - [`FsBackend`]: a long-lived process reading a build output directory.
//! - [`ImportCacheBackend`]: an ephemeral isolate with no filesystem, where
//!   every resource is a memoized import of a virtual module specifier.
//!
//! The compiled manifest and the server renderer are cached on the
//! environment. First population is not locked: two requests racing on a
//! cold environment may both compute it, and the later store wins with an
//! equivalent value.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::http::Request;

pub mod fs;
pub mod import_cache;
pub mod manifest;
pub mod module;

pub use fs::FsBackend;
pub use import_cache::ImportCacheBackend;
pub use manifest::{
    Manifest, MiddlewareInfo, RenderingDescriptor, RenderingMode, Route, RouteParams,
};
pub use module::{Export, Module, ModuleRegistry, RenderOptions, Rendered, Renderer};

/// Default location of the routes manifest, relative to the build root.
pub const DEFAULT_MANIFEST_PATH: &str = "_expo/routes.json";

const INDEX_SUFFIX: &str = "/index";

/// Errors produced while loading resources.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("routes manifest not found at {0}")]
    ManifestMissing(String),

    #[error("invalid routes manifest: {0}")]
    Manifest(#[source] serde_json::Error),

    #[error("no module registered for {0}")]
    ModuleNotFound(String),

    #[error("module {specifier} failed to initialize: {source}")]
    ModuleInit {
        specifier: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("rendering module {0} does not export getStaticContent")]
    MissingRenderer(String),

    #[error("loader module {0} does not export a loader function")]
    MissingLoader(String),

    /// Failure raised by the renderer or a route loader, unchanged.
    #[error(transparent)]
    Render(anyhow::Error),
}

/// Raw resource access for one hosting shape.
///
/// Paths are relative to the build root; a leading `/` is ignored. A missing
/// resource is `Ok(None)`, not an error.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Reads a text asset.
    async fn read_text(&self, path: &str) -> Result<Option<String>, EnvironmentError>;

    /// Reads and parses a JSON asset.
    async fn read_json(&self, path: &str) -> Result<Option<Value>, EnvironmentError>;

    /// Loads a code module.
    async fn load_module(&self, path: &str) -> Result<Option<Module>, EnvironmentError>;
}

struct ServerRenderer {
    render: Renderer,
    assets: Option<Value>,
}

/// The routing/rendering facade shared by every request an instance serves.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use reqscope::environment::{Environment, FsBackend, ModuleRegistry};
///
/// # async fn example() -> Result<(), reqscope::environment::EnvironmentError> {
/// let backend = FsBackend::new("dist/server", ModuleRegistry::new());
/// let environment = Environment::new(Arc::new(backend));
///
/// let manifest = environment.routes_manifest().await?;
/// println!("{} html routes", manifest.html_routes.len());
/// # Ok(())
/// # }
/// ```
pub struct Environment {
    backend: Arc<dyn Backend>,
    manifest_path: String,
    manifest: ArcSwapOption<Manifest>,
    renderer: ArcSwapOption<ServerRenderer>,
}

impl Environment {
    /// Creates an environment reading the manifest from [`DEFAULT_MANIFEST_PATH`].
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_manifest_path(backend, DEFAULT_MANIFEST_PATH)
    }

    /// Creates an environment reading the manifest from `manifest_path`.
    pub fn with_manifest_path(backend: Arc<dyn Backend>, manifest_path: impl Into<String>) -> Self {
        Self {
            backend,
            manifest_path: manifest_path.into(),
            manifest: ArcSwapOption::empty(),
            renderer: ArcSwapOption::empty(),
        }
    }

    /// Returns the compiled manifest, loading and compiling it on first use.
    ///
    /// # Errors
    ///
    /// - [`EnvironmentError::ManifestMissing`]: no manifest at the configured path.
    /// - [`EnvironmentError::Manifest`]: bad shape or an uncompilable `namedRegex`.
    /// - Any backend read error.
    pub async fn routes_manifest(&self) -> Result<Arc<Manifest>, EnvironmentError> {
        if let Some(manifest) = self.manifest.load_full() {
            return Ok(manifest);
        }

        let raw = self
            .backend
            .read_json(&self.manifest_path)
            .await?
            .ok_or_else(|| EnvironmentError::ManifestMissing(self.manifest_path.clone()))?;
        let manifest = Arc::new(Manifest::from_value(raw).map_err(EnvironmentError::Manifest)?);

        debug!(
            path = %self.manifest_path,
            html = manifest.html_routes.len(),
            api = manifest.api_routes.len(),
            "routes manifest compiled"
        );
        self.manifest.store(Some(Arc::clone(&manifest)));
        Ok(manifest)
    }

    /// Produces the HTML for `route`.
    ///
    /// In server-rendering mode the renderer is invoked with the request's
    /// path and query; otherwise the pre-built `<page>.html` is read, falling
    /// back from `/foo/index` to `/foo.html`. `Ok(None)` means there is no
    /// page; the caller decides what a miss means.
    ///
    /// # Errors
    ///
    /// Renderer and loader failures are returned as [`EnvironmentError::Render`]
    /// carrying the original error.
    pub async fn html(
        &self,
        request: &Request,
        route: &Route,
    ) -> Result<Option<Rendered>, EnvironmentError> {
        let manifest = self.routes_manifest().await?;

        if let Some(renderer) = self.server_renderer(&manifest).await? {
            let loader = self.loader_data(request, route).await?;
            let options = RenderOptions {
                loader,
                request: request.clone(),
                assets: renderer.assets.clone(),
            };
            let rendered = (renderer.render)(request.path_and_query(), options)
                .await
                .map_err(EnvironmentError::Render)?;
            return Ok(Some(rendered));
        }

        if let Some(html) = self.backend.read_text(&format!("{}.html", route.page)).await? {
            return Ok(Some(Rendered::Html(html)));
        }

        if let Some(parent) = route.page.strip_suffix(INDEX_SUFFIX).filter(|p| !p.is_empty()) {
            if let Some(html) = self.backend.read_text(&format!("{parent}.html")).await? {
                return Ok(Some(Rendered::Html(html)));
            }
        }

        Ok(None)
    }

    /// Loads the module serving an API route, unmodified.
    ///
    /// # Errors
    ///
    /// Propagates backend load errors.
    pub async fn api_route(&self, route: &Route) -> Result<Option<Module>, EnvironmentError> {
        match &route.file {
            Some(file) => self.backend.load_module(file).await,
            None => Ok(None),
        }
    }

    /// Loads the middleware module, returning it only when its `default`
    /// export is callable.
    ///
    /// # Errors
    ///
    /// Propagates backend load errors.
    pub async fn middleware(
        &self,
        info: &MiddlewareInfo,
    ) -> Result<Option<Module>, EnvironmentError> {
        let module = self.backend.load_module(&info.file).await?;
        Ok(module.filter(|m| m.default_export().is_some_and(Export::is_function)))
    }

    async fn server_renderer(
        &self,
        manifest: &Manifest,
    ) -> Result<Option<Arc<ServerRenderer>>, EnvironmentError> {
        let Some(descriptor) = manifest
            .rendering
            .as_ref()
            .filter(|d| d.mode == RenderingMode::Ssr)
        else {
            return Ok(None);
        };

        if let Some(renderer) = self.renderer.load_full() {
            return Ok(Some(renderer));
        }

        let module = self
            .backend
            .load_module(&descriptor.file)
            .await?
            .ok_or_else(|| EnvironmentError::ModuleNotFound(descriptor.file.clone()))?;
        let render = module
            .renderer()
            .cloned()
            .ok_or_else(|| EnvironmentError::MissingRenderer(descriptor.file.clone()))?;

        let renderer = Arc::new(ServerRenderer {
            render,
            assets: descriptor.assets.clone(),
        });
        debug!(file = %descriptor.file, "server renderer loaded");
        self.renderer.store(Some(Arc::clone(&renderer)));
        Ok(Some(renderer))
    }

    async fn loader_data(
        &self,
        request: &Request,
        route: &Route,
    ) -> Result<Option<Value>, EnvironmentError> {
        let Some(file) = &route.loader else {
            return Ok(None);
        };

        let module = self
            .backend
            .load_module(file)
            .await?
            .ok_or_else(|| EnvironmentError::ModuleNotFound(file.clone()))?;
        let loader = module
            .loader()
            .ok_or_else(|| EnvironmentError::MissingLoader(file.clone()))?;

        let params = route.matches(request.path()).unwrap_or_default();
        let data = loader(request.clone(), params)
            .await
            .map_err(EnvironmentError::Render)?;
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::http::{Response, StatusCode};

    /// In-memory backend that counts reads.
    #[derive(Default)]
    struct MemoryBackend {
        text: HashMap<String, String>,
        json: HashMap<String, Value>,
        modules: HashMap<String, Module>,
        reads: AtomicUsize,
        loaded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Backend for MemoryBackend {
        async fn read_text(&self, path: &str) -> Result<Option<String>, EnvironmentError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.text.get(&module::normalize(path)).cloned())
        }

        async fn read_json(&self, path: &str) -> Result<Option<Value>, EnvironmentError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.json.get(&module::normalize(path)).cloned())
        }

        async fn load_module(&self, path: &str) -> Result<Option<Module>, EnvironmentError> {
            self.loaded.lock().push(path.to_owned());
            Ok(self.modules.get(&module::normalize(path)).cloned())
        }
    }

    fn ssg_manifest() -> Value {
        json!({
            "htmlRoutes": [
                { "page": "/index", "namedRegex": "^/(?:/)?$" },
                { "page": "/about", "namedRegex": "^/about(?:/)?$" },
                { "page": "/docs/index", "namedRegex": "^/docs(?:/)?$" }
            ],
            "apiRoutes": [
                { "page": "/api/hello", "file": "api/hello.js", "namedRegex": "^/api/hello(?:/)?$" }
            ],
            "notFoundRoutes": []
        })
    }

    fn backend_with(manifest: Value) -> MemoryBackend {
        let mut backend = MemoryBackend::default();
        backend.json.insert(DEFAULT_MANIFEST_PATH.to_owned(), manifest);
        backend
    }

    #[tokio::test]
    async fn manifest_is_computed_once() {
        let backend = Arc::new(backend_with(ssg_manifest()));
        let env = Environment::new(backend.clone());

        let first = env.routes_manifest().await.unwrap();
        let second = env.routes_manifest().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_manifest() {
        let env = Environment::new(Arc::new(MemoryBackend::default()));
        let err = env.routes_manifest().await.unwrap_err();
        assert!(matches!(err, EnvironmentError::ManifestMissing(_)));
    }

    #[tokio::test]
    async fn static_html_and_index_fallback() {
        let mut backend = backend_with(ssg_manifest());
        backend.text.insert("about.html".into(), "<p>about</p>".into());
        backend.text.insert("docs.html".into(), "<p>docs</p>".into());
        let env = Environment::new(Arc::new(backend));
        let manifest = env.routes_manifest().await.unwrap();

        let about = env.html(&Request::get("/about"), &manifest.html_routes[1]).await.unwrap();
        assert!(matches!(about, Some(Rendered::Html(ref h)) if h == "<p>about</p>"));

        let docs = env.html(&Request::get("/docs"), &manifest.html_routes[2]).await.unwrap();
        assert!(matches!(docs, Some(Rendered::Html(ref h)) if h == "<p>docs</p>"));

        // `/index` alone has no parent to hoist to.
        let root = env.html(&Request::get("/"), &manifest.html_routes[0]).await.unwrap();
        assert!(root.is_none());
    }

    #[tokio::test]
    async fn server_rendering_uses_cached_renderer() {
        let manifest = json!({
            "htmlRoutes": [
                {
                    "page": "/post/[id]",
                    "namedRegex": "^/post/(?<id>[^/]+?)(?:/)?$",
                    "loader": "loaders/post.js"
                }
            ],
            "apiRoutes": [],
            "notFoundRoutes": [],
            "rendering": { "mode": "ssr", "file": "render.js", "assets": { "js": ["app.js"] } }
        });
        let mut backend = backend_with(manifest);
        backend.modules.insert(
            "render.js".into(),
            Module::new().with_renderer(|location, options: RenderOptions| async move {
                Ok(Rendered::Html(format!(
                    "{location}|{}|{}",
                    options.loader.unwrap_or_default(),
                    options.assets.unwrap_or_default()
                )))
            }),
        );
        backend.modules.insert(
            "loaders/post.js".into(),
            Module::new().with_loader(|_req, params| async move {
                Ok(json!({ "id": params.get("id").cloned() }))
            }),
        );
        let backend = Arc::new(backend);
        let env = Environment::new(backend.clone());
        let manifest = env.routes_manifest().await.unwrap();
        let route = &manifest.html_routes[0];

        for _ in 0..2 {
            let html = env
                .html(&Request::get("https://x.test/post/7?ref=home"), route)
                .await
                .unwrap();
            let Some(Rendered::Html(html)) = html else {
                panic!("expected html");
            };
            assert_eq!(html, r#"/post/7?ref=home|{"id":"7"}|{"js":["app.js"]}"#);
        }

        let renders = backend.loaded.lock().iter().filter(|p| *p == "render.js").count();
        assert_eq!(renders, 1);
    }

    #[tokio::test]
    async fn renderer_error_propagates_unchanged() {
        #[derive(Debug, thiserror::Error)]
        #[error("hydration mismatch")]
        struct RenderFailure;

        let mut backend = backend_with(json!({
            "htmlRoutes": [{ "page": "/index", "namedRegex": "^/$" }],
            "apiRoutes": [],
            "notFoundRoutes": [],
            "rendering": { "mode": "ssr", "file": "render.js" }
        }));
        backend.modules.insert(
            "render.js".into(),
            Module::new().with_renderer(|_location, _options| async {
                Err(anyhow::Error::new(RenderFailure))
            }),
        );
        let env = Environment::new(Arc::new(backend));
        let manifest = env.routes_manifest().await.unwrap();

        let err = env
            .html(&Request::get("/"), &manifest.html_routes[0])
            .await
            .unwrap_err();
        let EnvironmentError::Render(source) = err else {
            panic!("expected render error");
        };
        assert!(source.downcast_ref::<RenderFailure>().is_some());
    }

    #[tokio::test]
    async fn api_route_module_is_returned_as_is() {
        let mut backend = backend_with(ssg_manifest());
        backend.modules.insert(
            "api/hello.js".into(),
            Module::new().with_handler("GET", |_req| async {
                Ok(Response::text_body(StatusCode::OK, "hello"))
            }),
        );
        let env = Environment::new(Arc::new(backend));
        let manifest = env.routes_manifest().await.unwrap();

        let module = env.api_route(&manifest.api_routes[0]).await.unwrap().unwrap();
        assert!(module.handler("GET").is_some());
        assert!(env.api_route(&manifest.html_routes[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn middleware_requires_callable_default() {
        let mut backend = MemoryBackend::default();
        backend
            .modules
            .insert("mw.js".into(), Module::new().with_middleware(|_req| async { Ok(None) }));
        backend.modules.insert("data.js".into(), Module::value(json!({ "x": 1 })));
        let env = Environment::new(Arc::new(backend));

        let info = |file: &str| MiddlewareInfo { file: file.to_owned() };
        assert!(env.middleware(&info("mw.js")).await.unwrap().is_some());
        assert!(env.middleware(&info("data.js")).await.unwrap().is_none());
        assert!(env.middleware(&info("absent.js")).await.unwrap().is_none());
    }
}
