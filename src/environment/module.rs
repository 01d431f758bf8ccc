//! Loadable code modules and the registry that resolves them.
//!
//! A built server bundle is a set of modules addressed by path. Each module
//! exposes named exports; the environment and the request adapter inspect
//! those exports by name (`GET`, `default`, `getStaticContent`, `loader`).
//!
//! [`ModuleRegistry`] is the import map: it maps a specifier to an async
//! factory that instantiates the module. Backends decide how specifiers are
//! formed and whether instances are cached.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::error::HandlerError;
use crate::http::{Request, Response};

use super::manifest::RouteParams;
use super::EnvironmentError;

/// Request handler export: API route methods and plain function exports.
pub type Handler =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response, HandlerError>> + Send + Sync>;

/// Middleware export: `Ok(None)` lets the request continue to routing.
pub type MiddlewareFn = Arc<
    dyn Fn(Request) -> BoxFuture<'static, Result<Option<Response>, HandlerError>> + Send + Sync,
>;

/// Server renderer export (`getStaticContent`).
pub type Renderer = Arc<
    dyn Fn(String, RenderOptions) -> BoxFuture<'static, anyhow::Result<Rendered>> + Send + Sync,
>;

/// Route data loader export (`loader`).
pub type Loader =
    Arc<dyn Fn(Request, RouteParams) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Options handed to a [`Renderer`] alongside the location being rendered.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Data produced by the route's loader, when it declares one.
    pub loader: Option<Value>,
    pub request: Request,
    /// Asset listing from the manifest's rendering descriptor.
    pub assets: Option<Value>,
}

/// What a renderer (and therefore [`Environment::html`](super::Environment::html)) produces.
#[derive(Debug, Clone)]
pub enum Rendered {
    Html(String),
    /// The renderer took full control of the reply (redirects, streaming shells).
    Response(Response),
}

/// One named export of a [`Module`].
#[derive(Clone)]
pub enum Export {
    Handler(Handler),
    Middleware(MiddlewareFn),
    Renderer(Renderer),
    Loader(Loader),
    /// Plain data; text and JSON assets are modules whose `default` is a value.
    Value(Value),
}

impl Export {
    /// `true` for every callable export.
    pub fn is_function(&self) -> bool {
        !matches!(self, Self::Value(_))
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(_) => f.write_str("Handler(..)"),
            Self::Middleware(_) => f.write_str("Middleware(..)"),
            Self::Renderer(_) => f.write_str("Renderer(..)"),
            Self::Loader(_) => f.write_str("Loader(..)"),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// A loaded module: its exports by name.
///
/// # Examples
///
/// ```
/// use reqscope::environment::module::Module;
/// use reqscope::http::{Response, StatusCode};
///
/// let module = Module::new()
///     .with_handler("GET", |_req| async { Ok(Response::new(StatusCode::OK)) });
///
/// assert!(module.handler("GET").is_some());
/// assert!(module.handler("POST").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Module {
    exports: HashMap<String, Export>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// A module whose `default` export is `value`.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::new().with_export("default", Export::Value(value.into()))
    }

    #[must_use]
    pub fn with_export(mut self, name: impl Into<String>, export: Export) -> Self {
        self.exports.insert(name.into(), export);
        self
    }

    #[must_use]
    pub fn with_handler<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |req| handler(req).boxed());
        self.with_export(name, Export::Handler(handler))
    }

    #[must_use]
    pub fn with_middleware<F, Fut>(self, middleware: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Response>, HandlerError>> + Send + 'static,
    {
        let middleware: MiddlewareFn = Arc::new(move |req| middleware(req).boxed());
        self.with_export("default", Export::Middleware(middleware))
    }

    /// Exports `renderer` as `getStaticContent`.
    #[must_use]
    pub fn with_renderer<F, Fut>(self, renderer: F) -> Self
    where
        F: Fn(String, RenderOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Rendered>> + Send + 'static,
    {
        let renderer: Renderer =
            Arc::new(move |location, options| renderer(location, options).boxed());
        self.with_export("getStaticContent", Export::Renderer(renderer))
    }

    /// Exports `loader` under the name `loader`.
    #[must_use]
    pub fn with_loader<F, Fut>(self, loader: F) -> Self
    where
        F: Fn(Request, RouteParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let loader: Loader = Arc::new(move |req, params| loader(req, params).boxed());
        self.with_export("loader", Export::Loader(loader))
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    /// Returns the export named `name` if it is a request handler.
    pub fn handler(&self, name: &str) -> Option<&Handler> {
        match self.exports.get(name)? {
            Export::Handler(handler) => Some(handler),
            _ => None,
        }
    }

    /// Returns the renderer, preferring `getStaticContent` and falling back to `default`.
    pub fn renderer(&self) -> Option<&Renderer> {
        ["getStaticContent", "default"]
            .into_iter()
            .find_map(|name| match self.exports.get(name)? {
                Export::Renderer(renderer) => Some(renderer),
                _ => None,
            })
    }

    pub fn loader(&self) -> Option<&Loader> {
        match self.exports.get("loader")? {
            Export::Loader(loader) => Some(loader),
            _ => None,
        }
    }

    /// Returns the `default` export.
    pub fn default_export(&self) -> Option<&Export> {
        self.exports.get("default")
    }

    /// Returns the `default` export if it is a plain value.
    pub fn default_value(&self) -> Option<&Value> {
        match self.default_export()? {
            Export::Value(value) => Some(value),
            _ => None,
        }
    }
}

type ModuleFactory = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Module>> + Send + Sync>;

/// Maps module specifiers to factories that instantiate them.
///
/// [`import`](Self::import) runs the factory every time it is called; caching
/// is the backend's responsibility.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async factory for `specifier`.
    pub fn register<F, Fut>(&mut self, specifier: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Module>> + Send + 'static,
    {
        let factory: ModuleFactory = Arc::new(move || factory().boxed());
        self.factories.insert(normalize(&specifier.into()), factory);
        self
    }

    /// Registers an already-built module for `specifier`.
    pub fn insert(&mut self, specifier: impl Into<String>, module: Module) -> &mut Self {
        self.register(specifier, move || {
            let module = module.clone();
            async move { Ok(module) }
        })
    }

    pub fn contains(&self, specifier: &str) -> bool {
        self.factories.contains_key(&normalize(specifier))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Instantiates the module registered under `specifier`.
    ///
    /// # Errors
    ///
    /// - [`EnvironmentError::ModuleNotFound`]: nothing is registered under `specifier`.
    /// - [`EnvironmentError::ModuleInit`]: the factory failed.
    pub async fn import(&self, specifier: &str) -> Result<Module, EnvironmentError> {
        let specifier = normalize(specifier);
        let factory = self
            .factories
            .get(&specifier)
            .cloned()
            .ok_or_else(|| EnvironmentError::ModuleNotFound(specifier.clone()))?;

        factory()
            .await
            .map_err(|source| EnvironmentError::ModuleInit { specifier, source })
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("specifiers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Normalizes a specifier or resource path: forward slashes, no leading `/` or `./`,
/// no empty or `.` segments.
pub(crate) fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
