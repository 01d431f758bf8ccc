//! Ambient per-request context.
//!
//! [`RequestScope::run`] binds a fresh [`RequestContext`] to the handler
//! future with a tokio task-local, so any code polled as part of that
//! future, at any call depth and across every `.await`, sees the same
//! context, while concurrently running requests each see their own. Code
//! outside a scope (including tasks spawned with `tokio::spawn`) sees none.
//!
//! ## Accessors
//!
//! | Function                                   | Returns / does                               |
//! |--------------------------------------------|----------------------------------------------|
//! | [`environment`]                            | deployment environment tag                   |
//! | [`origin`]                                 | resolved request origin                      |
//! | [`request_headers`]                        | headers of the inbound request               |
//! | [`run_task`]                               | start background work now                    |
//! | [`defer_task`]                             | start work after a successful response       |
//! | [`set_response_headers`]                   | queue a header mutation for the response     |
//!
//! Every accessor fails with [`ScopeError::Invalid`] outside a scope, and with
//! [`ScopeError::Unsupported`] when the deployment's context factory did not
//! provide what it needs.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::error::HandlerError;
use crate::http::{Headers, Request, Response};

pub mod headers;
pub mod tasks;

pub use headers::{HeaderRecord, HeaderUpdate, HeaderValues, set_response_headers};
pub use tasks::{defer_task, run_task};

tokio::task_local! {
    static CURRENT: Arc<RequestContext>;
    static AMBIENT_ORIGIN: Option<String>;
}

/// A background unit of work handed to the host.
pub type BackgroundTask = BoxFuture<'static, anyhow::Result<()>>;

/// The host's "keep running until this settles" primitive.
///
/// The response is not held up by tasks registered here; the host only
/// promises not to tear down the execution environment before they finish.
pub trait WaitUntil: Send + Sync {
    fn wait_until(&self, task: BackgroundTask);
}

impl<F> WaitUntil for F
where
    F: Fn(BackgroundTask) + Send + Sync,
{
    fn wait_until(&self, task: BackgroundTask) {
        self(task)
    }
}

/// Misuse of the request-scoped API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// Called with no request scope active.
    #[error("Invalid server runtime API call")]
    Invalid,

    /// Called inside a scope whose context factory does not provide the named capability.
    #[error("Unsupported server runtime API call")]
    Unsupported(&'static str),
}

impl From<ScopeError> for HandlerError {
    fn from(error: ScopeError) -> Self {
        Self::other(error)
    }
}

/// What a deployment's context factory provides for one request.
///
/// Fields left as `None` make the corresponding accessor fail with
/// [`ScopeError::Unsupported`].
#[derive(Clone, Default)]
pub struct ScopeInit {
    pub origin: Option<String>,
    pub environment: Option<String>,
    pub wait_until: Option<Arc<dyn WaitUntil>>,
}

impl ScopeInit {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    #[must_use]
    pub fn wait_until(mut self, wait_until: Arc<dyn WaitUntil>) -> Self {
        self.wait_until = Some(wait_until);
        self
    }
}

impl fmt::Debug for ScopeInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeInit")
            .field("origin", &self.origin)
            .field("environment", &self.environment)
            .field("wait_until", &self.wait_until.is_some())
            .finish()
    }
}

type DeferredTask = Box<dyn FnOnce() -> BackgroundTask + Send>;

/// Where deferred work goes, depending on how far the request has got.
enum Deferred {
    /// The handler is still running.
    Queued(Vec<DeferredTask>),
    /// The response exists; new deferred work starts at once.
    Started,
    /// The handler failed; deferred work is refused.
    Discarded,
}

/// State owned by one in-flight request.
pub struct RequestContext {
    origin: Option<String>,
    environment: Option<String>,
    request_headers: Headers,
    wait_until: Option<Arc<dyn WaitUntil>>,
    deferred: Mutex<Deferred>,
    /// `None` once the response has been produced.
    header_updates: Mutex<Option<Vec<HeaderUpdate>>>,
}

impl RequestContext {
    fn new(init: ScopeInit, request_headers: Headers) -> Self {
        Self {
            origin: init.origin,
            environment: init.environment,
            request_headers,
            wait_until: init.wait_until,
            deferred: Mutex::new(Deferred::Queued(Vec::new())),
            header_updates: Mutex::new(Some(Vec::new())),
        }
    }

    fn wait_until(&self, api: &'static str) -> Result<Arc<dyn WaitUntil>, ScopeError> {
        self.wait_until.clone().ok_or(ScopeError::Unsupported(api))
    }

    /// Closes both queues and returns what was registered while the handler ran.
    fn settle(&self, next: Deferred) -> (Vec<HeaderUpdate>, Vec<DeferredTask>) {
        let updates = self.header_updates.lock().take().unwrap_or_default();
        let deferred = match std::mem::replace(&mut *self.deferred.lock(), next) {
            Deferred::Queued(tasks) => tasks,
            Deferred::Started | Deferred::Discarded => Vec::new(),
        };
        (updates, deferred)
    }

    /// Registers `task` with the host, keeping this context bound while it runs.
    fn submit(self: &Arc<Self>, wait_until: &dyn WaitUntil, task: BackgroundTask) {
        wait_until.wait_until(Box::pin(bind(Arc::clone(self), task)));
    }
}

/// Calls `f` with `context` (and its ambient mirror) bound.
fn enter<R>(context: &Arc<RequestContext>, f: impl FnOnce() -> R) -> R {
    let ambient = context.origin.clone();
    CURRENT.sync_scope(Arc::clone(context), || AMBIENT_ORIGIN.sync_scope(ambient, f))
}

/// Binds `context` (and its ambient mirror) to every poll of `future`.
fn bind<F: Future>(context: Arc<RequestContext>, future: F) -> impl Future<Output = F::Output> {
    let ambient = context.origin.clone();
    CURRENT.scope(context, AMBIENT_ORIGIN.scope(ambient, future))
}

/// Runs `f` against the active context.
pub(crate) fn with_context<R>(
    f: impl FnOnce(&Arc<RequestContext>) -> Result<R, ScopeError>,
) -> Result<R, ScopeError> {
    CURRENT.try_with(f).map_err(|_| ScopeError::Invalid)?
}

/// Returns the deployment environment tag.
///
/// # Errors
///
/// [`ScopeError::Invalid`] outside a scope; [`ScopeError::Unsupported`] if
/// the context factory provided no environment.
pub fn environment() -> Result<String, ScopeError> {
    with_context(|ctx| {
        ctx.environment
            .clone()
            .ok_or(ScopeError::Unsupported("environment"))
    })
}

/// Returns the resolved origin of the current request.
///
/// # Errors
///
/// [`ScopeError::Invalid`] outside a scope; [`ScopeError::Unsupported`] if
/// the context factory provided no origin.
pub fn origin() -> Result<String, ScopeError> {
    with_context(|ctx| ctx.origin.clone().ok_or(ScopeError::Unsupported("origin")))
}

/// Returns the headers of the inbound request.
///
/// # Errors
///
/// [`ScopeError::Invalid`] outside a scope.
pub fn request_headers() -> Result<Headers, ScopeError> {
    with_context(|ctx| Ok(ctx.request_headers.clone()))
}

/// The ambient origin global: the same value [`origin`] returns, readable
/// without the accessor's error handling. `None` outside a scope or when no
/// origin was resolved.
pub fn ambient_origin() -> Option<String> {
    AMBIENT_ORIGIN.try_with(Clone::clone).ok().flatten()
}

/// Creates the per-request context from the request and host-supplied extra.
pub type ContextFactory<E> = Arc<dyn Fn(&Request, &E) -> ScopeInit + Send + Sync>;

/// Binds a fresh context to each request it runs.
///
/// `E` is whatever extra per-request value the host passes alongside the
/// request (an execution context, platform bindings); it reaches both the
/// context factory and the handler.
///
/// # Examples
///
/// ```
/// use reqscope::http::{Request, Response, StatusCode};
/// use reqscope::scope::{self, RequestScope, ScopeInit};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let request_scope = RequestScope::new(|_req: &Request, _: &()| {
///     ScopeInit::new().environment("test").origin("https://test.local")
/// });
///
/// let response = request_scope
///     .run(
///         |_req, ()| async {
///             let tag = scope::environment().unwrap();
///             Ok(Response::text_body(StatusCode::OK, tag))
///         },
///         Request::get("/"),
///         (),
///     )
///     .await
///     .unwrap();
///
/// assert_eq!(response.text().unwrap(), "test");
/// # }
/// ```
pub struct RequestScope<E = ()> {
    factory: ContextFactory<E>,
}

impl<E> Clone for RequestScope<E> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<E> RequestScope<E> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&Request, &E) -> ScopeInit + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
        }
    }

    /// Runs `handler` with a context bound for its whole dynamic extent.
    ///
    /// On success, queued header mutations are applied to the response and
    /// then deferred tasks are started in registration order. On failure,
    /// deferred tasks are dropped without running and the error is
    /// translated: status errors and returned responses become the response.
    ///
    /// # Errors
    ///
    /// Unclassified handler failures ([`HandlerError::Other`]) are returned
    /// as-is for the host adapter to surface.
    pub async fn run<H, Fut>(
        &self,
        handler: H,
        request: Request,
        extra: E,
    ) -> Result<Response, anyhow::Error>
    where
        H: FnOnce(Request, E) -> Fut,
        Fut: Future<Output = Result<Response, HandlerError>>,
    {
        let init = (self.factory)(&request, &extra);
        let context = Arc::new(RequestContext::new(init, request.headers().clone()));

        // Build the handler future inside the scope too, so work done before
        // its first poll already sees the context.
        let handler_future = enter(&context, || handler(request, extra));
        let outcome = bind(Arc::clone(&context), handler_future).await;

        match outcome {
            Ok(response) => Ok(finish(&context, response)),
            Err(error) => {
                let (_, dropped) = context.settle(Deferred::Discarded);
                let dropped = dropped.len();
                if dropped > 0 {
                    debug!(dropped, "handler failed; deferred tasks discarded");
                }
                error.into_response()
            }
        }
    }
}

impl<E> fmt::Debug for RequestScope<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope").finish_non_exhaustive()
    }
}

/// Convenience constructor mirroring [`RequestScope::new`].
pub fn create_request_scope<E, F>(factory: F) -> RequestScope<E>
where
    F: Fn(&Request, &E) -> ScopeInit + Send + Sync + 'static,
{
    RequestScope::new(factory)
}

/// Success path: header mutations first, then deferred tasks.
fn finish(context: &Arc<RequestContext>, mut response: Response) -> Response {
    let (updates, deferred) = context.settle(Deferred::Started);
    for update in updates {
        update.apply(response.headers_mut());
    }

    if deferred.is_empty() {
        return response;
    }
    // `defer_task` refuses to queue without a host primitive.
    let Some(wait_until) = context.wait_until.clone() else {
        return response;
    };

    debug!(count = deferred.len(), "starting deferred tasks");
    for task in deferred {
        let future = enter(context, task);
        context.submit(wait_until.as_ref(), future);
    }
    response
}
