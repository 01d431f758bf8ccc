//! Host adapter: turns a request into a response for one deployment.
//!
//! [`RequestHandler`] is the call site that wires the pieces together. It
//! owns an [`Environment`] for the build output and a [`RequestScope`] whose
//! context factory is derived from the [`RuntimeConfig`], then dispatches
//! each request through the compiled routes manifest:
//!
//! 1. middleware, when installed, may answer the request outright;
//! 2. the first matching API route, by method export (405 when absent);
//! 3. the first matching HTML route, for `GET` and `HEAD`;
//! 4. the first matching not-found route, served with status 404;
//! 5. otherwise a plain 404.
//!
//! Redirect and rewrite entries are exposed on the manifest but not applied.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error};

use crate::background::BackgroundTasks;
use crate::config::RuntimeConfig;
use crate::environment::{
    Environment, EnvironmentError, Export, FsBackend, ImportCacheBackend, ModuleRegistry, Rendered,
    Route,
};
use crate::error::{HandlerError, StatusError};
use crate::http::{Method, Request, Response, StatusCode};
use crate::scope::{RequestScope, ScopeInit, WaitUntil};

/// Serves requests for one deployment.
///
/// `E` is the per-request extra the host passes in: `()` for a persistent
/// process, the platform's [`WaitUntil`] handle for an isolate.
pub struct RequestHandler<E = ()> {
    environment: Arc<Environment>,
    scope: RequestScope<E>,
}

impl<E> Clone for RequestHandler<E> {
    fn clone(&self) -> Self {
        Self {
            environment: Arc::clone(&self.environment),
            scope: self.scope.clone(),
        }
    }
}

impl RequestHandler<()> {
    /// A long-lived process serving `config.build_root` from disk.
    ///
    /// Background and deferred work is tracked by `tasks`; drain it on shutdown.
    pub fn persistent(
        config: &RuntimeConfig,
        modules: ModuleRegistry,
        tasks: Arc<BackgroundTasks>,
    ) -> Self {
        let backend = FsBackend::new(config.build_root.clone(), modules);
        let environment = Environment::with_manifest_path(Arc::new(backend), &config.manifest_path);
        let wait_until: Arc<dyn WaitUntil> = tasks;
        Self::build(environment, config, move |_| Some(Arc::clone(&wait_until)))
    }
}

impl RequestHandler<Arc<dyn WaitUntil>> {
    /// An ephemeral isolate whose resources are imports rooted at `config.build_root`.
    ///
    /// The host passes its own [`WaitUntil`] with every request.
    pub fn isolate(config: &RuntimeConfig, modules: ModuleRegistry) -> Self {
        let root = config.build_root.to_string_lossy();
        let backend = ImportCacheBackend::new(root, modules);
        let environment = Environment::with_manifest_path(Arc::new(backend), &config.manifest_path);
        Self::build(environment, config, |host| Some(Arc::clone(host)))
    }
}

impl<E: 'static> RequestHandler<E> {
    fn build<W>(environment: Environment, config: &RuntimeConfig, wait_until: W) -> Self
    where
        W: Fn(&E) -> Option<Arc<dyn WaitUntil>> + Send + Sync + 'static,
    {
        let tag = config.environment.clone();
        let fixed_origin = config.origin.clone();

        let scope = RequestScope::new(move |request: &Request, extra: &E| ScopeInit {
            origin: fixed_origin.clone().or_else(|| request_origin(request)),
            environment: tag.clone(),
            wait_until: wait_until(extra),
        });

        Self {
            environment: Arc::new(environment),
            scope,
        }
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    /// Handles one request. Never fails: unclassified errors are logged and
    /// answered with a 500.
    pub async fn handle(&self, request: Request, extra: E) -> Response {
        let method = request.method().clone();
        let path = request.path().to_owned();
        let environment = Arc::clone(&self.environment);

        match self
            .scope
            .run(
                move |request, _extra| dispatch(environment, request),
                request,
                extra,
            )
            .await
        {
            Ok(response) => {
                debug!(%method, %path, status = %response.status(), "request handled");
                response
            }
            Err(e) => {
                error!(%method, %path, error = %e, "unhandled error while serving request");
                Response::text_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}

/// The request's own origin, or one built from its `Host` header.
fn request_origin(request: &Request) -> Option<String> {
    request.origin().map(str::to_owned).or_else(|| {
        request
            .headers()
            .get("host")
            .map(|host| format!("http://{host}"))
    })
}

/// Classifies an environment failure. A status error raised by a renderer
/// or loader stays a status error.
fn classify(error: EnvironmentError) -> HandlerError {
    match error {
        EnvironmentError::Render(source) => match source.downcast::<StatusError>() {
            Ok(status) => HandlerError::Status(status),
            Err(source) => HandlerError::Other(source),
        },
        other => HandlerError::other(other),
    }
}

fn first_match<'a>(routes: &'a [Route], path: &str) -> Option<&'a Route> {
    routes.iter().find(|route| route.named_regex.is_match(path))
}

async fn dispatch(
    environment: Arc<Environment>,
    request: Request,
) -> Result<Response, HandlerError> {
    let manifest = environment.routes_manifest().await.map_err(classify)?;

    if let Some(info) = &manifest.middleware {
        if let Some(module) = environment.middleware(info).await.map_err(classify)? {
            match module.default_export() {
                Some(Export::Middleware(middleware)) => {
                    if let Some(response) = middleware(request.clone()).await? {
                        debug!(file = %info.file, "middleware answered the request");
                        return Ok(response);
                    }
                }
                Some(Export::Handler(handler)) => return handler(request).await,
                _ => {}
            }
        }
    }

    let path = request.path().to_owned();

    if let Some(route) = first_match(&manifest.api_routes, &path) {
        let Some(module) = environment.api_route(route).await.map_err(classify)? else {
            return Ok(not_found());
        };
        return match module.handler(request.method().as_str()) {
            Some(handler) => handler(request).await,
            None => Ok(Response::text_body(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed",
            )),
        };
    }

    let head = matches!(request.method(), Method::Head);

    if request.method().is_read() {
        if let Some(route) = first_match(&manifest.html_routes, &path) {
            let rendered = environment.html(&request, route).await.map_err(classify)?;
            if let Some(rendered) = rendered {
                return Ok(into_response(rendered, StatusCode::OK, head));
            }
        }
    }

    if let Some(route) = first_match(&manifest.not_found_routes, &path) {
        let rendered = environment.html(&request, route).await.map_err(classify)?;
        if let Some(rendered) = rendered {
            return Ok(into_response(rendered, StatusCode::NOT_FOUND, head));
        }
    }

    Ok(not_found())
}

/// A `HEAD` answer keeps the status and headers of the page but no body.
fn into_response(rendered: Rendered, status: StatusCode, head: bool) -> Response {
    let response = match rendered {
        Rendered::Html(html) => Response::html(status, html),
        Rendered::Response(response) => response,
    };
    if head {
        response.body_bytes(Bytes::new())
    } else {
        response
    }
}

fn not_found() -> Response {
    Response::text_body(StatusCode::NOT_FOUND, "Not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_falls_back_to_host_header() {
        let absolute = Request::get("https://a.test/x").with_header("Host", "ignored");
        assert_eq!(request_origin(&absolute).as_deref(), Some("https://a.test"));

        let relative = Request::get("/x").with_header("Host", "localhost:3000");
        assert_eq!(
            request_origin(&relative).as_deref(),
            Some("http://localhost:3000")
        );

        assert_eq!(request_origin(&Request::get("/x")), None);
    }

    #[test]
    fn head_answers_drop_the_body() {
        let page = into_response(Rendered::Html("<h1>hi</h1>".into()), StatusCode::OK, true);
        assert_eq!(page.status(), StatusCode::OK);
        assert!(page.body_ref().is_empty());
        assert_eq!(
            page.headers().get("content-type").as_deref(),
            Some("text/html; charset=utf-8")
        );

        let full = Response::text_body(StatusCode::NOT_FOUND, "gone");
        let custom = into_response(Rendered::Response(full), StatusCode::OK, true);
        assert_eq!(custom.status(), StatusCode::NOT_FOUND);
        assert!(custom.body_ref().is_empty());

        let get = into_response(Rendered::Html("<h1>hi</h1>".into()), StatusCode::OK, false);
        assert_eq!(get.text().unwrap(), "<h1>hi</h1>");
    }

    #[test]
    fn render_status_errors_stay_classified() {
        let status = StatusError::new(StatusCode::UNAUTHORIZED, "sign in");
        let classified = classify(EnvironmentError::Render(anyhow::Error::new(status)));
        let response = classified.into_response().unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let other = classify(EnvironmentError::ManifestMissing("routes.json".into()));
        assert!(matches!(other, HandlerError::Other(_)));
    }
}
