//! # reqscope
//!
//! A request-scoped execution runtime for serving compiled web route manifests.
//!
//! Every inbound request runs inside its own ambient context, so handler code
//! anywhere in the call graph can read the deployment environment and origin,
//! register background or deferred work, and queue response header changes
//! without threading a context parameter through every call.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use reqscope::adapter::RequestHandler;
//! use reqscope::background::BackgroundTasks;
//! use reqscope::config::RuntimeConfig;
//! use reqscope::environment::{Module, ModuleRegistry};
//! use reqscope::http::{Request, Response, StatusCode};
//! use reqscope::scope;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::from_env()?;
//!
//!     let mut modules = ModuleRegistry::new();
//!     modules.insert(
//!         "api/hello.js",
//!         Module::new().with_handler("GET", |_req| async {
//!             let origin = scope::origin().unwrap_or_default();
//!             Ok(Response::text_body(StatusCode::OK, format!("hello from {origin}")))
//!         }),
//!     );
//!
//!     let tasks = Arc::new(BackgroundTasks::new());
//!     let handler = RequestHandler::persistent(&config, modules, Arc::clone(&tasks));
//!
//!     let response = handler.handle(Request::get("http://localhost/api/hello"), ()).await;
//!     println!("{} {}", response.status(), response.text()?);
//!
//!     tasks.drain().await;
//!     Ok(())
//! }
//! ```

// ── Request-scoped runtime ────────────────────────────────────────────────────
pub mod environment;
pub mod error;
pub mod http;
pub mod scope;

// ── Host integration ──────────────────────────────────────────────────────────
pub mod adapter;
pub mod background;
pub mod config;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use adapter::RequestHandler;
pub use environment::{Environment, EnvironmentError};
pub use error::{HandlerError, StatusError};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use scope::{RequestScope, ScopeError, ScopeInit, create_request_scope};
