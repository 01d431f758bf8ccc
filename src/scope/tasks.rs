//! Background and deferred work tied to the current request.
//!
//! - [`run_task`] starts now. Its side effects happen before the caller
//!   continues, but the response does not wait for it to finish.
//! - [`defer_task`] starts only after the handler has produced a response,
//!   and never starts if the handler fails.
//!
//! Both hand their futures to the host's [`WaitUntil`](super::WaitUntil)
//! primitive with the request context still bound.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;

use super::{Deferred, DeferredTask, ScopeError, enter, with_context};

/// Starts `task` immediately and registers its future with the host.
///
/// `task` is called before this function returns, so any synchronous work in
/// its body is visible to the caller right away. The returned future runs in
/// the background with the current context bound; its failure is reported to
/// the host, never to the request.
///
/// # Errors
///
/// [`ScopeError::Invalid`] outside a scope; [`ScopeError::Unsupported`] when
/// the host provides no background-completion primitive.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use reqscope::scope::run_task;
///
/// # fn handler(hits: Arc<AtomicUsize>) -> Result<(), reqscope::scope::ScopeError> {
/// run_task(move || {
///     hits.fetch_add(1, Ordering::SeqCst);
///     async { Ok(()) }
/// })?;
/// # Ok(())
/// # }
/// ```
pub fn run_task<F, Fut>(task: F) -> Result<(), ScopeError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let ctx = with_context(|ctx| Ok(Arc::clone(ctx)))?;
    let wait_until = ctx.wait_until("run_task")?;
    let future = task().boxed();
    ctx.submit(wait_until.as_ref(), future);
    Ok(())
}

/// Queues `task` to start once the handler has returned a response.
///
/// Deferred tasks start in registration order, after queued response header
/// mutations are applied. If the handler fails, they are dropped unrun.
/// Called from background work after the response exists, `task` starts
/// immediately.
///
/// # Errors
///
/// [`ScopeError::Invalid`] outside a scope; [`ScopeError::Unsupported`] when
/// the host provides no background-completion primitive, or when the
/// handler has already failed.
pub fn defer_task<F, Fut>(task: F) -> Result<(), ScopeError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let ctx = with_context(|ctx| Ok(Arc::clone(ctx)))?;
    let wait_until = ctx.wait_until("defer_task")?;
    let task: DeferredTask = Box::new(move || task().boxed());

    match &mut *ctx.deferred.lock() {
        Deferred::Queued(queue) => {
            queue.push(task);
            return Ok(());
        }
        Deferred::Discarded => return Err(ScopeError::Unsupported("defer_task")),
        Deferred::Started => {}
    }

    // Registered from background work after the response was produced.
    let future = enter(&ctx, task);
    ctx.submit(wait_until.as_ref(), future);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::error::StatusError;
    use crate::http::{Request, Response, StatusCode};
    use crate::scope::{
        BackgroundTask, HeaderRecord, RequestScope, ScopeInit, WaitUntil, environment,
        set_response_headers,
    };

    /// Collects everything handed to `wait_until` so tests can drive it.
    #[derive(Default)]
    struct Recorder {
        tasks: Mutex<Vec<BackgroundTask>>,
    }

    impl WaitUntil for Recorder {
        fn wait_until(&self, task: BackgroundTask) {
            self.tasks.lock().push(task);
        }
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.tasks.lock().len()
        }

        async fn drain(&self) -> Vec<anyhow::Result<()>> {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            futures::future::join_all(tasks).await
        }
    }

    fn scope_with(recorder: &Arc<Recorder>) -> RequestScope {
        let recorder = Arc::clone(recorder);
        RequestScope::new(move |_req, _: &()| {
            ScopeInit::new()
                .environment("test")
                .wait_until(recorder.clone())
        })
    }

    #[tokio::test]
    async fn run_task_executes_immediately() {
        let recorder = Arc::new(Recorder::default());
        let invoked = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&invoked);
        let observer = Arc::clone(&recorder);
        scope_with(&recorder)
            .run(
                move |_req, ()| async move {
                    let hits = Arc::clone(&inner);
                    run_task(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    })
                    .unwrap();
                    assert_eq!(inner.load(Ordering::SeqCst), 1);
                    assert_eq!(observer.count(), 1);
                    Ok(Response::new(StatusCode::OK))
                },
                Request::get("/"),
                (),
            )
            .await
            .unwrap();

        assert!(recorder.drain().await.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn background_future_keeps_the_context() {
        let recorder = Arc::new(Recorder::default());
        scope_with(&recorder)
            .run(
                |_req, ()| async {
                    run_task(|| async {
                        tokio::task::yield_now().await;
                        anyhow::ensure!(environment()? == "test");
                        Ok(())
                    })
                    .unwrap();
                    Ok(Response::new(StatusCode::OK))
                },
                Request::get("/"),
                (),
            )
            .await
            .unwrap();

        let results = recorder.drain().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[tokio::test]
    async fn background_failure_does_not_fail_the_request() {
        let recorder = Arc::new(Recorder::default());
        let response = scope_with(&recorder)
            .run(
                |_req, ()| async {
                    run_task(|| async { Err(anyhow::anyhow!("upstream down")) }).unwrap();
                    Ok(Response::new(StatusCode::ACCEPTED))
                },
                Request::get("/"),
                (),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let results = recorder.drain().await;
        assert_eq!(results[0].as_ref().unwrap_err().to_string(), "upstream down");
    }

    #[tokio::test]
    async fn deferred_runs_after_handler_in_order() {
        let recorder = Arc::new(Recorder::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&order);
        let observer = Arc::clone(&recorder);
        let response = scope_with(&recorder)
            .run(
                move |_req, ()| async move {
                    for n in 1..=2 {
                        let log = Arc::clone(&log);
                        defer_task(move || {
                            log.lock().push(n);
                            async { Ok(()) }
                        })
                        .unwrap();
                    }
                    assert!(log.lock().is_empty());
                    assert_eq!(observer.count(), 0);
                    Ok(Response::new(StatusCode::OK))
                },
                Request::get("/"),
                (),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*order.lock(), vec![1, 2]);
        assert_eq!(recorder.count(), 2);
        assert!(recorder.drain().await.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn deferred_is_dropped_when_handler_fails() {
        let recorder = Arc::new(Recorder::default());
        let invoked = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&invoked);
        let response = scope_with(&recorder)
            .run(
                move |_req, ()| async move {
                    defer_task(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    })
                    .unwrap();
                    Err(StatusError::new(StatusCode::IM_A_TEAPOT, "nope").into())
                },
                Request::get("/"),
                (),
            )
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 418);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test]
    async fn defer_from_background_work_starts_immediately() {
        let recorder = Arc::new(Recorder::default());
        let invoked = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&invoked);
        scope_with(&recorder)
            .run(
                move |_req, ()| async move {
                    run_task(move || async move {
                        tokio::task::yield_now().await;
                        defer_task(move || {
                            hits.fetch_add(1, Ordering::SeqCst);
                            async {
                                anyhow::ensure!(environment()? == "test");
                                Ok(())
                            }
                        })?;
                        Ok(())
                    })
                    .unwrap();
                    Ok(Response::new(StatusCode::OK))
                },
                Request::get("/"),
                (),
            )
            .await
            .unwrap();

        // The background task registers the deferred one while it runs.
        assert!(recorder.drain().await.iter().all(Result::is_ok));
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.count(), 1);
        assert!(recorder.drain().await.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn defer_after_failure_is_refused() {
        let recorder = Arc::new(Recorder::default());
        let outcome = Arc::new(Mutex::new(None));

        let seen = Arc::clone(&outcome);
        let response = scope_with(&recorder)
            .run(
                move |_req, ()| async move {
                    run_task(move || async move {
                        tokio::task::yield_now().await;
                        *seen.lock() = Some(defer_task(|| async { Ok(()) }));
                        Ok(())
                    })
                    .unwrap();
                    Err(StatusError::empty(StatusCode::CONFLICT).into())
                },
                Request::get("/"),
                (),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(recorder.drain().await.iter().all(Result::is_ok));
        assert_eq!(
            *outcome.lock(),
            Some(Err(ScopeError::Unsupported("defer_task")))
        );
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test]
    async fn headers_after_the_response_are_refused() {
        let recorder = Arc::new(Recorder::default());
        let outcome = Arc::new(Mutex::new(None));

        let seen = Arc::clone(&outcome);
        let response = scope_with(&recorder)
            .run(
                move |_req, ()| async move {
                    run_task(move || async move {
                        tokio::task::yield_now().await;
                        let late = HeaderRecord::new().entry("X-Late", "1");
                        *seen.lock() = Some(set_response_headers(late));
                        Ok(())
                    })
                    .unwrap();
                    Ok(Response::new(StatusCode::OK))
                },
                Request::get("/"),
                (),
            )
            .await
            .unwrap();

        assert!(recorder.drain().await.iter().all(Result::is_ok));
        assert_eq!(
            *outcome.lock(),
            Some(Err(ScopeError::Unsupported("set_response_headers")))
        );
        assert!(!response.headers().contains("x-late"));
    }

    #[tokio::test]
    async fn tasks_need_a_host_primitive() {
        let scope = RequestScope::new(|_req, _: &()| ScopeInit::new());
        scope
            .run(
                |_req, ()| async {
                    let ran = run_task(|| async { Ok(()) });
                    assert_eq!(ran, Err(ScopeError::Unsupported("run_task")));
                    let deferred = defer_task(|| async { Ok(()) });
                    assert_eq!(deferred, Err(ScopeError::Unsupported("defer_task")));
                    Ok(Response::new(StatusCode::OK))
                },
                Request::get("/"),
                (),
            )
            .await
            .unwrap();
    }

    #[test]
    fn tasks_outside_scope_are_invalid() {
        assert_eq!(run_task(|| async { Ok(()) }), Err(ScopeError::Invalid));
        assert_eq!(defer_task(|| async { Ok(()) }), Err(ScopeError::Invalid));
    }
}
