//! Task-local context store.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::Either;
use tokio::task::futures::TaskLocalFuture;
use tokio::task::JoinHandle;
use tracing::instrument::{Instrument, Instrumented};

use super::RequestContext;

tokio::task_local! {
    static CURRENT: Arc<RequestContext>;
}

/// Run `future` with `ctx` installed for its whole execution.
///
/// Nested calls shadow the outer context for the inner future only.
pub fn run_with_context<F>(
    ctx: impl Into<Arc<RequestContext>>,
    future: F,
) -> TaskLocalFuture<Arc<RequestContext>, F>
where
    F: Future,
{
    CURRENT.scope(ctx.into(), future)
}

/// Synchronous counterpart of [`run_with_context`].
pub fn with_context_sync<R>(ctx: impl Into<Arc<RequestContext>>, f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(ctx.into(), f)
}

/// The installed context, or `None` outside any scope.
pub fn current() -> Option<Arc<RequestContext>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Correlation id of the installed context.
pub fn correlation_id() -> Option<String> {
    CURRENT.try_with(|ctx| ctx.correlation_id().to_owned()).ok()
}

/// Spawn a task that observes the caller's context and `tracing` span.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future.in_current_context())
}

/// Future bound to a captured context and span.
pub type InContext<F> = Instrumented<Either<TaskLocalFuture<Arc<RequestContext>, F>, F>>;

/// Capture the current context into a future that runs elsewhere.
pub trait ContextExt: Future + Sized {
    /// Bind this future to the context and `tracing` span active right now.
    ///
    /// The span carries the request's log fields, so lines emitted by the
    /// continuation stay correlated. Without an active context only the span
    /// is carried.
    fn in_current_context(self) -> InContext<Self> {
        let span = tracing::Span::current();
        let future = match current() {
            Some(ctx) => Either::Left(CURRENT.scope(ctx, self)),
            None => Either::Right(self),
        };
        future.instrument(span)
    }
}

impl<F: Future> ContextExt for F {}
