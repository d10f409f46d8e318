//! Per-request logging context
//!
//! Every service call takes a `&RequestContext`; log lines emitted while
//! serving the call are attached to its span, so they carry the request id
//! without any global logger state.

use tracing::Span;
use uuid::Uuid;

/// Request id plus the tracing span the request's work runs under
#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: String,
    span: Span,
}

impl RequestContext {
    /// Context with a freshly generated request id
    #[must_use]
    pub fn new() -> Self {
        Self::with_request_id(Uuid::new_v4().simple().to_string())
    }

    /// Context for a request id assigned by the front end
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        let span = tracing::info_span!("request", request_id = %request_id);
        Self { request_id, span }
    }

    /// Context for background work (flush cycles, startup reconciliation)
    #[must_use]
    pub fn background(task: &'static str) -> Self {
        let request_id = format!("{task}-{}", Uuid::new_v4().simple());
        let span = tracing::info_span!("task", task, request_id = %request_id);
        Self { request_id, span }
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Span to instrument this request's futures with
    #[must_use]
    pub fn span(&self) -> Span {
        self.span.clone()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
