//! Distributed-trace and logging context.
//!
//! Downstream calls finish on the connection's task, which has no ambient
//! context of its own. The context is captured once per call as a
//! [`CallContext`] and re-installed around every log line and callback for
//! the rest of the call.
//!
//! The trace span stack is thread-local, and is only ever installed for the
//! duration of a synchronous closure via [`CallContext::in_scope`], so it is
//! never held across an `.await`.

use std::cell::RefCell;
use std::fmt;
use std::time::Instant;

use http::header::{HeaderName, HeaderValue};

/// Trace id header.
pub const TRACE_ID: HeaderName = HeaderName::from_static("x-b3-traceid");
/// Span id header.
pub const SPAN_ID: HeaderName = HeaderName::from_static("x-b3-spanid");
/// Parent span id header.
pub const PARENT_SPAN_ID: HeaderName = HeaderName::from_static("x-b3-parentspanid");
/// Span name header.
pub const SPAN_NAME: HeaderName = HeaderName::from_static("x-b3-spanname");
/// Sampled flag header.
pub const TRACE_SAMPLED: HeaderName = HeaderName::from_static("x-b3-sampled");

thread_local! {
    static SPAN_STACK: RefCell<Option<SpanStack>> = const { RefCell::new(None) };
}

/// One node in a distributed trace.
#[derive(Debug, Clone)]
pub struct TraceSpan {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    span_name: String,
    sampled: bool,
    started: Instant,
}

impl TraceSpan {
    fn root(name: String) -> Self {
        Self {
            trace_id: new_id(),
            span_id: new_id(),
            parent_span_id: None,
            span_name: name,
            sampled: true,
            started: Instant::now(),
        }
    }

    fn child(&self, name: String) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_id(),
            parent_span_id: Some(self.span_id.clone()),
            span_name: name,
            sampled: self.sampled,
            started: Instant::now(),
        }
    }

    /// The trace this span belongs to.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// This span's id.
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// The parent span's id, absent for root spans.
    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    /// The span's name.
    pub fn span_name(&self) -> &str {
        &self.span_name
    }

    /// Whether this trace is sampled.
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Stamp the standard propagation headers onto `headers`.
    ///
    /// Values which are absent or not valid header values are left unset.
    pub fn propagate(&self, headers: &mut http::HeaderMap) {
        let sampled = if self.sampled { "true" } else { "false" };
        set_header_if_present(headers, TRACE_SAMPLED, Some(sampled));
        set_header_if_present(headers, TRACE_ID, Some(&self.trace_id));
        set_header_if_present(headers, SPAN_ID, Some(&self.span_id));
        set_header_if_present(headers, PARENT_SPAN_ID, self.parent_span_id.as_deref());
        set_header_if_present(headers, SPAN_NAME, Some(&self.span_name));
    }

    fn complete(&self) {
        tracing::info!(
            target: "edgewire::span",
            trace_id = %self.trace_id,
            span_id = %self.span_id,
            parent_span_id = self.parent_span_id.as_deref().unwrap_or("-"),
            span_name = %self.span_name,
            sampled = self.sampled,
            duration_micros = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "span completed"
        );
    }
}

fn set_header_if_present(headers: &mut http::HeaderMap, name: HeaderName, value: Option<&str>) {
    if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(name, value);
    }
}

fn new_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// A stack of trace spans, innermost last.
#[derive(Debug, Clone, Default)]
pub struct SpanStack(Vec<TraceSpan>);

impl SpanStack {
    /// The innermost span.
    pub fn peek(&self) -> Option<&TraceSpan> {
        self.0.last()
    }

    /// Number of spans on the stack.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the stack holds no spans.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Operations on the current thread's trace span stack.
#[derive(Debug, Clone, Copy)]
pub struct Tracer {
    _priv: (),
}

impl Tracer {
    /// The innermost span on this thread, if any.
    pub fn current_span() -> Option<TraceSpan> {
        SPAN_STACK.with(|stack| stack.borrow().as_ref().and_then(|s| s.peek().cloned()))
    }

    /// A copy of this thread's span stack.
    pub fn current_span_stack_copy() -> Option<SpanStack> {
        SPAN_STACK.with(|stack| stack.borrow().clone())
    }

    /// Start a new trace on this thread, replacing any existing span stack.
    pub fn start_request_with_root_span(name: impl Into<String>) -> TraceSpan {
        let span = TraceSpan::root(name.into());
        SPAN_STACK.with(|stack| {
            *stack.borrow_mut() = Some(SpanStack(vec![span.clone()]));
        });
        span
    }

    /// Start a child of the current span. Starts a root span when there is no current span.
    pub fn start_sub_span(name: impl Into<String>) -> TraceSpan {
        let name = name.into();
        SPAN_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let spans = stack.get_or_insert_with(SpanStack::default);
            let span = match spans.peek() {
                Some(parent) => parent.child(name),
                None => TraceSpan::root(name),
            };
            spans.0.push(span.clone());
            span
        })
    }

    /// Complete the innermost span, leaving its parent current.
    pub fn complete_sub_span() {
        let completed = SPAN_STACK.with(|stack| stack.borrow_mut().as_mut().and_then(|s| s.0.pop()));
        match completed {
            Some(span) => span.complete(),
            None => tracing::debug!("complete_sub_span called with no span on this thread"),
        }
    }

    /// Complete every span on the stack and clear it from this thread.
    pub fn complete_request_span() {
        let completed = SPAN_STACK.with(|stack| stack.borrow_mut().take());
        match completed {
            Some(spans) => spans.0.iter().rev().for_each(TraceSpan::complete),
            None => tracing::debug!("complete_request_span called with no span on this thread"),
        }
    }

    /// Remove the span stack from this thread, returning it.
    pub fn unregister_from_thread() -> Option<SpanStack> {
        SPAN_STACK.with(|stack| stack.borrow_mut().take())
    }

    fn register(spans: Option<SpanStack>) -> Option<SpanStack> {
        SPAN_STACK.with(|stack| std::mem::replace(&mut *stack.borrow_mut(), spans))
    }
}

/// The trace span stack and logging span of one downstream call.
#[derive(Clone)]
pub struct CallContext {
    spans: Option<SpanStack>,
    span: tracing::Span,
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("trace", &self.spans.as_ref().and_then(SpanStack::peek).map(TraceSpan::trace_id))
            .field("span", &self.span.id())
            .finish()
    }
}

impl CallContext {
    /// Capture the current thread's span stack and the current logging span.
    pub fn capture() -> Self {
        Self {
            spans: Tracer::current_span_stack_copy(),
            span: tracing::Span::current(),
        }
    }

    /// Build a context from its parts.
    pub fn new(spans: Option<SpanStack>, span: tracing::Span) -> Self {
        Self { spans, span }
    }

    /// The captured span stack.
    pub fn spans(&self) -> Option<&SpanStack> {
        self.spans.as_ref()
    }

    /// The captured logging span.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Run `f` with this context installed on the current thread.
    ///
    /// Whatever context the thread had before is restored when `f` returns or unwinds.
    pub fn in_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ContextGuard::link(self);
        f()
    }
}

struct ContextGuard<'a> {
    previous: Option<Option<SpanStack>>,
    _entered: tracing::span::Entered<'a>,
}

impl<'a> ContextGuard<'a> {
    fn link(context: &'a CallContext) -> Self {
        let previous = Tracer::register(context.spans.clone());
        Self {
            previous: Some(previous),
            _entered: context.span.enter(),
        }
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            Tracer::register(previous);
        }
    }
}
