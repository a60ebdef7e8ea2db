#![deny(warnings, rust_2018_idioms)]

use netra_cache::ExpiringCache;
use opentelemetry::{
    trace::{Span as _, SpanKind, Status, TraceContextExt, Tracer, TracerProvider as _},
    Context, KeyValue,
};
use opentelemetry_jaeger_propagator::Propagator as JaegerPropagator;
use opentelemetry_sdk::{trace as sdktrace, Resource};
use std::collections::HashSet;
use tracing::debug;

pub use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
pub use opentelemetry::trace::SpanContext;
pub use opentelemetry_sdk::trace::TracerProvider;

/// Whether a proxied flow enters or leaves the local service.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Header-to-tag and cookie-to-tag mappings applied to inbound spans.
#[derive(Clone, Debug, Default)]
pub struct TagMaps {
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
}

/// The tracing side of the HTTP interceptor.
///
/// Starts one span per proxied request (as a child of an extracted context
/// when the peer sent one, as a root otherwise), correlates inbound spans
/// with their outbound descendants through an expiring request-id map, and
/// injects Jaeger wire context into outbound requests.
pub struct Bridge {
    tracer: sdktrace::Tracer,
    propagator: JaegerPropagator,
    contexts: ExpiringCache<SpanContext>,
    tag_maps: TagMaps,
    ignored_paths: HashSet<String>,
}

/// An open span for one in-flight proxied request.
#[derive(Debug)]
pub struct RequestSpan {
    span: sdktrace::Span,
}

/// Builds the tracer provider for the given service name.
///
/// Exporter wiring (`JAEGER_*`) belongs to the exporter library and is out
/// of scope here; the provider carries the service resource so any exporter
/// installed by the operator reports under the right name.
pub fn init(service_name: &str) -> sdktrace::TracerProvider {
    sdktrace::TracerProvider::builder()
        .with_config(sdktrace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
        ])))
        .build()
}

// === impl Direction ===

impl Direction {
    fn span_kind(self) -> SpanKind {
        match self {
            Direction::Inbound => SpanKind::Server,
            Direction::Outbound => SpanKind::Client,
        }
    }
}

// === impl Bridge ===

impl Bridge {
    pub fn new(
        provider: &sdktrace::TracerProvider,
        contexts: ExpiringCache<SpanContext>,
        tag_maps: TagMaps,
        ignored_paths: HashSet<String>,
    ) -> Self {
        Self {
            tracer: provider.tracer("netra"),
            propagator: JaegerPropagator::new(),
            contexts,
            tag_maps,
            ignored_paths,
        }
    }

    /// Returns true when no span should be emitted for `path`.
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignored_paths.contains(path)
    }

    /// Starts the span for a request whose headers are visible through
    /// `carrier`.
    ///
    /// When the peer supplied a valid trace context the span is its child;
    /// extraction failure degrades to a root span and never fails the
    /// request.
    pub fn start_request(
        &self,
        direction: Direction,
        operation: String,
        carrier: &dyn Extractor,
    ) -> RequestSpan {
        let parent = self.propagator.extract(carrier);
        let builder = self
            .tracer
            .span_builder(operation)
            .with_kind(direction.span_kind());
        let span = if parent.span().span_context().is_valid() {
            builder.start_with_context(&self.tracer, &parent)
        } else {
            builder.start(&self.tracer)
        };
        RequestSpan { span }
    }

    /// Records the span context owning `request_id` so later outbound calls
    /// carrying the same id can join the trace.
    pub fn store_context(&self, request_id: &str, context: SpanContext) {
        self.contexts.insert(request_id.to_string(), context);
    }

    pub fn stored_context(&self, request_id: &str) -> Option<SpanContext> {
        self.contexts.get(request_id)
    }

    /// Writes `context` into `carrier` in Jaeger wire form.
    pub fn inject_context(&self, context: SpanContext, carrier: &mut dyn Injector) {
        let cx = Context::new().with_remote_span_context(context);
        self.propagator.inject_context(&cx, carrier);
    }

    /// Applies the configured header/cookie→tag maps to an inbound span.
    pub fn apply_tag_maps<H, C>(&self, span: &mut RequestSpan, header: H, cookie: C)
    where
        H: Fn(&str) -> Option<String>,
        C: Fn(&str) -> Option<String>,
    {
        for (name, tag) in &self.tag_maps.headers {
            if let Some(value) = header(name) {
                span.set_tag(tag.clone(), value);
            }
        }
        for (name, tag) in &self.tag_maps.cookies {
            if let Some(value) = cookie(name) {
                span.set_tag(tag.clone(), value);
            }
        }
    }
}

// === impl RequestSpan ===

impl RequestSpan {
    pub fn context(&self) -> SpanContext {
        self.span.span_context().clone()
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: String) {
        self.span.set_attribute(KeyValue::new(key.into(), value));
    }

    pub fn set_tag_i64(&mut self, key: &'static str, value: i64) {
        self.span.set_attribute(KeyValue::new(key, value));
    }

    /// Marks the span failed (5xx response, or no response at all).
    pub fn set_error(&mut self) {
        self.span.set_attribute(KeyValue::new("error", true));
        self.span.set_status(Status::error("request failed"));
    }

    pub fn finish(mut self) {
        self.span.end();
    }

    /// Finishes the span for a request that never saw a response.
    pub fn finish_timeout(mut self) {
        debug!("Closing span without a response");
        self.span.set_attribute(KeyValue::new("timeout", true));
        self.set_error();
        self.span.end();
    }
}
