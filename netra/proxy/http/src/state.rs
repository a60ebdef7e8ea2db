use netra_metrics::SharedSink;
use netra_trace::RequestSpan;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

/// What the request path remembers about one in-flight request, for span
/// tags and metrics once its response lands.
#[derive(Clone, Debug)]
pub(crate) struct RequestMeta {
    pub method: String,
    pub host: String,
    pub path: String,
    pub user_agent: Option<String>,
    pub request_id: String,
    pub request_size: u64,
    pub start: Instant,
}

#[derive(Clone, Debug)]
pub(crate) struct ResponseMeta {
    pub status: u16,
    pub response_size: u64,
}

/// Per-connection interception state shared by the two direction loops.
///
/// The three queues pair pipelined requests with their responses: the
/// request loop pushes, the response loop pops one of each. At any instant
/// the spans queue holds exactly the in-flight requests.
pub(crate) struct ConnState {
    requests: Mutex<VecDeque<RequestMeta>>,
    responses: Mutex<VecDeque<ResponseMeta>>,
    spans: Mutex<VecDeque<Option<RequestSpan>>>,
    remote: SocketAddr,
}

// === impl ConnState ===

impl ConnState {
    pub(crate) fn new(remote: SocketAddr) -> Self {
        Self {
            requests: Mutex::new(VecDeque::new()),
            responses: Mutex::new(VecDeque::new()),
            spans: Mutex::new(VecDeque::new()),
            remote,
        }
    }

    pub(crate) fn push_request(&self, meta: RequestMeta, span: Option<RequestSpan>) {
        self.requests
            .lock()
            .expect("requests queue poisoned")
            .push_back(meta);
        self.spans
            .lock()
            .expect("spans queue poisoned")
            .push_back(span);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.spans.lock().expect("spans queue poisoned").len()
    }

    /// Pairs a completed response with the oldest in-flight request and
    /// finishes its span.
    pub(crate) fn complete(&self, response: ResponseMeta, metrics: &SharedSink) {
        self.responses
            .lock()
            .expect("responses queue poisoned")
            .push_back(response);

        let request = self
            .requests
            .lock()
            .expect("requests queue poisoned")
            .pop_front();
        let response = self
            .responses
            .lock()
            .expect("responses queue poisoned")
            .pop_front();
        let span = self
            .spans
            .lock()
            .expect("spans queue poisoned")
            .pop_front();

        let (request, response) = match (request, response) {
            (Some(req), Some(rsp)) => (req, rsp),
            _ => {
                // A response with no request on the books: the server spoke
                // early. Bytes were forwarded; there is no span to close.
                debug!("Response without a matching in-flight request");
                return;
            }
        };

        metrics.timing("http.request.duration", request.start.elapsed());
        if response.status >= 500 {
            metrics.incr("http.request.errors");
        }

        if let Some(Some(mut span)) = span {
            span.set_tag("remote_addr", self.remote.to_string());
            span.set_tag("http.host", request.host.clone());
            span.set_tag("http.path", request.path.clone());
            span.set_tag("http.method", request.method.clone());
            span.set_tag_i64("http.request_size", request.request_size as i64);
            span.set_tag_i64("http.response_size", response.response_size as i64);
            span.set_tag_i64("http.status_code", i64::from(response.status));
            if let Some(ua) = request.user_agent.clone() {
                span.set_tag("http.user_agent", ua);
            }
            span.set_tag("http.request_id", request.request_id.clone());
            if response.status >= 500 {
                span.set_error();
            }
            span.finish();
        }
    }

    /// Finishes every span still waiting for a response, marking each as
    /// timed out. Called at connection teardown; idempotent.
    pub(crate) fn drain(&self, metrics: &SharedSink) {
        loop {
            let request = self
                .requests
                .lock()
                .expect("requests queue poisoned")
                .pop_front();
            let span = self
                .spans
                .lock()
                .expect("spans queue poisoned")
                .pop_front();
            if request.is_none() && span.is_none() {
                return;
            }
            metrics.incr("http.request.unanswered");
            if let Some(Some(mut span)) = span {
                if let Some(req) = request {
                    span.set_tag("http.host", req.host);
                    span.set_tag("http.path", req.path);
                    span.set_tag("http.method", req.method);
                    span.set_tag_i64("http.request_size", req.request_size as i64);
                    span.set_tag("http.request_id", req.request_id);
                }
                span.set_tag("remote_addr", self.remote.to_string());
                span.finish_timeout();
            }
        }
    }
}
