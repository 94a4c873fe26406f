//! Server-sent event streams.
//!
//! Every call of a stream route yields its own [`StreamHandle`]; nothing is
//! shared between calls. Handlers can only be attached while the stream is
//! live, and `close` (or the server ending the stream) drops them.

use crate::body::UploadBody;
use crate::error::ApiError;
use crate::response::ResponseBody;
use crate::transport::HttpTransport;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use http::header::{ACCEPT, CACHE_CONTROL, HeaderMap, HeaderValue};
use http::{Method, Request};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Event name used when the server does not send an `event:` field.
pub const DEFAULT_EVENT: &str = "message";

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    /// `data:` lines joined with `\n`
    pub data: String,
    /// Last event ID in effect when this event was dispatched
    pub id: Option<String>,
    /// Reconnection time requested by the server
    pub retry: Option<Duration>,
}

impl SseEvent {
    /// # Errors
    /// Returns `ApiError::Json` if `data` is not valid JSON for `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Accepts arbitrary chunk boundaries and LF, CRLF or CR line endings.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    pending_cr: bool,
    event: Option<String>,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Feed one chunk; returns the events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut events),
                b'\r' => {
                    self.pending_cr = true;
                    self.end_line(&mut events);
                }
                other => self.line.push(other),
            }
        }
        events
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        let line = std::mem::take(&mut self.line);
        let line = String::from_utf8_lossy(&line);
        if line.is_empty() {
            if let Some(event) = self.dispatch() {
                events.push(event);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_owned()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if !std::mem::take(&mut self.has_data) {
            self.data.clear();
            return None;
        }
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_owned()),
            data: std::mem::take(&mut self.data),
            id: self.last_event_id.clone(),
            retry: self.retry,
        })
    }
}

pin_project! {
    /// Decoded events of a streaming response body.
    ///
    /// An event left incomplete when the body ends is discarded.
    pub struct EventStream {
        #[pin]
        body: ResponseBody,
        decoder: SseDecoder,
        pending: VecDeque<SseEvent>,
        done: bool,
    }
}

impl EventStream {
    #[must_use]
    pub fn new(body: ResponseBody) -> Self {
        Self {
            body,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl Stream for EventStream {
    type Item = Result<SseEvent, ApiError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if *this.done {
                return Poll::Ready(None);
            }
            match http_body::Body::poll_frame(this.body.as_mut(), cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        this.pending.extend(this.decoder.feed(&data));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(ApiError::Network(e))));
                }
                Poll::Ready(None) => *this.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("pending", &self.pending.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

pub type StreamHandler = Arc<dyn Fn(&SseEvent) + Send + Sync>;

/// Handle returned by [`StreamHandle::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandlerId(u64);

impl StreamHandlerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        StreamHandlerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Live stream of a [`StreamHandle`], as returned by [`StreamHandle::event`].
#[derive(Debug, Clone)]
pub struct LiveStream {
    url: Url,
    generation: u64,
    cancel: CancellationToken,
    last_event_id: Arc<Mutex<Option<String>>>,
}

impl LiveStream {
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// ID of the most recent event that carried one.
    #[must_use]
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id.lock().clone()
    }
}

#[derive(Default)]
struct StreamState {
    live: Mutex<Option<LiveStream>>,
    handlers: DashMap<String, Vec<(StreamHandlerId, StreamHandler)>>,
}

impl StreamState {
    fn dispatch(&self, event: &SseEvent) {
        let handlers: Vec<StreamHandler> = self
            .handlers
            .get(&event.event)
            .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        tracing::trace!(event = %event.event, handlers = handlers.len(), "stream event");
        for handler in handlers {
            handler(event);
        }
    }

    /// Drop the live stream and its handlers unless a newer connect replaced it.
    fn release(&self, generation: u64) {
        let mut live = self.live.lock();
        if live
            .as_ref()
            .is_some_and(|current| current.generation == generation)
        {
            *live = None;
            drop(live);
            self.handlers.clear();
        }
    }
}

/// One-way event stream bound to a fully resolved URL.
pub struct StreamHandle {
    url: Url,
    headers: HeaderMap,
    timeout: Duration,
    transport: HttpTransport,
    state: Arc<StreamState>,
    generations: AtomicU64,
    connect_gate: tokio::sync::Mutex<()>,
}

impl StreamHandle {
    pub(crate) fn new(
        url: Url,
        headers: HeaderMap,
        timeout: Duration,
        transport: HttpTransport,
    ) -> Self {
        Self {
            url,
            headers,
            timeout,
            transport,
            state: Arc::new(StreamState::default()),
            generations: AtomicU64::new(0),
            connect_gate: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Open the stream; no-op while it is live.
    ///
    /// # Errors
    /// Returns `ApiError::Timeout` if no response arrives within the call
    /// timeout, `ApiError::Network` for transport failures or a non-2xx status.
    pub async fn connect(&self) -> Result<(), ApiError> {
        let _gate = self.connect_gate.lock().await;
        if self.event().is_some() {
            return Ok(());
        }

        let mut request = Request::builder()
            .method(Method::GET)
            .uri(self.url.as_str())
            .body(UploadBody::empty())?;
        *request.headers_mut() = self.headers.clone();
        request
            .headers_mut()
            .insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        request
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let response = tokio::time::timeout(self.timeout, self.transport.send(request))
            .await
            .map_err(|_| ApiError::Timeout(self.timeout))??;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Network(
                format!("event stream rejected with status {status}").into(),
            ));
        }

        let live = LiveStream {
            url: self.url.clone(),
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
            last_event_id: Arc::new(Mutex::new(None)),
        };
        *self.state.live.lock() = Some(live.clone());
        tracing::debug!(url = %self.url, "event stream connected");

        tokio::spawn(read_events(
            Arc::clone(&self.state),
            live,
            EventStream::new(response.into_body()),
        ));
        Ok(())
    }

    /// The live stream, or `None` before `connect` and after close.
    #[must_use]
    pub fn event(&self) -> Option<LiveStream> {
        self.state
            .live
            .lock()
            .as_ref()
            .filter(|live| live.is_open())
            .cloned()
    }

    /// Attach `handler` to events named `event`.
    ///
    /// Returns `None`, attaching nothing, when the stream is not live.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(&SseEvent) + Send + Sync + 'static,
    ) -> Option<StreamHandlerId> {
        if self.event().is_none() {
            tracing::debug!(url = %self.url, event, "stream not connected; handler ignored");
            return None;
        }
        let id = StreamHandlerId::next();
        self.state
            .handlers
            .entry(event.to_owned())
            .or_default()
            .push((id, Arc::new(handler)));
        Some(id)
    }

    /// Detach a handler; returns whether it was attached.
    pub fn off(&self, event: &str, id: StreamHandlerId) -> bool {
        let removed = match self.state.handlers.get_mut(event) {
            Some(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(entry, _)| *entry != id);
                handlers.len() != before
            }
            None => false,
        };
        self.state
            .handlers
            .remove_if(event, |_, handlers| handlers.is_empty());
        removed
    }

    /// Tear down the stream and drop its handlers; no-op when not live.
    pub fn close(&self) {
        let live = self.state.live.lock().take();
        if let Some(live) = live {
            live.cancel.cancel();
            self.state.handlers.clear();
            tracing::debug!(url = %self.url, "event stream closed");
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("url", &self.url.as_str())
            .field("live", &self.event().is_some())
            .finish_non_exhaustive()
    }
}

async fn read_events(state: Arc<StreamState>, live: LiveStream, mut events: EventStream) {
    loop {
        let next = tokio::select! {
            () = live.cancel.cancelled() => break,
            next = events.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                if event.id.is_some() {
                    live.last_event_id.lock().clone_from(&event.id);
                }
                state.dispatch(&event);
            }
            Some(Err(e)) => {
                tracing::warn!(url = %live.url, error = %e, "event stream failed");
                state.dispatch(&SseEvent {
                    event: "error".to_owned(),
                    data: e.to_string(),
                    id: None,
                    retry: None,
                });
                break;
            }
            None => {
                tracing::debug!(url = %live.url, "event stream ended by server");
                break;
            }
        }
    }
    state.release(live.generation);
    live.cancel.cancel();
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_decoder_basic_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: update\ndata: {\"n\":1}\nid: 7\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "update".to_owned(),
                data: r#"{"n":1}"#.to_owned(),
                id: Some("7".to_owned()),
                retry: None,
            }]
        );
        assert_eq!(decoder.last_event_id(), Some("7"));
    }

    #[test]
    fn test_decoder_multiline_data_and_default_name() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: first\ndata: second\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, DEFAULT_EVENT);
        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn test_decoder_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: hel").is_empty());
        assert!(decoder.feed(b"lo\r").is_empty());
        let events = decoder.feed(b"\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_decoder_comments_retry_and_empty_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\n\nretry: 1500\nevent: ping\n\ndata\n\n");
        assert_eq!(events.len(), 1, "events without data are not dispatched");
        assert_eq!(events[0].data, "");
        assert_eq!(events[0].event, DEFAULT_EVENT);
        assert_eq!(events[0].retry, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_decoder_keeps_last_event_id() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"id: 1\ndata: a\n\ndata: b\n\n");
        assert_eq!(events[1].id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_event_stream_over_body() {
        use http_body_util::StreamBody;

        let chunks = vec![
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(http_body::Frame::data(
                Bytes::from_static(b"data: one\n\nda"),
            )),
            Ok(http_body::Frame::data(Bytes::from_static(b"ta: two\n\ndata: cut"))),
        ];
        let body: ResponseBody =
            http_body_util::BodyExt::boxed(StreamBody::new(futures_util::stream::iter(chunks)));

        let events: Vec<SseEvent> = EventStream::new(body)
            .map(Result::unwrap)
            .collect()
            .await;
        let data: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["one", "two"]);
    }

    struct ChannelBody(tokio::sync::mpsc::UnboundedReceiver<Bytes>);

    impl http_body::Body for ChannelBody {
        type Data = Bytes;
        type Error = Box<dyn std::error::Error + Send + Sync>;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Option<Result<http_body::Frame<Bytes>, Self::Error>>> {
            self.0
                .poll_recv(cx)
                .map(|chunk| chunk.map(|bytes| Ok(http_body::Frame::data(bytes))))
        }
    }

    fn stream_transport(
        status: http::StatusCode,
    ) -> (HttpTransport, tokio::sync::mpsc::UnboundedSender<Bytes>) {
        use http_body_util::BodyExt;
        use tower::ServiceExt;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let service = tower::service_fn(move |req: Request<UploadBody>| {
            let rx = rx.clone();
            async move {
                assert_eq!(req.headers()[ACCEPT], "text/event-stream");
                let body: ResponseBody = match rx.lock().take() {
                    Some(rx) => ChannelBody(rx).boxed(),
                    None => http_body_util::Empty::new()
                        .map_err(|never| match never {})
                        .boxed(),
                };
                Ok::<_, ApiError>(http::Response::builder().status(status).body(body).unwrap())
            }
        })
        .boxed_clone();
        (HttpTransport::from_service(service, 4), tx)
    }

    fn handle(transport: HttpTransport) -> StreamHandle {
        StreamHandle::new(
            Url::parse("https://api.example.com/events?room=1").unwrap(),
            HeaderMap::new(),
            Duration::from_secs(1),
            transport,
        )
    }

    #[tokio::test]
    async fn test_handlers_require_live_stream() {
        let (transport, tx) = stream_transport(http::StatusCode::OK);
        let stream = handle(transport);

        assert!(stream.event().is_none());
        assert!(stream.on("update", |_| {}).is_none());

        stream.connect().await.unwrap();
        let live = stream.event().unwrap();
        assert_eq!(live.url().query(), Some("room=1"));

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let id = stream
            .on("update", move |event| {
                seen_tx.send(event.data.clone()).unwrap();
            })
            .unwrap();

        tx.send(Bytes::from_static(b"event: update\nid: 42\ndata: {\"n\":1}\n\n"))
            .unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), r#"{"n":1}"#);
        assert_eq!(live.last_event_id().as_deref(), Some("42"));

        assert!(stream.off("update", id));
        assert!(!stream.off("update", id));

        stream.close();
        assert!(stream.event().is_none());
        assert!(!live.is_open());
    }

    #[tokio::test]
    async fn test_concurrent_connects_open_one_stream() {
        use http_body_util::BodyExt;
        use tower::ServiceExt;

        let requests = Arc::new(AtomicU64::new(0));
        let senders = Arc::new(Mutex::new(Vec::new()));
        let (count, keep) = (requests.clone(), senders.clone());
        let service = tower::service_fn(move |_req: Request<UploadBody>| {
            count.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
            keep.lock().push(tx);
            async move {
                tokio::task::yield_now().await;
                let body: ResponseBody = ChannelBody(rx).boxed();
                Ok::<_, ApiError>(http::Response::new(body))
            }
        })
        .boxed_clone();
        let stream = handle(HttpTransport::from_service(service, 4));

        let (first, second) = tokio::join!(stream.connect(), stream.connect());
        first.unwrap();
        second.unwrap();

        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert!(stream.event().is_some());
        assert_eq!(senders.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_server_end_releases_stream() {
        let (transport, tx) = stream_transport(http::StatusCode::OK);
        let stream = handle(transport);
        stream.connect().await.unwrap();
        let live = stream.event().unwrap();

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), live.cancel.cancelled())
            .await
            .unwrap();
        assert!(stream.event().is_none());
    }

    #[tokio::test]
    async fn test_rejected_status_fails_connect() {
        let (transport, _tx) = stream_transport(http::StatusCode::SERVICE_UNAVAILABLE);
        let stream = handle(transport);
        let err = stream.connect().await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
        assert!(err.to_string().contains("503"));
        assert!(stream.event().is_none());
    }
}
