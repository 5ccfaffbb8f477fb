//! Body capture utilities.
//!
//! Two ways of copying a body are provided. [`capture_body`] reads a body into memory up front
//! and hands back a replacement that replays the same frames, so the downstream handler reads
//! exactly the request it would have read without the middleware. [`ObservedBody`] copies frames
//! on the side as they are polled, so a response keeps streaming to the client while it is
//! captured.

use axum::body::{Body, Bytes, HttpBody};
use axum::http::{header::TRANSFER_ENCODING, HeaderMap};
use bytes::BytesMut;
use futures::{stream, FutureExt};
use http_body::{Frame, SizeHint};
use http_body_util::{BodyExt, StreamBody};
use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tracing::{debug, warn};

/// Error type for body capture operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum BodyCaptureError {
    #[error("Body stream error: {0}")]
    StreamError(String),
}

/// How a body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Length known upfront, sent with `Content-Length`.
    Sized,
    /// Length unknown upfront, sent with `Transfer-Encoding: chunked` on HTTP/1.1.
    Chunked,
}

impl Framing {
    /// Determine the framing of a body from its message headers and size hint.
    ///
    /// An explicit `Transfer-Encoding: chunked` always wins. Otherwise a body without an exact
    /// size hint is streamed, which hyper frames as chunked.
    pub fn detect(headers: &HeaderMap, body: &Body) -> Self {
        if is_chunked(headers) || body.size_hint().exact().is_none() {
            Framing::Chunked
        } else {
            Framing::Sized
        }
    }
}

/// `chunked` must be the final transfer coding when present.
fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|coding| !coding.is_empty())
        .last()
        .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
}

/// What was read out of a body by [`capture_body`].
#[derive(Debug, Clone)]
pub struct Capture {
    framing: Framing,
    chunks: Vec<Bytes>,
    trailers: Option<HeaderMap>,
    error: Option<BodyCaptureError>,
}

impl Capture {
    fn empty(framing: Framing) -> Self {
        Self {
            framing,
            chunks: Vec::new(),
            trailers: None,
            error: None,
        }
    }

    fn record(&mut self, frame: &Frame<Bytes>) {
        if let Some(data) = frame.data_ref() {
            self.chunks.push(data.clone());
        } else if let Some(trailers) = frame.trailers_ref() {
            self.trailers
                .get_or_insert_with(HeaderMap::new)
                .extend(trailers.clone());
        }
    }

    /// Framing of the body the capture was taken from.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// The captured payload. Empty if reading the body failed.
    pub fn bytes(&self) -> Bytes {
        if self.error.is_some() {
            return Bytes::new();
        }
        concat(&self.chunks)
    }

    /// The captured payload as it travels on the wire: chunk-encoded for chunked bodies, the
    /// plain payload otherwise. Empty if reading the body failed.
    pub fn wire_bytes(&self) -> Bytes {
        match (self.framing, &self.error) {
            (_, Some(_)) => Bytes::new(),
            (Framing::Chunked, None) => encode_chunked(&self.chunks, self.trailers.as_ref()),
            (Framing::Sized, None) => concat(&self.chunks),
        }
    }

    /// Trailers received after the last data frame, if any.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// The read failure that cut the capture short, if any.
    pub fn error(&self) -> Option<&BodyCaptureError> {
        self.error.as_ref()
    }
}

/// Drains a body into memory and returns the capture together with a replacement body.
///
/// The replacement replays the original data frames with their original boundaries, followed
/// by any trailers. A [`Framing::Sized`] body is replaced by a full body carrying the same exact
/// size hint; a [`Framing::Chunked`] body is replaced by a stream without an exact size, so the
/// connection re-applies chunked framing exactly as it would have for the original.
///
/// A read error does not abort anything: the capture reports the error and an empty payload,
/// and the replacement replays the frames read so far before failing with the same message,
/// so the next reader observes the failure it would have observed anyway.
///
/// # Examples
///
/// ```rust
/// use peephole::body_wrapper::{capture_body, Framing};
/// use axum::body::Body;
/// use http_body_util::BodyExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (capture, body) = capture_body(Body::from("Hello, World!"), Framing::Sized).await;
/// assert_eq!(capture.bytes(), "Hello, World!");
///
/// // The replacement is still fully readable
/// let replayed = body.collect().await?.to_bytes();
/// assert_eq!(replayed, "Hello, World!");
/// # Ok(())
/// # }
/// ```
pub async fn capture_body(mut body: Body, framing: Framing) -> (Capture, Body) {
    if body.is_end_stream() {
        return (Capture::empty(framing), body);
    }

    let mut capture = Capture::empty(framing);
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => capture.record(&frame),
            Err(e) => {
                warn!(error = %e, "Stream error during body capture");
                capture.error = Some(BodyCaptureError::StreamError(e.to_string()));
                break;
            }
        }
    }

    debug!(
        chunks = capture.chunks.len(),
        framing = ?framing,
        failed = capture.error.is_some(),
        "Body captured"
    );

    let replacement = replay(&capture);
    (capture, replacement)
}

type Emission = Pin<Box<dyn Future<Output = ()> + Send>>;
type OnEnd = Box<dyn FnOnce(Capture) -> Emission + Send>;

/// A body that forwards every frame as soon as it is polled and keeps a copy on the side.
///
/// Nothing is buffered ahead of the reader, so the first frame reaches the client as soon as the
/// inner body yields it, and the size hint of the inner body is passed through unchanged, so the
/// connection frames the body exactly as it would have framed the original.
///
/// When the inner body ends or fails, `on_end` receives the capture. The future it returns is
/// driven to completion by the reader before the end of the body (or the error) is handed out.
/// A body dropped before its end still runs `on_end` with whatever was captured so far.
///
/// # Examples
///
/// ```rust
/// use peephole::body_wrapper::{Framing, ObservedBody};
/// use axum::body::Body;
/// use http_body_util::BodyExt;
/// use std::sync::{Arc, Mutex};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let seen = Arc::new(Mutex::new(None));
/// let slot = seen.clone();
/// let body = ObservedBody::new(Body::from("Hello, World!"), Framing::Sized, move |capture| {
///     async move { *slot.lock().unwrap() = Some(capture.bytes()) }
/// });
///
/// let forwarded = body.collect().await?.to_bytes();
/// assert_eq!(forwarded, "Hello, World!");
/// assert_eq!(seen.lock().unwrap().as_deref(), Some(&b"Hello, World!"[..]));
/// # Ok(())
/// # }
/// ```
pub struct ObservedBody {
    inner: Body,
    capture: Capture,
    on_end: Option<OnEnd>,
    emission: Option<Emission>,
    error: Option<axum::Error>,
    done: bool,
}

impl ObservedBody {
    /// Wrap `inner`, running `on_end` with the capture once it has been read through.
    pub fn new<F, Fut>(inner: Body, framing: Framing, on_end: F) -> Self
    where
        F: FnOnce(Capture) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner,
            capture: Capture::empty(framing),
            on_end: Some(Box::new(move |capture: Capture| -> Emission {
                Box::pin(on_end(capture))
            })),
            emission: None,
            error: None,
            done: false,
        }
    }

    fn end(&mut self, error: Option<axum::Error>) {
        self.error = error;
        match self.on_end.take() {
            Some(on_end) => {
                let framing = self.capture.framing;
                let capture = std::mem::replace(&mut self.capture, Capture::empty(framing));
                debug!(
                    chunks = capture.chunks.len(),
                    failed = capture.error.is_some(),
                    "Observed body finished"
                );
                self.emission = Some(on_end(capture));
            }
            None => self.done = true,
        }
    }
}

impl HttpBody for ObservedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let this = self.get_mut();
        loop {
            if let Some(emission) = this.emission.as_mut() {
                ready!(emission.as_mut().poll(cx));
                this.emission = None;
                this.done = true;
            }
            if this.done {
                return Poll::Ready(this.error.take().map(Err));
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    this.capture.record(&frame);
                    return Poll::Ready(Some(Ok(frame)));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Stream error during body capture");
                    this.capture.error = Some(BodyCaptureError::StreamError(e.to_string()));
                    this.end(Some(e));
                }
                None => this.end(None),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> SizeHint {
        if self.done {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}

impl Drop for ObservedBody {
    fn drop(&mut self) {
        if self.on_end.is_some() {
            debug!("Observed body dropped before its end");
            self.end(None);
        }
        // No task to hand the emission to: it gets one poll and is abandoned if still pending.
        if let Some(emission) = self.emission.take() {
            if emission.now_or_never().is_none() {
                warn!("Emission did not complete before the body was dropped");
            }
        }
    }
}

fn replay(capture: &Capture) -> Body {
    if capture.framing == Framing::Sized && capture.trailers.is_none() && capture.error.is_none()
    {
        return Body::from(concat(&capture.chunks));
    }

    let mut frames: Vec<Result<Frame<Bytes>, axum::Error>> = capture
        .chunks
        .iter()
        .cloned()
        .map(|chunk| Ok(Frame::data(chunk)))
        .collect();
    if let Some(trailers) = &capture.trailers {
        frames.push(Ok(Frame::trailers(trailers.clone())));
    }
    if let Some(error) = &capture.error {
        frames.push(Err(axum::Error::new(error.clone())));
    }

    Body::new(StreamBody::new(stream::iter(frames)))
}

fn concat(chunks: &[Bytes]) -> Bytes {
    match chunks {
        [] => Bytes::new(),
        [single] => single.clone(),
        _ => {
            let len = chunks.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(len);
            for chunk in chunks {
                buf.extend_from_slice(chunk);
            }
            buf.freeze()
        }
    }
}

/// Renders data chunks and optional trailers in HTTP/1.1 chunked transfer coding.
pub fn encode_chunked(chunks: &[Bytes], trailers: Option<&HeaderMap>) -> Bytes {
    let mut buf = BytesMut::new();
    // Zero-length chunks would terminate the body early.
    for chunk in chunks.iter().filter(|chunk| !chunk.is_empty()) {
        buf.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        buf.extend_from_slice(chunk);
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"0\r\n");
    if let Some(trailers) = trailers {
        for (name, value) in trailers {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use futures::StreamExt;
    use std::{
        convert::Infallible,
        sync::{Arc, Mutex},
    };

    fn streaming_body(chunks: &[&'static str]) -> Body {
        let chunks: Vec<_> = chunks
            .iter()
            .map(|chunk| Ok::<_, Infallible>(Bytes::from_static(chunk.as_bytes())))
            .collect();
        Body::from_stream(stream::iter(chunks))
    }

    async fn data_frames(mut body: Body) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame.unwrap().into_data() {
                frames.push(data);
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_sized_body_capture() {
        let body = Body::from("Hello, World!");
        let framing = Framing::detect(&HeaderMap::new(), &body);
        assert_eq!(framing, Framing::Sized);

        let (capture, replacement) = capture_body(body, framing).await;

        assert_eq!(capture.bytes(), "Hello, World!");
        assert!(capture.error().is_none());
        assert_eq!(replacement.size_hint().exact(), Some(13));
        let replayed = replacement.collect().await.unwrap().to_bytes();
        assert_eq!(replayed, "Hello, World!");
    }

    #[tokio::test]
    async fn test_streaming_body_keeps_chunk_boundaries() {
        let body = streaming_body(&["chunk1", "chunk2", "chunk3"]);
        let framing = Framing::detect(&HeaderMap::new(), &body);
        assert_eq!(framing, Framing::Chunked);

        let (capture, replacement) = capture_body(body, framing).await;

        assert_eq!(capture.bytes(), "chunk1chunk2chunk3");
        assert_eq!(replacement.size_hint().exact(), None);
        assert_eq!(
            data_frames(replacement).await,
            vec!["chunk1", "chunk2", "chunk3"]
        );
    }

    #[tokio::test]
    async fn test_transfer_encoding_header_forces_chunked() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip, chunked"));
        let body = Body::from("payload");

        let framing = Framing::detect(&headers, &body);
        assert_eq!(framing, Framing::Chunked);

        let (capture, replacement) = capture_body(body, framing).await;
        assert_eq!(capture.bytes(), "payload");
        assert_eq!(replacement.size_hint().exact(), None);
        assert_eq!(data_frames(replacement).await, vec!["payload"]);
    }

    #[test]
    fn test_chunked_must_be_last_coding() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked, gzip"));
        assert!(!is_chunked(&headers));

        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("Chunked"));
        assert!(is_chunked(&headers));
    }

    #[tokio::test]
    async fn test_empty_body_is_left_untouched() {
        let (capture, replacement) = capture_body(Body::empty(), Framing::Sized).await;

        assert!(capture.bytes().is_empty());
        assert!(capture.error().is_none());
        assert!(replacement.is_end_stream());
    }

    #[tokio::test]
    async fn test_large_body_capture() {
        let large = "x".repeat(256 * 1024);
        let (capture, replacement) =
            capture_body(Body::from(large.clone()), Framing::Sized).await;

        assert_eq!(capture.bytes().len(), large.len());
        let replayed = replacement.collect().await.unwrap().to_bytes();
        assert_eq!(replayed, large);
    }

    #[tokio::test]
    async fn test_read_error_is_replayed() {
        let body = Body::from_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ]));

        let (capture, mut replacement) = capture_body(body, Framing::Chunked).await;

        assert!(capture.bytes().is_empty());
        assert!(capture.wire_bytes().is_empty());
        let error = capture.error().expect("capture should record the failure");
        assert!(error.to_string().contains("connection reset"));

        let first = replacement.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), "partial");
        let second = replacement.frame().await.unwrap();
        assert!(second.unwrap_err().to_string().contains("connection reset"));
    }

    #[test]
    fn test_encode_chunked() {
        let chunks = vec![Bytes::from("ab"), Bytes::new(), Bytes::from("0123456789abcdef")];
        assert_eq!(
            encode_chunked(&chunks, None),
            "2\r\nab\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n"
        );

        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("abc"));
        assert_eq!(
            encode_chunked(&[Bytes::from("hi")], Some(&trailers)),
            "2\r\nhi\r\n0\r\nx-checksum: abc\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_wire_bytes_follow_framing() {
        let (chunked, _) =
            capture_body(streaming_body(&["ab", "cde"]), Framing::Chunked).await;
        assert_eq!(chunked.wire_bytes(), "2\r\nab\r\n3\r\ncde\r\n0\r\n\r\n");
        assert_eq!(chunked.bytes(), "abcde");

        let (sized, _) = capture_body(Body::from("abcde"), Framing::Sized).await;
        assert_eq!(sized.wire_bytes(), "abcde");
    }

    type Slot = Arc<Mutex<Option<Capture>>>;

    fn observed(body: Body, framing: Framing) -> (ObservedBody, Slot) {
        let slot: Slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        let body = ObservedBody::new(body, framing, move |capture| async move {
            *sink.lock().unwrap() = Some(capture);
        });
        (body, slot)
    }

    #[tokio::test]
    async fn test_observed_body_forwards_before_end() {
        let stream = stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(b"event: 1\n\n"))])
            .chain(stream::pending());
        let (mut body, slot) = observed(Body::from_stream(stream), Framing::Chunked);

        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), "event: 1\n\n");
        assert!(!body.is_end_stream());
        assert!(slot.lock().unwrap().is_none());

        // Dropped mid-stream: whatever was forwarded so far is reported
        drop(body);
        let capture = slot.lock().unwrap().take().expect("capture on drop");
        assert_eq!(capture.bytes(), "event: 1\n\n");
    }

    #[tokio::test]
    async fn test_observed_body_reports_on_end() {
        let (body, slot) = observed(streaming_body(&["chunk1", "chunk2"]), Framing::Chunked);
        assert_eq!(body.size_hint().exact(), None);

        assert_eq!(data_frames(Body::new(body)).await, vec!["chunk1", "chunk2"]);

        let capture = slot.lock().unwrap().take().expect("capture on end");
        assert_eq!(capture.bytes(), "chunk1chunk2");
        assert_eq!(capture.framing(), Framing::Chunked);
    }

    #[tokio::test]
    async fn test_observed_body_keeps_size_hint() {
        let (body, slot) = observed(Body::from("Hello, World!"), Framing::Sized);
        assert_eq!(body.size_hint().exact(), Some(13));

        let forwarded = body.collect().await.unwrap().to_bytes();
        assert_eq!(forwarded, "Hello, World!");
        assert_eq!(slot.lock().unwrap().as_ref().unwrap().bytes(), "Hello, World!");
    }

    #[tokio::test]
    async fn test_observed_body_passes_error_through() {
        let body = Body::from_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("upstream reset")),
        ]));
        let (mut body, slot) = observed(body, Framing::Chunked);

        assert_eq!(body.frame().await.unwrap().unwrap().into_data().unwrap(), "partial");
        let error = body.frame().await.unwrap().unwrap_err();
        assert!(error.to_string().contains("upstream reset"));
        assert!(body.frame().await.is_none());

        let capture = slot.lock().unwrap().take().expect("capture on error");
        assert!(capture.bytes().is_empty());
        assert!(capture.error().is_some());
    }
}
