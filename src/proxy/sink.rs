use crate::proxy::context::BoxBody;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Frame;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// Client-side writer for one response: status line and headers first, then
/// body chunks, with explicit flush points. The pipeline is the only writer;
/// implementations need not be re-entrant.
#[async_trait]
pub trait ResponseSink: Send {
    /// Write status and headers. Called at most once, before any chunk.
    async fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()>;

    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Push buffered bytes to the client.
    async fn flush(&mut self) -> io::Result<()>;
}

/// Frames buffered between the pipeline task and the hyper connection task.
const CHANNEL_DEPTH: usize = 16;

/// Create a connected [`ChannelSink`] / [`ResponseReceiver`] pair.
///
/// The sink side is handed to an engine; the receiver side turns into a
/// `hyper::Response` for the server connection. Dropping the sink ends the
/// body stream, which is how mid-stream failures terminate the connection
/// without retracting already-delivered bytes.
pub fn response_channel() -> (ChannelSink, ResponseReceiver) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(CHANNEL_DEPTH);
    (
        ChannelSink {
            head_tx: Some(head_tx),
            body_tx,
        },
        ResponseReceiver { head_rx, body_rx },
    )
}

/// [`ResponseSink`] that bridges into a hyper server: the head goes over a
/// oneshot, body chunks go over a bounded frame channel, and hyper's own
/// per-frame write behavior makes `flush` a no-op.
pub struct ChannelSink {
    head_tx: Option<oneshot::Sender<(StatusCode, HeaderMap)>>,
    body_tx: mpsc::Sender<Frame<Bytes>>,
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()> {
        let tx = self
            .head_tx
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "response head already sent"))?;
        tx.send((status, headers))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.body_tx
            .send(Frame::data(chunk))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Receiver half of [`response_channel`].
pub struct ResponseReceiver {
    head_rx: oneshot::Receiver<(StatusCode, HeaderMap)>,
    body_rx: mpsc::Receiver<Frame<Bytes>>,
}

impl ResponseReceiver {
    /// Wait for the response head and assemble the streaming response. When
    /// the sink is dropped before a head is sent, the caller gets a bare
    /// 502.
    pub async fn into_response(self) -> Response<BoxBody> {
        let body = ChannelBody { rx: self.body_rx };
        match self.head_rx.await {
            Ok((status, headers)) => {
                let mut response = Response::new(body.boxed());
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(_) => {
                let mut response = Response::new(crate::proxy::context::empty_body());
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }
}

/// Body implementation draining the frame channel. Ends cleanly when the
/// sink side is dropped.
struct ChannelBody {
    rx: mpsc::Receiver<Frame<Bytes>>,
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
