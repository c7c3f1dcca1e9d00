use crate::buffer::{BufferPool, PooledBuf};
use crate::proxy::flush::FlushDecision;
use crate::proxy::sink::ResponseSink;
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use std::error::Error;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Keep draining the upstream after a client disconnect only when this many
/// bytes have already been streamed...
const DISCONNECT_BYTES_THRESHOLD: u64 = 1024;
/// ...and the last successful read is at most this old. Covers momentary
/// client reconnects in long LLM responses.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

const CAUSE_NONE: u8 = 0;
const CAUSE_CLIENT: u8 = 1;
const CAUSE_UPSTREAM: u8 = 2;

/// How one body copy ended, short of clean EOF.
#[derive(Debug)]
pub enum StreamError {
    /// The downstream client went away.
    ClientDisconnect,
    /// The upstream context was cancelled (response deadline).
    UpstreamCancelled,
    /// No chunk arrived within the read timeout.
    ReadTimeout,
    /// The upstream body failed mid-read.
    Read(Box<dyn Error + Send + Sync>),
    /// Writing or flushing to the client failed.
    Write(io::Error),
}

/// Result of streaming one response body.
#[derive(Debug)]
pub struct StreamOutcome {
    /// Bytes delivered (or staged for delivery) to the client. Reads
    /// discarded during the post-disconnect grace window do not count.
    pub bytes: u64,
    /// Delay from loop start until the first non-empty chunk.
    pub first_data: Option<Duration>,
    pub error: Option<StreamError>,
}

/// Merge the client and upstream cancellation sources into one token.
///
/// A monitor task observes both and records which side fired; the streaming
/// loop observes only the combined token, which keeps it linear. The monitor
/// is aborted when the merge is dropped.
struct MergedCancel {
    combined: CancellationToken,
    cause: Arc<AtomicU8>,
    monitor: tokio::task::JoinHandle<()>,
}

impl MergedCancel {
    fn new(client: CancellationToken, upstream: CancellationToken) -> Self {
        let combined = CancellationToken::new();
        let cause = Arc::new(AtomicU8::new(CAUSE_NONE));
        let monitor = {
            let combined = combined.clone();
            let cause = cause.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = client.cancelled() => cause.store(CAUSE_CLIENT, Ordering::Release),
                    _ = upstream.cancelled() => cause.store(CAUSE_UPSTREAM, Ordering::Release),
                }
                combined.cancel();
            })
        };
        Self {
            combined,
            cause,
            monitor,
        }
    }

    fn cause(&self) -> u8 {
        self.cause.load(Ordering::Acquire)
    }
}

impl Drop for MergedCancel {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

enum ReadEvent {
    Data(Bytes),
    Trailers,
    Eof,
    TimedOut,
    Failed(Box<dyn Error + Send + Sync>),
}

fn done(bytes: u64, first_data: Option<Duration>, error: Option<StreamError>) -> StreamOutcome {
    StreamOutcome {
        bytes,
        first_data,
        error,
    }
}

async fn read_frame<B>(body: &mut B, read_timeout: Option<Duration>) -> ReadEvent
where
    B: hyper::body::Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn Error + Send + Sync>>,
{
    let frame = match read_timeout {
        Some(t) => match tokio::time::timeout(t, body.frame()).await {
            Ok(frame) => frame,
            Err(_) => return ReadEvent::TimedOut,
        },
        None => body.frame().await,
    };
    match frame {
        None => ReadEvent::Eof,
        Some(Ok(frame)) => match frame.into_data() {
            Ok(data) => ReadEvent::Data(data),
            Err(_) => ReadEvent::Trailers,
        },
        Some(Err(e)) => ReadEvent::Failed(e.into()),
    }
}

/// Write out whatever the coalescing buffer holds. Copies out of the pooled
/// allocation so it stays reusable.
async fn emit<S>(sink: &mut S, buf: &mut BytesMut) -> io::Result<()>
where
    S: ResponseSink + ?Sized,
{
    if buf.is_empty() {
        return Ok(());
    }
    let chunk = Bytes::copy_from_slice(buf);
    buf.clear();
    sink.write_chunk(chunk).await
}

/// Stream an upstream body to the client chunk by chunk.
///
/// Two independent cancellation sources (client, upstream) are merged by a
/// monitor task; a read timeout bounds the gap between chunks so a stalled
/// backend cannot hold the connection forever. A slow client applies
/// backpressure naturally: the loop does not read ahead of its writes.
pub async fn stream_response<S, B>(
    client: &CancellationToken,
    upstream: &CancellationToken,
    sink: &mut S,
    body: B,
    read_timeout: Option<Duration>,
    pool: &BufferPool,
    buffer_size: usize,
    decision: FlushDecision,
) -> StreamOutcome
where
    S: ResponseSink + ?Sized,
    B: hyper::body::Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn Error + Send + Sync>>,
{
    let merged = MergedCancel::new(client.clone(), upstream.clone());
    let mut body = body;
    // Released back to the pool on every exit path via the guard's drop.
    let mut pooled = PooledBuf::new(pool, buffer_size);

    let started = Instant::now();
    let mut total: u64 = 0;
    let mut first_data: Option<Duration> = None;
    let mut last_read = Instant::now();
    let mut drain_deadline: Option<tokio::time::Instant> = None;

    loop {
        let draining = drain_deadline.is_some();
        let event = if let Some(deadline) = drain_deadline {
            // Client is gone; the drain ends at its deadline, on upstream
            // cancel, or when the body runs out.
            tokio::select! {
                biased;
                _ = upstream.cancelled() => None,
                _ = tokio::time::sleep_until(deadline) => None,
                ev = read_frame(&mut body, read_timeout) => Some(ev),
            }
        } else {
            tokio::select! {
                biased;
                _ = merged.combined.cancelled() => None,
                ev = read_frame(&mut body, read_timeout) => Some(ev),
            }
        };

        let event = match event {
            Some(ev) => ev,
            None => {
                if draining || merged.cause() != CAUSE_CLIENT {
                    let err = if draining {
                        StreamError::ClientDisconnect
                    } else {
                        StreamError::UpstreamCancelled
                    };
                    return done(total, first_data, Some(err));
                }
                // Client-side cancel: push any completed reads first.
                let _ = emit(sink, pooled.get_mut()).await;
                let _ = sink.flush().await;
                if total > DISCONNECT_BYTES_THRESHOLD && last_read.elapsed() < DISCONNECT_GRACE {
                    debug!(
                        bytes = total,
                        "client disconnected mid-stream, draining upstream for grace window"
                    );
                    drain_deadline = Some(tokio::time::Instant::now() + DISCONNECT_GRACE);
                    continue;
                }
                return done(total, first_data, Some(StreamError::ClientDisconnect));
            }
        };

        match event {
            ReadEvent::Data(data) => {
                if data.is_empty() {
                    continue;
                }
                last_read = Instant::now();
                if first_data.is_none() {
                    first_data = Some(started.elapsed());
                }
                if draining {
                    // Grace window reads are discarded; the client writer is
                    // never re-enabled.
                    continue;
                }
                total += data.len() as u64;
                match decision {
                    FlushDecision::Always => {
                        if let Err(e) = sink.write_chunk(data).await {
                            return done(total, first_data, Some(StreamError::Write(e)));
                        }
                        if let Err(e) = sink.flush().await {
                            return done(total, first_data, Some(StreamError::Write(e)));
                        }
                    }
                    FlushDecision::Never => {
                        let buf = pooled.get_mut();
                        buf.extend_from_slice(&data);
                        if buf.len() >= buffer_size {
                            if let Err(e) = emit(sink, buf).await {
                                return done(total, first_data, Some(StreamError::Write(e)));
                            }
                        }
                    }
                }
            }
            ReadEvent::Trailers => continue,
            ReadEvent::Eof => {
                if draining {
                    return done(total, first_data, Some(StreamError::ClientDisconnect));
                }
                if let Err(e) = emit(sink, pooled.get_mut()).await {
                    return done(total, first_data, Some(StreamError::Write(e)));
                }
                return done(total, first_data, None);
            }
            ReadEvent::TimedOut => {
                if draining {
                    return done(total, first_data, Some(StreamError::ClientDisconnect));
                }
                let _ = emit(sink, pooled.get_mut()).await;
                let _ = sink.flush().await;
                return done(total, first_data, Some(StreamError::ReadTimeout));
            }
            ReadEvent::Failed(e) => {
                if draining {
                    return done(total, first_data, Some(StreamError::ClientDisconnect));
                }
                let _ = emit(sink, pooled.get_mut()).await;
                return done(total, first_data, Some(StreamError::Read(e)));
            }
        }
    }
}
