//! One client connection, end to end.
//!
//! A connection moves through
//! `AwaitRequest -> Parsed -> (CacheHit | Dialing) -> Forwarding | Tunneling -> Closed`,
//! and can drop to `Failed` from any non-terminal state. Nothing is retried.

use crate::cache::{CacheKey, ResponseCache};
use crate::config::Config;
use crate::dialer::{BoxedStream, UpstreamDialer};
use crate::error::ProxyError;
use crate::relay::{RelayStats, relay};
use crate::request::{ParsedRequest, RequestParser, find_header_end};
use crate::response::{self, CONNECT_ESTABLISHED, ResponseHead};
use crate::stats::ProxyStats;
use bytes::{Bytes, BytesMut};
use log::{debug, info, trace};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitRequest,
    Parsed,
    CacheHit,
    Dialing,
    Forwarding,
    Tunneling,
    Closed,
    Failed,
}

/// How a successfully handled connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    CacheHit { status: u16 },
    Forwarded { status: u16, cached: bool },
    Tunneled(RelayStats),
}

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub max_header_size: usize,
    pub max_response_size: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for HandlerSettings {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            max_header_size: config.max_header_size,
            max_response_size: config.max_response_size,
        }
    }
}

struct Session {
    state: ConnectionState,
}

impl Session {
    fn advance(&mut self, next: ConnectionState) {
        trace!("Connection state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

async fn within<F, T>(deadline: Option<Duration>, phase: &str, fut: F) -> Result<T, ProxyError>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => timeout(deadline, fut)
            .await
            .map_err(|_| ProxyError::Timeout(phase.to_string()))?
            .map_err(ProxyError::from),
        None => fut.await.map_err(ProxyError::from),
    }
}

/// Reads into `buf` until it holds a complete head.
///
/// Returns the offset just past the head terminator, or `None` when the peer
/// closed before one arrived. A head that grows past `max` is an error
/// produced by `too_large`.
async fn read_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max: usize,
    deadline: Option<Duration>,
    phase: &str,
    too_large: fn(String) -> ProxyError,
) -> Result<Option<usize>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut searched = 0;
    loop {
        // the terminator may straddle two reads
        if let Some(end) = find_header_end(&buf[searched..]) {
            return Ok(Some(searched + end));
        }
        searched = buf.len().saturating_sub(3);

        if buf.len() >= max {
            return Err(too_large(format!("{} exceeds {} bytes", phase, max)));
        }

        buf.reserve(READ_CHUNK);
        let n = within(deadline, phase, reader.read_buf(buf)).await?;
        if n == 0 {
            return Ok(None);
        }
    }
}

pub struct ConnectionHandler {
    parser: RequestParser,
    cache: Arc<ResponseCache>,
    dialer: Arc<dyn UpstreamDialer>,
    stats: Arc<ProxyStats>,
    settings: HandlerSettings,
}

impl ConnectionHandler {
    pub fn new(
        cache: Arc<ResponseCache>,
        dialer: Arc<dyn UpstreamDialer>,
        stats: Arc<ProxyStats>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            parser: RequestParser::new(),
            cache,
            dialer,
            stats,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Drives one client connection to completion. The client stream is
    /// closed when this returns, whatever the result.
    pub async fn handle<S>(&self, client: S) -> Result<Outcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = Session { state: ConnectionState::AwaitRequest };
        let result = self.run(client, &mut session).await;
        session.advance(if result.is_ok() { ConnectionState::Closed } else { ConnectionState::Failed });
        result
    }

    async fn run<S>(&self, mut client: S, session: &mut Session) -> Result<Outcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let head_end = match read_head(
            &mut client,
            &mut buf,
            self.settings.max_header_size,
            self.settings.read_timeout,
            "request head",
            ProxyError::InvalidRequest,
        )
        .await
        {
            Ok(Some(end)) => end,
            Ok(None) => {
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed before completing a request",
                )));
            }
            Err(e) => {
                if e.is_invalid_request() {
                    reject(&mut client, response::bad_request()).await;
                }
                return Err(e);
            }
        };

        let request = match self.parser.parse(&buf[..head_end]) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejecting request: {}", e);
                reject(&mut client, response::bad_request()).await;
                return Err(e);
            }
        };
        session.advance(ConnectionState::Parsed);
        info!("{} {}{}", request.method, request.authority(), if request.method.is_connect() { "" } else { request.path.as_str() });

        let leftover = buf.split_off(head_end).freeze();
        if request.method.is_connect() {
            self.tunnel(client, &request, leftover, session).await
        } else {
            self.forward(client, &request, leftover, session).await
        }
    }

    async fn dial<S>(&self, client: &mut S, request: &ParsedRequest, session: &mut Session) -> Result<BoxedStream, ProxyError>
    where
        S: AsyncWrite + Unpin,
    {
        session.advance(ConnectionState::Dialing);
        match self.dialer.dial(&request.host, request.port, self.settings.connect_timeout).await {
            Ok(upstream) => Ok(upstream),
            Err(e) => {
                debug!("Dial to {} failed: {}", request.authority(), e);
                reject(client, response::bad_gateway()).await;
                Err(e)
            }
        }
    }

    async fn tunnel<S>(
        &self,
        mut client: S,
        request: &ParsedRequest,
        early_data: Bytes,
        session: &mut Session,
    ) -> Result<Outcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut upstream = self.dial(&mut client, request, session).await?;

        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;
        // bytes the client sent right behind the CONNECT head belong to the tunnel
        if !early_data.is_empty() {
            upstream.write_all(&early_data).await?;
        }

        session.advance(ConnectionState::Tunneling);
        self.stats.tunnel_opened();
        let mut stats = relay(client, upstream).await;
        stats.a_to_b += early_data.len() as u64;
        self.stats.record_bytes(stats.total());
        debug!(
            "Tunnel to {} closed: {} bytes up, {} bytes down",
            request.authority(),
            stats.a_to_b,
            stats.b_to_a
        );
        Ok(Outcome::Tunneled(stats))
    }

    async fn forward<S>(
        &self,
        mut client: S,
        request: &ParsedRequest,
        leftover: Bytes,
        session: &mut Session,
    ) -> Result<Outcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let body_len = request.content_length();
        // requests with a body are neither served from nor stored into the cache
        let key = if body_len == 0 { CacheKey::from_request(request) } else { None };

        if let Some(key) = &key {
            if let Some(entry) = self.cache.lookup(key) {
                session.advance(ConnectionState::CacheHit);
                self.stats.cache_hit();
                debug!("Cache hit for {}", key);
                let bytes = entry.to_bytes();
                client.write_all(&bytes).await?;
                client.flush().await?;
                let _ = client.shutdown().await;
                self.stats.record_bytes(bytes.len() as u64);
                return Ok(Outcome::CacheHit { status: entry.status() });
            }
            if self.cache.is_enabled() {
                self.stats.cache_miss();
            }
        }

        let body = self.read_request_body(&mut client, leftover, body_len).await?;
        let mut upstream = self.dial(&mut client, request, session).await?;

        session.advance(ConnectionState::Forwarding);
        upstream.write_all(&request.raw).await?;
        upstream.write_all(&body).await?;
        upstream.flush().await?;

        let mut received = BytesMut::with_capacity(READ_CHUNK);
        let (head, body_start) = match read_head(
            &mut upstream,
            &mut received,
            self.settings.max_header_size,
            self.settings.read_timeout,
            "upstream response head",
            ProxyError::UpstreamResponse,
        )
        .await
        .and_then(|end| end.ok_or_else(|| ProxyError::UpstreamResponse("upstream closed before responding".to_string())))
        .and_then(|end| ResponseHead::parse(&received[..end]).map(|(head, _)| (head, end)))
        {
            Ok(parsed) => parsed,
            Err(e) => {
                reject(&mut client, response::bad_gateway()).await;
                return Err(e);
            }
        };

        let expected_end = if head.has_body(request.method.is_head()) {
            head.content_length().map(|len| body_start + len)
        } else {
            Some(body_start)
        };

        let (complete, captured) = self
            .relay_response(&mut upstream, &mut client, received, expected_end)
            .await?;
        let _ = upstream.shutdown().await;

        // stored before the client sees EOF so a follow-up request can hit
        let mut cached = false;
        if let (true, Some(captured), Some(key)) = (complete, captured, key) {
            let body = captured.slice(body_start..);
            if self.cache.maybe_store(key, &head, body).await {
                self.stats.cache_store();
                cached = true;
            }
        }
        let _ = client.shutdown().await;

        Ok(Outcome::Forwarded { status: head.status, cached })
    }

    async fn read_request_body<S>(&self, client: &mut S, leftover: Bytes, body_len: usize) -> Result<Bytes, ProxyError>
    where
        S: AsyncRead + Unpin,
    {
        let mut body = BytesMut::from(&leftover[..]);
        while body.len() < body_len {
            body.reserve(READ_CHUNK.min(body_len - body.len()));
            let n = within(self.settings.read_timeout, "request body", client.read_buf(&mut body)).await?;
            if n == 0 {
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed before sending the full request body",
                )));
            }
        }
        body.truncate(body_len);
        Ok(body.freeze())
    }

    /// Streams the upstream response to the client, starting with the bytes
    /// already in `received`. Stops at `expected_end` when the length is known,
    /// otherwise at end-of-stream or when the upstream stays idle for a full
    /// read timeout. An idle-terminated response is never cached.
    ///
    /// Returns whether the response arrived complete, plus a copy of it when
    /// it stayed within `max_response_size`.
    async fn relay_response<U, S>(
        &self,
        upstream: &mut U,
        client: &mut S,
        received: BytesMut,
        expected_end: Option<usize>,
    ) -> Result<(bool, Option<Bytes>), ProxyError>
    where
        U: AsyncRead + Unpin,
        S: AsyncWrite + Unpin,
    {
        let mut total = 0usize;
        let mut captured = Some(BytesMut::with_capacity(received.len()));
        let mut chunk = received;

        loop {
            if let Some(end) = expected_end {
                chunk.truncate(end.saturating_sub(total));
            }
            if !chunk.is_empty() {
                client.write_all(&chunk).await?;
                total += chunk.len();
                captured = captured.filter(|copy| copy.len() + chunk.len() <= self.settings.max_response_size);
                if let Some(copy) = captured.as_mut() {
                    copy.extend_from_slice(&chunk);
                }
            }

            if expected_end.is_some_and(|end| total >= end) {
                break;
            }

            chunk = BytesMut::with_capacity(READ_CHUNK);
            let n = match within(self.settings.read_timeout, "upstream response body", upstream.read_buf(&mut chunk)).await {
                Ok(n) => n,
                // a keep-alive upstream with no length never closes; idle means done
                Err(ProxyError::Timeout(_)) if expected_end.is_none() => {
                    debug!("Upstream idle after {} bytes of an unframed response, ending it", total);
                    client.flush().await?;
                    self.stats.record_bytes(total as u64);
                    return Ok((false, None));
                }
                Err(e) => return Err(e),
            };
            if n == 0 {
                if expected_end.is_some() {
                    debug!("Upstream closed after {} of {:?} bytes", total, expected_end);
                    client.flush().await?;
                    self.stats.record_bytes(total as u64);
                    return Ok((false, None));
                }
                break;
            }
        }

        client.flush().await?;
        self.stats.record_bytes(total as u64);
        Ok((true, captured.map(BytesMut::freeze)))
    }
}

async fn reject<S>(client: &mut S, response: Bytes)
where
    S: AsyncWrite + Unpin,
{
    let _ = client.write_all(&response).await;
    let _ = client.flush().await;
    let _ = client.shutdown().await;
}
