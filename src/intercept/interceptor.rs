//! Connection interceptor.
//!
//! Every attempt moves through:
//!
//! ```text
//! Init -> PolicyResolved -> Allowed -> Connecting -> Connected
//!                        -> Refused -> Failed
//!                        -> Discarded -> FakeConnected
//! ```
//!
//! `Connected`, `Failed` and `FakeConnected` are terminal. A connection is
//! registered with the traffic recorder only on `Connected` or
//! `FakeConnected`, so a failed or abandoned attempt never shows up in a
//! capture.
//!
//! # Example
//!
//! ```ignore
//! use std::io::Write;
//!
//! let interceptor = wiretap.interceptor();
//! let mut stream = interceptor.connect("127.0.0.1", 8080)?;
//! stream.write_all(b"ping")?;
//!
//! let stream = interceptor.connect_async("127.0.0.1", 8080).await?;
//! ```

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::async_stream::AsyncSniffedStream;
use super::error::{InterceptError, InterceptResult};
use super::guard::PolicyGuard;
use super::hold::{DelayOutcome, DelayedAttempts};
use super::stream::SniffedStream;
use crate::capture::{RemoteEndpoint, Tap, TraceAttributor, TrafficRecorder, TransportKind};
use crate::policy::{display_address, AddressMatcher, Decision, PolicyRegistry, Resolution};
use crate::telemetry::{AllowReason, AuditEvent, AuditLogger, BlockReason};

/// State of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Nothing evaluated yet.
    Init,
    /// Policy looked up.
    PolicyResolved,
    /// Policy allows a real connection (possibly after a delay).
    Allowed,
    /// Real connect in progress.
    Connecting,
    /// Real connection established.
    Connected,
    /// Policy refused the address.
    Refused,
    /// Attempt ended without a connection.
    Failed,
    /// Policy discards the address.
    Discarded,
    /// Simulated connection handed out.
    FakeConnected,
}

impl AttemptState {
    /// Whether the attempt is over.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Connected | AttemptState::Failed | AttemptState::FakeConnected
        )
    }
}

struct Attempt {
    address: String,
    state: AttemptState,
}

impl Attempt {
    fn new(address: String) -> Self {
        Self {
            address,
            state: AttemptState::Init,
        }
    }

    fn advance(&mut self, next: AttemptState) {
        trace!("{}: {:?} -> {:?}", self.address, self.state, next);
        self.state = next;
    }
}

/// Intercepts outbound connections and enforces address policy.
///
/// Cheap to clone; clones share the registry, recorder and attach state.
#[derive(Clone)]
pub struct ConnectionInterceptor {
    registry: Arc<PolicyRegistry>,
    matcher: AddressMatcher,
    recorder: Arc<TrafficRecorder>,
    attributor: Arc<TraceAttributor>,
    audit: Arc<AuditLogger>,
    delays: Arc<DelayedAttempts>,
    attached: Arc<AtomicBool>,
    inspect_proxy_requests: bool,
}

impl ConnectionInterceptor {
    /// Create an attached interceptor without stack capture or auditing.
    pub fn new(registry: Arc<PolicyRegistry>, recorder: Arc<TrafficRecorder>) -> Self {
        Self {
            matcher: AddressMatcher::new(Arc::clone(&registry)),
            registry,
            recorder,
            attributor: Arc::new(TraceAttributor::default()),
            audit: Arc::new(AuditLogger::new_null()),
            delays: Arc::new(DelayedAttempts::new()),
            attached: Arc::new(AtomicBool::new(true)),
            inspect_proxy_requests: false,
        }
    }

    /// Use the given attributor for new connections.
    pub fn with_attributor(mut self, attributor: Arc<TraceAttributor>) -> Self {
        self.attributor = attributor;
        self
    }

    /// Audit decisions through the given logger.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Inspect the first bytes written for HTTP CONNECT requests.
    pub fn with_proxy_inspection(mut self, enabled: bool) -> Self {
        self.inspect_proxy_requests = enabled;
        self
    }

    /// Share an attach flag with other components.
    pub fn with_attach_flag(mut self, attached: Arc<AtomicBool>) -> Self {
        self.attached = attached;
        self
    }

    /// Share a delayed-attempt registry with other components.
    pub fn with_delayed_attempts(mut self, delays: Arc<DelayedAttempts>) -> Self {
        self.delays = delays;
        self
    }

    /// Start enforcing policy and recording on new connections.
    pub fn attach(&self) {
        self.attached.store(true, Ordering::Release);
        info!("Connection interception attached");
    }

    /// Stop intercepting: new connections go straight to the transport.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
        info!("Connection interception detached");
    }

    /// Whether new connections are intercepted.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Attempts currently waiting out a delay.
    pub fn delayed_attempts(&self) -> &Arc<DelayedAttempts> {
        &self.delays
    }

    /// Decision that a connection to `host:port` would get now.
    pub fn resolve(&self, host: &str, port: u16) -> Decision {
        self.matcher.resolve(host, port)
    }

    /// Connect a blocking stream.
    pub fn connect(&self, host: &str, port: u16) -> InterceptResult<SniffedStream> {
        self.connect_blocking(host, port, None)
    }

    /// Connect a blocking stream, giving up after `timeout`.
    ///
    /// A policy delay counts against the timeout.
    pub fn connect_timeout(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> InterceptResult<SniffedStream> {
        self.connect_blocking(host, port, Some(Instant::now() + timeout))
    }

    /// Connect a blocking stream to a socket address (matched by IP).
    pub fn connect_addr(&self, addr: SocketAddr) -> InterceptResult<SniffedStream> {
        self.connect_blocking(&addr.ip().to_string(), addr.port(), None)
    }

    /// Connect a tokio stream.
    ///
    /// Dropping the returned future abandons the attempt, including any
    /// policy delay, without registering a connection.
    pub async fn connect_async(&self, host: &str, port: u16) -> InterceptResult<AsyncSniffedStream> {
        let address = display_address(host, port);
        if !self.is_attached() {
            let stream = tokio::net::TcpStream::connect((host, port))
                .await
                .map_err(|source| InterceptError::Connect { address, source })?;
            return Ok(AsyncSniffedStream::passthrough(stream));
        }

        let mut attempt = Attempt::new(address.clone());
        let resolution = self.evaluate(&mut attempt, host, port);

        match resolution.decision {
            Decision::Closed => Err(self.refuse(&mut attempt)),
            Decision::Discard => {
                let tap = self.discard(&mut attempt, host, port, TransportKind::Async);
                Ok(AsyncSniffedStream::discarded(tap))
            }
            Decision::Open | Decision::Delay { .. } => {
                attempt.advance(AttemptState::Allowed);
                if let Some(delay) = resolution.decision.delay_duration() {
                    self.audit_delay(&address, delay);
                    let ticket = self.delays.park(address.clone(), delay);
                    if ticket.wait().await == DelayOutcome::Cancelled {
                        attempt.advance(AttemptState::Failed);
                        return Err(InterceptError::Cancelled { address });
                    }
                }

                attempt.advance(AttemptState::Connecting);
                let stream = match tokio::net::TcpStream::connect((host, port)).await {
                    Ok(stream) => stream,
                    Err(source) => return Err(self.fail(&mut attempt, source)),
                };

                let (peer, local) = (stream.peer_addr().ok(), stream.local_addr().ok());
                let (tap, guard) =
                    self.establish(&mut attempt, host, port, peer, local, TransportKind::Async, &resolution);
                Ok(AsyncSniffedStream::connected(stream, tap, guard))
            }
        }
    }

    fn connect_blocking(
        &self,
        host: &str,
        port: u16,
        deadline: Option<Instant>,
    ) -> InterceptResult<SniffedStream> {
        let address = display_address(host, port);
        if !self.is_attached() {
            let stream = connect_tcp(host, port, deadline, &address)?;
            return Ok(SniffedStream::passthrough(stream));
        }

        let mut attempt = Attempt::new(address.clone());
        let resolution = self.evaluate(&mut attempt, host, port);

        match resolution.decision {
            Decision::Closed => Err(self.refuse(&mut attempt)),
            Decision::Discard => {
                let tap = self.discard(&mut attempt, host, port, TransportKind::Blocking);
                Ok(SniffedStream::discarded(tap))
            }
            Decision::Open | Decision::Delay { .. } => {
                attempt.advance(AttemptState::Allowed);
                if let Some(delay) = resolution.decision.delay_duration() {
                    self.audit_delay(&address, delay);
                    let ticket = self.delays.park(address.clone(), delay);
                    match ticket.wait_blocking(deadline) {
                        DelayOutcome::Elapsed => {}
                        DelayOutcome::DeadlineReached => {
                            attempt.advance(AttemptState::Failed);
                            return Err(InterceptError::Timeout { address });
                        }
                        DelayOutcome::Cancelled => {
                            attempt.advance(AttemptState::Failed);
                            return Err(InterceptError::Cancelled { address });
                        }
                    }
                }

                attempt.advance(AttemptState::Connecting);
                let stream = match connect_tcp(host, port, deadline, &address) {
                    Ok(stream) => stream,
                    Err(err) => {
                        attempt.advance(AttemptState::Failed);
                        self.audit.log(AuditEvent::ConnectionFail {
                            address: address.clone(),
                            message: err.to_string(),
                        });
                        return Err(err);
                    }
                };

                let (peer, local) = (stream.peer_addr().ok(), stream.local_addr().ok());
                let (tap, guard) = self.establish(
                    &mut attempt,
                    host,
                    port,
                    peer,
                    local,
                    TransportKind::Blocking,
                    &resolution,
                );
                Ok(SniffedStream::connected(stream, tap, guard))
            }
        }
    }

    fn evaluate(&self, attempt: &mut Attempt, host: &str, port: u16) -> Resolution {
        self.registry.note_discovered(host, port);
        let resolution = self.matcher.resolve_candidates(&[host], port);
        debug!(
            "Policy for {}: {}{}",
            attempt.address,
            resolution.decision,
            if resolution.is_explicit() { "" } else { " (default)" }
        );
        attempt.advance(AttemptState::PolicyResolved);
        resolution
    }

    fn refuse(&self, attempt: &mut Attempt) -> InterceptError {
        attempt.advance(AttemptState::Refused);
        info!("Connection to {} refused by policy", attempt.address);
        self.audit.log(AuditEvent::ConnectionRefuse {
            address: attempt.address.clone(),
            reason: BlockReason::Policy,
        });
        attempt.advance(AttemptState::Failed);
        InterceptError::refusal(attempt.address.clone())
    }

    fn discard(&self, attempt: &mut Attempt, host: &str, port: u16, transport: TransportKind) -> Tap {
        attempt.advance(AttemptState::Discarded);
        // Only IP literals get an address; resolving a name would be I/O.
        let addr = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
            .map(|ip| SocketAddr::new(ip, port));
        let tap = self.recorder.open_connection(
            RemoteEndpoint::new(host, port, addr),
            None,
            transport,
            self.attributor.capture_context(),
            true,
        );
        attempt.advance(AttemptState::FakeConnected);

        debug!("Connection to {} discarded ({})", attempt.address, tap.identity().id());
        self.audit.log(AuditEvent::ConnectionDiscard {
            address: attempt.address.clone(),
        });
        tap
    }

    fn fail(&self, attempt: &mut Attempt, source: std::io::Error) -> InterceptError {
        attempt.advance(AttemptState::Failed);
        warn!("Connection to {} failed: {}", attempt.address, source);
        self.audit.log(AuditEvent::ConnectionFail {
            address: attempt.address.clone(),
            message: source.to_string(),
        });
        InterceptError::Connect {
            address: attempt.address.clone(),
            source,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn establish(
        &self,
        attempt: &mut Attempt,
        host: &str,
        port: u16,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
        transport: TransportKind,
        resolution: &Resolution,
    ) -> (Tap, PolicyGuard) {
        let remote = RemoteEndpoint::new(host, port, peer);
        let guard = PolicyGuard::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.audit),
            &remote,
            resolution.generation,
            self.inspect_proxy_requests,
        );
        let tap = self.recorder.open_connection(
            remote,
            local,
            transport,
            self.attributor.capture_context(),
            false,
        );
        attempt.advance(AttemptState::Connected);

        let reason = match resolution.decision {
            Decision::Delay { .. } => AllowReason::Delayed,
            _ if resolution.is_explicit() => AllowReason::Policy,
            _ => AllowReason::Unmatched,
        };
        self.audit.log(AuditEvent::ConnectionAllow {
            address: attempt.address.clone(),
            transport,
            reason,
        });
        (tap, guard)
    }

    fn audit_delay(&self, address: &str, delay: Duration) {
        self.audit.log(AuditEvent::ConnectionDelay {
            address: address.to_string(),
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
    }
}

impl std::fmt::Debug for ConnectionInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInterceptor")
            .field("attached", &self.is_attached())
            .field("inspect_proxy_requests", &self.inspect_proxy_requests)
            .finish()
    }
}

/// Connect a std stream, bounded by `deadline` when given.
fn connect_tcp(
    host: &str,
    port: u16,
    deadline: Option<Instant>,
    address: &str,
) -> InterceptResult<TcpStream> {
    let connect_err = |source| InterceptError::Connect {
        address: address.to_string(),
        source,
    };

    let Some(deadline) = deadline else {
        return TcpStream::connect((host, port)).map_err(connect_err);
    };

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(connect_err)?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(InterceptError::Timeout {
                address: address.to_string(),
            });
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(match last_err {
        Some(e) if e.kind() == std::io::ErrorKind::TimedOut => InterceptError::Timeout {
            address: address.to_string(),
        },
        Some(e) => connect_err(e),
        None => InterceptError::InvalidTarget(address.to_string()),
    })
}
