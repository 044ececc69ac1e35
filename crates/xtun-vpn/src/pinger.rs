//! Latency Prober
//!
//! Probes a batch of endpoints concurrently under a fixed cap. Results are
//! delivered one by one through a [`PingStream`] as each probe completes.
//!
//! # Cancellation
//!
//! Each [`Pinger`] is one cancellation scope. [`Pinger::stop`] cancels every
//! batch started from it and returns immediately; once it has returned, no
//! stream from that scope yields another result. Batches started after
//! `stop` run normally.
//!
//! # Usage
//!
//! ```rust,ignore
//! let pinger = Pinger::new(PingerConfig::default(), parser);
//! let mut results = pinger.ping(["1.1.1.1:443", "vless://..."], ProbeKind::Tcp);
//! while let Some(result) = results.next().await {
//!     println!("{} {}ms", result.endpoint, result.rtt_ms());
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use xtun_link::{LinkParser, ProtocolKind};

/// Probe errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    /// No answer within the configured timeout
    #[error("Probe timed out")]
    Timeout,

    /// Endpoint text is not a host:port, URL or share-link
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Host name did not resolve
    #[error("Resolution failed: {0}")]
    Resolve(String),

    /// Connect, write or read failed
    #[error("Connection failed: {0}")]
    Connect(String),
}

/// What a probe measures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    /// Time to complete the TCP handshake
    #[default]
    Tcp,
    /// Time to the first byte of a `HEAD /` response
    ///
    /// The request is sent in plain text. Targets reached over TLS
    /// (`https://` URLs) are timed to the TCP handshake instead.
    Http,
}

impl std::str::FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "0" => Ok(ProbeKind::Tcp),
            "http" | "1" => Ok(ProbeKind::Http),
            other => Err(format!("unknown probe kind '{}'", other)),
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResult {
    pub endpoint: String,
    /// `None` when unreachable
    pub rtt: Option<Duration>,
    pub sampled_at: DateTime<Utc>,
}

impl PingResult {
    pub fn is_reachable(&self) -> bool {
        self.rtt.is_some()
    }

    /// Milliseconds, or -1 when unreachable
    pub fn rtt_ms(&self) -> i64 {
        self.rtt
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(-1)
    }
}

/// Host and port to probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    /// Served over TLS
    pub tls: bool,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    /// Accepts `host:port`, `[v6]:port`, URLs and share-links
    pub fn parse(endpoint: &str, parser: &LinkParser) -> Result<Self, ProbeError> {
        let endpoint = endpoint.trim();
        let invalid = || ProbeError::InvalidEndpoint(endpoint.to_string());

        if let Some((scheme, _)) = endpoint.split_once("://") {
            if ProtocolKind::from_scheme(scheme).is_some() {
                let node = parser
                    .parse(endpoint, None)
                    .map_err(|e| ProbeError::InvalidEndpoint(e.to_string()))?;
                return Ok(Self::new(node.address(), node.port()));
            }

            let url = Url::parse(endpoint).map_err(|_| invalid())?;
            let host = url.host_str().ok_or_else(invalid)?;
            let port = url.port_or_known_default().ok_or_else(invalid)?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            return Ok(Self {
                tls: matches!(url.scheme(), "https" | "wss"),
                ..Self::new(host, port)
            });
        }

        // IPv6 literals must be bracketed, `2001:db8::1` has no port
        let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
            None if host.contains([':', ']']) => return Err(invalid()),
            None => host,
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }
}

/// A single measurement against a target
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget, kind: ProbeKind) -> Result<Duration, ProbeError>;
}

/// Probe over the network, resolving names with hickory
pub struct NetworkProbe {
    resolver: TokioAsyncResolver,
}

impl NetworkProbe {
    /// Uses the system resolver, falling back to Cloudflare
    pub fn new() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("System resolver unavailable ({}), using Cloudflare", e);
                TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default())
            }
        };
        Self { resolver }
    }

    async fn resolve(&self, host: &str) -> Result<IpAddr, ProbeError> {
        if let Ok(addr) = host.parse::<IpAddr>() {
            return Ok(addr);
        }
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ProbeError::Resolve(e.to_string()))?;
        lookup
            .iter()
            .next()
            .ok_or_else(|| ProbeError::Resolve(format!("no addresses for {}", host)))
    }
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for NetworkProbe {
    async fn probe(&self, target: &ProbeTarget, kind: ProbeKind) -> Result<Duration, ProbeError> {
        let addr = SocketAddr::new(self.resolve(&target.host).await?, target.port);

        let started = Instant::now();
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        if kind == ProbeKind::Tcp {
            return Ok(started.elapsed());
        }
        if target.tls {
            debug!("{} is served over TLS, timing the handshake only", target.host);
            return Ok(started.elapsed());
        }

        let request = format!(
            "HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            target.host
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        let mut first = [0u8; 1];
        match stream.read(&mut first).await {
            Ok(n) if n > 0 => Ok(started.elapsed()),
            Ok(_) => Err(ProbeError::Connect("connection closed before response".into())),
            Err(e) => Err(ProbeError::Connect(e.to_string())),
        }
    }
}

/// Pinger configuration
#[derive(Debug, Clone)]
pub struct PingerConfig {
    /// Bound on each probe
    pub timeout: Duration,
    /// Probes in flight at once, across all batches
    pub max_concurrency: usize,
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            max_concurrency: 16,
        }
    }
}

/// Results of one batch, in completion order
pub struct PingStream {
    rx: mpsc::UnboundedReceiver<PingResult>,
    token: CancellationToken,
}

impl PingStream {
    /// Next result; `None` once the batch is done or stopped
    pub async fn next(&mut self) -> Option<PingResult> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            result = self.rx.recv() => result,
        }
    }

    /// Drain the remaining results
    pub async fn collect(mut self) -> Vec<PingResult> {
        let mut results = Vec::new();
        while let Some(result) = self.next().await {
            results.push(result);
        }
        results
    }
}

/// Latency prober with one cancellation scope
pub struct Pinger {
    probe: Arc<dyn Probe>,
    parser: Arc<LinkParser>,
    config: PingerConfig,
    limiter: Arc<Semaphore>,
    scope: Mutex<CancellationToken>,
}

impl Pinger {
    /// Create a pinger probing over the network
    pub fn new(config: PingerConfig, parser: Arc<LinkParser>) -> Self {
        Self::with_probe(config, parser, Arc::new(NetworkProbe::new()))
    }

    pub fn with_probe(config: PingerConfig, parser: Arc<LinkParser>, probe: Arc<dyn Probe>) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            probe,
            parser,
            config,
            limiter,
            scope: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn config(&self) -> &PingerConfig {
        &self.config
    }

    /// Probe every endpoint; must be called inside a tokio runtime
    pub fn ping<I, S>(&self, endpoints: I, kind: ProbeKind) -> PingStream
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let token = self
            .scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut count = 0usize;
        for endpoint in endpoints {
            count += 1;
            let endpoint: String = endpoint.into();
            let tx = tx.clone();
            let token = token.clone();
            let limiter = self.limiter.clone();
            let probe = self.probe.clone();
            let parser = self.parser.clone();
            let timeout = self.config.timeout;

            tokio::spawn(async move {
                let _permit = tokio::select! {
                    _ = token.cancelled() => return,
                    permit = limiter.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };

                let measured = tokio::select! {
                    _ = token.cancelled() => return,
                    outcome = measure(probe.as_ref(), &parser, &endpoint, kind, timeout) => outcome,
                };

                let rtt = match measured {
                    Ok(rtt) => Some(rtt),
                    Err(e) => {
                        debug!("{} unreachable: {}", endpoint, e);
                        None
                    }
                };

                if token.is_cancelled() {
                    return;
                }
                let _ = tx.send(PingResult {
                    endpoint,
                    rtt,
                    sampled_at: Utc::now(),
                });
            });
        }

        debug!("Started {} {:?} probes", count, kind);
        PingStream { rx, token }
    }

    /// Cancel every batch from this scope without waiting on probes
    pub fn stop(&self) {
        let mut scope = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
        if !scope.is_cancelled() {
            scope.cancel();
        }
        *scope = CancellationToken::new();
        info!("Pinger stopped");
    }
}

async fn measure(
    probe: &dyn Probe,
    parser: &LinkParser,
    endpoint: &str,
    kind: ProbeKind,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let target = ProbeTarget::parse(endpoint, parser)?;
    match tokio::time::timeout(timeout, probe.probe(&target, kind)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout),
    }
}
