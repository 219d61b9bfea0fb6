//! HTTPS probe client. One probe opens a fresh TCP + TLS connection to a
//! literal address, issues a GET with a configured SNI and Host header,
//! and reports per-phase latencies plus the parsed `key=value` body.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Empty};
use hyper::{header, Method, Request};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde::Serialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

const DEFAULT_PATH: &str = "/cdn-cgi/trace";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 64 * 1024;
const USER_AGENT: &str = concat!("mcis/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug)]
pub struct ProbeConfig {
    pub timeout: Duration,
    pub sni: String,
    pub host_header: String,
    pub path: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            sni: "example.com".to_string(),
            host_header: "example.com".to_string(),
            path: DEFAULT_PATH.to_string(),
        }
    }
}

impl ProbeConfig {
    /// Fills in defaults for empty fields and normalizes the path to a
    /// leading `/`.
    pub fn normalized(mut self) -> Self {
        if self.path.is_empty() {
            self.path = DEFAULT_PATH.to_string();
        }
        if !self.path.starts_with('/') {
            self.path.insert(0, '/');
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        self
    }
}

/// Result of probing one address. Always fully populated; probe failures
/// are values here, never errors.
#[derive(Clone, Debug, Serialize)]
pub struct ProbeOutcome {
    pub ip: IpAddr,
    pub ok: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub connect_ms: u64,
    pub tls_ms: u64,
    pub ttfb_ms: u64,
    pub total_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<BTreeMap<String, String>>,
    pub when: DateTime<Utc>,
}

impl ProbeOutcome {
    /// A synthetic failure outcome carrying only an error tag, used when a
    /// probe never ran to completion (e.g. the run was interrupted).
    pub fn tagged_failure(ip: IpAddr, tag: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            ip,
            ok: false,
            status: 0,
            error: Some(tag.into()),
            connect_ms: 0,
            tls_ms: 0,
            ttfb_ms: 0,
            total_ms: elapsed.as_millis() as u64,
            trace: None,
            when: Utc::now(),
        }
    }
}

/// Seam between the search engine and the network. Tests inject synthetic
/// probers through this trait.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, ip: IpAddr) -> ProbeOutcome;
}

/// Phase durations recorded as they happen, so partially-failed probes
/// still report the phases that did complete.
#[derive(Default)]
struct PhaseClock {
    connect_ms: AtomicU64,
    tls_ms: AtomicU64,
    ttfb_ms: AtomicU64,
}

/// Reusable HTTPS prober. Dials each address directly (the proxy
/// environment is never consulted), handshakes with the configured SNI
/// and ALPN h2 + http/1.1, and speaks whichever protocol was negotiated.
pub struct HttpProber {
    cfg: ProbeConfig,
    tls: TlsConnector,
    server_name: ServerName<'static>,
}

impl HttpProber {
    pub fn new(cfg: ProbeConfig) -> Result<Self> {
        let cfg = cfg.normalized();
        let server_name = ServerName::try_from(cfg.sni.clone())
            .map_err(|e| anyhow!("invalid sni {:?}: {e}", cfg.sni))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            cfg,
            tls: TlsConnector::from(Arc::new(tls_config)),
            server_name,
        })
    }

    async fn probe_once(
        &self,
        ip: IpAddr,
        started: Instant,
        phases: Arc<PhaseClock>,
    ) -> Result<(u16, String)> {
        let addr = SocketAddr::new(ip, 443);

        let connect_start = Instant::now();
        let tcp = TcpStream::connect(addr).await.context("connect")?;
        phases
            .connect_ms
            .store(connect_start.elapsed().as_millis() as u64, Ordering::Relaxed);

        let _ = tcp.set_nodelay(true);
        let _ = SockRef::from(&tcp)
            .set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE));

        let tls_start = Instant::now();
        let tls = self
            .tls
            .connect(self.server_name.clone(), tcp)
            .await
            .context("tls handshake")?;
        phases
            .tls_ms
            .store(tls_start.elapsed().as_millis() as u64, Ordering::Relaxed);

        let negotiated_h2 = tls.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);

        // The Host header (h2: the :authority pseudo-header) carries the
        // configured value verbatim; the literal IP is only ever used to
        // dial. Bracketing applies when the IP itself must stand in.
        let authority = if self.cfg.host_header.is_empty() {
            match ip {
                IpAddr::V4(v4) => v4.to_string(),
                IpAddr::V6(v6) => format!("[{v6}]"),
            }
        } else {
            self.cfg.host_header.clone()
        };

        let response = if negotiated_h2 {
            let io = TokioIo::new(tls);
            let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
                .await
                .context("h2 handshake")?;
            tokio::spawn(async move {
                let _ = conn.await;
            });
            let req = Request::builder()
                .method(Method::GET)
                .uri(format!("https://{}{}", authority, self.cfg.path))
                .header(header::USER_AGENT, USER_AGENT)
                .header(header::ACCEPT, "text/plain")
                .body(Empty::<Bytes>::new())
                .context("build request")?;
            sender.send_request(req).await.context("h2 request")?
        } else {
            let io = TokioIo::new(tls);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .context("http handshake")?;
            tokio::spawn(async move {
                let _ = conn.await;
            });
            let req = Request::builder()
                .method(Method::GET)
                .uri(self.cfg.path.clone())
                .header(header::HOST, authority)
                .header(header::USER_AGENT, USER_AGENT)
                .header(header::ACCEPT, "text/plain")
                .body(Empty::<Bytes>::new())
                .context("build request")?;
            sender.send_request(req).await.context("http request")?
        };

        phases
            .ttfb_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        let status = response.status().as_u16();
        let mut body = response.into_body();
        let mut collected: Vec<u8> = Vec::with_capacity(4096);
        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(f) => f,
                // A truncated body still yields whatever arrived.
                Err(_) => break,
            };
            if let Some(data) = frame.data_ref() {
                let room = MAX_BODY_BYTES - collected.len();
                if data.len() >= room {
                    collected.extend_from_slice(&data[..room]);
                    break;
                }
                collected.extend_from_slice(data);
            }
        }

        Ok((status, String::from_utf8_lossy(&collected).into_owned()))
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, ip: IpAddr) -> ProbeOutcome {
        let started = Instant::now();
        let when = Utc::now();
        let phases = Arc::new(PhaseClock::default());

        let result = tokio::time::timeout(
            self.cfg.timeout,
            self.probe_once(ip, started, phases.clone()),
        )
        .await;

        let mut out = ProbeOutcome {
            ip,
            ok: false,
            status: 0,
            error: None,
            connect_ms: phases.connect_ms.load(Ordering::Relaxed),
            tls_ms: phases.tls_ms.load(Ordering::Relaxed),
            ttfb_ms: phases.ttfb_ms.load(Ordering::Relaxed),
            total_ms: started.elapsed().as_millis() as u64,
            trace: None,
            when,
        };

        match result {
            Ok(Ok((status, body))) => {
                out.status = status;
                if (200..300).contains(&status) {
                    out.ok = true;
                    out.trace = Some(parse_trace(&body));
                } else {
                    out.error = Some(format!("http_status_{status}"));
                }
            }
            Ok(Err(e)) => {
                out.error = Some(format!("{e:#}"));
            }
            Err(_) => {
                out.error = Some("timeout".to_string());
            }
        }
        out
    }
}

/// Parses a `key=value` lines body. Whitespace around keys and values is
/// trimmed, malformed lines and empty keys are skipped, and the last
/// writer wins. Inline `#` is not comment syntax here: the probed
/// service's body carries it literally.
pub fn parse_trace(body: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        out.insert(k.to_string(), v.trim().to_string());
    }
    out
}
