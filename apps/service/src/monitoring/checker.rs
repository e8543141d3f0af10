use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::{Host, Url};

use super::aggregate::aggregate;
use super::types::{CheckReport, CheckType, Sample, SiteEntry, Timings};
use crate::error::ProbeError;

/// Product token appended to the default user agent
pub const PRODUCT: &str = "websiteBench";

/// Client token HTTP checks announce before the product token
const HTTP_CLIENT_AGENT: &str = "hyper/1";

/// Agent string used by HTTP checks when none is configured
pub fn default_user_agent() -> String {
    format!("{HTTP_CLIENT_AGENT} {PRODUCT}/{}", env!("CARGO_PKG_VERSION"))
}

/// A probe turns one fired site into at most one report.
///
/// `None` means the check produced nothing worth recording; the reason has
/// already been logged.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn run(&self, site: &SiteEntry) -> Option<CheckReport>;
}

/// Parameters of a single timed GET
#[derive(Debug, Clone)]
pub struct TimedRequest {
    pub url: Url,
    pub timeout: Duration,
    pub user_agent: String,
    pub verify_tls: bool,
}

/// Cumulative timings of one request, in milliseconds since the request started
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HttpTiming {
    pub dns_ms: f64,
    pub connect_ms: f64,
    /// `None` for plain HTTP
    pub tls_handshake_ms: Option<f64>,
    pub pre_transfer_ms: f64,
    pub ttfb_ms: f64,
    pub total_ms: f64,
    pub status_code: u16,
    pub body_bytes: u64,
}

impl HttpTiming {
    pub fn into_sample(self) -> Sample {
        Sample {
            timings: Timings {
                total: Some(self.total_ms),
                dns: Some(self.dns_ms),
                connect: Some(self.connect_ms),
                tls_handshake: self.tls_handshake_ms,
                pre_transfer: Some(self.pre_transfer_ms),
                ttfb: Some(self.ttfb_ms),
                download: Some((self.total_ms - self.ttfb_ms).max(0.0)),
                transfer_size: Some(self.body_bytes as f64),
                ..Default::default()
            },
            status_code: Some(self.status_code),
        }
    }
}

/// Capability to perform a timed HTTP GET
#[async_trait]
pub trait HttpTimer: Send + Sync {
    async fn get(&self, request: &TimedRequest) -> Result<HttpTiming, ProbeError>;
}

/// `HttpTimer` over a raw hyper connection so every phase can be timed
pub struct HyperTimer {
    verified: Arc<rustls::ClientConfig>,
    unverified: Arc<rustls::ClientConfig>,
}

impl HyperTimer {
    pub fn new() -> Result<Self, ProbeError> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut verified = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Tls(format!("tls protocol version error: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
        verified.alpn_protocols = vec![b"http/1.1".to_vec()];

        let mut unverified = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Tls(format!("tls protocol version error: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
        .with_no_client_auth();
        unverified.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            verified: Arc::new(verified),
            unverified: Arc::new(unverified),
        })
    }

    async fn measure(&self, request: &TimedRequest) -> Result<HttpTiming, ProbeError> {
        let url = &request.url;
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(ProbeError::InvalidUrl(url.to_string())),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProbeError::InvalidUrl(url.to_string()))?;

        let start = Instant::now();

        let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| ProbeError::Dns(format!("{host}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(ProbeError::Dns(format!("{host}: no addresses")));
        }
        addrs.shuffle(&mut rand::thread_rng());
        let dns_ms = elapsed_ms(start);

        let stream = connect_any(&addrs).await?;
        let _ = stream.set_nodelay(true);
        let connect_ms = elapsed_ms(start);

        let phases = Phases { start, dns_ms, connect_ms, tls_handshake_ms: None };

        match url.scheme() {
            "https" => {
                let config = if request.verify_tls { &self.verified } else { &self.unverified };
                let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                    .map_err(|e| ProbeError::Tls(format!("invalid tls server name '{host}': {e}")))?;
                let tls = TlsConnector::from(Arc::clone(config))
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ProbeError::Tls(e.to_string()))?;
                let phases = Phases { tls_handshake_ms: Some(elapsed_ms(start)), ..phases };
                exchange(tls, request, phases).await
            }
            "http" => exchange(stream, request, phases).await,
            other => Err(ProbeError::InvalidUrl(format!("unsupported scheme {other}"))),
        }
    }
}

#[async_trait]
impl HttpTimer for HyperTimer {
    async fn get(&self, request: &TimedRequest) -> Result<HttpTiming, ProbeError> {
        timeout(request.timeout, self.measure(request))
            .await
            .map_err(|_| ProbeError::Timeout(request.timeout))?
    }
}

struct Phases {
    start: Instant,
    dns_ms: f64,
    connect_ms: f64,
    tls_handshake_ms: Option<f64>,
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream, ProbeError> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_error = Some(format!("{addr}: {e}"));
            }
        }
    }
    Err(ProbeError::Connect(last_error.unwrap_or_else(|| "no address".into())))
}

async fn exchange<S>(stream: S, request: &TimedRequest, phases: Phases) -> Result<HttpTiming, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let url = &request.url;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProbeError::Request(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "probe connection closed with error");
        }
    });

    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    let authority = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(ProbeError::InvalidUrl(url.to_string())),
    };

    let req = http::Request::builder()
        .method("GET")
        .uri(target)
        .header(http::header::HOST, authority)
        .header(http::header::USER_AGENT, request.user_agent.as_str())
        .header(http::header::ACCEPT, "*/*")
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProbeError::Request(e.to_string()))?;

    let pre_transfer_ms = elapsed_ms(phases.start);
    let response = sender
        .send_request(req)
        .await
        .map_err(|e| ProbeError::Request(e.to_string()))?;
    let ttfb_ms = elapsed_ms(phases.start);
    let status_code = response.status().as_u16();

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| ProbeError::Request(format!("reading body: {e}")))?
        .to_bytes();

    Ok(HttpTiming {
        dns_ms: phases.dns_ms,
        connect_ms: phases.connect_ms,
        tls_handshake_ms: phases.tls_handshake_ms,
        pre_transfer_ms,
        ttfb_ms,
        total_ms: elapsed_ms(phases.start),
        status_code,
        body_bytes: body.len() as u64,
    })
}

/// Settings shared by every HTTP check
#[derive(Debug, Clone)]
pub struct HttpProbeSettings {
    pub repeat_count: usize,
    pub parallel: bool,
    pub user_agent: Option<String>,
    pub ignore_ssl_errors: bool,
}

impl Default for HttpProbeSettings {
    fn default() -> Self {
        Self {
            repeat_count: 3,
            parallel: true,
            user_agent: None,
            ignore_ssl_errors: false,
        }
    }
}

/// Repeated timed GETs, averaged into one report
pub struct HttpProbe {
    timer: Arc<dyn HttpTimer>,
    settings: HttpProbeSettings,
}

impl HttpProbe {
    pub fn new(timer: Arc<dyn HttpTimer>, settings: HttpProbeSettings) -> Self {
        Self { timer, settings }
    }

    fn settle(&self, site: &SiteEntry, run: usize, result: Result<HttpTiming, ProbeError>) -> Option<Sample> {
        match result {
            Ok(timing) => {
                debug!(site = %site.name, run, status = timing.status_code, total_ms = timing.total_ms, "request finished");
                Some(timing.into_sample())
            }
            Err(e) => {
                warn!(site = %site.name, run, error = %e, "request failed");
                None
            }
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn run(&self, site: &SiteEntry) -> Option<CheckReport> {
        let request = TimedRequest {
            url: site.url.clone(),
            timeout: site.probe_timeout(),
            user_agent: self.settings.user_agent.clone().unwrap_or_else(default_user_agent),
            verify_tls: !self.settings.ignore_ssl_errors,
        };
        let runs = self.settings.repeat_count.max(1);
        let mut batch = Vec::with_capacity(runs);

        if self.settings.parallel {
            let request = &request;
            let mut pending: FuturesUnordered<_> = (0..runs)
                .map(|run| async move { (run, self.timer.get(request).await) })
                .collect();
            while let Some((run, result)) = pending.next().await {
                batch.push(self.settle(site, run, result));
            }
        } else {
            for run in 0..runs {
                let result = self.timer.get(&request).await;
                batch.push(self.settle(site, run, result));
            }
        }

        let metric = aggregate(&batch);
        if metric.completed == 0 {
            warn!(site = %site.name, attempts = metric.attempts, "every request failed, no metric recorded");
            return None;
        }

        debug!(
            site = %site.name,
            status = %metric.status_codes_string(),
            total_ms = metric.timings.total.unwrap_or_default(),
            "http check complete"
        );

        Some(CheckReport {
            site: site.name.clone(),
            check_type: CheckType::Curl,
            metric,
            resources: Vec::new(),
        })
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate; used when `ignore_ssl_errors` is set.
    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Replies with scripted outcomes after scripted delays
    struct ScriptedTimer {
        script: Mutex<VecDeque<(u64, Option<(u16, f64)>)>>,
    }

    impl ScriptedTimer {
        fn new(script: Vec<(u64, Option<(u16, f64)>)>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()) })
        }
    }

    #[async_trait]
    impl HttpTimer for ScriptedTimer {
        async fn get(&self, _request: &TimedRequest) -> Result<HttpTiming, ProbeError> {
            let (delay_ms, outcome) = self.script.lock().unwrap().pop_front().expect("script exhausted");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            match outcome {
                Some((status_code, total_ms)) => Ok(HttpTiming {
                    dns_ms: 1.0,
                    connect_ms: 2.0,
                    tls_handshake_ms: None,
                    pre_transfer_ms: 3.0,
                    ttfb_ms: total_ms / 2.0,
                    total_ms,
                    status_code,
                    body_bytes: 10,
                }),
                None => Err(ProbeError::Connect("refused".into())),
            }
        }
    }

    fn site(url: &str) -> SiteEntry {
        SiteEntry {
            name: "shop".into(),
            url: Url::parse(url).unwrap(),
            check_interval: Duration::from_secs(60),
            check_type: CheckType::Curl,
            disabled: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_batch_joins_status_codes_in_completion_order() {
        let timer = ScriptedTimer::new(vec![
            (10, Some((200, 90.0))),
            (20, Some((200, 120.0))),
            (30, Some((500, 60.0))),
        ]);
        let probe = HttpProbe::new(timer, HttpProbeSettings::default());

        let report = probe.run(&site("https://shop.example")).await.unwrap();

        assert_eq!(report.check_type, CheckType::Curl);
        assert_eq!(report.metric.status_codes_string(), "200:200:500");
        assert_eq!(report.metric.timings.total, Some(90.0));
        assert_eq!(report.metric.status_code(), Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_requests_overlap() {
        let timer = ScriptedTimer::new(vec![
            (1000, Some((200, 10.0))),
            (1000, Some((200, 10.0))),
            (1000, Some((200, 10.0))),
        ]);
        let probe = HttpProbe::new(timer, HttpProbeSettings::default());

        let started = Instant::now();
        probe.run(&site("https://shop.example")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_mode_runs_one_after_another() {
        let timer = ScriptedTimer::new(vec![
            (1000, Some((200, 10.0))),
            (1000, Some((301, 20.0))),
        ]);
        let settings = HttpProbeSettings { repeat_count: 2, parallel: false, ..Default::default() };
        let probe = HttpProbe::new(timer, settings);

        let started = Instant::now();
        let report = probe.run(&site("https://shop.example")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(report.metric.status_codes_string(), "200:301");
        assert_eq!(report.metric.timings.total, Some(15.0));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_requests_count_as_zero() {
        let timer = ScriptedTimer::new(vec![(5, Some((200, 300.0))), (5, None), (5, None)]);
        let probe = HttpProbe::new(timer, HttpProbeSettings::default());

        let report = probe.run(&site("https://shop.example")).await.unwrap();
        assert_eq!(report.metric.completed, 1);
        assert_eq!(report.metric.timings.total, Some(100.0));
        assert_eq!(report.metric.status_codes_string(), "200");
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_produce_no_report() {
        let timer = ScriptedTimer::new(vec![(5, None), (5, None), (5, None)]);
        let probe = HttpProbe::new(timer, HttpProbeSettings::default());

        assert!(probe.run(&site("https://shop.example")).await.is_none());
    }

    #[test]
    fn default_agent_carries_product_and_version() {
        let agent = default_user_agent();
        assert!(agent.ends_with(&format!("{PRODUCT}/{}", env!("CARGO_PKG_VERSION"))));
    }

    async fn serve_once(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                read += n;
                if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.ok();
        });
        addr
    }

    #[tokio::test]
    async fn hyper_timer_measures_local_server() {
        let addr = serve_once(b"HTTP/1.1 203 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello").await;
        let timer = HyperTimer::new().unwrap();
        let request = TimedRequest {
            url: Url::parse(&format!("http://{addr}/status?full=1")).unwrap(),
            timeout: Duration::from_secs(5),
            user_agent: default_user_agent(),
            verify_tls: true,
        };

        let timing = timer.get(&request).await.unwrap();

        assert_eq!(timing.status_code, 203);
        assert_eq!(timing.body_bytes, 5);
        assert_eq!(timing.tls_handshake_ms, None);
        assert!(timing.dns_ms <= timing.connect_ms);
        assert!(timing.connect_ms <= timing.pre_transfer_ms);
        assert!(timing.pre_transfer_ms <= timing.ttfb_ms);
        assert!(timing.ttfb_ms <= timing.total_ms);
    }

    #[tokio::test]
    async fn hyper_timer_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let timer = HyperTimer::new().unwrap();
        let request = TimedRequest {
            url: Url::parse(&format!("http://{addr}/")).unwrap(),
            timeout: Duration::from_millis(200),
            user_agent: default_user_agent(),
            verify_tls: true,
        };

        assert!(matches!(timer.get(&request).await, Err(ProbeError::Timeout(_))));
    }
}
