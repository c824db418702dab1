//! A TLS 1.2+ transport to a single upstream, enforcing CN match plus an
//! optional pinned public-key set in addition to ordinary chain
//! verification. Connect/handshake/read/write are all bounded by a caller
//! timeout; on any failure the session is torn down so the next call starts
//! clean.
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{HardDnsError, HardDnsResult};
use crate::upstream::{PinnedKeySet, UpstreamDescriptor};

/// Poll interval used while waiting for a non-blocking socket or a pending
/// TLS handshake step to make progress.
const POLL_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct PinningVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected_cn: String,
    pinned: PinnedKeySet,
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        let (_, cert) = x509_parser::parse_x509_certificate(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(format!("certificate parse error: {}", e)))?;

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok())
            .ok_or_else(|| rustls::Error::General("peer certificate has no subject CN".into()))?;

        if cn != self.expected_cn {
            return Err(rustls::Error::General(format!(
                "peer CN {} does not match configured CN {}",
                cn, self.expected_cn
            )));
        }

        if !self.pinned.is_empty() {
            let spki = cert.public_key().raw;
            if !self.pinned.contains(spki) {
                return Err(rustls::Error::General("peer certificate not in pinned list".into()));
            }
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn root_store() -> RootCertStore {
    let mut store = RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    store
}

fn client_config(expected_cn: &str, pinned: PinnedKeySet) -> HardDnsResult<Arc<ClientConfig>> {
    let roots = root_store();
    let inner = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| HardDnsError::tls(e.to_string()))?;

    let verifier = PinningVerifier {
        inner,
        expected_cn: expected_cn.to_string(),
        pinned,
    };

    let mut config = ClientConfig::builder()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.enable_sni = true;

    Ok(Arc::new(config))
}

pub struct TlsTransport {
    pinned: PinnedKeySet,
    session: Option<(ClientConnection, TcpStream)>,
    peer_ip: Option<IpAddr>,
}

impl TlsTransport {
    pub fn new(pinned: PinnedKeySet) -> Self {
        TlsTransport {
            pinned,
            session: None,
            peer_ip: None,
        }
    }

    /// The upstream this transport is currently connected to, if any.
    pub fn peer(&self) -> Option<IpAddr> {
        self.peer_ip
    }

    pub fn close(&mut self) {
        self.session = None;
        self.peer_ip = None;
    }

    pub fn connect(&mut self, desc: &UpstreamDescriptor, timeout: Duration) -> HardDnsResult<()> {
        self.close();

        let half = timeout / 2;
        let addr = SocketAddr::new(desc.ip, desc.port);

        let stream = TcpStream::connect_timeout(&addr, half)
            .map_err(|e| HardDnsError::tls(format!("tcp connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(POLL_SLEEP))
            .map_err(HardDnsError::from)?;
        stream
            .set_write_timeout(Some(POLL_SLEEP))
            .map_err(HardDnsError::from)?;

        let config = client_config(&desc.cn, self.pinned.clone())?;
        let server_name = ServerName::try_from(desc.cn.clone())
            .map_err(|_| HardDnsError::tls(format!("invalid CN for SNI: {}", desc.cn)))?;
        let mut conn = ClientConnection::new(config, server_name)
            .map_err(|e| HardDnsError::tls(e.to_string()))?;

        let deadline = Instant::now() + (timeout - half);
        let mut tcp = stream;
        while conn.is_handshaking() {
            if Instant::now() >= deadline {
                return Err(HardDnsError::tls("TLS handshake timed out"));
            }
            match drive_io(&mut conn, &mut tcp) {
                Ok(()) => {}
                Err(WouldBlockOr::WouldBlock) => std::thread::sleep(POLL_SLEEP),
                Err(WouldBlockOr::Err(e)) => return Err(e),
            }
        }

        self.session = Some((conn, tcp));
        self.peer_ip = Some(desc.ip);
        Ok(())
    }

    pub fn send(&mut self, buf: &[u8], timeout: Duration) -> HardDnsResult<usize> {
        let (conn, tcp) = self.session.as_mut().ok_or_else(|| HardDnsError::tls("not connected"))?;
        conn.writer().write_all(buf).map_err(|e| {
            HardDnsError::tls(format!("tls write: {}", e))
        })?;

        let deadline = Instant::now() + timeout;
        let mut written = 0usize;
        while conn.wants_write() {
            if Instant::now() >= deadline {
                return Err(HardDnsError::tls("write timed out"));
            }
            match conn.write_tls(tcp) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::thread::sleep(POLL_SLEEP),
                Err(e) => {
                    self.close();
                    return Err(HardDnsError::tls(format!("peer closed connection: {}", e)));
                }
            }
        }
        Ok(if written == 0 { buf.len() } else { written })
    }

    /// Reads up to one 4 KiB chunk. Returns `Ok(0)` rather than an error when
    /// the read times out cleanly with no data pending.
    pub fn recv(&mut self, timeout: Duration) -> HardDnsResult<Vec<u8>> {
        let (conn, tcp) = self.session.as_mut().ok_or_else(|| HardDnsError::tls("not connected"))?;

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; 4096];

        loop {
            match conn.read_tls(tcp) {
                Ok(0) => return Ok(Vec::new()),
                Ok(_) => {
                    conn.process_new_packets().map_err(|e| HardDnsError::tls(e.to_string()))?;
                    let n = conn.reader().read(&mut buf).unwrap_or(0);
                    return Ok(buf[..n].to_vec());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(Vec::new());
                    }
                    std::thread::sleep(POLL_SLEEP);
                }
                Err(e) => {
                    self.close();
                    return Err(HardDnsError::tls(format!("read error: {}", e)));
                }
            }
        }
    }
}

enum WouldBlockOr {
    WouldBlock,
    Err(HardDnsError),
}

fn drive_io(conn: &mut ClientConnection, tcp: &mut TcpStream) -> Result<(), WouldBlockOr> {
    if conn.wants_write() {
        match conn.write_tls(tcp) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Err(WouldBlockOr::WouldBlock),
            Err(e) => return Err(WouldBlockOr::Err(HardDnsError::tls(e.to_string()))),
        }
    }
    if conn.wants_read() {
        match conn.read_tls(tcp) {
            Ok(0) => return Err(WouldBlockOr::Err(HardDnsError::tls("peer closed during handshake"))),
            Ok(_) => {
                conn.process_new_packets().map_err(|e| WouldBlockOr::Err(HardDnsError::tls(e.to_string())))?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Err(WouldBlockOr::WouldBlock),
            Err(e) => return Err(WouldBlockOr::Err(HardDnsError::tls(e.to_string()))),
        }
    }
    Ok(())
}
