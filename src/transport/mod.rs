use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, ServerConfig,
    ServerConnection, SignatureScheme, StreamOwned,
};

use crate::wire::codec::{CodecError, FrameReader, DEFAULT_MAX_FRAME_SIZE_BYTES};
use crate::wire::message::Message;

/// Read timeout used to slice blocking reads, so broadcast writes can
/// interleave and shutdown is observed promptly.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum TransportError {
    Bind {
        address: String,
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
    Connect {
        address: String,
        source: io::Error,
    },
    CertificateRead {
        path: PathBuf,
        source: io::Error,
    },
    CertificateParse {
        path: PathBuf,
        message: String,
    },
    NoCertificates {
        path: PathBuf,
    },
    NoPrivateKey {
        path: PathBuf,
    },
    InvalidHostname {
        hostname: String,
    },
    Tls(rustls::Error),
    Io(io::Error),
    Codec(CodecError),
    ConnectionClosed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TLS listener on {address}: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept TLS connection: {source}"),
            Self::Connect { address, source } => {
                write!(f, "failed to connect to {address}: {source}")
            }
            Self::CertificateRead { path, source } => {
                write!(f, "failed to read '{}': {source}", path.display())
            }
            Self::CertificateParse { path, message } => {
                write!(f, "failed to parse PEM in '{}': {message}", path.display())
            }
            Self::NoCertificates { path } => {
                write!(f, "no certificates found in '{}'", path.display())
            }
            Self::NoPrivateKey { path } => {
                write!(f, "no private key found in '{}'", path.display())
            }
            Self::InvalidHostname { hostname } => {
                write!(f, "'{hostname}' is not a valid TLS server name")
            }
            Self::Tls(source) => write!(f, "TLS error: {source}"),
            Self::Io(source) => write!(f, "transport I/O error: {source}"),
            Self::Codec(source) => write!(f, "framing error: {source}"),
            Self::ConnectionClosed => write!(f, "connection closed by peer"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(source: io::Error) -> Self {
        Self::Io(source)
    }
}

impl From<rustls::Error> for TransportError {
    fn from(source: rustls::Error) -> Self {
        Self::Tls(source)
    }
}

impl From<CodecError> for TransportError {
    fn from(source: CodecError) -> Self {
        Self::Codec(source)
    }
}

/// True for the error kinds a sliced blocking read produces when no data
/// arrived within the poll interval.
pub fn is_poll_timeout(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|source| TransportError::CertificateRead {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TransportError::CertificateParse {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TransportError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|source| TransportError::CertificateRead {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let key = rustls_pemfile::private_key(&mut reader).map_err(|source| {
        TransportError::CertificateParse {
            path: path.to_path_buf(),
            message: source.to_string(),
        }
    })?;

    key.ok_or_else(|| TransportError::NoPrivateKey {
        path: path.to_path_buf(),
    })
}

/// Server-mode TLS listener. Accepts are non-blocking polls so the accept
/// loop can watch the stop signal between attempts.
pub struct TlsListener {
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
    next_connection_id: AtomicU64,
}

impl TlsListener {
    pub fn bind(
        host: &str,
        port: u16,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, TransportError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        let tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        let address = format!("{host}:{port}");
        let listener = TcpListener::bind(&address)
            .map_err(|source| TransportError::Bind { address, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::Accept { source })?;

        Ok(Self {
            listener,
            tls_config: Arc::new(tls_config),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Polls for one pending connection; `None` when nothing is waiting.
    pub fn try_accept(&self) -> Result<Option<Arc<ServerChannel>>, TransportError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                let channel =
                    ServerChannel::new(id, stream, peer_addr, Arc::clone(&self.tls_config))?;
                Ok(Some(Arc::new(channel)))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(TransportError::Accept { source }),
        }
    }
}

/// One accepted TLS connection. The owning worker reads in poll slices; the
/// single stream mutex lets broadcast sends interleave between those slices.
pub struct ServerChannel {
    id: u64,
    peer_addr: SocketAddr,
    stream: Mutex<StreamOwned<ServerConnection, TcpStream>>,
}

impl ServerChannel {
    fn new(
        id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        tls_config: Arc<ServerConfig>,
    ) -> Result<Self, TransportError> {
        stream
            .set_nonblocking(false)
            .map_err(|source| TransportError::Accept { source })?;
        stream
            .set_nodelay(true)
            .map_err(|source| TransportError::Accept { source })?;
        stream
            .set_read_timeout(Some(READ_POLL_INTERVAL))
            .map_err(|source| TransportError::Accept { source })?;

        let connection = ServerConnection::new(tls_config)?;

        Ok(Self {
            id,
            peer_addr,
            stream: Mutex::new(StreamOwned::new(connection, stream)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// One sliced read. `Ok(0)` means EOF; poll-timeout kinds mean no data
    /// this slice.
    pub fn read_chunk(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.stream
            .lock()
            .expect("server channel lock poisoned")
            .read(buffer)
    }

    /// Writes one message with its stream length prefix. A send either
    /// writes everything or fails.
    pub fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        let bytes = message.serialize_stream();
        let mut stream = self.stream.lock().expect("server channel lock poisoned");
        stream.write_all(&bytes)?;
        stream.flush()?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let stream = self.stream.lock().expect("server channel lock poisoned");
        let _ = stream.sock.shutdown(std::net::Shutdown::Both);
    }
}

/// Development-mode verifier: signature checks still run, but any server
/// certificate is accepted. Used only when no CA file is configured.
#[derive(Debug)]
struct AcceptAnyServerCert {
    supported: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            supported: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Client side of the transport: blocking dial, send, and receive.
pub struct ClientChannel {
    stream: StreamOwned<ClientConnection, TcpStream>,
    reader: FrameReader,
}

impl ClientChannel {
    /// Connects and performs the TLS handshake. With a CA file the peer is
    /// verified against it; without one, verification is disabled
    /// (development mode).
    pub fn dial(hostname: &str, port: u16, ca_file: Option<&Path>) -> Result<Self, TransportError> {
        let config = match ca_file {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots.add(cert)?;
                }
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            None => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
                .with_no_client_auth(),
        };

        let server_name = ServerName::try_from(hostname.to_owned()).map_err(|_| {
            TransportError::InvalidHostname {
                hostname: hostname.to_owned(),
            }
        })?;
        let connection = ClientConnection::new(Arc::new(config), server_name)?;

        let address = format!("{hostname}:{port}");
        let tcp = TcpStream::connect(&address)
            .map_err(|source| TransportError::Connect { address, source })?;
        tcp.set_nodelay(true)?;

        Ok(Self {
            stream: StreamOwned::new(connection, tcp),
            reader: FrameReader::new(DEFAULT_MAX_FRAME_SIZE_BYTES),
        })
    }

    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.sock.set_read_timeout(timeout)
    }

    pub fn send_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let bytes = message.serialize_stream();
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Blocks until one complete frame arrives, then parses it.
    pub fn receive_message(&mut self) -> Result<Message, TransportError> {
        let mut buffer = [0_u8; 4096];
        loop {
            if let Some(frame) = self.reader.next_frame()? {
                return Ok(Message::deserialize(&frame)?);
            }

            match self.stream.read(&mut buffer) {
                Ok(0) => return Err(TransportError::ConnectionClosed),
                Ok(size) => self.reader.push(&buffer[..size]),
                Err(source) => return Err(TransportError::Io(source)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{load_certs, load_private_key, TlsListener, TransportError};

    fn temp_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "faregate-transport-test-{suffix}-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).expect("temp dir should create");
        dir
    }

    fn write_self_signed(dir: &PathBuf) -> (PathBuf, PathBuf) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
            .expect("self-signed certificate should generate");
        let cert_path = dir.join("server.crt");
        let key_path = dir.join("server.key");
        fs::write(&cert_path, certified.cert.pem()).expect("cert should write");
        fs::write(&key_path, certified.key_pair.serialize_pem()).expect("key should write");
        (cert_path, key_path)
    }

    #[test]
    fn loads_generated_certificate_and_key() {
        let dir = temp_dir("pem");
        let (cert_path, key_path) = write_self_signed(&dir);

        let certs = load_certs(&cert_path).expect("certs should load");
        assert_eq!(certs.len(), 1);
        load_private_key(&key_path).expect("key should load");

        fs::remove_dir_all(dir).expect("temp dir cleanup should succeed");
    }

    #[test]
    fn missing_certificate_file_names_the_path() {
        let dir = temp_dir("missing");
        let error = load_certs(&dir.join("nope.crt")).expect_err("missing file should fail");
        assert!(matches!(error, TransportError::CertificateRead { .. }));
        fs::remove_dir_all(dir).expect("temp dir cleanup should succeed");
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let dir = temp_dir("empty-pem");
        let path = dir.join("empty.crt");
        fs::write(&path, "not a certificate\n").expect("file should write");

        let error = load_certs(&path).expect_err("empty PEM should fail");
        assert!(matches!(error, TransportError::NoCertificates { .. }));
        fs::remove_dir_all(dir).expect("temp dir cleanup should succeed");
    }

    #[test]
    fn listener_binds_ephemeral_port_and_polls_empty() {
        let dir = temp_dir("bind");
        let (cert_path, key_path) = write_self_signed(&dir);

        let listener = TlsListener::bind("127.0.0.1", 0, &cert_path, &key_path)
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr should exist");
        assert_ne!(addr.port(), 0);
        assert!(listener
            .try_accept()
            .expect("empty poll should not fail")
            .is_none());

        fs::remove_dir_all(dir).expect("temp dir cleanup should succeed");
    }
}
