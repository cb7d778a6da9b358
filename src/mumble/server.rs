use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mumble_protocol_2x::ping::{PingPacket, PongPacket};
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;

use crate::mumble::config::MumbleConfig;
use crate::transport::errors::ConnectError;
use crate::transport::tls::TlsTransport;
use crate::transport::types::{ProtocolVersion, ServerStatus};

const STATUS_REPLY_LEN: usize = 24;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub accept_invalid_certs: bool,
    /// PEM bundle holding the client certificate and its private key.
    pub cert_pem: Option<String>,
}

/// Where a server lives. Connecting and probing are both stateless.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl ServerDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_config(config: &MumbleConfig) -> Self {
        Self::new(config.server.trim(), config.port)
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>, ConnectError> {
        let dns_error = |source| ConnectError::Dns {
            host: self.host.clone(),
            source,
        };
        let addrs: Vec<_> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(dns_error)?
            .collect();
        if addrs.is_empty() {
            return Err(dns_error(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses",
            )));
        }
        Ok(addrs)
    }

    fn connect_tcp(&self) -> Result<TcpStream, ConnectError> {
        let mut last_error = None;
        for addr in self.resolve()? {
            match TcpStream::connect(addr) {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    log::debug!("connect to {addr} failed: {error}");
                    last_error = Some(error);
                }
            }
        }
        Err(match last_error {
            Some(error) if error.kind() == io::ErrorKind::ConnectionRefused => {
                ConnectError::Refused(self.to_string())
            }
            Some(error) => ConnectError::Io(error),
            None => ConnectError::Refused(self.to_string()),
        })
    }

    /// Opens a TLS session with Nagle disabled.
    pub fn connect(&self, tls: &TlsOptions) -> Result<TlsTransport, ConnectError> {
        let tcp = self.connect_tcp()?;
        tcp.set_nodelay(true)?;

        let mut builder = SslConnector::builder(SslMethod::tls())
            .map_err(|err| ConnectError::Tls(format!("tls connector init failed: {err}")))?;
        if tls.accept_invalid_certs {
            builder.set_verify(SslVerifyMode::NONE);
        }
        if let Some(pem) = &tls.cert_pem {
            let cert = X509::from_pem(pem.as_bytes())
                .map_err(|err| ConnectError::Tls(format!("invalid client certificate: {err}")))?;
            let key = PKey::private_key_from_pem(pem.as_bytes())
                .map_err(|err| ConnectError::Tls(format!("invalid client key: {err}")))?;
            let rejected = |err| ConnectError::Tls(format!("client identity rejected: {err}"));
            builder.set_certificate(&cert).map_err(rejected)?;
            builder.set_private_key(&key).map_err(rejected)?;
        }
        let mut session = builder
            .build()
            .configure()
            .map_err(|err| ConnectError::Tls(format!("tls session init failed: {err}")))?;
        if tls.accept_invalid_certs {
            session.set_verify_hostname(false);
        }
        let stream = session
            .connect(&self.host, tcp)
            .map_err(|err| ConnectError::Tls(err.to_string()))?;
        log::info!("connected to {self}");
        Ok(TlsTransport::new(stream)?)
    }

    /// Sends one status request datagram. A missing or foreign reply within `timeout` is `Ok(None)`.
    pub fn probe(&self, timeout: Duration) -> Result<Option<ServerStatus>, ConnectError> {
        let addr = self.resolve()?[0];
        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let ident = request_id();
        let request = <[u8; 12]>::from(PingPacket { id: ident });
        let sent_at = Instant::now();
        socket.send_to(&request, addr)?;

        let mut reply = [0u8; 64];
        let read = match socket.recv_from(&mut reply) {
            Ok((read, _)) => read,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                log::warn!("{self} did not answer the status probe");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };
        let status = parse_status_reply(&reply[..read], ident, sent_at.elapsed());
        if status.is_none() {
            log::warn!("{self} sent an unrecognised status reply ({read} bytes)");
        }
        Ok(status)
    }
}

fn request_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

/// Reads the fixed-size status reply. Bytes past it are ignored; a foreign id yields `None`.
pub fn parse_status_reply(reply: &[u8], ident: u64, latency: Duration) -> Option<ServerStatus> {
    let pong = PongPacket::try_from(reply.get(..STATUS_REPLY_LEN)?).ok()?;
    if pong.id != ident {
        return None;
    }
    Some(ServerStatus {
        version: ProtocolVersion::from_packed(pong.version),
        users: pong.users,
        max_users: pong.max_users,
        max_bandwidth: pong.bandwidth,
        latency,
    })
}
