//! Connection establishment and pipeline installation.
//!
//! Given a resolved address, the connector opens the transport, performs
//! TLS + ALPN when the endpoint is https (advertising `h2` and `http/1.1`
//! when HTTP/2 is configured), and installs the protocol handlers the
//! negotiation picked. Cleartext HTTP/2 uses the prior-knowledge preface:
//! no upgrade dance is attempted, a refusing peer surfaces as a failed
//! handshake.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::config::{Http1Options, Http2Options, HttpVersion, NetOptions, Scheme, SslOptions};
use crate::proto::channel::{Channel, Outbound, WriteGauge};
use crate::proto::h1;
use crate::proto::h2;
use crate::proto::pool::Endpoint;
use crate::proto::registry::HandleRegistry;
use crate::{Error, Result};

pub(crate) struct Connector {
    version: HttpVersion,
    h2c_upgrade: bool,
    connect_timeout: Duration,
    net: NetOptions,
    h1_opts: Http1Options,
    h2_opts: Http2Options,
    ssl: SslOptions,
    tls: Arc<rustls::ClientConfig>,
}

impl Connector {
    pub(crate) fn new(
        version: HttpVersion,
        h2c_upgrade: bool,
        connect_timeout: Duration,
        net: NetOptions,
        h1_opts: Http1Options,
        h2_opts: Http2Options,
        ssl: SslOptions,
    ) -> Connector {
        let default_alpn = match version {
            HttpVersion::H2 => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            _ => vec![b"http/1.1".to_vec()],
        };
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = ssl.alpn_or(default_alpn);

        Connector {
            version,
            h2c_upgrade,
            connect_timeout,
            net,
            h1_opts,
            h2_opts,
            ssl,
            tls: Arc::new(config),
        }
    }

    /// Whether acquires for this client share one multiplexed connection
    /// per endpoint.
    pub(crate) fn attempts_h2(&self) -> bool {
        self.version == HttpVersion::H2
    }

    /// Connects to `addr` and installs the protocol pipeline.
    pub(crate) async fn connect(&self, endpoint: &Endpoint, addr: SocketAddr) -> Result<Channel> {
        let stream = self.open_tcp(addr).await?;
        trace!("connected to {} for {:?}", addr, endpoint);

        match endpoint.scheme {
            Scheme::Https => self.handshake_tls(endpoint, addr, stream).await,
            Scheme::Http => {
                if self.version == HttpVersion::H2 && self.h2c_upgrade {
                    // Prior-knowledge cleartext HTTP/2.
                    self.install_h2(stream, addr).await
                } else {
                    Ok(self.install_h1(stream, addr, self.h1_version()))
                }
            }
        }
    }

    async fn open_tcp(&self, addr: SocketAddr) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(Error::new_connect)?;
        socket
            .set_keepalive(self.net.is_so_keepalive())
            .map_err(Error::new_connect)?;

        let stream = tokio::time::timeout(self.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| Error::new_connect_timeout())?
            .map_err(Error::new_connect)?;
        stream
            .set_nodelay(self.net.is_tcp_nodelay())
            .map_err(Error::new_connect)?;
        Ok(stream)
    }

    async fn handshake_tls(
        &self,
        endpoint: &Endpoint,
        addr: SocketAddr,
        stream: TcpStream,
    ) -> Result<Channel> {
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(Error::new_handshake)?;
        let connector = TlsConnector::from(Arc::clone(&self.tls));
        let deadline = self.ssl.handshake_timeout_or(self.connect_timeout);

        let tls = tokio::time::timeout(deadline, connector.connect(server_name, stream))
            .await
            .map_err(|_| Error::new_handshake("tls handshake timed out"))?
            .map_err(Error::new_handshake)?;

        let negotiated_h2 = tls
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| p == b"h2")
            .unwrap_or(false);
        debug!(
            "tls handshake with {} done, alpn h2: {}",
            addr, negotiated_h2
        );

        if negotiated_h2 {
            self.install_h2(tls, addr).await
        } else {
            Ok(self.install_h1(tls, addr, self.h1_version()))
        }
    }

    fn h1_version(&self) -> HttpVersion {
        if self.version == HttpVersion::H1_0 {
            HttpVersion::H1_0
        } else {
            HttpVersion::H1_1
        }
    }

    fn install_h1<T>(&self, io: T, remote: SocketAddr, version: HttpVersion) -> Channel
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let registry = Arc::new(HandleRegistry::new(false));
        let gauge = Arc::new(WriteGauge::new(self.net.high_water_mark()));
        let active = Arc::new(AtomicBool::new(true));
        let outbound = h1::spawn_h1(
            io,
            Arc::clone(&registry),
            self.h1_opts.clone(),
            gauge,
            Arc::clone(&active),
        );
        Channel::new(remote, version, Arc::new(outbound), registry, active)
    }

    async fn install_h2<T>(&self, io: T, remote: SocketAddr) -> Result<Channel>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let registry = Arc::new(HandleRegistry::new(true));
        let active = Arc::new(AtomicBool::new(true));
        let outbound = h2::spawn_h2(
            io,
            Arc::clone(&registry),
            &self.h2_opts,
            Arc::clone(&active),
        )
        .await?;
        Ok(Channel::new(
            remote,
            HttpVersion::H2,
            Arc::new(outbound) as Arc<dyn Outbound>,
            registry,
            active,
        ))
    }
}
