//! TCP/TLS transport for the binary driver.
//!
//! [`Transport`] is a plain or TLS-wrapped `TcpStream` exposing `Read` and
//! `Write`. The native protocol codec sits on top of it and never needs to
//! know whether the bytes are encrypted.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use crate::error::{ConnError, ConnResult};
use crate::gate::DriverSettings;

// ── Transport ────────────────────────────────────────────────────────

/// Byte stream to the server, optionally TLS-wrapped.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tls = matches!(self, Transport::Tls(_));
        f.debug_struct("Transport").field("tls", &tls).finish()
    }
}

impl Transport {
    /// Open a TCP connection to `host:port`, wrapping it in TLS when `secure`.
    pub fn connect(
        host: &str,
        port: u16,
        secure: bool,
        settings: &DriverSettings,
    ) -> ConnResult<Self> {
        let target = format!("{host}:{port}");
        let addr = target
            .to_socket_addrs()
            .map_err(|e| ConnError::connect(&target, format!("dns resolution failed: {e}")))?
            .next()
            .ok_or_else(|| ConnError::connect(&target, "no address found"))?;

        let stream = TcpStream::connect_timeout(&addr, settings.connect_timeout)
            .map_err(|e| ConnError::connect(&target, e.to_string()))?;
        stream
            .set_read_timeout(Some(settings.recv_timeout))
            .map_err(|e| ConnError::connect(&target, format!("set recv timeout: {e}")))?;
        // Small request packets; latency matters more than batching.
        let _ = stream.set_nodelay(true);

        tracing::debug!(host = %host, port = port, tls = secure, "established tcp connection");

        if !secure {
            return Ok(Transport::Plain(stream));
        }

        let tls = TlsConfig::with_system_roots()?;
        let server_name = rustls::pki_types::ServerName::try_from(host)
            .map_err(|e| ConnError::connect(&target, format!("invalid tls server name: {e}")))?
            .to_owned();
        let session = rustls::ClientConnection::new(Arc::clone(&tls.client_config), server_name)
            .map_err(|e| ConnError::connect(&target, format!("tls session creation: {e}")))?;
        Ok(Transport::Tls(Box::new(rustls::StreamOwned::new(
            session, stream,
        ))))
    }

    fn tcp_stream(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => &s.sock,
        }
    }

    /// Shut down both directions of the socket. Errors are ignored; the
    /// peer may already be gone.
    pub fn shutdown(&self) {
        let _ = self.tcp_stream().shutdown(Shutdown::Both);
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

// ── TlsConfig ────────────────────────────────────────────────────────

/// Client TLS configuration.
#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
}

impl TlsConfig {
    /// TLS config trusting the Mozilla root certificate store.
    pub fn with_system_roots() -> ConnResult<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnError::protocol(format!("tls protocol version error: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(config),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────
