//! The transport: a single duplex connection with a write-mutex-serialized
//! request/reply exchange.

use bson::Document;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::wire::{self, CompressorId};

/// Either a plain TCP stream or (behind the `tls` feature) a TLS stream wrapping one. This
/// is the stream type `Connection::connect` produces; tests exercise `Connection<S>`
/// directly against an in-memory `tokio::io::DuplexStream` instead.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => std::pin::Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One live connection to a `mongod`/`mongos`. Owns the socket exclusively; a write mutex
/// serializes full request/response exchanges so replies can be correlated by request id
/// without a background reader task.
///
/// Generic over the underlying duplex stream so tests can drive it against an in-memory
/// `tokio::io::duplex` pair instead of a real socket.
pub struct Connection<S = Stream> {
    stream: Mutex<S>,
    request_ids: wire::RequestIdAllocator,
    compressor: Option<CompressorId>,
    /// Set once an exchange fails partway through (a short read, a write error, or a
    /// cancellation mid-exchange). Once poisoned every subsequent exchange fails fast
    /// instead of touching the socket again, since reply ordering can no longer be trusted.
    poisoned: std::sync::atomic::AtomicBool,
}

impl Connection<Stream> {
    /// Open a plain TCP connection to `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with_tls(host, port, false).await
    }

    /// Open a connection to `host:port`, upgrading to TLS first if `tls` is set. Mirrors
    /// the `tls=true|false` connection string option in §6.
    #[tracing::instrument(level = "debug", fields(host = %host, port, tls))]
    pub async fn connect_with_tls(host: &str, port: u16, tls: bool) -> Result<Self> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::transport(format!("failed to connect to {host}:{port}: {e}")))?;
        let stream = open_stream(tcp, host, tls).await?;
        tracing::debug!("connection established");
        Ok(Self::from_stream(stream))
    }
}

#[cfg(feature = "tls")]
async fn open_stream(tcp: TcpStream, host: &str, tls: bool) -> Result<Stream> {
    if !tls {
        return Ok(Stream::Tcp(tcp));
    }

    use std::sync::Arc;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    static INSTALL_CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();
    });

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::transport(format!("invalid TLS server name: {host}")))?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::transport(format!("TLS handshake with {host} failed: {e}")))?;
    Ok(Stream::Tls(Box::new(tls_stream)))
}

#[cfg(not(feature = "tls"))]
async fn open_stream(tcp: TcpStream, host: &str, tls: bool) -> Result<Stream> {
    if tls {
        return Err(Error::transport(format!(
            "TLS was requested for {host} but this build was compiled without the `tls` feature"
        )));
    }
    Ok(Stream::Tcp(tcp))
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream: Mutex::new(stream),
            request_ids: wire::RequestIdAllocator::new(),
            compressor: None,
            poisoned: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Record the compressor negotiated during the `hello` handshake, if any.
    pub fn set_compressor(&mut self, compressor: Option<CompressorId>) {
        self.compressor = compressor;
    }

    fn check_not_poisoned(&self) -> Result<()> {
        if self.poisoned.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::transport(
                "connection is poisoned by a prior failed exchange and can no longer be used",
            ));
        }
        Ok(())
    }

    fn poison(&self) {
        self.poisoned
            .store(true, std::sync::atomic::Ordering::Release);
    }

    /// Send `body` as a command against `db_name` and return the decoded reply document.
    /// This is the crate's single suspension-bearing exchange: acquire the write lock,
    /// write the request, read the header, read the body, release the lock. A short read,
    /// short write, or cancellation anywhere in this sequence poisons the connection.
    pub async fn exchange(&self, body: Document, db_name: &str) -> Result<Document> {
        self.check_not_poisoned()?;
        let request_id = self.request_ids.next();
        let bytes = wire::encode_request(body, db_name, request_id, self.compressor)?;

        let mut guard = self.stream.lock().await;
        if let Err(e) = wire::write_request(&mut *guard, &bytes).await {
            self.poison();
            return Err(e);
        }
        match wire::read_reply(&mut *guard, request_id).await {
            Ok(doc) => Ok(doc),
            Err(e) => {
                self.poison();
                Err(e)
            }
        }
    }

    /// Write `body` against `db_name` without waiting for a reply. Used for commands like
    /// `shutdown` where the server tears the connection down instead of replying; a normal
    /// `exchange` would hang (or fail) waiting on a response that never comes.
    pub async fn send_no_reply(&self, body: Document, db_name: &str) -> Result<()> {
        self.check_not_poisoned()?;
        let request_id = self.request_ids.next();
        let bytes = wire::encode_request(body, db_name, request_id, self.compressor)?;

        let mut guard = self.stream.lock().await;
        if let Err(e) = wire::write_request(&mut *guard, &bytes).await {
            self.poison();
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn exchanges_a_request_for_a_reply_over_a_fake_server() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let conn = Connection::from_stream(client_side);

        let server = tokio::spawn(async move {
            let header = wire::Header::read_from(&mut server_side).await.unwrap();
            let body_len = header.body_length().unwrap();
            let mut body = vec![0u8; body_len];
            server_side.read_exact(&mut body).await.unwrap();

            let reply = wire::encode_request(doc! { "ok": 1.0 }, "admin", 0, None).unwrap();
            let mut reply = reply;
            reply[8..12].copy_from_slice(&header.request_id.to_le_bytes());
            server_side.write_all(&reply).await.unwrap();
            server_side.flush().await.unwrap();
        });

        let reply = conn.exchange(doc! { "ping": 1 }, "admin").await.unwrap();
        assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn short_read_poisons_the_connection() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let conn = Connection::from_stream(client_side);

        let server = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = server_side.read(&mut buf).await;
            // Drop the server side without replying; the client's exact-read fails.
        });

        let result = conn.exchange(doc! { "ping": 1 }, "admin").await;
        assert!(result.is_err());
        assert!(conn.check_not_poisoned().is_err());
        server.await.unwrap();
    }
}
