//! Framed Connection
//!
//! A byte stream, optionally TLS-wrapped, with the line-oriented send
//! and receive helpers the grid protocols are built on, plus per
//! connection statistics.

use std::io::IoSlice;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsStream;

use crate::error::{Error, Result};

/// Data must arrive within this window once we start waiting for it.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Granularity of the shutdown probe while blocked in accept.
const ACCEPT_TICK: Duration = Duration::from_secs(1);

const LINE_TERMINATOR: u8 = b'\n';

/// Per-connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnStat {
    pub num_sent_buffers: u64,
    pub num_sent_bytes: u64,
    pub num_rec_buffers: u64,
    pub num_rec_bytes: u64,
    pub num_send_errors: u64,
    pub num_send_timeouts: u64,
    pub is_connected: bool,
    pub peer_addr: String,
    pub local_addr: String,
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Plain(s) => s.is_write_vectored(),
            Stream::Tls(s) => s.is_write_vectored(),
        }
    }
}

/// A framed, optionally TLS-wrapped connection.
pub struct Connection {
    stream: Stream,
    read_buf: BytesMut,
    pushed_back: Vec<String>,
    pub stat: ConnStat,
    read_timeout: Duration,
}

impl Connection {
    /// Connect to `address`, waiting at most `connect_timeout`.
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Connection> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::ConnectionTimeout(address.to_string()))?
            .map_err(|e| Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an accepted or connected TCP stream.
    pub fn from_stream(stream: TcpStream) -> Connection {
        let mut stat = ConnStat {
            is_connected: true,
            ..Default::default()
        };
        if let Ok(addr) = stream.peer_addr() {
            stat.peer_addr = addr.to_string();
        }
        if let Ok(addr) = stream.local_addr() {
            stat.local_addr = addr.to_string();
        }
        Connection {
            stream: Stream::Plain(stream),
            read_buf: BytesMut::with_capacity(8 * 1024),
            pushed_back: Vec::new(),
            stat,
            read_timeout: READ_TIMEOUT,
        }
    }

    /// Upgrade the client side of the connection to TLS.
    pub async fn upgrade_tls_client(
        self,
        connector: tokio_rustls::TlsConnector,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Result<Connection> {
        let Stream::Plain(tcp) = self.stream else {
            return Err(Error::Internal("connection already TLS wrapped".into()));
        };
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Network(format!("TLS handshake failed: {}", e)))?;
        Ok(Connection {
            stream: Stream::Tls(Box::new(TlsStream::Client(tls))),
            read_buf: self.read_buf,
            pushed_back: self.pushed_back,
            stat: self.stat,
            read_timeout: self.read_timeout,
        })
    }

    /// Upgrade the server side of the connection to TLS.
    pub async fn upgrade_tls_server(
        self,
        acceptor: tokio_rustls::TlsAcceptor,
    ) -> Result<Connection> {
        let Stream::Plain(tcp) = self.stream else {
            return Err(Error::Internal("connection already TLS wrapped".into()));
        };
        let tls = acceptor
            .accept(tcp)
            .await
            .map_err(|e| Error::Network(format!("TLS handshake failed: {}", e)))?;
        Ok(Connection {
            stream: Stream::Tls(Box::new(TlsStream::Server(tls))),
            read_buf: self.read_buf,
            pushed_back: self.pushed_back,
            stat: self.stat,
            read_timeout: self.read_timeout,
        })
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn peer_addr(&self) -> &str {
        &self.stat.peer_addr
    }

    /// Send one CR-terminated line.
    pub async fn send_with_cr(&mut self, line: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(LINE_TERMINATOR);
        match self.stream.write_all(&buf).await {
            Ok(()) => {
                self.stream.flush().await?;
                self.stat.num_sent_buffers += 1;
                self.stat.num_sent_bytes += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stat.num_send_errors += 1;
                Err(e.into())
            }
        }
    }

    /// Send the empty line terminating a protocol message.
    pub async fn send_empty_line(&mut self) -> Result<()> {
        self.send_with_cr("").await
    }

    /// Receive one line without its terminator. Lines pushed back by an
    /// optional receive are returned first.
    pub async fn rec_with_cr(&mut self) -> Result<String> {
        if let Some(line) = self.pushed_back.pop() {
            return Ok(line);
        }
        loop {
            if let Some(pos) = self
                .read_buf
                .iter()
                .position(|&b| b == LINE_TERMINATOR)
            {
                let line = self.read_buf.split_to(pos + 1);
                let text = std::str::from_utf8(&line[..pos])
                    .map_err(|_| Error::Protocol("line is not valid UTF-8".into()))?
                    .to_string();
                self.stat.num_rec_buffers += 1;
                self.stat.num_rec_bytes += (pos + 1) as u64;
                return Ok(text);
            }
            let n = tokio::time::timeout(self.read_timeout, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| Error::DataTimeout)??;
            if n == 0 {
                return Err(Error::Network("connection closed by peer".into()));
            }
        }
    }

    /// Return a line so the next `rec_with_cr` sees it again.
    pub fn push_back_line(&mut self, line: String) {
        self.pushed_back.push(line);
    }

    /// Write a raw byte block.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self.stream.write_all(data).await {
            Ok(()) => {
                self.stream.flush().await?;
                self.stat.num_sent_buffers += 1;
                self.stat.num_sent_bytes += data.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stat.num_send_errors += 1;
                Err(e.into())
            }
        }
    }

    /// Gathered write of several buffers; returns once all bytes are on
    /// the wire.
    pub async fn write_vectored_all(&mut self, bufs: &[&[u8]]) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut written = 0usize;
        let mut slices: Vec<IoSlice<'_>> = bufs.iter().map(|b| IoSlice::new(b)).collect();
        while written < total {
            let n = match self.stream.write_vectored(&slices).await {
                Ok(n) => n,
                Err(e) => {
                    self.stat.num_send_errors += 1;
                    return Err(e.into());
                }
            };
            written += n;
            if written >= total {
                break;
            }
            // Drop fully written slices, trim the partially written one.
            let mut rebuilt: Vec<IoSlice<'_>> = Vec::with_capacity(slices.len());
            let mut consumed_before = 0usize;
            for b in bufs.iter() {
                let len = b.len();
                let consumed_here = written.saturating_sub(consumed_before).min(len);
                if consumed_here < len {
                    rebuilt.push(IoSlice::new(&b[consumed_here..]));
                }
                consumed_before += len;
            }
            slices = rebuilt;
        }
        self.stat.num_sent_buffers += bufs.len() as u64;
        self.stat.num_sent_bytes += total as u64;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes, returning 0 at end of stream. Any
    /// bytes buffered by line reads are drained first.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.len());
            buf[..n].copy_from_slice(&self.read_buf[..n]);
            self.read_buf.advance(n);
            self.stat.num_rec_bytes += n as u64;
            return Ok(n);
        }
        let n = tokio::time::timeout(self.read_timeout, self.stream.read(buf))
            .await
            .map_err(|_| Error::DataTimeout)??;
        self.stat.num_rec_buffers += 1;
        self.stat.num_rec_bytes += n as u64;
        Ok(n)
    }

    /// Read exactly `buf.len()` bytes.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_into(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::Network("connection closed by peer".into()));
            }
            filled += n;
        }
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Split into independently owned read and write halves. Used once
    /// a connection turns into a transporter, where one task reads and
    /// another writes the same socket. Bytes already buffered by line
    /// reads stay with the read half.
    pub fn into_halves(self) -> (ReadConn, WriteConn) {
        let (r, w) = tokio::io::split(self.stream);
        (
            ReadConn {
                inner: r,
                buffered: self.read_buf,
                read_timeout: self.read_timeout,
            },
            WriteConn { inner: w },
        )
    }
}

/// Read half of a split connection.
pub struct ReadConn {
    inner: tokio::io::ReadHalf<Stream>,
    buffered: BytesMut,
    read_timeout: Duration,
}

impl ReadConn {
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Read up to `buf.len()` bytes; 0 means end of stream.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(buf.len());
            buf[..n].copy_from_slice(&self.buffered[..n]);
            self.buffered.advance(n);
            return Ok(n);
        }
        let n = tokio::time::timeout(self.read_timeout, self.inner.read(buf))
            .await
            .map_err(|_| Error::DataTimeout)??;
        Ok(n)
    }
}

/// Write half of a split connection.
pub struct WriteConn {
    inner: tokio::io::WriteHalf<Stream>,
}

impl WriteConn {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Gathered write; returns once every byte is on the wire.
    pub async fn write_vectored_all(&mut self, bufs: &[&[u8]]) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut written = 0usize;
        let mut slices: Vec<IoSlice<'_>> = bufs.iter().map(|b| IoSlice::new(b)).collect();
        while written < total {
            let n = self.inner.write_vectored(&slices).await?;
            written += n;
            if written >= total {
                break;
            }
            let mut rebuilt: Vec<IoSlice<'_>> = Vec::with_capacity(slices.len());
            let mut consumed_before = 0usize;
            for b in bufs.iter() {
                let len = b.len();
                let consumed_here = written.saturating_sub(consumed_before).min(len);
                if consumed_here < len {
                    rebuilt.push(IoSlice::new(&b[consumed_here..]));
                }
                consumed_before += len;
            }
            slices = rebuilt;
        }
        self.inner.flush().await?;
        Ok(())
    }
}

/// A listening socket with a 1-second shutdown probe, so a blocked
/// accept loop can be asked to exit.
pub struct Listener {
    inner: TcpListener,
    shutdown_rx: watch::Receiver<bool>,
}

impl Listener {
    pub async fn bind(address: &str, shutdown_rx: watch::Receiver<bool>) -> Result<Listener> {
        let inner = TcpListener::bind(address).await.map_err(|e| {
            Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Listener { inner, shutdown_rx })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept one connection; `None` means shutdown was requested.
    pub async fn accept(&mut self) -> Result<Option<Connection>> {
        let mut tick = tokio::time::interval(ACCEPT_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = self.inner.accept() => {
                    let (stream, _) = result?;
                    stream.set_nodelay(true)?;
                    return Ok(Some(Connection::from_stream(stream)));
                }
                _ = tick.tick() => {
                    if *self.shutdown_rx.borrow() {
                        return Ok(None);
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = client.await.unwrap();
        (Connection::from_stream(client), Connection::from_stream(server))
    }

    #[tokio::test]
    async fn test_line_round_trip() {
        let (mut a, mut b) = pair().await;
        a.send_with_cr("get nodeid").await.unwrap();
        a.send_empty_line().await.unwrap();
        assert_eq!(b.rec_with_cr().await.unwrap(), "get nodeid");
        assert_eq!(b.rec_with_cr().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_push_back() {
        let (mut a, mut b) = pair().await;
        a.send_with_cr("first").await.unwrap();
        let line = b.rec_with_cr().await.unwrap();
        b.push_back_line(line);
        assert_eq!(b.rec_with_cr().await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_stats_track_bytes() {
        let (mut a, mut b) = pair().await;
        a.send_with_cr("xyz").await.unwrap();
        assert_eq!(a.stat.num_sent_buffers, 1);
        assert_eq!(a.stat.num_sent_bytes, 4);
        let _ = b.rec_with_cr().await.unwrap();
        assert_eq!(b.stat.num_rec_bytes, 4);
    }

    #[tokio::test]
    async fn test_vectored_write_delivers_in_order() {
        let (mut a, mut b) = pair().await;
        let bufs: Vec<&[u8]> = vec![b"abc", b"defg", b"h"];
        a.write_vectored_all(&bufs).await.unwrap();
        let mut out = [0u8; 8];
        b.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut a, _b) = pair().await;
        a.set_read_timeout(Duration::from_millis(50));
        let err = a.rec_with_cr().await.unwrap_err();
        assert!(matches!(err, Error::DataTimeout));
    }

    #[tokio::test]
    async fn test_listener_shutdown() {
        let (tx, rx) = watch::channel(false);
        let mut listener = Listener::bind("127.0.0.1:0", rx).await.unwrap();
        tx.send(true).unwrap();
        let accepted = listener.accept().await.unwrap();
        assert!(accepted.is_none());
    }
}
