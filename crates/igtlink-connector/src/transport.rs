//! Socket side of a connector: listen or connect, read frames, write bytes.
//!
//! The transport never changes connector state itself. Each call to
//! [`MessageTransport::periodic_process`] reports what happened as a
//! [`TransportSignal`] plus the frames decoded in that call; the session
//! decides what the signal means.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use bytes::BytesMut;
use igtlink_wire::{IgtlCodec, RawMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

const READ_CHUNK: usize = 64 * 1024;
/// Upper bound on reads per cycle so one busy peer cannot stall the caller
const MAX_READS_PER_CYCLE: usize = 16;

/// Connection-level outcome of one transport cycle
#[derive(Debug)]
pub enum TransportSignal {
    /// Server accepted a peer
    Accepted(SocketAddr),
    /// Client connect completed
    Connected(SocketAddr),
    /// Client connect attempt failed
    ConnectFailed(io::Error),
    /// Established connection closed or failed; the stream is gone
    Disconnected(String),
}

#[derive(Debug, Default)]
pub struct TransportPoll {
    pub signal: Option<TransportSignal>,
    /// Complete frames in arrival order
    pub messages: Vec<RawMessage>,
    /// Frames discarded for checksum mismatch
    pub dropped: usize,
}

pub struct MessageTransport {
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    connecting: Option<ConnectFuture>,
    read_buf: BytesMut,
    codec: IgtlCodec,
    check_crc: bool,
}

impl std::fmt::Debug for MessageTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTransport")
            .field("listening", &self.listener.is_some())
            .field("connected", &self.stream.is_some())
            .field("connecting", &self.connecting.is_some())
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

impl MessageTransport {
    #[must_use]
    pub fn new(check_crc: bool) -> Self {
        Self {
            listener: None,
            stream: None,
            connecting: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            codec: Self::make_codec(check_crc),
            check_crc,
        }
    }

    fn make_codec(check_crc: bool) -> IgtlCodec {
        if check_crc {
            IgtlCodec::new()
        } else {
            IgtlCodec::without_crc_check()
        }
    }

    /// Bind a listening socket on all interfaces.
    ///
    /// # Errors
    ///
    /// Returns the bind error, e.g. when the port is in use.
    pub async fn start_as_server(&mut self, port: u16) -> io::Result<()> {
        self.stop();
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        debug!("Listening on {}", listener.local_addr()?);
        self.listener = Some(listener);
        Ok(())
    }

    /// Begin a connect attempt. Completion is observed by later
    /// [`periodic_process`](Self::periodic_process) calls.
    pub fn start_as_client(&mut self, host: &str, port: u16) {
        self.close_stream();
        let addr = format!("{host}:{port}");
        debug!("Connecting to {addr}");
        self.connecting = Some(Box::pin(async move { TcpStream::connect(addr).await }));
    }

    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.connecting.is_some()
    }

    #[must_use]
    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Address of the listening socket, or of the local end of the stream.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(listener) = &self.listener {
            return listener.local_addr().ok();
        }
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Run one I/O cycle within `budget`.
    ///
    /// Polls the pending connect or accept if there is no stream; otherwise
    /// waits for readability, reads what is available and decodes complete
    /// frames.
    pub async fn periodic_process(&mut self, budget: Duration) -> TransportPoll {
        let mut poll = TransportPoll::default();

        if let Some(connecting) = self.connecting.as_mut() {
            match timeout(budget, connecting).await {
                Ok(Ok(stream)) => {
                    self.connecting = None;
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {e}");
                    }
                    let peer = stream
                        .peer_addr()
                        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
                    self.attach(stream);
                    poll.signal = Some(TransportSignal::Connected(peer));
                }
                Ok(Err(e)) => {
                    self.connecting = None;
                    poll.signal = Some(TransportSignal::ConnectFailed(e));
                }
                Err(_) => {}
            }
            return poll;
        }

        if self.stream.is_none() {
            if let Some(listener) = &self.listener {
                match timeout(budget, listener.accept()).await {
                    Ok(Ok((stream, addr))) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY: {e}");
                        }
                        self.attach(stream);
                        poll.signal = Some(TransportSignal::Accepted(addr));
                    }
                    Ok(Err(e)) => warn!("Accept failed: {e}"),
                    Err(_) => {}
                }
            }
            return poll;
        }

        if let Some(reason) = self.read(budget).await {
            self.decode_into(&mut poll);
            self.close_stream();
            poll.signal = Some(TransportSignal::Disconnected(reason));
            return poll;
        }

        if let Some(reason) = self.decode_into(&mut poll) {
            self.close_stream();
            poll.signal = Some(TransportSignal::Disconnected(reason));
        }
        poll
    }

    fn attach(&mut self, stream: TcpStream) {
        self.read_buf.clear();
        self.codec = Self::make_codec(self.check_crc);
        self.stream = Some(stream);
    }

    /// Read available bytes. Returns a reason when the connection is gone.
    async fn read(&mut self, budget: Duration) -> Option<String> {
        let stream = self.stream.as_ref()?;

        match timeout(budget, stream.readable()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Some(e.to_string()),
            Err(_) => return None,
        }

        for _ in 0..MAX_READS_PER_CYCLE {
            self.read_buf.reserve(READ_CHUNK);
            match stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Some("peer closed connection".to_string()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Some(e.to_string()),
            }
        }
        None
    }

    /// Decode buffered frames. Returns a reason when the stream is unusable.
    fn decode_into(&mut self, poll: &mut TransportPoll) -> Option<String> {
        loop {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(message)) => poll.messages.push(message),
                Ok(None) => return None,
                Err(e) if e.is_recoverable() => {
                    warn!("Dropping message: {e}");
                    poll.dropped += 1;
                }
                Err(e) => {
                    warn!("Unrecoverable framing error: {e}");
                    return Some(e.to_string());
                }
            }
        }
    }

    /// One non-blocking write attempt. Returns the number of bytes accepted,
    /// 0 when the socket is not ready.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` without a stream, or the socket error.
    pub fn try_write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let Some(stream) = &self.stream else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        match stream.try_write(bytes) {
            Ok(0) if !bytes.is_empty() => Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Drop the established connection, keeping any listener.
    pub fn close_stream(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed connection");
        }
        self.connecting = None;
        self.read_buf.clear();
        self.codec = Self::make_codec(self.check_crc);
    }

    /// Release every socket.
    pub fn stop(&mut self) {
        self.close_stream();
        self.listener = None;
    }
}
