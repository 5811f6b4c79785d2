use crate::logging;
use crate::net::frame::DELIMITER;
use crate::net::ring::RingBuffer;
use crate::net::shared::{
    ErrorType, NetworkError, NetworkResult, ERR_SOCKET_ACCEPT_CONN_FAILED,
    ERR_SOCKET_CONNECT_FAILED, ERR_SOCKET_INVALID_SEND_ATTEMPT, ERR_SOCKET_LISTEN_FAILED,
    ERR_SOCKET_RECV_FAILED, ERR_SOCKET_SEND_FAILED,
};
use mio::net::{TcpListener, TcpStream};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Per-connection inbound buffer size.
pub const SOCKET_BUF_SIZE: usize = 1024;

/// A non-blocking stream endpoint plus the inbound ring buffer that absorbs
/// partial reads. A single `Socket` acts as either a listener or a
/// connected stream, never both.
#[derive(Debug)]
pub struct Socket {
    stream: Option<TcpStream>,
    listener: Option<TcpListener>,
    peer_addr: Option<SocketAddr>,
    ring: RingBuffer,
    log: logging::Logger,
}

impl Socket {
    pub fn new() -> Socket {
        Socket {
            stream: None,
            listener: None,
            peer_addr: None,
            ring: RingBuffer::new(SOCKET_BUF_SIZE),
            log: logging::get(),
        }
    }

    pub(crate) fn from_stream(stream: TcpStream, peer_addr: SocketAddr) -> Socket {
        let mut sock = Socket::new();
        sock.stream = Some(stream);
        sock.peer_addr = Some(peer_addr);
        sock
    }

    #[inline]
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some() || self.listener.is_some()
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The locally bound address, once listening or connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(listener) = self.listener.as_ref() {
            return listener.local_addr().ok();
        }

        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// The connected stream, for readiness registration.
    pub(crate) fn stream_ref(&self) -> NetworkResult<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or(NetworkError::Fatal(ErrorType::InvalidSend))
    }

    /// The listener, for readiness registration.
    pub(crate) fn listener_ref(&self) -> NetworkResult<&TcpListener> {
        self.listener
            .as_ref()
            .ok_or(NetworkError::Fatal(ErrorType::NotListening))
    }

    /// The raw file descriptor of the connected stream. Used to key the
    /// live connection set.
    pub fn raw_fd(&self) -> Option<usize> {
        use std::os::unix::io::AsRawFd;

        self.stream.as_ref().map(|s| s.as_raw_fd() as usize)
    }

    /// Binds `0.0.0.0:<port>` and starts listening for connections. The
    /// socket must be fresh.
    pub fn listen(&mut self, port: u16) -> NetworkResult<()> {
        if self.is_open() {
            return Err(NetworkError::Fatal(ErrorType::InvalidSend));
        }

        let addr = format!("0.0.0.0:{}", port).parse::<SocketAddr>()?;

        match TcpListener::bind(&addr) {
            Ok(listener) => {
                self.listener = Some(listener);
                Ok(())
            }
            Err(err) => {
                logging::error!(self.log, "failed to bind and listen";
                                "context" => "listen",
                                "code" => ERR_SOCKET_LISTEN_FAILED,
                                "port" => port,
                                "error" => %err);
                Err(err.into())
            }
        }
    }

    /// Starts a non-blocking connect to `<host>:<port>`. The connection
    /// completes asynchronously; the first writable event signals success.
    pub fn connect(&mut self, host: &str, port: u16) -> NetworkResult<()> {
        if self.is_open() {
            return Err(NetworkError::Fatal(ErrorType::InvalidSend));
        }

        let addr = format!("{}:{}", host, port).parse::<SocketAddr>()?;

        match TcpStream::connect(&addr) {
            Ok(stream) => {
                self.peer_addr = Some(addr);
                self.stream = Some(stream);
                Ok(())
            }
            Err(err) => {
                logging::error!(self.log, "failed to connect";
                                "context" => "connect",
                                "code" => ERR_SOCKET_CONNECT_FAILED,
                                "host" => host,
                                "port" => port,
                                "error" => %err);
                Err(err.into())
            }
        }
    }

    /// Accepts one pending connection. Returns `Wait` when nothing is
    /// queued.
    pub fn accept(&mut self) -> NetworkResult<Socket> {
        let listener = match self.listener.as_ref() {
            Some(listener) => listener,
            None => return Err(NetworkError::Fatal(ErrorType::NotListening)),
        };

        match listener.accept() {
            Ok((stream, peer_addr)) => Ok(Socket::from_stream(stream, peer_addr)),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Err(NetworkError::Wait),
            Err(err) => {
                logging::error!(self.log, "failed to accept connection";
                                "context" => "accept",
                                "code" => ERR_SOCKET_ACCEPT_CONN_FAILED,
                                "error" => %err);
                Err(err.into())
            }
        }
    }

    /// Pulls all currently available data off the stream into the ring via
    /// the zero-copy fill, up to the ring's free space.
    ///
    /// Returns `(bytes_received, space_remaining)`. A result of 0 bytes
    /// means the peer closed the connection (the socket closes itself);
    /// `Wait` means no data was ready; `BufferFull` means the ring had no
    /// space to receive into.
    pub fn recv_into_ring(&mut self) -> NetworkResult<(usize, usize)> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            // Already torn down; report the close to the caller.
            None => return Ok((0, self.ring.space())),
        };

        if self.ring.is_full() {
            return Err(NetworkError::Fatal(ErrorType::BufferFull));
        }

        let mut closed = false;
        let mut blocked = false;
        let mut failure: Option<io::ErrorKind> = None;
        let mut total = 0;

        while !self.ring.is_full() && !closed && !blocked && failure.is_none() {
            let space = self.ring.space();

            let received = self.ring.write_with(
                |dest| match stream.read(dest) {
                    Ok(0) => {
                        closed = true;
                        0
                    }
                    Ok(count) => count,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        blocked = true;
                        0
                    }
                    Err(err) => {
                        failure = Some(err.kind());
                        0
                    }
                },
                space,
            );

            total += received;
        }

        if let Some(kind) = failure {
            logging::error!(self.log, "recv failed";
                            "context" => "recv_into_ring",
                            "code" => ERR_SOCKET_RECV_FAILED,
                            "error" => ?kind);
            return Err(NetworkError::Fatal(ErrorType::Io(kind)));
        }

        if closed {
            logging::debug!(self.log, "peer closed connection";
                            "context" => "recv_into_ring",
                            "peer" => ?self.peer_addr);
            self.close();

            if total == 0 {
                return Ok((0, self.ring.space()));
            }
        }

        if total == 0 && blocked {
            return Err(NetworkError::Wait);
        }

        Ok((total, self.ring.space()))
    }

    /// Sends the whole byte slice, spinning over partial and would-block
    /// writes. Optionally appends the frame terminator.
    pub fn send_all(&mut self, data: &[u8], terminate: bool) -> NetworkResult<()> {
        if self.stream.is_none() || self.is_listening() {
            logging::error!(self.log, "send on a closed or listening socket";
                            "context" => "send_all",
                            "code" => ERR_SOCKET_INVALID_SEND_ATTEMPT);
            return Err(NetworkError::Fatal(ErrorType::InvalidSend));
        }

        self.send_loop(data)?;

        if terminate {
            self.send_loop(&[DELIMITER])?;
        }

        Ok(())
    }

    fn send_loop(&mut self, data: &[u8]) -> NetworkResult<()> {
        let stream = self
            .stream
            .as_mut()
            .expect("Socket must have a valid stream");

        let mut total = 0;

        while total < data.len() {
            match stream.write(&data[total..]) {
                Ok(0) => {
                    logging::error!(self.log, "send wrote zero bytes";
                                    "context" => "send_all",
                                    "code" => ERR_SOCKET_SEND_FAILED);
                    return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::WriteZero)));
                }
                Ok(count) => total += count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "send failed";
                                    "context" => "send_all",
                                    "code" => ERR_SOCKET_SEND_FAILED,
                                    "error" => %err);
                    return Err(err.into());
                }
            }
        }

        Ok(())
    }

    /// Consumes one null-terminated frame from the ring, without the
    /// terminator. The ring is untouched when no full frame has arrived.
    pub fn read_frame(&mut self) -> Option<Vec<u8>> {
        let mut data = self.ring.read_delim(DELIMITER)?;
        data.pop();
        Some(data)
    }

    /// Consumes through the first occurrence of the delimiter, leaving the
    /// ring untouched when it is absent.
    #[inline]
    pub fn read_delim(&mut self, delim: u8) -> Option<Vec<u8>> {
        self.ring.read_delim(delim)
    }

    /// Multi-byte delimiter form of `read_delim`.
    #[inline]
    pub fn read_delim_seq(&mut self, delim: &[u8]) -> Option<Vec<u8>> {
        self.ring.read_delim_seq(delim)
    }

    /// Empties and returns the entire buffer content.
    #[inline]
    pub fn drain_all(&mut self) -> Vec<u8> {
        self.ring.read_all()
    }

    /// Clears the buffer memory and resets its state.
    #[inline]
    pub fn clear_buffer(&mut self) {
        self.ring.clear();
    }

    #[inline]
    pub(crate) fn ring(&mut self) -> &mut RingBuffer {
        &mut self.ring
    }

    #[inline]
    pub fn buffered(&self) -> usize {
        self.ring.size()
    }

    #[inline]
    pub fn buffer_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Closes the socket. Idempotent; the ring is left intact.
    pub fn close(&mut self) {
        self.stream = None;
        self.listener = None;
        self.peer_addr = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::thread;
    use std::time::Duration;

    fn tiny_sleep() {
        thread::sleep(Duration::from_millis(30));
    }

    /// A connected (non-blocking mio, blocking std) socket pair on
    /// localhost.
    pub fn socket_pair() -> (Socket, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = StdStream::connect(addr).unwrap();
        let (accepted, peer_addr) = listener.accept().unwrap();

        accepted.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_stream(accepted).unwrap();

        (Socket::from_stream(stream, peer_addr), client)
    }

    #[test]
    fn test_listen_and_accept() {
        let mut listener = Socket::new();
        listener.listen(0).unwrap();
        assert!(listener.is_listening());

        let addr = listener.local_addr().unwrap();
        let client = StdStream::connect(("127.0.0.1", addr.port())).unwrap();

        tiny_sleep();
        let accepted = listener.accept().unwrap();
        assert!(accepted.is_open());
        assert!(!accepted.is_listening());
        assert!(accepted.peer_addr().is_some());

        drop(client);
    }

    #[test]
    fn test_accept_without_pending_connection_waits() {
        let mut listener = Socket::new();
        listener.listen(0).unwrap();

        assert_eq!(listener.accept().unwrap_err(), NetworkError::Wait);
    }

    #[test]
    fn test_accept_on_fresh_socket_fails() {
        let mut sock = Socket::new();

        assert_eq!(
            sock.accept().unwrap_err(),
            NetworkError::Fatal(ErrorType::NotListening)
        );
    }

    #[test]
    fn test_recv_into_ring() {
        let (mut sock, mut client) = socket_pair();

        client.write_all(b"hello\0").unwrap();
        tiny_sleep();

        let (received, space) = sock.recv_into_ring().unwrap();
        assert_eq!(received, 6);
        assert_eq!(space, SOCKET_BUF_SIZE - 6);
        assert_eq!(sock.read_frame().unwrap(), b"hello");
    }

    #[test]
    fn test_recv_with_no_data_waits() {
        let (mut sock, _client) = socket_pair();

        assert_eq!(sock.recv_into_ring().unwrap_err(), NetworkError::Wait);
    }

    #[test]
    fn test_recv_detects_peer_close() {
        let (mut sock, client) = socket_pair();

        drop(client);
        tiny_sleep();

        let (received, _) = sock.recv_into_ring().unwrap();
        assert_eq!(received, 0);
        assert!(!sock.is_open());

        // Subsequent receives keep reporting the close
        let (received, _) = sock.recv_into_ring().unwrap();
        assert_eq!(received, 0);
    }

    #[test]
    fn test_recv_with_full_ring_fails() {
        let (mut sock, mut client) = socket_pair();

        client.write_all(&[b'x'; SOCKET_BUF_SIZE]).unwrap();
        tiny_sleep();

        let (received, space) = sock.recv_into_ring().unwrap();
        assert_eq!(received, SOCKET_BUF_SIZE);
        assert_eq!(space, 0);

        client.write_all(b"more").unwrap();
        tiny_sleep();

        assert_eq!(
            sock.recv_into_ring().unwrap_err(),
            NetworkError::Fatal(ErrorType::BufferFull)
        );
    }

    #[test]
    fn test_send_all() {
        let (mut sock, mut client) = socket_pair();

        sock.send_all(b"ping", true).unwrap();

        let mut data = [0u8; 5];
        client.read_exact(&mut data).unwrap();
        assert_eq!(&data, b"ping\0");
    }

    #[test]
    fn test_send_on_closed_socket_fails() {
        let mut sock = Socket::new();

        assert_eq!(
            sock.send_all(b"data", false).unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidSend)
        );
    }

    #[test]
    fn test_read_frame_rewinds_on_missing_delimiter() {
        let (mut sock, mut client) = socket_pair();

        client.write_all(b"partial").unwrap();
        tiny_sleep();
        sock.recv_into_ring().unwrap();

        assert_eq!(sock.read_frame(), None);
        assert_eq!(sock.buffered(), 7);

        client.write_all(b" frame\0").unwrap();
        tiny_sleep();
        sock.recv_into_ring().unwrap();

        assert_eq!(sock.read_frame().unwrap(), b"partial frame");
    }

    #[test]
    fn test_drain_all() {
        let (mut sock, mut client) = socket_pair();

        client.write_all(b"a\0b\0").unwrap();
        tiny_sleep();
        sock.recv_into_ring().unwrap();

        assert_eq!(sock.drain_all(), b"a\0b\0");
        assert_eq!(sock.buffered(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut sock, _client) = socket_pair();

        sock.close();
        assert!(!sock.is_open());
        sock.close();
        assert!(!sock.is_open());
    }
}
