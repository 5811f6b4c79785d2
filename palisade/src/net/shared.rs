use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum NetworkError {
    /// Not a failure: the operation needs more data or would block.
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum ErrorType {
    /// The peer closed the connection mid-operation.
    Closed,
    /// The channel has no negotiated key yet.
    NotSecure,
    /// Decryption or encryption failed.
    Crypto,
    /// A message could not be parsed or encoded.
    Serialization,
    /// The buffer filled up without producing a complete message.
    BufferFull,
    /// An accept was attempted on a socket that is not listening.
    NotListening,
    /// A send was attempted on a closed or listening socket.
    InvalidSend,
    /// A handshake operation was invoked in the wrong state.
    HandshakeState,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

// Wire-visible error codes follow the format CCNNN.
//
// CC is a subsystem class: all codes prefixed with the same two digits
// strictly belong to a single subsystem. NNN is a unique ordinal within the
// class, usually the order of appearance in code, though that is not a hard
// rule. Codes with no specific class use the 10 prefix.
//
// Codes 10001-99999 are reserved; user-defined handlers ought to pick
// values outside that range.

// General
pub const ERR_UNKNOWN: u32 = 10001;

// Socket
pub const ERR_SOCKET_ADDR_PARSE_FAILED: u32 = 11001;
pub const ERR_SOCKET_LISTEN_FAILED: u32 = 11002;
pub const ERR_SOCKET_CONNECT_FAILED: u32 = 11003;
pub const ERR_SOCKET_ACCEPT_CONN_FAILED: u32 = 11004;
pub const ERR_SOCKET_BUFFER_FULL: u32 = 11005;
pub const ERR_SOCKET_RECV_FAILED: u32 = 11006;
pub const ERR_SOCKET_INVALID_SEND_ATTEMPT: u32 = 11007;
pub const ERR_SOCKET_SEND_FAILED: u32 = 11008;

// SecureChannel
pub const ERR_CHANNEL_HANDSHAKE_INIT_FAILED: u32 = 12001;
pub const ERR_CHANNEL_HANDSHAKE_ACCEPT_PARSE_FAILED: u32 = 12002;
pub const ERR_CHANNEL_HANDSHAKE_ACCEPT_DERIVE_FAILED: u32 = 12003;
pub const ERR_CHANNEL_HANDSHAKE_ACCEPT_SEND_FAILED: u32 = 12004;
pub const ERR_CHANNEL_HANDSHAKE_FINAL_PARSE_FAILED: u32 = 12005;
pub const ERR_CHANNEL_HANDSHAKE_FINAL_DERIVE_FAILED: u32 = 12006;
pub const ERR_CHANNEL_HANDSHAKE_FINAL_SEND_FAILED: u32 = 12007;
pub const ERR_CHANNEL_HANDSHAKE_CONFIRM_FAILED: u32 = 12008;
pub const ERR_CHANNEL_RECV_FAILED: u32 = 12009;
pub const ERR_CHANNEL_SEND_FAILED: u32 = 12010;

// Context
pub const ERR_CONTEXT_BUFFER_FULL: u32 = 13001;
pub const ERR_CONTEXT_HANDLE_REQUEST_FAILED: u32 = 13002;
pub const ERR_CONTEXT_HANDLE_READ_FAILED: u32 = 13003;
pub const ERR_CONTEXT_DO_ERROR_FAILED: u32 = 13004;
pub const ERR_CONTEXT_PING_FAILED: u32 = 13005;
pub const ERR_CONTEXT_SEND_MESSAGE_FAILED: u32 = 13006;

// Server
pub const ERR_SERVER_LISTEN_FAILED: u32 = 14001;
pub const ERR_SERVER_ACCEPT_CONN_FAILED: u32 = 14002;

// WorkerPool
pub const ERR_POOL_TASK_PANICKED: u32 = 15001;
pub const ERR_POOL_STOP_FAILED: u32 = 15002;

lazy_static! {
    static ref ERROR_MESSAGES: HashMap<u32, &'static str> = {
        let mut messages = HashMap::new();

        messages.insert(ERR_UNKNOWN, "Unknown error occurred.");

        messages.insert(ERR_SOCKET_ADDR_PARSE_FAILED, "Socket: failed to parse bind or connect address.");
        messages.insert(ERR_SOCKET_LISTEN_FAILED, "Socket: failed to bind and listen on port.");
        messages.insert(ERR_SOCKET_CONNECT_FAILED, "Socket: failed to connect to host.");
        messages.insert(ERR_SOCKET_ACCEPT_CONN_FAILED, "Socket: failed to accept incoming connection.");
        messages.insert(ERR_SOCKET_BUFFER_FULL, "Socket: incoming data exceeded buffer size.");
        messages.insert(ERR_SOCKET_RECV_FAILED, "Socket: failed to receive incoming data.");
        messages.insert(ERR_SOCKET_INVALID_SEND_ATTEMPT, "Socket: attempted to send on a closed or listening socket.");
        messages.insert(ERR_SOCKET_SEND_FAILED, "Socket: failed to send data.");

        messages.insert(ERR_CHANNEL_HANDSHAKE_INIT_FAILED, "SecureChannel: failed to initialize handshake.");
        messages.insert(ERR_CHANNEL_HANDSHAKE_ACCEPT_PARSE_FAILED, "SecureChannel: failed to parse handshake initialization.");
        messages.insert(ERR_CHANNEL_HANDSHAKE_ACCEPT_DERIVE_FAILED, "SecureChannel: failed to derive shared secret (peer).");
        messages.insert(ERR_CHANNEL_HANDSHAKE_ACCEPT_SEND_FAILED, "SecureChannel: failed to send handshake response.");
        messages.insert(ERR_CHANNEL_HANDSHAKE_FINAL_PARSE_FAILED, "SecureChannel: failed to parse handshake response.");
        messages.insert(ERR_CHANNEL_HANDSHAKE_FINAL_DERIVE_FAILED, "SecureChannel: failed to derive shared secret (host).");
        messages.insert(ERR_CHANNEL_HANDSHAKE_FINAL_SEND_FAILED, "SecureChannel: failed to send confirmation of handshake.");
        messages.insert(ERR_CHANNEL_HANDSHAKE_CONFIRM_FAILED, "SecureChannel: failed to confirm handshake (peer).");
        messages.insert(ERR_CHANNEL_RECV_FAILED, "SecureChannel: failed to receive incoming data.");
        messages.insert(ERR_CHANNEL_SEND_FAILED, "SecureChannel: failed to send data.");

        messages.insert(ERR_CONTEXT_BUFFER_FULL, "Context: incoming data exceeded context buffer size.");
        messages.insert(ERR_CONTEXT_HANDLE_REQUEST_FAILED, "Context: failed to handle request.");
        messages.insert(ERR_CONTEXT_HANDLE_READ_FAILED, "Context: failed to read incoming data.");
        messages.insert(ERR_CONTEXT_DO_ERROR_FAILED, "Context: failed to send error response to peer.");
        messages.insert(ERR_CONTEXT_PING_FAILED, "Context: failed to send ping response to peer.");
        messages.insert(ERR_CONTEXT_SEND_MESSAGE_FAILED, "Context: failed to send message to peer.");

        messages.insert(ERR_SERVER_LISTEN_FAILED, "Server: failed to start listening.");
        messages.insert(ERR_SERVER_ACCEPT_CONN_FAILED, "Server: failed to accept incoming connection.");

        messages.insert(ERR_POOL_TASK_PANICKED, "WorkerPool: task panicked in the worker loop.");
        messages.insert(ERR_POOL_STOP_FAILED, "WorkerPool: error occurred stopping the pool.");

        messages
    };
}

/// The human-readable message registered for a framework error code.
#[inline]
pub fn error_message(code: u32) -> &'static str {
    ERROR_MESSAGES
        .get(&code)
        .copied()
        .unwrap_or_else(|| ERROR_MESSAGES[&ERR_UNKNOWN])
}
