use crate::logging;
use crate::net::channel::{HandshakeState, SecureChannel};
use crate::net::event_loop::Notifier;
use crate::net::frame::{ErrorFrame, Header, MessageType};
use crate::net::server::ServerHandle;
use crate::net::shared::{
    error_message, ErrorType, ErrorUtils, NetworkError, NetworkResult, ERR_CONTEXT_BUFFER_FULL,
    ERR_CONTEXT_DO_ERROR_FAILED, ERR_CONTEXT_HANDLE_READ_FAILED,
    ERR_CONTEXT_HANDLE_REQUEST_FAILED, ERR_CONTEXT_PING_FAILED, ERR_CONTEXT_SEND_MESSAGE_FAILED,
};
use crate::time::timestamp_millis;
use mio::Token;

/// Per-connection coordinator: drives the handshake to completion, then
/// parses framed requests off the secure channel and routes them to the
/// registered handlers.
///
/// One readable event translates into one `on_readable` call, and the next
/// event is not delivered until the connection is re-armed afterwards, so
/// all state transitions here are serialised per connection.
pub struct Context {
    token: Token,
    channel: SecureChannel,
    header: Option<Header>,
    header_parsed: bool,
    body: Vec<u8>,
    closed: bool,
    log: logging::Logger,
}

impl Context {
    pub fn new(token: Token, channel: SecureChannel) -> Context {
        Context {
            token,
            channel,
            header: None,
            header_parsed: false,
            body: Vec::new(),
            closed: false,
            log: logging::get().new(logging::o!("token" => token.0)),
        }
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    /// True once the connection has ended and the context awaits teardown.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn channel(&mut self) -> &mut SecureChannel {
        &mut self.channel
    }

    /// The header of the request currently being dispatched.
    #[inline]
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// The body of the request currently being dispatched. Empty when the
    /// request carried none.
    #[inline]
    pub fn request_body(&self) -> &[u8] {
        &self.body
    }

    pub fn register(&self, notifier: &Notifier) -> NetworkResult<()> {
        notifier.register_oneshot(self.channel.socket().stream_ref()?, self.token)
    }

    pub fn rearm(&self, notifier: &Notifier) -> NetworkResult<()> {
        notifier.rearm(self.channel.socket().stream_ref()?, self.token)
    }

    pub fn deregister(&self, notifier: &Notifier) -> NetworkResult<()> {
        notifier.deregister(self.channel.socket().stream_ref()?)
    }

    /// Entry point for every readable event on the connection.
    pub fn on_readable(&mut self, server: &ServerHandle) {
        if !self.channel.is_secure() {
            self.drive_handshake();
            return;
        }

        self.read_sock(server);
    }

    /// Advances the handshake by whatever message has arrived. Failures
    /// restart the exchange from `Fresh`; a closed peer marks the context
    /// for teardown.
    fn drive_handshake(&mut self) {
        match self.channel.state() {
            HandshakeState::InitSent => match self.channel.handshake_final() {
                Ok(()) => (),
                Err(NetworkError::Wait) => (),
                Err(NetworkError::Fatal(ErrorType::Closed)) => self.closed = true,
                Err(_) => {
                    if self.channel.handshake_init().has_failed() {
                        self.closed = true;
                    }
                }
            },
            HandshakeState::Fresh | HandshakeState::Failed => {
                if self.channel.handshake_init().has_failed() {
                    self.closed = true;
                }
            }
            state => {
                logging::debug!(self.log, "spurious event during handshake";
                                "context" => "drive_handshake",
                                "state" => ?state);
            }
        }
    }

    /// Performs one decrypt round, then extracts and dispatches as many
    /// framed messages as the plain-text buffer contains.
    pub fn read_sock(&mut self, server: &ServerHandle) {
        match self.channel.recv_decrypted() {
            // No data ready; the event gets re-armed and nothing changes
            Err(NetworkError::Wait) => return,
            // Key material went missing; renegotiate from Fresh
            Err(NetworkError::Fatal(ErrorType::NotSecure)) => {
                self.drive_handshake();
                return;
            }
            Err(NetworkError::Fatal(ErrorType::Crypto)) => {
                self.report_error(ERR_CONTEXT_HANDLE_READ_FAILED);
                return;
            }
            Err(NetworkError::Fatal(ErrorType::BufferFull)) => {
                self.report_error(ERR_CONTEXT_BUFFER_FULL);
                self.channel.clear_buffer();
                self.reset();
                return;
            }
            Err(_) => {
                self.closed = true;
                return;
            }
            Ok((0, _)) => {
                logging::debug!(self.log, "peer closed connection"; "context" => "read_sock");
                self.closed = true;
                return;
            }
            Ok(_) => (),
        }

        self.process_frames(server);
    }

    fn process_frames(&mut self, server: &ServerHandle) {
        loop {
            match self.channel.read_frame() {
                Some(frame) => {
                    if self.header_parsed {
                        self.body = frame;
                        self.dispatch(server);
                        self.reset();
                    } else {
                        self.handle_header(&frame, server);
                    }
                }
                None => {
                    // No complete frame; a full buffer at this point can
                    // never produce one
                    if self.channel.socket().buffer_full() {
                        self.report_error(ERR_CONTEXT_BUFFER_FULL);
                        self.channel.clear_buffer();
                        self.reset();
                    }
                    return;
                }
            }
        }
    }

    fn handle_header(&mut self, frame: &[u8], server: &ServerHandle) {
        let header = match Header::read(frame) {
            Ok(header) => header,
            Err(_) => {
                // Fatal for this frame only; the read cursor sits just past
                // its delimiter and later frames are untouched
                self.report_error(ERR_CONTEXT_HANDLE_READ_FAILED);
                self.reset();
                return;
            }
        };

        if header.kind == MessageType::Ping {
            logging::debug!(self.log, "ping";
                            "context" => "read_sock",
                            "timestamp" => header.timestamp);

            if self.channel.send_encrypted(&header.encode(), true).has_failed() {
                logging::error!(self.log, "failed to answer ping";
                                "context" => "read_sock",
                                "code" => ERR_CONTEXT_PING_FAILED);
            }
            return;
        }

        if header.size == 0 {
            self.header = Some(header);
            self.dispatch(server);
            self.reset();
            return;
        }

        self.header = Some(header);
        self.header_parsed = true;
    }

    fn dispatch(&mut self, server: &ServerHandle) {
        let path = match self.header.as_ref() {
            Some(header) => header.path.clone(),
            None => String::new(),
        };

        logging::debug!(self.log, "dispatching request";
                        "context" => "dispatch",
                        "path" => path.as_str(),
                        "body_size" => self.body.len());

        if !server.exec_endpoint(&path, self) {
            logging::error!(self.log, "no handler registered for path";
                            "context" => "dispatch",
                            "path" => path.as_str(),
                            "code" => ERR_CONTEXT_HANDLE_REQUEST_FAILED);
            self.report_error(ERR_CONTEXT_HANDLE_REQUEST_FAILED);
        }
    }

    fn reset(&mut self) {
        self.header = None;
        self.header_parsed = false;
        self.body.clear();
    }

    /// Sends an encrypted, framed reply to the peer. Returns whether the
    /// send succeeded.
    pub fn send_message(&mut self, data: &[u8]) -> bool {
        match self.channel.send_encrypted(data, true) {
            Ok(()) => true,
            Err(_) => {
                logging::error!(self.log, "failed to send message";
                                "context" => "send_message",
                                "code" => ERR_CONTEXT_SEND_MESSAGE_FAILED);
                false
            }
        }
    }

    /// Builds a structured error envelope, sends it encrypted to the peer
    /// and always logs it locally.
    pub fn report_error(&mut self, code: u32) {
        logging::error!(self.log, "{}", error_message(code);
                        "context" => "report_error",
                        "code" => code);

        let envelope = ErrorFrame {
            code,
            message: error_message(code).to_string(),
            timestamp: timestamp_millis(),
        };

        if self.channel.send_encrypted(&envelope.encode(), true).has_failed() {
            logging::error!(self.log, "failed to send error response";
                            "context" => "report_error",
                            "code" => ERR_CONTEXT_DO_ERROR_FAILED);
        }
    }
}
