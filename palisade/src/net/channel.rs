use crate::crypto::{self, Exchange, BLOCK_SIZE, IV_SIZE, KEY_SIZE};
use crate::logging;
use crate::net::frame::{HostHandshake, PeerHandshake};
use crate::net::shared::{
    ErrorType, NetworkError, NetworkResult, ERR_CHANNEL_HANDSHAKE_ACCEPT_DERIVE_FAILED,
    ERR_CHANNEL_HANDSHAKE_ACCEPT_PARSE_FAILED, ERR_CHANNEL_HANDSHAKE_ACCEPT_SEND_FAILED,
    ERR_CHANNEL_HANDSHAKE_CONFIRM_FAILED, ERR_CHANNEL_HANDSHAKE_FINAL_DERIVE_FAILED,
    ERR_CHANNEL_HANDSHAKE_FINAL_PARSE_FAILED, ERR_CHANNEL_HANDSHAKE_FINAL_SEND_FAILED,
    ERR_CHANNEL_HANDSHAKE_INIT_FAILED, ERR_CHANNEL_RECV_FAILED, ERR_CHANNEL_SEND_FAILED,
};
use crate::net::socket::Socket;

/// Progress of the four-message key agreement. Advances monotonically
/// except for the transition to `Failed`, which a fresh `handshake_init`
/// (host) or `reset` (peer) recovers from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeState {
    Fresh,
    InitSent,
    AcceptReceived,
    FinalSent,
    Confirmed,
    Failed,
}

/// Layers AES-256-CBC over a `Socket` after an ephemeral Diffie-Hellman
/// key agreement.
///
/// The handshake is initiated by the host: it sends its public key and the
/// connection IV, the peer answers with its own public key, and the host
/// confirms with the two bytes `{0x01, 0x00}`. Both sides then hold
/// `key = SHA-256(shared_secret)`.
///
/// Each encrypted record on the wire is a fresh random IV followed by the
/// cipher text of one or more null-terminated frames. Decryption happens in
/// place: new cipher text is popped back out of the socket ring and the
/// recovered plain text is written into the region it vacated, so the ring
/// always holds plain text followed by at most one partial record.
pub struct SecureChannel {
    sock: Socket,
    exchange: Exchange,
    iv: [u8; IV_SIZE],
    key: Option<[u8; KEY_SIZE]>,
    secret: Option<Vec<u8>>,
    state: HandshakeState,
    // Bytes of a partial record parked at the tail of the socket ring.
    pending_cipher: usize,
    log: logging::Logger,
}

impl SecureChannel {
    pub fn new(sock: Socket) -> SecureChannel {
        SecureChannel {
            sock,
            exchange: Exchange::new(),
            iv: [0; IV_SIZE],
            key: None,
            secret: None,
            state: HandshakeState::Fresh,
            pending_cipher: 0,
            log: logging::get(),
        }
    }

    #[inline]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    #[inline]
    pub fn is_secure(&self) -> bool {
        self.state == HandshakeState::Confirmed && self.key.is_some()
    }

    #[inline]
    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    #[inline]
    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.sock
    }

    /// Returns the channel to `Fresh`, discarding all key material and
    /// buffered data.
    pub fn reset(&mut self) {
        self.key = None;
        self.secret = None;
        self.state = HandshakeState::Fresh;
        self.pending_cipher = 0;
        self.sock.clear_buffer();
    }

    /// Host side, message 1: generates a fresh key pair and IV and sends
    /// them to the peer. Restarts the handshake from `Fresh`.
    pub fn handshake_init(&mut self) -> NetworkResult<()> {
        self.key = None;
        self.secret = None;
        self.state = HandshakeState::Fresh;
        self.exchange = Exchange::new();
        crypto::random_bytes(&mut self.iv);

        let handshake = HostHandshake {
            public_key: self.exchange.public_key(),
            iv: self.iv,
        };

        match self.sock.send_all(&handshake.encode(), true) {
            Ok(()) => {
                self.state = HandshakeState::InitSent;
                logging::debug!(self.log, "handshake initiated";
                                "context" => "handshake_init",
                                "peer" => ?self.sock.peer_addr());
                Ok(())
            }
            Err(err) => {
                logging::error!(self.log, "failed to initiate handshake";
                                "context" => "handshake_init",
                                "code" => ERR_CHANNEL_HANDSHAKE_INIT_FAILED);
                self.state = HandshakeState::Failed;
                Err(err)
            }
        }
    }

    /// Peer side, message 2: parses the host's key and IV, derives the
    /// shared secret and answers with the peer public key.
    pub fn handshake_accept(&mut self) -> NetworkResult<()> {
        if self.state != HandshakeState::Fresh {
            return Err(NetworkError::Fatal(ErrorType::HandshakeState));
        }

        self.key = None;
        self.secret = None;

        let (received, _) = self.sock.recv_into_ring()?;

        if received == 0 {
            self.state = HandshakeState::Failed;
            return Err(NetworkError::Fatal(ErrorType::Closed));
        }

        let mut data = self.sock.drain_all();

        if data.pop() != Some(0) {
            return self.fail(
                ERR_CHANNEL_HANDSHAKE_ACCEPT_PARSE_FAILED,
                "unterminated handshake initialization",
                ErrorType::Serialization,
            );
        }

        let handshake = match HostHandshake::read(&data) {
            Ok(handshake) => handshake,
            Err(_) => {
                return self.fail(
                    ERR_CHANNEL_HANDSHAKE_ACCEPT_PARSE_FAILED,
                    "malformed handshake initialization",
                    ErrorType::Serialization,
                );
            }
        };

        self.iv = handshake.iv;

        self.secret = match self.exchange.derive_secret(&handshake.public_key) {
            Some(secret) => Some(secret),
            None => {
                return self.fail(
                    ERR_CHANNEL_HANDSHAKE_ACCEPT_DERIVE_FAILED,
                    "invalid host public key",
                    ErrorType::Crypto,
                );
            }
        };

        let reply = PeerHandshake {
            public_key: self.exchange.public_key(),
        };

        if let Err(err) = self.sock.send_all(&reply.encode(), true) {
            logging::error!(self.log, "failed to send handshake response";
                            "context" => "handshake_accept",
                            "code" => ERR_CHANNEL_HANDSHAKE_ACCEPT_SEND_FAILED);
            self.state = HandshakeState::Failed;
            return Err(err);
        }

        self.state = HandshakeState::AcceptReceived;
        Ok(())
    }

    /// Host side, message 3: parses the peer's public key, derives the
    /// symmetric key and sends the confirmation bytes. On success the
    /// channel is secure.
    pub fn handshake_final(&mut self) -> NetworkResult<()> {
        if self.state != HandshakeState::InitSent {
            return Err(NetworkError::Fatal(ErrorType::HandshakeState));
        }

        let (received, _) = self.sock.recv_into_ring()?;

        if received == 0 {
            self.state = HandshakeState::Failed;
            return Err(NetworkError::Fatal(ErrorType::Closed));
        }

        let mut data = self.sock.drain_all();

        if data.pop() != Some(0) {
            return self.fail(
                ERR_CHANNEL_HANDSHAKE_FINAL_PARSE_FAILED,
                "unterminated handshake response",
                ErrorType::Serialization,
            );
        }

        let handshake = match PeerHandshake::read(&data) {
            Ok(handshake) => handshake,
            Err(_) => {
                return self.fail(
                    ERR_CHANNEL_HANDSHAKE_FINAL_PARSE_FAILED,
                    "malformed handshake response",
                    ErrorType::Serialization,
                );
            }
        };

        let secret = match self.exchange.derive_secret(&handshake.public_key) {
            Some(secret) => secret,
            None => {
                return self.fail(
                    ERR_CHANNEL_HANDSHAKE_FINAL_DERIVE_FAILED,
                    "invalid peer public key",
                    ErrorType::Crypto,
                );
            }
        };

        self.key = Some(crypto::derive_key(&secret));
        self.state = HandshakeState::FinalSent;

        // A single byte of value 1, still null-terminated, confirms the
        // handshake to the peer.
        if let Err(err) = self.sock.send_all(&[1], true) {
            logging::error!(self.log, "failed to send handshake confirmation";
                            "context" => "handshake_final",
                            "code" => ERR_CHANNEL_HANDSHAKE_FINAL_SEND_FAILED);
            self.key = None;
            self.state = HandshakeState::Failed;
            return Err(err);
        }

        self.state = HandshakeState::Confirmed;
        logging::debug!(self.log, "handshake confirmed";
                        "context" => "handshake_final",
                        "peer" => ?self.sock.peer_addr());
        Ok(())
    }

    /// Peer side, message 4: reads the confirmation bytes and derives the
    /// same symmetric key. On success the channel is secure.
    pub fn handshake_confirm(&mut self) -> NetworkResult<()> {
        if self.state != HandshakeState::AcceptReceived {
            return Err(NetworkError::Fatal(ErrorType::HandshakeState));
        }

        let (received, _) = self.sock.recv_into_ring()?;

        if received == 0 {
            self.state = HandshakeState::Failed;
            return Err(NetworkError::Fatal(ErrorType::Closed));
        }

        if self.sock.buffered() < 2 {
            return Err(NetworkError::Wait);
        }

        let data = self.sock.drain_all();

        if data[0] != 1 {
            return self.fail(
                ERR_CHANNEL_HANDSHAKE_CONFIRM_FAILED,
                "unexpected confirmation byte",
                ErrorType::Serialization,
            );
        }

        let secret = self
            .secret
            .take()
            .expect("Accepted handshake must hold a shared secret");

        self.key = Some(crypto::derive_key(&secret));
        self.state = HandshakeState::Confirmed;
        Ok(())
    }

    /// Receives and decrypts available data.
    ///
    /// Records the plain-text size of the ring as the offset, appends the
    /// incoming cipher text, pops it back out with `read_from` and writes
    /// the recovered plain text into the region it vacated. A partial
    /// record is parked in the ring until the rest arrives.
    ///
    /// Returns `(plaintext_bytes, space_remaining)`; 0 plain-text bytes
    /// means the peer closed. `NotSecure` is returned (and the inbound
    /// data discarded) when no key has been negotiated; `Crypto` when a
    /// structurally complete record does not decrypt.
    pub fn recv_decrypted(&mut self) -> NetworkResult<(usize, usize)> {
        if !self.is_secure() {
            let _ = self.sock.recv_into_ring();
            self.sock.clear_buffer();
            return Err(NetworkError::Fatal(ErrorType::NotSecure));
        }

        let offset = self.sock.buffered() - self.pending_cipher;

        let (received, _) = self.sock.recv_into_ring()?;

        if received == 0 {
            return Ok((0, self.sock.ring().space()));
        }

        let cipher = self.sock.ring().read_from(offset);

        if cipher.len() < IV_SIZE + BLOCK_SIZE || (cipher.len() - IV_SIZE) % BLOCK_SIZE != 0 {
            // Not a whole record yet; park it and wait for the rest.
            self.pending_cipher = cipher.len();
            let parked = self.sock.ring().write(&cipher);
            debug_assert_eq!(parked, cipher.len());
            return Err(NetworkError::Wait);
        }

        let key = self.key.expect("Secure channel must hold a key");

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&cipher[..IV_SIZE]);

        match crypto::decrypt(&cipher[IV_SIZE..], &key, &iv) {
            Some(plain) => {
                self.pending_cipher = 0;

                let written = self.sock.ring().write(&plain);
                debug_assert_eq!(written, plain.len());

                Ok((plain.len(), self.sock.ring().space()))
            }
            None => {
                self.pending_cipher = 0;
                logging::error!(self.log, "failed to decrypt record";
                                "context" => "recv_decrypted",
                                "code" => ERR_CHANNEL_RECV_FAILED,
                                "record_size" => cipher.len());
                Err(NetworkError::Fatal(ErrorType::Crypto))
            }
        }
    }

    /// Encrypts the data as one record (fresh IV prepended) and sends it.
    /// The frame terminator, when requested, is encrypted with the payload.
    pub fn send_encrypted(&mut self, data: &[u8], terminate: bool) -> NetworkResult<()> {
        let key = match self.key {
            Some(key) if self.is_secure() => key,
            _ => return Err(NetworkError::Fatal(ErrorType::NotSecure)),
        };

        let mut plain = Vec::with_capacity(data.len() + 1);
        plain.extend_from_slice(data);

        if terminate {
            plain.push(0);
        }

        let mut record_iv = [0u8; IV_SIZE];
        crypto::random_bytes(&mut record_iv);

        let cipher = crypto::encrypt(&plain, &key, &record_iv);

        let mut record = Vec::with_capacity(IV_SIZE + cipher.len());
        record.extend_from_slice(&record_iv);
        record.extend_from_slice(&cipher);

        self.sock.send_all(&record, false).map_err(|err| {
            logging::error!(self.log, "failed to send record";
                            "context" => "send_encrypted",
                            "code" => ERR_CHANNEL_SEND_FAILED);
            err
        })
    }

    /// Consumes one null-terminated frame of plain text, without the
    /// terminator. The buffer is untouched when no full frame is present.
    #[inline]
    pub fn read_frame(&mut self) -> Option<Vec<u8>> {
        self.sock.read_frame()
    }

    /// Consumes plain text through the first occurrence of the delimiter,
    /// leaving the buffer untouched when it is absent.
    #[inline]
    pub fn read_delim(&mut self, delim: u8) -> Option<Vec<u8>> {
        self.sock.read_delim(delim)
    }

    /// Empties and returns the entire plain-text buffer.
    #[inline]
    pub fn drain_all(&mut self) -> Vec<u8> {
        self.sock.drain_all()
    }

    /// Clears the plain-text buffer and any parked record bytes.
    pub fn clear_buffer(&mut self) {
        self.pending_cipher = 0;
        self.sock.clear_buffer();
    }

    fn fail<T>(&mut self, code: u32, message: &str, error: ErrorType) -> NetworkResult<T> {
        logging::error!(self.log, "{}", message; "context" => "handshake", "code" => code);
        self.state = HandshakeState::Failed;
        Err(NetworkError::Fatal(error))
    }

    #[cfg(test)]
    fn session_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.key
    }
}
