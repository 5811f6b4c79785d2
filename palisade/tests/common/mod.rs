//! A minimal blocking client implementing the peer half of the protocol,
//! used to drive a live server from the outside.

use palisade::crypto::{self, Exchange, BLOCK_SIZE, IV_SIZE, KEY_SIZE};
use palisade::net::frame::{ErrorFrame, Header, HostHandshake, PeerHandshake};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

pub struct Client {
    stream: TcpStream,
    exchange: Exchange,
    key: Option<[u8; KEY_SIZE]>,
    plain_buffer: Vec<u8>,
}

impl Client {
    /// Connects to the server, retrying briefly while it starts up.
    pub fn connect(port: u16) -> Client {
        let mut last_err = None;

        for _ in 0..100 {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(Duration::from_secs(5)))
                        .unwrap();

                    return Client {
                        stream,
                        exchange: Exchange::new(),
                        key: None,
                        plain_buffer: Vec::new(),
                    };
                }
                Err(err) => {
                    last_err = Some(err);
                    thread::sleep(Duration::from_millis(30));
                }
            }
        }

        panic!("Server never came up: {:?}", last_err);
    }

    /// Performs the peer side of the handshake: reads the host's key and
    /// IV, answers with our public key, reads the confirmation bytes and
    /// derives the session key. Returns the raw host handshake for
    /// inspection.
    pub fn handshake(&mut self) -> HostHandshake {
        // u32 key length, key, iv, frame terminator
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).unwrap();
        let key_len = u32::from_be_bytes(len_buf) as usize;

        let mut rest = vec![0u8; key_len + IV_SIZE + 1];
        self.stream.read_exact(&mut rest).unwrap();
        assert_eq!(rest.pop(), Some(0), "host handshake not null-terminated");

        let mut data = len_buf.to_vec();
        data.extend_from_slice(&rest);
        let host_hs = HostHandshake::read(&data).unwrap();

        let secret = self
            .exchange
            .derive_secret(&host_hs.public_key)
            .expect("host public key rejected");

        let reply = PeerHandshake {
            public_key: self.exchange.public_key(),
        };

        let mut message = reply.encode();
        message.push(0);
        self.stream.write_all(&message).unwrap();

        let mut confirmation = [0u8; 2];
        self.stream.read_exact(&mut confirmation).unwrap();
        assert_eq!(confirmation, [1, 0], "unexpected confirmation bytes");

        self.key = Some(crypto::derive_key(&secret));

        host_hs
    }

    #[inline]
    pub fn session_key(&self) -> [u8; KEY_SIZE] {
        self.key.expect("handshake not complete")
    }

    /// Encrypts one null-terminated frame as a single record and sends it.
    pub fn send(&mut self, data: &[u8]) {
        self.send_frames(&[data]);
    }

    /// Encrypts several null-terminated frames into one record and sends
    /// it.
    pub fn send_frames(&mut self, frames: &[&[u8]]) {
        let key = self.session_key();

        let mut plain = Vec::new();
        for frame in frames {
            plain.extend_from_slice(frame);
            plain.push(0);
        }

        let mut iv = [0u8; IV_SIZE];
        crypto::random_bytes(&mut iv);

        let cipher = crypto::encrypt(&plain, &key, &iv);

        let mut record = iv.to_vec();
        record.extend_from_slice(&cipher);
        self.stream.write_all(&record).unwrap();
    }

    /// Receives and decrypts the next null-terminated frame, without the
    /// terminator.
    pub fn recv_frame(&mut self) -> Vec<u8> {
        loop {
            if let Some(pos) = self.plain_buffer.iter().position(|&b| b == 0) {
                let mut frame: Vec<u8> = self.plain_buffer.drain(..=pos).collect();
                frame.pop();
                return frame;
            }

            let plain = self.recv_record();
            self.plain_buffer.extend_from_slice(&plain);
        }
    }

    /// Parses the next received frame as an error envelope.
    pub fn recv_error(&mut self) -> ErrorFrame {
        ErrorFrame::read(&self.recv_frame()).expect("malformed error envelope")
    }

    /// Parses the next received frame as a header.
    pub fn recv_header(&mut self) -> Header {
        Header::read(&self.recv_frame()).expect("malformed header")
    }

    fn recv_record(&mut self) -> Vec<u8> {
        let key = self.session_key();
        let mut record = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            let count = self.stream.read(&mut chunk).expect("recv timed out");
            assert!(count > 0, "server closed the connection");

            record.extend_from_slice(&chunk[..count]);

            if record.len() >= IV_SIZE + BLOCK_SIZE
                && (record.len() - IV_SIZE) % BLOCK_SIZE == 0
            {
                let mut iv = [0u8; IV_SIZE];
                iv.copy_from_slice(&record[..IV_SIZE]);

                if let Some(plain) = crypto::decrypt(&record[IV_SIZE..], &key, &iv) {
                    return plain;
                }
            }
        }
    }
}
