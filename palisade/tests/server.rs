//! End-to-end scenarios driving a live server over localhost.

mod common;

use common::Client;
use palisade::logging;
use palisade::net::frame::{Header, MessageType};
use palisade::net::server::{Server, ServerConfig, ServerControl};
use palisade::net::shared::{ERR_CONTEXT_HANDLE_READ_FAILED, ERR_CONTEXT_HANDLE_REQUEST_FAILED};
use palisade::time::timestamp_micros;
use std::thread;
use std::time::Duration;

fn start_server<F>(port: u16, configure: F) -> (ServerControl, thread::JoinHandle<i32>)
where
    F: FnOnce(&mut Server),
{
    logging::init();

    let mut server = Server::new(ServerConfig { port, threads: 4 }).unwrap();
    configure(&mut server);

    let control = server.control();
    let runner = thread::spawn(move || server.run());

    (control, runner)
}

fn stop_server(control: ServerControl, runner: thread::JoinHandle<i32>) {
    control.stop();
    assert_eq!(runner.join().unwrap(), 0);
}

#[test]
fn handshake_integration_test() {
    let (control, runner) = start_server(47811, |_| {});

    let mut client = Client::connect(47811);
    let host_hs = client.handshake();

    assert!(!host_hs.public_key.is_empty());
    assert_eq!(host_hs.iv.len(), 16);
    assert_eq!(client.session_key().len(), 32);

    stop_server(control, runner);
}

#[test]
fn ping_integration_test() {
    let (control, runner) = start_server(47812, |_| {});

    let mut client = Client::connect(47812);
    client.handshake();

    let sent = Header::new(MessageType::Ping, "", 0, timestamp_micros());
    client.send(&sent.encode());

    let echoed = client.recv_header();
    assert_eq!(echoed.kind, MessageType::Ping);
    assert_eq!(echoed.timestamp, sent.timestamp);

    logging::info!(logging::get(), "ping round trip";
                   "elapsed_us" => timestamp_micros() - sent.timestamp);

    stop_server(control, runner);
}

#[test]
fn handler_integration_test() {
    let (control, runner) = start_server(47813, |server| {
        server.set_endpoint("/test/1", |_, ctx| {
            ctx.send_message(b"You've made it!");
        });
        server.set_endpoint("/test/2", |_, ctx| {
            ctx.send_message(b"Another one...");
        });
    });

    let mut client = Client::connect(47813);
    client.handshake();

    let header = Header::new(MessageType::Request, "/test/1", 0, timestamp_micros());
    client.send(&header.encode());
    assert_eq!(client.recv_frame(), b"You've made it!");

    let header = Header::new(MessageType::Request, "/test/2", 0, timestamp_micros());
    client.send(&header.encode());
    assert_eq!(client.recv_frame(), b"Another one...");

    stop_server(control, runner);
}

#[test]
fn request_body_together_integration_test() {
    let (control, runner) = start_server(47814, |server| {
        server.set_endpoint("/echo", |_, ctx| {
            let body = ctx.request_body().to_vec();
            ctx.send_message(&body);
        });
    });

    let mut client = Client::connect(47814);
    client.handshake();

    let body = b"Hello, World!";
    let header = Header::new(MessageType::Request, "/echo", body.len() as u32, timestamp_micros());

    // Header and body framed together in a single record
    client.send_frames(&[&header.encode(), body]);
    assert_eq!(client.recv_frame(), body);

    stop_server(control, runner);
}

#[test]
fn request_body_separately_integration_test() {
    let (control, runner) = start_server(47815, |server| {
        server.set_endpoint("/echo", |_, ctx| {
            let body = ctx.request_body().to_vec();
            ctx.send_message(&body);
        });
    });

    let mut client = Client::connect(47815);
    client.handshake();

    for _ in 0..5 {
        let body = b"Hello, World!";
        let header = Header::new(MessageType::Request, "/echo", body.len() as u32, timestamp_micros());

        client.send(&header.encode());
        // Give the server time to consume the header record before the
        // body record lands, so the two do not merge on the stream
        thread::sleep(Duration::from_millis(200));
        client.send(body);

        assert_eq!(client.recv_frame(), body);
    }

    stop_server(control, runner);
}

#[test]
fn malformed_header_integration_test() {
    let (control, runner) = start_server(47816, |_| {});

    let mut client = Client::connect(47816);
    client.handshake();

    // A frame that cannot parse as a header: an unterminated varint
    client.send(&[0xff; 16]);

    let error = client.recv_error();
    assert_eq!(error.code, ERR_CONTEXT_HANDLE_READ_FAILED);
    assert!(!error.message.is_empty());
    assert!(error.timestamp > 0);

    // The connection survives; a subsequent ping still round-trips
    let ping = Header::new(MessageType::Ping, "", 0, timestamp_micros());
    client.send(&ping.encode());

    let echoed = client.recv_header();
    assert_eq!(echoed.timestamp, ping.timestamp);

    stop_server(control, runner);
}

#[test]
fn unknown_path_integration_test() {
    let (control, runner) = start_server(47817, |_| {});

    let mut client = Client::connect(47817);
    client.handshake();

    let header = Header::new(MessageType::Request, "/nowhere", 0, timestamp_micros());
    client.send(&header.encode());

    let error = client.recv_error();
    assert_eq!(error.code, ERR_CONTEXT_HANDLE_REQUEST_FAILED);

    stop_server(control, runner);
}

#[test]
fn many_clients_integration_test() {
    let (control, runner) = start_server(47818, |server| {
        server.set_endpoint("/one", |_, ctx| {
            ctx.send_message(b"1");
        });
    });

    let mut workers = Vec::new();

    for _ in 0..25 {
        workers.push(thread::spawn(|| {
            for _ in 0..4 {
                let mut client = Client::connect(47818);
                client.handshake();

                let header = Header::new(MessageType::Request, "/one", 0, timestamp_micros());
                client.send(&header.encode());

                assert_eq!(client.recv_frame(), b"1");
            }
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    stop_server(control, runner);
}

#[test]
fn handler_allocates_work_integration_test() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let side_effects = Arc::new(AtomicUsize::new(0));
    let observed = side_effects.clone();

    let (control, runner) = start_server(47819, move |server| {
        server.set_endpoint("/work", move |handle, ctx| {
            let counter = side_effects.clone();
            handle.allocate_work(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            ctx.send_message(b"queued");
        });
    });

    let mut client = Client::connect(47819);
    client.handshake();

    let header = Header::new(MessageType::Request, "/work", 0, timestamp_micros());
    client.send(&header.encode());
    assert_eq!(client.recv_frame(), b"queued");

    thread::sleep(Duration::from_millis(200));
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    stop_server(control, runner);
}
