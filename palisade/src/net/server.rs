use crate::logging;
use crate::net::channel::SecureChannel;
use crate::net::context::Context;
use crate::net::event_loop::{EventLoop, Notifier};
use crate::net::pool::WorkerPool;
use crate::net::shared::{
    ErrorUtils, NetworkError, NetworkResult, ERR_SERVER_ACCEPT_CONN_FAILED,
    ERR_SERVER_LISTEN_FAILED,
};
use crate::net::socket::Socket;
use hashbrown::HashMap;
use mio::Token;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3993;

const LISTENER_TOKEN: Token = Token(0);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A request handler bound to a path. Handlers run on worker threads and
/// receive the server facade plus the dispatching connection's context.
pub type HandlerFunc = Arc<dyn Fn(&ServerHandle, &mut Context) + Send + Sync>;

#[derive(Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    /// Worker thread count; 0 sizes the pool from the hardware.
    pub threads: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: DEFAULT_PORT,
            threads: 0,
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }
}

/// The non-owning facade handed to workers and handler closures. Exposes
/// only endpoint dispatch, work allocation and shutdown.
#[derive(Clone)]
pub struct ServerHandle {
    endpoints: Arc<HashMap<String, HandlerFunc>>,
    pool: Arc<WorkerPool>,
    notifier: Notifier,
    run: Arc<AtomicBool>,
    retire_tx: Sender<(usize, usize)>,
}

impl ServerHandle {
    /// Invokes the handler registered for the path. Returns false when no
    /// handler matches.
    pub fn exec_endpoint(&self, path: &str, context: &mut Context) -> bool {
        match self.endpoints.get(path) {
            Some(handler) => {
                handler(self, context);
                true
            }
            None => false,
        }
    }

    /// Submits a unit of work to the worker pool.
    #[inline]
    pub fn allocate_work<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.pool.enqueue(task);
    }

    /// Marks the event loop for exit.
    #[inline]
    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Queues a finished connection for removal on the loop thread. The
    /// identity cookie guards against the kernel reusing the fd for a new
    /// connection before the removal is processed.
    pub(crate) fn retire(&self, token: usize, identity: usize) {
        let _ = self.retire_tx.send((token, identity));
    }
}

/// Cheap remote control for a running server, for use from other threads.
#[derive(Clone)]
pub struct ServerControl {
    run: Arc<AtomicBool>,
}

impl ServerControl {
    /// Marks the event loop for exit; `run` returns once in-flight work
    /// has drained.
    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }
}

/// Owns the listening socket, the event loop, the worker pool, the handler
/// registry and the live connection set.
///
/// The loop thread does no I/O of its own: every readable connection is
/// handed to the pool as a unit of work, and the oneshot registration
/// guarantees a connection is never worked on by two threads at once. The
/// connection set is only ever mutated on the loop thread.
pub struct Server {
    config: ServerConfig,
    listener: Socket,
    event_loop: EventLoop,
    pool: Arc<WorkerPool>,
    endpoints: HashMap<String, HandlerFunc>,
    contexts: HashMap<usize, Arc<Mutex<Context>>>,
    run: Arc<AtomicBool>,
    status: i32,
    log: logging::Logger,
}

impl Server {
    pub fn new(config: ServerConfig) -> NetworkResult<Server> {
        let workers = match config.threads {
            0 => WorkerPool::default_workers(),
            count => count,
        };

        Ok(Server {
            config,
            listener: Socket::new(),
            event_loop: EventLoop::new()?,
            pool: Arc::new(WorkerPool::with_workers(workers)),
            endpoints: HashMap::new(),
            contexts: HashMap::new(),
            run: Arc::new(AtomicBool::new(true)),
            status: 0,
            log: logging::get(),
        })
    }

    /// Registers a handler for a path, replacing any prior entry. Must be
    /// called before `run`; the registry is immutable afterwards.
    pub fn set_endpoint<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&ServerHandle, &mut Context) + Send + Sync + 'static,
    {
        self.endpoints.insert(path.to_string(), Arc::new(handler));
    }

    /// A handle that can stop the server from another thread.
    pub fn control(&self) -> ServerControl {
        ServerControl {
            run: self.run.clone(),
        }
    }

    /// The exit status captured by the last `run`. 0 indicates no error.
    #[inline]
    pub fn status(&self) -> i32 {
        self.status
    }

    /// Marks the event loop for exit.
    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    /// Listens on the configured port, registers the accept event and runs
    /// the event loop until `stop` is called or a fatal error occurs.
    /// Returns the captured exit status.
    pub fn run(&mut self) -> i32 {
        self.status = match self.run_loop() {
            Ok(()) => 0,
            Err(_) => -1,
        };

        self.status
    }

    fn run_loop(&mut self) -> NetworkResult<()> {
        if let Err(err) = self.listener.listen(self.config.port) {
            logging::error!(self.log, "failed to start listening";
                            "context" => "run",
                            "code" => ERR_SERVER_LISTEN_FAILED,
                            "port" => self.config.port);
            return Err(err);
        }

        let notifier = self.event_loop.notifier();
        notifier.register_persistent(self.listener.listener_ref()?, LISTENER_TOKEN)?;

        let (retire_tx, retire_rx) = channel();

        let handle = ServerHandle {
            endpoints: Arc::new(self.endpoints.clone()),
            pool: self.pool.clone(),
            notifier: notifier.clone(),
            run: self.run.clone(),
            retire_tx,
        };

        logging::info!(self.log, "server running";
                       "port" => self.config.port,
                       "workers" => self.pool.size());

        while self.run.load(Ordering::SeqCst) {
            self.event_loop.poll(Some(POLL_INTERVAL))?;

            let events: Vec<mio::event::Event> = self.event_loop.events().collect();

            for event in events {
                if event.token() == LISTENER_TOKEN {
                    self.accept_connections(&handle);
                } else if event.readiness().is_readable() {
                    self.dispatch_readable(event.token(), &handle);
                }
            }

            self.retire_connections(&retire_rx, &notifier);
        }

        // Let in-flight handler work drain before tearing down
        self.pool.stop(true);
        self.listener.close();

        logging::info!(self.log, "server stopped"; "context" => "run");
        Ok(())
    }

    /// Accepts every queued connection, wraps each in a secure channel and
    /// a context, initiates the handshake and registers for readable
    /// events. Accept errors are logged and do not stop the server.
    fn accept_connections(&mut self, handle: &ServerHandle) {
        loop {
            let sock = match self.listener.accept() {
                Ok(sock) => sock,
                Err(NetworkError::Wait) => return,
                Err(_) => {
                    logging::error!(self.log, "failed to accept connection";
                                    "context" => "accept",
                                    "code" => ERR_SERVER_ACCEPT_CONN_FAILED);
                    return;
                }
            };

            let fd = match sock.raw_fd() {
                Some(fd) => fd,
                None => continue,
            };

            let mut channel = SecureChannel::new(sock);

            if channel.handshake_init().has_failed() {
                logging::error!(self.log, "failed to open connection";
                                "context" => "accept",
                                "code" => ERR_SERVER_ACCEPT_CONN_FAILED,
                                "token" => fd);
                continue;
            }

            let context = Context::new(Token(fd), channel);

            if context.register(handle.notifier()).has_failed() {
                logging::error!(self.log, "failed to register connection";
                                "context" => "accept",
                                "code" => ERR_SERVER_ACCEPT_CONN_FAILED,
                                "token" => fd);
                continue;
            }

            self.contexts.insert(fd, Arc::new(Mutex::new(context)));

            logging::debug!(self.log, "connection accepted";
                            "context" => "accept",
                            "token" => fd);
        }
    }

    /// Hands a readable connection to the worker pool. The worker re-arms
    /// the event when it is done, or queues the connection for teardown.
    fn dispatch_readable(&mut self, token: Token, handle: &ServerHandle) {
        let context = match self.contexts.get(&token.0) {
            Some(context) => context.clone(),
            None => return,
        };

        let handle = handle.clone();

        self.pool.enqueue(move || {
            let identity = Arc::as_ptr(&context) as usize;
            let mut ctx = context.lock().unwrap();

            ctx.on_readable(&handle);

            if ctx.is_closed() {
                let _ = ctx.deregister(handle.notifier());
                handle.retire(ctx.token().0, identity);
            } else if ctx.rearm(handle.notifier()).has_failed() {
                handle.retire(ctx.token().0, identity);
            }
        });
    }

    /// Removes finished connections from the live set. Runs on the loop
    /// thread, which is the only mutator of the set. Entries are only
    /// removed when the identity still matches, in case the fd has already
    /// been reused by a newly accepted connection.
    fn retire_connections(&mut self, retire_rx: &Receiver<(usize, usize)>, notifier: &Notifier) {
        while let Ok((token, identity)) = retire_rx.try_recv() {
            let current = self
                .contexts
                .get(&token)
                .map(|entry| Arc::as_ptr(entry) as usize);

            if current != Some(identity) {
                continue;
            }

            if let Some(context) = self.contexts.remove(&token) {
                let _ = context.lock().unwrap().deregister(notifier);

                logging::debug!(self.log, "connection retired";
                                "context" => "retire",
                                "token" => token);
            }
        }
    }
}
