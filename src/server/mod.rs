pub mod broadcast;
pub mod handlers;
pub mod worker;

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::config::ServerOptions;
use crate::logging::Logger;
use crate::multicast::DiscoveryResponder;
use crate::session::SessionRegistry;
use crate::shutdown::ShutdownSignal;
use crate::store::{StoreError, StorePool};
use crate::transport::{TlsListener, TransportError};
use crate::maintenance::Ticker;

use broadcast::SubscriberRegistry;
use handlers::HandlerContext;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum ServerError {
    Store(StoreError),
    Transport(TransportError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(source) => write!(f, "store startup failed: {source}"),
            Self::Transport(source) => write!(f, "transport startup failed: {source}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<StoreError> for ServerError {
    fn from(source: StoreError) -> Self {
        Self::Store(source)
    }
}

impl From<TransportError> for ServerError {
    fn from(source: TransportError) -> Self {
        Self::Transport(source)
    }
}

/// The central coordination server: TLS accept loop, per-connection workers,
/// discovery responder, and background maintenance. The acceptor and the
/// workers all watch the caller's shutdown signal, so SIGINT/SIGTERM and
/// `stop` go through the same flag.
pub struct CentralServer {
    logger: Arc<Logger>,
    stop_signal: Arc<AtomicBool>,
    local_addr: SocketAddr,
    accept_worker: Option<JoinHandle<()>>,
    connection_workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    tickers: Vec<Ticker>,
    responder: Option<DiscoveryResponder>,
}

impl CentralServer {
    pub fn start(
        options: &ServerOptions,
        logger: Arc<Logger>,
        shutdown: &ShutdownSignal,
    ) -> Result<Self, ServerError> {
        let pool = StorePool::open(&options.database, options.tuning.store_pool_size)?;
        let sessions = Arc::new(SessionRegistry::new());
        let ctx = Arc::new(HandlerContext::new(Arc::clone(&pool), Arc::clone(&sessions)));
        let subscribers = Arc::new(SubscriberRegistry::new());

        let listener = TlsListener::bind(
            "0.0.0.0",
            options.port,
            Path::new(&options.cert),
            Path::new(&options.key),
        )?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Accept { source })?;

        let stop_signal = shutdown.flag();

        let responder = if options.multicast_enabled {
            match DiscoveryResponder::start(
                options.multicast_address,
                options.multicast_port,
                local_addr.port(),
                Arc::clone(&logger),
            ) {
                Ok(responder) => Some(responder),
                Err(error) => {
                    logger.warn(
                        Some("server"),
                        &format!(
                            "Multicast discovery not started; continuing without it: {error}"
                        ),
                    );
                    None
                }
            }
        } else {
            None
        };

        let tickers = start_maintenance(options, &sessions, &logger);

        let connection_workers = Arc::new(Mutex::new(Vec::new()));
        let accept_worker = spawn_accept_loop(
            listener,
            Arc::clone(&stop_signal),
            ctx,
            subscribers,
            Arc::clone(&logger),
            Arc::clone(&connection_workers),
            options.tuning.max_frame_size_bytes,
        );

        logger.log(
            crate::logging::LogLevel::Info,
            Some("server"),
            "Central server started",
            Some(json!({
                "bind_address": local_addr.to_string(),
                "database": options.database,
                "store_pool_size": options.tuning.store_pool_size,
                "multicast": options.multicast_enabled,
            })),
        );

        Ok(Self {
            logger,
            stop_signal,
            local_addr,
            accept_worker: Some(accept_worker),
            connection_workers,
            tickers,
            responder,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.stop_signal.load(Ordering::SeqCst)
    }

    /// Raises the shared stop signal, then joins the acceptor, all
    /// connection workers, the maintenance tickers, and the discovery
    /// responder. The signal may already be up (SIGINT/SIGTERM); the joins
    /// still run exactly once.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);

        let Some(acceptor) = self.accept_worker.take() else {
            return;
        };
        let _ = acceptor.join();
        let workers = std::mem::take(
            &mut *self
                .connection_workers
                .lock()
                .expect("connection workers lock poisoned"),
        );
        for worker in workers {
            let _ = worker.join();
        }
        for ticker in &mut self.tickers {
            ticker.stop();
        }
        if let Some(responder) = &mut self.responder {
            responder.stop();
        }

        self.logger.info(Some("server"), "Central server stopped");
    }
}

impl Drop for CentralServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start_maintenance(
    options: &ServerOptions,
    sessions: &Arc<SessionRegistry>,
    logger: &Arc<Logger>,
) -> Vec<Ticker> {
    let session_timeout = Duration::from_secs(options.tuning.session_timeout_secs);

    let cleanup_sessions = Arc::clone(sessions);
    let cleanup_logger = Arc::clone(logger);
    let cleanup = Ticker::start(
        "session-cleanup",
        Duration::from_secs(options.tuning.cleanup_interval_secs),
        Arc::clone(logger),
        move || {
            let removed = cleanup_sessions.purge_expired(session_timeout);
            if removed > 0 {
                cleanup_logger.info(
                    Some("maintenance"),
                    &format!("purged {removed} expired session(s)"),
                );
            }
        },
    );

    // hooks only; vehicle polling and peer liveness are not wired up yet
    let collection_logger = Arc::clone(logger);
    let data_collection = Ticker::start(
        "data-collection",
        Duration::from_secs(options.tuning.data_collection_interval_secs),
        Arc::clone(logger),
        move || {
            collection_logger.debug(Some("maintenance"), "collecting vehicle data");
        },
    );

    let heartbeat_logger = Arc::clone(logger);
    let heartbeat = Ticker::start(
        "heartbeat",
        Duration::from_secs(options.tuning.heartbeat_interval_secs),
        Arc::clone(logger),
        move || {
            heartbeat_logger.debug(Some("maintenance"), "heartbeat tick");
        },
    );

    vec![cleanup, data_collection, heartbeat]
}

fn spawn_accept_loop(
    listener: TlsListener,
    stop_signal: Arc<AtomicBool>,
    ctx: Arc<HandlerContext>,
    subscribers: Arc<SubscriberRegistry>,
    logger: Arc<Logger>,
    connection_workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    max_frame_size: usize,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop_signal.load(Ordering::SeqCst) {
            match listener.try_accept() {
                Ok(Some(channel)) => {
                    let worker_ctx = Arc::clone(&ctx);
                    let worker_subscribers = Arc::clone(&subscribers);
                    let worker_logger = Arc::clone(&logger);
                    let worker_stop = Arc::clone(&stop_signal);
                    let worker = thread::spawn(move || {
                        worker::run_connection(
                            channel,
                            worker_ctx,
                            worker_subscribers,
                            worker_logger,
                            worker_stop,
                            max_frame_size,
                        );
                    });
                    connection_workers
                        .lock()
                        .expect("connection workers lock poisoned")
                        .push(worker);
                }
                Ok(None) => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(error) => {
                    logger.warn(Some("server::accept"), &format!("accept failed: {error}"));
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
    })
}
