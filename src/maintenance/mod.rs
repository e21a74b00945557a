use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::logging::Logger;

/// Cancellation granularity: tickers sleep in short slices so stopping the
/// server never waits a full interval.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A named periodic background job. The job runs once at start and then on
/// every interval; job panics kill only this ticker's thread.
pub struct Ticker {
    name: &'static str,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start(
        name: &'static str,
        interval: Duration,
        logger: Arc<Logger>,
        mut job: impl FnMut() + Send + 'static,
    ) -> Self {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop_signal);

        let worker = thread::spawn(move || {
            logger.debug(
                Some("maintenance"),
                &format!("ticker '{name}' started ({}s interval)", interval.as_secs()),
            );
            loop {
                job();

                let slept_from = Instant::now();
                while slept_from.elapsed() < interval {
                    if worker_stop.load(Ordering::SeqCst) {
                        logger.debug(Some("maintenance"), &format!("ticker '{name}' stopped"));
                        return;
                    }
                    thread::sleep(STOP_POLL_INTERVAL.min(interval));
                }
                if worker_stop.load(Ordering::SeqCst) {
                    logger.debug(Some("maintenance"), &format!("ticker '{name}' stopped"));
                    return;
                }
            }
        });

        Self {
            name,
            stop_signal,
            worker: Some(worker),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
