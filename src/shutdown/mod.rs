use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// The process-wide stop signal. The acceptor, every connection worker, and
/// the main thread watch one shared flag; SIGINT/SIGTERM set it, and so does
/// the server's own `stop`. `new` builds an unwired signal for tests and
/// embedding; `install` registers the process signal handlers on top of it.
pub struct ShutdownSignal {
    stop_requested: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            stop_requested: Arc::new(AtomicBool::new(false)),
            #[cfg(unix)]
            sig_ids: Vec::new(),
        }
    }

    pub fn install() -> io::Result<Self> {
        let signal = Self::new();

        #[cfg(unix)]
        {
            let mut signal = signal;
            signal
                .sig_ids
                .push(flag::register(SIGINT, Arc::clone(&signal.stop_requested))?);
            signal
                .sig_ids
                .push(flag::register(SIGTERM, Arc::clone(&signal.stop_requested))?);
            return Ok(signal);
        }

        #[cfg(not(unix))]
        {
            Ok(signal)
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// The shared flag handed to the acceptor and connection workers. All
    /// holders observe one another's stores, so a signal stops the whole
    /// server and `stop` needs no second bookkeeping flag.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    /// Parks the caller until the signal fires.
    pub fn wait(&self, poll_interval: Duration) {
        while !self.is_triggered() {
            std::thread::sleep(poll_interval);
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::ShutdownSignal;

    #[test]
    fn trigger_is_visible_through_shared_flag() {
        let signal = ShutdownSignal::new();
        let flag = signal.flag();
        assert!(!signal.is_triggered());

        signal.trigger();
        assert!(signal.is_triggered());
        assert!(flag.load(Ordering::SeqCst));

        // and the other way around: a holder of the flag stops the signal
        let signal = ShutdownSignal::new();
        signal.flag().store(true, Ordering::SeqCst);
        assert!(signal.is_triggered());
    }

    #[test]
    fn wait_returns_once_another_thread_triggers() {
        let signal = ShutdownSignal::new();
        let flag = signal.flag();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        signal.wait(Duration::from_millis(10));
        assert!(started.elapsed() < Duration::from_secs(2));
        trigger.join().expect("trigger thread should finish");
    }

    #[cfg(unix)]
    #[test]
    fn sigterm_sets_the_flag() {
        let signal = ShutdownSignal::install().expect("handlers should install");
        signal_hook::low_level::raise(signal_hook::consts::signal::SIGTERM)
            .expect("raise should work");

        let deadline = Instant::now() + Duration::from_secs(1);
        while !signal.is_triggered() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(signal.is_triggered());
    }
}
