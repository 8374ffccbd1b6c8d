//! Background refresh of cached axis positions.
//!
//! A [`Poller`] runs on its own thread and periodically reads the positions of
//! a set of axes so that passive observers (status displays and the like) can
//! use [`Stage::axis_state`] without touching the transport themselves.
//!
//! Polling competes with foreground commands for the transport. A consumer
//! about to issue a burst of motion can ask the poller to back off through
//! the shared [`ObserverFlag`]. The flag is advisory: it only lowers the poll
//! rate and does not exclude anyone from the transport.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::{axis::Axis, backend::Backend, error::StageError, retry::Retry, stage::Stage};

/// A shared, advisory request that the poller slow down.
///
/// Clones refer to the same flag. It is a plain boolean, not a counter:
/// consumers are expected to cooperate, and if two of them suppress polling at
/// once, the first to finish re-enables it for both.
#[derive(Debug, Clone, Default)]
pub struct ObserverFlag(Arc<AtomicBool>);

impl ObserverFlag {
    /// Create a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether polling is currently suppressed.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Set or clear the flag directly.
    pub fn set(&self, suppressed: bool) {
        self.0.store(suppressed, Ordering::Release);
    }

    /// Suppress polling until the returned guard is dropped.
    pub fn suppress(&self) -> Suppression {
        self.set(true);
        Suppression { flag: self.clone() }
    }
}

/// Keeps polling suppressed while alive. See [`ObserverFlag::suppress`].
#[derive(Debug)]
#[must_use = "polling resumes as soon as the guard is dropped"]
pub struct Suppression {
    flag: ObserverFlag,
}

impl Drop for Suppression {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// How a [`Poller`] behaves.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// The pause between refresh cycles.
    pub interval: Duration,
    /// The pause between checks of the [`ObserverFlag`] while it is set.
    pub suppressed_interval: Duration,
    /// The axes whose positions are refreshed each cycle.
    pub axes: Vec<Axis>,
    /// How long [`Poller::stop`] waits for the thread to exit.
    pub shutdown_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_millis(100),
            suppressed_interval: Duration::from_secs(1),
            axes: vec![Axis::X, Axis::Y],
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

/// A background thread refreshing cached positions.
///
/// The thread is stopped by [`stop`](Self::stop) or when the poller is
/// dropped.
#[derive(Debug)]
pub struct Poller {
    shutdown: Option<Sender<()>>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
    cycles: Arc<AtomicU64>,
}

impl Poller {
    /// Start polling `stage`.
    ///
    /// Each read is wrapped in `retry`. Failed reads are logged and polling
    /// carries on with the next cycle.
    pub fn spawn<B>(
        stage: Arc<Stage<B>>,
        retry: Retry,
        observer: ObserverFlag,
        config: PollConfig,
    ) -> Result<Self, StageError>
    where
        B: Backend + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(0);
        let cycles = Arc::new(AtomicU64::new(0));
        let shutdown_timeout = config.shutdown_timeout;

        let handle = {
            let cycles = Arc::clone(&cycles);
            thread::Builder::new()
                .name("asistage-poll".into())
                .spawn(move || {
                    // Dropped when the thread exits, by any route, which is
                    // what `stop` waits for.
                    let _done: Sender<()> = done_tx;
                    poll_loop(&stage, retry, &observer, &config, &shutdown_rx, &cycles);
                })?
        };
        Ok(Poller {
            shutdown: Some(shutdown_tx),
            done: done_rx,
            handle: Some(handle),
            shutdown_timeout,
            cycles,
        })
    }

    /// The number of refresh cycles completed so far, successful or not.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Whether the polling thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Ask the thread to exit and wait for it, up to the shutdown timeout.
    ///
    /// The thread notices the request within one pause, but a refresh in
    /// progress runs to completion first. Returns whether the thread exited in
    /// time. If it did not, it is left to finish on its own. Calling this
    /// again after the thread has stopped does nothing and returns `true`.
    pub fn stop(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        // Disconnecting the channel wakes the thread whether or not it is
        // currently waiting on it.
        drop(self.shutdown.take());
        match self.done.recv_timeout(self.shutdown_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    log::error!("position polling thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log::error!(
                    "position polling did not stop within {} ms, detaching it",
                    self.shutdown_timeout.as_millis()
                );
                false
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop<B: Backend>(
    stage: &Stage<B>,
    retry: Retry,
    observer: &ObserverFlag,
    config: &PollConfig,
    shutdown: &Receiver<()>,
    cycles: &AtomicU64,
) {
    let name = stage.transport().name();
    log::debug!("{name} position polling started");
    loop {
        let pause = if observer.is_set() {
            config.suppressed_interval
        } else {
            for &axis in &config.axes {
                let what = format!("polling {axis} position");
                if let Err(e) = retry.run(&what, || stage.read_position(axis)) {
                    log::warn!("{name} {what} failed: {e}");
                }
            }
            cycles.fetch_add(1, Ordering::Relaxed);
            config.interval
        };
        match shutdown.recv_timeout(pause) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("{name} position polling stopped");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::{Mock, MockStage},
        transport::{Timing, Transport},
    };
    use std::time::Instant;

    fn stage(sim: &MockStage) -> Arc<Stage<Mock>> {
        let timing = Timing {
            settle_delay: Duration::ZERO,
            response_timeout: Duration::from_millis(10),
        };
        let transport = Transport::open(sim.backend(), timing).unwrap();
        Arc::new(Stage::new(transport, "2H", Duration::from_millis(1)))
    }

    fn fast() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(2),
            suppressed_interval: Duration::from_millis(2),
            ..PollConfig::default()
        }
    }

    /// Wait up to a few seconds for `condition` to hold.
    fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn refreshes_configured_axes() {
        let sim = MockStage::new();
        sim.set_position(Axis::X, 1.0);
        sim.set_position(Axis::Y, 2.0);
        let stage = stage(&sim);

        let mut poller =
            Poller::spawn(Arc::clone(&stage), Retry::new(1), ObserverFlag::new(), fast()).unwrap();
        assert!(eventually(|| stage.axis_state(Axis::Y).position.is_some()));
        assert_eq!(stage.axis_state(Axis::X).position, Some(1.0));
        assert_eq!(stage.axis_state(Axis::Y).position, Some(2.0));
        assert_eq!(stage.axis_state(Axis::Z).position, None);

        sim.set_position(Axis::X, 4.0);
        assert!(eventually(|| stage.axis_state(Axis::X).position == Some(4.0)));

        assert!(poller.is_running());
        assert!(poller.stop());
        assert!(!poller.is_running());
        assert!(poller.stop());
    }

    #[test]
    fn suppression_pauses_refresh() {
        let sim = MockStage::new();
        let stage = stage(&sim);
        let observer = ObserverFlag::new();

        let guard = observer.suppress();
        assert!(observer.is_set());
        let poller =
            Poller::spawn(Arc::clone(&stage), Retry::new(1), observer.clone(), fast()).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(poller.cycles(), 0);
        assert_eq!(stage.axis_state(Axis::X).position, None);

        drop(guard);
        assert!(!observer.is_set());
        assert!(eventually(|| poller.cycles() > 0));
        assert!(eventually(|| stage.axis_state(Axis::X).position.is_some()));
    }

    #[test]
    fn failed_cycles_do_not_stop_polling() {
        let sim = MockStage::new();
        sim.set_position(Axis::X, 3.0);
        let stage = stage(&sim);
        sim.silence_next(6);

        let config = PollConfig {
            axes: vec![Axis::X],
            ..fast()
        };
        let poller = Poller::spawn(Arc::clone(&stage), Retry::new(2), ObserverFlag::new(), config)
            .unwrap();
        assert!(eventually(|| stage.axis_state(Axis::X).position.is_some()));
        assert!(poller.cycles() >= 3);
        assert!(poller.is_running());
    }

    #[test]
    fn stop_interrupts_long_pause() {
        let sim = MockStage::new();
        let stage = stage(&sim);
        let config = PollConfig {
            interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            ..PollConfig::default()
        };
        let mut poller =
            Poller::spawn(Arc::clone(&stage), Retry::new(1), ObserverFlag::new(), config).unwrap();
        assert!(eventually(|| poller.cycles() == 1));

        let start = Instant::now();
        assert!(poller.stop());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
