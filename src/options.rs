//! Options for connecting to a stage.

use crate::{
    axis::Axis,
    backend::{Backend, Serial, UNKNOWN_BACKEND_NAME},
    driver::Driver,
    error::{ConnectionError, StageError},
    poll::PollConfig,
    retry::{Retry, DEFAULT_MAX_ATTEMPTS},
    stage::{Stage, DEFAULT_ADDRESS, DEFAULT_BUSY_POLL_INTERVAL},
    transport::{Timing, Transport},
};
use serialport as sp;
use std::time::Duration;

/// Options for configuring and opening a connection to a stage.
///
/// ## Example
///
/// ```rust
/// # use asistage::OpenOptions;
/// # use std::time::Duration;
/// # fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
/// let driver = OpenOptions::new()
///     .move_timeout(Duration::from_secs(30))
///     .poll_interval(Duration::from_millis(200))
///     .open("/dev/ttyUSB0")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// The custom baud rate
    baud_rate: u32,
    /// How long a single read waits for a byte.
    byte_timeout: Duration,
    timing: Timing,
    /// The card address prefixed to every command.
    address: String,
    busy_poll_interval: Duration,
    move_timeout: Duration,
    retry_attempts: u32,
    poll: PollConfig,
    /// Whether to start background polling.
    polling: bool,
}

impl OpenOptions {
    /// The default baud rate of ASI controllers: 115,200.
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;
    /// The default time a single read waits for a byte: 20 ms.
    pub const DEFAULT_BYTE_TIMEOUT: Duration = Duration::from_millis(20);
    /// The default time allowed for a move to finish: 10 s.
    pub const DEFAULT_MOVE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a set of options with the defaults, ready for configuration.
    ///
    /// Equivalent to [`default`](OpenOptions::default).
    pub fn new() -> Self {
        OpenOptions {
            baud_rate: OpenOptions::DEFAULT_BAUD_RATE,
            byte_timeout: OpenOptions::DEFAULT_BYTE_TIMEOUT,
            timing: Timing::default(),
            address: DEFAULT_ADDRESS.to_string(),
            busy_poll_interval: DEFAULT_BUSY_POLL_INTERVAL,
            move_timeout: OpenOptions::DEFAULT_MOVE_TIMEOUT,
            retry_attempts: DEFAULT_MAX_ATTEMPTS,
            poll: PollConfig::default(),
            polling: true,
        }
    }

    /// Set a custom baud rate.
    ///
    /// The default is 115,200.
    pub fn baud_rate(&mut self, baud_rate: u32) -> &mut Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set how long a single read of the port waits for data.
    ///
    /// The default is 20 ms.
    pub fn byte_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.byte_timeout = timeout;
        self
    }

    /// Set the pause between sending a command and reading its response.
    ///
    /// The default is 10 ms.
    pub fn settle_delay(&mut self, delay: Duration) -> &mut Self {
        self.timing.settle_delay = delay;
        self
    }

    /// Set how long to wait for a complete response.
    ///
    /// The default is 1 second.
    pub fn response_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timing.response_timeout = timeout;
        self
    }

    /// Set the card address prefixed to every command.
    ///
    /// The default is `2H`, the XY card of a typical controller.
    pub fn address<A: Into<String>>(&mut self, address: A) -> &mut Self {
        self.address = address.into();
        self
    }

    /// Set the interval between status queries while waiting for a move.
    ///
    /// The default is 10 ms.
    pub fn busy_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.busy_poll_interval = interval;
        self
    }

    /// Set how long the driver's `*_and_wait` methods wait for a move.
    ///
    /// The default is 10 seconds.
    pub fn move_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.move_timeout = timeout;
        self
    }

    /// Set how many times foreground operations are attempted.
    ///
    /// The default is 10.
    pub fn retry_attempts(&mut self, attempts: u32) -> &mut Self {
        self.retry_attempts = attempts;
        self
    }

    /// Set whether positions are polled in the background.
    ///
    /// The default is `true`.
    pub fn polling(&mut self, enabled: bool) -> &mut Self {
        self.polling = enabled;
        self
    }

    /// Set the pause between background refreshes.
    ///
    /// The default is 100 ms.
    pub fn poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll.interval = interval;
        self
    }

    /// Set the pause between checks while polling is suppressed.
    ///
    /// The default is 1 second.
    pub fn suppressed_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll.suppressed_interval = interval;
        self
    }

    /// Set which axes are polled.
    ///
    /// The default is X and Y.
    pub fn polled_axes(&mut self, axes: &[Axis]) -> &mut Self {
        self.poll.axes = axes.to_vec();
        self
    }

    /// Set how long disconnecting waits for the polling thread to exit.
    ///
    /// The default is 1 second.
    pub fn shutdown_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.poll.shutdown_timeout = timeout;
        self
    }

    /// Open a [`Serial`] port configured for ASI controllers at the specified path.
    fn open_serial_port(&self, path: &str) -> Result<Serial, StageError> {
        // The baud rate passed to `new` is ignored on some platforms, so it
        // is set again with the `baud_rate` method.
        sp::new(path, OpenOptions::DEFAULT_BAUD_RATE)
            .data_bits(sp::DataBits::Eight)
            .parity(sp::Parity::None)
            .flow_control(sp::FlowControl::None)
            .stop_bits(sp::StopBits::One)
            .timeout(self.byte_timeout)
            .baud_rate(self.baud_rate)
            .open_native()
            .map(Serial)
            .map_err(Into::into)
    }

    /// Connect to the stage on the serial port at the specified path.
    pub fn open(&self, path: &str) -> Result<Driver<Serial>, StageError> {
        self.open_backend(self.open_serial_port(path)?)
    }

    /// Connect to the stage on the serial port at the specified path.
    ///
    /// The type of the underlying backend is erased via dynamic dispatch.
    /// [`OpenOptions::open`] should generally be used instead, except when
    /// the type of the backend may not be known at compile time.
    pub fn open_dyn(&self, path: &str) -> Result<Driver<Box<dyn Backend + Send>>, StageError> {
        self.open_backend(Box::new(self.open_serial_port(path)?) as Box<dyn Backend + Send>)
    }

    /// Connect to a stage over an already open backend.
    pub fn open_backend<B>(&self, backend: B) -> Result<Driver<B>, StageError>
    where
        B: Backend + Send + 'static,
    {
        let stage = self.open_stage(backend)?;
        let poll = self.polling.then(|| self.poll.clone());
        Driver::new(
            stage,
            Retry::new(self.retry_attempts),
            poll,
            self.move_timeout,
        )
    }

    /// Open a bare [`Stage`] over an already open backend, without retries
    /// or polling.
    ///
    /// Failing to configure the backend is a [`ConnectionError`].
    pub fn open_stage<B: Backend>(&self, mut backend: B) -> Result<Stage<B>, StageError> {
        backend
            .set_read_timeout(Some(self.byte_timeout))
            .map_err(|e| {
                let name = backend
                    .name()
                    .unwrap_or_else(|| UNKNOWN_BACKEND_NAME.to_string());
                ConnectionError::new(format!("failed to configure {name}: {e}"))
            })?;
        let transport = Transport::open(backend, self.timing)?;
        Ok(Stage::new(transport, self.address.clone(), self.busy_poll_interval))
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions::new()
    }
}
