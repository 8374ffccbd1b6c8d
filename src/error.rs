//! Error types.
//!
//! Each error is represented by a unique type that implements [`std::error::Error`].
//! Most APIs return the higher level [`StageError`] enum, which every concrete
//! error type converts into, allowing them to be used with `?`:
//!
//! ```
//! use asistage::error::{StageError, TimeoutError};
//!
//! fn foo() -> Result<(), TimeoutError> {
//!     // ...
//! # unimplemented!();
//! }
//!
//! fn bar() -> Result<(), StageError> {
//!     foo()?;
//!     // ...
//! # Ok(())
//! }
//! ```
//!
//! The variants of [`StageError`] map onto how a caller should react:
//!
//! * [`Connection`](StageError::Connection): the port could not be opened or
//!   is closed. Fatal to the session.
//! * [`Timeout`](StageError::Timeout): the device did not confirm in time. The
//!   command may or may not have taken effect; re-query before assuming
//!   either.
//! * [`Device`](StageError::Device): the device explicitly rejected the
//!   command, typically because it was invalid.
//! * [`ProtocolViolation`](StageError::ProtocolViolation): the response did
//!   not have the expected shape. The link is out of sync and should be
//!   reconnected rather than retried.
//! * [`InvalidArgument`](StageError::InvalidArgument): a distance or parameter
//!   could not be encoded. Nothing was sent to the device.
//! * [`Io`](StageError::Io): any other I/O failure on the port.

use std::time::Duration;

/// Implement Error and Display traits for the specified type.
///
/// After the type define the format string and any arguments it should
/// reference after `self =>` (to abide by macro hygiene rules).
macro_rules! impl_error_display {
    (
        $name:path,
        $self:ident =>
        $display:literal
        $(,
            $($arg:expr),+
        )?
    ) => {
        impl std::error::Error for $name {}

        impl std::fmt::Display for $name {
            fn fmt(&$self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    $display
                    $(,
                        $($arg),+
                    )?
                )
            }
        }
    };
}

/// Define an error enum that contains concrete error types (not other error enums).
///
/// From and TryFrom traits will be implemented for the enum and it's underlying
/// errors. The enum's Display implementation will defer to the underlying errors'
/// Display implementations.
///
/// ```compile_fail
/// # // This fails to compile because the macro is not exported.
/// error_enum!{
///     #[non_exhaustive]
///     pub enum ThisError {
///         VariantA(A),
///         VariantB(B),
///     }
/// }
/// ```
macro_rules! error_enum {
    (
        $(#[$attr:meta])*
        pub enum $name:ident {
            $(
                $(#[$variant_attr:meta])*
                $variant:ident($inner:path)
            ),+
            $(,)?
        }
    ) => {
        $(
            #[$attr]
        )*
        pub enum $name {
            $(
                $(#[$variant_attr])*
                $variant($inner)
            ),+
        }

        impl std::error::Error for $name {}

        // Defer the display to the inner error type
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(
                        $name::$variant(e) => e.fmt(f)
                    ),+
                }
            }
        }

        // Allow the enum to be convertible from an infallible error
        impl From<std::convert::Infallible> for $name {
            fn from(_: std::convert::Infallible) -> Self {
                unreachable!();
            }
        }

        // Conversions with underlying errors
        $(
            impl From<$inner> for $name {
                fn from(other: $inner) -> Self {
                    $name::$variant(other)
                }
            }

            impl TryFrom<$name> for $inner {
                type Error = $name;
                fn try_from(other: $name) -> Result<Self, Self::Error> {
                    match other {
                        $name::$variant(value) => Ok(value),
                        value => Err(value)
                    }
                }
            }
        )+
    };
}

/// The serial port could not be opened, or the driver has already been
/// disconnected from it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ConnectionError(Box<str>);

impl ConnectionError {
    /// Create an instance of the error.
    pub(crate) fn new<S: Into<Box<str>>>(description: S) -> Self {
        ConnectionError(description.into())
    }

    /// The error returned when using a transport after it has been closed.
    pub(crate) fn closed() -> Self {
        ConnectionError::new("the port has been closed")
    }

    /// A description of what went wrong.
    pub fn description(&self) -> &str {
        &self.0
    }
}

impl_error_display! {
    ConnectionError,
    self => "cannot communicate with the stage: {}", self.0
}

impl From<serialport::Error> for ConnectionError {
    fn from(other: serialport::Error) -> Self {
        match other.kind() {
            serialport::ErrorKind::NoDevice => ConnectionError::new(format!(
                "the device is either disconnected or already in use by another process: {}",
                other.description
            )),
            _ => ConnectionError::new(other.description),
        }
    }
}

/// What the driver was waiting for when it timed out.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WaitingFor {
    /// The response to a command, including its end-of-text terminator.
    Response,
    /// The device to report that it is no longer busy.
    Idle,
}

impl std::fmt::Display for WaitingFor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitingFor::Response => f.write_str("a response"),
            WaitingFor::Idle => f.write_str("the stage to become idle"),
        }
    }
}

/// The device did not confirm within the allotted time.
///
/// This means "the device did not confirm" rather than "the command failed":
/// any motion may have completed or may still be in progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimeoutError {
    waiting_for: WaitingFor,
    /// The timeout, in milliseconds, saturated at `u32::MAX`.
    millis: u32,
}

impl TimeoutError {
    /// Create an instance of the error.
    pub(crate) fn new(waiting_for: WaitingFor, timeout: Duration) -> Self {
        TimeoutError {
            waiting_for,
            millis: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
        }
    }

    /// What the driver was waiting for.
    pub fn waiting_for(&self) -> WaitingFor {
        self.waiting_for
    }

    /// How long the driver waited.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.millis))
    }
}

impl_error_display! {
    TimeoutError,
    self => "timed out after {} ms waiting for {}", self.millis, self.waiting_for
}

/// The device explicitly reported an error in response to a command.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DeviceProtocolError(Box<str>);

impl DeviceProtocolError {
    /// Create an instance of the error.
    pub(crate) fn new<S: Into<Box<str>>>(response: S) -> Self {
        DeviceProtocolError(response.into())
    }

    /// The raw error text sent by the device.
    pub fn response(&self) -> &str {
        &self.0
    }
}

impl_error_display! {
    DeviceProtocolError,
    self => "the stage rejected the command: {}", self.0
}

/// A response did not have the shape the protocol requires.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ProtocolViolationError(Box<[u8]>);

impl ProtocolViolationError {
    /// Create an instance of the error.
    pub(crate) fn new<R: AsRef<[u8]>>(bytes: R) -> Self {
        ProtocolViolationError(Box::from(bytes.as_ref()))
    }

    /// Get the bytes of the offending response.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl_error_display! {
    ProtocolViolationError,
    self => "received a malformed response: {:?}", String::from_utf8_lossy(&self.0)
}

/// A value passed to the driver cannot be expressed as a device command.
///
/// Distances must be finite and within the range of the controller's
/// integer units.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct InvalidArgumentError(Box<str>);

impl InvalidArgumentError {
    /// Create an instance of the error.
    pub(crate) fn new<S: Into<Box<str>>>(reason: S) -> Self {
        InvalidArgumentError(reason.into())
    }

    /// Why the value was rejected.
    pub fn reason(&self) -> &str {
        &self.0
    }
}

impl_error_display! {
    InvalidArgumentError,
    self => "invalid argument: {}", self.0
}

error_enum! {
    /// Any error returned by this library.
    #[derive(Debug)]
    #[non_exhaustive]
    pub enum StageError {
        /// See [`ConnectionError`].
        Connection(ConnectionError),
        /// See [`TimeoutError`].
        Timeout(TimeoutError),
        /// See [`DeviceProtocolError`].
        Device(DeviceProtocolError),
        /// See [`ProtocolViolationError`].
        ProtocolViolation(ProtocolViolationError),
        /// See [`InvalidArgumentError`].
        InvalidArgument(InvalidArgumentError),
        /// An I/O error on the underlying port.
        Io(std::io::Error),
    }
}

impl StageError {
    /// A convenience function for determining if the error is due to the
    /// device or port timing out.
    pub fn is_timeout(&self) -> bool {
        match self {
            StageError::Timeout(_) => true,
            StageError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether retrying the same operation could reasonably succeed.
    ///
    /// Connection failures and protocol violations are not recoverable by
    /// retrying; the port should be reopened instead. Invalid arguments fail
    /// the same way every time.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            StageError::Connection(_)
                | StageError::ProtocolViolation(_)
                | StageError::InvalidArgument(_)
        )
    }
}

impl From<serialport::Error> for StageError {
    fn from(other: serialport::Error) -> Self {
        StageError::Connection(other.into())
    }
}
