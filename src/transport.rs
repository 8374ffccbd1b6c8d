//! Request/response exchange with the controller over a serial link.
//!
//! The protocol is strictly half duplex: a command is a line of ASCII text
//! terminated by a carriage return, and the controller answers with a line
//! followed by a terminator byte. Responses carry no correlation IDs, so two
//! exchanges must never overlap. A [`Transport`] enforces this by guarding
//! the link with a mutex; every exchange happens through a [`Session`], which
//! holds the lock for as long as it lives.
//!
//! ```
//! # use asistage::{backend::Backend, transport::Transport, error::StageError};
//! # fn wrapper<B: Backend>(transport: &Transport<B>) -> Result<(), StageError> {
//! // A single exchange.
//! let x = transport.ask("2HW X")?;
//!
//! // Several exchanges that must not be interleaved with anything else.
//! let mut session = transport.lock()?;
//! let x = session.ask("2HW X")?;
//! let y = session.ask("2HW Y")?;
//! # Ok(())
//! # }
//! ```


use crate::backend::{Backend, UNKNOWN_BACKEND_NAME};
use crate::error::{
	ConnectionError, DeviceProtocolError, ProtocolViolationError, StageError, TimeoutError,
	WaitingFor,
};
use std::{
	io,
	sync::{Mutex, MutexGuard},
	thread,
	time::{Duration, Instant},
};

/// The end-of-text byte that ends every standard response.
pub const TERMINATOR: u8 = 0x03;
/// The backspace byte, which makes the controller abort the current command
/// and flush its input buffer.
pub const ABORT: u8 = 0x08;
/// The prefix of every successful response.
pub const SUCCESS_MARKER: &str = ":A";
/// Prefixes of responses reporting that the controller rejected a command.
///
/// They are checked before [`SUCCESS_MARKER`], which the first one shares.
pub const ERROR_MARKERS: [&str; 2] = [":AERR", ":N"];

const CARRIAGE_RETURN: u8 = b'\r';
const LINE_FEED: u8 = b'\n';
/// The most stale bytes discarded when resynchronising, so a babbling device
/// cannot stall the caller forever.
const MAX_DISCARD: usize = 4096;

/// Timing parameters for exchanges.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timing {
	/// How long to wait after sending a command before reading its response.
	pub settle_delay: Duration,
	/// How long to wait for a complete response, terminator included.
	pub response_timeout: Duration,
}

impl Default for Timing {
	fn default() -> Self {
		Timing {
			settle_delay: Duration::from_millis(10),
			response_timeout: Duration::from_secs(1),
		}
	}
}

/// The state protected by the transport's lock.
struct Link<B> {
	/// The backend, or `None` once closed.
	backend: Option<B>,
	/// Set when an exchange was abandoned part way through. Stale bytes from
	/// it may still arrive and must be discarded before the next exchange.
	desynced: bool,
}

/// Exclusive, serialised access to a controller.
///
/// All methods take `&self`, so a transport can be shared between threads
/// (for instance via an `Arc`). Each exchange locks the link for its whole
/// duration.
pub struct Transport<B> {
	link: Mutex<Link<B>>,
	timing: Timing,
	name: String,
}

impl<B: Backend> std::fmt::Debug for Transport<B> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Transport")
			.field("name", &self.name)
			.field("timing", &self.timing)
			.finish_non_exhaustive()
	}
}

impl<B: Backend> Transport<B> {
	/// Take ownership of an open backend and prepare the controller for
	/// commands.
	///
	/// The abort byte is sent, to cancel anything half-typed on the
	/// controller, and any bytes already waiting to be read are discarded.
	pub fn open(mut backend: B, timing: Timing) -> Result<Self, StageError> {
		let name = backend
			.name()
			.unwrap_or_else(|| UNKNOWN_BACKEND_NAME.to_string());
		let prepare = |backend: &mut B| -> Result<usize, io::Error> {
			io::Write::write_all(backend, &[ABORT])?;
			io::Write::flush(backend)?;
			discard_input(backend)
		};
		match prepare(&mut backend) {
			Ok(0) => {}
			Ok(n) => log::debug!("{name} discarded {n} stale bytes on open"),
			Err(e) => {
				return Err(
					ConnectionError::new(format!("failed to prepare {name}: {e}")).into(),
				)
			}
		}
		log::debug!("{name} opened");
		Ok(Transport {
			link: Mutex::new(Link {
				backend: Some(backend),
				desynced: false,
			}),
			timing,
			name,
		})
	}

	/// Get the "name" of the underlying backend.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Get the timing parameters.
	pub fn timing(&self) -> Timing {
		self.timing
	}

	/// Lock the link for a sequence of exchanges.
	///
	/// Blocks until no other session is active. If a thread panicked while
	/// holding the lock, the link is recovered and resynchronised before its
	/// next exchange.
	pub fn lock(&self) -> Result<Session<'_, B>, StageError> {
		let guard = match self.link.lock() {
			Ok(guard) => guard,
			Err(poisoned) => {
				self.link.clear_poison();
				let mut guard = poisoned.into_inner();
				guard.desynced = true;
				guard
			}
		};
		if guard.backend.is_none() {
			return Err(ConnectionError::closed().into());
		}
		Ok(Session {
			link: guard,
			timing: &self.timing,
			name: &self.name,
		})
	}

	/// Send a command without reading a response.
	///
	/// See [`Session::send_command`].
	pub fn send_command(&self, command: &str) -> Result<(), StageError> {
		self.lock()?.send_command(command)
	}

	/// Send a command and read its standard response.
	///
	/// See [`Session::ask`].
	pub fn ask(&self, command: &str) -> Result<String, StageError> {
		self.lock()?.ask(command)
	}

	/// Send a command and read a status style response.
	///
	/// See [`Session::ask_status`].
	pub fn ask_status(&self, command: &str) -> Result<String, StageError> {
		self.lock()?.ask_status(command)
	}

	/// Close the underlying backend.
	///
	/// Closing an already closed transport does nothing. Any later exchange
	/// fails with a [`ConnectionError`].
	pub fn close(&self) {
		let mut guard = self
			.link
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner);
		if guard.backend.take().is_some() {
			log::debug!("{} closed", self.name);
		}
	}

	/// Whether [`close`](Self::close) has been called.
	pub fn is_closed(&self) -> bool {
		self.link
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.backend
			.is_none()
	}
}

/// Exclusive access to the link for a sequence of exchanges.
///
/// Created with [`Transport::lock`]. The lock is released when the session is
/// dropped.
pub struct Session<'t, B> {
	link: MutexGuard<'t, Link<B>>,
	timing: &'t Timing,
	name: &'t str,
}

impl<B> std::fmt::Debug for Session<'_, B> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("name", &self.name)
			.finish_non_exhaustive()
	}
}

impl<B: Backend> Session<'_, B> {
	fn backend(&mut self) -> Result<&mut B, StageError> {
		self.link
			.backend
			.as_mut()
			.ok_or_else(|| ConnectionError::closed().into())
	}

	/// Append the carriage-return terminator to `command` and write it.
	///
	/// No response is read.
	pub fn send_command(&mut self, command: &str) -> Result<(), StageError> {
		let mut bytes = Vec::with_capacity(command.len() + 1);
		bytes.extend_from_slice(command.as_bytes());
		bytes.push(CARRIAGE_RETURN);
		log::debug!("{} TX:   {}", self.name, command);
		let backend = self.backend()?;
		io::Write::write_all(backend, &bytes)?;
		io::Write::flush(backend)?;
		Ok(())
	}

	/// Send a command and read its standard response.
	///
	/// After the settle delay, the response line is read, followed by the
	/// [`TERMINATOR`] byte. The whole response must arrive within the response
	/// timeout, otherwise a [`TimeoutError`] is returned.
	///
	/// On success, the payload is returned: the line with the
	/// [`SUCCESS_MARKER`] removed and surrounding whitespace trimmed.
	///
	/// ## Errors
	///
	/// * [`DeviceProtocolError`] if the line starts with one of the
	///   [`ERROR_MARKERS`].
	/// * [`ProtocolViolationError`] if the line starts with anything else
	///   other than the success marker, or if a byte other than the terminator
	///   follows the line.
	pub fn ask(&mut self, command: &str) -> Result<String, StageError> {
		self.resync()?;
		self.send_command(command)?;
		thread::sleep(self.timing.settle_delay);

		let deadline = Instant::now() + self.timing.response_timeout;
		let line = self.read_line(deadline)?;
		self.read_terminator(deadline)?;
		parse_response(&line)
	}

	/// Send a command whose response is a bare status line.
	///
	/// Unlike [`ask`](Self::ask), the line has no marker and is followed by a
	/// single acknowledgement byte rather than the terminator. The
	/// acknowledgement is consumed but its value is not checked. The trimmed
	/// line is returned.
	pub fn ask_status(&mut self, command: &str) -> Result<String, StageError> {
		self.resync()?;
		self.send_command(command)?;

		let deadline = Instant::now() + self.timing.response_timeout;
		let line = self.read_line(deadline)?;
		if self.read_byte()?.is_none() {
			// The acknowledgement may still arrive and would precede the next
			// response.
			log::debug!("{} no acknowledgement after status", self.name);
			self.link.desynced = true;
		}
		Ok(String::from_utf8_lossy(&line).trim().to_string())
	}

	/// Discard stale input if an earlier exchange was abandoned.
	fn resync(&mut self) -> Result<(), StageError> {
		if self.link.desynced {
			let name = self.name;
			let discarded = discard_input(self.backend()?)?;
			log::debug!("{name} resynchronised, discarded {discarded} stale bytes");
			self.link.desynced = false;
		}
		Ok(())
	}

	/// Read a single byte, or `None` if the port's read timeout elapsed.
	fn read_byte(&mut self) -> Result<Option<u8>, StageError> {
		let backend = self.backend()?;
		match read_byte(backend) {
			Ok(byte) => Ok(byte),
			Err(e) => {
				self.link.desynced = true;
				Err(e.into())
			}
		}
	}

	/// Read one non-empty line, up to and including the line feed.
	fn read_line(&mut self, deadline: Instant) -> Result<Vec<u8>, StageError> {
		let mut line = Vec::with_capacity(32);
		loop {
			match self.read_byte()? {
				Some(LINE_FEED) => {
					if line.iter().all(u8::is_ascii_whitespace) {
						// Skip blank lines
						line.clear();
						continue;
					}
					line.push(LINE_FEED);
					log::debug!(
						"{} RECV: {}",
						self.name,
						String::from_utf8_lossy(&line).trim_end()
					);
					return Ok(line);
				}
				Some(TERMINATOR) => {
					// The response ended before the line did.
					line.push(TERMINATOR);
					return Err(self.violation(&line));
				}
				Some(byte) => line.push(byte),
				None => {
					if Instant::now() >= deadline {
						return Err(self.timed_out());
					}
				}
			}
		}
	}

	/// Wait for the terminator that follows a response line.
	fn read_terminator(&mut self, deadline: Instant) -> Result<(), StageError> {
		loop {
			match self.read_byte()? {
				Some(TERMINATOR) => return Ok(()),
				Some(CARRIAGE_RETURN | LINE_FEED) => {}
				Some(byte) => return Err(self.violation(&[byte])),
				None => {
					if Instant::now() >= deadline {
						return Err(self.timed_out());
					}
				}
			}
		}
	}

	fn violation(&mut self, bytes: &[u8]) -> StageError {
		self.link.desynced = true;
		log::debug!(
			"{} RECV: {} (malformed)",
			self.name,
			String::from_utf8_lossy(bytes).trim_end()
		);
		ProtocolViolationError::new(bytes).into()
	}

	fn timed_out(&mut self) -> StageError {
		self.link.desynced = true;
		TimeoutError::new(WaitingFor::Response, self.timing.response_timeout).into()
	}
}

/// Interpret a standard response line.
fn parse_response(line: &[u8]) -> Result<String, StageError> {
	let text = String::from_utf8_lossy(line);
	let text = text.trim_end();
	if ERROR_MARKERS.iter().any(|marker| text.starts_with(marker)) {
		Err(DeviceProtocolError::new(text).into())
	} else if let Some(payload) = text.strip_prefix(SUCCESS_MARKER) {
		Ok(payload.trim().to_string())
	} else {
		Err(ProtocolViolationError::new(line).into())
	}
}

/// Read a single byte, treating a timeout as no data.
fn read_byte<B: Backend + ?Sized>(backend: &mut B) -> Result<Option<u8>, io::Error> {
	let mut byte = [0_u8; 1];
	match io::Read::read(backend, &mut byte) {
		Ok(0) => Ok(None),
		Ok(_) => Ok(Some(byte[0])),
		Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
			Ok(None)
		}
		Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
		Err(e) => Err(e),
	}
}

/// Drop everything waiting to be read. Returns how many bytes were read and
/// dropped (bytes cleared from the OS buffer are not counted).
fn discard_input<B: Backend + ?Sized>(backend: &mut B) -> Result<usize, io::Error> {
	backend.clear_input()?;
	let mut discarded = 0;
	while discarded < MAX_DISCARD && read_byte(backend)?.is_some() {
		discarded += 1;
	}
	Ok(discarded)
}
