//! In-memory backends for testing without hardware.
//!
//! A [`Mock`] plays the part of the serial port: every carriage-return
//! terminated command written to it is recorded in a [`Transcript`] and
//! answered either from a queue of scripted replies or by a responder
//! callback. A [`MockStage`] is a responder that simulates an ASI controller
//! well enough to exercise the whole driver.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::Backend;
use crate::axis::Axis;
use crate::transport::{ABORT, TERMINATOR};
use crate::units::{from_device_units, UNIT_SCALE};

/// A callback that produces the device's answer to a command, if any.
pub type Responder = Box<dyn FnMut(&str) -> Option<Vec<u8>> + Send>;

/// A shared record of the commands written to a [`Mock`].
///
/// Cloning the transcript produces another handle to the same record, so a
/// test can keep one after moving the [`Mock`] into a driver.
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<TranscriptInner>>);

#[derive(Debug, Default)]
struct TranscriptInner {
	commands: Vec<String>,
	/// Set if a command arrived while the previous response was still unread.
	interleaved: bool,
}

impl Transcript {
	fn lock(&self) -> MutexGuard<'_, TranscriptInner> {
		self.0.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// All commands received so far, without their terminators.
	pub fn commands(&self) -> Vec<String> {
		self.lock().commands.clone()
	}

	/// The number of commands received so far.
	pub fn len(&self) -> usize {
		self.lock().commands.len()
	}

	/// Whether no commands have been received.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// The number of received commands that start with `prefix`.
	pub fn count_starting_with(&self, prefix: &str) -> usize {
		self.lock()
			.commands
			.iter()
			.filter(|command| command.starts_with(prefix))
			.count()
	}

	/// Forget all commands received so far.
	pub fn clear(&self) {
		self.lock().commands.clear();
	}

	/// Whether a command was ever written while the response to a previous
	/// command was still waiting to be read.
	pub fn interleaved(&self) -> bool {
		self.lock().interleaved
	}
}

/// A mock backend for use in testing.
///
/// It has the following features:
///   * It records every command written to it (see [`Transcript`]). A
///     backspace byte discards a partially written command, as on the device.
///   * Each command is answered by the next scripted reply, if any, otherwise
///     by the responder, if any.
///   * Data can also be appended for reading directly.
///   * Reading with no data available fails immediately with a `TimedOut`
///     error, which is what a real port does after its read timeout.
///   * Specific errors can be inserted for calls to `read`, `write` and
///     `set_read_timeout`.
pub struct Mock {
	/// The buffer data is read from
	buffer: VecDeque<u8>,
	/// A partially written command.
	pending: Vec<u8>,
	/// Replies to hand out, one per command, before consulting the responder.
	replies: VecDeque<Vec<u8>>,
	responder: Option<Responder>,
	transcript: Transcript,
	/// The error to surface on the next read, if any. It is only surfaced once.
	read_error: Option<io::Error>,
	/// The error to surface on the next write, if any. It is only surfaced once.
	write_error: Option<io::Error>,
	/// The error to surface on the next attempt to set the read timeout.
	timeout_error: Option<io::Error>,
	/// The read timeout, which is ignored.
	ignored_read_timeout: Option<Duration>,
}

impl std::fmt::Debug for Mock {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Mock")
			.field("buffered", &self.buffer.len())
			.field("scripted_replies", &self.replies.len())
			.field("has_responder", &self.responder.is_some())
			.finish_non_exhaustive()
	}
}

impl Mock {
	/// Create a new Mock backend that only answers with scripted replies.
	pub fn new() -> Self {
		Mock {
			buffer: VecDeque::new(),
			pending: Vec::new(),
			replies: VecDeque::new(),
			responder: None,
			transcript: Transcript::default(),
			read_error: None,
			write_error: None,
			timeout_error: None,
			ignored_read_timeout: Some(Duration::ZERO),
		}
	}

	/// Create a new Mock backend that answers commands with `responder`.
	///
	/// The responder receives each command without its terminator and returns
	/// the raw bytes to make available for reading, or `None` to stay silent.
	pub fn with_responder<F>(responder: F) -> Self
	where
		F: FnMut(&str) -> Option<Vec<u8>> + Send + 'static,
	{
		let mut mock = Mock::new();
		mock.responder = Some(Box::new(responder));
		mock
	}

	/// Append data to the read buffer immediately.
	///
	/// The data is not validated in any way.
	pub fn append_data<T: AsRef<[u8]>>(&mut self, bytes: T) {
		self.buffer.extend(bytes.as_ref());
	}

	/// Queue a reply to be made readable when the next command is written.
	pub fn push_reply<T: AsRef<[u8]>>(&mut self, bytes: T) {
		self.replies.push_back(bytes.as_ref().to_vec());
	}

	/// Clear the read buffer and any scripted replies.
	pub fn clear_buffer(&mut self) {
		self.buffer.clear();
		self.replies.clear();
	}

	/// Whether the mock has any data available or not
	pub fn is_empty(&self) -> bool {
		self.buffer.is_empty()
	}

	/// Get a handle to the record of commands written to this mock.
	pub fn transcript(&self) -> Transcript {
		self.transcript.clone()
	}

	/// Set the error for the next `read`, if any.
	pub fn read_error(&mut self, err: Option<io::Error>) {
		self.read_error = err;
	}

	/// Set the error for the next `write`, if any.
	pub fn write_error(&mut self, err: Option<io::Error>) {
		self.write_error = err;
	}

	/// Set the error for the next `set_read_timeout`, if any.
	pub fn timeout_error(&mut self, err: Option<io::Error>) {
		self.timeout_error = err;
	}

	/// Record the pending command and queue up its answer.
	fn complete_command(&mut self) {
		let command = String::from_utf8_lossy(&self.pending).into_owned();
		self.pending.clear();
		{
			let mut transcript = self.transcript.lock();
			if !self.buffer.is_empty() {
				transcript.interleaved = true;
			}
			transcript.commands.push(command.clone());
		}
		let reply = match self.replies.pop_front() {
			Some(reply) => Some(reply),
			None => self
				.responder
				.as_mut()
				.and_then(|responder| responder(&command)),
		};
		if let Some(reply) = reply {
			self.buffer.extend(reply);
		}
	}
}

impl Default for Mock {
	fn default() -> Self {
		Self::new()
	}
}

impl Backend for Mock {
	fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), io::Error> {
		if let Some(err) = self.timeout_error.take() {
			return Err(err);
		}
		self.ignored_read_timeout = timeout;
		Ok(())
	}

	fn read_timeout(&self) -> Result<Option<Duration>, io::Error> {
		Ok(self.ignored_read_timeout)
	}

	fn clear_input(&mut self) -> Result<(), io::Error> {
		self.buffer.clear();
		Ok(())
	}

	fn name(&self) -> Option<String> {
		Some(format!("<mock 0x{:x}>", self as *const Mock as usize))
	}
}

impl io::Read for Mock {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		if let Some(err) = self.read_error.take() {
			Err(err)
		} else if self.buffer.is_empty() {
			// For a real device, having no data ready would result in a wait
			// and then eventual timeout error. However, as our data is in
			// memory that does not happen here. So simulate that behaviour by
			// returning a timeout error immediately.
			Err(io::Error::new(
				io::ErrorKind::TimedOut,
				"Simulated timeout error",
			))
		} else {
			let n = buf.len().min(self.buffer.len());
			for (slot, byte) in buf.iter_mut().zip(self.buffer.drain(..n)) {
				*slot = byte;
			}
			Ok(n)
		}
	}
}

impl io::Write for Mock {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if let Some(err) = self.write_error.take() {
			return Err(err);
		}
		for &byte in buf {
			match byte {
				ABORT => self.pending.clear(),
				b'\r' => self.complete_command(),
				b'\n' => {}
				_ => self.pending.push(byte),
			}
		}
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

/// A simulated ASI stage controller.
///
/// Clones share the same simulated device, so a test can keep a handle to
/// inspect or script the device after handing its [`backend`](Self::backend)
/// to a driver.
///
/// Moves complete instantly, but the controller reports itself busy for a
/// configurable number of status queries after each one. Like the real
/// firmware, it misbehaves when given a target whose last digit is 3; the
/// simulation rejects such targets with `:AERR0`.
#[derive(Debug, Clone)]
pub struct MockStage {
	state: Arc<Mutex<SimState>>,
}

#[derive(Debug)]
struct SimState {
	address: String,
	/// Positions in device units (1/10 µm).
	positions: [i64; 3],
	busy_polls: u32,
	busy_polls_per_move: u32,
	speed: [f64; 3],
	acceleration: [f64; 3],
	backlash: [f64; 3],
	lower_limits: [f64; 3],
	upper_limits: [f64; 3],
	reject_next: Option<String>,
	silence_next: u32,
	terminator_next: Option<u8>,
}

/// An axis argument of a command.
enum Arg<'a> {
	/// `X`
	Bare(Axis),
	/// `X?`
	Query(Axis),
	/// `X=<value>`
	Set(Axis, &'a str),
}

impl MockStage {
	/// Create a simulated stage at the origin using the default `2H` card address.
	pub fn new() -> Self {
		MockStage::with_address("2H")
	}

	/// Create a simulated stage that only answers commands prefixed with `address`.
	pub fn with_address(address: &str) -> Self {
		MockStage {
			state: Arc::new(Mutex::new(SimState {
				address: address.to_string(),
				positions: [0; 3],
				busy_polls: 0,
				busy_polls_per_move: 0,
				speed: [7.0; 3],
				acceleration: [70.0; 3],
				backlash: [0.04; 3],
				lower_limits: [-110.0; 3],
				upper_limits: [110.0; 3],
				reject_next: None,
				silence_next: 0,
				terminator_next: None,
			})),
		}
	}

	fn lock(&self) -> MutexGuard<'_, SimState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Create a [`Mock`] backend connected to this simulated stage.
	pub fn backend(&self) -> Mock {
		let stage = self.clone();
		Mock::with_responder(move |command| stage.lock().respond(command))
	}

	/// Place the stage at `mm` on `axis`.
	pub fn set_position(&self, axis: Axis, mm: f64) {
		self.lock().positions[axis.index()] = (mm * UNIT_SCALE).round() as i64;
	}

	/// The simulated position of `axis`, in millimetres.
	pub fn position(&self, axis: Axis) -> f64 {
		from_device_units(self.units(axis))
	}

	/// The simulated position of `axis`, in device units.
	pub fn units(&self, axis: Axis) -> i64 {
		self.lock().positions[axis.index()]
	}

	/// Report busy for the next `n` status queries after every move.
	pub fn set_busy_polls_per_move(&self, n: u32) {
		self.lock().busy_polls_per_move = n;
	}

	/// Report busy for the next `n` status queries.
	pub fn set_busy_polls(&self, n: u32) {
		self.lock().busy_polls = n;
	}

	/// Whether the next status query will report busy.
	pub fn is_busy(&self) -> bool {
		self.lock().busy_polls > 0
	}

	/// Answer the next command with the error `response` instead of executing it.
	pub fn reject_next(&self, response: &str) {
		self.lock().reject_next = Some(response.to_string());
	}

	/// Ignore the next `n` commands without answering them.
	pub fn silence_next(&self, n: u32) {
		self.lock().silence_next = n;
	}

	/// End the next response with `byte` instead of the end-of-text terminator.
	pub fn corrupt_next_terminator(&self, byte: u8) {
		self.lock().terminator_next = Some(byte);
	}

	/// The last speed set on `axis`, in mm/s.
	pub fn speed(&self, axis: Axis) -> f64 {
		self.lock().speed[axis.index()]
	}

	/// The last acceleration set on `axis`, in ms.
	pub fn acceleration(&self, axis: Axis) -> f64 {
		self.lock().acceleration[axis.index()]
	}

	/// The last backlash compensation set on `axis`, in mm.
	pub fn backlash(&self, axis: Axis) -> f64 {
		self.lock().backlash[axis.index()]
	}

	/// The last (lower, upper) soft limits set on `axis`, in mm.
	pub fn limits(&self, axis: Axis) -> (f64, f64) {
		let state = self.lock();
		(
			state.lower_limits[axis.index()],
			state.upper_limits[axis.index()],
		)
	}
}

impl Default for MockStage {
	fn default() -> Self {
		Self::new()
	}
}

impl SimState {
	fn respond(&mut self, command: &str) -> Option<Vec<u8>> {
		if self.silence_next > 0 {
			self.silence_next -= 1;
			return None;
		}
		// Commands for other cards are not ours to answer.
		let body = command.trim().strip_prefix(self.address.as_str())?;
		if let Some(response) = self.reject_next.take() {
			return Some(self.reply(&response));
		}
		let (word, rest) = body.split_once(' ').unwrap_or((body, ""));
		let normalized = rest.replace("= ", "=");
		let Some(args) = parse_args(&normalized) else {
			return Some(self.reply(":N-2"));
		};

		let response = match word {
			"/" => return Some(self.status()),
			"W" => self.where_is(&args),
			"M" => self.move_to(&args, false),
			"R" => self.move_to(&args, true),
			"HALT" => {
				self.busy_polls = 0;
				":A".to_string()
			}
			"HOME" => {
				for arg in &args {
					if let Arg::Bare(axis) = arg {
						self.positions[axis.index()] = 0;
					}
				}
				self.busy_polls = self.busy_polls_per_move;
				":A".to_string()
			}
			"SPEED" if args.iter().all(|arg| matches!(arg, Arg::Query(_))) => {
				let mut response = ":A".to_string();
				for arg in &args {
					if let Arg::Query(axis) = arg {
						response.push_str(&format!(
							" {}={:.6}",
							axis,
							self.speed[axis.index()]
						));
					}
				}
				response
			}
			"SPEED" => store(&mut self.speed, &args),
			"AC" => store(&mut self.acceleration, &args),
			"B" => store(&mut self.backlash, &args),
			"SL" => store(&mut self.lower_limits, &args),
			"SU" => store(&mut self.upper_limits, &args),
			_ => ":N-1".to_string(),
		};
		Some(self.reply(&response))
	}

	/// Format a standard response: a line followed by the terminator.
	fn reply(&mut self, line: &str) -> Vec<u8> {
		let mut bytes = format!("{line}\r\n").into_bytes();
		bytes.push(self.terminator_next.take().unwrap_or(TERMINATOR));
		bytes
	}

	/// The status response: `N` or `B` on a line followed by an acknowledgement byte.
	fn status(&mut self) -> Vec<u8> {
		let token = if self.busy_polls > 0 {
			self.busy_polls -= 1;
			'B'
		} else {
			'N'
		};
		let mut bytes = format!("{token}\r\n").into_bytes();
		bytes.push(self.terminator_next.take().unwrap_or(TERMINATOR));
		bytes
	}

	fn where_is(&self, args: &[Arg<'_>]) -> String {
		let mut response = ":A".to_string();
		for arg in args {
			match arg {
				Arg::Bare(axis) => {
					response.push_str(&format!(" {}", self.positions[axis.index()]));
				}
				_ => return ":N-2".to_string(),
			}
		}
		response
	}

	fn move_to(&mut self, args: &[Arg<'_>], relative: bool) -> String {
		let mut moves = Vec::with_capacity(args.len());
		for arg in args {
			let Arg::Set(axis, value) = arg else {
				return ":N-2".to_string();
			};
			let Ok(value) = value.parse::<i64>() else {
				return ":N-2".to_string();
			};
			if value.unsigned_abs() % 10 == 3 {
				return ":AERR0".to_string();
			}
			moves.push((*axis, value));
		}
		for (axis, value) in moves {
			if relative {
				self.positions[axis.index()] += value;
			} else {
				self.positions[axis.index()] = value;
			}
		}
		self.busy_polls = self.busy_polls_per_move;
		":A".to_string()
	}
}

/// Store each `X=<value>` argument into `table`.
fn store(table: &mut [f64; 3], args: &[Arg<'_>]) -> String {
	for arg in args {
		let Arg::Set(axis, value) = arg else {
			return ":N-2".to_string();
		};
		let Ok(value) = value.parse::<f64>() else {
			return ":N-2".to_string();
		};
		table[axis.index()] = value;
	}
	":A".to_string()
}

fn parse_args(rest: &str) -> Option<Vec<Arg<'_>>> {
	rest.split_whitespace()
		.map(|token| {
			let mut chars = token.chars();
			let axis = Axis::from_letter(chars.next()?)?;
			let remainder = chars.as_str();
			if remainder.is_empty() {
				Some(Arg::Bare(axis))
			} else if remainder == "?" {
				Some(Arg::Query(axis))
			} else {
				remainder
					.strip_prefix('=')
					.map(|value| Arg::Set(axis, value))
			}
		})
		.collect()
}
