//! Motion and parameter commands for a single controller card.
//!
//! A [`Stage`] turns requests in physical units (mm, mm/s, ms) into the
//! controller's ASCII commands, sends them through a [`Transport`], and
//! caches what it learns about each axis. It does not retry; see
//! [`Driver`](crate::Driver) for the retrying facade.
//!
//! The controller never announces that a move has finished. Completion is
//! found by polling the status command until it reports [`Motion::Idle`],
//! which is what the `*_and_wait` methods do.

#[cfg(test)]
mod test;

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use crate::{
    axis::{Axis, AxisState},
    backend::Backend,
    error::{InvalidArgumentError, ProtocolViolationError, StageError, TimeoutError, WaitingFor},
    transport::{Session, Transport},
    units::{format_mm, format_value, from_device_units, to_device_units},
};

/// The default card address prefix of an XY stage.
pub const DEFAULT_ADDRESS: &str = "2H";
/// The default interval between status queries while waiting for a move.
pub const DEFAULT_BUSY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Whether the controller is executing a move.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Motion {
    /// No motor is moving.
    Idle,
    /// At least one motor is moving.
    Busy,
}

impl Motion {
    /// Whether this is [`Motion::Busy`].
    pub fn is_busy(self) -> bool {
        self == Motion::Busy
    }
}

/// Generate the per-axis parameter setters.
///
/// Each setter sends a single command with one `<axis>=<value>` argument per
/// entry, and on success records the values in the axis cache.
macro_rules! parameter_setters {
    ($($(#[$meta:meta])* $name:ident => $word:literal, $format:expr;)+) => {
        paste::paste! {
            $(
                $(#[$meta])*
                pub fn [<set_ $name>](&self, values: &[(Axis, f64)]) -> Result<(), StageError> {
                    if values.is_empty() {
                        return Ok(());
                    }
                    let args = axis_args(values.iter().copied(), $format)?;
                    self.transport.ask(&self.command(&format!("{} {}", $word, args)))?;
                    let mut axes = self.axes();
                    for &(axis, value) in values {
                        axes[axis.index()].$name = Some(value);
                    }
                    Ok(())
                }
            )+
        }
    };
}

/// A controller card driven through a [`Transport`].
///
/// All methods take `&self`; the stage can be shared between threads with an
/// `Arc`. Each method locks the transport only for the exchanges it makes, so
/// calls from different threads are serialised per exchange.
pub struct Stage<B> {
    transport: Transport<B>,
    address: String,
    busy_poll_interval: Duration,
    axes: Mutex<[AxisState; 3]>,
}

impl<B: Backend> std::fmt::Debug for Stage<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("transport", &self.transport)
            .field("address", &self.address)
            .field("busy_poll_interval", &self.busy_poll_interval)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Stage<B> {
    /// Drive the card at `address` (e.g. `"2H"`) over `transport`.
    ///
    /// While waiting for moves to finish, the status is queried every
    /// `busy_poll_interval`.
    pub fn new<A: Into<String>>(
        transport: Transport<B>,
        address: A,
        busy_poll_interval: Duration,
    ) -> Self {
        Stage {
            transport,
            address: address.into(),
            busy_poll_interval,
            axes: Mutex::new([AxisState::default(); 3]),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Transport<B> {
        &self.transport
    }

    /// The card address prefixed to every command.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Everything cached about `axis`.
    pub fn axis_state(&self, axis: Axis) -> AxisState {
        self.axes()[axis.index()]
    }

    /// Read the position of `axis`, in mm.
    pub fn read_position(&self, axis: Axis) -> Result<f64, StageError> {
        let units = self.read_units(&mut self.transport.lock()?, axis)?;
        Ok(from_device_units(units))
    }

    /// Query whether the controller is moving.
    ///
    /// The result is never cached.
    pub fn status(&self) -> Result<Motion, StageError> {
        self.status_in(&mut self.transport.lock()?)
    }

    /// Whether the controller is moving. See [`status`](Self::status).
    pub fn is_busy(&self) -> Result<bool, StageError> {
        Ok(self.status()?.is_busy())
    }

    /// Whether `axis` is at `target` mm, compared in device units.
    ///
    /// The position is read from the controller, not taken from the cache.
    pub fn is_at(&self, axis: Axis, target: f64) -> Result<bool, StageError> {
        let target = to_device_units(target)?;
        Ok(self.read_units(&mut self.transport.lock()?, axis)? == target)
    }

    /// Start moving `axis` to `target` mm, without waiting.
    pub fn move_absolute(&self, axis: Axis, target: f64) -> Result<(), StageError> {
        let units = to_device_units(target)?;
        self.transport.ask(&self.command(&format!("M {axis}= {units}")))?;
        self.axes()[axis.index()].target = Some(target);
        Ok(())
    }

    /// Start moving `axis` by `delta` mm, without waiting.
    ///
    /// Nothing is sent if `delta` rounds to zero device units.
    pub fn move_relative(&self, axis: Axis, delta: f64) -> Result<(), StageError> {
        self.move_relative_in(&mut self.transport.lock()?, axis, delta)
    }

    /// Poll the status until the controller is idle.
    ///
    /// The transport is only locked for each individual status query, so
    /// other threads may use it in between.
    pub fn wait_until_idle(&self, timeout: Duration) -> Result<(), StageError> {
        self.poll_until_idle(timeout, || self.status())
    }

    /// Move `axis` to `target` mm and wait for the move to finish.
    ///
    /// If the axis is already at `target` (compared in device units) no move
    /// is issued and the method returns immediately.
    pub fn move_absolute_and_wait(
        &self,
        axis: Axis,
        target: f64,
        timeout: Duration,
    ) -> Result<(), StageError> {
        if self.is_at(axis, target)? {
            log::debug!("{axis} already at {target} mm");
            return Ok(());
        }
        self.move_absolute(axis, target)?;
        self.wait_until_idle(timeout)
    }

    /// Move `axis` by `delta` mm and wait for the move to finish.
    ///
    /// Returns immediately if `delta` rounds to zero device units.
    pub fn move_relative_and_wait(
        &self,
        axis: Axis,
        delta: f64,
        timeout: Duration,
    ) -> Result<(), StageError> {
        if to_device_units(delta)? == 0 {
            return Ok(());
        }
        self.move_relative(axis, delta)?;
        self.wait_until_idle(timeout)
    }

    /// Stop all motion immediately.
    ///
    /// Safe to call when nothing is moving. The axes stop wherever they are,
    /// so cached targets are cleared; read the position to find out where.
    pub fn halt(&self) -> Result<(), StageError> {
        self.transport.ask(&self.command("HALT"))?;
        for state in self.axes().iter_mut() {
            state.target = None;
        }
        Ok(())
    }

    /// Move `axes` to their home positions, without waiting.
    pub fn home(&self, axes: &[Axis]) -> Result<(), StageError> {
        if axes.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = axes.iter().map(Axis::to_string).collect();
        self.transport.ask(&self.command(&format!("HOME {}", args.join(" "))))?;
        let mut cache = self.axes();
        for axis in axes {
            let state = &mut cache[axis.index()];
            state.position = None;
            state.target = None;
        }
        Ok(())
    }

    parameter_setters! {
        /// Set the maximum speed of each axis, in mm/s.
        speed => "SPEED", format_value;
        /// Set the acceleration ramp time of each axis, in ms.
        acceleration => "AC", format_value;
        /// Set the controller's own backlash compensation distance of each
        /// axis, in mm. Zero disables it.
        backlash => "B", format_mm;
    }

    /// Set the (lower, upper) software travel limits of each axis, in mm.
    pub fn set_soft_limits(&self, limits: &[(Axis, f64, f64)]) -> Result<(), StageError> {
        if limits.is_empty() {
            return Ok(());
        }
        let lower = axis_args(limits.iter().map(|&(axis, lower, _)| (axis, lower)), format_mm)?;
        let upper = axis_args(limits.iter().map(|&(axis, _, upper)| (axis, upper)), format_mm)?;
        let mut session = self.transport.lock()?;
        session.ask(&self.command(&format!("SL {lower}")))?;
        session.ask(&self.command(&format!("SU {upper}")))?;
        Ok(())
    }

    /// Read the maximum speed of each of `axes`, in mm/s.
    pub fn query_speed(&self, axes: &[Axis]) -> Result<Vec<(Axis, f64)>, StageError> {
        if axes.is_empty() {
            return Ok(Vec::new());
        }
        let args: Vec<String> = axes.iter().map(|axis| format!("{axis}?")).collect();
        let payload = self
            .transport
            .ask(&self.command(&format!("SPEED {}", args.join(" "))))?;

        let mut speeds = Vec::with_capacity(axes.len());
        for token in payload.split_whitespace() {
            let parsed = token.split_once('=').and_then(|(letter, value)| {
                let mut chars = letter.chars();
                let axis = Axis::from_letter(chars.next()?)?;
                if chars.next().is_some() {
                    return None;
                }
                Some((axis, value.parse::<f64>().ok()?))
            });
            match parsed {
                Some(pair) => speeds.push(pair),
                None => return Err(ProtocolViolationError::new(&payload).into()),
            }
        }
        let mut cache = self.axes();
        for &(axis, speed) in &speeds {
            cache[axis.index()].speed = Some(speed);
        }
        Ok(speeds)
    }

    /// Take up mechanical backlash on `axis` by moving `-amount` mm and then
    /// `+amount` mm, waiting for each move to finish.
    ///
    /// The transport stays locked for the whole manoeuvre, so no other
    /// exchange can come between the moves and the status queries. `timeout`
    /// applies to each wait separately.
    pub fn correct_backlash(
        &self,
        axis: Axis,
        amount: f64,
        timeout: Duration,
    ) -> Result<(), StageError> {
        if to_device_units(amount)? == 0 {
            return Ok(());
        }
        let mut session = self.transport.lock()?;
        for delta in [-amount, amount] {
            self.move_relative_in(&mut session, axis, delta)?;
            self.poll_until_idle(timeout, || self.status_in(&mut session))?;
        }
        Ok(())
    }

    fn axes(&self) -> MutexGuard<'_, [AxisState; 3]> {
        self.axes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command(&self, body: &str) -> String {
        format!("{}{}", self.address, body)
    }

    fn read_units(&self, session: &mut Session<'_, B>, axis: Axis) -> Result<i64, StageError> {
        let payload = session.ask(&self.command(&format!("W {axis}")))?;
        let units = payload
            .split_whitespace()
            .next()
            .and_then(|token| token.parse::<f64>().ok())
            .ok_or_else(|| ProtocolViolationError::new(&payload))?
            .round() as i64;
        self.axes()[axis.index()].position = Some(from_device_units(units));
        Ok(units)
    }

    fn status_in(&self, session: &mut Session<'_, B>) -> Result<Motion, StageError> {
        let line = session.ask_status(&self.command("/"))?;
        match line.chars().next() {
            Some('N') => Ok(Motion::Idle),
            Some('B') => Ok(Motion::Busy),
            _ => Err(ProtocolViolationError::new(line).into()),
        }
    }

    fn move_relative_in(
        &self,
        session: &mut Session<'_, B>,
        axis: Axis,
        delta: f64,
    ) -> Result<(), StageError> {
        let units = to_device_units(delta)?;
        if units == 0 {
            return Ok(());
        }
        session.ask(&self.command(&format!("R {axis}={units}")))?;
        let mut cache = self.axes();
        let state = &mut cache[axis.index()];
        state.target = state.target.or(state.position).map(|from| from + delta);
        Ok(())
    }

    fn poll_until_idle<F>(&self, timeout: Duration, mut status: F) -> Result<(), StageError>
    where
        F: FnMut() -> Result<Motion, StageError>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if status()? == Motion::Idle {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TimeoutError::new(WaitingFor::Idle, timeout).into());
            }
            thread::sleep(self.busy_poll_interval);
        }
    }
}

/// Format `(axis, value)` pairs into `X=1 Y=2` form.
fn axis_args<I, F>(pairs: I, format: F) -> Result<String, InvalidArgumentError>
where
    I: IntoIterator<Item = (Axis, f64)>,
    F: Fn(f64) -> Result<String, InvalidArgumentError>,
{
    let args = pairs
        .into_iter()
        .map(|(axis, value)| Ok(format!("{axis}={}", format(value)?)))
        .collect::<Result<Vec<_>, InvalidArgumentError>>()?;
    Ok(args.join(" "))
}
