//! The connected stage as seen by an application.

use std::{sync::Arc, time::Duration};

use crate::{
    axis::{Axis, AxisState},
    backend::Backend,
    error::StageError,
    poll::{ObserverFlag, PollConfig, Poller, Suppression},
    retry::Retry,
    stage::Stage,
    units::to_device_units,
};

/// A connected stage with retries and background position polling.
///
/// Created by [`OpenOptions`](crate::OpenOptions). Foreground operations are
/// wrapped in the configured [`Retry`] policy; position polling (if enabled)
/// runs on a background thread until the driver is disconnected or dropped.
///
/// ## Retries and motion
///
/// Retrying is indiscriminate. If the response to a move command is lost, the
/// controller may have executed it anyway and the retry will send it again.
/// That is harmless for absolute moves, but a retried relative move can move
/// the stage twice. Use [`Driver::stage`] to reach the unretried operations
/// when that matters.
pub struct Driver<B: Backend + Send + 'static> {
    stage: Arc<Stage<B>>,
    retry: Retry,
    observer: ObserverFlag,
    poller: Option<Poller>,
    move_timeout: Duration,
}

impl<B: Backend + Send + 'static> std::fmt::Debug for Driver<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("stage", &self.stage)
            .field("retry", &self.retry)
            .field("observer", &self.observer)
            .field("poller", &self.poller)
            .field("move_timeout", &self.move_timeout)
            .finish()
    }
}

impl<B: Backend + Send + 'static> Driver<B> {
    /// Wrap `stage`, starting a poller with `poll` if it is `Some`.
    pub(crate) fn new(
        stage: Stage<B>,
        retry: Retry,
        poll: Option<PollConfig>,
        move_timeout: Duration,
    ) -> Result<Self, StageError> {
        let stage = Arc::new(stage);
        let observer = ObserverFlag::new();
        let poller = match poll {
            Some(config) => Some(Poller::spawn(
                Arc::clone(&stage),
                retry,
                observer.clone(),
                config,
            )?),
            None => None,
        };
        log::info!("{} connected", stage.transport().name());
        Ok(Driver {
            stage,
            retry,
            observer,
            poller,
            move_timeout,
        })
    }

    /// The underlying stage, whose operations are not retried.
    pub fn stage(&self) -> &Stage<B> {
        &self.stage
    }

    /// The retry policy applied to foreground operations.
    pub fn retry(&self) -> Retry {
        self.retry
    }

    /// The timeout used by the `*_and_wait` methods.
    pub fn move_timeout(&self) -> Duration {
        self.move_timeout
    }

    /// The flag that throttles background polling.
    pub fn observer(&self) -> &ObserverFlag {
        &self.observer
    }

    /// Whether background polling is running.
    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(Poller::is_running)
    }

    /// Throttle background polling until the returned guard is dropped.
    ///
    /// Use this around a sequence of foreground moves (a scan, say) so the
    /// poller does not compete with it for the transport.
    pub fn suppress_polling(&self) -> Suppression {
        self.observer.suppress()
    }

    /// The last known position of `axis`, in mm, without querying the
    /// controller.
    ///
    /// `None` until the position has been read, by the poller or otherwise.
    pub fn position(&self, axis: Axis) -> Option<f64> {
        self.stage.axis_state(axis).position
    }

    /// Everything cached about `axis`.
    pub fn axis_state(&self, axis: Axis) -> AxisState {
        self.stage.axis_state(axis)
    }

    /// Read the position of `axis`, in mm.
    pub fn read_position(&self, axis: Axis) -> Result<f64, StageError> {
        self.retry.run(&format!("reading {axis} position"), || self.stage.read_position(axis))
    }

    /// Query whether the controller is moving.
    pub fn is_busy(&self) -> Result<bool, StageError> {
        self.retry.run("querying status", || self.stage.is_busy())
    }

    /// Start moving `axis` to `target` mm.
    pub fn move_absolute(&self, axis: Axis, target: f64) -> Result<(), StageError> {
        self.retry.run(&format!("moving {axis} to {target}"), || {
            self.stage.move_absolute(axis, target)
        })
    }

    /// Start moving `axis` by `delta` mm. See the [retry caveat](Driver#retries-and-motion).
    pub fn move_relative(&self, axis: Axis, delta: f64) -> Result<(), StageError> {
        self.retry.run(&format!("moving {axis} by {delta}"), || {
            self.stage.move_relative(axis, delta)
        })
    }

    /// Move `axis` to `target` mm and wait for the move to finish, within the
    /// driver's move timeout.
    ///
    /// Nothing is moved if the axis is already there. The position check and
    /// the move command are retried; the wait is not, so a move that never
    /// finishes fails after one move timeout.
    pub fn move_absolute_and_wait(&self, axis: Axis, target: f64) -> Result<(), StageError> {
        let mut moved = false;
        self.retry.run(&format!("moving {axis} to {target}"), || {
            if self.stage.is_at(axis, target)? {
                return Ok(());
            }
            moved = true;
            self.stage.move_absolute(axis, target)
        })?;
        if moved {
            self.stage.wait_until_idle(self.move_timeout)?;
        }
        Ok(())
    }

    /// Move `axis` by `delta` mm and wait for the move to finish, within the
    /// driver's move timeout.
    ///
    /// Only the move command is retried; timing out while waiting is returned
    /// as is, since the move has already been issued.
    pub fn move_relative_and_wait(&self, axis: Axis, delta: f64) -> Result<(), StageError> {
        if to_device_units(delta)? == 0 {
            return Ok(());
        }
        self.move_relative(axis, delta)?;
        self.stage.wait_until_idle(self.move_timeout)
    }

    /// Wait for the controller to be idle, within the driver's move timeout.
    pub fn wait_until_idle(&self) -> Result<(), StageError> {
        self.stage.wait_until_idle(self.move_timeout)
    }

    /// Stop all motion immediately.
    pub fn halt(&self) -> Result<(), StageError> {
        self.retry.run("halting", || self.stage.halt())
    }

    /// Move `axes` to their home positions.
    pub fn home(&self, axes: &[Axis]) -> Result<(), StageError> {
        self.retry.run("homing", || self.stage.home(axes))
    }

    /// Set the maximum speed of each axis, in mm/s.
    pub fn set_speed(&self, values: &[(Axis, f64)]) -> Result<(), StageError> {
        self.retry.run("setting speed", || self.stage.set_speed(values))
    }

    /// Set the acceleration ramp time of each axis, in ms.
    pub fn set_acceleration(&self, values: &[(Axis, f64)]) -> Result<(), StageError> {
        self.retry.run("setting acceleration", || self.stage.set_acceleration(values))
    }

    /// Set the controller's backlash compensation of each axis, in mm.
    pub fn set_backlash(&self, values: &[(Axis, f64)]) -> Result<(), StageError> {
        self.retry.run("setting backlash", || self.stage.set_backlash(values))
    }

    /// Set the (lower, upper) software travel limits of each axis, in mm.
    pub fn set_soft_limits(&self, limits: &[(Axis, f64, f64)]) -> Result<(), StageError> {
        self.retry.run("setting soft limits", || self.stage.set_soft_limits(limits))
    }

    /// Read the maximum speed of each of `axes`, in mm/s.
    pub fn query_speed(&self, axes: &[Axis]) -> Result<Vec<(Axis, f64)>, StageError> {
        self.retry.run("querying speed", || self.stage.query_speed(axes))
    }

    /// Take up backlash on `axis` by moving `-amount` then `+amount` mm.
    ///
    /// Not retried: a retry after a partial manoeuvre would leave the axis
    /// offset. Background polling cannot interleave with it.
    pub fn correct_backlash(&self, axis: Axis, amount: f64) -> Result<(), StageError> {
        self.stage.correct_backlash(axis, amount, self.move_timeout)
    }

    /// Stop polling and close the port.
    pub fn disconnect(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }
        let transport = self.stage.transport();
        if !transport.is_closed() {
            transport.close();
            log::info!("{} disconnected", transport.name());
        }
    }
}

impl<B: Backend + Send + 'static> Drop for Driver<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
