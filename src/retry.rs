//! Bounded retrying of fallible exchanges.

use crate::error::StageError;

/// The default number of attempts made by [`Retry`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// A policy for retrying operations that fail because of transient link
/// problems, such as electrical noise or a response arriving just after a
/// timeout.
///
/// Retries are immediate, without back-off, and any error is retried,
/// including ones that are unlikely to go away (see
/// [`StageError::is_recoverable`]). When every attempt fails, the error from
/// the last attempt is returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Retry {
    max_attempts: u32,
}

impl Default for Retry {
    fn default() -> Self {
        Retry::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl Retry {
    /// Make at most `max_attempts` attempts. Zero is treated as one.
    pub const fn new(max_attempts: u32) -> Self {
        Retry {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
        }
    }

    /// The maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Call `op` until it succeeds or the attempts run out.
    ///
    /// `what` describes the operation in log messages.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, StageError>
    where
        F: FnMut() -> Result<T, StageError>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("{what} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_attempts => {
                    log::debug!("{what} failed on attempt {attempt}: {e}");
                    attempt += 1;
                }
                Err(e) => {
                    log::warn!("{what} failed after {attempt} attempts: {e}");
                    return Err(e);
                }
            }
        }
    }
}

/// Call `op` up to `max_attempts` times, returning the first success or the
/// last error.
///
/// Shorthand for `Retry::new(max_attempts).run(..)`.
pub fn with_retry<T, F>(op: F, max_attempts: u32) -> Result<T, StageError>
where
    F: FnMut() -> Result<T, StageError>,
{
    Retry::new(max_attempts).run("operation", op)
}
