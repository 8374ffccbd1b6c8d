//! A driver for ASI motorized XY(Z) microscope stages controlled over a
//! serial port.
//!
//! The crate is layered:
//!
//!   * [`transport`] frames commands and parses responses, and makes sure
//!     exchanges never overlap.
//!   * [`stage`] turns moves and parameter changes in physical units into
//!     controller commands.
//!   * [`retry`] absorbs transient link failures.
//!   * [`poll`] keeps cached positions fresh on a background thread.
//!
//! [`Driver`], created through [`OpenOptions`], puts them together:
//!
//! ```rust
//! # use asistage::{Axis, OpenOptions};
//! # fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = OpenOptions::new().open("/dev/ttyUSB0")?;
//! driver.move_absolute_and_wait(Axis::X, 12.5)?;
//! let y = driver.read_position(Axis::Y)?;
//! driver.correct_backlash(Axis::X, 0.02)?;
//! driver.disconnect();
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(missing_debug_implementations)]

pub mod axis;
pub mod backend;
mod driver;
pub mod error;
mod options;
pub mod poll;
pub mod retry;
pub mod stage;
pub mod transport;
pub mod units;

pub use axis::{Axis, AxisState};
pub use driver::Driver;
pub use error::StageError;
pub use options::OpenOptions;
