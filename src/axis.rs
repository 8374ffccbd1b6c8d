//! Stage axes and the state cached for each of them.

use std::fmt;

/// An axis of the stage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Axis {
    /// The X axis.
    X,
    /// The Y axis.
    Y,
    /// The focus axis, if the stage has one.
    Z,
}

impl Axis {
    /// All axes, in order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// The letter the device uses for this axis.
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }

    /// Get the axis for a letter, ignoring case.
    pub fn from_letter(letter: char) -> Option<Axis> {
        match letter.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A snapshot of what the driver knows about an axis.
///
/// Values are `None` until the driver has read or set them. `position` is the
/// result of the last successful position query, which need not be where the
/// stage is right now if it is moving.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct AxisState {
    /// The last position read from the device, in mm.
    pub position: Option<f64>,
    /// The last commanded target, in mm. Cleared by a halt.
    pub target: Option<f64>,
    /// The last speed set, in mm/s.
    pub speed: Option<f64>,
    /// The last acceleration set, in ms.
    pub acceleration: Option<f64>,
    /// The last backlash compensation set, in mm.
    pub backlash: Option<f64>,
}
