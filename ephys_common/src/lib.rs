#[macro_use]
extern crate lazy_static;

pub mod measurement;
pub mod time;
pub mod value;

use std::error::Error;
use std::fmt;

pub use crate::measurement::homogeneous_base_unit;
pub use crate::measurement::ConversionRegistry;
pub use crate::measurement::Measurement;
pub use crate::measurement::MeasurementError;
pub use crate::measurement::CONVERSIONS;
pub use crate::measurement::HERTZ;

pub use crate::value::Value;

#[derive(Debug)]
pub struct EphysError(pub String);

impl fmt::Display for EphysError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Acquisition error: {}", self.0)
    }
}

impl Error for EphysError {}
