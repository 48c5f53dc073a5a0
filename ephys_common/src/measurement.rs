/*
BSD 2-Clause License

Copyright (c) 2022, Diagnosis and Control of Clouds Laboratory
All rights reserved.

Redistribution and use in source and binary forms, with or without
modification, are permitted provided that the following conditions are met:

1. Redistributions of source code must retain the above copyright notice, this
   list of conditions and the following disclaimer.

2. Redistributions in binary form must reproduce the above copyright notice,
   this list of conditions and the following disclaimer in the documentation
   and/or other materials provided with the distribution.

THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

*/

//! Typed physical quantities and the process-wide unit conversion registry.
//!
//! A `Measurement` is a quantity with a decimal exponent and a base unit, e.g.
//! `10 x 10^-3 V`. Everything that flows through the acquisition pipeline is a
//! sequence of these.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Base unit of all sampling rates.
pub const HERTZ: &str = "Hz";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Measurement {
    pub quantity: f64,
    pub exponent: i32,
    pub base_unit: String,
}

impl Measurement {
    pub fn new(quantity: f64, exponent: i32, base_unit: &str) -> Self {
        Measurement {
            quantity,
            exponent,
            base_unit: base_unit.to_string(),
        }
    }

    /// A measurement with no decimal scaling, e.g. `0.01 V`.
    pub fn base(quantity: f64, base_unit: &str) -> Self {
        Measurement::new(quantity, 0, base_unit)
    }

    pub fn hertz(rate: f64) -> Self {
        Measurement::base(rate, HERTZ)
    }

    /// Quantity expressed in the base unit, folding in the exponent.
    pub fn base_quantity(&self) -> f64 {
        self.quantity * 10f64.powi(self.exponent)
    }

    /// The "base" display form, e.g. `0.01 V` for `10 x 10^-3 V`.
    pub fn base_form(&self) -> String {
        format!("{} {}", self.base_quantity(), self.base_unit)
    }

    /// Convert to another base unit through the given registry.
    pub fn converted_to(
        &self,
        unit: &str,
        registry: &ConversionRegistry,
    ) -> Result<Measurement, MeasurementError> {
        registry.convert(self, unit)
    }
}

/// Equality is on the base form: same base unit and exactly the same base
/// quantity, so `10 x 10^-3 V` equals `0.01 x 10^0 V`.
impl PartialEq for Measurement {
    fn eq(&self, other: &Measurement) -> bool {
        self.base_unit == other.base_unit && self.base_quantity() == other.base_quantity()
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.exponent == 0 {
            write!(f, "{} {}", self.quantity, self.base_unit)
        } else {
            write!(f, "{} x 10^{} {}", self.quantity, self.exponent, self.base_unit)
        }
    }
}

/// Checks that every measurement in `items` shares one base unit and returns
/// it. An empty collection has no unit.
pub fn homogeneous_base_unit<'a, I>(items: I) -> Result<Option<String>, MeasurementError>
where
    I: IntoIterator<Item = &'a Measurement>,
{
    let mut unit: Option<String> = None;
    for m in items {
        match &unit {
            None => unit = Some(m.base_unit.clone()),
            Some(u) => {
                if *u != m.base_unit {
                    return Err(MeasurementError::Incompatible {
                        left: u.clone(),
                        right: m.base_unit.clone(),
                    });
                }
            }
        }
    }
    Ok(unit)
}

#[derive(Debug)]
pub enum MeasurementError {
    /// An operation that requires one base unit saw two.
    Incompatible { left: String, right: String },
    /// No conversion is registered between the two units.
    UnknownConversion { from: String, to: String },
}

impl fmt::Display for MeasurementError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MeasurementError::Incompatible { left, right } => {
                write!(f, "Incompatible base units: {} vs. {}", left, right)
            }
            MeasurementError::UnknownConversion { from, to } => {
                write!(f, "No conversion registered from {} to {}", from, to)
            }
        }
    }
}

impl Error for MeasurementError {}

type ConversionFn = Arc<dyn Fn(&Measurement) -> Measurement + Send + Sync>;

/// Process-wide map of `(from_unit, to_unit)` conversion procedures. Matching
/// base units convert without a registered procedure by folding the exponent.
pub struct ConversionRegistry {
    table: Mutex<HashMap<(String, String), ConversionFn>>,
}

impl ConversionRegistry {
    pub fn new() -> Self {
        ConversionRegistry {
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, from: &str, to: &str, proc: F)
    where
        F: Fn(&Measurement) -> Measurement + Send + Sync + 'static,
    {
        self.table
            .lock()
            .unwrap()
            .insert((from.to_string(), to.to_string()), Arc::new(proc));
    }

    pub fn clear(&self) {
        self.table.lock().unwrap().clear();
    }

    pub fn convert(
        &self,
        measurement: &Measurement,
        to_unit: &str,
    ) -> Result<Measurement, MeasurementError> {
        if measurement.base_unit == to_unit {
            return Ok(Measurement::base(measurement.base_quantity(), to_unit));
        }
        let proc = self
            .table
            .lock()
            .unwrap()
            .get(&(measurement.base_unit.clone(), to_unit.to_string()))
            .cloned();
        match proc {
            Some(p) => Ok(p(measurement)),
            None => Err(MeasurementError::UnknownConversion {
                from: measurement.base_unit.clone(),
                to: to_unit.to_string(),
            }),
        }
    }
}

lazy_static! {
    /// The default registry. The pipeline takes a registry reference, this is
    /// only the instance used when nobody supplies one.
    pub static ref CONVERSIONS: ConversionRegistry = ConversionRegistry::new();
}
