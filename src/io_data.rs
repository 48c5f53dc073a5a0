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

//! Immutable sample buffers exchanged with the hardware.
//!
//! `OutputData` flows to the device, `InputData` flows back. Both carry the
//! sample rate they were produced at and the configuration of every pipeline
//! node that has touched them.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use chrono::DateTime;
use chrono::FixedOffset;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use ephys_common::time;
use ephys_common::ConversionRegistry;
use ephys_common::Measurement;
use ephys_common::MeasurementError;
use ephys_common::Value;
use ephys_common::HERTZ;

/// Configuration snapshot of one pipeline stage that processed a block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeConfiguration {
    pub name: String,
    pub configuration: IndexMap<String, Value>,
}

impl NodeConfiguration {
    pub fn new(name: &str, configuration: IndexMap<String, Value>) -> Self {
        NodeConfiguration {
            name: name.to_string(),
            configuration,
        }
    }
}

/// A contiguous time region annotated with the node configurations that were
/// active over it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConfigurationSpan {
    pub time: Duration,
    pub node_configurations: Vec<NodeConfiguration>,
}

impl ConfigurationSpan {
    pub fn new(time: Duration, node_configurations: Vec<NodeConfiguration>) -> Self {
        ConfigurationSpan {
            time,
            node_configurations,
        }
    }
}

#[derive(Debug)]
pub enum DataError {
    /// Node configuration names are unique within one buffer.
    DuplicateNodeConfiguration(String),
    /// Sample rates must be in positive Hz.
    InvalidSampleRate(Measurement),
    /// Concatenation operands must share one sample rate.
    SampleRateMismatch,
    /// Concatenation operands must not carry node configurations.
    NonEmptyConfiguration,
    Measurement(MeasurementError),
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DataError::DuplicateNodeConfiguration(name) => {
                write!(f, "Node configuration {} already present", name)
            }
            DataError::InvalidSampleRate(rate) => write!(f, "Invalid sample rate {}", rate),
            DataError::SampleRateMismatch => write!(f, "Sample rates do not match"),
            DataError::NonEmptyConfiguration => {
                write!(f, "Operands must not carry node configurations")
            }
            DataError::Measurement(e) => write!(f, "{}", e),
        }
    }
}

impl Error for DataError {}

impl From<MeasurementError> for DataError {
    fn from(e: MeasurementError) -> Self {
        DataError::Measurement(e)
    }
}

fn check_sample_rate(rate: &Measurement) -> Result<(), DataError> {
    if rate.base_unit != HERTZ || rate.base_quantity() <= 0.0 {
        return Err(DataError::InvalidSampleRate(rate.clone()));
    }
    Ok(())
}

fn push_configuration(
    configurations: &mut Vec<NodeConfiguration>,
    configuration: NodeConfiguration,
) -> Result<(), DataError> {
    if configurations
        .iter()
        .any(|c| c.name == configuration.name)
    {
        return Err(DataError::DuplicateNodeConfiguration(configuration.name));
    }
    configurations.push(configuration);
    Ok(())
}

/// A block of samples on its way to the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputData {
    pub data: Vec<Measurement>,
    pub sample_rate: Measurement,
    node_configurations: Vec<NodeConfiguration>,
    /// Set on the final block of a finite stimulus.
    pub is_last: bool,
    pub output_time: Option<DateTime<FixedOffset>>,
}

impl OutputData {
    pub fn new(
        data: Vec<Measurement>,
        sample_rate: Measurement,
        is_last: bool,
    ) -> Result<Self, DataError> {
        check_sample_rate(&sample_rate)?;
        ephys_common::homogeneous_base_unit(data.iter())?;
        Ok(OutputData {
            data,
            sample_rate,
            node_configurations: Vec::new(),
            is_last,
            output_time: None,
        })
    }

    pub fn rate_hz(&self) -> f64 {
        self.sample_rate.base_quantity()
    }

    /// Span covered by this block, rounded up to a whole tick.
    pub fn duration(&self) -> Duration {
        time::duration_of_samples(self.data.len() as u64, self.rate_hz())
    }

    pub fn node_configurations(&self) -> &[NodeConfiguration] {
        &self.node_configurations
    }

    /// Splits into a head of at most `d` and the remainder. The remainder may
    /// be empty; `is_last` follows the samples that end the block.
    pub fn split_data(&self, d: Duration) -> (OutputData, OutputData) {
        let n = (time::samples_that_fit(d, self.rate_hz()) as usize).min(self.data.len());
        let head_duration = time::duration_of_samples(n as u64, self.rate_hz());
        let head = OutputData {
            data: self.data[..n].to_vec(),
            sample_rate: self.sample_rate.clone(),
            node_configurations: self.node_configurations.clone(),
            is_last: self.is_last && n == self.data.len(),
            output_time: self.output_time,
        };
        let rest = OutputData {
            data: self.data[n..].to_vec(),
            sample_rate: self.sample_rate.clone(),
            node_configurations: self.node_configurations.clone(),
            is_last: self.is_last,
            output_time: self.output_time.map(|t| {
                t + chrono::Duration::from_std(head_duration).unwrap()
            }),
        };
        (head, rest)
    }

    pub fn concat(&self, other: &OutputData) -> Result<OutputData, DataError> {
        if self.sample_rate != other.sample_rate {
            return Err(DataError::SampleRateMismatch);
        }
        if !self.node_configurations.is_empty() || !other.node_configurations.is_empty() {
            return Err(DataError::NonEmptyConfiguration);
        }
        let mut data = self.data.clone();
        data.extend(other.data.iter().cloned());
        ephys_common::homogeneous_base_unit(data.iter())?;
        Ok(OutputData {
            data,
            sample_rate: self.sample_rate.clone(),
            node_configurations: Vec::new(),
            is_last: self.is_last || other.is_last,
            output_time: self.output_time,
        })
    }

    pub fn with_units(
        &self,
        unit: &str,
        registry: &ConversionRegistry,
    ) -> Result<OutputData, DataError> {
        let data = self
            .data
            .iter()
            .map(|m| registry.convert(m, unit))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(OutputData {
            data,
            ..self.clone()
        })
    }

    pub fn with_conversion<F>(&self, f: F) -> OutputData
    where
        F: Fn(&Measurement) -> Measurement,
    {
        OutputData {
            data: self.data.iter().map(f).collect(),
            ..self.clone()
        }
    }

    pub fn with_node_configuration(
        mut self,
        configuration: NodeConfiguration,
    ) -> Result<OutputData, DataError> {
        push_configuration(&mut self.node_configurations, configuration)?;
        Ok(self)
    }

    pub fn with_output_time(mut self, t: DateTime<FixedOffset>) -> OutputData {
        self.output_time = Some(t);
        self
    }
}

/// A block of samples captured from the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InputData {
    pub data: Vec<Measurement>,
    pub sample_rate: Measurement,
    node_configurations: Vec<NodeConfiguration>,
    /// Wall-clock time the first sample hit the wire.
    pub input_time: DateTime<FixedOffset>,
}

impl InputData {
    pub fn new(
        data: Vec<Measurement>,
        sample_rate: Measurement,
        input_time: DateTime<FixedOffset>,
    ) -> Result<Self, DataError> {
        check_sample_rate(&sample_rate)?;
        ephys_common::homogeneous_base_unit(data.iter())?;
        Ok(InputData {
            data,
            sample_rate,
            node_configurations: Vec::new(),
            input_time,
        })
    }

    pub fn rate_hz(&self) -> f64 {
        self.sample_rate.base_quantity()
    }

    pub fn duration(&self) -> Duration {
        time::duration_of_samples(self.data.len() as u64, self.rate_hz())
    }

    pub fn node_configurations(&self) -> &[NodeConfiguration] {
        &self.node_configurations
    }

    /// Splits into a head of at most `d` and the remainder; the remainder's
    /// `input_time` shifts by the head's span.
    pub fn split_data(&self, d: Duration) -> (InputData, InputData) {
        let n = (time::samples_that_fit(d, self.rate_hz()) as usize).min(self.data.len());
        let head_duration = time::duration_of_samples(n as u64, self.rate_hz());
        let head = InputData {
            data: self.data[..n].to_vec(),
            sample_rate: self.sample_rate.clone(),
            node_configurations: self.node_configurations.clone(),
            input_time: self.input_time,
        };
        let rest = InputData {
            data: self.data[n..].to_vec(),
            sample_rate: self.sample_rate.clone(),
            node_configurations: self.node_configurations.clone(),
            input_time: self.input_time + chrono::Duration::from_std(head_duration).unwrap(),
        };
        (head, rest)
    }

    /// Concatenation keeps the left operand's `input_time`.
    pub fn concat(&self, other: &InputData) -> Result<InputData, DataError> {
        if self.sample_rate != other.sample_rate {
            return Err(DataError::SampleRateMismatch);
        }
        if !self.node_configurations.is_empty() || !other.node_configurations.is_empty() {
            return Err(DataError::NonEmptyConfiguration);
        }
        let mut data = self.data.clone();
        data.extend(other.data.iter().cloned());
        ephys_common::homogeneous_base_unit(data.iter())?;
        Ok(InputData {
            data,
            sample_rate: self.sample_rate.clone(),
            node_configurations: Vec::new(),
            input_time: self.input_time,
        })
    }

    pub fn with_units(
        &self,
        unit: &str,
        registry: &ConversionRegistry,
    ) -> Result<InputData, DataError> {
        let data = self
            .data
            .iter()
            .map(|m| registry.convert(m, unit))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InputData {
            data,
            ..self.clone()
        })
    }

    pub fn with_conversion<F>(&self, f: F) -> InputData
    where
        F: Fn(&Measurement) -> Measurement,
    {
        InputData {
            data: self.data.iter().map(f).collect(),
            ..self.clone()
        }
    }

    pub fn with_node_configuration(
        mut self,
        configuration: NodeConfiguration,
    ) -> Result<InputData, DataError> {
        push_configuration(&mut self.node_configurations, configuration)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    pub fn constant_samples(n: usize, value: f64) -> Vec<Measurement> {
        (0..n).map(|_| Measurement::base(value, "V")).collect()
    }

    fn output(n: usize) -> OutputData {
        OutputData::new(constant_samples(n, 1.0), Measurement::hertz(10_000.0), false).unwrap()
    }

    #[test]
    fn duration_rounds_up_partial_samples() {
        let d = output(500);
        assert_eq!(d.duration(), Duration::from_millis(50));
        let d = OutputData::new(constant_samples(1, 0.0), Measurement::hertz(3.0), false).unwrap();
        assert_eq!(ephys_common::time::duration_to_ticks(d.duration()), 3_333_334);
    }

    #[test]
    fn split_partitions_samples() {
        let d = output(500);
        let (head, rest) = d.split_data(Duration::from_millis(20));
        assert_eq!(head.data.len(), 200);
        assert_eq!(rest.data.len(), 300);
        assert!(head.duration() <= Duration::from_millis(20));
        let mut glued = head.data.clone();
        glued.extend(rest.data.iter().cloned());
        assert_eq!(glued, d.data);
    }

    #[test]
    fn split_past_end_leaves_empty_rest() {
        let mut d = output(100);
        d.is_last = true;
        let (head, rest) = d.split_data(Duration::from_secs(1));
        assert_eq!(head.data.len(), 100);
        assert!(head.is_last);
        assert!(rest.data.is_empty());
    }

    #[test]
    fn is_last_stays_with_the_tail() {
        let mut d = output(500);
        d.is_last = true;
        let (head, rest) = d.split_data(Duration::from_millis(20));
        assert!(!head.is_last);
        assert!(rest.is_last);
    }

    #[test]
    fn concat_sums_durations() {
        let a = output(200);
        let b = output(300);
        let joined = a.concat(&b).unwrap();
        assert_eq!(joined.duration(), a.duration() + b.duration());
        assert_eq!(joined.data.len(), 500);
    }

    #[test]
    fn concat_requires_matching_rate_and_no_configs() {
        let a = output(10);
        let slow = OutputData::new(constant_samples(10, 1.0), Measurement::hertz(1000.0), false)
            .unwrap();
        assert!(a.concat(&slow).is_err());

        let configured = output(10)
            .with_node_configuration(NodeConfiguration::new("amp", IndexMap::new()))
            .unwrap();
        assert!(output(10).concat(&configured).is_err());
    }

    #[test]
    fn node_configuration_names_are_unique() {
        let d = output(10)
            .with_node_configuration(NodeConfiguration::new("amp", IndexMap::new()))
            .unwrap();
        let result = d.with_node_configuration(NodeConfiguration::new("amp", IndexMap::new()));
        assert!(result.is_err());
    }

    #[test]
    fn input_split_shifts_input_time() {
        let t0 = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap().fixed_offset();
        let d = InputData::new(constant_samples(500, 0.5), Measurement::hertz(10_000.0), t0)
            .unwrap();
        let (head, rest) = d.split_data(Duration::from_millis(30));
        assert_eq!(head.input_time, t0);
        assert_eq!(
            rest.input_time,
            t0 + chrono::Duration::milliseconds(30)
        );
        assert_eq!(head.concat(&rest).unwrap().input_time, t0);
    }

    #[test]
    fn with_units_converts_samples() {
        let registry = ephys_common::ConversionRegistry::new();
        registry.register("V", "mV", |m| {
            Measurement::base(m.base_quantity() * 1000.0, "mV")
        });
        let d = output(3).with_units("mV", &registry).unwrap();
        assert_eq!(d.data[0], Measurement::base(1000.0, "mV"));
    }
}
