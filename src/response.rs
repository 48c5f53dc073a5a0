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

//! Append-only collector of the samples a device sent back during one epoch.

use std::error::Error;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::FixedOffset;

use ephys_common::Measurement;

use crate::io_data::ConfigurationSpan;
use crate::io_data::InputData;

#[derive(Debug)]
pub enum ResponseError {
    /// All segments of one response must share a sample rate.
    HeterogeneousSampleRate,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResponseError::HeterogeneousSampleRate => {
                write!(f, "Response segments have differing sample rates")
            }
        }
    }
}

impl Error for ResponseError {}

/// Segments stay in push order internally; the public views sort by
/// `input_time`.
#[derive(Debug, Default)]
pub struct Response {
    segments: Mutex<Vec<InputData>>,
}

impl Response {
    pub fn new() -> Self {
        Response::default()
    }

    pub fn append(&self, data: InputData) {
        self.segments.lock().unwrap().push(data);
    }

    pub fn segments(&self) -> Vec<InputData> {
        let mut segments = self.segments.lock().unwrap().clone();
        segments.sort_by_key(|s| s.input_time);
        segments
    }

    /// All samples, concatenated in `input_time` order.
    pub fn data(&self) -> Vec<Measurement> {
        self.segments()
            .iter()
            .flat_map(|s| s.data.iter().cloned())
            .collect()
    }

    /// One span per segment, in `input_time` order.
    pub fn configuration_spans(&self) -> Vec<ConfigurationSpan> {
        self.segments()
            .iter()
            .map(|s| ConfigurationSpan::new(s.duration(), s.node_configurations().to_vec()))
            .collect()
    }

    /// The shared sample rate, `None` for an empty response.
    pub fn sample_rate(&self) -> Result<Option<Measurement>, ResponseError> {
        let segments = self.segments.lock().unwrap();
        let mut rate: Option<Measurement> = None;
        for s in segments.iter() {
            match &rate {
                None => rate = Some(s.sample_rate.clone()),
                Some(r) => {
                    if *r != s.sample_rate {
                        return Err(ResponseError::HeterogeneousSampleRate);
                    }
                }
            }
        }
        Ok(rate)
    }

    /// Wire time of the earliest segment.
    pub fn input_time(&self) -> Option<DateTime<FixedOffset>> {
        self.segments.lock().unwrap().iter().map(|s| s.input_time).min()
    }

    pub fn duration(&self) -> Duration {
        self.segments
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.duration())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn t0() -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(2022, 1, 1, 12, 0, 0).unwrap().fixed_offset()
    }

    fn segment(n: usize, value: f64, at_ms: i64) -> InputData {
        InputData::new(
            (0..n).map(|_| Measurement::base(value, "mV")).collect(),
            Measurement::hertz(10_000.0),
            t0() + chrono::Duration::milliseconds(at_ms),
        )
        .unwrap()
    }

    #[test]
    fn segments_sort_by_input_time() {
        let response = Response::new();
        response.append(segment(100, 2.0, 10));
        response.append(segment(100, 1.0, 0));
        let data = response.data();
        assert_eq!(data.len(), 200);
        assert_eq!(data[0].base_quantity(), 1.0);
        assert_eq!(data[199].base_quantity(), 2.0);
        assert_eq!(response.input_time(), Some(t0()));
    }

    #[test]
    fn duration_sums_segments() {
        let response = Response::new();
        assert_eq!(response.duration(), Duration::from_secs(0));
        response.append(segment(500, 0.0, 0));
        response.append(segment(250, 0.0, 50));
        assert_eq!(response.duration(), Duration::from_millis(75));
    }

    #[test]
    fn sample_rate_must_be_homogeneous() {
        let response = Response::new();
        assert_eq!(response.sample_rate().unwrap(), None);
        response.append(segment(10, 0.0, 0));
        assert_eq!(
            response.sample_rate().unwrap(),
            Some(Measurement::hertz(10_000.0))
        );
        let odd = InputData::new(
            vec![Measurement::base(0.0, "mV"); 10],
            Measurement::hertz(500.0),
            t0(),
        )
        .unwrap();
        response.append(odd);
        assert!(response.sample_rate().is_err());
    }
}
