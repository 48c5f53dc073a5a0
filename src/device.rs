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

//! The driver contract the acquisition loop runs against, and a software
//! loopback device that satisfies it without hardware.

use std::error::Error;
use std::fmt;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::FixedOffset;
use chrono::Local;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use ephys_common::Measurement;
use ephys_common::Value;

use crate::io_data::InputData;
use crate::io_data::OutputData;
use crate::streams::InputStream;
use crate::streams::OutputStream;

/// Identifies a rig device; epochs key their stimuli and responses by this,
/// and the persistor dedups devices by it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub name: String,
    pub manufacturer: String,
}

impl DeviceInfo {
    pub fn new(name: &str, manufacturer: &str) -> Self {
        DeviceInfo {
            name: name.to_string(),
            manufacturer: manufacturer.to_string(),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.manufacturer)
    }
}

#[derive(Debug)]
pub enum DaqError {
    /// The driver refused or failed an operation.
    Hardware(String),
    /// A stream name the loop was handed does not belong to this device.
    UnknownStream(String),
    /// The loop is already running.
    AlreadyRunning,
    /// Configuration-time validation refused the rig.
    Validation(String),
}

impl fmt::Display for DaqError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DaqError::Hardware(what) => write!(f, "Hardware failure: {}", what),
            DaqError::UnknownStream(name) => write!(f, "No stream named {}", name),
            DaqError::AlreadyRunning => write!(f, "Acquisition is already running"),
            DaqError::Validation(reason) => write!(f, "Validation failed: {}", reason),
        }
    }
}

impl Error for DaqError {}

/// Wall-clock used to stamp wire times; monotone for stamping purposes.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// One device-specific I/O iteration consumes the block pulled for each
/// active output stream and returns a block for each active input stream.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    fn manufacturer(&self) -> &str;
    fn process_interval(&self) -> Duration;
    fn clock(&self) -> Arc<dyn Clock>;

    /// Configuration-time check, run once before the loop starts.
    fn validate(&self) -> Result<(), String>;

    /// May block on an external edge when `wait_for_trigger` is set.
    fn start_hardware(&self, wait_for_trigger: bool) -> Result<(), DaqError>;
    fn stop_hardware(&self) -> Result<(), DaqError>;

    fn active_output_streams(&self) -> IndexMap<String, Arc<dyn OutputStream>>;
    fn active_input_streams(&self) -> IndexMap<String, Arc<dyn InputStream>>;

    fn process_loop_iteration(
        &self,
        outgoing: &IndexMap<String, OutputData>,
        deficit: Duration,
    ) -> Result<IndexMap<String, InputData>, DaqError>;

    /// The rest value of an output channel, reapplied when the loop stops.
    fn stream_background(&self, stream: &str) -> Option<Measurement>;
    fn apply_stream_background(
        &self,
        stream: &str,
        value: &Measurement,
    ) -> Result<(), DaqError>;

    /// Configuration stamped onto data that passes through this node.
    fn configuration(&self) -> IndexMap<String, Value>;
}

/// A hardware-free device: every bound output channel echoes its pulled
/// samples back on the input channel wired to it. Tests script it to fail on
/// a chosen iteration.
pub struct LoopbackDevice {
    name: String,
    manufacturer: String,
    process_interval: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<LoopbackState>,
}

#[derive(Default)]
struct LoopbackState {
    outputs: IndexMap<String, Arc<dyn OutputStream>>,
    inputs: IndexMap<String, Arc<dyn InputStream>>,
    /// output channel -> input channel echo wiring
    wiring: IndexMap<String, String>,
    backgrounds: IndexMap<String, Measurement>,
    applied_backgrounds: Vec<(String, Measurement)>,
    iterations: u64,
    fail_on_iteration: Option<u64>,
    hardware_running: bool,
}

impl LoopbackDevice {
    pub fn new(name: &str, manufacturer: &str, process_interval: Duration) -> Self {
        LoopbackDevice {
            name: name.to_string(),
            manufacturer: manufacturer.to_string(),
            process_interval,
            clock: Arc::new(SystemClock),
            state: Mutex::new(LoopbackState::default()),
        }
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo::new(&self.name, &self.manufacturer)
    }

    pub fn bind_output_stream(
        &self,
        channel: &str,
        stream: Arc<dyn OutputStream>,
        background: Measurement,
    ) {
        let mut state = self.state.lock().unwrap();
        state.outputs.insert(channel.to_string(), stream);
        state.backgrounds.insert(channel.to_string(), background);
    }

    pub fn bind_input_stream(&self, channel: &str, stream: Arc<dyn InputStream>) {
        let mut state = self.state.lock().unwrap();
        state.inputs.insert(channel.to_string(), stream);
    }

    /// Echo samples pulled on `output_channel` back in on `input_channel`.
    pub fn wire(&self, output_channel: &str, input_channel: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .wiring
            .insert(output_channel.to_string(), input_channel.to_string());
    }

    pub fn fail_on_iteration(&self, iteration: u64) {
        self.state.lock().unwrap().fail_on_iteration = Some(iteration);
    }

    pub fn iterations(&self) -> u64 {
        self.state.lock().unwrap().iterations
    }

    pub fn applied_backgrounds(&self) -> Vec<(String, Measurement)> {
        self.state.lock().unwrap().applied_backgrounds.clone()
    }

    pub fn is_hardware_running(&self) -> bool {
        self.state.lock().unwrap().hardware_running
    }
}

impl Device for LoopbackDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    fn process_interval(&self) -> Duration {
        self.process_interval
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn validate(&self) -> Result<(), String> {
        let state = self.state.lock().unwrap();
        if state.outputs.is_empty() && state.inputs.is_empty() {
            return Err("no streams bound".to_string());
        }
        for (out, input) in state.wiring.iter() {
            if !state.outputs.contains_key(out) {
                return Err(format!("wiring references unbound output {}", out));
            }
            if !state.inputs.contains_key(input) {
                return Err(format!("wiring references unbound input {}", input));
            }
        }
        Ok(())
    }

    fn start_hardware(&self, _wait_for_trigger: bool) -> Result<(), DaqError> {
        self.state.lock().unwrap().hardware_running = true;
        Ok(())
    }

    fn stop_hardware(&self) -> Result<(), DaqError> {
        self.state.lock().unwrap().hardware_running = false;
        Ok(())
    }

    fn active_output_streams(&self) -> IndexMap<String, Arc<dyn OutputStream>> {
        self.state.lock().unwrap().outputs.clone()
    }

    fn active_input_streams(&self) -> IndexMap<String, Arc<dyn InputStream>> {
        self.state.lock().unwrap().inputs.clone()
    }

    fn process_loop_iteration(
        &self,
        outgoing: &IndexMap<String, OutputData>,
        _deficit: Duration,
    ) -> Result<IndexMap<String, InputData>, DaqError> {
        let mut state = self.state.lock().unwrap();
        state.iterations += 1;
        if state.fail_on_iteration == Some(state.iterations) {
            return Err(DaqError::Hardware(format!(
                "scripted failure on iteration {}",
                state.iterations
            )));
        }
        let now = self.clock.now();
        let mut incoming = IndexMap::new();
        for (channel, data) in outgoing {
            let input_channel = match state.wiring.get(channel) {
                Some(c) => c.clone(),
                None => continue,
            };
            let echoed = InputData::new(data.data.clone(), data.sample_rate.clone(), now)
                .map_err(|e| DaqError::Hardware(e.to_string()))?;
            incoming.insert(input_channel, echoed);
        }
        Ok(incoming)
    }

    fn stream_background(&self, stream: &str) -> Option<Measurement> {
        self.state.lock().unwrap().backgrounds.get(stream).cloned()
    }

    fn apply_stream_background(
        &self,
        stream: &str,
        value: &Measurement,
    ) -> Result<(), DaqError> {
        let mut state = self.state.lock().unwrap();
        if !state.outputs.contains_key(stream) {
            return Err(DaqError::UnknownStream(stream.to_string()));
        }
        state
            .applied_backgrounds
            .push((stream.to_string(), value.clone()));
        Ok(())
    }

    fn configuration(&self) -> IndexMap<String, Value> {
        let mut configuration = IndexMap::new();
        configuration.insert(
            "processIntervalSeconds".to_string(),
            Value::Float(self.process_interval.as_secs_f64()),
        );
        configuration
    }
}
