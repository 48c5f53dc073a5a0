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

//! One bounded trial of the experiment: the unit of scheduling and
//! persistence.
//!
//! The per-device collections must not change once the loop has obtained a
//! stream for that device; bind stimuli, responses and backgrounds before
//! enqueueing the epoch.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::FixedOffset;
use indexmap::IndexMap;
use indexmap::IndexSet;

use ephys_common::Measurement;
use ephys_common::Value;

use crate::device::DeviceInfo;
use crate::response::Response;
use crate::stimulus::Background;
use crate::stimulus::Stimulus;
use crate::streams::BackgroundOutputStream;
use crate::streams::InputStream;
use crate::streams::OutputStream;
use crate::streams::ResponseInputStream;
use crate::streams::StimulusOutputStream;

/// A response slot: where captured samples accumulate, and the rate the
/// device is expected to capture at.
pub struct ResponseSlot {
    pub response: Arc<Response>,
    pub sample_rate: Measurement,
}

pub struct Epoch {
    pub protocol_id: String,
    pub protocol_parameters: IndexMap<String, Value>,
    stimuli: IndexMap<DeviceInfo, Arc<dyn Stimulus>>,
    responses: IndexMap<DeviceInfo, ResponseSlot>,
    backgrounds: IndexMap<DeviceInfo, Arc<Background>>,
    pub keywords: IndexSet<String>,
    pub properties: IndexMap<String, Value>,
    pub should_wait_for_trigger: bool,
    pub should_be_persisted: bool,
}

impl Epoch {
    pub fn new(protocol_id: &str, protocol_parameters: IndexMap<String, Value>) -> Self {
        Epoch {
            protocol_id: protocol_id.to_string(),
            protocol_parameters,
            stimuli: IndexMap::new(),
            responses: IndexMap::new(),
            backgrounds: IndexMap::new(),
            keywords: IndexSet::new(),
            properties: IndexMap::new(),
            should_wait_for_trigger: false,
            should_be_persisted: true,
        }
    }

    pub fn add_stimulus(&mut self, device: DeviceInfo, stimulus: Arc<dyn Stimulus>) {
        self.stimuli.insert(device, stimulus);
    }

    /// Installs a response slot; the returned collector fills as the loop
    /// pushes captured samples.
    pub fn record_response(
        &mut self,
        device: DeviceInfo,
        sample_rate: Measurement,
    ) -> Arc<Response> {
        let response = Arc::new(Response::new());
        self.responses.insert(
            device,
            ResponseSlot {
                response: response.clone(),
                sample_rate,
            },
        );
        response
    }

    pub fn set_background(
        &mut self,
        device: DeviceInfo,
        value: Measurement,
        sample_rate: Measurement,
    ) {
        self.backgrounds
            .insert(device, Arc::new(Background::new(value, sample_rate)));
    }

    pub fn stimuli(&self) -> &IndexMap<DeviceInfo, Arc<dyn Stimulus>> {
        &self.stimuli
    }

    pub fn responses(&self) -> &IndexMap<DeviceInfo, ResponseSlot> {
        &self.responses
    }

    pub fn backgrounds(&self) -> &IndexMap<DeviceInfo, Arc<Background>> {
        &self.backgrounds
    }

    /// An epoch is indefinite when any of its stimuli runs without end.
    pub fn is_indefinite(&self) -> bool {
        self.stimuli.values().any(|s| s.duration().is_none())
    }

    /// Longest stimulus or response span; `None` when indefinite.
    pub fn duration(&self) -> Option<Duration> {
        let mut longest = Duration::from_secs(0);
        for stimulus in self.stimuli.values() {
            match stimulus.duration() {
                Some(d) => longest = longest.max(d),
                None => return None,
            }
        }
        for slot in self.responses.values() {
            longest = longest.max(slot.response.duration());
        }
        Some(longest)
    }

    /// Earliest wire time over every stimulus and background that has begun.
    pub fn start_time(&self) -> Option<DateTime<FixedOffset>> {
        let stimulus_starts = self.stimuli.values().filter_map(|s| s.start_time());
        let background_starts = self.backgrounds.values().filter_map(|b| b.start_time());
        stimulus_starts.chain(background_starts).min()
    }

    pub fn is_complete(&self) -> bool {
        let duration = match self.duration() {
            Some(d) => d,
            None => return false,
        };
        self.stimuli.values().all(|s| s.is_complete())
            && self
                .responses
                .values()
                .all(|slot| slot.response.duration() >= duration)
    }

    /// The loop's source of samples for `device`: the stimulus when one is
    /// bound, the background bounded by the epoch otherwise.
    pub fn get_output_stream(
        &self,
        device: &DeviceInfo,
        block_duration: Duration,
    ) -> Option<Arc<dyn OutputStream>> {
        if let Some(stimulus) = self.stimuli.get(device) {
            return Some(Arc::new(StimulusOutputStream::new(
                stimulus.clone(),
                block_duration,
            )));
        }
        if let Some(background) = self.backgrounds.get(device) {
            let stream = match self.duration() {
                Some(d) => BackgroundOutputStream::bounded(background.clone(), d),
                None => BackgroundOutputStream::unbounded(background.clone()),
            };
            return Some(Arc::new(stream));
        }
        None
    }

    /// The loop's sink for `device`, when a response slot exists.
    pub fn get_input_stream(&self, device: &DeviceInfo) -> Option<Arc<dyn InputStream>> {
        self.responses.get(device).map(|slot| {
            Arc::new(ResponseInputStream::new(
                slot.response.clone(),
                slot.sample_rate.clone(),
                self.duration(),
            )) as Arc<dyn InputStream>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    use crate::io_data::InputData;
    use crate::io_data::OutputData;
    use crate::stimulus::RenderedStimulus;
    use crate::streams::IoStream;

    fn t0() -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(2022, 1, 1, 12, 0, 0).unwrap().fixed_offset()
    }

    fn amp() -> DeviceInfo {
        DeviceInfo::new("Amp", "Example Instruments")
    }

    fn stimulus(ms: u64) -> Arc<dyn Stimulus> {
        let n = (ms * 10) as usize; // 10 kHz
        let data = OutputData::new(
            vec![Measurement::base(1.0, "mV"); n],
            Measurement::hertz(10_000.0),
            false,
        )
        .unwrap();
        Arc::new(
            RenderedStimulus::new("edu.example.step", IndexMap::new(), data, None).unwrap(),
        )
    }

    #[test]
    fn stimulus_takes_priority_over_background() {
        let mut epoch = Epoch::new("edu.example.protocol", IndexMap::new());
        epoch.set_background(
            amp(),
            Measurement::base(-60.0, "mV"),
            Measurement::hertz(10_000.0),
        );
        let stream = epoch
            .get_output_stream(&amp(), Duration::from_millis(10))
            .unwrap();
        // only a background is bound: stream is bounded by the epoch duration
        assert_eq!(stream.duration(), Some(Duration::from_secs(0)));

        epoch.add_stimulus(amp(), stimulus(200));
        let stream = epoch
            .get_output_stream(&amp(), Duration::from_millis(10))
            .unwrap();
        assert_eq!(stream.duration(), Some(Duration::from_millis(200)));

        let other = DeviceInfo::new("LED", "Example Instruments");
        assert!(epoch.get_output_stream(&other, Duration::from_millis(10)).is_none());
    }

    #[test]
    fn completion_requires_stimuli_and_responses() {
        let mut epoch = Epoch::new("edu.example.protocol", IndexMap::new());
        epoch.add_stimulus(amp(), stimulus(200));
        let response = epoch.record_response(amp(), Measurement::hertz(10_000.0));
        assert_eq!(epoch.duration(), Some(Duration::from_millis(200)));
        assert!(!epoch.is_complete());

        let stream = epoch.get_input_stream(&amp()).unwrap();
        let half = InputData::new(
            vec![Measurement::base(0.0, "mV"); 1000],
            Measurement::hertz(10_000.0),
            t0(),
        )
        .unwrap();
        stream.push_input_data(half.clone()).unwrap();
        assert!(!epoch.is_complete());
        stream.push_input_data(half).unwrap();
        assert_eq!(response.duration(), Duration::from_millis(200));
        // the response is full but the stimulus has not confirmed its output
        assert!(!epoch.is_complete());

        let stim = epoch.stimuli().get(&amp()).unwrap();
        stim.did_output_data(t0(), Duration::from_millis(200), &[]).unwrap();
        assert!(epoch.is_complete());
    }

    #[test]
    fn indefinite_stimulus_makes_the_epoch_indefinite() {
        let mut epoch = Epoch::new("edu.example.protocol", IndexMap::new());
        let data = OutputData::new(
            vec![Measurement::base(1.0, "mV"); 100],
            Measurement::hertz(10_000.0),
            false,
        )
        .unwrap();
        let indefinite = Arc::new(
            RenderedStimulus::indefinite("edu.example.hold", IndexMap::new(), data).unwrap(),
        );
        epoch.add_stimulus(amp(), indefinite);
        assert!(epoch.is_indefinite());
        assert_eq!(epoch.duration(), None);
        assert!(!epoch.is_complete());
    }

    #[test]
    fn start_time_is_the_earliest_wire_time() {
        let mut epoch = Epoch::new("edu.example.protocol", IndexMap::new());
        epoch.add_stimulus(amp(), stimulus(100));
        epoch.set_background(
            DeviceInfo::new("LED", "Example Instruments"),
            Measurement::base(0.0, "V"),
            Measurement::hertz(1000.0),
        );
        assert_eq!(epoch.start_time(), None);

        let backgrounds = epoch.backgrounds();
        let led = backgrounds.values().next().unwrap();
        led.did_output_data(t0() + chrono::Duration::milliseconds(5), Duration::from_millis(1), &[])
            .unwrap();
        let stim = epoch.stimuli().get(&amp()).unwrap();
        stim.did_output_data(t0(), Duration::from_millis(1), &[]).unwrap();
        assert_eq!(epoch.start_time(), Some(t0()));
    }
}
