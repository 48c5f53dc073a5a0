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

//! FIFO concatenation of output streams and FIFO distribution over input
//! streams.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::FixedOffset;

use ephys_common::time;
use ephys_common::Measurement;

use crate::io_data::InputData;
use crate::io_data::NodeConfiguration;
use crate::io_data::OutputData;
use crate::streams::InputStream;
use crate::streams::IoStream;
use crate::streams::OutputStream;
use crate::streams::StreamError;

fn rate_compatible(
    current: &mut Option<Measurement>,
    candidate: Option<Measurement>,
) -> Result<(), StreamError> {
    match (current.as_ref(), candidate) {
        (Some(r), Some(c)) => {
            if *r != c {
                return Err(StreamError::SampleRateMismatch);
            }
        }
        (None, Some(c)) => *current = Some(c),
        _ => {}
    }
    Ok(())
}

/// Child output streams play back to back. A child leaves `unended` once
/// fully pulled and leaves `ended` once its samples are all confirmed on the
/// wire.
pub struct SequenceOutputStream {
    state: Mutex<OutputSequenceState>,
}

struct OutputSequenceState {
    unended: VecDeque<Arc<dyn OutputStream>>,
    ended: VecDeque<Arc<dyn OutputStream>>,
    sample_rate: Option<Measurement>,
    is_adding_completed: bool,
    position: Duration,
    output_position: Duration,
}

impl SequenceOutputStream {
    pub fn new() -> Self {
        SequenceOutputStream {
            state: Mutex::new(OutputSequenceState {
                unended: VecDeque::new(),
                ended: VecDeque::new(),
                sample_rate: None,
                is_adding_completed: false,
                position: Duration::from_secs(0),
                output_position: Duration::from_secs(0),
            }),
        }
    }

    pub fn add_stream(&self, stream: Arc<dyn OutputStream>) -> Result<(), StreamError> {
        if Arc::as_ptr(&stream) as *const () == self as *const Self as *const () {
            return Err(StreamError::SelfAddition);
        }
        let mut state = self.state.lock().unwrap();
        if state.is_adding_completed {
            return Err(StreamError::AddAfterCompletion);
        }
        rate_compatible(&mut state.sample_rate, stream.sample_rate())?;
        state.unended.push_back(stream);
        Ok(())
    }

    pub fn complete_adding(&self) {
        self.state.lock().unwrap().is_adding_completed = true;
    }

    pub fn is_adding_completed(&self) -> bool {
        self.state.lock().unwrap().is_adding_completed
    }
}

impl Default for SequenceOutputStream {
    fn default() -> Self {
        SequenceOutputStream::new()
    }
}

impl IoStream for SequenceOutputStream {
    fn sample_rate(&self) -> Option<Measurement> {
        self.state.lock().unwrap().sample_rate.clone()
    }

    fn duration(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        if !state.is_adding_completed {
            return None;
        }
        let mut total = Duration::from_secs(0);
        for child in state.ended.iter().chain(state.unended.iter()) {
            match child.duration() {
                Some(d) => total += d,
                None => return None,
            }
        }
        Some(total)
    }

    fn position(&self) -> Duration {
        self.state.lock().unwrap().position
    }

    fn is_at_end(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.is_adding_completed && state.unended.is_empty()
    }
}

impl OutputStream for SequenceOutputStream {
    fn pull_output_data(&self, d: Duration) -> Result<OutputData, StreamError> {
        let mut state = self.state.lock().unwrap();
        if state.is_adding_completed && state.unended.is_empty() {
            return Err(StreamError::AtEnd);
        }
        let mut acc: Option<OutputData> = None;
        loop {
            let got = acc.as_ref().map_or(Duration::from_secs(0), |a| a.duration());
            if got >= d {
                break;
            }
            let child = match state.unended.front() {
                Some(c) => c.clone(),
                None => break,
            };
            let pulled = child.pull_output_data(d - got)?;
            let pulled_duration = pulled.duration();
            acc = Some(match acc {
                Some(a) => a.concat(&pulled)?,
                None => pulled,
            });
            if child.is_at_end() {
                let finished = state.unended.pop_front().unwrap();
                state.ended.push_back(finished);
            }
            if pulled_duration == Duration::from_secs(0) {
                break;
            }
        }
        let mut acc = acc.ok_or(StreamError::AtEnd)?;
        acc.is_last = acc.is_last && state.is_adding_completed && state.unended.is_empty();
        state.position += acc.duration();
        Ok(acc)
    }

    fn did_output_data(
        &self,
        output_time: DateTime<FixedOffset>,
        span: Duration,
        node_configurations: &[NodeConfiguration],
    ) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        if state.output_position + span > state.position {
            return Err(StreamError::OutputOverrun);
        }
        // Slice the span over children oldest-first by each child's unoutput
        // pulled samples.
        let mut remaining = span;
        for child in state.ended.iter().chain(state.unended.iter()) {
            if remaining == Duration::from_secs(0) {
                break;
            }
            let unoutput = child
                .position()
                .checked_sub(child.output_position())
                .unwrap_or_default();
            let slice = unoutput.min(remaining);
            if slice > Duration::from_secs(0) {
                child.did_output_data(output_time, slice, node_configurations)?;
                remaining -= slice;
            }
        }
        if remaining > Duration::from_secs(0) {
            return Err(StreamError::OutputOverrun);
        }
        state.output_position += span;
        while state
            .ended
            .front()
            .map_or(false, |c| c.is_output_at_end())
        {
            state.ended.pop_front();
        }
        Ok(())
    }

    fn output_position(&self) -> Duration {
        self.state.lock().unwrap().output_position
    }

    fn is_output_at_end(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.is_adding_completed && state.unended.is_empty() && state.ended.is_empty()
    }
}

/// Pushed data splits across child input streams at each child's remaining
/// duration; a filled child is evicted.
pub struct SequenceInputStream {
    state: Mutex<InputSequenceState>,
}

struct InputSequenceState {
    streams: VecDeque<Arc<dyn InputStream>>,
    sample_rate: Option<Measurement>,
    is_adding_completed: bool,
    position: Duration,
}

impl SequenceInputStream {
    pub fn new() -> Self {
        SequenceInputStream {
            state: Mutex::new(InputSequenceState {
                streams: VecDeque::new(),
                sample_rate: None,
                is_adding_completed: false,
                position: Duration::from_secs(0),
            }),
        }
    }

    pub fn add_stream(&self, stream: Arc<dyn InputStream>) -> Result<(), StreamError> {
        if Arc::as_ptr(&stream) as *const () == self as *const Self as *const () {
            return Err(StreamError::SelfAddition);
        }
        let mut state = self.state.lock().unwrap();
        if state.is_adding_completed {
            return Err(StreamError::AddAfterCompletion);
        }
        rate_compatible(&mut state.sample_rate, stream.sample_rate())?;
        state.streams.push_back(stream);
        Ok(())
    }

    pub fn complete_adding(&self) {
        self.state.lock().unwrap().is_adding_completed = true;
    }
}

impl Default for SequenceInputStream {
    fn default() -> Self {
        SequenceInputStream::new()
    }
}

impl IoStream for SequenceInputStream {
    fn sample_rate(&self) -> Option<Measurement> {
        self.state.lock().unwrap().sample_rate.clone()
    }

    fn duration(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        if !state.is_adding_completed {
            return None;
        }
        let mut total = state.position;
        for child in state.streams.iter() {
            match child.duration() {
                Some(d) => total += d - child.position(),
                None => return None,
            }
        }
        Some(total)
    }

    fn position(&self) -> Duration {
        self.state.lock().unwrap().position
    }

    fn is_at_end(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.is_adding_completed && state.streams.is_empty()
    }
}

impl InputStream for SequenceInputStream {
    fn push_input_data(&self, data: InputData) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        let mut data = data;
        while !data.data.is_empty() {
            let child = match state.streams.front() {
                Some(c) => c.clone(),
                None => return Err(StreamError::PushOverrun),
            };
            if child.is_at_end() {
                state.streams.pop_front();
                continue;
            }
            let remaining = match child.duration() {
                Some(total) => total.checked_sub(child.position()).unwrap_or_default(),
                None => {
                    // an indefinite child absorbs everything that is left
                    state.position += data.duration();
                    child.push_input_data(data)?;
                    break;
                }
            };
            let (head, rest) = data.split_data(remaining);
            // sub-sample space rounds up to the child's one-sample slack
            let (head, rest) = if head.data.is_empty() {
                data.split_data(remaining + time::one_sample(data.rate_hz()))
            } else {
                (head, rest)
            };
            let pushed = head.duration();
            child.push_input_data(head)?;
            state.position += pushed;
            if child.is_at_end() {
                state.streams.pop_front();
            }
            if rest.data.is_empty() {
                break;
            }
            data = rest;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;
    use indexmap::IndexMap;

    use crate::stimulus::Background;
    use crate::stimulus::RenderedStimulus;
    use crate::streams::BackgroundOutputStream;
    use crate::streams::NullInputStream;
    use crate::streams::StimulusOutputStream;

    fn t0() -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(2022, 1, 1, 12, 0, 0).unwrap().fixed_offset()
    }

    fn background_stream(ms: u64, rate: f64) -> Arc<dyn OutputStream> {
        let background = Arc::new(Background::new(
            Measurement::base(0.0, "mV"),
            Measurement::hertz(rate),
        ));
        Arc::new(BackgroundOutputStream::bounded(
            background,
            Duration::from_millis(ms),
        ))
    }

    fn stimulus_stream(samples: usize, rate: f64) -> Arc<dyn OutputStream> {
        let data = OutputData::new(
            (0..samples).map(|i| Measurement::base(i as f64, "mV")).collect(),
            Measurement::hertz(rate),
            false,
        )
        .unwrap();
        let stimulus =
            RenderedStimulus::new("edu.example.ramp", IndexMap::new(), data, None).unwrap();
        Arc::new(StimulusOutputStream::new(
            Arc::new(stimulus),
            Duration::from_millis(10),
        ))
    }

    fn null_stream(ms: u64, rate: f64) -> Arc<dyn InputStream> {
        Arc::new(NullInputStream::new(
            Some(Measurement::hertz(rate)),
            Some(Duration::from_millis(ms)),
        ))
    }

    fn input(ms: u64, rate: f64) -> InputData {
        let n = (ms as f64 * rate / 1000.0) as usize;
        InputData::new(
            vec![Measurement::base(0.0, "mV"); n],
            Measurement::hertz(rate),
            t0(),
        )
        .unwrap()
    }

    #[test]
    fn output_sequence_concatenates_children() {
        let sequence = SequenceOutputStream::new();
        sequence.add_stream(stimulus_stream(200, 10_000.0)).unwrap();
        sequence.add_stream(stimulus_stream(300, 10_000.0)).unwrap();
        sequence.complete_adding();
        assert_eq!(sequence.duration(), Some(Duration::from_millis(50)));

        // 30 ms crosses the 20 ms boundary between the children
        let first = sequence.pull_output_data(Duration::from_millis(30)).unwrap();
        assert_eq!(first.data.len(), 300);
        assert_eq!(first.data[200].base_quantity(), 0.0);
        assert!(!first.is_last);
        let second = sequence.pull_output_data(Duration::from_millis(30)).unwrap();
        assert_eq!(second.data.len(), 200);
        assert!(second.is_last);
        assert!(sequence.is_at_end());
        assert!(matches!(
            sequence.pull_output_data(Duration::from_millis(1)),
            Err(StreamError::AtEnd)
        ));
    }

    #[test]
    fn output_sequence_slices_confirmations_across_children() {
        let a = stimulus_stream(200, 10_000.0);
        let b = stimulus_stream(300, 10_000.0);
        let sequence = SequenceOutputStream::new();
        sequence.add_stream(a.clone()).unwrap();
        sequence.add_stream(b.clone()).unwrap();
        sequence.complete_adding();
        sequence.pull_output_data(Duration::from_millis(30)).unwrap();

        sequence
            .did_output_data(t0(), Duration::from_millis(25), &[])
            .unwrap();
        assert_eq!(a.output_position(), Duration::from_millis(20));
        assert_eq!(b.output_position(), Duration::from_millis(5));
        assert_eq!(sequence.output_position(), Duration::from_millis(25));
        assert!(a.is_output_at_end());

        // confirming beyond what was pulled fails
        assert!(matches!(
            sequence.did_output_data(t0(), Duration::from_millis(10), &[]),
            Err(StreamError::OutputOverrun)
        ));
        sequence
            .did_output_data(t0(), Duration::from_millis(5), &[])
            .unwrap();
        assert!(!sequence.is_output_at_end());
        sequence.pull_output_data(Duration::from_millis(30)).unwrap();
        sequence
            .did_output_data(t0(), Duration::from_millis(20), &[])
            .unwrap();
        assert!(sequence.is_output_at_end());
    }

    #[test]
    fn adding_is_checked() {
        let sequence = SequenceOutputStream::new();
        sequence.add_stream(background_stream(10, 10_000.0)).unwrap();
        assert!(matches!(
            sequence.add_stream(background_stream(10, 500.0)),
            Err(StreamError::SampleRateMismatch)
        ));
        sequence.complete_adding();
        assert!(matches!(
            sequence.add_stream(background_stream(10, 10_000.0)),
            Err(StreamError::AddAfterCompletion)
        ));
    }

    #[test]
    fn sequence_cannot_contain_itself() {
        let sequence = Arc::new(SequenceOutputStream::new());
        let as_stream: Arc<dyn OutputStream> = sequence.clone();
        assert!(matches!(
            sequence.add_stream(as_stream),
            Err(StreamError::SelfAddition)
        ));
    }

    #[test]
    fn input_sequence_splits_a_push_across_children() {
        let a = null_stream(50, 10_000.0);
        let b = null_stream(50, 10_000.0);
        let sequence = SequenceInputStream::new();
        sequence.add_stream(a.clone()).unwrap();
        sequence.add_stream(b.clone()).unwrap();
        sequence.complete_adding();

        sequence.push_input_data(input(80, 10_000.0)).unwrap();
        assert_eq!(a.position(), Duration::from_millis(50));
        assert!(a.is_at_end());
        assert_eq!(b.position(), Duration::from_millis(30));
        assert_eq!(sequence.position(), Duration::from_millis(80));
        // the first child was evicted, only 20 ms of room remains
        assert_eq!(sequence.duration(), Some(Duration::from_millis(100)));

        sequence.push_input_data(input(20, 10_000.0)).unwrap();
        assert!(sequence.is_at_end());
        assert!(matches!(
            sequence.push_input_data(input(10, 10_000.0)),
            Err(StreamError::PushOverrun)
        ));
    }
}
