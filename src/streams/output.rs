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

//! Output streams backed by a stimulus or by a constant background value.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::FixedOffset;

use ephys_common::time;
use ephys_common::Measurement;

use crate::io_data::NodeConfiguration;
use crate::io_data::OutputData;
use crate::stimulus::Background;
use crate::stimulus::Stimulus;
use crate::stimulus::StimulusBlocks;
use crate::streams::IoStream;
use crate::streams::OutputStream;
use crate::streams::StreamError;

/// Pulls through a stimulus's lazy block sequence. A pull may splice several
/// underlying blocks and splits at the requested span; the tail waits for the
/// next pull.
pub struct StimulusOutputStream {
    stimulus: Arc<dyn Stimulus>,
    state: Mutex<PullState>,
}

struct PullState {
    blocks: StimulusBlocks,
    leftover: Option<OutputData>,
    exhausted: bool,
    position: Duration,
    output_position: Duration,
}

impl StimulusOutputStream {
    pub fn new(stimulus: Arc<dyn Stimulus>, block_duration: Duration) -> Self {
        let blocks = stimulus.data_blocks(block_duration);
        StimulusOutputStream {
            stimulus,
            state: Mutex::new(PullState {
                blocks,
                leftover: None,
                exhausted: false,
                position: Duration::from_secs(0),
                output_position: Duration::from_secs(0),
            }),
        }
    }

    pub fn stimulus(&self) -> &Arc<dyn Stimulus> {
        &self.stimulus
    }

    fn ended(&self, state: &PullState) -> bool {
        if state.leftover.is_some() {
            return false;
        }
        if state.exhausted {
            return true;
        }
        match self.stimulus.duration() {
            Some(d) => state.position >= d,
            None => false,
        }
    }
}

impl IoStream for StimulusOutputStream {
    fn sample_rate(&self) -> Option<Measurement> {
        Some(self.stimulus.sample_rate())
    }

    fn duration(&self) -> Option<Duration> {
        self.stimulus.duration()
    }

    fn position(&self) -> Duration {
        self.state.lock().unwrap().position
    }

    fn is_at_end(&self) -> bool {
        let state = self.state.lock().unwrap();
        self.ended(&state)
    }
}

impl OutputStream for StimulusOutputStream {
    fn pull_output_data(&self, d: Duration) -> Result<OutputData, StreamError> {
        let mut state = self.state.lock().unwrap();
        if self.ended(&state) {
            return Err(StreamError::AtEnd);
        }
        let mut acc = state.leftover.take();
        loop {
            let got = acc.as_ref().map_or(Duration::from_secs(0), |a| a.duration());
            if got >= d || state.exhausted {
                break;
            }
            match state.blocks.next() {
                Some(Ok(block)) => {
                    acc = Some(match acc {
                        Some(a) => a.concat(&block)?,
                        None => block,
                    });
                }
                Some(Err(e)) => return Err(StreamError::Stimulus(e)),
                None => state.exhausted = true,
            }
        }
        let acc = acc.ok_or(StreamError::AtEnd)?;
        let (head, rest) = acc.split_data(d);
        if head.data.is_empty() {
            return Err(StreamError::InvalidPullDuration(d));
        }
        if !rest.data.is_empty() {
            state.leftover = Some(rest);
        }
        state.position += head.duration();
        Ok(head)
    }

    fn did_output_data(
        &self,
        output_time: DateTime<FixedOffset>,
        span: Duration,
        node_configurations: &[NodeConfiguration],
    ) -> Result<(), StreamError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.output_position + span > state.position {
                return Err(StreamError::OutputOverrun);
            }
            state.output_position += span;
        }
        self.stimulus
            .did_output_data(output_time, span, node_configurations)?;
        Ok(())
    }

    fn output_position(&self) -> Duration {
        self.state.lock().unwrap().output_position
    }

    fn is_output_at_end(&self) -> bool {
        let state = self.state.lock().unwrap();
        self.ended(&state) && state.output_position >= state.position
    }
}

/// Synthesizes constant samples at the background value. Bounded when the
/// epoch has a duration, unbounded for the idle channel case.
pub struct BackgroundOutputStream {
    background: Arc<Background>,
    duration: Option<Duration>,
    state: Mutex<BackgroundState>,
}

struct BackgroundState {
    position: Duration,
    output_position: Duration,
}

impl BackgroundOutputStream {
    pub fn bounded(background: Arc<Background>, duration: Duration) -> Self {
        BackgroundOutputStream {
            background,
            duration: Some(duration),
            state: Mutex::new(BackgroundState {
                position: Duration::from_secs(0),
                output_position: Duration::from_secs(0),
            }),
        }
    }

    pub fn unbounded(background: Arc<Background>) -> Self {
        BackgroundOutputStream {
            background,
            duration: None,
            state: Mutex::new(BackgroundState {
                position: Duration::from_secs(0),
                output_position: Duration::from_secs(0),
            }),
        }
    }

    pub fn background(&self) -> &Arc<Background> {
        &self.background
    }

    fn rate_hz(&self) -> f64 {
        self.background.sample_rate.base_quantity()
    }
}

impl IoStream for BackgroundOutputStream {
    fn sample_rate(&self) -> Option<Measurement> {
        Some(self.background.sample_rate.clone())
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn position(&self) -> Duration {
        self.state.lock().unwrap().position
    }

    fn is_at_end(&self) -> bool {
        match self.duration {
            Some(d) => self.state.lock().unwrap().position >= d,
            None => false,
        }
    }
}

impl OutputStream for BackgroundOutputStream {
    fn pull_output_data(&self, d: Duration) -> Result<OutputData, StreamError> {
        let mut state = self.state.lock().unwrap();
        let span = match self.duration {
            Some(total) => {
                if state.position >= total {
                    return Err(StreamError::AtEnd);
                }
                d.min(total - state.position)
            }
            None => d,
        };
        let n = time::samples_in_duration(span, self.rate_hz());
        if n == 0 {
            return Err(StreamError::InvalidPullDuration(d));
        }
        let samples = vec![self.background.value.clone(); n as usize];
        let produced = time::duration_of_samples(n, self.rate_hz());
        let is_last = match self.duration {
            Some(total) => state.position + produced >= total,
            None => false,
        };
        let data = OutputData::new(samples, self.background.sample_rate.clone(), is_last)?;
        state.position += produced;
        Ok(data)
    }

    fn did_output_data(
        &self,
        output_time: DateTime<FixedOffset>,
        span: Duration,
        node_configurations: &[NodeConfiguration],
    ) -> Result<(), StreamError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.output_position + span > state.position {
                return Err(StreamError::OutputOverrun);
            }
            state.output_position += span;
        }
        self.background
            .did_output_data(output_time, span, node_configurations)?;
        Ok(())
    }

    fn output_position(&self) -> Duration {
        self.state.lock().unwrap().output_position
    }

    fn is_output_at_end(&self) -> bool {
        let state = self.state.lock().unwrap();
        match self.duration {
            Some(d) => state.position >= d && state.output_position >= state.position,
            None => false,
        }
    }
}
