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

//! The pull/push interface the acquisition loop drives.
//!
//! Output streams hand sample blocks to the loop and are told when those
//! samples reached the wire; input streams receive captured blocks. Every
//! public operation of every stream serializes behind that stream's one lock,
//! so streams can be shared across the loop and its worker threads as-is.

mod input;
mod output;
mod sequence;

use std::error::Error;
use std::fmt;
use std::time::Duration;

use chrono::DateTime;
use chrono::FixedOffset;

use ephys_common::Measurement;

use crate::io_data::DataError;
use crate::io_data::InputData;
use crate::io_data::NodeConfiguration;
use crate::io_data::OutputData;
use crate::stimulus::StimulusError;

pub use crate::streams::input::NullInputStream;
pub use crate::streams::input::ResponseInputStream;
pub use crate::streams::output::BackgroundOutputStream;
pub use crate::streams::output::StimulusOutputStream;
pub use crate::streams::sequence::SequenceInputStream;
pub use crate::streams::sequence::SequenceOutputStream;

/// Stream invariant violations. These are programmer errors and are never
/// retried.
#[derive(Debug)]
pub enum StreamError {
    /// Pulled or pushed past the end of a finite stream.
    AtEnd,
    /// Requested span is shorter than one sample period.
    InvalidPullDuration(Duration),
    /// Child streams of a sequence must share a sample rate.
    SampleRateMismatch,
    /// A sequence cannot contain itself.
    SelfAddition,
    /// No streams can join a sequence once adding completed.
    AddAfterCompletion,
    /// A wire confirmation would move `output_position` past `position`.
    OutputOverrun,
    /// A push would exceed the stream's remaining duration.
    PushOverrun,
    Stimulus(StimulusError),
    Data(DataError),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamError::AtEnd => write!(f, "Stream is at its end"),
            StreamError::InvalidPullDuration(d) => {
                write!(f, "Pull of {:?} is shorter than one sample", d)
            }
            StreamError::SampleRateMismatch => write!(f, "Stream sample rates do not match"),
            StreamError::SelfAddition => write!(f, "A sequence cannot contain itself"),
            StreamError::AddAfterCompletion => write!(f, "Sequence adding already completed"),
            StreamError::OutputOverrun => {
                write!(f, "Output confirmation exceeds pulled position")
            }
            StreamError::PushOverrun => write!(f, "Push exceeds remaining stream duration"),
            StreamError::Stimulus(e) => write!(f, "{}", e),
            StreamError::Data(e) => write!(f, "{}", e),
        }
    }
}

impl Error for StreamError {}

impl From<StimulusError> for StreamError {
    fn from(e: StimulusError) -> Self {
        StreamError::Stimulus(e)
    }
}

impl From<DataError> for StreamError {
    fn from(e: DataError) -> Self {
        StreamError::Data(e)
    }
}

/// What every stream exposes to the loop, regardless of direction.
pub trait IoStream: Send + Sync {
    fn sample_rate(&self) -> Option<Measurement>;
    /// `None` means indefinite; indefinite streams are never at their end.
    fn duration(&self) -> Option<Duration>;
    /// Total span pulled from or pushed into this stream; monotone.
    fn position(&self) -> Duration;
    fn is_at_end(&self) -> bool;
}

pub trait OutputStream: IoStream {
    /// Produces the next block with `0 < duration <= d` and advances
    /// `position` by the block's span.
    fn pull_output_data(&self, d: Duration) -> Result<OutputData, StreamError>;

    /// Confirms that `span` of previously pulled samples reached the wire;
    /// `output_position + span` must not pass `position`.
    fn did_output_data(
        &self,
        output_time: DateTime<FixedOffset>,
        span: Duration,
        node_configurations: &[NodeConfiguration],
    ) -> Result<(), StreamError>;

    fn output_position(&self) -> Duration;
    fn is_output_at_end(&self) -> bool;
}

pub trait InputStream: IoStream {
    fn push_input_data(&self, data: InputData) -> Result<(), StreamError>;
}
