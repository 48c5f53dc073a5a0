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

//! Input streams: the response-backed sink and the discarding sink.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use ephys_common::time;
use ephys_common::Measurement;

use crate::io_data::InputData;
use crate::response::Response;
use crate::streams::InputStream;
use crate::streams::IoStream;
use crate::streams::StreamError;

fn check_push_bounds(
    position: Duration,
    duration: Option<Duration>,
    data: &InputData,
) -> Result<(), StreamError> {
    if let Some(total) = duration {
        let remaining = total.checked_sub(position).unwrap_or_default();
        // one sample of slack, hardware rounds captures up to whole samples
        if data.duration() > remaining + time::one_sample(data.rate_hz()) {
            return Err(StreamError::PushOverrun);
        }
    }
    Ok(())
}

/// Advances its position and drops the samples.
pub struct NullInputStream {
    sample_rate: Option<Measurement>,
    duration: Option<Duration>,
    position: Mutex<Duration>,
}

impl NullInputStream {
    pub fn new(sample_rate: Option<Measurement>, duration: Option<Duration>) -> Self {
        NullInputStream {
            sample_rate,
            duration,
            position: Mutex::new(Duration::from_secs(0)),
        }
    }
}

impl IoStream for NullInputStream {
    fn sample_rate(&self) -> Option<Measurement> {
        self.sample_rate.clone()
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn position(&self) -> Duration {
        *self.position.lock().unwrap()
    }

    fn is_at_end(&self) -> bool {
        match self.duration {
            Some(d) => *self.position.lock().unwrap() >= d,
            None => false,
        }
    }
}

impl InputStream for NullInputStream {
    fn push_input_data(&self, data: InputData) -> Result<(), StreamError> {
        let mut position = self.position.lock().unwrap();
        check_push_bounds(*position, self.duration, &data)?;
        *position += data.duration();
        Ok(())
    }
}

/// Appends pushed blocks to an epoch's `Response`, bounded by the epoch
/// duration.
pub struct ResponseInputStream {
    response: Arc<Response>,
    sample_rate: Measurement,
    duration: Option<Duration>,
    position: Mutex<Duration>,
}

impl ResponseInputStream {
    pub fn new(
        response: Arc<Response>,
        sample_rate: Measurement,
        duration: Option<Duration>,
    ) -> Self {
        ResponseInputStream {
            response,
            sample_rate,
            duration,
            position: Mutex::new(Duration::from_secs(0)),
        }
    }

    pub fn response(&self) -> &Arc<Response> {
        &self.response
    }
}

impl IoStream for ResponseInputStream {
    fn sample_rate(&self) -> Option<Measurement> {
        Some(self.sample_rate.clone())
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn position(&self) -> Duration {
        *self.position.lock().unwrap()
    }

    fn is_at_end(&self) -> bool {
        match self.duration {
            Some(d) => *self.position.lock().unwrap() >= d,
            None => false,
        }
    }
}

impl InputStream for ResponseInputStream {
    fn push_input_data(&self, data: InputData) -> Result<(), StreamError> {
        if data.sample_rate != self.sample_rate {
            return Err(StreamError::SampleRateMismatch);
        }
        let mut position = self.position.lock().unwrap();
        check_push_bounds(*position, self.duration, &data)?;
        *position += data.duration();
        self.response.append(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use chrono::FixedOffset;
    use chrono::TimeZone;
    use chrono::Utc;

    fn t0() -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(2022, 1, 1, 12, 0, 0).unwrap().fixed_offset()
    }

    fn block(n: usize, rate: f64) -> InputData {
        InputData::new(
            vec![Measurement::base(0.1, "mV"); n],
            Measurement::hertz(rate),
            t0(),
        )
        .unwrap()
    }

    #[test]
    fn null_stream_advances_without_retaining() {
        let stream = NullInputStream::new(
            Some(Measurement::hertz(10_000.0)),
            Some(Duration::from_millis(50)),
        );
        stream.push_input_data(block(300, 10_000.0)).unwrap();
        assert_eq!(stream.position(), Duration::from_millis(30));
        assert!(!stream.is_at_end());
        stream.push_input_data(block(200, 10_000.0)).unwrap();
        assert!(stream.is_at_end());
        assert!(matches!(
            stream.push_input_data(block(100, 10_000.0)),
            Err(StreamError::PushOverrun)
        ));
    }

    #[test]
    fn response_stream_appends_to_the_response() {
        let response = Arc::new(Response::new());
        let stream = ResponseInputStream::new(
            response.clone(),
            Measurement::hertz(10_000.0),
            Some(Duration::from_millis(100)),
        );
        stream.push_input_data(block(500, 10_000.0)).unwrap();
        stream.push_input_data(block(500, 10_000.0)).unwrap();
        assert_eq!(response.duration(), Duration::from_millis(100));
        assert!(stream.is_at_end());
    }

    #[test]
    fn response_stream_rejects_rate_mismatch() {
        let stream = ResponseInputStream::new(
            Arc::new(Response::new()),
            Measurement::hertz(10_000.0),
            None,
        );
        assert!(matches!(
            stream.push_input_data(block(10, 500.0)),
            Err(StreamError::SampleRateMismatch)
        ));
    }

    #[test]
    fn one_sample_of_slack_is_tolerated() {
        let stream = ResponseInputStream::new(
            Arc::new(Response::new()),
            Measurement::hertz(10_000.0),
            Some(Duration::from_micros(50)), // half a sample period
        );
        // a single whole sample still fits within the epsilon
        stream.push_input_data(block(1, 10_000.0)).unwrap();
        assert!(stream.is_at_end());
    }
}
