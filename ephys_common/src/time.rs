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

//! Tick-precision time math shared by the streams and the persistor.
//!
//! Spans are kept as `std::time::Duration` but all sample accounting rounds to
//! 100 ns ticks, and wall-clock instants serialize as ticks of the 0001-01-01
//! epoch so containers interoperate with the reference persistence layout.

use std::time::Duration;

use chrono::DateTime;
use chrono::FixedOffset;
use chrono::Offset;
use chrono::TimeZone;

/// 100 ns ticks.
pub const TICKS_PER_SECOND: i64 = 10_000_000;
pub const NANOS_PER_TICK: u64 = 100;

/// Seconds between 0001-01-01T00:00:00 and the unix epoch.
const EPOCH_OFFSET_SECONDS: i64 = 62_135_596_800;

/// Guard against float fuzz when a span is an exact multiple of the sample
/// period; well below one tick of one sample at any practical rate.
const SAMPLE_EPSILON: f64 = 1e-6;

pub fn duration_to_ticks(d: Duration) -> i64 {
    (d.as_nanos() / u128::from(NANOS_PER_TICK)) as i64
}

pub fn ticks_to_duration(ticks: i64) -> Duration {
    Duration::from_nanos(ticks as u64 * NANOS_PER_TICK)
}

/// Span covered by `count` samples at `rate_hz`, rounded up to a whole tick.
pub fn duration_of_samples(count: u64, rate_hz: f64) -> Duration {
    let ticks = (count as f64 * TICKS_PER_SECOND as f64 / rate_hz).ceil();
    Duration::from_nanos(ticks as u64 * NANOS_PER_TICK)
}

/// Samples needed to cover `d` at `rate_hz` (partial sample counts as one).
pub fn samples_in_duration(d: Duration, rate_hz: f64) -> u64 {
    let exact = duration_to_ticks(d) as f64 * rate_hz / TICKS_PER_SECOND as f64;
    (exact - SAMPLE_EPSILON).ceil().max(0.0) as u64
}

/// Largest sample count whose span does not exceed `d` at `rate_hz`.
pub fn samples_that_fit(d: Duration, rate_hz: f64) -> u64 {
    let exact = duration_to_ticks(d) as f64 * rate_hz / TICKS_PER_SECOND as f64;
    (exact + SAMPLE_EPSILON).floor() as u64
}

/// Span of a single sample, the tolerance used by input bounds checks.
pub fn one_sample(rate_hz: f64) -> Duration {
    duration_of_samples(1, rate_hz)
}

/// Ticks of 0001-01-01 UTC, the timeline form stored in containers.
pub fn datetime_to_ticks(t: &DateTime<FixedOffset>) -> i64 {
    (t.timestamp() + EPOCH_OFFSET_SECONDS) * TICKS_PER_SECOND
        + i64::from(t.timestamp_subsec_nanos() / NANOS_PER_TICK as u32)
}

pub fn datetime_offset_hours(t: &DateTime<FixedOffset>) -> f64 {
    f64::from(t.offset().fix().local_minus_utc()) / 3600.0
}

pub fn datetime_from_ticks(ticks: i64, offset_hours: f64) -> DateTime<FixedOffset> {
    let unix_ticks = ticks - EPOCH_OFFSET_SECONDS * TICKS_PER_SECOND;
    let secs = unix_ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (unix_ticks.rem_euclid(TICKS_PER_SECOND) as u32) * NANOS_PER_TICK as u32;
    let offset = FixedOffset::east_opt((offset_hours * 3600.0).round() as i32).unwrap();
    offset.timestamp_opt(secs, nanos).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sample_counts_round_trip_at_10khz() {
        assert_eq!(samples_in_duration(Duration::from_millis(50), 10_000.0), 500);
        assert_eq!(samples_that_fit(Duration::from_millis(50), 10_000.0), 500);
        assert_eq!(duration_of_samples(500, 10_000.0), Duration::from_millis(50));
    }

    #[test]
    fn partial_samples_round_up() {
        // 1.5 sample periods at 1 kHz
        let d = Duration::from_micros(1500);
        assert_eq!(samples_in_duration(d, 1000.0), 2);
        assert_eq!(samples_that_fit(d, 1000.0), 1);
    }

    #[test]
    fn duration_of_samples_rounds_to_tick() {
        // 1 sample at 3 Hz is 3333333.3... ticks, rounded up
        let d = duration_of_samples(1, 3.0);
        assert_eq!(duration_to_ticks(d), 3_333_334);
    }

    #[test]
    fn ticks_round_trip_with_offset() {
        let t = FixedOffset::east_opt(-5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2022, 6, 23, 14, 32, 34)
            .unwrap();
        let ticks = datetime_to_ticks(&t);
        let hours = datetime_offset_hours(&t);
        assert_eq!(hours, -5.0);
        let back = datetime_from_ticks(ticks, hours);
        assert_eq!(back, t);
        assert_eq!(datetime_offset_hours(&back), -5.0);
    }
}
