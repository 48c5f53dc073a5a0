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

//! Stimuli are lazy producers of `OutputData` blocks.
//!
//! A stimulus never materializes its whole waveform up front; the stream layer
//! walks `data_blocks` one block at a time and reports wire progress back
//! through `did_output_data`, which every stimulus logs as append-only output
//! spans.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::FixedOffset;
use genawaiter::sync::Gen;
use indexmap::IndexMap;

use ephys_common::time;
use ephys_common::Measurement;
use ephys_common::Value;

use crate::io_data::ConfigurationSpan;
use crate::io_data::DataError;
use crate::io_data::NodeConfiguration;
use crate::io_data::OutputData;

#[derive(Debug)]
pub enum StimulusError {
    /// A rendered block's unit does not match the stimulus unit.
    UnitMismatch { expected: String, got: String },
    /// A rendered block's sample rate does not match the stimulus rate.
    SampleRateMismatch,
    /// `did_output_data` times must be monotone non-decreasing.
    OutOfSequenceOutputTime,
    /// Combined sources must agree on duration, rate and units.
    MismatchedSources(String),
    /// A stimulus cannot render from an empty sample buffer.
    EmptyData,
    Data(DataError),
}

impl fmt::Display for StimulusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StimulusError::UnitMismatch { expected, got } => {
                write!(f, "Rendered block in {} but stimulus is in {}", got, expected)
            }
            StimulusError::SampleRateMismatch => {
                write!(f, "Rendered block sample rate does not match the stimulus")
            }
            StimulusError::OutOfSequenceOutputTime => {
                write!(f, "Output time went backwards")
            }
            StimulusError::MismatchedSources(what) => {
                write!(f, "Combined sources disagree on {}", what)
            }
            StimulusError::EmptyData => write!(f, "Stimulus has no samples to render"),
            StimulusError::Data(e) => write!(f, "{}", e),
        }
    }
}

impl Error for StimulusError {}

impl From<DataError> for StimulusError {
    fn from(e: DataError) -> Self {
        StimulusError::Data(e)
    }
}

pub type StimulusBlocks = Box<dyn Iterator<Item = Result<OutputData, StimulusError>> + Send>;

/// Append-only record of what reached the wire, shared by stimuli and
/// backgrounds. The lock also guards the completion view.
#[derive(Debug, Default)]
pub struct OutputLog {
    state: Mutex<OutputLogState>,
}

#[derive(Debug, Default)]
struct OutputLogState {
    spans: Vec<ConfigurationSpan>,
    start_time: Option<DateTime<FixedOffset>>,
    last_output_time: Option<DateTime<FixedOffset>>,
}

impl OutputLog {
    pub fn new() -> Self {
        OutputLog::default()
    }

    pub fn append(
        &self,
        output_time: DateTime<FixedOffset>,
        span: Duration,
        node_configurations: &[NodeConfiguration],
    ) -> Result<(), StimulusError> {
        let mut state = self.state.lock().unwrap();
        if let Some(last) = state.last_output_time {
            if output_time < last {
                return Err(StimulusError::OutOfSequenceOutputTime);
            }
        }
        if state.start_time.is_none() {
            state.start_time = Some(output_time);
        }
        state.last_output_time = Some(output_time);
        state
            .spans
            .push(ConfigurationSpan::new(span, node_configurations.to_vec()));
        Ok(())
    }

    pub fn spans(&self) -> Vec<ConfigurationSpan> {
        self.state.lock().unwrap().spans.clone()
    }

    pub fn start_time(&self) -> Option<DateTime<FixedOffset>> {
        self.state.lock().unwrap().start_time
    }

    pub fn total_output(&self) -> Duration {
        self.state
            .lock()
            .unwrap()
            .spans
            .iter()
            .map(|s| s.time)
            .sum()
    }
}

/// A producer of output samples for one device within one epoch.
pub trait Stimulus: Send + Sync {
    /// Reverse-DNS identifier of the generating algorithm.
    fn stimulus_id(&self) -> &str;
    fn parameters(&self) -> &IndexMap<String, Value>;
    fn sample_rate(&self) -> Measurement;
    fn units(&self) -> &str;
    /// `None` means the stimulus is indefinite.
    fn duration(&self) -> Option<Duration>;
    /// Samples to persist verbatim, when the waveform cannot be regenerated
    /// from `stimulus_id` and `parameters` alone.
    fn data_snapshot(&self) -> Option<Vec<Measurement>> {
        None
    }
    /// Lazy block sequence; each block spans at most `block_duration`.
    fn data_blocks(&self, block_duration: Duration) -> StimulusBlocks;
    fn output_log(&self) -> &OutputLog;

    fn did_output_data(
        &self,
        output_time: DateTime<FixedOffset>,
        span: Duration,
        node_configurations: &[NodeConfiguration],
    ) -> Result<(), StimulusError> {
        self.output_log().append(output_time, span, node_configurations)
    }

    fn start_time(&self) -> Option<DateTime<FixedOffset>> {
        self.output_log().start_time()
    }

    fn output_duration(&self) -> Duration {
        self.output_log().total_output()
    }

    fn is_complete(&self) -> bool {
        match self.duration() {
            Some(d) => self.output_log().total_output() >= d,
            None => false,
        }
    }
}

/// Renders the next block for a delegated stimulus. Returning `None` ends the
/// sequence.
pub trait BlockRenderer: Send + Sync {
    fn next_block(
        &self,
        parameters: &IndexMap<String, Value>,
        block_duration: Duration,
    ) -> Option<OutputData>;
}

impl<F> BlockRenderer for F
where
    F: Fn(&IndexMap<String, Value>, Duration) -> Option<OutputData> + Send + Sync,
{
    fn next_block(
        &self,
        parameters: &IndexMap<String, Value>,
        block_duration: Duration,
    ) -> Option<OutputData> {
        self(parameters, block_duration)
    }
}

pub trait DurationCalculator: Send + Sync {
    fn duration(&self, parameters: &IndexMap<String, Value>) -> Option<Duration>;
}

impl<F> DurationCalculator for F
where
    F: Fn(&IndexMap<String, Value>) -> Option<Duration> + Send + Sync,
{
    fn duration(&self, parameters: &IndexMap<String, Value>) -> Option<Duration> {
        self(parameters)
    }
}

/// Combines equal-shape blocks from several sources into one block.
pub trait Combiner: Send + Sync {
    fn combine(&self, blocks: &[OutputData]) -> Result<OutputData, StimulusError>;
}

impl<F> Combiner for F
where
    F: Fn(&[OutputData]) -> Result<OutputData, StimulusError> + Send + Sync,
{
    fn combine(&self, blocks: &[OutputData]) -> Result<OutputData, StimulusError> {
        self(blocks)
    }
}

/// Builds a combiner that folds base quantities sample-by-sample, keeping the
/// first source's units and rate.
pub fn pointwise_combiner<F>(f: F) -> impl Combiner
where
    F: Fn(f64, f64) -> f64 + Send + Sync + Copy + 'static,
{
    move |blocks: &[OutputData]| -> Result<OutputData, StimulusError> {
        let first = blocks.first().ok_or(StimulusError::EmptyData)?;
        let mut samples = first.data.clone();
        for block in &blocks[1..] {
            if block.data.len() != samples.len() {
                return Err(StimulusError::MismatchedSources("block length".to_string()));
            }
            for (acc, s) in samples.iter_mut().zip(block.data.iter()) {
                *acc = Measurement::base(f(acc.base_quantity(), s.base_quantity()), &acc.base_unit);
            }
        }
        let is_last = blocks.iter().any(|b| b.is_last);
        Ok(OutputData::new(samples, first.sample_rate.clone(), is_last)?)
    }
}

/// A stimulus whose waveform was materialized up front. A declared duration
/// longer than the buffer repeats it; a shorter one clips it; `None` repeats
/// forever.
pub struct RenderedStimulus {
    stimulus_id: String,
    parameters: IndexMap<String, Value>,
    data: OutputData,
    units: String,
    duration: Option<Duration>,
    log: OutputLog,
}

impl RenderedStimulus {
    pub fn new(
        stimulus_id: &str,
        parameters: IndexMap<String, Value>,
        data: OutputData,
        duration: Option<Duration>,
    ) -> Result<Self, StimulusError> {
        if data.data.is_empty() {
            return Err(StimulusError::EmptyData);
        }
        let units = data.data[0].base_unit.clone();
        let duration = duration.or_else(|| Some(data.duration()));
        Ok(RenderedStimulus {
            stimulus_id: stimulus_id.to_string(),
            parameters,
            data,
            units,
            duration,
            log: OutputLog::new(),
        })
    }

    /// A rendered stimulus with no end; the buffer repeats until the epoch
    /// stops pulling.
    pub fn indefinite(
        stimulus_id: &str,
        parameters: IndexMap<String, Value>,
        data: OutputData,
    ) -> Result<Self, StimulusError> {
        if data.data.is_empty() {
            return Err(StimulusError::EmptyData);
        }
        let units = data.data[0].base_unit.clone();
        Ok(RenderedStimulus {
            stimulus_id: stimulus_id.to_string(),
            parameters,
            data,
            units,
            duration: None,
            log: OutputLog::new(),
        })
    }
}

impl Stimulus for RenderedStimulus {
    fn stimulus_id(&self) -> &str {
        &self.stimulus_id
    }

    fn parameters(&self) -> &IndexMap<String, Value> {
        &self.parameters
    }

    fn sample_rate(&self) -> Measurement {
        self.data.sample_rate.clone()
    }

    fn units(&self) -> &str {
        &self.units
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn data_snapshot(&self) -> Option<Vec<Measurement>> {
        Some(self.data.data.clone())
    }

    fn data_blocks(&self, block_duration: Duration) -> StimulusBlocks {
        let samples = self.data.data.clone();
        let sample_rate = self.data.sample_rate.clone();
        let rate_hz = self.data.rate_hz();
        let total = self.duration.map(|d| time::samples_in_duration(d, rate_hz));
        let block_samples = time::samples_that_fit(block_duration, rate_hz).max(1);
        let gen = Gen::new(move |co| async move {
            let mut produced: u64 = 0;
            let mut offset: usize = 0;
            loop {
                let n = match total {
                    Some(t) => {
                        if produced >= t {
                            break;
                        }
                        block_samples.min(t - produced)
                    }
                    None => block_samples,
                };
                let mut block = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    block.push(samples[offset].clone());
                    offset = (offset + 1) % samples.len();
                }
                produced += n;
                let is_last = total.map_or(false, |t| produced >= t);
                match OutputData::new(block, sample_rate.clone(), is_last) {
                    Ok(d) => co.yield_(Ok(d)).await,
                    Err(e) => {
                        co.yield_(Err(StimulusError::Data(e))).await;
                        break;
                    }
                }
                if is_last {
                    break;
                }
            }
        });
        Box::new(gen.into_iter())
    }

    fn output_log(&self) -> &OutputLog {
        &self.log
    }
}

/// A stimulus that defers rendering to caller-supplied procedures.
pub struct DelegatedStimulus {
    stimulus_id: String,
    parameters: IndexMap<String, Value>,
    sample_rate: Measurement,
    units: String,
    renderer: Arc<dyn BlockRenderer>,
    duration_calculator: Arc<dyn DurationCalculator>,
    log: OutputLog,
}

impl DelegatedStimulus {
    pub fn new(
        stimulus_id: &str,
        parameters: IndexMap<String, Value>,
        sample_rate: Measurement,
        units: &str,
        renderer: Arc<dyn BlockRenderer>,
        duration_calculator: Arc<dyn DurationCalculator>,
    ) -> Self {
        DelegatedStimulus {
            stimulus_id: stimulus_id.to_string(),
            parameters,
            sample_rate,
            units: units.to_string(),
            renderer,
            duration_calculator,
            log: OutputLog::new(),
        }
    }
}

impl Stimulus for DelegatedStimulus {
    fn stimulus_id(&self) -> &str {
        &self.stimulus_id
    }

    fn parameters(&self) -> &IndexMap<String, Value> {
        &self.parameters
    }

    fn sample_rate(&self) -> Measurement {
        self.sample_rate.clone()
    }

    fn units(&self) -> &str {
        &self.units
    }

    fn duration(&self) -> Option<Duration> {
        self.duration_calculator.duration(&self.parameters)
    }

    fn data_blocks(&self, block_duration: Duration) -> StimulusBlocks {
        let renderer = self.renderer.clone();
        let parameters = self.parameters.clone();
        let sample_rate = self.sample_rate.clone();
        let units = self.units.clone();
        let total = self.duration();
        let gen = Gen::new(move |co| async move {
            let mut produced = Duration::from_secs(0);
            loop {
                let block = match renderer.next_block(&parameters, block_duration) {
                    Some(b) => b,
                    None => break,
                };
                if block.sample_rate != sample_rate {
                    co.yield_(Err(StimulusError::SampleRateMismatch)).await;
                    break;
                }
                if let Some(sample) = block.data.first() {
                    if sample.base_unit != units {
                        co.yield_(Err(StimulusError::UnitMismatch {
                            expected: units.clone(),
                            got: sample.base_unit.clone(),
                        }))
                        .await;
                        break;
                    }
                }
                let mut block = block;
                let mut ends = false;
                if let Some(t) = total {
                    let remaining = t - produced;
                    if block.duration() >= remaining {
                        block = block.split_data(remaining).0;
                        block.is_last = true;
                        ends = true;
                    }
                }
                produced += block.duration();
                co.yield_(Ok(block)).await;
                if ends {
                    break;
                }
            }
        });
        Box::new(gen.into_iter())
    }

    fn output_log(&self) -> &OutputLog {
        &self.log
    }
}

/// Pointwise combination of equal-duration, equal-rate, equal-unit sources.
pub struct CombinedStimulus {
    stimulus_id: String,
    parameters: IndexMap<String, Value>,
    sources: Vec<Arc<dyn Stimulus>>,
    combiner: Arc<dyn Combiner>,
    sample_rate: Measurement,
    units: String,
    duration: Option<Duration>,
    log: OutputLog,
}

impl CombinedStimulus {
    pub fn new(
        stimulus_id: &str,
        combiner: Arc<dyn Combiner>,
        sources: Vec<Arc<dyn Stimulus>>,
    ) -> Result<Self, StimulusError> {
        let first = sources.first().ok_or(StimulusError::EmptyData)?;
        let sample_rate = first.sample_rate();
        let units = first.units().to_string();
        let duration = first.duration();
        for s in &sources[1..] {
            if s.sample_rate() != sample_rate {
                return Err(StimulusError::MismatchedSources("sample rate".to_string()));
            }
            if s.units() != units {
                return Err(StimulusError::MismatchedSources("units".to_string()));
            }
            if s.duration() != duration {
                return Err(StimulusError::MismatchedSources("duration".to_string()));
            }
        }
        // Source parameters merge under a per-source prefix.
        let mut parameters = IndexMap::new();
        for (i, s) in sources.iter().enumerate() {
            for (key, value) in s.parameters() {
                parameters.insert(format!("s{}_{}", i, key), value.clone());
            }
        }
        Ok(CombinedStimulus {
            stimulus_id: stimulus_id.to_string(),
            parameters,
            sources,
            combiner,
            sample_rate,
            units,
            duration,
            log: OutputLog::new(),
        })
    }
}

impl Stimulus for CombinedStimulus {
    fn stimulus_id(&self) -> &str {
        &self.stimulus_id
    }

    fn parameters(&self) -> &IndexMap<String, Value> {
        &self.parameters
    }

    fn sample_rate(&self) -> Measurement {
        self.sample_rate.clone()
    }

    fn units(&self) -> &str {
        &self.units
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn data_blocks(&self, block_duration: Duration) -> StimulusBlocks {
        let mut iterators: Vec<StimulusBlocks> = self
            .sources
            .iter()
            .map(|s| s.data_blocks(block_duration))
            .collect();
        let combiner = self.combiner.clone();
        let gen = Gen::new(move |co| async move {
            loop {
                let mut blocks = Vec::with_capacity(iterators.len());
                for it in iterators.iter_mut() {
                    match it.next() {
                        Some(Ok(b)) => blocks.push(b),
                        Some(Err(e)) => {
                            co.yield_(Err(e)).await;
                            return;
                        }
                        None => return,
                    }
                }
                match combiner.combine(&blocks) {
                    Ok(combined) => {
                        let is_last = combined.is_last;
                        co.yield_(Ok(combined)).await;
                        if is_last {
                            break;
                        }
                    }
                    Err(e) => {
                        co.yield_(Err(e)).await;
                        break;
                    }
                }
            }
        });
        Box::new(gen.into_iter())
    }

    fn output_log(&self) -> &OutputLog {
        &self.log
    }
}

/// The constant value a channel rests at when no stimulus drives it. Carries
/// the same wire accounting as a stimulus.
pub struct Background {
    pub value: Measurement,
    pub sample_rate: Measurement,
    log: OutputLog,
}

impl Background {
    pub fn new(value: Measurement, sample_rate: Measurement) -> Self {
        Background {
            value,
            sample_rate,
            log: OutputLog::new(),
        }
    }

    pub fn did_output_data(
        &self,
        output_time: DateTime<FixedOffset>,
        span: Duration,
        node_configurations: &[NodeConfiguration],
    ) -> Result<(), StimulusError> {
        self.log.append(output_time, span, node_configurations)
    }

    pub fn start_time(&self) -> Option<DateTime<FixedOffset>> {
        self.log.start_time()
    }

    pub fn output_log(&self) -> &OutputLog {
        &self.log
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

    fn ramp(n: usize) -> Vec<Measurement> {
        (0..n).map(|i| Measurement::base(i as f64, "V")).collect()
    }

    fn rendered(n: usize, duration: Option<Duration>) -> RenderedStimulus {
        let data = OutputData::new(ramp(n), Measurement::hertz(10_000.0), false).unwrap();
        RenderedStimulus::new("edu.example.ramp", IndexMap::new(), data, duration).unwrap()
    }

    #[test]
    fn rendered_blocks_cover_the_declared_duration() {
        let stim = rendered(1000, None); // 100 ms at 10 kHz
        let blocks: Vec<_> = stim
            .data_blocks(Duration::from_millis(50))
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].data.len(), 500);
        assert_eq!(blocks[1].data.len(), 500);
        assert!(!blocks[0].is_last);
        assert!(blocks[1].is_last);
    }

    #[test]
    fn repeating_rendered_stimulus_clips_at_duration() {
        // 30 ms of data, 100 ms declared, pulled in 40 ms blocks
        let stim = rendered(300, Some(Duration::from_millis(100)));
        let blocks: Vec<_> = stim
            .data_blocks(Duration::from_millis(40))
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(
            blocks.iter().map(|b| b.data.len()).collect::<Vec<_>>(),
            vec![400, 400, 200]
        );
        assert!(blocks[2].is_last);
        let glued: Vec<f64> = blocks
            .iter()
            .flat_map(|b| b.data.iter().map(|m| m.base_quantity()))
            .collect();
        // The 300-sample pattern repeats three full times plus 100 samples.
        for (i, v) in glued.iter().enumerate() {
            assert_eq!(*v, (i % 300) as f64);
        }
        assert_eq!(glued.len(), 1000);
    }

    #[test]
    fn indefinite_rendered_stimulus_never_ends() {
        let stim = rendered(300, None);
        // RenderedStimulus::new defaults the duration to the buffer span
        assert_eq!(stim.duration(), Some(Duration::from_millis(30)));
        let stim = RenderedStimulus::indefinite(
            "edu.example.ramp",
            IndexMap::new(),
            OutputData::new(ramp(300), Measurement::hertz(10_000.0), false).unwrap(),
        )
        .unwrap();
        assert_eq!(stim.duration(), None);
        let blocks: Vec<_> = stim
            .data_blocks(Duration::from_millis(40))
            .take(5)
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(blocks.len(), 5);
        assert!(blocks.iter().all(|b| !b.is_last));
        assert!(!stim.is_complete());
    }

    #[test]
    fn output_log_tracks_completion() {
        let stim = rendered(1000, None);
        assert!(!stim.is_complete());
        stim.did_output_data(t0(), Duration::from_millis(50), &[]).unwrap();
        assert_eq!(stim.start_time(), Some(t0()));
        assert!(!stim.is_complete());
        stim.did_output_data(t0() + chrono::Duration::milliseconds(50), Duration::from_millis(50), &[])
            .unwrap();
        assert!(stim.is_complete());
        assert_eq!(stim.output_duration(), Duration::from_millis(100));
    }

    #[test]
    fn output_times_must_not_go_backwards() {
        let stim = rendered(1000, None);
        stim.did_output_data(t0(), Duration::from_millis(10), &[]).unwrap();
        let result = stim.did_output_data(
            t0() - chrono::Duration::milliseconds(1),
            Duration::from_millis(10),
            &[],
        );
        assert!(result.is_err());
    }

    #[test]
    fn delegated_stimulus_renders_through_the_procedure() {
        let renderer = Arc::new(
            |_: &IndexMap<String, Value>, block: Duration| -> Option<OutputData> {
                let n = time::samples_in_duration(block, 1000.0) as usize;
                Some(
                    OutputData::new(
                        vec![Measurement::base(0.5, "V"); n],
                        Measurement::hertz(1000.0),
                        false,
                    )
                    .unwrap(),
                )
            },
        );
        let calculator = Arc::new(|_: &IndexMap<String, Value>| Some(Duration::from_millis(25)));
        let stim = DelegatedStimulus::new(
            "edu.example.pulse",
            IndexMap::new(),
            Measurement::hertz(1000.0),
            "V",
            renderer,
            calculator,
        );
        let blocks: Vec<_> = stim
            .data_blocks(Duration::from_millis(10))
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(
            blocks.iter().map(|b| b.data.len()).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        assert!(blocks[2].is_last);
    }

    #[test]
    fn delegated_stimulus_rejects_wrong_units() {
        let renderer = Arc::new(
            |_: &IndexMap<String, Value>, _: Duration| -> Option<OutputData> {
                Some(
                    OutputData::new(
                        vec![Measurement::base(1.0, "A"); 10],
                        Measurement::hertz(1000.0),
                        false,
                    )
                    .unwrap(),
                )
            },
        );
        let calculator = Arc::new(|_: &IndexMap<String, Value>| -> Option<Duration> { None });
        let stim = DelegatedStimulus::new(
            "edu.example.pulse",
            IndexMap::new(),
            Measurement::hertz(1000.0),
            "V",
            renderer,
            calculator,
        );
        let first = stim.data_blocks(Duration::from_millis(10)).next().unwrap();
        assert!(first.is_err());
    }

    #[test]
    fn combined_stimulus_adds_pointwise() {
        let a: Arc<dyn Stimulus> = Arc::new(rendered(100, None));
        let b: Arc<dyn Stimulus> = Arc::new(rendered(100, None));
        let combined = CombinedStimulus::new(
            "edu.example.sum",
            Arc::new(pointwise_combiner(|x, y| x + y)),
            vec![a, b],
        )
        .unwrap();
        let blocks: Vec<_> = combined
            .data_blocks(Duration::from_millis(4))
            .map(|b| b.unwrap())
            .collect();
        let glued: Vec<f64> = blocks
            .iter()
            .flat_map(|b| b.data.iter().map(|m| m.base_quantity()))
            .collect();
        assert_eq!(glued.len(), 100);
        for (i, v) in glued.iter().enumerate() {
            assert_eq!(*v, 2.0 * i as f64);
        }
        assert!(blocks.last().unwrap().is_last);
    }

    #[test]
    fn combined_stimulus_merges_parameters_with_prefixes() {
        let mut pa = IndexMap::new();
        pa.insert("amplitude".to_string(), Value::Float(1.0));
        let data = OutputData::new(ramp(10), Measurement::hertz(10_000.0), false).unwrap();
        let a: Arc<dyn Stimulus> =
            Arc::new(RenderedStimulus::new("edu.example.a", pa, data.clone(), None).unwrap());
        let mut pb = IndexMap::new();
        pb.insert("amplitude".to_string(), Value::Float(2.0));
        let b: Arc<dyn Stimulus> =
            Arc::new(RenderedStimulus::new("edu.example.b", pb, data, None).unwrap());
        let combined = CombinedStimulus::new(
            "edu.example.sum",
            Arc::new(pointwise_combiner(|x, y| x + y)),
            vec![a, b],
        )
        .unwrap();
        assert_eq!(
            combined.parameters().get("s0_amplitude"),
            Some(&Value::Float(1.0))
        );
        assert_eq!(
            combined.parameters().get("s1_amplitude"),
            Some(&Value::Float(2.0))
        );
    }

    #[test]
    fn combined_stimulus_rejects_mismatched_sources() {
        let a: Arc<dyn Stimulus> = Arc::new(rendered(100, None));
        let slow = OutputData::new(ramp(100), Measurement::hertz(1000.0), false).unwrap();
        let b: Arc<dyn Stimulus> = Arc::new(
            RenderedStimulus::new("edu.example.slow", IndexMap::new(), slow, None).unwrap(),
        );
        assert!(CombinedStimulus::new(
            "edu.example.sum",
            Arc::new(pointwise_combiner(|x, y| x + y)),
            vec![a, b],
        )
        .is_err());
    }
}
