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

//! The fixed-cadence process loop that drives a device.
//!
//! Each tick awaits the block pulls scheduled on the previous tick, runs one
//! device I/O iteration, confirms the outgoing samples to their streams and
//! queues the captured samples onto a serialized push chain. Any in-flight
//! error turns into an exceptional stop that still restores channel
//! backgrounds.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::FixedOffset;
use indexmap::IndexMap;
use itertools::Itertools;
use log::warn;
use threadpool::ThreadPool;

use crate::device::DaqError;
use crate::device::Device;
use crate::io_data::InputData;
use crate::io_data::NodeConfiguration;
use crate::io_data::OutputData;
use crate::streams::InputStream;
use crate::streams::OutputStream;
use crate::streams::StreamError;

#[derive(Debug, Clone)]
pub enum LoopEvent {
    Started,
    Stopped,
    /// Carries the rendered in-flight error; fired exactly once per run.
    ExceptionalStop(String),
    ProcessIteration(DateTime<FixedOffset>),
    StimulusOutput {
        time: DateTime<FixedOffset>,
        stream: String,
        data: OutputData,
    },
}

/// Handlers run under one lock, so every subscriber observes events in a
/// consistent order.
pub struct EventDispatcher {
    handlers: Mutex<Vec<Box<dyn Fn(&LoopEvent) + Send>>>,
}

impl EventDispatcher {
    fn new() -> Self {
        EventDispatcher {
            handlers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&LoopEvent) + Send + 'static,
    {
        self.handlers.lock().unwrap().push(Box::new(handler));
    }

    fn dispatch(&self, event: &LoopEvent) {
        let handlers = self.handlers.lock().unwrap();
        for handler in handlers.iter() {
            handler(event);
        }
    }
}

type PushBatch = Vec<(Arc<dyn InputStream>, InputData)>;

/// Serializes pushes of captured data: one worker drains batches in arrival
/// order, so pushes are totally ordered no matter which tick queued them.
struct InputPushChain {
    tx: Mutex<Option<Sender<PushBatch>>>,
    outstanding: Arc<(Mutex<usize>, Condvar)>,
    errors: Arc<Mutex<Vec<StreamError>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InputPushChain {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel::<PushBatch>();
        let outstanding = Arc::new((Mutex::new(0usize), Condvar::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let worker_outstanding = outstanding.clone();
        let worker_errors = errors.clone();
        let worker = thread::spawn(move || {
            for batch in rx.iter() {
                for (stream, data) in batch {
                    if let Err(e) = stream.push_input_data(data) {
                        worker_errors.lock().unwrap().push(e);
                    }
                }
                let (count, cvar) = &*worker_outstanding;
                *count.lock().unwrap() -= 1;
                cvar.notify_all();
            }
        });
        InputPushChain {
            tx: Mutex::new(Some(tx)),
            outstanding,
            errors,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn queue(&self, batch: PushBatch) {
        let (count, _) = &*self.outstanding;
        *count.lock().unwrap() += 1;
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            tx.send(batch).ok();
        }
    }

    /// Blocks until every queued push has been applied.
    fn wait(&self) {
        let (count, cvar) = &*self.outstanding;
        let mut n = count.lock().unwrap();
        while *n > 0 {
            n = cvar.wait(n).unwrap();
        }
    }

    fn take_errors(&self) -> Vec<StreamError> {
        self.errors.lock().unwrap().drain(..).collect()
    }

    fn shut_down(&self) {
        self.tx.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.join().ok();
        }
    }
}

struct LoopCore {
    device: Arc<dyn Device>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    events: EventDispatcher,
    push_chain: InputPushChain,
    pool: ThreadPool,
}

/// Drives one device at its `process_interval` on a dedicated thread.
pub struct ProcessLoop {
    core: Arc<LoopCore>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessLoop {
    pub fn new(device: Arc<dyn Device>, n_workers: usize) -> Self {
        ProcessLoop {
            core: Arc::new(LoopCore {
                device,
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                events: EventDispatcher::new(),
                push_chain: InputPushChain::new(),
                pool: ThreadPool::new(n_workers),
            }),
            loop_thread: Mutex::new(None),
        }
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&LoopEvent) + Send + 'static,
    {
        self.core.events.subscribe(handler);
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Starts the loop thread. A second start while running is a no-op.
    pub fn start(&self, wait_for_trigger: bool) -> Result<(), DaqError> {
        if self.core.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(reason) = self.core.device.validate() {
            self.core.running.store(false, Ordering::SeqCst);
            return Err(DaqError::Validation(reason));
        }
        self.core.stop_requested.store(false, Ordering::SeqCst);
        let core = self.core.clone();
        let handle = thread::spawn(move || core.run(wait_for_trigger));
        // a finished previous run left a handle behind
        let mut slot = self.loop_thread.lock().unwrap();
        if let Some(old) = slot.take() {
            old.join().ok();
        }
        *slot = Some(handle);
        Ok(())
    }

    /// Cooperative stop, observed at the next tick boundary.
    pub fn request_stop(&self) {
        self.core.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Joins the loop thread of the current run, if any.
    pub fn wait_until_stopped(&self) {
        let handle = self.loop_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().ok();
        }
    }

    /// Blocks until the input push chain has drained.
    pub fn wait_for_input_tasks(&self) {
        self.core.push_chain.wait();
    }
}

impl Drop for ProcessLoop {
    fn drop(&mut self) {
        self.request_stop();
        self.wait_until_stopped();
        self.core.push_chain.shut_down();
    }
}

type PendingPull = (
    String,
    Arc<dyn OutputStream>,
    Receiver<Result<OutputData, StreamError>>,
);

impl LoopCore {
    fn run(self: Arc<Self>, wait_for_trigger: bool) {
        self.events.dispatch(&LoopEvent::Started);
        let result = self.run_ticks(wait_for_trigger);
        // Exceptional or not, channels go back to their rest values.
        for (name, _) in self.device.active_output_streams() {
            if let Some(background) = self.device.stream_background(&name) {
                if let Err(e) = self.device.apply_stream_background(&name, &background) {
                    warn!("could not restore background on {}: {}", name, e);
                }
            }
        }
        if let Err(e) = self.device.stop_hardware() {
            warn!("could not stop hardware: {}", e);
        }
        // Let queued pushes, stray pulls and event dispatches land before
        // declaring the run over.
        self.pool.join();
        self.push_chain.wait();
        let push_errors = self.push_chain.take_errors();
        let result = match result {
            Ok(()) if !push_errors.is_empty() => Err(format!(
                "input push failed: {}",
                push_errors.iter().map(|e| e.to_string()).join("; ")
            )),
            other => other,
        };
        match result {
            Ok(()) => self.events.dispatch(&LoopEvent::Stopped),
            Err(e) => self.events.dispatch(&LoopEvent::ExceptionalStop(e)),
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn run_ticks(self: &Arc<Self>, wait_for_trigger: bool) -> Result<(), String> {
        let interval = self.device.process_interval();
        let clock = self.device.clock();
        let outputs = self.device.active_output_streams();
        let inputs = self.device.active_input_streams();
        let node_name = self.device.name().to_string();
        let node_configuration = self.device.configuration();

        let mut pending: Vec<PendingPull> = Vec::new();
        let mut first_tick = true;
        let mut deficit = Duration::from_secs(0);
        let mut next_tick = Instant::now();

        loop {
            // Pushes queued on earlier ticks surface their failures here.
            let push_errors = self.push_chain.take_errors();
            if let Some(e) = push_errors.first() {
                return Err(format!("input push failed: {}", e));
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                return Ok(());
            }

            // 1. Await the pulls scheduled on the previous tick.
            let mut outgoing: Vec<(String, Arc<dyn OutputStream>, OutputData)> = Vec::new();
            for (name, stream, rx) in pending.drain(..) {
                let pulled = match rx.try_recv() {
                    Ok(result) => result,
                    Err(TryRecvError::Empty) => {
                        warn!("output pull for {} underran its tick", name);
                        match rx.recv() {
                            Ok(result) => result,
                            Err(_) => {
                                return Err(format!("output pull task for {} vanished", name))
                            }
                        }
                    }
                    Err(TryRecvError::Disconnected) => {
                        return Err(format!("output pull task for {} vanished", name));
                    }
                };
                match pulled {
                    Ok(data) => outgoing.push((name, stream, data)),
                    Err(e) => return Err(format!("output pull for {} failed: {}", name, e)),
                }
            }

            // 2. Schedule the next round of pulls.
            for (name, stream) in &outputs {
                if stream.is_at_end() {
                    continue;
                }
                let (tx, rx) = mpsc::channel();
                let task_stream = stream.clone();
                self.pool.execute(move || {
                    tx.send(task_stream.pull_output_data(interval)).ok();
                });
                pending.push((name.clone(), stream.clone(), rx));
            }

            // 3. First tick arms the hardware; this may block on a trigger.
            if first_tick {
                self.device
                    .start_hardware(wait_for_trigger)
                    .map_err(|e| e.to_string())?;
                first_tick = false;
                next_tick = Instant::now();
            }

            // Every stream drained and nothing in flight: the run is over.
            if outgoing.is_empty() && pending.is_empty() {
                return Ok(());
            }

            // 4. One device I/O iteration.
            let io_map: IndexMap<String, OutputData> = outgoing
                .iter()
                .map(|(name, _, data)| (name.clone(), data.clone()))
                .collect();
            let incoming = self
                .device
                .process_loop_iteration(&io_map, deficit)
                .map_err(|e| e.to_string())?;

            // 5. Stamp, announce and confirm each outgoing block.
            let now = clock.now();
            for (name, stream, data) in outgoing {
                let stamped = data
                    .with_node_configuration(NodeConfiguration::new(
                        &node_name,
                        node_configuration.clone(),
                    ))
                    .map_err(|e| e.to_string())?;
                let event = LoopEvent::StimulusOutput {
                    time: now,
                    stream: name,
                    data: stamped.clone(),
                };
                let core = Arc::clone(self);
                self.pool.execute(move || core.events.dispatch(&event));
                stream
                    .did_output_data(now, stamped.duration(), stamped.node_configurations())
                    .map_err(|e| e.to_string())?;
            }

            // 6. Chain the captured samples onto the serialized push worker.
            let mut batch: PushBatch = Vec::new();
            for (name, data) in incoming {
                let stream = inputs
                    .get(&name)
                    .ok_or_else(|| format!("device returned data for unknown stream {}", name))?;
                batch.push((stream.clone(), data));
            }
            if !batch.is_empty() {
                self.push_chain.queue(batch);
            }

            // 7.
            self.events.dispatch(&LoopEvent::ProcessIteration(now));

            // 8. Pace to the tick boundary; overshoot carries forward.
            next_tick += interval;
            let arrived = Instant::now();
            if arrived > next_tick {
                deficit = arrived - next_tick;
            } else {
                while Instant::now() < next_tick {
                    thread::yield_now();
                }
                deficit = Duration::from_secs(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    use ephys_common::Measurement;

    use crate::device::LoopbackDevice;
    use crate::epoch::Epoch;
    use crate::io_data::NodeConfiguration;
    use crate::stimulus::RenderedStimulus;
    use crate::streams::IoStream;

    fn collect_events(process_loop: &ProcessLoop) -> Arc<Mutex<Vec<String>>> {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        process_loop.subscribe(move |event| {
            let tag = match event {
                LoopEvent::Started => "started",
                LoopEvent::Stopped => "stopped",
                LoopEvent::ExceptionalStop(_) => "exceptional",
                LoopEvent::ProcessIteration(_) => "iteration",
                LoopEvent::StimulusOutput { .. } => "stimulus-output",
            };
            sink.lock().unwrap().push(tag.to_string());
        });
        log
    }

    fn count(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> usize {
        log.lock().unwrap().iter().filter(|t| *t == tag).count()
    }

    #[test]
    fn loop_runs_an_epoch_to_completion() {
        let device = Arc::new(LoopbackDevice::new(
            "Amp",
            "Example Instruments",
            Duration::from_millis(2),
        ));
        let mut epoch = Epoch::new("edu.example.protocol", IndexMap::new());
        let data = OutputData::new(
            vec![Measurement::base(1.0, "mV"); 200], // 20 ms at 10 kHz
            Measurement::hertz(10_000.0),
            false,
        )
        .unwrap();
        epoch.add_stimulus(
            device.info(),
            Arc::new(
                RenderedStimulus::new("edu.example.step", IndexMap::new(), data, None).unwrap(),
            ),
        );
        let response = epoch.record_response(device.info(), Measurement::hertz(10_000.0));
        let out = epoch
            .get_output_stream(&device.info(), Duration::from_millis(2))
            .unwrap();
        let input = epoch.get_input_stream(&device.info()).unwrap();
        device.bind_output_stream("ao0", out.clone(), Measurement::base(0.0, "mV"));
        device.bind_input_stream("ai0", input);
        device.wire("ao0", "ai0");

        let process_loop = ProcessLoop::new(device.clone(), 2);
        let events = collect_events(&process_loop);
        process_loop.start(false).unwrap();
        process_loop.wait_until_stopped();
        process_loop.wait_for_input_tasks();

        assert!(!process_loop.is_running());
        assert!(!device.is_hardware_running());
        assert_eq!(response.duration(), Duration::from_millis(20));
        assert!(epoch.is_complete());
        assert!(out.is_output_at_end());
        assert_eq!(count(&events, "started"), 1);
        assert_eq!(count(&events, "stopped"), 1);
        assert_eq!(count(&events, "exceptional"), 0);
        assert!(count(&events, "iteration") >= 10);
        assert!(count(&events, "stimulus-output") >= 10);
        assert_eq!(
            device.applied_backgrounds(),
            vec![("ao0".to_string(), Measurement::base(0.0, "mV"))]
        );
        assert!(!response.segments().is_empty());
    }

    #[test]
    fn request_stop_halts_an_indefinite_epoch() {
        let device = Arc::new(LoopbackDevice::new(
            "Amp",
            "Example Instruments",
            Duration::from_millis(1),
        ));
        let mut epoch = Epoch::new("edu.example.hold", IndexMap::new());
        epoch.set_background(
            device.info(),
            Measurement::base(-60.0, "mV"),
            Measurement::hertz(10_000.0),
        );
        let out = epoch
            .get_output_stream(&device.info(), Duration::from_millis(1))
            .unwrap();
        assert_eq!(out.duration(), None);
        device.bind_output_stream("ao0", out, Measurement::base(-60.0, "mV"));

        let process_loop = ProcessLoop::new(device.clone(), 2);
        let events = collect_events(&process_loop);
        process_loop.start(false).unwrap();
        while device.iterations() < 5 {
            thread::yield_now();
        }
        process_loop.request_stop();
        process_loop.wait_until_stopped();
        assert!(!process_loop.is_running());
        assert_eq!(count(&events, "stopped"), 1);
        assert!(device.iterations() >= 5);
    }

    struct FailingStream {
        pulls: Mutex<u32>,
        fail_on: u32,
    }

    impl FailingStream {
        fn new(fail_on: u32) -> Self {
            FailingStream {
                pulls: Mutex::new(0),
                fail_on,
            }
        }
    }

    impl IoStream for FailingStream {
        fn sample_rate(&self) -> Option<Measurement> {
            Some(Measurement::hertz(1000.0))
        }

        fn duration(&self) -> Option<Duration> {
            Some(Duration::from_secs(1))
        }

        fn position(&self) -> Duration {
            Duration::from_secs(0)
        }

        fn is_at_end(&self) -> bool {
            false
        }
    }

    impl OutputStream for FailingStream {
        fn pull_output_data(&self, d: Duration) -> Result<OutputData, StreamError> {
            let mut pulls = self.pulls.lock().unwrap();
            *pulls += 1;
            if *pulls >= self.fail_on {
                return Err(StreamError::AtEnd);
            }
            let n = ephys_common::time::samples_in_duration(d, 1000.0) as usize;
            Ok(OutputData::new(
                vec![Measurement::base(0.0, "mV"); n],
                Measurement::hertz(1000.0),
                false,
            )
            .unwrap())
        }

        fn did_output_data(
            &self,
            _output_time: DateTime<FixedOffset>,
            _span: Duration,
            _node_configurations: &[NodeConfiguration],
        ) -> Result<(), StreamError> {
            Ok(())
        }

        fn output_position(&self) -> Duration {
            Duration::from_secs(0)
        }

        fn is_output_at_end(&self) -> bool {
            false
        }
    }

    #[test]
    fn pull_failure_becomes_an_exceptional_stop() {
        let device = Arc::new(LoopbackDevice::new(
            "Amp",
            "Example Instruments",
            Duration::from_millis(1),
        ));
        device.bind_output_stream(
            "ao0",
            Arc::new(FailingStream::new(2)),
            Measurement::base(0.0, "mV"),
        );

        let process_loop = ProcessLoop::new(device.clone(), 2);
        let events = collect_events(&process_loop);
        process_loop.start(false).unwrap();
        process_loop.wait_until_stopped();

        assert!(!process_loop.is_running());
        assert_eq!(count(&events, "exceptional"), 1);
        assert_eq!(count(&events, "stopped"), 0);
        // backgrounds restored even on the exceptional path
        assert_eq!(device.applied_backgrounds().len(), 1);

        // the controller is reusable after an exceptional stop
        process_loop.start(false).unwrap();
        process_loop.wait_until_stopped();
        assert_eq!(count(&events, "exceptional"), 2);
    }
}
