#[macro_use]
extern crate lazy_static;

use std::error::Error;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use clap::Arg;
use clap::Command;
use indexmap::IndexMap;
use serde_json::json;

use ephys::daq::LoopEvent;
use ephys::daq::ProcessLoop;
use ephys::device::LoopbackDevice;
use ephys::epoch::Epoch;
use ephys::io_data::OutputData;
use ephys::persist::Entity;
use ephys::persist::Persistor;
use ephys::settings::Settings;
use ephys::stimulus::RenderedStimulus;
use ephys::Measurement;
use ephys::Value;

lazy_static! {
    static ref SETTINGS: Settings = Settings::read();
}

fn main() {
    env_logger::init();
    let matches = Command::new("ephys")
        .about("Electrophysiology acquisition core")
        .subcommand_required(true)
        .subcommand(
            Command::new("inspect")
                .about("Dump a container file as JSON")
                .arg(Arg::new("file").required(true)),
        )
        .subcommand(
            Command::new("demo")
                .about("Run a loopback acquisition and persist one epoch")
                .arg(Arg::new("file")),
        )
        .get_matches();
    let result = match matches.subcommand() {
        Some(("inspect", sub)) => inspect(Path::new(sub.get_one::<String>("file").unwrap())),
        Some(("demo", sub)) => {
            let path = sub
                .get_one::<String>("file")
                .map(PathBuf::from)
                .unwrap_or_else(|| SETTINGS.container_path.clone());
            demo(&path)
        }
        _ => unreachable!(),
    };
    if let Err(e) = result {
        eprintln!("Failed with {}", e);
        std::process::exit(1);
    }
}

fn inspect(path: &Path) -> Result<(), Box<dyn Error>> {
    let persistor = Persistor::open(path)?;
    let experiment = persistor.experiment();
    let devices = persistor
        .devices()?
        .iter()
        .map(|d| {
            Ok(json!({
                "uuid": d.uuid.to_string(),
                "name": persistor.string_attr(d, "name")?,
                "manufacturer": persistor.string_attr(d, "manufacturer")?,
            }))
        })
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    let sources = persistor
        .sources(None)?
        .iter()
        .map(|s| source_json(&persistor, s))
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    let groups = persistor
        .epoch_groups(None)?
        .iter()
        .map(|g| group_json(&persistor, g))
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    let tree = json!({
        "experiment": {
            "uuid": experiment.uuid.to_string(),
            "purpose": persistor.purpose(),
            "startTime": persistor.start_time(&experiment)?.map(|t| t.to_rfc3339()),
            "endTime": persistor.end_time(&experiment)?.map(|t| t.to_rfc3339()),
            "keywords": persistor.keywords(&experiment)?,
            "notes": persistor.notes(&experiment)?.iter()
                .map(|n| json!({"time": n.time.to_rfc3339(), "text": n.text}))
                .collect::<Vec<_>>(),
            "devices": devices,
            "sources": sources,
            "epochGroups": groups,
        }
    });
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

fn source_json(persistor: &Persistor, source: &Arc<Entity>) -> Result<serde_json::Value, Box<dyn Error>> {
    let children = persistor
        .sources(Some(source.as_ref()))?
        .iter()
        .map(|s| source_json(persistor, s))
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    Ok(json!({
        "uuid": source.uuid.to_string(),
        "label": persistor.label(source)?,
        "epochGroups": persistor.source_epoch_groups(source)?.iter()
            .map(|g| g.uuid.to_string())
            .collect::<Vec<_>>(),
        "sources": children,
    }))
}

fn group_json(persistor: &Persistor, group: &Arc<Entity>) -> Result<serde_json::Value, Box<dyn Error>> {
    let blocks = persistor
        .epoch_blocks(group)?
        .iter()
        .map(|b| block_json(persistor, b))
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    let nested = persistor
        .epoch_groups(Some(group.as_ref()))?
        .iter()
        .map(|g| group_json(persistor, g))
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    Ok(json!({
        "uuid": group.uuid.to_string(),
        "label": persistor.label(group)?,
        "source": persistor.source_of(group)?.map(|s| s.uuid.to_string()),
        "startTime": persistor.start_time(group)?.map(|t| t.to_rfc3339()),
        "endTime": persistor.end_time(group)?.map(|t| t.to_rfc3339()),
        "epochBlocks": blocks,
        "epochGroups": nested,
    }))
}

fn block_json(persistor: &Persistor, block: &Arc<Entity>) -> Result<serde_json::Value, Box<dyn Error>> {
    let epochs = persistor
        .epochs(block)?
        .iter()
        .map(|e| epoch_json(persistor, e))
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    Ok(json!({
        "uuid": block.uuid.to_string(),
        "protocolID": persistor.string_attr(block, "protocolID")?,
        "parameters": serde_json::to_value(persistor.parameters(block)?)?,
        "epochs": epochs,
    }))
}

fn epoch_json(persistor: &Persistor, epoch: &Arc<Entity>) -> Result<serde_json::Value, Box<dyn Error>> {
    let stimuli = persistor
        .epoch_stimuli(epoch)?
        .iter()
        .map(|s| {
            Ok(json!({
                "stimulusID": persistor.string_attr(s, "stimulusID")?,
                "units": persistor.string_attr(s, "units")?,
                "durationSeconds": persistor.float_attr(s, "durationSeconds")?,
                "device": persistor.device_of(s)?.map(|d| d.uuid.to_string()),
                "parameters": serde_json::to_value(persistor.parameters(s)?)?,
                "samples": persistor.measurement_data(s)?.map(|d| d.len()),
            }))
        })
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    let responses = persistor
        .epoch_responses(epoch)?
        .iter()
        .map(|r| {
            Ok(json!({
                "sampleRate": persistor.float_attr(r, "sampleRate")?,
                "device": persistor.device_of(r)?.map(|d| d.uuid.to_string()),
                "samples": persistor.measurement_data(r)?.map(|d| d.len()),
            }))
        })
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    let backgrounds = persistor
        .epoch_backgrounds(epoch)?
        .iter()
        .map(|b| {
            Ok(json!({
                "value": persistor.float_attr(b, "value")?,
                "valueUnits": persistor.string_attr(b, "valueUnits")?,
                "device": persistor.device_of(b)?.map(|d| d.uuid.to_string()),
            }))
        })
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    Ok(json!({
        "uuid": epoch.uuid.to_string(),
        "startTime": persistor.start_time(epoch)?.map(|t| t.to_rfc3339()),
        "endTime": persistor.end_time(epoch)?.map(|t| t.to_rfc3339()),
        "parameters": serde_json::to_value(persistor.parameters(epoch)?)?,
        "keywords": persistor.keywords(epoch)?,
        "stimuli": stimuli,
        "responses": responses,
        "backgrounds": backgrounds,
    }))
}

/// One second of a 10 Hz sine on the loopback device, echoed back in and
/// persisted as a complete epoch.
fn demo(path: &Path) -> Result<(), Box<dyn Error>> {
    let rate = 10_000.0;
    let samples: Vec<Measurement> = (0..10_000)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * 10.0 * i as f64 / rate;
            Measurement::base(5.0 * phase.sin(), "mV")
        })
        .collect();
    let data = OutputData::new(samples, Measurement::hertz(rate), false)?;
    let mut parameters = IndexMap::new();
    parameters.insert("frequencyHz".to_string(), Value::Float(10.0));
    parameters.insert("amplitude".to_string(), Value::Measurement(Measurement::base(5.0, "mV")));
    let stimulus = Arc::new(RenderedStimulus::new(
        "edu.ephys.demo.sine",
        parameters.clone(),
        data,
        None,
    )?);

    let device = Arc::new(LoopbackDevice::new(
        "Demo Amp",
        "Ephys",
        SETTINGS.process_interval,
    ));
    let mut epoch = Epoch::new("edu.ephys.demo", parameters);
    epoch.keywords.insert("demo".to_string());
    epoch.add_stimulus(device.info(), stimulus);
    let response = epoch.record_response(device.info(), Measurement::hertz(rate));
    epoch.set_background(device.info(), Measurement::base(0.0, "mV"), Measurement::hertz(rate));

    let out = epoch
        .get_output_stream(&device.info(), SETTINGS.block_duration)
        .ok_or("no output stream")?;
    let input = epoch.get_input_stream(&device.info()).ok_or("no input stream")?;
    device.bind_output_stream("ao0", out, Measurement::base(0.0, "mV"));
    device.bind_input_stream("ai0", input);
    device.wire("ao0", "ai0");

    let process_loop = ProcessLoop::new(device.clone(), SETTINGS.n_workers);
    process_loop.subscribe(|event| match event {
        LoopEvent::Started => println!("loop started"),
        LoopEvent::Stopped => println!("loop stopped"),
        LoopEvent::ExceptionalStop(e) => eprintln!("loop failed: {}", e),
        _ => {}
    });
    let t0 = Local::now().fixed_offset();
    process_loop.start(epoch.should_wait_for_trigger)?;
    process_loop.wait_until_stopped();
    process_loop.wait_for_input_tasks();
    println!(
        "captured {:?} of response over {} iterations",
        response.duration(),
        device.iterations()
    );

    let mut persistor = Persistor::create(path, "loopback demo", t0)?;
    let source = persistor.add_source("demo-subject", None)?;
    persistor.begin_epoch_group("demo-session", &source, t0)?;
    persistor.begin_epoch_block("edu.ephys.demo", epoch.protocol_parameters.clone(), t0)?;
    if epoch.should_be_persisted {
        let start = epoch.start_time().unwrap_or(t0);
        persistor.serialize_epoch(&epoch, start)?;
    }
    persistor.end_epoch_block(Local::now().fixed_offset())?;
    persistor.end_epoch_group(Local::now().fixed_offset())?;
    let experiment = persistor.experiment();
    persistor.add_note(&experiment, Local::now().fixed_offset(), "demo run complete")?;
    persistor.close(Local::now().fixed_offset())?;
    println!("wrote {}", path.display());
    Ok(())
}
