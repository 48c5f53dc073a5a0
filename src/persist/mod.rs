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

//! The hierarchical epoch persistor.
//!
//! A session owns one container exclusively and maintains the entity tree
//! Experiment -> Source / EpochGroup -> EpochBlock -> Epoch ->
//! (Response | Stimulus | Background), with hard-link cross references for
//! `device`, `source`, `parent`, `experiment` and `epochGroup`. Every insert
//! builds its group completely or removes the partial group before surfacing
//! the error. A per-session identity cache hands out one wrapper per UUID.

pub mod container;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bimap::BiMap;
use chrono::DateTime;
use chrono::FixedOffset;
use indexmap::IndexMap;
use log::warn;
use petgraph::stable_graph::NodeIndex;
use uuid::Uuid;

use ephys_common::time;
use ephys_common::Measurement;
use ephys_common::Value;

use crate::epoch::Epoch;
use crate::io_data::ConfigurationSpan;
use crate::persist::container::AttrValue;
use crate::persist::container::Container;
use crate::persist::container::Dataset;
use crate::persist::container::MeasurementRecord;
use crate::persist::container::NoteRecord;
use crate::stimulus::Stimulus;

/// Layout version written to and required of every container.
pub const PERSISTENCE_VERSION: u64 = 2;

#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    Corrupt(String),
    VersionMismatch { found: u64, expected: u64 },
    MultipleTopLevelGroups(usize),
    EmptyField(&'static str),
    DuplicateDevice(String),
    ProtectedEntity(String),
    SourceHasGroups(String),
    NoOpenEpochGroup,
    EpochBlockAlreadyOpen,
    NoOpenEpochBlock,
    ProtocolMismatch { block: String, epoch: String },
    UnitTooLong(String),
    MissingEntity(String),
    Data(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PersistenceError::Io(e) => write!(f, "I/O failure: {}", e),
            PersistenceError::Corrupt(what) => write!(f, "Container is corrupt: {}", what),
            PersistenceError::VersionMismatch { found, expected } => {
                write!(f, "Container version {} but this build writes {}", found, expected)
            }
            PersistenceError::MultipleTopLevelGroups(n) => {
                write!(f, "Expected exactly one top-level group, found {}", n)
            }
            PersistenceError::EmptyField(which) => write!(f, "{} must not be empty", which),
            PersistenceError::DuplicateDevice(which) => {
                write!(f, "Device {} already exists", which)
            }
            PersistenceError::ProtectedEntity(which) => {
                write!(f, "{} cannot be deleted", which)
            }
            PersistenceError::SourceHasGroups(which) => {
                write!(f, "Source {} still has epoch groups recorded against it", which)
            }
            PersistenceError::NoOpenEpochGroup => write!(f, "No epoch group is open"),
            PersistenceError::EpochBlockAlreadyOpen => {
                write!(f, "An epoch block is already open")
            }
            PersistenceError::NoOpenEpochBlock => write!(f, "No epoch block is open"),
            PersistenceError::ProtocolMismatch { block, epoch } => {
                write!(f, "Epoch protocol {} does not match block protocol {}", epoch, block)
            }
            PersistenceError::UnitTooLong(unit) => {
                write!(f, "Unit {} exceeds the fixed unit field", unit)
            }
            PersistenceError::MissingEntity(which) => {
                write!(f, "Entity {} is no longer in the container", which)
            }
            PersistenceError::Data(what) => write!(f, "Inconsistent data: {}", what),
        }
    }
}

impl Error for PersistenceError {}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        PersistenceError::Io(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Experiment,
    Device,
    Source,
    EpochGroup,
    EpochBlock,
    Epoch,
    Response,
    Stimulus,
    Background,
}

/// A handle into the entity tree. The session's identity cache guarantees one
/// wrapper per UUID, so handle equality is identity.
#[derive(Debug)]
pub struct Entity {
    pub uuid: Uuid,
    pub kind: EntityKind,
    node: NodeIndex,
}

impl PartialEq for Entity {
    fn eq(&self, other: &Entity) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for Entity {}

/// A timestamped annotation readable from any entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub time: DateTime<FixedOffset>,
    pub text: String,
}

/// A configuration span as read back from a container: a time region and the
/// pipeline node configurations active over it.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSpan {
    pub start_time_seconds: f64,
    pub time_span_seconds: f64,
    pub nodes: Vec<(String, IndexMap<String, Value>)>,
}

/// One wrapper per UUID per session, with a two-way uuid <-> node index.
#[derive(Default)]
struct IdentityCache {
    by_uuid: HashMap<Uuid, Arc<Entity>>,
    index: BiMap<Uuid, NodeIndex>,
}

impl IdentityCache {
    fn insert(&mut self, entity: Arc<Entity>) {
        self.index.insert(entity.uuid, entity.node);
        self.by_uuid.insert(entity.uuid, entity);
    }

    fn remove(&mut self, uuid: &Uuid) {
        self.by_uuid.remove(uuid);
        self.index.remove_by_left(uuid);
    }
}

/// One exclusive writer session over one container file.
pub struct Persistor {
    container: Container,
    cache: Mutex<IdentityCache>,
    experiment: Arc<Entity>,
    open_groups: Vec<Arc<Entity>>,
    open_block: Option<Arc<Entity>>,
}

impl Persistor {
    /// Creates a fresh container holding one Experiment.
    pub fn create(
        path: &Path,
        purpose: &str,
        start_time: DateTime<FixedOffset>,
    ) -> Result<Persistor, PersistenceError> {
        if purpose.is_empty() {
            return Err(PersistenceError::EmptyField("purpose"));
        }
        let mut container = Container::create(path);
        let root = container.root();
        container.set_attr(root, "version", AttrValue::Uint(PERSISTENCE_VERSION));
        let uuid = Uuid::new_v4();
        let node = container.add_group(root, &format!("experiment-{}", uuid));
        container.set_attr(node, "uuid", AttrValue::Str(uuid.to_string()));
        container.set_attr(node, "purpose", AttrValue::Str(purpose.to_string()));
        write_time_attrs(&mut container, node, "startTime", &start_time);
        container.add_group(node, "devices");
        container.add_group(node, "sources");
        container.add_group(node, "epochGroups");
        container.flush()?;
        let experiment = Arc::new(Entity {
            uuid,
            kind: EntityKind::Experiment,
            node,
        });
        let mut cache = IdentityCache::default();
        cache.insert(experiment.clone());
        Ok(Persistor {
            container,
            cache: Mutex::new(cache),
            experiment,
            open_groups: Vec::new(),
            open_block: None,
        })
    }

    /// Opens an existing container, validating version and shape.
    pub fn open(path: &Path) -> Result<Persistor, PersistenceError> {
        let container = Container::open(path)?;
        let root = container.root();
        let found = match container.attr(root, "version") {
            Some(AttrValue::Uint(v)) => *v,
            _ => return Err(PersistenceError::Corrupt("missing version".to_string())),
        };
        if found != PERSISTENCE_VERSION {
            return Err(PersistenceError::VersionMismatch {
                found,
                expected: PERSISTENCE_VERSION,
            });
        }
        let top = container.children(root);
        if top.len() != 1 {
            return Err(PersistenceError::MultipleTopLevelGroups(top.len()));
        }
        let node = top[0].1;
        let uuid = read_uuid(&container, node)?;
        let experiment = Arc::new(Entity {
            uuid,
            kind: EntityKind::Experiment,
            node,
        });
        let mut cache = IdentityCache::default();
        cache.insert(experiment.clone());
        Ok(Persistor {
            container,
            cache: Mutex::new(cache),
            experiment,
            open_groups: Vec::new(),
            open_block: None,
        })
    }

    pub fn experiment(&self) -> Arc<Entity> {
        self.experiment.clone()
    }

    pub fn purpose(&self) -> Option<String> {
        self.container.string_attr(self.experiment.node, "purpose")
    }

    /// The cached wrapper for a group node; two lookups of one UUID return
    /// the same wrapper.
    fn entity_at(
        &self,
        node: NodeIndex,
        kind: EntityKind,
    ) -> Result<Arc<Entity>, PersistenceError> {
        let uuid = read_uuid(&self.container, node)?;
        let mut cache = self.cache.lock().unwrap();
        if let Some(entity) = cache.by_uuid.get(&uuid) {
            return Ok(entity.clone());
        }
        let entity = Arc::new(Entity { uuid, kind, node });
        cache.insert(entity.clone());
        Ok(entity)
    }

    /// A session-known entity by its UUID.
    pub fn entity(&self, uuid: &Uuid) -> Option<Arc<Entity>> {
        self.cache.lock().unwrap().by_uuid.get(uuid).cloned()
    }

    fn live_node(&self, entity: &Entity) -> Result<NodeIndex, PersistenceError> {
        if !self.container.contains(entity.node) {
            return Err(PersistenceError::MissingEntity(entity.uuid.to_string()));
        }
        Ok(entity.node)
    }

    /// The shared create protocol: allocate `prefix-uuid`, build, and remove
    /// the partial group if building fails.
    fn insert_entity<F>(
        &mut self,
        parent: NodeIndex,
        prefix: &str,
        kind: EntityKind,
        build: F,
    ) -> Result<Arc<Entity>, PersistenceError>
    where
        F: FnOnce(&mut Container, NodeIndex, &str) -> Result<(), PersistenceError>,
    {
        let uuid = Uuid::new_v4();
        let name = format!("{}-{}", prefix, uuid);
        let node = self.container.add_group(parent, &name);
        self.container
            .set_attr(node, "uuid", AttrValue::Str(uuid.to_string()));
        if let Err(e) = build(&mut self.container, node, &name) {
            self.container.remove_subtree(node);
            return Err(e);
        }
        self.flush_logged();
        let entity = Arc::new(Entity { uuid, kind, node });
        self.cache.lock().unwrap().insert(entity.clone());
        Ok(entity)
    }

    /// A flush failure is logged, not fatal; the next flush retries.
    fn flush_logged(&self) {
        if let Err(e) = self.container.flush() {
            warn!("container flush failed: {}", e);
        }
    }

    pub fn add_device(
        &mut self,
        name: &str,
        manufacturer: &str,
    ) -> Result<Arc<Entity>, PersistenceError> {
        if name.is_empty() {
            return Err(PersistenceError::EmptyField("device name"));
        }
        if manufacturer.is_empty() {
            return Err(PersistenceError::EmptyField("device manufacturer"));
        }
        if self.device(name, manufacturer)?.is_some() {
            return Err(PersistenceError::DuplicateDevice(format!(
                "{} ({})",
                name, manufacturer
            )));
        }
        let holder = self
            .container
            .child(self.experiment.node, "devices")
            .ok_or_else(|| PersistenceError::Corrupt("experiment has no devices".to_string()))?;
        let experiment_node = self.experiment.node;
        let name_attr = name.to_string();
        let manufacturer_attr = manufacturer.to_string();
        self.insert_entity(holder, name, EntityKind::Device, move |c, node, _| {
            c.set_attr(node, "name", AttrValue::Str(name_attr));
            c.set_attr(node, "manufacturer", AttrValue::Str(manufacturer_attr));
            c.add_link(node, experiment_node, "experiment");
            Ok(())
        })
    }

    pub fn devices(&self) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        let holder = match self.container.child(self.experiment.node, "devices") {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        self.entities_in(holder, EntityKind::Device)
    }

    /// An existing device with this exact `(name, manufacturer)` pair.
    pub fn device(
        &self,
        name: &str,
        manufacturer: &str,
    ) -> Result<Option<Arc<Entity>>, PersistenceError> {
        for device in self.devices()? {
            let node = device.node;
            if self.container.string_attr(node, "name").as_deref() == Some(name)
                && self.container.string_attr(node, "manufacturer").as_deref()
                    == Some(manufacturer)
            {
                return Ok(Some(device));
            }
        }
        Ok(None)
    }

    pub fn add_source(
        &mut self,
        label: &str,
        parent: Option<&Entity>,
    ) -> Result<Arc<Entity>, PersistenceError> {
        if label.is_empty() {
            return Err(PersistenceError::EmptyField("source label"));
        }
        let parent_source = match parent {
            Some(p) => Some(self.live_node(p)?),
            None => None,
        };
        let holder = match parent_source {
            Some(node) => self
                .container
                .child(node, "sources")
                .ok_or_else(|| PersistenceError::Corrupt("source has no sources".to_string()))?,
            None => self
                .container
                .child(self.experiment.node, "sources")
                .ok_or_else(|| {
                    PersistenceError::Corrupt("experiment has no sources".to_string())
                })?,
        };
        let experiment_node = self.experiment.node;
        let label_attr = label.to_string();
        self.insert_entity(holder, label, EntityKind::Source, move |c, node, _| {
            c.set_attr(node, "label", AttrValue::Str(label_attr));
            c.add_group(node, "sources");
            c.add_group(node, "epochGroups");
            c.add_link(node, experiment_node, "experiment");
            if let Some(parent_node) = parent_source {
                c.add_link(node, parent_node, "parent");
            }
            Ok(())
        })
    }

    pub fn sources(&self, parent: Option<&Entity>) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        let owner = match parent {
            Some(p) => self.live_node(p)?,
            None => self.experiment.node,
        };
        let holder = match self.container.child(owner, "sources") {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        self.entities_in(holder, EntityKind::Source)
    }

    /// Opens a new epoch group on `source`, nested inside the innermost open
    /// group if one exists.
    pub fn begin_epoch_group(
        &mut self,
        label: &str,
        source: &Entity,
        start_time: DateTime<FixedOffset>,
    ) -> Result<Arc<Entity>, PersistenceError> {
        if label.is_empty() {
            return Err(PersistenceError::EmptyField("epoch group label"));
        }
        let source_node = self.live_node(source)?;
        let owner = match self.open_groups.last() {
            Some(parent) => parent.node,
            None => self.experiment.node,
        };
        let holder = self
            .container
            .child(owner, "epochGroups")
            .ok_or_else(|| PersistenceError::Corrupt("owner has no epochGroups".to_string()))?;
        let experiment_node = self.experiment.node;
        let parent_group = self.open_groups.last().map(|g| g.node);
        let label_attr = label.to_string();
        let group = self.insert_entity(holder, label, EntityKind::EpochGroup, move |c, node, name| {
            c.set_attr(node, "label", AttrValue::Str(label_attr));
            write_time_attrs(c, node, "startTime", &start_time);
            c.add_group(node, "epochGroups");
            c.add_group(node, "epochBlocks");
            c.add_link(node, source_node, "source");
            c.add_link(node, experiment_node, "experiment");
            if let Some(parent_node) = parent_group {
                c.add_link(node, parent_node, "parent");
            }
            // the source keeps back-references to every group recorded
            // against it
            let backrefs = c
                .child(source_node, "epochGroups")
                .ok_or_else(|| PersistenceError::Corrupt("source has no epochGroups".to_string()))?;
            c.add_link(backrefs, node, name);
            Ok(())
        })?;
        self.open_groups.push(group.clone());
        Ok(group)
    }

    /// Closes the innermost open group, stamping its end time.
    pub fn end_epoch_group(
        &mut self,
        end_time: DateTime<FixedOffset>,
    ) -> Result<Arc<Entity>, PersistenceError> {
        if self.open_block.is_some() {
            return Err(PersistenceError::EpochBlockAlreadyOpen);
        }
        let group = self
            .open_groups
            .pop()
            .ok_or(PersistenceError::NoOpenEpochGroup)?;
        write_time_attrs(&mut self.container, group.node, "endTime", &end_time);
        self.flush_logged();
        Ok(group)
    }

    pub fn begin_epoch_block(
        &mut self,
        protocol_id: &str,
        parameters: IndexMap<String, Value>,
        start_time: DateTime<FixedOffset>,
    ) -> Result<Arc<Entity>, PersistenceError> {
        if protocol_id.is_empty() {
            return Err(PersistenceError::EmptyField("protocol id"));
        }
        if self.open_block.is_some() {
            return Err(PersistenceError::EpochBlockAlreadyOpen);
        }
        let group = self
            .open_groups
            .last()
            .cloned()
            .ok_or(PersistenceError::NoOpenEpochGroup)?;
        let holder = self
            .container
            .child(group.node, "epochBlocks")
            .ok_or_else(|| PersistenceError::Corrupt("group has no epochBlocks".to_string()))?;
        let group_node = group.node;
        let protocol_attr = protocol_id.to_string();
        let block = self.insert_entity(holder, "epochBlock", EntityKind::EpochBlock, move |c, node, _| {
            c.set_attr(node, "protocolID", AttrValue::Str(protocol_attr));
            write_time_attrs(c, node, "startTime", &start_time);
            let params = c.add_group(node, "protocolParameters");
            write_value_attrs(c, params, &parameters);
            c.add_group(node, "epochs");
            c.add_link(node, group_node, "epochGroup");
            Ok(())
        })?;
        self.open_block = Some(block.clone());
        Ok(block)
    }

    pub fn end_epoch_block(
        &mut self,
        end_time: DateTime<FixedOffset>,
    ) -> Result<Arc<Entity>, PersistenceError> {
        let block = self.open_block.take().ok_or(PersistenceError::NoOpenEpochBlock)?;
        write_time_attrs(&mut self.container, block.node, "endTime", &end_time);
        self.flush_logged();
        Ok(block)
    }

    /// Serializes one completed epoch into the open block. Devices referenced
    /// by the epoch are reused by `(name, manufacturer)` or created.
    pub fn serialize_epoch(
        &mut self,
        epoch: &Epoch,
        start_time: DateTime<FixedOffset>,
    ) -> Result<Arc<Entity>, PersistenceError> {
        let block = self
            .open_block
            .clone()
            .ok_or(PersistenceError::NoOpenEpochBlock)?;
        let block_protocol = self
            .container
            .string_attr(block.node, "protocolID")
            .unwrap_or_default();
        if block_protocol != epoch.protocol_id {
            return Err(PersistenceError::ProtocolMismatch {
                block: block_protocol,
                epoch: epoch.protocol_id.clone(),
            });
        }
        // resolve every referenced device up front
        let mut device_nodes: IndexMap<String, NodeIndex> = IndexMap::new();
        let referenced: Vec<_> = epoch
            .stimuli()
            .keys()
            .chain(epoch.responses().keys())
            .chain(epoch.backgrounds().keys())
            .cloned()
            .collect();
        for info in referenced {
            let key = format!("{}\u{0}{}", info.name, info.manufacturer);
            if device_nodes.contains_key(&key) {
                continue;
            }
            let device = match self.device(&info.name, &info.manufacturer)? {
                Some(d) => d,
                None => self.add_device(&info.name, &info.manufacturer)?,
            };
            device_nodes.insert(key, device.node);
        }
        let device_node = |info: &crate::device::DeviceInfo| -> NodeIndex {
            device_nodes[&format!("{}\u{0}{}", info.name, info.manufacturer)]
        };

        let holder = self
            .container
            .child(block.node, "epochs")
            .ok_or_else(|| PersistenceError::Corrupt("block has no epochs".to_string()))?;
        let duration = epoch.duration();
        let end_time = duration.map(|d| start_time + chrono::Duration::from_std(d).unwrap());
        let parameters = epoch.protocol_parameters.clone();
        let keywords: Vec<String> = epoch.keywords.iter().cloned().collect();
        let properties = epoch.properties.clone();

        struct StimulusRow {
            device: NodeIndex,
            prefix: String,
            stimulus_id: String,
            units: String,
            sample_rate: Measurement,
            duration: Option<Duration>,
            parameters: IndexMap<String, Value>,
            snapshot: Option<Vec<Measurement>>,
            spans: Vec<ConfigurationSpan>,
        }
        let stimuli: Vec<StimulusRow> = epoch
            .stimuli()
            .iter()
            .map(|(info, stimulus)| StimulusRow {
                device: device_node(info),
                prefix: info.name.clone(),
                stimulus_id: stimulus.stimulus_id().to_string(),
                units: stimulus.units().to_string(),
                sample_rate: stimulus.sample_rate(),
                duration: stimulus.duration(),
                parameters: stimulus.parameters().clone(),
                snapshot: stimulus.data_snapshot(),
                spans: stimulus.output_log().spans(),
            })
            .collect();

        struct ResponseRow {
            device: NodeIndex,
            prefix: String,
            sample_rate: Measurement,
            input_time: Option<DateTime<FixedOffset>>,
            data: Vec<Measurement>,
            spans: Vec<ConfigurationSpan>,
        }
        let mut responses: Vec<ResponseRow> = Vec::new();
        for (info, slot) in epoch.responses() {
            let sample_rate = slot
                .response
                .sample_rate()
                .map_err(|e| PersistenceError::Data(e.to_string()))?
                .unwrap_or_else(|| slot.sample_rate.clone());
            responses.push(ResponseRow {
                device: device_node(info),
                prefix: info.name.clone(),
                sample_rate,
                input_time: slot.response.input_time(),
                data: slot.response.data(),
                spans: slot.response.configuration_spans(),
            });
        }

        struct BackgroundRow {
            device: NodeIndex,
            prefix: String,
            value: Measurement,
            sample_rate: Measurement,
            spans: Vec<ConfigurationSpan>,
        }
        let backgrounds: Vec<BackgroundRow> = epoch
            .backgrounds()
            .iter()
            .map(|(info, background)| BackgroundRow {
                device: device_node(info),
                prefix: info.name.clone(),
                value: background.value.clone(),
                sample_rate: background.sample_rate.clone(),
                spans: background.output_log().spans(),
            })
            .collect();

        self.insert_entity(holder, "epoch", EntityKind::Epoch, move |c, node, _| {
            write_time_attrs(c, node, "startTime", &start_time);
            if let Some(end) = &end_time {
                write_time_attrs(c, node, "endTime", end);
            }
            let params = c.add_group(node, "protocolParameters");
            write_value_attrs(c, params, &parameters);
            if !keywords.is_empty() {
                c.set_attr(node, "keywords", AttrValue::Str(keywords.join(",")));
            }
            if !properties.is_empty() {
                let props = c.add_group(node, "properties");
                write_value_attrs(c, props, &properties);
            }

            let stimuli_holder = c.add_group(node, "stimuli");
            for row in stimuli {
                let uuid = Uuid::new_v4();
                let s = c.add_group(stimuli_holder, &format!("{}-{}", row.prefix, uuid));
                c.set_attr(s, "uuid", AttrValue::Str(uuid.to_string()));
                c.set_attr(s, "stimulusID", AttrValue::Str(row.stimulus_id));
                c.set_attr(s, "units", AttrValue::Str(row.units));
                write_rate_attrs(c, s, &row.sample_rate);
                if let Some(d) = row.duration {
                    c.set_attr(s, "durationSeconds", AttrValue::Float(d.as_secs_f64()));
                }
                let params = c.add_group(s, "parameters");
                write_value_attrs(c, params, &row.parameters);
                if let Some(snapshot) = row.snapshot {
                    write_measurement_dataset(c, s, "data", &snapshot)?;
                }
                write_configuration_spans(c, s, &row.spans);
                c.add_link(s, row.device, "device");
            }

            let responses_holder = c.add_group(node, "responses");
            for row in responses {
                let uuid = Uuid::new_v4();
                let r = c.add_group(responses_holder, &format!("{}-{}", row.prefix, uuid));
                c.set_attr(r, "uuid", AttrValue::Str(uuid.to_string()));
                write_rate_attrs(c, r, &row.sample_rate);
                if let Some(t) = &row.input_time {
                    write_time_attrs(c, r, "inputTime", t);
                }
                write_measurement_dataset(c, r, "data", &row.data)?;
                write_configuration_spans(c, r, &row.spans);
                c.add_link(r, row.device, "device");
            }

            let backgrounds_holder = c.add_group(node, "backgrounds");
            for row in backgrounds {
                let uuid = Uuid::new_v4();
                let b = c.add_group(backgrounds_holder, &format!("{}-{}", row.prefix, uuid));
                c.set_attr(b, "uuid", AttrValue::Str(uuid.to_string()));
                c.set_attr(b, "value", AttrValue::Float(row.value.base_quantity()));
                c.set_attr(b, "valueUnits", AttrValue::Str(row.value.base_unit.clone()));
                write_rate_attrs(c, b, &row.sample_rate);
                write_configuration_spans(c, b, &row.spans);
                c.add_link(b, row.device, "device");
            }
            Ok(())
        })
    }

    /// Ends any open block and group, stamps the experiment's end time and
    /// releases the container.
    pub fn close(mut self, end_time: DateTime<FixedOffset>) -> Result<(), PersistenceError> {
        if self.open_block.is_some() {
            self.end_epoch_block(end_time)?;
        }
        while !self.open_groups.is_empty() {
            self.end_epoch_group(end_time)?;
        }
        write_time_attrs(&mut self.container, self.experiment.node, "endTime", &end_time);
        self.container.flush()?;
        Ok(())
    }

    // ---- annotations ----

    pub fn add_note(
        &mut self,
        entity: &Entity,
        time: DateTime<FixedOffset>,
        text: &str,
    ) -> Result<(), PersistenceError> {
        let node = self.live_node(entity)?;
        let record = NoteRecord {
            ticks: time::datetime_to_ticks(&time),
            offset_hours: time::datetime_offset_hours(&time),
            text: text.to_string(),
        };
        let group = self.container.group_mut(node);
        match group
            .datasets
            .entry("notes".to_string())
            .or_insert_with(|| Dataset::Notes(Vec::new()))
        {
            Dataset::Notes(records) => records.push(record),
            _ => return Err(PersistenceError::Corrupt("notes dataset has wrong type".to_string())),
        }
        self.flush_logged();
        Ok(())
    }

    pub fn notes(&self, entity: &Entity) -> Result<Vec<Note>, PersistenceError> {
        let node = self.live_node(entity)?;
        match self.container.group(node).datasets.get("notes") {
            Some(Dataset::Notes(records)) => Ok(records
                .iter()
                .map(|r| Note {
                    time: time::datetime_from_ticks(r.ticks, r.offset_hours),
                    text: r.text.clone(),
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    pub fn add_keyword(&mut self, entity: &Entity, keyword: &str) -> Result<(), PersistenceError> {
        let node = self.live_node(entity)?;
        let mut keywords = self.keywords(entity)?;
        if !keywords.iter().any(|k| k == keyword) {
            keywords.push(keyword.to_string());
        }
        self.container
            .set_attr(node, "keywords", AttrValue::Str(keywords.join(",")));
        self.flush_logged();
        Ok(())
    }

    pub fn remove_keyword(
        &mut self,
        entity: &Entity,
        keyword: &str,
    ) -> Result<(), PersistenceError> {
        let node = self.live_node(entity)?;
        let keywords: Vec<String> = self
            .keywords(entity)?
            .into_iter()
            .filter(|k| k != keyword)
            .collect();
        if keywords.is_empty() {
            self.container.remove_attr(node, "keywords");
        } else {
            self.container
                .set_attr(node, "keywords", AttrValue::Str(keywords.join(",")));
        }
        self.flush_logged();
        Ok(())
    }

    pub fn keywords(&self, entity: &Entity) -> Result<Vec<String>, PersistenceError> {
        let node = self.live_node(entity)?;
        Ok(match self.container.string_attr(node, "keywords") {
            Some(joined) if !joined.is_empty() => {
                joined.split(',').map(|s| s.to_string()).collect()
            }
            _ => Vec::new(),
        })
    }

    pub fn set_property(
        &mut self,
        entity: &Entity,
        key: &str,
        value: Value,
    ) -> Result<(), PersistenceError> {
        let node = self.live_node(entity)?;
        let props = self.container.ensure_child(node, "properties");
        let mut single = IndexMap::new();
        single.insert(key.to_string(), value);
        write_value_attrs(&mut self.container, props, &single);
        self.flush_logged();
        Ok(())
    }

    pub fn properties(&self, entity: &Entity) -> Result<IndexMap<String, Value>, PersistenceError> {
        let node = self.live_node(entity)?;
        match self.container.child(node, "properties") {
            Some(props) => Ok(read_value_attrs(&self.container, props)),
            None => Ok(IndexMap::new()),
        }
    }

    // ---- navigation ----

    fn entities_in(
        &self,
        holder: NodeIndex,
        kind: EntityKind,
    ) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        let mut entities = Vec::new();
        for (_, node) in self.container.children(holder) {
            entities.push(self.entity_at(node, kind)?);
        }
        Ok(entities)
    }

    /// Epoch groups owned by the experiment or by `parent`.
    pub fn epoch_groups(
        &self,
        parent: Option<&Entity>,
    ) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        let owner = match parent {
            Some(p) => self.live_node(p)?,
            None => self.experiment.node,
        };
        let holder = match self.container.child(owner, "epochGroups") {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        self.entities_in(holder, EntityKind::EpochGroup)
    }

    /// Every group recorded against `source`, via its back-references.
    pub fn source_epoch_groups(
        &self,
        source: &Entity,
    ) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        let node = self.live_node(source)?;
        let holder = match self.container.child(node, "epochGroups") {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        let mut groups = Vec::new();
        for (_, target) in self.container.links(holder) {
            groups.push(self.entity_at(target, EntityKind::EpochGroup)?);
        }
        Ok(groups)
    }

    pub fn epoch_blocks(&self, group: &Entity) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        let node = self.live_node(group)?;
        let holder = match self.container.child(node, "epochBlocks") {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        self.entities_in(holder, EntityKind::EpochBlock)
    }

    pub fn epochs(&self, block: &Entity) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        let node = self.live_node(block)?;
        let holder = match self.container.child(node, "epochs") {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        self.entities_in(holder, EntityKind::Epoch)
    }

    pub fn epoch_stimuli(&self, epoch: &Entity) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        self.epoch_children(epoch, "stimuli", EntityKind::Stimulus)
    }

    pub fn epoch_responses(&self, epoch: &Entity) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        self.epoch_children(epoch, "responses", EntityKind::Response)
    }

    pub fn epoch_backgrounds(&self, epoch: &Entity) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        self.epoch_children(epoch, "backgrounds", EntityKind::Background)
    }

    fn epoch_children(
        &self,
        epoch: &Entity,
        holder_name: &str,
        kind: EntityKind,
    ) -> Result<Vec<Arc<Entity>>, PersistenceError> {
        let node = self.live_node(epoch)?;
        let holder = match self.container.child(node, holder_name) {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        self.entities_in(holder, kind)
    }

    pub fn label(&self, entity: &Entity) -> Result<Option<String>, PersistenceError> {
        let node = self.live_node(entity)?;
        Ok(self.container.string_attr(node, "label"))
    }

    pub fn string_attr(
        &self,
        entity: &Entity,
        name: &str,
    ) -> Result<Option<String>, PersistenceError> {
        let node = self.live_node(entity)?;
        Ok(self.container.string_attr(node, name))
    }

    pub fn float_attr(
        &self,
        entity: &Entity,
        name: &str,
    ) -> Result<Option<f64>, PersistenceError> {
        let node = self.live_node(entity)?;
        Ok(match self.container.attr(node, name) {
            Some(AttrValue::Float(v)) => Some(*v),
            _ => None,
        })
    }

    pub fn start_time(
        &self,
        entity: &Entity,
    ) -> Result<Option<DateTime<FixedOffset>>, PersistenceError> {
        let node = self.live_node(entity)?;
        Ok(read_time_attrs(&self.container, node, "startTime"))
    }

    pub fn end_time(
        &self,
        entity: &Entity,
    ) -> Result<Option<DateTime<FixedOffset>>, PersistenceError> {
        let node = self.live_node(entity)?;
        Ok(read_time_attrs(&self.container, node, "endTime"))
    }

    /// Protocol parameters of an epoch or block, stimulus parameters of a
    /// stimulus.
    pub fn parameters(&self, entity: &Entity) -> Result<IndexMap<String, Value>, PersistenceError> {
        let node = self.live_node(entity)?;
        let name = match entity.kind {
            EntityKind::Stimulus => "parameters",
            _ => "protocolParameters",
        };
        match self.container.child(node, name) {
            Some(params) => Ok(read_value_attrs(&self.container, params)),
            None => Ok(IndexMap::new()),
        }
    }

    /// The measurement array of a response, or a stimulus's verbatim
    /// snapshot.
    pub fn measurement_data(
        &self,
        entity: &Entity,
    ) -> Result<Option<Vec<Measurement>>, PersistenceError> {
        let node = self.live_node(entity)?;
        match self.container.group(node).datasets.get("data") {
            Some(Dataset::Measurements(records)) => Ok(Some(
                records
                    .iter()
                    .map(|r| Measurement::base(r.quantity, &r.unit))
                    .collect(),
            )),
            _ => Ok(None),
        }
    }

    /// The ordered configuration spans of a response, stimulus or
    /// background.
    pub fn configuration_spans(
        &self,
        entity: &Entity,
    ) -> Result<Vec<PersistedSpan>, PersistenceError> {
        let node = self.live_node(entity)?;
        let holder = match self.container.child(node, "configurationSpans") {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        let mut spans = Vec::new();
        for (_, span_node) in self.container.children(holder) {
            let start_time_seconds = match self.container.attr(span_node, "startTimeSeconds") {
                Some(AttrValue::Float(v)) => *v,
                _ => 0.0,
            };
            let time_span_seconds = match self.container.attr(span_node, "timeSpanSeconds") {
                Some(AttrValue::Float(v)) => *v,
                _ => 0.0,
            };
            let nodes = self
                .container
                .children(span_node)
                .into_iter()
                .map(|(name, config_node)| {
                    (name, read_value_attrs(&self.container, config_node))
                })
                .collect();
            spans.push(PersistedSpan {
                start_time_seconds,
                time_span_seconds,
                nodes,
            });
        }
        Ok(spans)
    }

    /// Resolves an entity's `device` cross-link.
    pub fn device_of(&self, entity: &Entity) -> Result<Option<Arc<Entity>>, PersistenceError> {
        self.cross_link(entity, "device", EntityKind::Device)
    }

    /// Resolves an epoch group's `source` cross-link.
    pub fn source_of(&self, entity: &Entity) -> Result<Option<Arc<Entity>>, PersistenceError> {
        self.cross_link(entity, "source", EntityKind::Source)
    }

    fn cross_link(
        &self,
        entity: &Entity,
        name: &str,
        kind: EntityKind,
    ) -> Result<Option<Arc<Entity>>, PersistenceError> {
        let node = self.live_node(entity)?;
        match self.container.child(node, name) {
            Some(target) => Ok(Some(self.entity_at(target, kind)?)),
            None => Ok(None),
        }
    }

    // ---- deletion ----

    /// Deletes an entity and everything it owns. The experiment, open groups,
    /// the open block and sources with recorded groups are protected.
    pub fn delete(&mut self, entity: &Entity) -> Result<(), PersistenceError> {
        let node = self.live_node(entity)?;
        match entity.kind {
            EntityKind::Experiment => {
                return Err(PersistenceError::ProtectedEntity("the experiment".to_string()));
            }
            EntityKind::EpochGroup => {
                if self.open_groups.iter().any(|g| g.uuid == entity.uuid) {
                    return Err(PersistenceError::ProtectedEntity(
                        "an open epoch group".to_string(),
                    ));
                }
            }
            EntityKind::EpochBlock => {
                if self
                    .open_block
                    .as_ref()
                    .map_or(false, |b| b.uuid == entity.uuid)
                {
                    return Err(PersistenceError::ProtectedEntity(
                        "the open epoch block".to_string(),
                    ));
                }
            }
            EntityKind::Source => {
                if self.source_tree_has_groups(node) {
                    let label = self
                        .container
                        .string_attr(node, "label")
                        .unwrap_or_else(|| entity.uuid.to_string());
                    return Err(PersistenceError::SourceHasGroups(label));
                }
            }
            _ => {}
        }
        self.container.remove_subtree(node);
        self.container.collect_garbage();
        self.cache.lock().unwrap().remove(&entity.uuid);
        self.flush_logged();
        Ok(())
    }

    /// True when this source or any descendant source has an epoch group
    /// recorded against it.
    fn source_tree_has_groups(&self, node: NodeIndex) -> bool {
        if let Some(backrefs) = self.container.child(node, "epochGroups") {
            if !self.container.links(backrefs).is_empty() {
                return true;
            }
        }
        if let Some(children) = self.container.child(node, "sources") {
            for (_, child) in self.container.children(children) {
                if self.source_tree_has_groups(child) {
                    return true;
                }
            }
        }
        false
    }
}

fn read_uuid(container: &Container, node: NodeIndex) -> Result<Uuid, PersistenceError> {
    let raw = container
        .string_attr(node, "uuid")
        .ok_or_else(|| PersistenceError::Corrupt("entity group without uuid".to_string()))?;
    Uuid::parse_str(&raw).map_err(|_| PersistenceError::Corrupt(format!("bad uuid {}", raw)))
}

fn write_time_attrs(
    container: &mut Container,
    node: NodeIndex,
    prefix: &str,
    t: &DateTime<FixedOffset>,
) {
    container.set_attr(
        node,
        &format!("{}DotNetDateTimeOffsetTicks", prefix),
        AttrValue::Int(time::datetime_to_ticks(t)),
    );
    container.set_attr(
        node,
        &format!("{}DotNetDateTimeOffsetOffsetHours", prefix),
        AttrValue::Float(time::datetime_offset_hours(t)),
    );
}

fn read_time_attrs(
    container: &Container,
    node: NodeIndex,
    prefix: &str,
) -> Option<DateTime<FixedOffset>> {
    let ticks = match container.attr(node, &format!("{}DotNetDateTimeOffsetTicks", prefix)) {
        Some(AttrValue::Int(v)) => *v,
        _ => return None,
    };
    let offset_hours =
        match container.attr(node, &format!("{}DotNetDateTimeOffsetOffsetHours", prefix)) {
            Some(AttrValue::Float(v)) => *v,
            _ => return None,
        };
    Some(time::datetime_from_ticks(ticks, offset_hours))
}

fn write_rate_attrs(container: &mut Container, node: NodeIndex, rate: &Measurement) {
    container.set_attr(node, "sampleRate", AttrValue::Float(rate.base_quantity()));
    container.set_attr(
        node,
        "sampleRateUnits",
        AttrValue::Str(rate.base_unit.clone()),
    );
}

/// Writes a value dictionary as attributes; a `Measurement` becomes the
/// `(key, key_quantity, key_units)` triple.
fn write_value_attrs(container: &mut Container, node: NodeIndex, values: &IndexMap<String, Value>) {
    for (key, value) in values {
        match value {
            Value::Bool(v) => container.set_attr(node, key, AttrValue::Bool(*v)),
            Value::SignedInt(v) => container.set_attr(node, key, AttrValue::Int(*v)),
            Value::UnsignedInt(v) => container.set_attr(node, key, AttrValue::Uint(*v)),
            Value::Float(v) => container.set_attr(node, key, AttrValue::Float(*v)),
            Value::Str(v) => container.set_attr(node, key, AttrValue::Str(v.clone())),
            Value::Measurement(m) => {
                container.set_attr(node, key, AttrValue::Float(m.base_quantity()));
                container.set_attr(
                    node,
                    &format!("{}_quantity", key),
                    AttrValue::Float(m.quantity),
                );
                container.set_attr(
                    node,
                    &format!("{}_units", key),
                    AttrValue::Str(m.base_unit.clone()),
                );
            }
            Value::BoolArray(v) => container.set_attr(node, key, AttrValue::BoolArray(v.clone())),
            Value::SignedIntArray(v) => {
                container.set_attr(node, key, AttrValue::IntArray(v.clone()))
            }
            Value::UnsignedIntArray(v) => {
                container.set_attr(node, key, AttrValue::UintArray(v.clone()))
            }
            Value::FloatArray(v) => {
                container.set_attr(node, key, AttrValue::FloatArray(v.clone()))
            }
        }
    }
}

/// Reads a value dictionary back, folding measurement triples into
/// `Value::Measurement`.
fn read_value_attrs(container: &Container, node: NodeIndex) -> IndexMap<String, Value> {
    let attributes = &container.group(node).attributes;
    let mut values = IndexMap::new();
    for (key, attr) in attributes {
        if key.ends_with("_units") || key.ends_with("_quantity") {
            let base = key
                .trim_end_matches("_units")
                .trim_end_matches("_quantity");
            if attributes.contains_key(base) && attributes.contains_key(&format!("{}_units", base))
            {
                continue;
            }
        }
        let units_key = format!("{}_units", key);
        if let (Some(AttrValue::Float(q)), Some(AttrValue::Str(unit))) =
            (Some(attr), attributes.get(&units_key))
        {
            values.insert(
                key.clone(),
                Value::Measurement(Measurement::base(*q, unit)),
            );
            continue;
        }
        let value = match attr {
            AttrValue::Int(v) => Value::SignedInt(*v),
            AttrValue::Uint(v) => Value::UnsignedInt(*v),
            AttrValue::Float(v) => Value::Float(*v),
            AttrValue::Bool(v) => Value::Bool(*v),
            AttrValue::Str(v) => Value::Str(v.clone()),
            AttrValue::IntArray(v) => Value::SignedIntArray(v.clone()),
            AttrValue::UintArray(v) => Value::UnsignedIntArray(v.clone()),
            AttrValue::FloatArray(v) => Value::FloatArray(v.clone()),
            AttrValue::BoolArray(v) => Value::BoolArray(v.clone()),
        };
        values.insert(key.clone(), value);
    }
    values
}

fn write_measurement_dataset(
    container: &mut Container,
    node: NodeIndex,
    name: &str,
    samples: &[Measurement],
) -> Result<(), PersistenceError> {
    let records: Vec<MeasurementRecord> = samples
        .iter()
        .map(|m| MeasurementRecord {
            quantity: m.base_quantity(),
            unit: m.base_unit.clone(),
        })
        .collect();
    for record in &records {
        if record.unit.as_bytes().len() > container::UNIT_FIELD_LEN {
            return Err(PersistenceError::UnitTooLong(record.unit.clone()));
        }
    }
    container
        .group_mut(node)
        .datasets
        .insert(name.to_string(), Dataset::Measurements(records));
    Ok(())
}

/// `span_i` groups with running start offsets, one subgroup per pipeline
/// node.
fn write_configuration_spans(
    container: &mut Container,
    node: NodeIndex,
    spans: &[ConfigurationSpan],
) {
    let holder = container.add_group(node, "configurationSpans");
    let mut start = 0.0f64;
    for (i, span) in spans.iter().enumerate() {
        let group = container.add_group(holder, &format!("span_{}", i));
        container.set_attr(group, "index", AttrValue::Uint(i as u64));
        container.set_attr(group, "startTimeSeconds", AttrValue::Float(start));
        container.set_attr(
            group,
            "timeSpanSeconds",
            AttrValue::Float(span.time.as_secs_f64()),
        );
        start += span.time.as_secs_f64();
        for configuration in &span.node_configurations {
            let node_group = container.add_group(group, &configuration.name);
            write_value_attrs(container, node_group, &configuration.configuration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    use crate::device::DeviceInfo;
    use crate::io_data::InputData;
    use crate::io_data::OutputData;
    use crate::stimulus::RenderedStimulus;

    fn at(minute: u32) -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(2022, 6, 1, 10, minute, 0)
            .unwrap()
            .fixed_offset()
    }

    fn amp() -> DeviceInfo {
        DeviceInfo::new("D", "M")
    }

    fn proto_parameters() -> IndexMap<String, Value> {
        let mut parameters = IndexMap::new();
        parameters.insert("a".to_string(), Value::SignedInt(1));
        parameters.insert("b".to_string(), Value::Float(1.5));
        parameters
    }

    fn scenario_epoch() -> Epoch {
        let mut epoch = Epoch::new("edu.example.proto", proto_parameters());
        let data = OutputData::new(
            vec![Measurement::base(5.0, "mV"); 1000], // 1 s at 1 kHz
            Measurement::hertz(1000.0),
            false,
        )
        .unwrap();
        epoch.add_stimulus(
            amp(),
            Arc::new(
                RenderedStimulus::new("x", proto_parameters(), data, None).unwrap(),
            ),
        );
        epoch
    }

    #[test]
    fn full_session_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.ephys");
        let mut persistor = Persistor::create(&path, "P", at(0)).unwrap();
        persistor.add_device("D", "M").unwrap();
        let source = persistor.add_source("S", None).unwrap();
        persistor.begin_epoch_group("G", &source, at(1)).unwrap();
        persistor
            .begin_epoch_block("edu.example.proto", proto_parameters(), at(2))
            .unwrap();
        persistor.serialize_epoch(&scenario_epoch(), at(2)).unwrap();
        persistor.end_epoch_block(at(3)).unwrap();
        persistor.end_epoch_group(at(4)).unwrap();
        persistor.close(at(5)).unwrap();

        let reopened = Persistor::open(&path).unwrap();
        assert_eq!(reopened.purpose(), Some("P".to_string()));
        assert_eq!(
            reopened.start_time(&reopened.experiment()).unwrap(),
            Some(at(0))
        );
        assert_eq!(
            reopened.end_time(&reopened.experiment()).unwrap(),
            Some(at(5))
        );

        let devices = reopened.devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(
            reopened.string_attr(&devices[0], "name").unwrap(),
            Some("D".to_string())
        );

        let sources = reopened.sources(None).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(reopened.label(&sources[0]).unwrap(), Some("S".to_string()));

        let groups = reopened.epoch_groups(None).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(reopened.label(&groups[0]).unwrap(), Some("G".to_string()));
        assert_eq!(reopened.start_time(&groups[0]).unwrap(), Some(at(1)));
        assert_eq!(reopened.end_time(&groups[0]).unwrap(), Some(at(4)));
        // the group's source cross-link resolves to the same wrapper
        let linked_source = reopened.source_of(&groups[0]).unwrap().unwrap();
        assert!(Arc::ptr_eq(&linked_source, &sources[0]));
        // and the source's back-reference sees the group
        let recorded = reopened.source_epoch_groups(&sources[0]).unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(Arc::ptr_eq(&recorded[0], &groups[0]));

        let blocks = reopened.epoch_blocks(&groups[0]).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            reopened.string_attr(&blocks[0], "protocolID").unwrap(),
            Some("edu.example.proto".to_string())
        );
        assert_eq!(reopened.parameters(&blocks[0]).unwrap(), proto_parameters());

        let epochs = reopened.epochs(&blocks[0]).unwrap();
        assert_eq!(epochs.len(), 1);
        assert_eq!(reopened.start_time(&epochs[0]).unwrap(), Some(at(2)));
        assert_eq!(
            reopened.end_time(&epochs[0]).unwrap(),
            Some(at(2) + chrono::Duration::seconds(1))
        );
        assert_eq!(reopened.parameters(&epochs[0]).unwrap(), proto_parameters());

        let stimuli = reopened.epoch_stimuli(&epochs[0]).unwrap();
        assert_eq!(stimuli.len(), 1);
        assert_eq!(
            reopened.string_attr(&stimuli[0], "stimulusID").unwrap(),
            Some("x".to_string())
        );
        assert_eq!(
            reopened.float_attr(&stimuli[0], "durationSeconds").unwrap(),
            Some(1.0)
        );
        assert_eq!(reopened.parameters(&stimuli[0]).unwrap(), proto_parameters());
        let snapshot = reopened.measurement_data(&stimuli[0]).unwrap().unwrap();
        assert_eq!(snapshot.len(), 1000);
        assert_eq!(snapshot[0], Measurement::base(5.0, "mV"));
        // the stimulus's device cross-link is the registered device
        let device = reopened.device_of(&stimuli[0]).unwrap().unwrap();
        assert!(Arc::ptr_eq(&device, &devices[0]));
    }

    #[test]
    fn identity_cache_returns_one_wrapper_per_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.ephys");
        let mut persistor = Persistor::create(&path, "P", at(0)).unwrap();
        persistor.add_source("S", None).unwrap();
        let first = persistor.sources(None).unwrap().remove(0);
        let second = persistor.sources(None).unwrap().remove(0);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(
            &persistor.entity(&first.uuid).unwrap(),
            &first
        ));
    }

    #[test]
    fn devices_are_unique_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.ephys");
        let mut persistor = Persistor::create(&path, "P", at(0)).unwrap();
        persistor.add_device("D", "M").unwrap();
        assert!(matches!(
            persistor.add_device("D", "M"),
            Err(PersistenceError::DuplicateDevice(_))
        ));
        // one name under a second manufacturer is a different device
        persistor.add_device("D", "M2").unwrap();

        let source = persistor.add_source("S", None).unwrap();
        persistor.begin_epoch_group("G", &source, at(1)).unwrap();
        persistor
            .begin_epoch_block("edu.example.proto", IndexMap::new(), at(2))
            .unwrap();
        let mut epoch = scenario_epoch();
        epoch.protocol_id = "edu.example.proto".to_string();
        persistor.serialize_epoch(&epoch, at(2)).unwrap();
        assert_eq!(persistor.devices().unwrap().len(), 2);
    }

    #[test]
    fn session_state_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.ephys");
        let mut persistor = Persistor::create(&path, "P", at(0)).unwrap();
        assert!(matches!(
            persistor.begin_epoch_block("p", IndexMap::new(), at(1)),
            Err(PersistenceError::NoOpenEpochGroup)
        ));
        let source = persistor.add_source("S", None).unwrap();
        persistor.begin_epoch_group("G", &source, at(1)).unwrap();
        persistor
            .begin_epoch_block("p", IndexMap::new(), at(2))
            .unwrap();
        assert!(matches!(
            persistor.begin_epoch_block("p", IndexMap::new(), at(2)),
            Err(PersistenceError::EpochBlockAlreadyOpen)
        ));
        // the open block is protocol "p", the epoch is not
        assert!(matches!(
            persistor.serialize_epoch(&scenario_epoch(), at(2)),
            Err(PersistenceError::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn deletion_protects_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deletion.ephys");
        let mut persistor = Persistor::create(&path, "P", at(0)).unwrap();
        let experiment = persistor.experiment();
        assert!(matches!(
            persistor.delete(&experiment),
            Err(PersistenceError::ProtectedEntity(_))
        ));
        let source = persistor.add_source("S", None).unwrap();
        let group = persistor.begin_epoch_group("G", &source, at(1)).unwrap();
        assert!(matches!(
            persistor.delete(&group),
            Err(PersistenceError::ProtectedEntity(_))
        ));
        assert!(matches!(
            persistor.delete(&source),
            Err(PersistenceError::SourceHasGroups(_))
        ));
        persistor.end_epoch_group(at(2)).unwrap();
        persistor.delete(&group).unwrap();
        // the back-reference is detached with the group
        assert!(persistor.source_epoch_groups(&source).unwrap().is_empty());
        persistor.delete(&source).unwrap();
        assert!(persistor.sources(None).unwrap().is_empty());
    }

    #[test]
    fn notes_keywords_and_properties_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotations.ephys");
        let mut persistor = Persistor::create(&path, "P", at(0)).unwrap();
        let experiment = persistor.experiment();
        persistor.add_note(&experiment, at(1), "first").unwrap();
        persistor.add_note(&experiment, at(2), "second").unwrap();
        persistor.add_keyword(&experiment, "control").unwrap();
        persistor.add_keyword(&experiment, "pilot").unwrap();
        persistor.remove_keyword(&experiment, "control").unwrap();
        persistor
            .set_property(&experiment, "rig", Value::Str("two-photon".to_string()))
            .unwrap();
        persistor
            .set_property(
                &experiment,
                "holding",
                Value::Measurement(Measurement::new(-60.0, -3, "V")),
            )
            .unwrap();
        persistor
            .set_property(&experiment, "gains", Value::FloatArray(vec![1.0, 2.0]))
            .unwrap();
        persistor.close(at(3)).unwrap();

        let reopened = Persistor::open(&path).unwrap();
        let experiment = reopened.experiment();
        let notes = reopened.notes(&experiment).unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].text, "first");
        assert_eq!(notes[0].time, at(1));
        assert_eq!(notes[1].text, "second");
        assert_eq!(reopened.keywords(&experiment).unwrap(), vec!["pilot"]);
        let properties = reopened.properties(&experiment).unwrap();
        assert_eq!(
            properties.get("rig"),
            Some(&Value::Str("two-photon".to_string()))
        );
        // measurements come back in base form
        assert_eq!(
            properties.get("holding"),
            Some(&Value::Measurement(Measurement::base(-0.06, "V")))
        );
        assert_eq!(
            properties.get("gains"),
            Some(&Value::FloatArray(vec![1.0, 2.0]))
        );
    }

    #[test]
    fn failed_epoch_insert_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollback.ephys");
        let mut persistor = Persistor::create(&path, "P", at(0)).unwrap();
        let source = persistor.add_source("S", None).unwrap();
        persistor.begin_epoch_group("G", &source, at(1)).unwrap();
        let block = persistor
            .begin_epoch_block("edu.example.proto", IndexMap::new(), at(2))
            .unwrap();

        let mut epoch = Epoch::new("edu.example.proto", IndexMap::new());
        let response = epoch.record_response(amp(), Measurement::hertz(1000.0));
        let t = at(2);
        response.append(
            InputData::new(vec![Measurement::base(0.0, "mV")], Measurement::hertz(1000.0), t)
                .unwrap(),
        );
        response.append(
            InputData::new(vec![Measurement::base(0.0, "mV")], Measurement::hertz(500.0), t)
                .unwrap(),
        );
        assert!(matches!(
            persistor.serialize_epoch(&epoch, at(2)),
            Err(PersistenceError::Data(_))
        ));
        assert!(persistor.epochs(&block).unwrap().is_empty());

        // a failure inside the group build removes the partial group
        let mut epoch = Epoch::new("edu.example.proto", IndexMap::new());
        let data = OutputData::new(
            vec![Measurement::base(1.0, "picoamperes"); 10], // unit too wide
            Measurement::hertz(1000.0),
            false,
        )
        .unwrap();
        epoch.add_stimulus(
            amp(),
            Arc::new(RenderedStimulus::new("x", IndexMap::new(), data, None).unwrap()),
        );
        assert!(matches!(
            persistor.serialize_epoch(&epoch, at(2)),
            Err(PersistenceError::UnitTooLong(_))
        ));
        assert!(persistor.epochs(&block).unwrap().is_empty());
    }

    #[test]
    fn acquired_epoch_round_trips_with_wire_accounting() {
        use crate::daq::ProcessLoop;
        use crate::device::LoopbackDevice;

        let device = Arc::new(LoopbackDevice::new("D", "M", Duration::from_millis(2)));
        let mut epoch = Epoch::new("edu.example.proto", proto_parameters());
        let data = OutputData::new(
            vec![Measurement::base(1.0, "mV"); 200], // 20 ms at 10 kHz
            Measurement::hertz(10_000.0),
            false,
        )
        .unwrap();
        epoch.add_stimulus(
            amp(),
            Arc::new(RenderedStimulus::new("x", proto_parameters(), data, None).unwrap()),
        );
        epoch.record_response(amp(), Measurement::hertz(10_000.0));
        let out = epoch
            .get_output_stream(&amp(), Duration::from_millis(2))
            .unwrap();
        let input = epoch.get_input_stream(&amp()).unwrap();
        device.bind_output_stream("ao0", out, Measurement::base(0.0, "mV"));
        device.bind_input_stream("ai0", input);
        device.wire("ao0", "ai0");
        let process_loop = ProcessLoop::new(device.clone(), 2);
        process_loop.start(false).unwrap();
        process_loop.wait_until_stopped();
        process_loop.wait_for_input_tasks();
        assert!(epoch.is_complete());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acquired.ephys");
        let mut persistor = Persistor::create(&path, "P", at(0)).unwrap();
        let source = persistor.add_source("S", None).unwrap();
        persistor.begin_epoch_group("G", &source, at(1)).unwrap();
        persistor
            .begin_epoch_block("edu.example.proto", proto_parameters(), at(2))
            .unwrap();
        let start = epoch.start_time().unwrap();
        persistor.serialize_epoch(&epoch, start).unwrap();
        persistor.end_epoch_block(at(3)).unwrap();
        persistor.end_epoch_group(at(4)).unwrap();
        persistor.close(at(5)).unwrap();

        let reopened = Persistor::open(&path).unwrap();
        let group = reopened.epoch_groups(None).unwrap().remove(0);
        let block = reopened.epoch_blocks(&group).unwrap().remove(0);
        let persisted = reopened.epochs(&block).unwrap().remove(0);
        assert_eq!(
            reopened.end_time(&persisted).unwrap(),
            reopened
                .start_time(&persisted)
                .unwrap()
                .map(|t| t + chrono::Duration::milliseconds(20))
        );

        let responses = reopened.epoch_responses(&persisted).unwrap();
        assert_eq!(responses.len(), 1);
        let samples = reopened.measurement_data(&responses[0]).unwrap().unwrap();
        assert_eq!(samples.len(), 200);
        assert_eq!(samples[0], Measurement::base(1.0, "mV"));
        assert_eq!(
            reopened.float_attr(&responses[0], "sampleRate").unwrap(),
            Some(10_000.0)
        );

        // the stimulus wire log carries the loop node's configuration stamp
        let stimuli = reopened.epoch_stimuli(&persisted).unwrap();
        let spans = reopened.configuration_spans(&stimuli[0]).unwrap();
        assert!(!spans.is_empty());
        let total: f64 = spans.iter().map(|s| s.time_span_seconds).sum();
        assert!((total - 0.02).abs() < 1e-9);
        assert_eq!(spans[0].start_time_seconds, 0.0);
        let (node_name, configuration) = &spans[0].nodes[0];
        assert_eq!(node_name, "D");
        assert_eq!(
            configuration.get("processIntervalSeconds"),
            Some(&Value::Float(0.002))
        );
    }

    #[test]
    fn version_and_shape_are_validated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.ephys");
        let persistor = Persistor::create(&path, "P", at(0)).unwrap();
        persistor.close(at(1)).unwrap();

        let mut tampered = Container::open(&path).unwrap();
        let root = tampered.root();
        tampered.set_attr(root, "version", AttrValue::Uint(99));
        tampered.flush().unwrap();
        assert!(matches!(
            Persistor::open(&path),
            Err(PersistenceError::VersionMismatch { found: 99, .. })
        ));

        let mut tampered = Container::open(&path).unwrap();
        let root = tampered.root();
        tampered.set_attr(root, "version", AttrValue::Uint(PERSISTENCE_VERSION));
        tampered.add_group(root, "extra-group");
        tampered.flush().unwrap();
        assert!(matches!(
            Persistor::open(&path),
            Err(PersistenceError::MultipleTopLevelGroups(2))
        ));
    }
}
