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

//! The hierarchical self-describing binary container.
//!
//! Groups form a DAG kept in a stable graph: owned edges are the tree, cross
//! edges are hard links into it. Each group carries an attribute table and
//! datasets of the registered compound record types. The whole graph
//! serializes to disk on `flush`; the record encodings for `MEASUREMENT` and
//! `NOTE` are bit-exact (field offsets and sizes below) so files interoperate
//! across writer implementations.

use std::fs;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use indexmap::IndexMap;
use petgraph::stable_graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;
use petgraph::visit::IntoEdgeReferences;
use petgraph::Directed;
use petgraph::Direction;

use crate::persist::PersistenceError;

const MAGIC: &[u8; 8] = b"EPHYSCON";

/// Fixed width of the `MEASUREMENT` unit field, NUL padded.
pub const UNIT_FIELD_LEN: usize = 10;

/// Notes datasets extend in chunks of this many records.
pub const NOTE_CHUNK: u32 = 64;

/// Field kinds in the self-describing type table.
const KIND_I64: u8 = 0;
const KIND_F64: u8 = 1;
const KIND_FIXED_STR: u8 = 2;
const KIND_COMPOUND: u8 = 3;
const KIND_VARLEN_STR: u8 = 4;

/// The three compound types registered at container creation. Offsets and
/// sizes are part of the interchange contract.
const COMPOUND_TYPES: &[(&str, &[(&str, u32, u32, u8)])] = &[
    (
        "DATETIMEOFFSET",
        &[("ticks", 0, 8, KIND_I64), ("offsetHours", 8, 8, KIND_F64)],
    ),
    (
        "NOTE",
        &[("time", 0, 16, KIND_COMPOUND), ("text", 16, 0, KIND_VARLEN_STR)],
    ),
    (
        "MEASUREMENT",
        &[
            ("quantity", 0, 8, KIND_F64),
            ("unit", 8, UNIT_FIELD_LEN as u32, KIND_FIXED_STR),
        ],
    ),
];

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Str(String),
    IntArray(Vec<i64>),
    UintArray(Vec<u64>),
    FloatArray(Vec<f64>),
    BoolArray(Vec<bool>),
}

/// One element of a `MEASUREMENT` dataset: base-unit quantity plus the unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub quantity: f64,
    pub unit: String,
}

/// One element of a `NOTE` dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteRecord {
    pub ticks: i64,
    pub offset_hours: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dataset {
    Measurements(Vec<MeasurementRecord>),
    Notes(Vec<NoteRecord>),
}

impl Dataset {
    fn type_name(&self) -> &'static str {
        match self {
            Dataset::Measurements(_) => "MEASUREMENT",
            Dataset::Notes(_) => "NOTE",
        }
    }

    fn chunk(&self) -> u32 {
        match self {
            Dataset::Measurements(_) => 0,
            Dataset::Notes(_) => NOTE_CHUNK,
        }
    }
}

#[derive(Debug, Default)]
pub struct Group {
    pub attributes: IndexMap<String, AttrValue>,
    pub datasets: IndexMap<String, Dataset>,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub name: String,
    /// Owned edges form the tree; the rest are hard links.
    pub owned: bool,
}

pub struct Container {
    g: StableGraph<Group, Link, Directed>,
    root: NodeIndex,
    path: PathBuf,
}

impl Container {
    /// A fresh container: the root node stands for the file itself.
    pub fn create(path: &Path) -> Container {
        let mut g = StableGraph::new();
        let root = g.add_node(Group::default());
        Container {
            g,
            root,
            path: path.to_path_buf(),
        }
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn group(&self, node: NodeIndex) -> &Group {
        &self.g[node]
    }

    pub fn group_mut(&mut self, node: NodeIndex) -> &mut Group {
        &mut self.g[node]
    }

    pub fn set_attr(&mut self, node: NodeIndex, name: &str, value: AttrValue) {
        self.g[node].attributes.insert(name.to_string(), value);
    }

    pub fn remove_attr(&mut self, node: NodeIndex, name: &str) {
        self.g[node].attributes.shift_remove(name);
    }

    pub fn attr(&self, node: NodeIndex, name: &str) -> Option<&AttrValue> {
        self.g[node].attributes.get(name)
    }

    pub fn string_attr(&self, node: NodeIndex, name: &str) -> Option<String> {
        match self.attr(node, name) {
            Some(AttrValue::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Adds an owned child group.
    pub fn add_group(&mut self, parent: NodeIndex, name: &str) -> NodeIndex {
        let child = self.g.add_node(Group::default());
        self.g.add_edge(
            parent,
            child,
            Link {
                name: name.to_string(),
                owned: true,
            },
        );
        child
    }

    /// Adds a hard link to an existing group.
    pub fn add_link(&mut self, from: NodeIndex, to: NodeIndex, name: &str) {
        self.g.add_edge(
            from,
            to,
            Link {
                name: name.to_string(),
                owned: false,
            },
        );
    }

    pub fn remove_link(&mut self, from: NodeIndex, name: &str) {
        let edge = self
            .g
            .edges_directed(from, Direction::Outgoing)
            .find(|e| e.weight().name == name)
            .map(|e| e.id());
        if let Some(edge) = edge {
            self.g.remove_edge(edge);
        }
    }

    /// Outgoing edges in insertion order.
    fn edges_in_order(&self, node: NodeIndex) -> Vec<(Link, NodeIndex)> {
        let mut edges: Vec<_> = self
            .g
            .edges_directed(node, Direction::Outgoing)
            .map(|e| (e.weight().clone(), e.target()))
            .collect();
        // the graph hands outgoing edges back newest-first
        edges.reverse();
        edges
    }

    /// Owned children in insertion order.
    pub fn children(&self, node: NodeIndex) -> Vec<(String, NodeIndex)> {
        self.edges_in_order(node)
            .into_iter()
            .filter(|(link, _)| link.owned)
            .map(|(link, target)| (link.name, target))
            .collect()
    }

    /// All outgoing links (owned and hard) in insertion order.
    pub fn links(&self, node: NodeIndex) -> Vec<(String, NodeIndex)> {
        self.edges_in_order(node)
            .into_iter()
            .map(|(link, target)| (link.name, target))
            .collect()
    }

    pub fn child(&self, node: NodeIndex, name: &str) -> Option<NodeIndex> {
        self.edges_in_order(node)
            .into_iter()
            .find(|(link, _)| link.name == name)
            .map(|(_, target)| target)
    }

    /// The named child, created as an owned group if missing.
    pub fn ensure_child(&mut self, node: NodeIndex, name: &str) -> NodeIndex {
        match self.child(node, name) {
            Some(child) => child,
            None => self.add_group(node, name),
        }
    }

    pub fn contains(&self, node: NodeIndex) -> bool {
        self.g.contains_node(node)
    }

    /// Removes a group and everything it owns. Hard links into the removed
    /// region die with their targets.
    pub fn remove_subtree(&mut self, node: NodeIndex) {
        let mut to_remove = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if to_remove.contains(&current) {
                continue;
            }
            to_remove.push(current);
            for (link, target) in self.edges_in_order(current) {
                if link.owned {
                    stack.push(target);
                }
            }
        }
        for n in to_remove {
            self.g.remove_node(n);
        }
    }

    /// Drops any group no longer reachable from the root.
    pub fn collect_garbage(&mut self) {
        let mut reachable = vec![self.root];
        let mut stack = vec![self.root];
        while let Some(current) = stack.pop() {
            for (_, target) in self.edges_in_order(current) {
                if !reachable.contains(&target) {
                    reachable.push(target);
                    stack.push(target);
                }
            }
        }
        let all: Vec<NodeIndex> = self.g.node_indices().collect();
        for n in all {
            if !reachable.contains(&n) {
                self.g.remove_node(n);
            }
        }
    }

    /// Serializes the whole graph and atomically replaces the file.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn write_to(&self, out: &mut Vec<u8>) -> Result<(), PersistenceError> {
        out.write_all(MAGIC)?;
        // self-describing type table
        out.write_u32::<LittleEndian>(COMPOUND_TYPES.len() as u32)?;
        for (name, fields) in COMPOUND_TYPES {
            write_str(out, name)?;
            out.write_u32::<LittleEndian>(fields.len() as u32)?;
            for (field, offset, size, kind) in *fields {
                write_str(out, field)?;
                out.write_u32::<LittleEndian>(*offset)?;
                out.write_u32::<LittleEndian>(*size)?;
                out.write_u8(*kind)?;
            }
        }
        // nodes
        let nodes: Vec<NodeIndex> = self.g.node_indices().collect();
        out.write_u64::<LittleEndian>(nodes.len() as u64)?;
        for node in &nodes {
            out.write_u64::<LittleEndian>(node.index() as u64)?;
            let group = &self.g[*node];
            out.write_u32::<LittleEndian>(group.attributes.len() as u32)?;
            for (name, value) in &group.attributes {
                write_str(out, name)?;
                write_attr(out, value)?;
            }
            out.write_u32::<LittleEndian>(group.datasets.len() as u32)?;
            for (name, dataset) in &group.datasets {
                write_str(out, name)?;
                write_str(out, dataset.type_name())?;
                out.write_u32::<LittleEndian>(dataset.chunk())?;
                write_dataset(out, dataset)?;
            }
        }
        // links
        let edges: Vec<_> = self
            .g
            .edge_references()
            .map(|e| (e.source(), e.target(), e.weight().clone()))
            .collect();
        out.write_u64::<LittleEndian>(edges.len() as u64)?;
        for (source, target, link) in edges {
            out.write_u64::<LittleEndian>(source.index() as u64)?;
            out.write_u64::<LittleEndian>(target.index() as u64)?;
            out.write_u8(if link.owned { 1 } else { 0 })?;
            write_str(out, &link.name)?;
        }
        out.write_u64::<LittleEndian>(self.root.index() as u64)?;
        Ok(())
    }

    pub fn open(path: &Path) -> Result<Container, PersistenceError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        let mut input = &bytes[..];
        let mut magic = [0u8; 8];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(PersistenceError::Corrupt("bad magic".to_string()));
        }
        // the type table must match the registered layouts bit for bit
        let type_count = input.read_u32::<LittleEndian>()? as usize;
        if type_count != COMPOUND_TYPES.len() {
            return Err(PersistenceError::Corrupt("unexpected type count".to_string()));
        }
        for (name, fields) in COMPOUND_TYPES {
            let found_name = read_str(&mut input)?;
            if found_name != *name {
                return Err(PersistenceError::Corrupt(format!(
                    "unexpected compound type {}",
                    found_name
                )));
            }
            let field_count = input.read_u32::<LittleEndian>()? as usize;
            if field_count != fields.len() {
                return Err(PersistenceError::Corrupt(format!(
                    "field count mismatch in {}",
                    name
                )));
            }
            for (field, offset, size, kind) in *fields {
                let found_field = read_str(&mut input)?;
                let found_offset = input.read_u32::<LittleEndian>()?;
                let found_size = input.read_u32::<LittleEndian>()?;
                let found_kind = input.read_u8()?;
                if found_field != *field
                    || found_offset != *offset
                    || found_size != *size
                    || found_kind != *kind
                {
                    return Err(PersistenceError::Corrupt(format!(
                        "field layout mismatch in {}.{}",
                        name, field
                    )));
                }
            }
        }
        let mut g: StableGraph<Group, Link, Directed> = StableGraph::new();
        let node_count = input.read_u64::<LittleEndian>()? as usize;
        let mut index_of = IndexMap::new();
        for _ in 0..node_count {
            let saved_id = input.read_u64::<LittleEndian>()?;
            let mut group = Group::default();
            let attr_count = input.read_u32::<LittleEndian>()? as usize;
            for _ in 0..attr_count {
                let name = read_str(&mut input)?;
                let value = read_attr(&mut input)?;
                group.attributes.insert(name, value);
            }
            let dataset_count = input.read_u32::<LittleEndian>()? as usize;
            for _ in 0..dataset_count {
                let name = read_str(&mut input)?;
                let type_name = read_str(&mut input)?;
                let _chunk = input.read_u32::<LittleEndian>()?;
                let dataset = read_dataset(&mut input, &type_name)?;
                group.datasets.insert(name, dataset);
            }
            index_of.insert(saved_id, g.add_node(group));
        }
        let link_count = input.read_u64::<LittleEndian>()? as usize;
        for _ in 0..link_count {
            let source = input.read_u64::<LittleEndian>()?;
            let target = input.read_u64::<LittleEndian>()?;
            let owned = input.read_u8()? == 1;
            let name = read_str(&mut input)?;
            let (source, target) = match (index_of.get(&source), index_of.get(&target)) {
                (Some(s), Some(t)) => (*s, *t),
                _ => return Err(PersistenceError::Corrupt("dangling link".to_string())),
            };
            g.add_edge(source, target, Link { name, owned });
        }
        let root_id = input.read_u64::<LittleEndian>()?;
        let root = *index_of
            .get(&root_id)
            .ok_or_else(|| PersistenceError::Corrupt("missing root".to_string()))?;
        Ok(Container {
            g,
            root,
            path: path.to_path_buf(),
        })
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<(), PersistenceError> {
    out.write_u32::<LittleEndian>(s.len() as u32)?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

fn read_str(input: &mut &[u8]) -> Result<String, PersistenceError> {
    let len = input.read_u32::<LittleEndian>()? as usize;
    let remaining: &[u8] = *input;
    if remaining.len() < len {
        return Err(PersistenceError::Corrupt("truncated string".to_string()));
    }
    let (head, rest) = remaining.split_at(len);
    let s = String::from_utf8(head.to_vec())
        .map_err(|_| PersistenceError::Corrupt("invalid utf-8".to_string()))?;
    *input = rest;
    Ok(s)
}

fn write_attr(out: &mut Vec<u8>, value: &AttrValue) -> Result<(), PersistenceError> {
    match value {
        AttrValue::Int(v) => {
            out.write_u8(0)?;
            out.write_i64::<LittleEndian>(*v)?;
        }
        AttrValue::Uint(v) => {
            out.write_u8(1)?;
            out.write_u64::<LittleEndian>(*v)?;
        }
        AttrValue::Float(v) => {
            out.write_u8(2)?;
            out.write_f64::<LittleEndian>(*v)?;
        }
        AttrValue::Bool(v) => {
            out.write_u8(3)?;
            out.write_u8(if *v { 1 } else { 0 })?;
        }
        AttrValue::Str(v) => {
            out.write_u8(4)?;
            write_str(out, v)?;
        }
        AttrValue::IntArray(v) => {
            out.write_u8(5)?;
            out.write_u32::<LittleEndian>(v.len() as u32)?;
            for x in v {
                out.write_i64::<LittleEndian>(*x)?;
            }
        }
        AttrValue::UintArray(v) => {
            out.write_u8(6)?;
            out.write_u32::<LittleEndian>(v.len() as u32)?;
            for x in v {
                out.write_u64::<LittleEndian>(*x)?;
            }
        }
        AttrValue::FloatArray(v) => {
            out.write_u8(7)?;
            out.write_u32::<LittleEndian>(v.len() as u32)?;
            for x in v {
                out.write_f64::<LittleEndian>(*x)?;
            }
        }
        AttrValue::BoolArray(v) => {
            out.write_u8(8)?;
            out.write_u32::<LittleEndian>(v.len() as u32)?;
            for x in v {
                out.write_u8(if *x { 1 } else { 0 })?;
            }
        }
    }
    Ok(())
}

fn read_attr(input: &mut &[u8]) -> Result<AttrValue, PersistenceError> {
    let tag = input.read_u8()?;
    let value = match tag {
        0 => AttrValue::Int(input.read_i64::<LittleEndian>()?),
        1 => AttrValue::Uint(input.read_u64::<LittleEndian>()?),
        2 => AttrValue::Float(input.read_f64::<LittleEndian>()?),
        3 => AttrValue::Bool(input.read_u8()? == 1),
        4 => AttrValue::Str(read_str(input)?),
        5 => {
            let n = input.read_u32::<LittleEndian>()? as usize;
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(input.read_i64::<LittleEndian>()?);
            }
            AttrValue::IntArray(v)
        }
        6 => {
            let n = input.read_u32::<LittleEndian>()? as usize;
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(input.read_u64::<LittleEndian>()?);
            }
            AttrValue::UintArray(v)
        }
        7 => {
            let n = input.read_u32::<LittleEndian>()? as usize;
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(input.read_f64::<LittleEndian>()?);
            }
            AttrValue::FloatArray(v)
        }
        8 => {
            let n = input.read_u32::<LittleEndian>()? as usize;
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(input.read_u8()? == 1);
            }
            AttrValue::BoolArray(v)
        }
        other => {
            return Err(PersistenceError::Corrupt(format!(
                "unknown attribute tag {}",
                other
            )))
        }
    };
    Ok(value)
}

fn write_dataset(out: &mut Vec<u8>, dataset: &Dataset) -> Result<(), PersistenceError> {
    match dataset {
        Dataset::Measurements(records) => {
            out.write_u64::<LittleEndian>(records.len() as u64)?;
            for record in records {
                // MEASUREMENT: quantity f64 at 0, unit char[10] at 8
                out.write_f64::<LittleEndian>(record.quantity)?;
                let bytes = record.unit.as_bytes();
                if bytes.len() > UNIT_FIELD_LEN {
                    return Err(PersistenceError::UnitTooLong(record.unit.clone()));
                }
                out.write_all(bytes)?;
                out.write_all(&vec![0u8; UNIT_FIELD_LEN - bytes.len()])?;
            }
        }
        Dataset::Notes(records) => {
            out.write_u64::<LittleEndian>(records.len() as u64)?;
            for record in records {
                // NOTE: DATETIMEOFFSET at 0 (ticks i64, offsetHours f64),
                // variable-length text after
                out.write_i64::<LittleEndian>(record.ticks)?;
                out.write_f64::<LittleEndian>(record.offset_hours)?;
                write_str(out, &record.text)?;
            }
        }
    }
    Ok(())
}

fn read_dataset(input: &mut &[u8], type_name: &str) -> Result<Dataset, PersistenceError> {
    match type_name {
        "MEASUREMENT" => {
            let n = input.read_u64::<LittleEndian>()? as usize;
            let mut records = Vec::with_capacity(n);
            for _ in 0..n {
                let quantity = input.read_f64::<LittleEndian>()?;
                let mut unit = [0u8; UNIT_FIELD_LEN];
                input.read_exact(&mut unit)?;
                let end = unit.iter().position(|b| *b == 0).unwrap_or(UNIT_FIELD_LEN);
                let unit = String::from_utf8(unit[..end].to_vec())
                    .map_err(|_| PersistenceError::Corrupt("invalid unit".to_string()))?;
                records.push(MeasurementRecord { quantity, unit });
            }
            Ok(Dataset::Measurements(records))
        }
        "NOTE" => {
            let n = input.read_u64::<LittleEndian>()? as usize;
            let mut records = Vec::with_capacity(n);
            for _ in 0..n {
                let ticks = input.read_i64::<LittleEndian>()?;
                let offset_hours = input.read_f64::<LittleEndian>()?;
                let text = read_str(input)?;
                records.push(NoteRecord {
                    ticks,
                    offset_hours,
                    text,
                });
            }
            Ok(Dataset::Notes(records))
        }
        other => Err(PersistenceError::Corrupt(format!(
            "unknown dataset type {}",
            other
        ))),
    }
}
