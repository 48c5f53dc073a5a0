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

//! Hard-coded defaults and the toml overrides for the acquisition binary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, File, FileFormat};

const SETTINGS_PATH: &str = "/etc/ephys/acquisition.toml";
const PROCESS_INTERVAL: Duration = Duration::from_millis(5);
const BLOCK_DURATION: Duration = Duration::from_millis(500);
const N_WORKERS: usize = 4;
const CONTAINER_PATH: &str = "acquisition.ephys";

#[derive(Debug)]
pub struct Settings {
    pub container_path: PathBuf,
    pub process_interval: Duration,
    /// Span of the blocks stimuli render in, independent of the loop tick.
    pub block_duration: Duration,
    pub n_workers: usize,
}

impl Settings {
    /// Reads overrides from the settings file; a missing file means
    /// defaults.
    pub fn read() -> Settings {
        let mut settings = Config::default();
        settings
            .merge(File::new(SETTINGS_PATH, FileFormat::Toml))
            .ok();
        let results = settings
            .try_into::<HashMap<String, String>>()
            .unwrap_or_default();
        let process_interval = results
            .get("process_interval_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(PROCESS_INTERVAL);
        let block_duration = results
            .get("block_duration_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(BLOCK_DURATION);
        let n_workers = results
            .get("n_workers")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(N_WORKERS);
        let container_path = PathBuf::from(
            results
                .get("container_path")
                .cloned()
                .unwrap_or_else(|| CONTAINER_PATH.to_string()),
        );
        Settings {
            container_path,
            process_interval,
            block_duration,
            n_workers,
        }
    }
}
