// Copyright (c) 2021 Quark Container Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::common::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Tick interrupts per second driven into the kernel by the timer source.
    pub TickHz: u64,
    // Bytes of simulated heap backing stacks and buffer pools.
    pub HeapSize: usize,
    // Packet buffers in the shared network pool.
    pub NetPoolSize: usize,
    // Default stack reservation for Create when the caller passes 0.
    pub InitStk: usize,
    // Default priority for kernel service threads.
    pub InitPrio: i32,
}

impl Default for Config {
    fn default() -> Self {
        return Self {
            TickHz: 1000,
            HeapSize: 8 << 20,
            NetPoolSize: 64,
            InitStk: 16384,
            InitPrio: 20,
        };
    }
}

impl Config {
    pub fn Load(s: &str) -> Result<Self> {
        match serde_json::from_str(s) {
            Ok(c) => Ok(c),
            Err(e) => {
                error!("Config::Load parse error: {}", e);
                Err(Error::SysErr)
            }
        }
    }

    pub fn Print(&self) -> String {
        return serde_json::to_string(self).unwrap_or_default();
    }
}
