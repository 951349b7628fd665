// Copyright (c) 2021 Quark Container Authors / 2018 The gVisor Authors.
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

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use lazy_static::lazy_static;

use super::mutex::*;

lazy_static! {
    pub static ref ALL_METRICS: QMutex<MetricSet> = QMutex::new(MetricSet::New());
}

pub fn NewU64Metric(name: &str, description: &str) -> Arc<U64Metric> {
    return ALL_METRICS
        .lock()
        .RegisterU64Metric(name.to_string(), description.to_string());
}

pub trait Metric: Send + Sync {
    fn Value(&self) -> u64;
}

pub struct U64Metric {
    val: AtomicU64,
}

impl Metric for U64Metric {
    fn Value(&self) -> u64 {
        return self.val.load(Ordering::SeqCst);
    }
}

impl U64Metric {
    pub fn New() -> Self {
        return Self {
            val: AtomicU64::new(0),
        };
    }

    pub fn Incr(&self) {
        self.val.fetch_add(1, Ordering::SeqCst);
    }

    pub fn IncrBy(&self, v: u64) {
        self.val.fetch_add(v, Ordering::SeqCst);
    }
}

pub struct MetricData {
    pub description: String,
    pub metric: Arc<dyn Metric>,
}

pub struct MetricSet {
    pub m: BTreeMap<String, MetricData>,
}

impl MetricSet {
    pub fn New() -> Self {
        return Self { m: BTreeMap::new() };
    }

    pub fn RegisterU64Metric(&mut self, name: String, description: String) -> Arc<U64Metric> {
        let metric = Arc::new(U64Metric::New());
        let data = MetricData {
            description: description,
            metric: metric.clone(),
        };
        self.m.insert(name, data);
        return metric;
    }

    pub fn Value(&self, name: &str) -> Option<u64> {
        match self.m.get(name) {
            None => None,
            Some(d) => Some(d.metric.Value()),
        }
    }
}
