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

//! The tick subsystem. A periodic timer source enters the kernel under the
//! interrupt token, advances the millisecond tick and second counters, and
//! drains the sleep delta-queue: only the head entry's key is decremented
//! per tick, every entry that reaches zero behind it wakes in the same pass.

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use lazy_static::lazy_static;

use super::super::qlib::common::*;
use super::super::qlib::metric::*;
use super::interrupt::*;
use super::queue::*;
use super::sched::Ready;
use super::sched::Resched;
use super::sched::RESCHED_NO;
use super::thread::*;

pub const CLKTICKS_PER_SEC: u64 = 1000;

pub static CLKTICKS: AtomicU64 = AtomicU64::new(0);
pub static CLKTIME: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    pub static ref SLEEPQ: Qid = QUETAB.With(|q| q.NewQueue().expect("queue table exhausted"));
    static ref BOOT: Instant = Instant::now();
    static ref TICK_COUNT: Arc<U64Metric> = NewU64Metric("clock.ticks", "timer ticks serviced");
}

/// Free-running cycle counter, for timestamps in diagnostics and echo
/// payloads.
pub fn ClkCount() -> u64 {
    return BOOT.elapsed().as_nanos() as u64;
}

/// Ticks within the current second.
pub fn ClkTicks() -> u64 {
    return CLKTICKS.load(Ordering::Acquire);
}

/// Seconds since boot.
pub fn ClkTime() -> u64 {
    return CLKTIME.load(Ordering::Acquire);
}

/// Service one timer tick.
pub fn ClkHandler() {
    let _im = Disable();

    TICK_COUNT.Incr();
    let ticks = CLKTICKS.fetch_add(1, Ordering::AcqRel) + 1;
    if ticks == CLKTICKS_PER_SEC {
        CLKTIME.fetch_add(1, Ordering::AcqRel);
        CLKTICKS.store(0, Ordering::Release);
    }

    let expired = QUETAB.With(|q| {
        if q.NonEmpty(*SLEEPQ) {
            return q.DecFirstKey(*SLEEPQ) <= 0;
        }
        return false;
    });
    if expired {
        Wakeup();
    }
}

/// Ready every sleeper whose delay has elapsed.
pub fn Wakeup() {
    loop {
        let tid = QUETAB.With(|q| {
            if q.NonEmpty(*SLEEPQ) && q.FirstKey(*SLEEPQ) <= 0 {
                return q.Dequeue(*SLEEPQ);
            }
            return EMPTY;
        });
        if tid == EMPTY {
            break;
        }
        let _ = Ready(tid, RESCHED_NO, CORE_ZERO);
    }
}

/// Yield the processor for at least `ms` milliseconds.
pub fn Sleep(ms: u32) -> Result<()> {
    let ticks = (ms as u64 * CLKTICKS_PER_SEC / 1000) as i32;

    let _im = Disable();
    if ticks > 0 {
        let tid = GetTid();
        if tid == TID_BAD {
            return Err(Error::SysErr);
        }
        QUETAB.With(|q| q.InsertDelta(tid, *SLEEPQ, ticks))?;
        ThrWith(tid, |t| t.state = ThrState::Sleep);
    }
    Resched()?;
    return Ok(());
}

/// Remove a thread from the sleep queue ahead of time, preserving the
/// total delay of the sleepers behind it.
pub fn Unsleep(tid: i32) -> Result<()> {
    let _im = Disable();
    if IsBadTid(tid) {
        return Err(Error::SysErr);
    }

    let state = ThrWith(tid, |t| t.state);
    if state != ThrState::Sleep && state != ThrState::Tmout {
        return Err(Error::SysErr);
    }

    QUETAB.With(|q| {
        let next = q.ents[tid as usize].next;
        if next >= 0 && (next as usize) < NTHREAD {
            q.ents[next as usize].key += q.ents[tid as usize].key;
        }
        q.GetItem(tid);
    });
    return Ok(());
}
