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

//! The thread table. Each entry is a thread control block guarded by its
//! own muxtab slot; a thread's id doubles as its queue-table entry index.

use core::cell::Cell;
use core::sync::atomic::AtomicI32;
use core::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use lazy_static::lazy_static;

use super::super::qlib::common::*;
use super::kmutex::MuxLock;

pub const NCORE: usize = 4;
pub const NTHREAD: usize = 100;

pub const CORE_ZERO: u32 = 0;
pub const CORE_ONE: u32 = 1;
pub const CORE_TWO: u32 = 2;
pub const CORE_THREE: u32 = 3;

// Null thread of core n is thread n.
pub fn IsNullThread(tid: i32) -> bool {
    return tid >= 0 && (tid as usize) < NCORE;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrState {
    Free,
    Curr,
    Ready,
    Recv,
    Sleep,
    Susp,
    Wait,
    Tmout,
}

/// Dispatch gate of one thread. The host thread backing a kernel thread is
/// parked here whenever the thread is not CURR on its core; dispatching it
/// hands over a permit, so an unpark that races the park is never lost.
pub struct Parker {
    state: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub fn New() -> Self {
        return Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
        };
    }

    pub fn Park(&self) {
        let mut permit = match self.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        while !*permit {
            permit = match self.cv.wait(permit) {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
        }
        *permit = false;
    }

    pub fn Unpark(&self) {
        let mut permit = match self.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        *permit = true;
        self.cv.notify_all();
    }
}

pub struct ThrEnt {
    pub state: ThrState,
    pub prio: i32,
    pub stkbase: usize,
    pub stklen: usize,
    pub parent: i32,
    pub core_affinity: i32,
    pub hasmsg: bool,
    pub msg: i64,
    // Semaphore this thread is blocked on while in WAIT.
    pub sem: i32,
    // Saved interrupt-token depth while the thread is switched out.
    pub intmask: usize,
    pub name: String,
    pub killed: bool,
    pub parker: Arc<Parker>,
}

impl ThrEnt {
    pub fn New() -> Self {
        return Self {
            state: ThrState::Free,
            prio: 0,
            stkbase: 0,
            stklen: 0,
            parent: TID_BAD,
            core_affinity: -1,
            hasmsg: false,
            msg: 0,
            sem: -1,
            intmask: 0,
            name: String::new(),
            killed: false,
            parker: Arc::new(Parker::New()),
        };
    }
}

lazy_static! {
    pub static ref THRTAB: Vec<MuxLock<ThrEnt>> =
        (0..NTHREAD).map(|_| MuxLock::New(ThrEnt::New())).collect();
    pub static ref THRCURRENT: Vec<AtomicI32> = (0..NCORE).map(|_| AtomicI32::new(-1)).collect();
}

pub static THRCOUNT: AtomicI32 = AtomicI32::new(0);

thread_local! {
    static CURTID: Cell<i32> = Cell::new(TID_BAD);
    static CURCORE: Cell<i32> = Cell::new(-1);
}

pub fn SetCurTid(tid: i32) {
    CURTID.with(|c| c.set(tid));
}

pub fn SetCurCore(core: i32) {
    CURCORE.with(|c| c.set(core));
}

/// Id of the calling kernel thread; TID_BAD when the caller is a plain host
/// thread (the boot context or a test harness).
pub fn GetTid() -> i32 {
    return CURTID.with(|c| c.get());
}

/// Core the calling thread is pinned to. Non-kernel callers act on core 0.
pub fn GetCpuId() -> u32 {
    let c = CURCORE.with(|c| c.get());
    if c < 0 {
        return CORE_ZERO;
    }
    return c as u32;
}

pub fn ThrWith<R>(tid: i32, f: impl FnOnce(&mut ThrEnt) -> R) -> R {
    return THRTAB[tid as usize].With(f);
}

pub fn IsBadTid(tid: i32) -> bool {
    if tid < 0 || tid as usize >= NTHREAD {
        return true;
    }
    return ThrWith(tid, |t| t.state == ThrState::Free);
}

pub fn ThrCurrent(core: u32) -> i32 {
    return THRCURRENT[core as usize].load(Ordering::Acquire);
}

pub fn GetPrio(tid: i32) -> Result<i32> {
    if IsBadTid(tid) {
        return Err(Error::SysErr);
    }
    return Ok(ThrWith(tid, |t| t.prio));
}

pub fn GetName(tid: i32) -> Result<String> {
    if IsBadTid(tid) {
        return Err(Error::SysErr);
    }
    return Ok(ThrWith(tid, |t| t.name.clone()));
}
