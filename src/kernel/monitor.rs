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

//! Monitors: recursive locks built on a binary semaphore. The owner may
//! lock again without waiting; cleanup code for a killed owner can call
//! `Unlock` `MonCount` times to fully release the monitor.

use lazy_static::lazy_static;

use super::super::qlib::common::*;
use super::super::qlib::mutex::*;
use super::interrupt::*;
use super::semaphore::*;
use super::thread::*;

pub const NMON: usize = 32;

pub const NOOWNER: i32 = TID_BAD;

pub type Mid = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonState {
    Free,
    Used,
}

pub struct MonEnt {
    pub state: MonState,
    pub owner: i32,
    pub count: usize,
    pub sem: Sid,
}

lazy_static! {
    pub static ref MONTAB: Vec<QMutex<MonEnt>> = (0..NMON)
        .map(|_| {
            QMutex::new(MonEnt {
                state: MonState::Free,
                owner: NOOWNER,
                count: 0,
                sem: -1,
            })
        })
        .collect();
}

pub fn IsBadMon(mon: Mid) -> bool {
    if mon < 0 || mon as usize >= NMON {
        return true;
    }
    return MONTAB[mon as usize].lock().state == MonState::Free;
}

pub fn MonCreate() -> Result<Mid> {
    let _im = Disable();

    let sem = SemCreate(1)?;
    for i in 0..NMON {
        let mut m = MONTAB[i].lock();
        if m.state == MonState::Free {
            m.state = MonState::Used;
            m.owner = NOOWNER;
            m.count = 0;
            m.sem = sem;
            return Ok(i as Mid);
        }
    }

    let _ = SemFree(sem);
    return Err(Error::SysErr);
}

enum LockPath {
    BecomeOwner(Sid),
    Recursed,
    WaitForOwner(Sid),
}

pub fn Lock(mon: Mid) -> Result<()> {
    let _im = Disable();
    if IsBadMon(mon) {
        return Err(Error::SysErr);
    }
    let tid = GetTid();
    if tid == TID_BAD {
        return Err(Error::SysErr);
    }

    let path = {
        let mut m = MONTAB[mon as usize].lock();
        if m.owner == NOOWNER {
            m.owner = tid;
            m.count = 1;
            LockPath::BecomeOwner(m.sem)
        } else if m.owner == tid {
            m.count += 1;
            LockPath::Recursed
        } else {
            LockPath::WaitForOwner(m.sem)
        }
    };

    match path {
        // The semaphore starts at 1, so the first owner passes straight
        // through and subsequent lockers queue behind it.
        LockPath::BecomeOwner(sem) => {
            Wait(sem)?;
        }
        LockPath::Recursed => (),
        LockPath::WaitForOwner(sem) => {
            Wait(sem)?;
            let mut m = MONTAB[mon as usize].lock();
            m.owner = tid;
            m.count = 1;
        }
    }
    return Ok(());
}

pub fn Unlock(mon: Mid) -> Result<()> {
    let _im = Disable();
    if IsBadMon(mon) {
        return Err(Error::SysErr);
    }

    let released = {
        let mut m = MONTAB[mon as usize].lock();
        if m.count == 0 {
            return Err(Error::SysErr);
        }
        m.count -= 1;
        if m.count == 0 {
            m.owner = NOOWNER;
            Some(m.sem)
        } else {
            None
        }
    };

    if let Some(sem) = released {
        Signal(sem)?;
    }
    return Ok(());
}

/// Lock depth of the monitor: 0 when unowned.
pub fn MonCount(mon: Mid) -> Result<usize> {
    if IsBadMon(mon) {
        return Err(Error::SysErr);
    }
    return Ok(MONTAB[mon as usize].lock().count);
}

pub fn MonFree(mon: Mid) -> Result<()> {
    let _im = Disable();
    if IsBadMon(mon) {
        return Err(Error::SysErr);
    }

    let mut m = MONTAB[mon as usize].lock();
    let _ = SemFree(m.sem);
    m.state = MonState::Free;
    return Ok(());
}
