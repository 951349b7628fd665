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

//! One-slot inter-thread messages. Every thread control block carries a
//! single inbox word; a second send before the receiver drains it fails.

use super::super::qlib::common::*;
use super::clock::Unsleep;
use super::clock::SLEEPQ;
use super::interrupt::*;
use super::queue::QUETAB;
use super::sched::Ready;
use super::sched::Resched;
use super::sched::RESCHED_YES;
use super::thread::*;

/// Deliver a message to a thread, waking it when it is blocked in
/// `Receive` or `RecvTime`.
pub fn Send(tid: i32, msg: i64) -> Result<()> {
    let _im = Disable();
    if IsBadTid(tid) {
        return Err(Error::SysErr);
    }

    let state = ThrWith(tid, |t| {
        if t.hasmsg {
            return None;
        }
        t.msg = msg;
        t.hasmsg = true;
        return Some(t.state);
    });
    let state = match state {
        None => return Err(Error::SysErr),
        Some(s) => s,
    };

    match state {
        ThrState::Recv => {
            Ready(tid, RESCHED_YES, GetCpuId())?;
        }
        ThrState::Tmout => {
            Unsleep(tid)?;
            Ready(tid, RESCHED_YES, GetCpuId())?;
        }
        _ => (),
    }
    return Ok(());
}

/// Wait for a message and return it.
pub fn Receive() -> Result<i64> {
    let _im = Disable();
    let tid = GetTid();
    if tid == TID_BAD {
        return Err(Error::SysErr);
    }

    let hasmsg = ThrWith(tid, |t| t.hasmsg);
    if !hasmsg {
        ThrWith(tid, |t| t.state = ThrState::Recv);
        Resched()?;
    }

    return Ok(ThrWith(tid, |t| {
        t.hasmsg = false;
        t.msg
    }));
}

/// Drain a pending message without blocking.
pub fn RecvClr() -> Option<i64> {
    let _im = Disable();
    let tid = GetTid();
    if tid == TID_BAD {
        return None;
    }
    return ThrWith(tid, |t| {
        if t.hasmsg {
            t.hasmsg = false;
            return Some(t.msg);
        }
        return None;
    });
}

/// Wait at most `maxticks` clock ticks for a message. When the deadline
/// fires first the inbox is left empty and Timeout is returned.
pub fn RecvTime(maxticks: i32) -> Result<i64> {
    if maxticks < 0 {
        return Err(Error::SysErr);
    }
    let _im = Disable();
    let tid = GetTid();
    if tid == TID_BAD {
        return Err(Error::SysErr);
    }

    let hasmsg = ThrWith(tid, |t| t.hasmsg);
    if !hasmsg {
        QUETAB.With(|q| q.InsertDelta(tid, *SLEEPQ, maxticks))?;
        ThrWith(tid, |t| t.state = ThrState::Tmout);
        Resched()?;
    }

    let msg = ThrWith(tid, |t| {
        if t.hasmsg {
            t.hasmsg = false;
            return Some(t.msg);
        }
        return None;
    });
    match msg {
        Some(m) => Ok(m),
        None => Err(Error::Timeout),
    }
}
