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

//! Bounded mailboxes built on two counting semaphores: the sender
//! semaphore gates free capacity, the receiver semaphore gates queued
//! messages. The state re-check after every wait is what lets
//! `MailboxFree` run while senders and receivers are still blocked; they
//! resume, see the box gone, and fail cleanly.

use lazy_static::lazy_static;

use super::super::qlib::common::*;
use super::super::qlib::mutex::*;
use super::interrupt::*;
use super::semaphore::*;

pub const NMAILBOX: usize = 16;

pub type Mbid = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MboxState {
    Free,
    Alloc,
}

pub struct MboxEnt {
    pub state: MboxState,
    pub msgs: Vec<i64>,
    pub start: usize,
    pub count: usize,
    pub max: usize,
    pub sender: Sid,
    pub receiver: Sid,
}

lazy_static! {
    pub static ref MBOXTAB: Vec<QMutex<MboxEnt>> = (0..NMAILBOX)
        .map(|_| {
            QMutex::new(MboxEnt {
                state: MboxState::Free,
                msgs: Vec::new(),
                start: 0,
                count: 0,
                max: 0,
                sender: -1,
                receiver: -1,
            })
        })
        .collect();
    // Serializes allocation and free against each other.
    static ref MBOXTABSEM: Sid = SemCreate(1).expect("mailbox table semaphore");
}

fn IsBadBox(box_: Mbid) -> bool {
    return box_ < 0 || box_ as usize >= NMAILBOX;
}

/// Allocate a mailbox holding up to `count` outstanding messages.
pub fn MailboxAlloc(count: usize) -> Result<Mbid> {
    if count == 0 {
        return Err(Error::SysErr);
    }

    Wait(*MBOXTABSEM)?;
    defer!(let _ = Signal(*MBOXTABSEM););

    for i in 0..NMAILBOX {
        let mut m = MBOXTAB[i].lock();
        if m.state != MboxState::Free {
            continue;
        }

        let sender = SemCreate(count as i32)?;
        let receiver = match SemCreate(0) {
            Ok(s) => s,
            Err(e) => {
                let _ = SemFree(sender);
                return Err(e);
            }
        };

        m.msgs = vec![0; count];
        m.start = 0;
        m.count = 0;
        m.max = count;
        m.sender = sender;
        m.receiver = receiver;
        m.state = MboxState::Alloc;
        return Ok(i as Mbid);
    }
    return Err(Error::SysErr);
}

/// Free a mailbox, releasing any threads blocked on it into SYSERR returns.
pub fn MailboxFree(box_: Mbid) -> Result<()> {
    if IsBadBox(box_) {
        return Err(Error::SysErr);
    }

    Wait(*MBOXTABSEM)?;
    defer!(let _ = Signal(*MBOXTABSEM););

    let (sender, receiver) = {
        let mut m = MBOXTAB[box_ as usize].lock();
        if m.state != MboxState::Alloc {
            return Err(Error::SysErr);
        }
        m.state = MboxState::Free;
        m.msgs = Vec::new();
        m.max = 0;
        (m.sender, m.receiver)
    };

    let r1 = SemFree(sender);
    let r2 = SemFree(receiver);
    r1?;
    r2?;
    return Ok(());
}

/// Send a message, blocking while the mailbox is full.
pub fn MailboxSend(box_: Mbid, msg: i64) -> Result<()> {
    if IsBadBox(box_) {
        return Err(Error::SysErr);
    }

    let _im = Disable();
    let sender = {
        let m = MBOXTAB[box_ as usize].lock();
        if m.state != MboxState::Alloc {
            return Err(Error::SysErr);
        }
        m.sender
    };

    Wait(sender)?;

    // The box may have been freed while this sender slept.
    let mut m = MBOXTAB[box_ as usize].lock();
    if m.state != MboxState::Alloc {
        return Err(Error::SysErr);
    }
    let slot = (m.start + m.count) % m.max;
    m.msgs[slot] = msg;
    m.count += 1;
    let receiver = m.receiver;
    drop(m);

    Signal(receiver)?;
    return Ok(());
}

/// Receive the oldest message, blocking while the mailbox is empty.
pub fn MailboxReceive(box_: Mbid) -> Result<i64> {
    if IsBadBox(box_) {
        return Err(Error::SysErr);
    }

    let _im = Disable();
    let receiver = {
        let m = MBOXTAB[box_ as usize].lock();
        if m.state != MboxState::Alloc {
            return Err(Error::SysErr);
        }
        m.receiver
    };

    Wait(receiver)?;

    let mut m = MBOXTAB[box_ as usize].lock();
    if m.state != MboxState::Alloc {
        return Err(Error::SysErr);
    }
    let msg = m.msgs[m.start];
    m.start = (m.start + 1) % m.max;
    m.count -= 1;
    let sender = m.sender;
    drop(m);

    Signal(sender)?;
    return Ok(msg);
}

/// Messages currently queued.
pub fn MailboxCount(box_: Mbid) -> Result<usize> {
    if IsBadBox(box_) {
        return Err(Error::SysErr);
    }
    let m = MBOXTAB[box_ as usize].lock();
    if m.state != MboxState::Alloc {
        return Err(Error::SysErr);
    }
    return Ok(m.count);
}
