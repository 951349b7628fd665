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

//! Ethernet loopback link: frames written come back out of `Read`. Drop
//! and hold flags let tests sever the wire or capture the next outgoing
//! frame in a single-slot hold buffer with its own semaphore.

use lazy_static::lazy_static;

use super::super::kernel::interrupt::*;
use super::super::kernel::semaphore::*;
use super::super::mem::bufpool::*;
use super::super::mem::memblk::HeapWith;
use super::super::net::pkt::NET_MAX_PKTLEN;
use super::super::qlib::common::*;
use super::super::qlib::mutex::*;
use super::DevDriver;
use super::OpenArgs;

pub const NETHLOOP: usize = 2;
pub const ELOOP_BUFSIZE: usize = NET_MAX_PKTLEN;
pub const ELOOP_NBUF: usize = 32;
// An Ethernet frame is at least a link header.
pub const ELOOP_LINKHDRSIZE: usize = 14;

pub const ELOOP_CTRL_SETFLAG: i32 = 1;
pub const ELOOP_CTRL_CLRFLAG: i32 = 2;
pub const ELOOP_CTRL_NOUT: i32 = 3;

bitflags::bitflags! {
    pub struct EloopFlags: u32 {
        // Hold the next written frame for inspection instead of looping it.
        const HOLDNXT = 0x01;
        // Drop the next written frame, then clear.
        const DROPNXT = 0x04;
        // Drop everything written.
        const DROPALL = 0x08;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EloopState {
    Free,
    Alloc,
}

pub struct Ethloop {
    pub state: EloopState,
    pub flags: EloopFlags,
    pub sem: Sid,
    pub hsem: Sid,
    pub poolid: i32,
    pub buffer: Vec<u32>,
    pub pktlen: Vec<usize>,
    pub index: usize,
    pub count: usize,
    pub hold: Option<u32>,
    pub holdlen: usize,
    // Frames accepted onto the wire.
    pub nout: u64,
}

lazy_static! {
    pub static ref ELOOPTAB: Vec<QMutex<Ethloop>> = (0..NETHLOOP)
        .map(|_| {
            QMutex::new(Ethloop {
                state: EloopState::Free,
                flags: EloopFlags::empty(),
                sem: -1,
                hsem: -1,
                poolid: -1,
                buffer: vec![0; ELOOP_NBUF],
                pktlen: vec![0; ELOOP_NBUF],
                index: 0,
                count: 0,
                hold: None,
                holdlen: 0,
                nout: 0,
            })
        })
        .collect();
}

pub struct EthloopDriver;

pub static ETHLOOP_DRIVER: EthloopDriver = EthloopDriver;

impl DevDriver for EthloopDriver {
    fn Init(&self, minor: usize) -> Result<()> {
        let mut e = ELOOPTAB[minor].lock();
        e.state = EloopState::Free;
        return Ok(());
    }

    fn Open(&self, minor: usize, _args: &OpenArgs) -> Result<()> {
        let _im = Disable();

        {
            let e = ELOOPTAB[minor].lock();
            if e.state != EloopState::Free {
                return Err(Error::SysErr);
            }
        }

        let sem = SemCreate(0)?;
        let hsem = match SemCreate(0) {
            Ok(s) => s,
            Err(e) => {
                let _ = SemFree(sem);
                return Err(e);
            }
        };
        let poolid = match BfpAlloc(ELOOP_BUFSIZE, ELOOP_NBUF) {
            Ok(p) => p,
            Err(err) => {
                let _ = SemFree(sem);
                let _ = SemFree(hsem);
                return Err(err);
            }
        };

        let mut e = ELOOPTAB[minor].lock();
        e.flags = EloopFlags::empty();
        e.nout = 0;
        e.sem = sem;
        e.hsem = hsem;
        e.poolid = poolid;
        for i in 0..ELOOP_NBUF {
            e.buffer[i] = 0;
            e.pktlen[i] = 0;
        }
        e.index = 0;
        e.count = 0;
        e.hold = None;
        e.holdlen = 0;
        e.state = EloopState::Alloc;
        return Ok(());
    }

    fn Close(&self, minor: usize) -> Result<()> {
        let _im = Disable();
        let (sem, hsem, poolid) = {
            let mut e = ELOOPTAB[minor].lock();
            if e.state != EloopState::Alloc {
                return Err(Error::SysErr);
            }
            e.state = EloopState::Free;
            (e.sem, e.hsem, e.poolid)
        };

        let _ = SemFree(sem);
        let _ = SemFree(hsem);
        let _ = BfpFree(poolid);
        return Ok(());
    }

    /// Read one frame, blocking until a write supplies it.
    fn Read(&self, minor: usize, buf: &mut [u8]) -> Result<usize> {
        let _im = Disable();
        let sem = {
            let e = ELOOPTAB[minor].lock();
            if e.state != EloopState::Alloc {
                return Err(Error::SysErr);
            }
            e.sem
        };

        Wait(sem)?;

        let (pkt, pktlen) = {
            let mut e = ELOOPTAB[minor].lock();
            if e.state != EloopState::Alloc {
                return Err(Error::SysErr);
            }
            let idx = e.index;
            let pkt = e.buffer[idx];
            let pktlen = e.pktlen[idx];
            e.buffer[idx] = 0;
            e.pktlen[idx] = 0;
            e.count -= 1;
            e.index = (e.index + 1) % ELOOP_NBUF;
            (pkt, pktlen)
        };

        let n = pktlen.min(buf.len());
        HeapWith(|heap| {
            buf[..n].copy_from_slice(&heap[pkt as usize..pkt as usize + n]);
        });
        BufFree(pkt)?;
        return Ok(n);
    }

    /// Put one frame on the wire; a waiting `Read` picks it up unless a
    /// drop or hold flag diverts it.
    fn Write(&self, minor: usize, buf: &[u8]) -> Result<usize> {
        if buf.len() < ELOOP_LINKHDRSIZE || buf.len() > ELOOP_BUFSIZE {
            return Err(Error::SysErr);
        }

        let _im = Disable();
        let poolid = {
            let mut e = ELOOPTAB[minor].lock();
            if e.state != EloopState::Alloc {
                return Err(Error::SysErr);
            }
            if e.flags.intersects(EloopFlags::DROPNXT | EloopFlags::DROPALL) {
                e.flags.remove(EloopFlags::DROPNXT);
                return Ok(buf.len());
            }
            e.poolid
        };

        // Backpressure comes from the pool semaphore.
        let pkt = BufGet(poolid)?;
        HeapWith(|heap| {
            heap[pkt as usize..pkt as usize + buf.len()].copy_from_slice(buf);
        });

        let mut e = ELOOPTAB[minor].lock();
        if e.state != EloopState::Alloc {
            drop(e);
            let _ = BufFree(pkt);
            return Err(Error::SysErr);
        }

        if e.flags.contains(EloopFlags::HOLDNXT) {
            e.flags.remove(EloopFlags::HOLDNXT);
            let stale = e.hold.take();
            e.hold = Some(pkt);
            e.holdlen = buf.len();
            let hsem = e.hsem;
            drop(e);
            if let Some(s) = stale {
                let _ = BufFree(s);
            }
            Signal(hsem)?;
            return Ok(buf.len());
        }

        if e.count >= ELOOP_NBUF {
            drop(e);
            let _ = BufFree(pkt);
            return Err(Error::SysErr);
        }

        let slot = (e.count + e.index) % ELOOP_NBUF;
        e.buffer[slot] = pkt;
        e.pktlen[slot] = buf.len();
        e.count += 1;
        e.nout += 1;
        let sem = e.sem;
        drop(e);

        Signal(sem)?;
        return Ok(buf.len());
    }

    fn Control(&self, minor: usize, func: i32, arg1: i64, _arg2: i64) -> Result<i64> {
        let mut e = ELOOPTAB[minor].lock();
        if e.state != EloopState::Alloc {
            return Err(Error::SysErr);
        }

        match func {
            ELOOP_CTRL_SETFLAG => {
                let old = e.flags.bits() & arg1 as u32;
                e.flags |= EloopFlags::from_bits_truncate(arg1 as u32);
                return Ok(old as i64);
            }
            ELOOP_CTRL_CLRFLAG => {
                let old = e.flags.bits() & arg1 as u32;
                e.flags &= !EloopFlags::from_bits_truncate(arg1 as u32);
                return Ok(old as i64);
            }
            ELOOP_CTRL_NOUT => {
                return Ok(e.nout as i64);
            }
            _ => {
                return Err(Error::SysErr);
            }
        }
    }
}

/// Wait for a held frame (`HOLDNXT`) and copy it out for inspection.
pub fn GetHold(minor: usize, buf: &mut [u8]) -> Result<usize> {
    let _im = Disable();
    let hsem = {
        let e = ELOOPTAB[minor].lock();
        if e.state != EloopState::Alloc {
            return Err(Error::SysErr);
        }
        e.hsem
    };

    Wait(hsem)?;

    let (pkt, holdlen) = {
        let mut e = ELOOPTAB[minor].lock();
        if e.state != EloopState::Alloc {
            return Err(Error::SysErr);
        }
        let pkt = match e.hold.take() {
            None => return Err(Error::SysErr),
            Some(p) => p,
        };
        let len = e.holdlen;
        e.holdlen = 0;
        (pkt, len)
    };

    let n = holdlen.min(buf.len());
    HeapWith(|heap| {
        buf[..n].copy_from_slice(&heap[pkt as usize..pkt as usize + n]);
    });
    BufFree(pkt)?;
    return Ok(n);
}
