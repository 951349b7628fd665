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

//! Fixed-size buffer pools carved out of the heap. Every buffer carries an
//! 8-byte accounting header (pool id + free-list link); an allocated
//! buffer's link points at itself, which is how `BufFree` catches double
//! frees. A counting semaphore provides backpressure: `BufGet` blocks until
//! a buffer is available.

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use lazy_static::lazy_static;

use super::super::kernel::interrupt::*;
use super::super::kernel::semaphore::*;
use super::super::qlib::common::*;
use super::super::qlib::mutex::*;
use super::memblk::*;

pub const NPOOL: usize = 8;
pub const POOL_MIN_BUFSIZE: usize = 8;
pub const POOL_MAX_BUFSIZE: usize = 2048;
pub const POOL_MAX_NBUFS: usize = 256;

pub const BUFHDR_LEN: usize = 8;
const LINK_NONE: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BfpState {
    Free,
    Used,
}

pub struct BfpEnt {
    pub state: BfpState,
    // Buffer stride including the accounting header.
    pub bufsize: usize,
    pub nbuf: usize,
    // Heap offset of the backing region.
    pub head: usize,
    // Offset of the first free buffer header, LINK_NONE when exhausted.
    pub next: u32,
    pub freebuf: Sid,
}

lazy_static! {
    pub static ref BFPTAB: Vec<QMutex<BfpEnt>> = (0..NPOOL)
        .map(|_| {
            QMutex::new(BfpEnt {
                state: BfpState::Free,
                bufsize: 0,
                nbuf: 0,
                head: 0,
                next: LINK_NONE,
                freebuf: -1,
            })
        })
        .collect();
}

pub fn IsBadPool(id: i32) -> bool {
    if id < 0 || id as usize >= NPOOL {
        return true;
    }
    return BFPTAB[id as usize].lock().state == BfpState::Free;
}

fn HdrRead(off: u32) -> (u32, u32) {
    return HeapWith(|heap| {
        let o = off as usize;
        (
            LittleEndian::read_u32(&heap[o..o + 4]),
            LittleEndian::read_u32(&heap[o + 4..o + 8]),
        )
    });
}

fn HdrWrite(off: u32, poolid: u32, next: u32) {
    HeapWith(|heap| {
        let o = off as usize;
        LittleEndian::write_u32(&mut heap[o..o + 4], poolid);
        LittleEndian::write_u32(&mut heap[o + 4..o + 8], next);
    });
}

/// Acquire heap storage and subdivide it into `nbuf` buffers of
/// `bufsize` bytes each, threaded onto a free list.
pub fn BfpAlloc(bufsize: usize, nbuf: usize) -> Result<i32> {
    let stride = RoundMb(bufsize) + BUFHDR_LEN;
    if stride > POOL_MAX_BUFSIZE || stride < POOL_MIN_BUFSIZE || nbuf > POOL_MAX_NBUFS || nbuf < 1 {
        return Err(Error::SysErr);
    }

    let _im = Disable();

    let mut id = NPOOL;
    for i in 0..NPOOL {
        let mut p = BFPTAB[i].lock();
        if p.state == BfpState::Free {
            p.state = BfpState::Used;
            id = i;
            break;
        }
    }
    if id == NPOOL {
        return Err(Error::SysErr);
    }

    let freebuf = match SemCreate(0) {
        Ok(s) => s,
        Err(e) => {
            BFPTAB[id].lock().state = BfpState::Free;
            return Err(e);
        }
    };

    let head = match MemGet(nbuf * stride) {
        Ok(h) => h,
        Err(e) => {
            let _ = SemFree(freebuf);
            BFPTAB[id].lock().state = BfpState::Free;
            return Err(e);
        }
    };

    // Thread every buffer onto the free list.
    for n in 0..nbuf {
        let off = (head + n * stride) as u32;
        let link = if n + 1 == nbuf {
            LINK_NONE
        } else {
            (head + (n + 1) * stride) as u32
        };
        HdrWrite(off, id as u32, link);
    }

    {
        let mut p = BFPTAB[id].lock();
        p.bufsize = stride;
        p.nbuf = nbuf;
        p.head = head;
        p.next = head as u32;
        p.freebuf = freebuf;
    }

    SignalN(freebuf, nbuf as i32)?;
    return Ok(id as i32);
}

/// Allocate a buffer, blocking until one is free. Returns the heap offset
/// of the usable bytes, past the accounting header.
pub fn BufGet(poolid: i32) -> Result<u32> {
    if IsBadPool(poolid) {
        return Err(Error::SysErr);
    }

    let freebuf = BFPTAB[poolid as usize].lock().freebuf;

    let _im = Disable();
    Wait(freebuf)?;

    let hdr = {
        let mut p = BFPTAB[poolid as usize].lock();
        if p.state != BfpState::Used || p.next == LINK_NONE {
            return Err(Error::SysErr);
        }
        let hdr = p.next;
        let (_, link) = HdrRead(hdr);
        p.next = link;
        hdr
    };

    // Self-referential link marks the buffer as out of the pool.
    HdrWrite(hdr, poolid as u32, hdr);
    return Ok(hdr + BUFHDR_LEN as u32);
}

/// Return a buffer to its pool. The self-pointer invariant catches frees
/// of buffers that are not currently allocated.
pub fn BufFree(buf: u32) -> Result<()> {
    if (buf as usize) < BUFHDR_LEN {
        return Err(Error::SysErr);
    }
    let hdr = buf - BUFHDR_LEN as u32;
    let (poolid, link) = HdrRead(hdr);
    if poolid as usize >= NPOOL || IsBadPool(poolid as i32) {
        return Err(Error::SysErr);
    }
    if link != hdr {
        return Err(Error::SysErr);
    }

    let _im = Disable();
    let freebuf = {
        let mut p = BFPTAB[poolid as usize].lock();
        let (lo, hi) = (p.head, p.head + p.nbuf * p.bufsize);
        if (hdr as usize) < lo || hdr as usize >= hi {
            return Err(Error::SysErr);
        }
        HdrWrite(hdr, poolid, p.next);
        p.next = hdr;
        p.freebuf
    };

    Signal(freebuf)?;
    return Ok(());
}

/// Release a pool: the backing heap region and the semaphore.
pub fn BfpFree(poolid: i32) -> Result<()> {
    if IsBadPool(poolid) {
        return Err(Error::SysErr);
    }

    let _im = Disable();
    let (head, size, freebuf) = {
        let mut p = BFPTAB[poolid as usize].lock();
        if p.state != BfpState::Used {
            return Err(Error::SysErr);
        }
        p.state = BfpState::Free;
        (p.head, p.nbuf * p.bufsize, p.freebuf)
    };

    let r1 = MemFree(head, size);
    let r2 = SemFree(freebuf);
    r1?;
    r2?;
    return Ok(());
}
