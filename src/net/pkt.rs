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

//! The shared packet buffer pool. A packet is a fixed data array with a
//! cursor: transmit paths start the cursor at the tail and grow headers
//! downward with `Prepend`; receive paths start it at the head and consume
//! headers with `Pull`. The valid bytes are always `data[curr..curr+len]`.
//!
//! Buffers are identified by their pool slot index, a plain integer that
//! travels through mailboxes and message slots like a pointer would.
//! Ownership is single-threaded: a packet belongs to whoever holds its id.

use lazy_static::lazy_static;

use super::super::kernel::interrupt::*;
use super::super::kernel::semaphore::*;
use super::super::qlib::common::*;
use super::super::qlib::mutex::*;

pub const NET_MAX_PKTLEN: usize = 1598;

pub type PktId = usize;

pub struct Packet {
    // Index of the owning network interface, -1 when unbound.
    pub nif: i32,
    // Bytes valid at and after `curr`.
    pub len: usize,
    // Cursor into `data`.
    pub curr: usize,
    // Offset of the IPv4 header once a layer has recorded it.
    pub nethdr: usize,
    pub data: [u8; NET_MAX_PKTLEN],
}

impl Packet {
    pub fn New() -> Self {
        return Self {
            nif: -1,
            len: 0,
            curr: NET_MAX_PKTLEN,
            nethdr: 0,
            data: [0; NET_MAX_PKTLEN],
        };
    }

    pub fn Reset(&mut self) {
        self.nif = -1;
        self.len = 0;
        self.curr = NET_MAX_PKTLEN;
        self.nethdr = 0;
        for b in self.data.iter_mut() {
            *b = 0;
        }
    }

    /// Reserve `n` bytes of header space below the cursor and return it.
    pub fn Prepend(&mut self, n: usize) -> Result<&mut [u8]> {
        if n > self.curr {
            return Err(Error::SysErr);
        }
        self.curr -= n;
        self.len += n;
        let curr = self.curr;
        return Ok(&mut self.data[curr..curr + n]);
    }

    /// Consume `n` bytes of header from the front of the valid range.
    pub fn Pull(&mut self, n: usize) -> Result<()> {
        if n > self.len || self.curr + n > NET_MAX_PKTLEN {
            return Err(Error::SysErr);
        }
        self.curr += n;
        self.len -= n;
        return Ok(());
    }

    pub fn Payload(&self) -> &[u8] {
        return &self.data[self.curr..self.curr + self.len];
    }

    pub fn PayloadMut(&mut self) -> &mut [u8] {
        let (curr, len) = (self.curr, self.len);
        return &mut self.data[curr..curr + len];
    }

    /// The recorded network (IPv4) header.
    pub fn NetHdr(&self) -> &[u8] {
        return &self.data[self.nethdr..];
    }

    pub fn NetHdrMut(&mut self) -> &mut [u8] {
        let nethdr = self.nethdr;
        return &mut self.data[nethdr..];
    }
}

struct PoolState {
    free: Vec<PktId>,
    used: Vec<bool>,
}

pub struct NetPool {
    slots: Vec<QMutex<Packet>>,
    state: QMutex<PoolState>,
    pub freebuf: Sid,
    pub nbuf: usize,
}

lazy_static! {
    pub static ref NETPOOL: NetPool = NetPool::New();
}

impl NetPool {
    fn New() -> Self {
        let nbuf = super::super::kernel::KERNEL_CONFIG.lock().NetPoolSize;
        let freebuf = SemCreate(nbuf as i32).expect("netpool semaphore");
        return Self {
            slots: (0..nbuf).map(|_| QMutex::new(Packet::New())).collect(),
            state: QMutex::new(PoolState {
                free: (0..nbuf).rev().collect(),
                used: vec![false; nbuf],
            }),
            freebuf: freebuf,
            nbuf: nbuf,
        };
    }
}

/// Take a zeroed packet buffer from the pool, blocking until one is free.
pub fn NetGetbuf() -> Result<PktId> {
    let _im = Disable();
    Wait(NETPOOL.freebuf)?;

    let id = {
        let mut s = NETPOOL.state.lock();
        let id = match s.free.pop() {
            None => return Err(Error::SysErr),
            Some(id) => id,
        };
        s.used[id] = true;
        id
    };

    NETPOOL.slots[id].lock().Reset();
    return Ok(id);
}

/// Return a packet buffer. Freeing a buffer that is not out of the pool is
/// a contract violation and fails.
pub fn NetFreebuf(id: PktId) -> Result<()> {
    if id >= NETPOOL.nbuf {
        return Err(Error::SysErr);
    }

    let _im = Disable();
    {
        let mut s = NETPOOL.state.lock();
        if !s.used[id] {
            return Err(Error::SysErr);
        }
        s.used[id] = false;
        s.free.push(id);
    }
    return Signal(NETPOOL.freebuf);
}

/// Operate on a packet's contents through its id.
pub fn WithPkt<R>(id: PktId, f: impl FnOnce(&mut Packet) -> R) -> Result<R> {
    if id >= NETPOOL.nbuf {
        return Err(Error::SysErr);
    }
    let mut p = NETPOOL.slots[id].lock();
    return Ok(f(&mut p));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_grows_down_and_pulls_up() {
        let mut p = Packet::New();
        assert_eq!(p.curr, NET_MAX_PKTLEN);

        let h = p.Prepend(8).unwrap();
        h.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(p.len, 8);
        assert_eq!(p.curr, NET_MAX_PKTLEN - 8);

        p.Prepend(4).unwrap().copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(p.Payload()[..4], [9, 9, 9, 9]);

        p.Pull(4).unwrap();
        assert_eq!(p.Payload().len(), 8);
        assert_eq!(p.Payload()[0], 1);

        assert_eq!(p.Prepend(NET_MAX_PKTLEN), Err(Error::SysErr));
    }
}
