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

//! The kernel heap: a fixed byte arena carved up by a free list of
//! 8-byte-rounded blocks kept sorted by address. `MemGet` is first-fit and
//! feeds buffer pools from the bottom; `StkGet` is last-fit and hands out
//! stacks from the top, addressed by their highest word so they grow down.

use lazy_static::lazy_static;

use super::super::kernel::interrupt::*;
use super::super::qlib::common::*;
use super::super::qlib::mutex::*;

pub const WORDSIZE: usize = 8;

pub fn RoundMb(n: usize) -> usize {
    return (n + WORDSIZE - 1) & !(WORDSIZE - 1);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemBlock {
    pub off: usize,
    pub len: usize,
}

pub struct MemList {
    pub free: Vec<MemBlock>,
    pub length: usize,
    pub heapsize: usize,
}

lazy_static! {
    pub static ref MEMLIST: QMutex<MemList> = {
        let size = super::super::kernel::KERNEL_CONFIG.lock().HeapSize;
        QMutex::new(MemList::New(size))
    };
    pub static ref ARENA: QMutex<Vec<u8>> = {
        let size = super::super::kernel::KERNEL_CONFIG.lock().HeapSize;
        QMutex::new(vec![0u8; size])
    };
}

impl MemList {
    pub fn New(heapsize: usize) -> Self {
        return Self {
            free: vec![MemBlock {
                off: 0,
                len: heapsize,
            }],
            length: heapsize,
            heapsize: heapsize,
        };
    }

    /// First-fit allocation, splitting the block and leaving the leftover
    /// in place.
    pub fn Get(&mut self, nbytes: usize) -> Result<usize> {
        if nbytes == 0 {
            return Err(Error::SysErr);
        }
        let nbytes = RoundMb(nbytes);

        for i in 0..self.free.len() {
            if self.free[i].len == nbytes {
                let off = self.free[i].off;
                self.free.remove(i);
                self.length -= nbytes;
                return Ok(off);
            }
            if self.free[i].len > nbytes {
                let off = self.free[i].off;
                self.free[i].off += nbytes;
                self.free[i].len -= nbytes;
                self.length -= nbytes;
                return Ok(off);
            }
        }
        return Err(Error::SysErr);
    }

    /// Return a block, rejecting anything outside the heap or overlapping a
    /// neighbor, and coalescing with adjacent free blocks.
    pub fn Free(&mut self, off: usize, nbytes: usize) -> Result<()> {
        if nbytes == 0 {
            return Err(Error::SysErr);
        }
        let nbytes = RoundMb(nbytes);
        if off + nbytes > self.heapsize {
            return Err(Error::SysErr);
        }

        let mut i = 0;
        while i < self.free.len() && self.free[i].off < off {
            i += 1;
        }

        let prev_top = if i == 0 {
            0
        } else {
            self.free[i - 1].off + self.free[i - 1].len
        };
        if (i > 0 && prev_top > off)
            || (i < self.free.len() && off + nbytes > self.free[i].off)
        {
            return Err(Error::SysErr);
        }

        self.length += nbytes;

        if i > 0 && prev_top == off {
            self.free[i - 1].len += nbytes;
            // Merge forward as well when the freed block bridged two holes.
            if i < self.free.len() && self.free[i - 1].off + self.free[i - 1].len == self.free[i].off
            {
                self.free[i - 1].len += self.free[i].len;
                self.free.remove(i);
            }
            return Ok(());
        }

        if i < self.free.len() && off + nbytes == self.free[i].off {
            self.free[i].off = off;
            self.free[i].len += nbytes;
            return Ok(());
        }

        self.free.insert(i, MemBlock { off: off, len: nbytes });
        return Ok(());
    }

    /// Last-fit allocation for stacks: the highest-addressed block that
    /// satisfies the request, trimmed from its tail.
    pub fn GetStk(&mut self, nbytes: usize) -> Result<usize> {
        if nbytes == 0 {
            return Err(Error::SysErr);
        }
        let nbytes = RoundMb(nbytes);

        let mut fits = None;
        for i in 0..self.free.len() {
            if self.free[i].len >= nbytes {
                fits = Some(i);
            }
        }
        let i = match fits {
            None => return Err(Error::SysErr),
            Some(i) => i,
        };

        let start;
        if self.free[i].len == nbytes {
            start = self.free[i].off;
            self.free.remove(i);
        } else {
            self.free[i].len -= nbytes;
            start = self.free[i].off + self.free[i].len;
        }
        self.length -= nbytes;

        // Top-of-stack word; the stack grows downward into the block.
        return Ok(start + nbytes - WORDSIZE);
    }
}

pub fn MemGet(nbytes: usize) -> Result<usize> {
    let _im = Disable();
    return MEMLIST.lock().Get(nbytes);
}

pub fn MemFree(off: usize, nbytes: usize) -> Result<()> {
    let _im = Disable();
    return MEMLIST.lock().Free(off, nbytes);
}

pub fn StkGet(nbytes: usize) -> Result<usize> {
    let _im = Disable();
    return MEMLIST.lock().GetStk(nbytes);
}

pub fn StkFree(top: usize, nbytes: usize) -> Result<()> {
    let _im = Disable();
    let nbytes = RoundMb(nbytes);
    if top + WORDSIZE < nbytes {
        return Err(Error::SysErr);
    }
    return MEMLIST.lock().Free(top + WORDSIZE - nbytes, nbytes);
}

/// Borrow the heap bytes backing pool buffers.
pub fn HeapWith<R>(f: impl FnOnce(&mut [u8]) -> R) -> R {
    let mut a = ARENA.lock();
    return f(&mut a);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_and_coalesce() {
        let mut m = MemList::New(1024);
        let a = m.Get(100).unwrap();
        let b = m.Get(100).unwrap();
        let c = m.Get(100).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 104);
        assert_eq!(c, 208);

        m.Free(b, 100).unwrap();
        m.Free(a, 100).unwrap();
        // a and b coalesce into one 208-byte hole, reused first-fit.
        assert_eq!(m.Get(208).unwrap(), 0);
        m.Free(c, 100).unwrap();
        m.Free(0, 208).unwrap();
        assert_eq!(m.length, 1024);
        assert_eq!(m.free.len(), 1);
    }

    #[test]
    fn free_rejects_overlap_and_bounds() {
        let mut m = MemList::New(1024);
        let a = m.Get(64).unwrap();
        assert_eq!(m.Free(a, 2048), Err(Error::SysErr));
        m.Free(a, 64).unwrap();
        // Double free overlaps the hole it created.
        assert_eq!(m.Free(a, 64), Err(Error::SysErr));
    }

    #[test]
    fn stack_comes_from_the_top() {
        let mut m = MemList::New(1024);
        let low = m.Get(64).unwrap();
        let top = m.GetStk(128).unwrap();
        assert_eq!(low, 0);
        assert_eq!(top, 1024 - WORDSIZE);
        // The stack block occupies [896, 1024).
        assert_eq!(m.length, 1024 - 64 - 128);
        m.Free(top + WORDSIZE - 128, 128).unwrap();
        m.Free(low, 64).unwrap();
        assert_eq!(m.free.len(), 1);
    }
}
