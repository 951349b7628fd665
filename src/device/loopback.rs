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

//! Character loopback device: bytes written reappear on the read side. The
//! ring's write index is derived from the read index plus the semaphore
//! count, which assumes a single writer; writers are serialized by the
//! interrupt token and the per-minor lock.

use lazy_static::lazy_static;

use super::super::kernel::interrupt::*;
use super::super::kernel::semaphore::*;
use super::super::qlib::common::*;
use super::super::qlib::mutex::*;
use super::DevDriver;
use super::OpenArgs;

pub const NLOOPBACK: usize = 1;
pub const LOOP_BUFFER: usize = 1024;

pub const LOOP_CTRL_SET_FLAG: i32 = 1;
pub const LOOP_CTRL_CLR_FLAG: i32 = 2;

bitflags::bitflags! {
    pub struct LoopFlags: u32 {
        const NONBLOCK = 0x01;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Free,
    Alloc,
}

pub struct Loopback {
    pub state: LoopState,
    pub flags: LoopFlags,
    pub sem: Sid,
    pub index: usize,
    pub buffer: Vec<u8>,
}

lazy_static! {
    pub static ref LOOPTAB: Vec<QMutex<Loopback>> = (0..NLOOPBACK)
        .map(|_| {
            QMutex::new(Loopback {
                state: LoopState::Free,
                flags: LoopFlags::empty(),
                sem: -1,
                index: 0,
                buffer: vec![0; LOOP_BUFFER],
            })
        })
        .collect();
}

pub struct LoopbackDriver;

pub static LOOPBACK_DRIVER: LoopbackDriver = LoopbackDriver;

impl DevDriver for LoopbackDriver {
    fn Init(&self, minor: usize) -> Result<()> {
        let mut l = LOOPTAB[minor].lock();
        l.state = LoopState::Free;
        l.index = 0;
        return Ok(());
    }

    fn Open(&self, minor: usize, _args: &OpenArgs) -> Result<()> {
        let _im = Disable();
        let sem = SemCreate(0)?;

        let mut l = LOOPTAB[minor].lock();
        if l.state != LoopState::Free {
            drop(l);
            let _ = SemFree(sem);
            return Err(Error::SysErr);
        }
        l.sem = sem;
        l.flags = LoopFlags::empty();
        l.index = 0;
        for b in l.buffer.iter_mut() {
            *b = 0;
        }
        l.state = LoopState::Alloc;
        return Ok(());
    }

    fn Close(&self, minor: usize) -> Result<()> {
        let _im = Disable();
        let sem = {
            let mut l = LOOPTAB[minor].lock();
            if l.state != LoopState::Alloc {
                return Err(Error::SysErr);
            }
            l.state = LoopState::Free;
            l.sem
        };
        return SemFree(sem);
    }

    fn Getc(&self, minor: usize) -> Result<u8> {
        let _im = Disable();
        let sem = {
            let l = LOOPTAB[minor].lock();
            if l.state != LoopState::Alloc {
                return Err(Error::SysErr);
            }
            if l.flags.contains(LoopFlags::NONBLOCK) && SemCount(l.sem)? <= 0 {
                return Err(Error::Eof);
            }
            l.sem
        };

        Wait(sem)?;

        let mut l = LOOPTAB[minor].lock();
        if l.state != LoopState::Alloc {
            return Err(Error::SysErr);
        }
        let ch = l.buffer[l.index];
        l.index = (l.index + 1) % LOOP_BUFFER;
        return Ok(ch);
    }

    fn Putc(&self, minor: usize, c: u8) -> Result<()> {
        let _im = Disable();
        let mut l = LOOPTAB[minor].lock();
        if l.state != LoopState::Alloc {
            return Err(Error::SysErr);
        }

        let count = SemCount(l.sem)? as usize;
        if count >= LOOP_BUFFER {
            return Err(Error::SysErr);
        }

        // The pending-byte count doubles as the write offset; single-writer
        // by contract.
        let i = (l.index + count) % LOOP_BUFFER;
        l.buffer[i] = c;
        let sem = l.sem;
        drop(l);

        return Signal(sem);
    }

    fn Read(&self, minor: usize, buf: &mut [u8]) -> Result<usize> {
        {
            let l = LOOPTAB[minor].lock();
            if l.state != LoopState::Alloc {
                return Err(Error::SysErr);
            }
        }

        let mut n = 0;
        while n < buf.len() {
            match self.Getc(minor) {
                Ok(c) => {
                    buf[n] = c;
                    n += 1;
                }
                Err(Error::Eof) => break,
                Err(e) => {
                    if n == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        return Ok(n);
    }

    fn Write(&self, minor: usize, buf: &[u8]) -> Result<usize> {
        for (n, c) in buf.iter().enumerate() {
            if let Err(e) = self.Putc(minor, *c) {
                if n == 0 {
                    return Err(e);
                }
                return Ok(n);
            }
        }
        return Ok(buf.len());
    }

    fn Control(&self, minor: usize, func: i32, arg1: i64, _arg2: i64) -> Result<i64> {
        let mut l = LOOPTAB[minor].lock();
        if l.state != LoopState::Alloc {
            return Err(Error::SysErr);
        }

        match func {
            LOOP_CTRL_SET_FLAG => {
                let old = l.flags.bits();
                l.flags |= LoopFlags::from_bits_truncate(arg1 as u32);
                return Ok(old as i64);
            }
            LOOP_CTRL_CLR_FLAG => {
                let old = l.flags.bits() & arg1 as u32;
                l.flags &= !LoopFlags::from_bits_truncate(arg1 as u32);
                return Ok(old as i64);
            }
            _ => {
                return Err(Error::SysErr);
            }
        }
    }
}
