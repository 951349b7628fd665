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

//! Low-level test-and-set mutexes, one table slot per lock, serializing the
//! short critical regions around the queue, thread and semaphore tables
//! across cores. Never held across a suspension point.

use core::cell::UnsafeCell;
use core::sync::atomic::AtomicI32;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;

use lazy_static::lazy_static;

use super::super::qlib::common::*;
use super::semaphore::NSEM;
use super::thread::GetCpuId;
use super::thread::NTHREAD;

// 1 for each thread, 1 for each semaphore, plus 50 more for extra.
pub const NMUTEX: usize = NTHREAD + NSEM + 50;

pub const MUTEX_FREE: u32 = 1;
pub const MUTEX_USED: u32 = 2;

pub const MUTEX_UNLOCKED: u32 = 0;
pub const MUTEX_LOCKED: u32 = 1;

pub const NO_CORE: i32 = -1;

pub struct MuxEnt {
    pub state: AtomicU32,
    pub lock: AtomicU32,
    pub core: AtomicI32,
}

impl MuxEnt {
    fn New() -> Self {
        return Self {
            state: AtomicU32::new(MUTEX_FREE),
            lock: AtomicU32::new(MUTEX_UNLOCKED),
            core: AtomicI32::new(NO_CORE),
        };
    }
}

lazy_static! {
    pub static ref MUXTAB: Vec<MuxEnt> = (0..NMUTEX).map(|_| MuxEnt::New()).collect();
}

pub fn IsBadMux(mux: usize) -> bool {
    return mux >= NMUTEX;
}

/// Claim an unused slot atomically and hand it out unlocked.
pub fn MutexCreate() -> Result<usize> {
    for i in 0..NMUTEX {
        if MUXTAB[i]
            .state
            .compare_exchange(MUTEX_FREE, MUTEX_USED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            MUXTAB[i].lock.store(MUTEX_UNLOCKED, Ordering::Release);
            MUXTAB[i].core.store(NO_CORE, Ordering::Release);
            return Ok(i);
        }
    }
    return Err(Error::SysErr);
}

pub fn MutexFree(mux: usize) -> Result<()> {
    if IsBadMux(mux) {
        return Err(Error::SysErr);
    }
    MUXTAB[mux].state.store(MUTEX_FREE, Ordering::Release);
    return Ok(());
}

pub fn MutexAcquire(mux: usize) -> Result<()> {
    if IsBadMux(mux) || MUXTAB[mux].state.load(Ordering::Acquire) == MUTEX_FREE {
        return Err(Error::SysErr);
    }

    while MUXTAB[mux].lock.swap(MUTEX_LOCKED, Ordering::Acquire) == MUTEX_LOCKED {
        core::hint::spin_loop();
    }
    MUXTAB[mux].core.store(GetCpuId() as i32, Ordering::Relaxed);
    return Ok(());
}

pub fn MutexRelease(mux: usize) -> Result<()> {
    if IsBadMux(mux) || MUXTAB[mux].state.load(Ordering::Acquire) == MUTEX_FREE {
        return Err(Error::SysErr);
    }
    MUXTAB[mux].core.store(NO_CORE, Ordering::Relaxed);
    MUXTAB[mux].lock.store(MUTEX_UNLOCKED, Ordering::Release);
    return Ok(());
}

/// A table entry guarded by one muxtab slot: the `thrtab_acquire(tid); ...;
/// thrtab_release(tid)` pattern with the release tied to the closure scope.
pub struct MuxLock<T> {
    pub mux: usize,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for MuxLock<T> {}
unsafe impl<T: Send> Send for MuxLock<T> {}

impl<T> MuxLock<T> {
    pub fn New(data: T) -> Self {
        let mux = MutexCreate().expect("muxtab exhausted");
        return Self {
            mux: mux,
            data: UnsafeCell::new(data),
        };
    }

    pub fn With<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        MutexAcquire(self.mux).expect("muxtab slot vanished");
        let r = f(unsafe { &mut *self.data.get() });
        MutexRelease(self.mux).expect("muxtab slot vanished");
        return r;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn create_acquire_release() {
        let m = MutexCreate().unwrap();
        MutexAcquire(m).unwrap();
        assert_eq!(MUXTAB[m].lock.load(Ordering::Acquire), MUTEX_LOCKED);
        MutexRelease(m).unwrap();
        assert_eq!(MUXTAB[m].lock.load(Ordering::Acquire), MUTEX_UNLOCKED);
        MutexFree(m).unwrap();
    }

    #[test]
    fn bad_mutex_rejects_ops() {
        assert_eq!(MutexAcquire(NMUTEX), Err(Error::SysErr));
        assert_eq!(MutexRelease(NMUTEX), Err(Error::SysErr));
        assert_eq!(MutexFree(NMUTEX), Err(Error::SysErr));
    }

    #[test]
    fn muxlock_serializes_increments() {
        let cell = Arc::new(MuxLock::New(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = cell.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    c.With(|v| *v += 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.With(|v| *v), 4000);
    }
}
