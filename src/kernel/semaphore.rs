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

//! Counting semaphores. A negative count is the number of threads queued on
//! the semaphore; waiters are released strictly in queue (FIFO) order.

use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;

use lazy_static::lazy_static;

use super::super::qlib::common::*;
use super::interrupt::*;
use super::kmutex::MuxLock;
use super::queue::*;
use super::sched::Ready;
use super::sched::Resched;
use super::sched::RESCHED_NO;
use super::sched::RESCHED_YES;
use super::thread::*;

pub const NSEM: usize = 100;

pub type Sid = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemState {
    Free,
    Used,
}

pub struct SemEnt {
    pub state: SemState,
    pub count: i32,
    pub queue: Qid,
}

lazy_static! {
    pub static ref SEMTAB: Vec<MuxLock<SemEnt>> = {
        let queues: Vec<Qid> = QUETAB.With(|q| {
            (0..NSEM)
                .map(|_| q.NewQueue().expect("queue table exhausted"))
                .collect()
        });
        queues
            .into_iter()
            .map(|queue| {
                MuxLock::New(SemEnt {
                    state: SemState::Free,
                    count: 0,
                    queue: queue,
                })
            })
            .collect()
    };
}

static NEXTSEM: AtomicUsize = AtomicUsize::new(0);

pub fn SemWith<R>(sem: Sid, f: impl FnOnce(&mut SemEnt) -> R) -> R {
    return SEMTAB[sem as usize].With(f);
}

pub fn IsBadSem(sem: Sid) -> bool {
    if sem < 0 || sem as usize >= NSEM {
        return true;
    }
    return SemWith(sem, |s| s.state == SemState::Free);
}

/// Create a semaphore with the given non-negative initial count.
pub fn SemCreate(count: i32) -> Result<Sid> {
    if count < 0 {
        return Err(Error::SysErr);
    }

    let _im = Disable();
    let sem = SemAlloc()?;
    SemWith(sem, |s| s.count = count);
    return Ok(sem);
}

fn SemAlloc() -> Result<Sid> {
    for _ in 0..NSEM {
        let n = NEXTSEM.fetch_add(1, Ordering::AcqRel) % NSEM;
        let claimed = SemWith(n as Sid, |s| {
            if s.state == SemState::Free {
                s.state = SemState::Used;
                return true;
            }
            return false;
        });
        if claimed {
            return Ok(n as Sid);
        }
    }
    return Err(Error::SysErr);
}

/// Wait on a semaphore: decrement the count and block while it is negative.
pub fn Wait(sem: Sid) -> Result<()> {
    let _im = Disable();
    if IsBadSem(sem) {
        return Err(Error::SysErr);
    }

    let (count, queue) = SemWith(sem, |s| {
        s.count -= 1;
        (s.count, s.queue)
    });

    if count < 0 {
        let tid = GetTid();
        if tid == TID_BAD {
            // Only a kernel thread can block; undo the reservation.
            SemWith(sem, |s| s.count += 1);
            return Err(Error::SysErr);
        }
        ThrWith(tid, |t| {
            t.state = ThrState::Wait;
            t.sem = sem;
        });
        QUETAB.With(|q| q.Enqueue(tid, queue))?;
        Resched()?;
    }
    return Ok(());
}

/// Signal a semaphore, releasing one waiter when any are queued.
///
/// May reschedule the caller's core; not for use from a non-reentrant
/// interrupt path unless rescheduling is deferred first.
pub fn Signal(sem: Sid) -> Result<()> {
    let _im = Disable();
    if IsBadSem(sem) {
        return Err(Error::SysErr);
    }

    let (prev, queue) = SemWith(sem, |s| {
        let prev = s.count;
        s.count += 1;
        (prev, s.queue)
    });
    if prev < 0 {
        let tid = QUETAB.With(|q| q.Dequeue(queue));
        if tid != EMPTY {
            Ready(tid, RESCHED_YES, GetCpuId())?;
        }
    }
    return Ok(());
}

/// Signal a semaphore `count` times, deferring the reschedule until all
/// waiters have been made ready.
pub fn SignalN(sem: Sid, count: i32) -> Result<()> {
    let _im = Disable();
    if IsBadSem(sem) || count <= 0 {
        return Err(Error::SysErr);
    }

    for _ in 0..count {
        let (prev, queue) = SemWith(sem, |s| {
            let prev = s.count;
            s.count += 1;
            (prev, s.queue)
        });
        if prev < 0 {
            let tid = QUETAB.With(|q| q.Dequeue(queue));
            if tid != EMPTY {
                Ready(tid, RESCHED_NO, GetCpuId())?;
            }
        }
    }
    Resched()?;
    return Ok(());
}

/// Free a semaphore. Queued waiters are made ready; their pending `Wait`
/// calls return Ok, while later calls on the stale id fail the id check.
pub fn SemFree(sem: Sid) -> Result<()> {
    let _im = Disable();
    if IsBadSem(sem) {
        return Err(Error::SysErr);
    }

    let queue = SemWith(sem, |s| s.queue);
    loop {
        let tid = QUETAB.With(|q| q.Dequeue(queue));
        if tid == EMPTY {
            break;
        }
        Ready(tid, RESCHED_NO, GetCpuId())?;
    }
    SemWith(sem, |s| {
        s.count = 0;
        s.state = SemState::Free;
    });
    return Ok(());
}

/// Current count of a semaphore.
pub fn SemCount(sem: Sid) -> Result<i32> {
    let _im = Disable();
    if IsBadSem(sem) {
        return Err(Error::SysErr);
    }
    return Ok(SemWith(sem, |s| s.count));
}
