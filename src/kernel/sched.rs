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

//! Priority scheduler with one ready list per core. A thread runs only
//! while it is the CURR thread of its core; the context-switch primitive is
//! a parker handoff between the host threads backing the old and new CURR.

use core::sync::atomic::AtomicI32;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;

use super::super::mem::memblk::*;
use super::super::qlib::common::*;
use super::super::qlib::metric::*;
use super::interrupt::*;
use super::message::RecvClr;
use super::message::Send;
use super::queue::*;
use super::semaphore::SemWith;
use super::thread::*;

pub const RESCHED_YES: bool = true;
pub const RESCHED_NO: bool = false;

pub const MINSTK: usize = 4096;

// Unwind payload retiring the host thread of a killed kernel thread.
pub struct ThreadExit;

lazy_static! {
    pub static ref READYLIST: Vec<Qid> = QUETAB.With(|q| {
        (0..NCORE)
            .map(|_| q.NewQueue().expect("queue table exhausted"))
            .collect()
    });
    pub static ref RESDEFER: Vec<AtomicI32> = (0..NCORE).map(|_| AtomicI32::new(0)).collect();
    static ref CTXSW_COUNT: Arc<U64Metric> = NewU64Metric("sched.ctxsw", "context switches");
}

static NEXTTID: AtomicUsize = AtomicUsize::new(NCORE);

pub enum Dispatch {
    Run,
    Dead,
}

/// Block until this thread is dispatched (CURR) or retired (FREE/killed).
pub fn WaitDispatch(tid: i32) -> Dispatch {
    loop {
        let (state, killed, parker) = ThrWith(tid, |t| (t.state, t.killed, t.parker.clone()));
        if state == ThrState::Curr {
            return Dispatch::Run;
        }
        if state == ThrState::Free || killed {
            return Dispatch::Dead;
        }
        parker.Park();
    }
}

/// Reschedule the caller's core to its highest-priority ready thread.
///
/// On entry the caller holds the interrupt token and its TCB already names
/// the correct next state if it is no longer CURR. When the caller loses the
/// core, the token is released across the switch (the saved depth rides in
/// the TCB like a saved interrupt mask) and restored when the caller is
/// dispatched again.
pub fn Resched() -> Result<()> {
    let core = GetCpuId() as usize;

    if RESDEFER[core].load(Ordering::Acquire) > 0 {
        RESDEFER[core].fetch_add(1, Ordering::AcqRel);
        return Ok(());
    }

    let old = ThrCurrent(core as u32);
    if old < 0 || GetTid() != old {
        // Only the thread owning the core can give it up.
        return Ok(());
    }

    let (oldstate, oldprio) = ThrWith(old, |t| (t.state, t.prio));
    if oldstate == ThrState::Curr {
        let stay = QUETAB.With(|q| {
            q.NonEmpty(READYLIST[core]) && oldprio > q.FirstKey(READYLIST[core])
        });
        if stay {
            return Ok(());
        }
        ThrWith(old, |t| t.state = ThrState::Ready);
        QUETAB.With(|q| q.Insert(old, READYLIST[core], oldprio))?;
    }

    let new = QUETAB.With(|q| q.Dequeue(READYLIST[core]));
    if new == old {
        ThrWith(old, |t| t.state = ThrState::Curr);
        return Ok(());
    }
    if new == EMPTY {
        error!("resched: core {} ready list empty under blocked CURR", core);
        ThrWith(old, |t| t.state = ThrState::Curr);
        return Err(Error::SysErr);
    }

    THRCURRENT[core].store(new, Ordering::Release);
    let newparker = ThrWith(new, |t| {
        t.state = ThrState::Curr;
        t.parker.clone()
    });
    CTXSW_COUNT.Incr();

    let saved = INTC.FullRelease();
    ThrWith(old, |t| t.intmask = saved);
    newparker.Unpark();

    match WaitDispatch(old) {
        Dispatch::Run => {
            INTC.Reacquire(saved);
            return Ok(());
        }
        Dispatch::Dead => {
            std::panic::panic_any(ThreadExit);
        }
    }
}

/// Make a thread eligible for CPU service on a core. An unset affinity is
/// resolved here (to `core`) and never migrates afterwards.
pub fn Ready(tid: i32, resch: bool, core: u32) -> Result<()> {
    if IsBadTid(tid) || core as usize >= NCORE {
        return Err(Error::SysErr);
    }

    let (aff, prio) = ThrWith(tid, |t| {
        t.state = ThrState::Ready;
        if t.core_affinity < 0 {
            t.core_affinity = core as i32;
        }
        (t.core_affinity, t.prio)
    });

    QUETAB.With(|q| q.Insert(tid, READYLIST[aff as usize], prio))?;

    let cpuid = GetCpuId();
    if resch == RESCHED_YES && aff == cpuid as i32 {
        Resched()?;
    }
    return Ok(());
}

/// Give up the processor voluntarily.
pub fn Yield() -> Result<()> {
    let _im = Disable();
    return Resched();
}

/// Carve out a new thread in the suspended state. `entry` runs with
/// interrupts enabled at the first dispatch; returning from it kills the
/// thread. A `ssize` of 0 picks the configured default stack reservation.
pub fn Create(
    entry: impl FnOnce() -> i32 + std::marker::Send + 'static,
    ssize: usize,
    prio: i32,
    name: &str,
) -> Result<i32> {
    let mut ssize = ssize;
    if ssize == 0 {
        ssize = super::KERNEL_CONFIG.lock().InitStk;
    }
    if ssize < MINSTK {
        ssize = MINSTK;
    }

    let _im = Disable();

    let tid = NewTid()?;
    let stkbase = match StkGet(ssize) {
        Ok(b) => b,
        Err(e) => {
            ThrWith(tid, |t| t.state = ThrState::Free);
            return Err(e);
        }
    };

    let parker = Arc::new(Parker::New());
    let parent = GetTid();
    ThrWith(tid, |t| {
        t.prio = prio;
        t.stkbase = stkbase;
        t.stklen = ssize;
        t.parent = parent;
        t.core_affinity = -1;
        t.hasmsg = false;
        t.msg = 0;
        t.sem = -1;
        t.intmask = 0;
        t.name = name.to_string();
        t.killed = false;
        t.parker = parker;
    });
    THRCOUNT.fetch_add(1, Ordering::AcqRel);

    let boxed: Box<dyn FnOnce() -> i32 + std::marker::Send> = Box::new(entry);
    let spawned = std::thread::Builder::new()
        .name(format!("thr{:02}-{}", tid, name))
        .spawn(move || Trampoline(tid, boxed));
    if let Err(e) = spawned {
        error!("create: host spawn failed: {}", e);
        THRCOUNT.fetch_add(-1, Ordering::AcqRel);
        let _ = StkFree(stkbase, ssize);
        ThrWith(tid, |t| t.state = ThrState::Free);
        return Err(Error::SysErr);
    }

    trace!("create: tid {} ({}) prio {}", tid, name, prio);
    return Ok(tid);
}

fn NewTid() -> Result<i32> {
    for _ in 0..NTHREAD {
        let n = NEXTTID.fetch_add(1, Ordering::AcqRel) % NTHREAD;
        if n < NCORE {
            continue;
        }
        let claimed = ThrWith(n as i32, |t| {
            if t.state == ThrState::Free {
                t.state = ThrState::Susp;
                return true;
            }
            return false;
        });
        if claimed {
            return Ok(n as i32);
        }
    }
    return Err(Error::SysErr);
}

fn Trampoline(tid: i32, entry: Box<dyn FnOnce() -> i32 + std::marker::Send>) {
    SetCurTid(tid);
    defer!(trace!("thread {} retired", tid));

    match WaitDispatch(tid) {
        Dispatch::Dead => return,
        Dispatch::Run => (),
    }
    let core = ThrWith(tid, |t| t.core_affinity);
    SetCurCore(core);

    let r = catch_unwind(AssertUnwindSafe(|| {
        entry();
    }));
    match r {
        Ok(()) => {
            // userret: falling off the entry ends the thread.
            let _ = catch_unwind(AssertUnwindSafe(|| {
                let _ = Kill(tid);
            }));
        }
        Err(p) => {
            if p.downcast_ref::<ThreadExit>().is_none() {
                error!("thread {} terminated by panic", tid);
                let _ = catch_unwind(AssertUnwindSafe(|| {
                    let _ = Kill(tid);
                }));
            }
        }
    }
}

/// Kill a thread and remove it from the system. Refuses the null threads
/// and threads pinned to another core. Killing the calling thread does not
/// return.
pub fn Kill(tid: i32) -> Result<()> {
    let cpuid = GetCpuId();
    let _im = Disable();

    if IsBadTid(tid) || IsNullThread(tid) {
        return Err(Error::SysErr);
    }

    let (aff, parent, stkbase, stklen, state, sem) = ThrWith(tid, |t| {
        (
            t.core_affinity,
            t.parent,
            t.stkbase,
            t.stklen,
            t.state,
            t.sem,
        )
    });

    if aff >= 0 && aff != cpuid as i32 {
        return Err(Error::SysErr);
    }

    if THRCOUNT.fetch_add(-1, Ordering::AcqRel) - 1 <= 1 {
        super::Shutdown();
    }

    let _ = Send(parent, tid as i64);
    if stklen > 0 {
        let _ = StkFree(stkbase, stklen);
    }

    match state {
        ThrState::Sleep | ThrState::Tmout => {
            let _ = super::clock::Unsleep(tid);
            RetireOther(tid);
        }
        ThrState::Curr => {
            // Self-immolation: mark FREE, hand the core over and unwind.
            ThrWith(tid, |t| {
                t.state = ThrState::Free;
                t.killed = true;
            });
            Resched()?;
            return Ok(());
        }
        ThrState::Wait => {
            if sem >= 0 {
                SemWith(sem, |s| s.count += 1);
            }
            QUETAB.With(|q| q.GetItem(tid));
            RetireOther(tid);
        }
        ThrState::Ready => {
            QUETAB.With(|q| q.GetItem(tid));
            RetireOther(tid);
        }
        _ => {
            RetireOther(tid);
        }
    }
    return Ok(());
}

fn RetireOther(tid: i32) {
    let parker = ThrWith(tid, |t| {
        t.state = ThrState::Free;
        t.killed = true;
        t.core_affinity = -1;
        t.parker.clone()
    });
    parker.Unpark();
}

/// Suspend a thread, placing it in hibernation. Returns its priority.
pub fn Suspend(tid: i32) -> Result<i32> {
    let _im = Disable();
    if IsBadTid(tid) || IsNullThread(tid) {
        return Err(Error::SysErr);
    }
    let (state, prio) = ThrWith(tid, |t| (t.state, t.prio));
    match state {
        ThrState::Ready => {
            QUETAB.With(|q| q.GetItem(tid));
            ThrWith(tid, |t| t.state = ThrState::Susp);
        }
        ThrState::Curr if tid == GetTid() => {
            ThrWith(tid, |t| t.state = ThrState::Susp);
            Resched()?;
        }
        _ => {
            return Err(Error::SysErr);
        }
    }
    return Ok(prio);
}

/// Unsuspend a thread, making it ready. Returns its priority.
pub fn Resume(tid: i32) -> Result<i32> {
    let _im = Disable();
    if IsBadTid(tid) {
        return Err(Error::SysErr);
    }
    let (state, prio) = ThrWith(tid, |t| (t.state, t.prio));
    if state != ThrState::Susp {
        return Err(Error::SysErr);
    }
    Ready(tid, RESCHED_YES, GetCpuId())?;
    return Ok(prio);
}

/// Start the per-core null threads; each is the initial CURR of its core
/// and soaks up the core whenever nothing else is ready.
pub fn SchedInit() {
    lazy_static::initialize(&READYLIST);
    lazy_static::initialize(&super::clock::SLEEPQ);

    for core in 0..NCORE {
        ThrWith(core as i32, |t| {
            t.state = ThrState::Curr;
            t.prio = 0;
            t.core_affinity = core as i32;
            t.name = format!("prnull{}", core);
        });
        THRCURRENT[core].store(core as i32, Ordering::Release);
        std::thread::Builder::new()
            .name(format!("prnull{}", core))
            .spawn(move || NullLoop(core))
            .expect("null thread spawn");
    }
    THRCOUNT.store(NCORE as i32, Ordering::Release);
}

fn NullLoop(core: usize) {
    SetCurTid(core as i32);
    SetCurCore(core as i32);
    loop {
        let _ = RecvClr();
        let _ = Yield();
        std::thread::sleep(Duration::from_micros(200));
    }
}
