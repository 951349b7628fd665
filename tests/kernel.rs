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

//! Scheduler and synchronization scenarios, each run as a kernel thread.
//! The kernel tables are process-wide, so the cases serialize on one lock.

#![allow(non_snake_case)]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use qmicro::kernel::clock::Sleep;
use qmicro::kernel::mailbox::*;
use qmicro::kernel::message::*;
use qmicro::kernel::monitor;
use qmicro::kernel::sched::*;
use qmicro::kernel::semaphore::*;
use qmicro::kernel::KernelRunOn;
use qmicro::mem::bufpool::*;
use qmicro::Error;

lazy_static::lazy_static! {
    static ref TESTLOCK: Mutex<()> = Mutex::new(());
}

fn Serial() -> std::sync::MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    return match TESTLOCK.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    };
}

#[test]
fn preempt_higher_priority_thread_runs_first() {
    let _s = Serial();

    let ran_high = Arc::new(AtomicBool::new(false));
    let rh = ran_high.clone();

    let observed = KernelRunOn(0, 35, move || {
        // A spinner below our priority never gets the core while we live.
        let spin = Create(
            || {
                loop {
                    std::hint::spin_loop();
                }
            },
            0,
            30,
            "spinner",
        )
        .unwrap();
        Ready(spin, RESCHED_NO, 0).unwrap();

        let flag = rh.clone();
        let high = Create(
            move || {
                flag.store(true, Ordering::SeqCst);
                return 0;
            },
            0,
            40,
            "high",
        )
        .unwrap();

        // Readying the higher-priority thread hands it the core at once;
        // by the time this call returns it has run to completion.
        Ready(high, RESCHED_YES, 0).unwrap();
        let saw = rh.load(Ordering::SeqCst);

        Kill(spin).unwrap();
        return saw;
    })
    .unwrap();

    assert!(observed);
    assert!(ran_high.load(Ordering::SeqCst));
}

#[test]
fn semaphore_waiters_release_fifo() {
    let _s = Serial();

    let order = Arc::new(Mutex::new(Vec::new()));

    let sem = KernelRunOn(0, 40, {
        let order = order.clone();
        move || {
            let sem = SemCreate(0).unwrap();
            for n in 1..=3 {
                let order = order.clone();
                let tid = Create(
                    move || {
                        Wait(sem).unwrap();
                        order.lock().unwrap().push(n);
                        return 0;
                    },
                    0,
                    30,
                    &format!("waiter{}", n),
                )
                .unwrap();
                Ready(tid, RESCHED_NO, 0).unwrap();
                // Let this waiter block before starting the next so the
                // queue order matches the start order.
                Sleep(10).unwrap();
            }

            assert_eq!(SemCount(sem), Ok(-3));
            SignalN(sem, 3).unwrap();
            Sleep(30).unwrap();
            return sem;
        }
    })
    .unwrap();

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(SemCount(sem), Ok(0));
    SemFree(sem).unwrap();
}

#[test]
fn wait_then_signal_leaves_count_unchanged() {
    let _s = Serial();

    KernelRunOn(0, 40, || {
        let sem = SemCreate(3).unwrap();
        Wait(sem).unwrap();
        Signal(sem).unwrap();
        assert_eq!(SemCount(sem), Ok(3));
        SemFree(sem).unwrap();
    })
    .unwrap();
}

#[test]
fn semfree_releases_blocked_waiters() {
    let _s = Serial();

    let woke = Arc::new(AtomicBool::new(false));
    let w = woke.clone();

    KernelRunOn(0, 40, move || {
        let sem = SemCreate(0).unwrap();
        let flag = w.clone();
        let tid = Create(
            move || {
                // The semaphore dies while we sleep on it; the wait still
                // returns cleanly.
                Wait(sem).unwrap();
                flag.store(true, Ordering::SeqCst);
                return 0;
            },
            0,
            30,
            "doomed",
        )
        .unwrap();
        Ready(tid, RESCHED_NO, 0).unwrap();
        Sleep(10).unwrap();

        SemFree(sem).unwrap();
        Sleep(20).unwrap();

        // The freed id is dead to later callers.
        assert_eq!(Wait(sem), Err(Error::SysErr));
    })
    .unwrap();

    assert!(woke.load(Ordering::SeqCst));
}

#[test]
fn semcreate_rejects_negative_count() {
    let _s = Serial();
    assert_eq!(SemCreate(-1), Err(Error::SysErr));
}

#[test]
fn mailbox_backpressure_and_fifo() {
    let _s = Serial();

    let third_sent = Arc::new(AtomicBool::new(false));
    let ts = third_sent.clone();

    KernelRunOn(0, 40, move || {
        let mbox = MailboxAlloc(2).unwrap();
        MailboxSend(mbox, 1).unwrap();
        MailboxSend(mbox, 2).unwrap();

        let flag = ts.clone();
        let tid = Create(
            move || {
                MailboxSend(mbox, 3).unwrap();
                flag.store(true, Ordering::SeqCst);
                return 0;
            },
            0,
            30,
            "sender3",
        )
        .unwrap();
        Ready(tid, RESCHED_NO, 0).unwrap();
        Sleep(20).unwrap();

        // Full mailbox: the third send is still parked.
        assert!(!ts.load(Ordering::SeqCst));
        assert_eq!(MailboxCount(mbox), Ok(2));

        assert_eq!(MailboxReceive(mbox), Ok(1));
        Sleep(20).unwrap();
        assert!(ts.load(Ordering::SeqCst));

        assert_eq!(MailboxReceive(mbox), Ok(2));
        assert_eq!(MailboxReceive(mbox), Ok(3));
        MailboxFree(mbox).unwrap();
    })
    .unwrap();
}

#[test]
fn mailbox_free_fails_blocked_receiver() {
    let _s = Serial();

    let result = Arc::new(Mutex::new(None));
    let r = result.clone();

    KernelRunOn(0, 40, move || {
        let mbox = MailboxAlloc(4).unwrap();
        let slot = r.clone();
        let tid = Create(
            move || {
                *slot.lock().unwrap() = Some(MailboxReceive(mbox));
                return 0;
            },
            0,
            30,
            "receiver",
        )
        .unwrap();
        Ready(tid, RESCHED_NO, 0).unwrap();
        Sleep(10).unwrap();

        MailboxFree(mbox).unwrap();
        Sleep(20).unwrap();
    })
    .unwrap();

    assert_eq!(*result.lock().unwrap(), Some(Err(Error::SysErr)));
}

#[test]
fn message_roundtrip_and_timeout() {
    let _s = Serial();

    let got = Arc::new(AtomicI32::new(0));
    let g = got.clone();

    KernelRunOn(0, 40, move || {
        // A bounded receive with nothing pending times out empty-handed.
        assert_eq!(RecvTime(20), Err(Error::Timeout));

        let sink = g.clone();
        let tid = Create(
            move || {
                let msg = Receive().unwrap();
                sink.store(msg as i32, Ordering::SeqCst);
                return 0;
            },
            0,
            30,
            "receiver",
        )
        .unwrap();
        Ready(tid, RESCHED_NO, 0).unwrap();
        Sleep(10).unwrap();

        Send(tid, 1234).unwrap();
        Sleep(10).unwrap();
    })
    .unwrap();

    assert_eq!(got.load(Ordering::SeqCst), 1234);
}

#[test]
fn sleep_shorter_delay_wakes_first() {
    let _s = Serial();

    let order = Arc::new(Mutex::new(Vec::new()));

    KernelRunOn(0, 40, {
        let order = order.clone();
        move || {
            for (n, ms) in [(1, 30u32), (2, 60u32)].iter() {
                let order = order.clone();
                let (n, ms) = (*n, *ms);
                let tid = Create(
                    move || {
                        Sleep(ms).unwrap();
                        order.lock().unwrap().push(n);
                        return 0;
                    },
                    0,
                    30,
                    &format!("sleeper{}", n),
                )
                .unwrap();
                Ready(tid, RESCHED_NO, 0).unwrap();
            }
            Sleep(150).unwrap();
        }
    })
    .unwrap();

    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}

#[test]
fn kill_waiting_thread_restores_count() {
    let _s = Serial();

    KernelRunOn(0, 40, || {
        let sem = SemCreate(0).unwrap();
        let tid = Create(
            move || {
                let _ = Wait(sem);
                return 0;
            },
            0,
            30,
            "victim",
        )
        .unwrap();
        Ready(tid, RESCHED_NO, 0).unwrap();
        Sleep(10).unwrap();
        assert_eq!(SemCount(sem), Ok(-1));

        Kill(tid).unwrap();
        assert_eq!(SemCount(sem), Ok(0));

        // The slot is gone; killing again fails.
        assert_eq!(Kill(tid), Err(Error::SysErr));
        SemFree(sem).unwrap();
    })
    .unwrap();
}

#[test]
fn monitor_recursive_lock_unlock() {
    let _s = Serial();

    let second_owner = Arc::new(AtomicBool::new(false));
    let so = second_owner.clone();

    KernelRunOn(0, 40, move || {
        let mon = monitor::MonCreate().unwrap();

        monitor::Lock(mon).unwrap();
        monitor::Lock(mon).unwrap();
        monitor::Lock(mon).unwrap();
        assert_eq!(monitor::MonCount(mon), Ok(3));

        monitor::Unlock(mon).unwrap();
        monitor::Unlock(mon).unwrap();
        assert_eq!(monitor::MonCount(mon), Ok(1));

        let flag = so.clone();
        let tid = Create(
            move || {
                monitor::Lock(mon).unwrap();
                flag.store(true, Ordering::SeqCst);
                monitor::Unlock(mon).unwrap();
                return 0;
            },
            0,
            30,
            "contender",
        )
        .unwrap();
        Ready(tid, RESCHED_NO, 0).unwrap();
        Sleep(10).unwrap();

        // Still ours; the contender is parked on the monitor.
        assert!(!so.load(Ordering::SeqCst));

        monitor::Unlock(mon).unwrap();
        Sleep(20).unwrap();
        assert!(so.load(Ordering::SeqCst));

        assert_eq!(monitor::MonCount(mon), Ok(0));
        assert_eq!(monitor::Unlock(mon), Err(Error::SysErr));
        monitor::MonFree(mon).unwrap();
    })
    .unwrap();
}

#[test]
fn suspend_then_resume_runs_thread() {
    let _s = Serial();

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();

    KernelRunOn(0, 40, move || {
        let flag = r.clone();
        let tid = Create(
            move || {
                flag.store(true, Ordering::SeqCst);
                return 0;
            },
            0,
            30,
            "suspended",
        )
        .unwrap();

        // Created threads sit in hibernation until resumed or readied.
        Sleep(10).unwrap();
        assert!(!r.load(Ordering::SeqCst));

        assert_eq!(Resume(tid), Ok(30));
        Sleep(10).unwrap();
    })
    .unwrap();

    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn affinity_pins_thread_and_blocks_cross_core_kill() {
    let _s = Serial();

    let core_seen = Arc::new(AtomicI32::new(-1));
    let cs = core_seen.clone();

    KernelRunOn(0, 40, move || {
        let seen = cs.clone();
        let tid = Create(
            move || {
                seen.store(qmicro::kernel::thread::GetCpuId() as i32, Ordering::SeqCst);
                Sleep(200).unwrap();
                return 0;
            },
            0,
            30,
            "oncore1",
        )
        .unwrap();

        // First ready pins the affinity; the thread runs over there.
        Ready(tid, RESCHED_NO, 1).unwrap();
        Sleep(50).unwrap();
        assert_eq!(cs.load(Ordering::SeqCst), 1);

        // A thread pinned to another core cannot be killed from here.
        assert_eq!(Kill(tid), Err(qmicro::Error::SysErr));
    })
    .unwrap();

    assert_eq!(core_seen.load(Ordering::SeqCst), 1);
}

#[test]
fn bufpool_conserves_buffers_and_catches_double_free() {
    let _s = Serial();

    KernelRunOn(0, 40, || {
        let pool = BfpAlloc(64, 4).unwrap();
        let free0 = PoolSemCount(pool);
        assert_eq!(free0, 4);

        let a = BufGet(pool).unwrap();
        let b = BufGet(pool).unwrap();
        assert_eq!(PoolSemCount(pool), 2);

        BufFree(a).unwrap();
        BufFree(b).unwrap();
        assert_eq!(PoolSemCount(pool), 4);

        // The accounting header's self-link catches the second free.
        assert_eq!(BufFree(a), Err(Error::SysErr));

        BfpFree(pool).unwrap();
    })
    .unwrap();
}

fn PoolSemCount(pool: i32) -> i32 {
    let sem = BFPTAB[pool as usize].lock().freebuf;
    return SemCount(sem).unwrap();
}
