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

pub mod interrupt;
pub mod kmutex;
pub mod queue;
pub mod thread;
pub mod sched;
pub mod semaphore;
pub mod monitor;
pub mod mailbox;
pub mod message;
pub mod clock;

use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Once;
use std::time::Duration;

use lazy_static::lazy_static;

use super::qlib::common::*;
use super::qlib::config::*;
use super::qlib::mutex::*;
use self::sched::*;
use self::thread::*;

lazy_static! {
    pub static ref KERNEL_CONFIG: QMutex<Config> = QMutex::new(Config::default());
}

static START: Once = Once::new();
pub static STARTED: AtomicBool = AtomicBool::new(false);
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Bring the kernel up with the given configuration. Idempotent; the first
/// caller wins. Boots the per-core null threads, the timer source and the
/// network daemons.
pub fn Start(config: Config) {
    START.call_once(|| {
        *KERNEL_CONFIG.lock() = config;
        Boot();
    });
}

pub fn EnsureStarted() {
    START.call_once(|| {
        Boot();
    });
}

fn Boot() {
    // Retiring a killed thread rides a private unwind payload; keep the
    // default panic report for everything else.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if info.payload().downcast_ref::<ThreadExit>().is_none() {
            default_hook(info);
        }
    }));

    let config = KERNEL_CONFIG.lock().clone();
    info!("kernel boot: {}", config.Print());

    SchedInit();

    let tick = Duration::from_micros(1_000_000 / config.TickHz.max(1));
    std::thread::Builder::new()
        .name("clkintr".to_string())
        .spawn(move || loop {
            std::thread::sleep(tick);
            if SHUTDOWN.load(Ordering::Acquire) {
                break;
            }
            clock::ClkHandler();
        })
        .expect("kernel boot: timer source");

    STARTED.store(true, Ordering::Release);

    crate::device::DevInitAll();
    if let Err(e) = crate::net::NetInit() {
        error!("kernel boot: network init failed: {:?}", e);
    }
}

/// Orderly halt: stops the timer source and leaves the tables frozen. Called
/// when the live-thread count drops to the null threads alone.
pub fn Shutdown() {
    info!("kernel shutdown: only null threads remain");
    SHUTDOWN.store(true, Ordering::Release);
}

/// Run a closure as a kernel thread on core 0 at the default priority and
/// hand its value back to the (non-kernel) caller.
pub fn KernelRun<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> Result<R> {
    let prio = KERNEL_CONFIG.lock().InitPrio;
    return KernelRunOn(0, prio, f);
}

pub fn KernelRunOn<R: Send + 'static>(
    core: u32,
    prio: i32,
    f: impl FnOnce() -> R + Send + 'static,
) -> Result<R> {
    EnsureStarted();

    let (tx, rx) = mpsc::channel();
    let tid = Create(
        move || {
            let r = f();
            let _ = tx.send(r);
            return 0;
        },
        0,
        prio,
        "krun",
    )?;
    Ready(tid, RESCHED_NO, core)?;

    match rx.recv() {
        Ok(r) => Ok(r),
        Err(_) => Err(Error::SysErr),
    }
}
