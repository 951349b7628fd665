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

//! The `im = disable(); ...; restore(im)` idiom, rendered as a scoped token.
//!
//! On the board this masks local interrupts; in the simulation it is the
//! serialization point between syscall paths and the timer source. The
//! controller is reentrant per host thread, and the scheduler releases it
//! entirely while a thread is parked, restoring the saved depth when the
//! thread is dispatched again.

use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::ThreadId;

use lazy_static::lazy_static;

lazy_static! {
    pub static ref INTC: IntCtrl = IntCtrl::New();
}

pub struct IntCtrlIntern {
    pub owner: Option<ThreadId>,
    pub depth: usize,
}

pub struct IntCtrl {
    state: Mutex<IntCtrlIntern>,
    cv: Condvar,
}

impl IntCtrl {
    pub fn New() -> Self {
        return Self {
            state: Mutex::new(IntCtrlIntern {
                owner: None,
                depth: 0,
            }),
            cv: Condvar::new(),
        };
    }

    fn Lock(&self) -> std::sync::MutexGuard<'_, IntCtrlIntern> {
        return match self.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
    }

    pub fn Disable(&self) {
        let me = thread::current().id();
        let mut s = self.Lock();
        loop {
            if s.owner == Some(me) {
                s.depth += 1;
                return;
            }
            if s.owner.is_none() {
                s.owner = Some(me);
                s.depth = 1;
                return;
            }
            s = match self.cv.wait(s) {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
        }
    }

    pub fn Restore(&self) {
        let me = thread::current().id();
        let mut s = self.Lock();
        if s.owner != Some(me) {
            // A guard dropped on the kill-unwind path after the scheduler
            // already released the token on our behalf.
            return;
        }
        s.depth -= 1;
        if s.depth == 0 {
            s.owner = None;
            self.cv.notify_all();
        }
    }

    /// Drop ownership entirely, returning the nesting depth so the thread
    /// can restore it after the next dispatch. No-op (depth 0) when the
    /// caller does not own the token.
    pub fn FullRelease(&self) -> usize {
        let me = thread::current().id();
        let mut s = self.Lock();
        if s.owner != Some(me) {
            return 0;
        }
        let depth = s.depth;
        s.owner = None;
        s.depth = 0;
        self.cv.notify_all();
        return depth;
    }

    pub fn Reacquire(&self, depth: usize) {
        if depth == 0 {
            return;
        }
        let me = thread::current().id();
        let mut s = self.Lock();
        loop {
            if s.owner.is_none() {
                s.owner = Some(me);
                s.depth = depth;
                return;
            }
            s = match self.cv.wait(s) {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
        }
    }
}

/// Interrupts-disabled token. Dropping it restores the previous state on
/// every exit path.
pub struct IrqGuard {
    _p: (),
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        INTC.Restore();
    }
}

pub fn Disable() -> IrqGuard {
    INTC.Disable();
    return IrqGuard { _p: () };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_disable_restores_in_order() {
        let c = IntCtrl::New();
        c.Disable();
        c.Disable();
        c.Restore();
        {
            let s = c.Lock();
            assert_eq!(s.depth, 1);
        }
        c.Restore();
        let s = c.Lock();
        assert_eq!(s.depth, 0);
        assert!(s.owner.is_none());
    }

    #[test]
    fn full_release_reports_depth() {
        let c = IntCtrl::New();
        c.Disable();
        c.Disable();
        let depth = c.FullRelease();
        assert_eq!(depth, 2);
        c.Reacquire(depth);
        {
            let s = c.Lock();
            assert_eq!(s.depth, 2);
        }
        c.Restore();
        c.Restore();
    }

    #[test]
    fn foreign_restore_is_ignored() {
        let c = IntCtrl::New();
        c.Restore();
        assert_eq!(c.FullRelease(), 0);
    }
}
