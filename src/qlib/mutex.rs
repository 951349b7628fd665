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

use core::ops::Deref;
use core::ops::DerefMut;

// Spin lock for table entries and driver state. Scopes must stay short and
// must never reach a suspension point; anything that can block goes through
// the scheduler's own primitives instead.
pub struct QMutex<T: ?Sized> {
    lock: spin::Mutex<T>,
}

pub struct QMutexGuard<'a, T: ?Sized + 'a> {
    guard: spin::MutexGuard<'a, T>,
}

impl<T> QMutex<T> {
    pub const fn new(data: T) -> Self {
        return Self {
            lock: spin::Mutex::new(data),
        };
    }
}

impl<T: ?Sized> QMutex<T> {
    pub fn lock(&self) -> QMutexGuard<'_, T> {
        return QMutexGuard {
            guard: self.lock.lock(),
        };
    }

    pub fn try_lock(&self) -> Option<QMutexGuard<'_, T>> {
        match self.lock.try_lock() {
            None => None,
            Some(g) => Some(QMutexGuard { guard: g }),
        }
    }
}

impl<'a, T: ?Sized> Deref for QMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        return &*self.guard;
    }
}

impl<'a, T: ?Sized> DerefMut for QMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        return &mut *self.guard;
    }
}

impl<T: Default> Default for QMutex<T> {
    fn default() -> Self {
        return Self::new(T::default());
    }
}
