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

//! The global thread queue table. One array of doubly linked entries backs
//! every ready, waiter and sleep queue; a thread id doubles as its entry
//! index, so a thread can sit in exactly one queue at a time. Queues are
//! head/tail sentinel pairs allocated past the thread range, with keys
//! +INF/-INF so sorted scans terminate without bounds checks.

use lazy_static::lazy_static;

use super::super::qlib::common::*;
use super::kmutex::MuxLock;
use super::semaphore::NSEM;
use super::thread::NCORE;
use super::thread::NTHREAD;

// Ready list per core, the sleep queue, and one waiter queue per semaphore.
pub const NQUEUES: usize = NCORE + 1 + NSEM;
pub const NQENT: usize = NTHREAD + 2 * NQUEUES;

pub const EMPTY: i32 = -1;
pub const MAXKEY: i32 = i32::MAX;
pub const MINKEY: i32 = i32::MIN;

pub type Qid = usize;

#[derive(Clone, Copy, Debug)]
pub struct QueEnt {
    pub prev: i32,
    pub next: i32,
    pub key: i32,
}

pub struct QueTab {
    pub ents: Vec<QueEnt>,
    nextq: usize,
}

lazy_static! {
    pub static ref QUETAB: MuxLock<QueTab> = MuxLock::New(QueTab::New());
}

fn IsBadTid(tid: i32) -> bool {
    return tid < 0 || tid as usize >= NTHREAD;
}

impl QueTab {
    pub fn New() -> Self {
        return Self {
            ents: vec![
                QueEnt {
                    prev: EMPTY,
                    next: EMPTY,
                    key: 0,
                };
                NQENT
            ],
            nextq: NTHREAD,
        };
    }

    fn Head(q: Qid) -> usize {
        return q;
    }

    fn Tail(q: Qid) -> usize {
        return q + 1;
    }

    pub fn IsBadQid(&self, q: Qid) -> bool {
        return q < NTHREAD || q + 1 >= NQENT || q >= self.nextq || (q - NTHREAD) % 2 != 0;
    }

    /// Hand out a fresh head/tail pair.
    pub fn NewQueue(&mut self) -> Result<Qid> {
        if self.nextq + 2 > NQENT {
            return Err(Error::SysErr);
        }
        let q = self.nextq;
        self.nextq += 2;

        self.ents[Self::Head(q)] = QueEnt {
            prev: EMPTY,
            next: Self::Tail(q) as i32,
            key: MAXKEY,
        };
        self.ents[Self::Tail(q)] = QueEnt {
            prev: Self::Head(q) as i32,
            next: EMPTY,
            key: MINKEY,
        };
        return Ok(q);
    }

    pub fn IsEmpty(&self, q: Qid) -> bool {
        return self.ents[Self::Head(q)].next == Self::Tail(q) as i32;
    }

    pub fn NonEmpty(&self, q: Qid) -> bool {
        return !self.IsEmpty(q);
    }

    pub fn FirstId(&self, q: Qid) -> i32 {
        if self.IsEmpty(q) {
            return EMPTY;
        }
        return self.ents[Self::Head(q)].next;
    }

    pub fn FirstKey(&self, q: Qid) -> i32 {
        return self.ents[self.ents[Self::Head(q)].next as usize].key;
    }

    /// Decrement the head entry's key (the next sleeper's remaining delta)
    /// and return the new value. Caller checks non-emptiness.
    pub fn DecFirstKey(&mut self, q: Qid) -> i32 {
        let first = self.ents[Self::Head(q)].next as usize;
        self.ents[first].key -= 1;
        return self.ents[first].key;
    }

    /// Append before the tail sentinel.
    pub fn Enqueue(&mut self, tid: i32, q: Qid) -> Result<i32> {
        if self.IsBadQid(q) || IsBadTid(tid) {
            return Err(Error::SysErr);
        }

        let tail = Self::Tail(q) as i32;
        let prev = self.ents[tail as usize].prev;

        self.ents[tid as usize].next = tail;
        self.ents[tid as usize].prev = prev;
        self.ents[prev as usize].next = tid;
        self.ents[tail as usize].prev = tid;
        return Ok(tid);
    }

    /// Remove and return the head, EMPTY when there is none.
    pub fn Dequeue(&mut self, q: Qid) -> i32 {
        if self.IsBadQid(q) || self.IsEmpty(q) {
            return EMPTY;
        }
        let first = self.ents[Self::Head(q)].next;
        return self.GetItem(first);
    }

    /// Unlink an arbitrary thread from whatever queue holds it.
    pub fn GetItem(&mut self, tid: i32) -> i32 {
        if IsBadTid(tid) {
            return EMPTY;
        }
        let prev = self.ents[tid as usize].prev;
        let next = self.ents[tid as usize].next;
        if prev != EMPTY {
            self.ents[prev as usize].next = next;
        }
        if next != EMPTY {
            self.ents[next as usize].prev = prev;
        }
        self.ents[tid as usize].prev = EMPTY;
        self.ents[tid as usize].next = EMPTY;
        return tid;
    }

    /// Sorted insert by descending key; an equal key lands after the
    /// entries already holding it, so ready queues pick the older of equal
    /// priorities.
    pub fn Insert(&mut self, tid: i32, q: Qid, key: i32) -> Result<()> {
        if self.IsBadQid(q) || IsBadTid(tid) {
            return Err(Error::SysErr);
        }

        let mut next = self.ents[Self::Head(q)].next;
        while self.ents[next as usize].key >= key {
            next = self.ents[next as usize].next;
        }

        let prev = self.ents[next as usize].prev;
        self.ents[tid as usize].next = next;
        self.ents[tid as usize].prev = prev;
        self.ents[tid as usize].key = key;
        self.ents[prev as usize].next = tid;
        self.ents[next as usize].prev = tid;
        return Ok(());
    }

    /// Delta-queue insert: each entry's key is its delay beyond its
    /// predecessor; the successor's key absorbs the remainder so the total
    /// delay of everything behind the new entry is unchanged.
    pub fn InsertDelta(&mut self, tid: i32, q: Qid, key: i32) -> Result<()> {
        if self.IsBadQid(q) || IsBadTid(tid) {
            return Err(Error::SysErr);
        }

        let tail = Self::Tail(q) as i32;
        let mut key = key;
        let mut prev = Self::Head(q) as i32;
        let mut next = self.ents[Self::Head(q)].next;
        while self.ents[next as usize].key <= key && next != tail {
            key -= self.ents[next as usize].key;
            prev = next;
            next = self.ents[next as usize].next;
        }

        self.ents[tid as usize].next = next;
        self.ents[tid as usize].prev = prev;
        self.ents[tid as usize].key = key;
        self.ents[prev as usize].next = tid;
        self.ents[next as usize].prev = tid;
        if next != tail {
            self.ents[next as usize].key -= key;
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_enqueue_dequeue() {
        let mut t = QueTab::New();
        let q = t.NewQueue().unwrap();
        assert!(t.IsEmpty(q));
        t.Enqueue(5, q).unwrap();
        t.Enqueue(6, q).unwrap();
        t.Enqueue(7, q).unwrap();
        assert_eq!(t.Dequeue(q), 5);
        assert_eq!(t.Dequeue(q), 6);
        assert_eq!(t.Dequeue(q), 7);
        assert_eq!(t.Dequeue(q), EMPTY);
    }

    #[test]
    fn insert_orders_descending_with_fifo_ties() {
        let mut t = QueTab::New();
        let q = t.NewQueue().unwrap();
        t.Insert(1, q, 10).unwrap();
        t.Insert(2, q, 30).unwrap();
        t.Insert(3, q, 20).unwrap();
        t.Insert(4, q, 20).unwrap();
        assert_eq!(t.Dequeue(q), 2);
        assert_eq!(t.Dequeue(q), 3);
        assert_eq!(t.Dequeue(q), 4);
        assert_eq!(t.Dequeue(q), 1);
    }

    #[test]
    fn delta_insert_preserves_total_delay() {
        let mut t = QueTab::New();
        let q = t.NewQueue().unwrap();
        t.InsertDelta(1, q, 10).unwrap();
        t.InsertDelta(2, q, 25).unwrap();
        t.InsertDelta(3, q, 15).unwrap();
        // Absolute delays 10, 15, 25 expressed as deltas 10, 5, 10.
        assert_eq!(t.ents[1].key, 10);
        assert_eq!(t.ents[3].key, 5);
        assert_eq!(t.ents[2].key, 10);
        assert_eq!(t.FirstId(q), 1);
    }

    #[test]
    fn getitem_fixes_neighbors() {
        let mut t = QueTab::New();
        let q = t.NewQueue().unwrap();
        t.Enqueue(1, q).unwrap();
        t.Enqueue(2, q).unwrap();
        t.Enqueue(3, q).unwrap();
        t.GetItem(2);
        assert_eq!(t.Dequeue(q), 1);
        assert_eq!(t.Dequeue(q), 3);
        assert_eq!(t.Dequeue(q), EMPTY);
    }
}
