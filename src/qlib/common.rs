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

// The kernel does not unwind across its entry points. Every operation
// reports through these three outcomes, matching the classic OK / SYSERR /
// TIMEOUT / EOF sentinels of the table-driven kernels this one descends
// from. SysErr covers invalid handles, exhausted tables and contract
// violations alike; the caller can only ever retry or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    SysErr,
    Timeout,
    Eof,
}

pub type Result<T> = core::result::Result<T, Error>;

// Message sentinel delivered to waiters whose resource vanished before the
// real answer arrived, e.g. an address-resolution entry that was reclaimed.
pub const MSG_TIMEOUT: i64 = -2;

pub const TID_BAD: i32 = -1;
