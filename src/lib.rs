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

#![allow(non_snake_case)]
#![allow(dead_code)]

#[macro_use]
extern crate log;

#[macro_use]
extern crate scopeguard;

#[macro_use]
extern crate serde_derive;

pub mod qlib;
pub mod kernel;
pub mod mem;
pub mod device;
pub mod net;

pub use self::qlib::common::*;
