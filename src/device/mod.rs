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

//! The device switch. A fixed table maps descriptors to driver function
//! slots plus a per-driver minor index; the public calls bounds-check the
//! descriptor and indirect through the table. Unprovided slots inherit the
//! error defaults, which is how `Seek` reports "not supported" on every
//! shipped driver.

pub mod loopback;
pub mod ethloop;
pub mod udp;
pub mod raw;

use lazy_static::lazy_static;

use super::net::netaddr::NetAddr;
use super::qlib::common::*;

pub type DevId = usize;

pub const LOOP0: DevId = 0;
pub const ELOOP0: DevId = 1;
pub const ELOOP1: DevId = 2;
pub const UDP0: DevId = 3;
pub const RAW0: DevId = UDP0 + udp::NUDP;
pub const NDEV: usize = RAW0 + raw::NRAW;

/// Typed stand-in for the variadic open arguments of the classic device
/// switch.
#[derive(Clone, Copy, Debug)]
pub enum OpenArgs {
    None,
    Udp {
        localpt: u16,
        remotept: u16,
        localip: Option<NetAddr>,
        remoteip: Option<NetAddr>,
    },
    Raw {
        localip: Option<NetAddr>,
        remoteip: Option<NetAddr>,
        proto: u8,
    },
}

pub trait DevDriver: Send + Sync {
    fn Init(&self, _minor: usize) -> Result<()> {
        return Ok(());
    }

    fn Open(&self, _minor: usize, _args: &OpenArgs) -> Result<()> {
        return Err(Error::SysErr);
    }

    fn Close(&self, _minor: usize) -> Result<()> {
        return Err(Error::SysErr);
    }

    fn Read(&self, _minor: usize, _buf: &mut [u8]) -> Result<usize> {
        return Err(Error::SysErr);
    }

    fn Write(&self, _minor: usize, _buf: &[u8]) -> Result<usize> {
        return Err(Error::SysErr);
    }

    fn Getc(&self, _minor: usize) -> Result<u8> {
        return Err(Error::SysErr);
    }

    fn Putc(&self, _minor: usize, _c: u8) -> Result<()> {
        return Err(Error::SysErr);
    }

    fn Seek(&self, _minor: usize, _pos: usize) -> Result<()> {
        return Err(Error::SysErr);
    }

    fn Control(&self, _minor: usize, _func: i32, _arg1: i64, _arg2: i64) -> Result<i64> {
        return Err(Error::SysErr);
    }
}

pub struct DevEnt {
    pub name: &'static str,
    pub minor: usize,
    pub driver: &'static (dyn DevDriver),
}

lazy_static! {
    pub static ref DEVTAB: Vec<DevEnt> = {
        let mut tab: Vec<DevEnt> = Vec::new();
        tab.push(DevEnt {
            name: "LOOP0",
            minor: 0,
            driver: &loopback::LOOPBACK_DRIVER,
        });
        tab.push(DevEnt {
            name: "ELOOP0",
            minor: 0,
            driver: &ethloop::ETHLOOP_DRIVER,
        });
        tab.push(DevEnt {
            name: "ELOOP1",
            minor: 1,
            driver: &ethloop::ETHLOOP_DRIVER,
        });
        for i in 0..udp::NUDP {
            tab.push(DevEnt {
                name: udp::UDP_NAMES[i],
                minor: i,
                driver: &udp::UDP_DRIVER,
            });
        }
        for i in 0..raw::NRAW {
            tab.push(DevEnt {
                name: raw::RAW_NAMES[i],
                minor: i,
                driver: &raw::RAW_DRIVER,
            });
        }
        tab
    };
}

fn IsBadDev(descrp: DevId) -> bool {
    return descrp >= DEVTAB.len();
}

/// Run every driver's one-time init against its minor table.
pub fn DevInitAll() {
    for d in DEVTAB.iter() {
        if let Err(e) = d.driver.Init(d.minor) {
            error!("device init {}: {:?}", d.name, e);
        }
    }
}

/// Look a device up by name.
pub fn GetDev(name: &str) -> Result<DevId> {
    for (i, d) in DEVTAB.iter().enumerate() {
        if d.name == name {
            return Ok(i);
        }
    }
    return Err(Error::SysErr);
}

pub fn Open(descrp: DevId, args: &OpenArgs) -> Result<()> {
    if IsBadDev(descrp) {
        return Err(Error::SysErr);
    }
    let d = &DEVTAB[descrp];
    return d.driver.Open(d.minor, args);
}

pub fn Close(descrp: DevId) -> Result<()> {
    if IsBadDev(descrp) {
        return Err(Error::SysErr);
    }
    let d = &DEVTAB[descrp];
    return d.driver.Close(d.minor);
}

pub fn Read(descrp: DevId, buf: &mut [u8]) -> Result<usize> {
    if IsBadDev(descrp) {
        return Err(Error::SysErr);
    }
    let d = &DEVTAB[descrp];
    return d.driver.Read(d.minor, buf);
}

pub fn Write(descrp: DevId, buf: &[u8]) -> Result<usize> {
    if IsBadDev(descrp) {
        return Err(Error::SysErr);
    }
    let d = &DEVTAB[descrp];
    return d.driver.Write(d.minor, buf);
}

pub fn Getc(descrp: DevId) -> Result<u8> {
    if IsBadDev(descrp) {
        return Err(Error::SysErr);
    }
    let d = &DEVTAB[descrp];
    return d.driver.Getc(d.minor);
}

pub fn Putc(descrp: DevId, c: u8) -> Result<()> {
    if IsBadDev(descrp) {
        return Err(Error::SysErr);
    }
    let d = &DEVTAB[descrp];
    return d.driver.Putc(d.minor, c);
}

pub fn Seek(descrp: DevId, pos: usize) -> Result<()> {
    if IsBadDev(descrp) {
        return Err(Error::SysErr);
    }
    let d = &DEVTAB[descrp];
    return d.driver.Seek(d.minor, pos);
}

pub fn Control(descrp: DevId, func: i32, arg1: i64, arg2: i64) -> Result<i64> {
    if IsBadDev(descrp) {
        return Err(Error::SysErr);
    }
    let d = &DEVTAB[descrp];
    return d.driver.Control(d.minor, func, arg1, arg2);
}
