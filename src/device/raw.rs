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

//! Raw IP sockets for protocols the stack does not otherwise terminate.
//! Each socket keys on a protocol number with optional local/remote
//! address bindings and holds a ring of whole received packets.

use lazy_static::lazy_static;

use super::super::kernel::interrupt::*;
use super::super::kernel::semaphore::*;
use super::super::net::ether::NetSend;
use super::super::net::icmp::*;
use super::super::net::ipv4::Ipv4Send;
use super::super::net::netaddr::*;
use super::super::net::pkt::*;
use super::super::net::route::RtLookup;
use super::super::qlib::common::*;
use super::super::qlib::mutex::*;
use super::DevDriver;
use super::OpenArgs;

pub const NRAW: usize = 3;
pub static RAW_NAMES: [&str; NRAW] = ["RAW0", "RAW1", "RAW2"];

pub const RAW_IBLEN: usize = 32;

pub const RAW_CTRL_SETFLAG: i32 = 1;
pub const RAW_CTRL_CLRFLAG: i32 = 2;

bitflags::bitflags! {
    pub struct RawFlags: u32 {
        // Caller supplies (and receives) the network-layer header.
        const OHDR = 0x01;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawState {
    Free,
    Alloc,
}

pub struct Raw {
    pub state: RawState,
    pub localip: NetAddr,
    pub remoteip: NetAddr,
    pub proto: u8,
    pub inring: Vec<PktId>,
    pub insrc: Vec<NetAddr>,
    pub istart: usize,
    pub icount: usize,
    pub isema: Sid,
    pub flags: RawFlags,
}

lazy_static! {
    pub static ref RAWTAB: Vec<QMutex<Raw>> = (0..NRAW)
        .map(|_| {
            QMutex::new(Raw {
                state: RawState::Free,
                localip: NetAddr::None(),
                remoteip: NetAddr::None(),
                proto: 0,
                inring: vec![0; RAW_IBLEN],
                insrc: vec![NetAddr::None(); RAW_IBLEN],
                istart: 0,
                icount: 0,
                isema: -1,
                flags: RawFlags::empty(),
            })
        })
        .collect();
}

pub struct RawDriver;

pub static RAW_DRIVER: RawDriver = RawDriver;

impl DevDriver for RawDriver {
    fn Init(&self, minor: usize) -> Result<()> {
        let mut r = RAWTAB[minor].lock();
        r.state = RawState::Free;
        return Ok(());
    }

    fn Open(&self, minor: usize, args: &OpenArgs) -> Result<()> {
        let (localip, remoteip, proto) = match args {
            OpenArgs::Raw {
                localip,
                remoteip,
                proto,
            } => (*localip, *remoteip, *proto),
            _ => return Err(Error::SysErr),
        };

        let _im = Disable();
        {
            let r = RAWTAB[minor].lock();
            if r.state != RawState::Free {
                return Err(Error::SysErr);
            }
        }

        let isema = SemCreate(0)?;

        let mut r = RAWTAB[minor].lock();
        r.proto = proto;
        r.localip = localip.unwrap_or_else(NetAddr::None);
        r.remoteip = remoteip.unwrap_or_else(NetAddr::None);
        r.istart = 0;
        r.icount = 0;
        r.isema = isema;
        r.flags = RawFlags::empty();
        r.state = RawState::Alloc;
        return Ok(());
    }

    fn Close(&self, minor: usize) -> Result<()> {
        let _im = Disable();
        let (isema, pkts) = {
            let mut r = RAWTAB[minor].lock();
            if r.state != RawState::Alloc {
                return Err(Error::SysErr);
            }
            let mut pkts = Vec::new();
            while r.icount > 0 {
                pkts.push(r.inring[r.istart]);
                r.istart = (r.istart + 1) % RAW_IBLEN;
                r.icount -= 1;
            }
            r.state = RawState::Free;
            (r.isema, pkts)
        };

        for p in pkts {
            let _ = NetFreebuf(p);
        }
        let _ = SemFree(isema);
        return Ok(());
    }

    /// Read the next packet's transport payload.
    fn Read(&self, minor: usize, buf: &mut [u8]) -> Result<usize> {
        let _im = Disable();
        let isema = {
            let r = RAWTAB[minor].lock();
            if r.state != RawState::Alloc {
                return Err(Error::SysErr);
            }
            r.isema
        };

        Wait(isema)?;

        let pktid = {
            let mut r = RAWTAB[minor].lock();
            if r.state != RawState::Alloc {
                return Err(Error::SysErr);
            }
            let pktid = r.inring[r.istart];
            r.istart = (r.istart + 1) % RAW_IBLEN;
            r.icount -= 1;
            pktid
        };

        let n = WithPkt(pktid, |p| {
            let data = p.Payload();
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            n
        })?;
        NetFreebuf(pktid)?;
        return Ok(n);
    }

    fn Write(&self, minor: usize, buf: &[u8]) -> Result<usize> {
        RawSend(minor, buf)?;
        return Ok(buf.len());
    }

    fn Control(&self, minor: usize, func: i32, arg1: i64, _arg2: i64) -> Result<i64> {
        let mut r = RAWTAB[minor].lock();
        if r.state != RawState::Alloc {
            return Err(Error::SysErr);
        }

        match func {
            RAW_CTRL_SETFLAG => {
                let old = r.flags.bits() & arg1 as u32;
                r.flags |= RawFlags::from_bits_truncate(arg1 as u32);
                return Ok(old as i64);
            }
            RAW_CTRL_CLRFLAG => {
                let old = r.flags.bits() & arg1 as u32;
                r.flags &= !RawFlags::from_bits_truncate(arg1 as u32);
                return Ok(old as i64);
            }
            _ => {
                return Err(Error::SysErr);
            }
        }
    }
}

/// Match a socket for an incoming packet: the protocol must agree, bound
/// addresses must agree, and more bound addresses beat fewer.
pub fn RawDemux(src: &NetAddr, dst: &NetAddr, proto: u8) -> Option<usize> {
    let mut best = None;
    let mut bestscore = -1i32;

    for i in 0..NRAW {
        let r = RAWTAB[i].lock();
        if r.state != RawState::Alloc || r.proto != proto {
            continue;
        }
        if !r.localip.IsNone() && r.localip != *dst {
            continue;
        }
        if !r.remoteip.IsNone() && r.remoteip != *src {
            continue;
        }
        let score = (!r.localip.IsNone()) as i32 + (!r.remoteip.IsNone()) as i32;
        if score > bestscore {
            best = Some(i);
            bestscore = score;
        }
    }
    return best;
}

/// Deliver an incoming non-UDP datagram to a raw socket, or bounce it
/// with port-unreachable. Takes ownership of the packet.
pub fn RawRecv(pktid: PktId, src: &NetAddr, dst: &NetAddr, proto: u8) -> Result<()> {
    let minor = match RawDemux(src, dst, proto) {
        None => {
            trace!("raw: no socket for proto {}", proto);
            let _ = IcmpDestUnreach(pktid, ICMP_PORT_UNR);
            let _ = NetFreebuf(pktid);
            return Ok(());
        }
        Some(m) => m,
    };

    let _im = Disable();
    let isema = {
        let mut r = RAWTAB[minor].lock();
        if r.state != RawState::Alloc {
            let _ = NetFreebuf(pktid);
            return Err(Error::SysErr);
        }
        if r.icount >= RAW_IBLEN {
            drop(r);
            let _ = NetFreebuf(pktid);
            return Err(Error::SysErr);
        }
        let slot = (r.istart + r.icount) % RAW_IBLEN;
        r.inring[slot] = pktid;
        r.insrc[slot] = *src;
        r.icount += 1;
        r.isema
    };

    Signal(isema)?;
    return Ok(());
}

/// Send through a raw socket. With OHDR the buffer already carries the
/// network header and goes straight to the link; otherwise IPv4 frames
/// it. The packet buffer is freed either way, and the return reflects the
/// last error.
pub fn RawSend(minor: usize, buf: &[u8]) -> Result<()> {
    let (state, flags, localip, remoteip, proto) = {
        let r = RAWTAB[minor].lock();
        (r.state, r.flags, r.localip, r.remoteip, r.proto)
    };
    if state != RawState::Alloc || buf.is_empty() {
        return Err(Error::SysErr);
    }

    if flags.contains(RawFlags::OHDR) {
        if localip.IsNone() || remoteip.IsNone() {
            trace!("raw: under-specified socket");
            return Err(Error::SysErr);
        }
    } else {
        if proto == 0 || remoteip.IsNone() {
            trace!("raw: under-specified socket");
            return Err(Error::SysErr);
        }
    }

    let pktid = NetGetbuf()?;
    let r = WithPkt(pktid, |p| -> Result<()> {
        let data = p.Prepend(buf.len())?;
        data.copy_from_slice(buf);
        return Ok(());
    })?;
    if let Err(e) = r {
        let _ = NetFreebuf(pktid);
        return Err(e);
    }

    let result;
    if flags.contains(RawFlags::OHDR) {
        let route = match RtLookup(&remoteip) {
            None => {
                trace!("raw: no route");
                let _ = NetFreebuf(pktid);
                return Err(Error::SysErr);
            }
            Some(rt) => rt,
        };
        WithPkt(pktid, |p| {
            p.nethdr = p.curr;
            p.nif = route.nif;
        })?;
        result = NetSend(pktid, None, Some(&remoteip), remoteip.typ);
    } else {
        result = Ipv4Send(pktid, &localip, &remoteip, proto);
    }

    NetFreebuf(pktid)?;
    return result;
}
