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

//! The routing table and forwarding daemon. Destinations are stored
//! already masked so a lookup only masks the query; among matches the
//! longest mask wins, with the default route at mask length zero.

use lazy_static::lazy_static;

use byteorder::BigEndian;
use byteorder::ByteOrder;

use super::super::kernel::mailbox::*;
use super::super::kernel::sched::*;
use super::super::kernel::thread::CORE_ZERO;
use super::super::qlib::common::*;
use super::super::qlib::mutex::*;
use super::icmp::*;
use super::ipv4::*;
use super::netaddr::*;
use super::pkt::*;
use super::NetChksum;

pub const RT_NENTRY: usize = 16;
pub const RT_NQUEUE: usize = 32;
pub const RT_THR_PRIO: i32 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtState {
    Free,
    Pend,
    Used,
}

#[derive(Clone, Copy, Debug)]
pub struct RtEntry {
    pub state: RtState,
    // Stored masked, so lookups compare already-masked values.
    pub dst: NetAddr,
    // Type NONE when the destination is directly attached.
    pub gateway: NetAddr,
    pub mask: NetAddr,
    pub masklen: u16,
    pub nif: i32,
}

impl RtEntry {
    fn New() -> Self {
        return Self {
            state: RtState::Free,
            dst: NetAddr::None(),
            gateway: NetAddr::None(),
            mask: NetAddr::None(),
            masklen: 0,
            nif: -1,
        };
    }
}

lazy_static! {
    pub static ref RTTAB: QMutex<Vec<RtEntry>> =
        QMutex::new((0..RT_NENTRY).map(|_| RtEntry::New()).collect());
    pub static ref RTQUEUE: Mbid = MailboxAlloc(RT_NQUEUE).expect("route queue");
}

/// Initialize the table and start the routing daemon.
pub fn RtInit() -> Result<()> {
    lazy_static::initialize(&RTTAB);
    lazy_static::initialize(&RTQUEUE);

    let tid = Create(RtDaemon, 0, RT_THR_PRIO, "rtDaemon")?;
    Ready(tid, RESCHED_NO, CORE_ZERO)?;
    return Ok(());
}

fn RtAlloc(tab: &mut Vec<RtEntry>) -> Option<usize> {
    for i in 0..RT_NENTRY {
        if tab[i].state == RtState::Free {
            tab[i].state = RtState::Pend;
            return Some(i);
        }
    }
    return None;
}

/// Add a route. The destination is masked before it is stored.
pub fn RtAdd(dst: &NetAddr, gateway: Option<&NetAddr>, mask: &NetAddr, nif: usize) -> Result<()> {
    if dst.IsNone() || mask.IsNone() || nif >= super::NNETIF {
        return Err(Error::SysErr);
    }

    let mut tab = RTTAB.lock();
    let i = match RtAlloc(&mut tab) {
        None => return Err(Error::SysErr),
        Some(i) => i,
    };

    tab[i].dst = dst.Masked(mask);
    tab[i].gateway = match gateway {
        None => NetAddr::None(),
        Some(g) => *g,
    };
    tab[i].mask = *mask;
    tab[i].masklen = mask.MaskLen();
    tab[i].nif = nif as i32;
    tab[i].state = RtState::Used;

    debug!("route: add {}/{} via nif {}", tab[i].dst, tab[i].masklen, nif);
    return Ok(());
}

/// Install the all-zero default route; a no-op when one already exists.
pub fn RtDefault(gateway: &NetAddr, nif: usize) -> Result<()> {
    if gateway.IsNone() || nif >= super::NNETIF {
        return Err(Error::SysErr);
    }

    let mask = NetAddr::Ipv4(0, 0, 0, 0);

    let mut tab = RTTAB.lock();
    for i in 0..RT_NENTRY {
        if tab[i].state == RtState::Used && tab[i].mask == mask {
            return Ok(());
        }
    }

    let i = match RtAlloc(&mut tab) {
        None => return Err(Error::SysErr),
        Some(i) => i,
    };
    tab[i].dst = NetAddr::Ipv4(0, 0, 0, 0);
    tab[i].gateway = *gateway;
    tab[i].mask = mask;
    tab[i].masklen = 0;
    tab[i].nif = nif as i32;
    tab[i].state = RtState::Used;
    return Ok(());
}

/// Remove every route to a destination.
pub fn RtRemove(dst: &NetAddr) -> Result<()> {
    if dst.IsNone() {
        return Err(Error::SysErr);
    }
    let mut tab = RTTAB.lock();
    for i in 0..RT_NENTRY {
        if tab[i].state == RtState::Used && tab[i].dst == *dst {
            tab[i] = RtEntry::New();
        }
    }
    return Ok(());
}

/// Drop every route.
pub fn RtClear() {
    let mut tab = RTTAB.lock();
    for i in 0..RT_NENTRY {
        tab[i] = RtEntry::New();
    }
}

/// Longest-prefix-match lookup.
pub fn RtLookup(addr: &NetAddr) -> Option<RtEntry> {
    let tab = RTTAB.lock();
    let mut best: Option<RtEntry> = None;
    for i in 0..RT_NENTRY {
        if tab[i].state != RtState::Used {
            continue;
        }
        if addr.Masked(&tab[i].mask) == tab[i].dst {
            match best {
                Some(b) if b.masklen >= tab[i].masklen => (),
                _ => best = Some(tab[i]),
            }
        }
    }
    return best;
}

/// Queue a packet that needs forwarding; drops when the queue is full.
pub fn RtRecv(pktid: PktId) -> Result<()> {
    if MailboxCount(*RTQUEUE)? >= RT_NQUEUE {
        trace!("route: queue full, dropping");
        super::CountDropped();
        let _ = NetFreebuf(pktid);
        return Ok(());
    }

    if MailboxSend(*RTQUEUE, pktid as i64).is_err() {
        let _ = NetFreebuf(pktid);
        return Err(Error::SysErr);
    }
    return Ok(());
}

fn RtDaemon() -> i32 {
    loop {
        let pktid = match MailboxReceive(*RTQUEUE) {
            Ok(p) => p as PktId,
            Err(_) => continue,
        };
        let _ = RtSend(pktid);
        let _ = NetFreebuf(pktid);
    }
}

/// Forward one packet: decrement the TTL, fix the checksum, pick the next
/// hop and push it back out. Emits the diagnostic ICMP traffic the path
/// calls for.
pub fn RtSend(pktid: PktId) -> Result<()> {
    let (dst, innif) = WithPkt(pktid, |p| {
        let ip = p.NetHdr();
        (NetAddr::FromIpv4Bytes(&ip[16..20]), p.nif)
    })?;

    let route = match RtLookup(&dst) {
        None => {
            trace!("route: network unreachable for {}", dst);
            let _ = IcmpDestUnreach(pktid, ICMP_NET_UNR);
            return Err(Error::SysErr);
        }
        Some(r) => r,
    };

    // Exiting the interface the packet came in on means the sender had a
    // better first hop; tell it so, but forward anyway.
    if route.nif == innif {
        if route.gateway.IsNone() {
            let _ = IcmpRedirect(pktid, ICMP_RHST, &route);
        } else {
            let _ = IcmpRedirect(pktid, ICMP_RNET, &route);
        }
    }

    let ttl = WithPkt(pktid, |p| {
        let ip = p.NetHdrMut();
        ip[8] = ip[8].wrapping_sub(1);
        ip[8]
    })?;
    if ttl == 0 {
        let _ = IcmpTimeExceeded(pktid, ICMP_TTL_EXC);
        return Err(Error::SysErr);
    }

    WithPkt(pktid, |p| {
        let ip = p.NetHdrMut();
        BigEndian::write_u16(&mut ip[10..12], 0);
        let sum = NetChksum(&ip[..IPV4_HDR_LEN]);
        BigEndian::write_u16(&mut ip[10..12], sum);
        p.nif = route.nif;
    })?;

    let nxthop = if route.gateway.IsNone() {
        dst
    } else {
        route.gateway
    };

    if Ipv4SendFrag(pktid, &nxthop).is_err() {
        trace!("route: host unreachable for {}", dst);
        let _ = IcmpDestUnreach(pktid, ICMP_HST_UNR);
        return Err(Error::SysErr);
    }
    return Ok(());
}
