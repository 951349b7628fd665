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

//! Address resolution. The cache holds resolved and in-flight entries;
//! a blocked lookup parks on its thread inbox until the entry resolves or
//! its unresolved TTL runs out. Requests addressed to a local interface are
//! queued for the ARP daemon, which answers them in place.

use lazy_static::lazy_static;

use byteorder::BigEndian;
use byteorder::ByteOrder;

use super::super::kernel::clock::*;
use super::super::kernel::interrupt::*;
use super::super::kernel::mailbox::*;
use super::super::kernel::message::*;
use super::super::kernel::sched::*;
use super::super::kernel::thread::*;
use super::super::qlib::common::*;
use super::super::qlib::mutex::*;
use super::ether::*;
use super::netaddr::*;
use super::pkt::*;
use super::NetifState;
use super::NETIFTAB;

pub const ARP_NENTRY: usize = 32;
pub const ARP_NTHRWAIT: usize = 10;
pub const ARP_MAX_LOOKUP: usize = 2;
pub const ARP_NQUEUE: usize = 32;

// Entry TTLs, seconds.
pub const ARP_TTL_UNRESOLVED: u64 = 5;
pub const ARP_TTL_RESOLVED: u64 = 300;

pub const ARP_THR_PRIO: i32 = 50;

pub const ARP_OP_RQST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

pub const ARP_CONST_HDR_LEN: usize = 8;

// Notification delivered to waiters when their entry resolves.
pub const ARP_MSG_RESOLVED: i64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpState {
    Free,
    Used,
    Unresolved,
    Resolved,
}

#[derive(Clone)]
pub struct ArpEntry {
    pub state: ArpState,
    pub nif: i32,
    pub praddr: NetAddr,
    pub hwaddr: NetAddr,
    // Second count after which the entry is stale.
    pub expires: u64,
    pub waiting: Vec<i32>,
}

impl ArpEntry {
    fn New() -> Self {
        return Self {
            state: ArpState::Free,
            nif: -1,
            praddr: NetAddr::None(),
            hwaddr: NetAddr::None(),
            expires: 0,
            waiting: Vec::new(),
        };
    }
}

lazy_static! {
    pub static ref ARPTAB: QMutex<Vec<ArpEntry>> =
        QMutex::new((0..ARP_NENTRY).map(|_| ArpEntry::New()).collect());
    pub static ref ARPQUEUE: Mbid = MailboxAlloc(ARP_NQUEUE).expect("arp queue");
}

/// Initialize the cache and start the ARP daemon.
pub fn ArpInit() -> Result<()> {
    lazy_static::initialize(&ARPTAB);
    lazy_static::initialize(&ARPQUEUE);

    let tid = Create(ArpDaemon, 0, ARP_THR_PRIO, "arpDaemon")?;
    Ready(tid, RESCHED_NO, CORE_ZERO)?;
    return Ok(());
}

fn ArpDaemon() -> i32 {
    loop {
        let pktid = match MailboxReceive(*ARPQUEUE) {
            Ok(p) => p as PktId,
            Err(_) => continue,
        };
        trace!("arp: daemon received request");

        if let Err(e) = ArpSendReply(pktid) {
            trace!("arp: reply failed: {:?}", e);
        }
        let _ = NetFreebuf(pktid);
    }
}

/// Find a live cache entry for a protocol address, reclaiming expired
/// entries along the way.
fn ArpGetEntry(praddr: &NetAddr) -> Option<usize> {
    let now = ClkTime();
    let mut stale: Vec<(i32, i64)> = Vec::new();

    let found = {
        let mut tab = ARPTAB.lock();
        let mut found = None;
        for i in 0..ARP_NENTRY {
            if tab[i].state == ArpState::Free {
                continue;
            }
            if tab[i].expires < now {
                // Timed out; waiters learn the bad news below.
                if tab[i].state == ArpState::Unresolved {
                    for tid in tab[i].waiting.iter() {
                        stale.push((*tid, MSG_TIMEOUT));
                    }
                }
                tab[i] = ArpEntry::New();
                continue;
            }
            if tab[i].praddr == *praddr {
                found = Some(i);
                break;
            }
        }
        found
    };

    for (tid, msg) in stale {
        let _ = Send(tid, msg);
    }
    return found;
}

/// Allocate a cache entry, evicting the soonest-expiring one when the
/// table is full. Returns the index; the slot is left in state Used.
fn ArpAlloc() -> Result<usize> {
    let mut notify: Vec<(i32, i64)> = Vec::new();

    let idx = {
        let mut tab = ARPTAB.lock();
        let mut pick = None;
        let mut minexpires = u64::MAX;
        for i in 0..ARP_NENTRY {
            if tab[i].state == ArpState::Free {
                pick = Some(i);
                minexpires = 0;
                break;
            }
            if tab[i].expires < minexpires {
                minexpires = tab[i].expires;
                pick = Some(i);
            }
        }
        let i = match pick {
            None => return Err(Error::SysErr),
            Some(i) => i,
        };
        if tab[i].state == ArpState::Unresolved {
            for tid in tab[i].waiting.iter() {
                notify.push((*tid, MSG_TIMEOUT));
            }
        }
        tab[i] = ArpEntry::New();
        tab[i].state = ArpState::Used;
        i
    };

    for (tid, msg) in notify {
        let _ = Send(tid, msg);
    }
    return Ok(idx);
}

/// Free an entry outright. Waiters on an unresolved entry are woken with
/// the timeout notification.
pub fn ArpFree(idx: usize) -> Result<()> {
    if idx >= ARP_NENTRY {
        return Err(Error::SysErr);
    }

    let notify = {
        let mut tab = ARPTAB.lock();
        let notify = if tab[idx].state == ArpState::Unresolved {
            tab[idx].waiting.clone()
        } else {
            Vec::new()
        };
        tab[idx] = ArpEntry::New();
        notify
    };

    for tid in notify {
        let _ = Send(tid, MSG_TIMEOUT);
    }
    return Ok(());
}

/// Resolve a protocol address to a hardware address on an interface,
/// blocking on the wire exchange when the cache cannot answer.
pub fn ArpLookup(nifidx: usize, praddr: &NetAddr) -> Result<NetAddr> {
    if nifidx >= super::NNETIF || praddr.IsNone() {
        return Err(Error::SysErr);
    }

    let mut lookups = 0;
    while lookups < ARP_MAX_LOOKUP {
        lookups += 1;

        let im = Disable();
        let idx = match ArpGetEntry(praddr) {
            Some(i) => i,
            None => {
                let i = ArpAlloc()?;
                let mut tab = ARPTAB.lock();
                tab[i].state = ArpState::Unresolved;
                tab[i].nif = nifidx as i32;
                tab[i].praddr = *praddr;
                tab[i].expires = ClkTime() + ARP_TTL_UNRESOLVED;
                i
            }
        };

        let ttl = {
            let mut tab = ARPTAB.lock();
            if tab[idx].state == ArpState::Resolved {
                return Ok(tab[idx].hwaddr);
            }

            // Unresolved: queue ourselves on the entry before asking the
            // wire.
            let tid = GetTid();
            if tid == TID_BAD {
                return Err(Error::SysErr);
            }
            if tab[idx].waiting.len() >= ARP_NTHRWAIT {
                trace!("arp: waiter queue full");
                return Err(Error::SysErr);
            }
            tab[idx].waiting.push(tid);
            let remaining = tab[idx].expires.saturating_sub(ClkTime());
            (remaining * CLKTICKS_PER_SEC).max(1) as i32
        };
        drop(im);

        RecvClr();
        if let Err(e) = ArpSendRqst(idx) {
            ArpUnwait(idx);
            return Err(e);
        }

        match RecvTime(ttl) {
            Err(Error::Timeout) => {
                ArpUnwait(idx);
                return Err(Error::Timeout);
            }
            Err(e) => {
                ArpUnwait(idx);
                return Err(e);
            }
            Ok(MSG_TIMEOUT) => return Err(Error::Timeout),
            // Resolution notification; retry the cache.
            Ok(_) => continue,
        }
    }
    return Err(Error::SysErr);
}

// A lookup that gives up must leave the entry's waiter list, or a later
// reclaim would post its timeout to a recycled thread id.
fn ArpUnwait(idx: usize) {
    let tid = GetTid();
    let mut tab = ARPTAB.lock();
    if idx < ARP_NENTRY {
        tab[idx].waiting.retain(|w| *w != tid);
    }
}

/// Broadcast a request for an unresolved entry.
fn ArpSendRqst(idx: usize) -> Result<()> {
    let (nifidx, praddr) = {
        let tab = ARPTAB.lock();
        if tab[idx].state != ArpState::Unresolved {
            return Err(Error::SysErr);
        }
        (tab[idx].nif, tab[idx].praddr)
    };

    let (hwaddr, ip, hwbrc, state) = {
        let nif = NETIFTAB[nifidx as usize].lock();
        (nif.hwaddr, nif.ip, nif.hwbrc, nif.state)
    };
    if state != NetifState::Alloc {
        return Err(Error::SysErr);
    }

    let pktid = NetGetbuf()?;
    let r = WithPkt(pktid, |p| -> Result<()> {
        p.nif = nifidx;
        let len = ARP_CONST_HDR_LEN + 2 * ETH_ADDR_LEN + 2 * IPV4_ADDR_LEN;
        let hdr = p.Prepend(len)?;
        BigEndian::write_u16(&mut hdr[0..2], NETADDR_ETHERNET);
        BigEndian::write_u16(&mut hdr[2..4], NETADDR_IPV4);
        hdr[4] = ETH_ADDR_LEN as u8;
        hdr[5] = IPV4_ADDR_LEN as u8;
        BigEndian::write_u16(&mut hdr[6..8], ARP_OP_RQST);
        hdr[8..14].copy_from_slice(&hwaddr.addr[..ETH_ADDR_LEN]);
        hdr[14..18].copy_from_slice(&ip.addr[..IPV4_ADDR_LEN]);
        // Target hardware address stays zero in a request.
        hdr[24..28].copy_from_slice(&praddr.addr[..IPV4_ADDR_LEN]);
        return Ok(());
    })?;
    if let Err(e) = r {
        let _ = NetFreebuf(pktid);
        return Err(e);
    }

    trace!("arp: request for {}", praddr);
    let result = NetSend(pktid, Some(&hwbrc), None, ETHER_TYPE_ARP);
    NetFreebuf(pktid)?;
    return result;
}

/// Answer a queued request in place: swap the address quads and send the
/// packet back where it came from.
fn ArpSendReply(pktid: PktId) -> Result<()> {
    let nifidx = WithPkt(pktid, |p| p.nif)?;
    if nifidx < 0 {
        return Err(Error::SysErr);
    }
    let (hwaddr, ip) = {
        let nif = NETIFTAB[nifidx as usize].lock();
        (nif.hwaddr, nif.ip)
    };

    let dst = WithPkt(pktid, |p| -> Result<NetAddr> {
        let hdr = p.PayloadMut();
        if hdr.len() < ARP_CONST_HDR_LEN + 2 * ETH_ADDR_LEN + 2 * IPV4_ADDR_LEN {
            return Err(Error::SysErr);
        }
        BigEndian::write_u16(&mut hdr[6..8], ARP_OP_REPLY);

        // dha <- sha, dpa <- spa; then our own pair goes in as the source.
        let (sha, spa) = {
            let mut sha = [0u8; ETH_ADDR_LEN];
            sha.copy_from_slice(&hdr[8..14]);
            let mut spa = [0u8; IPV4_ADDR_LEN];
            spa.copy_from_slice(&hdr[14..18]);
            (sha, spa)
        };
        hdr[18..24].copy_from_slice(&sha);
        hdr[24..28].copy_from_slice(&spa);
        hdr[8..14].copy_from_slice(&hwaddr.addr[..ETH_ADDR_LEN]);
        hdr[14..18].copy_from_slice(&ip.addr[..IPV4_ADDR_LEN]);

        return Ok(NetAddr::Eth(sha));
    })??;

    trace!("arp: replying to {}", dst);
    return NetSend(pktid, Some(&dst), None, ETHER_TYPE_ARP);
}

/// Handle a received ARP packet: merge the sender's mapping into the
/// cache, and queue requests addressed to this interface for the daemon.
pub fn ArpRecv(pktid: PktId) -> Result<()> {
    let parsed = WithPkt(pktid, |p| -> Result<(i32, u16, NetAddr, NetAddr, NetAddr)> {
        let hdr = p.Payload();
        if hdr.len() < ARP_CONST_HDR_LEN + 2 * ETH_ADDR_LEN + 2 * IPV4_ADDR_LEN {
            return Err(Error::SysErr);
        }
        let hwtype = BigEndian::read_u16(&hdr[0..2]);
        let prtype = BigEndian::read_u16(&hdr[2..4]);
        if hwtype != NETADDR_ETHERNET
            || prtype != NETADDR_IPV4
            || hdr[4] as usize != ETH_ADDR_LEN
            || hdr[5] as usize != IPV4_ADDR_LEN
        {
            return Err(Error::SysErr);
        }
        let op = BigEndian::read_u16(&hdr[6..8]);
        let mut mac = [0u8; ETH_ADDR_LEN];
        mac.copy_from_slice(&hdr[8..14]);
        let sha = NetAddr::Eth(mac);
        let spa = NetAddr::FromIpv4Bytes(&hdr[14..18]);
        let dpa = NetAddr::FromIpv4Bytes(&hdr[24..28]);
        return Ok((p.nif, op, sha, spa, dpa));
    })?;

    let (nifidx, op, sha, spa, dpa) = match parsed {
        Ok(t) => t,
        Err(_) => {
            let _ = NetFreebuf(pktid);
            return Err(Error::SysErr);
        }
    };

    // Merge the sender's mapping and wake anyone waiting on it.
    let notify = {
        let mut tab = ARPTAB.lock();
        let mut notify = Vec::new();
        for i in 0..ARP_NENTRY {
            if tab[i].state == ArpState::Free {
                continue;
            }
            if tab[i].praddr == spa {
                tab[i].hwaddr = sha;
                tab[i].state = ArpState::Resolved;
                tab[i].expires = ClkTime() + ARP_TTL_RESOLVED;
                notify = core::mem::replace(&mut tab[i].waiting, Vec::new());
                break;
            }
        }
        notify
    };
    for tid in notify {
        let _ = Send(tid, ARP_MSG_RESOLVED);
    }

    let localip = {
        let nif = NETIFTAB[nifidx as usize].lock();
        nif.ip
    };
    if op == ARP_OP_RQST && dpa == localip {
        trace!("arp: queueing request from {}", spa);
        if MailboxSend(*ARPQUEUE, pktid as i64).is_err() {
            let _ = NetFreebuf(pktid);
            return Err(Error::SysErr);
        }
        return Ok(());
    }

    return NetFreebuf(pktid);
}
