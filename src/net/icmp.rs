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

//! ICMP: an echo-reply daemon, error message emission per RFC 792, and
//! per-thread echo-reply queues so concurrent pingers each collect their
//! own responses. Echo ids double as thread ids; the reply packet's pool
//! slot travels to the pinger through its message inbox.

use lazy_static::lazy_static;

use byteorder::BigEndian;
use byteorder::ByteOrder;

use super::super::kernel::clock::*;
use super::super::kernel::mailbox::*;
use super::super::kernel::message::Send;
use super::super::kernel::sched::*;
use super::super::kernel::thread::*;
use super::super::qlib::common::*;
use super::super::qlib::mutex::*;
use super::ipv4::*;
use super::netaddr::*;
use super::pkt::*;
use super::route::RtEntry;

pub const ICMP_NQUEUE: usize = 32;
pub const ICMP_THR_PRIO: i32 = 50;

pub const NPINGQUEUE: usize = 4;
pub const NPINGHOLD: usize = 10;

pub const ICMP_HEADER_LEN: usize = 4;
// Quoted bytes of the offending datagram beyond its IP header.
pub const ICMP_DEF_DATALEN: usize = 8;

pub const ICMP_ECHOREPLY: u8 = 0;
pub const ICMP_UNREACH: u8 = 3;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIMEEXCD: u8 = 11;

pub const ICMP_NET_UNR: u8 = 0;
pub const ICMP_HST_UNR: u8 = 1;
pub const ICMP_PORT_UNR: u8 = 3;

pub const ICMP_RNET: u8 = 0;
pub const ICMP_RHST: u8 = 1;

pub const ICMP_TTL_EXC: u8 = 0;

pub const ICMP_ECHO_LEN: usize = 28;

pub struct IcmpEchoQueue {
    pub tid: i32,
    pub head: usize,
    pub tail: usize,
    pub pkts: Vec<Option<PktId>>,
}

impl IcmpEchoQueue {
    fn New() -> Self {
        return Self {
            tid: TID_BAD,
            head: 0,
            tail: 0,
            pkts: (0..NPINGHOLD).map(|_| None).collect(),
        };
    }
}

lazy_static! {
    pub static ref ECHOTAB: QMutex<Vec<IcmpEchoQueue>> =
        QMutex::new((0..NPINGQUEUE).map(|_| IcmpEchoQueue::New()).collect());
    pub static ref ICMPQUEUE: Mbid = MailboxAlloc(ICMP_NQUEUE).expect("icmp queue");
}

/// Start the echo daemon.
pub fn IcmpInit() -> Result<()> {
    lazy_static::initialize(&ECHOTAB);
    lazy_static::initialize(&ICMPQUEUE);

    let tid = Create(IcmpDaemon, 0, ICMP_THR_PRIO, "icmpDaemon")?;
    Ready(tid, RESCHED_NO, CORE_ZERO)?;
    return Ok(());
}

fn IcmpDaemon() -> i32 {
    loop {
        let pktid = match MailboxReceive(*ICMPQUEUE) {
            Ok(p) => p as PktId,
            Err(_) => continue,
        };
        trace!("icmp: daemon answering echo request");
        if let Err(e) = IcmpEchoReply(pktid) {
            trace!("icmp: echo reply failed: {:?}", e);
        }
        let _ = NetFreebuf(pktid);
    }
}

/// Claim an echo-reply queue for the calling thread before pinging.
pub fn EchoQueueAlloc(tid: i32) -> Result<()> {
    let mut tab = ECHOTAB.lock();
    for q in tab.iter() {
        if q.tid == tid {
            return Err(Error::SysErr);
        }
    }
    for q in tab.iter_mut() {
        if q.tid == TID_BAD {
            q.tid = tid;
            q.head = 0;
            q.tail = 0;
            return Ok(());
        }
    }
    return Err(Error::SysErr);
}

/// Release a thread's echo-reply queue, discarding undrained replies.
pub fn EchoQueueFree(tid: i32) -> Result<()> {
    let drained = {
        let mut tab = ECHOTAB.lock();
        let mut drained = Vec::new();
        let mut found = false;
        for q in tab.iter_mut() {
            if q.tid != tid {
                continue;
            }
            found = true;
            while q.tail != q.head {
                if let Some(p) = q.pkts[q.tail].take() {
                    drained.push(p);
                }
                q.tail = (q.tail + 1) % NPINGHOLD;
            }
            q.tid = TID_BAD;
        }
        if !found {
            return Err(Error::SysErr);
        }
        drained
    };

    for p in drained {
        let _ = NetFreebuf(p);
    }
    return Ok(());
}

/// Take the oldest queued reply for a pinging thread.
pub fn EchoQueuePop(tid: i32) -> Option<PktId> {
    let mut tab = ECHOTAB.lock();
    for q in tab.iter_mut() {
        if q.tid != tid {
            continue;
        }
        if q.tail == q.head {
            return None;
        }
        let p = q.pkts[q.tail].take();
        q.tail = (q.tail + 1) % NPINGHOLD;
        return p;
    }
    return None;
}

/// Dispatch a received ICMP message. Takes ownership of the packet; echo
/// replies are parked on the matching pinger's queue, echo requests go to
/// the daemon, everything else is traced and dropped.
pub fn IcmpRecv(pktid: PktId) -> Result<()> {
    let typ = WithPkt(pktid, |p| {
        let d = p.Payload();
        if d.len() < ICMP_HEADER_LEN {
            return None;
        }
        return Some(d[0]);
    })?;
    let typ = match typ {
        None => {
            let _ = NetFreebuf(pktid);
            return Err(Error::SysErr);
        }
        Some(t) => t,
    };

    match typ {
        ICMP_ECHOREPLY => {
            let id = WithPkt(pktid, |p| {
                let d = p.PayloadMut();
                if d.len() < ICMP_ECHO_LEN + ICMP_HEADER_LEN {
                    return TID_BAD as i64;
                }
                // Stamp the arrival time into the payload.
                BigEndian::write_u32(&mut d[20..24], (ClkCount() & 0xffff_ffff) as u32);
                BigEndian::write_u32(&mut d[24..28], ClkTicks() as u32);
                BigEndian::write_u32(&mut d[28..32], ClkTime() as u32);
                return BigEndian::read_u16(&d[4..6]) as i64;
            })?;

            if id >= 0 && (id as usize) < NTHREAD {
                let queued = {
                    let mut tab = ECHOTAB.lock();
                    let mut queued = false;
                    for q in tab.iter_mut() {
                        if q.tid != id as i32 {
                            continue;
                        }
                        if (q.head + 1) % NPINGHOLD == q.tail {
                            trace!("icmp: echo queue full, discarding");
                            break;
                        }
                        q.pkts[q.head] = Some(pktid);
                        q.head = (q.head + 1) % NPINGHOLD;
                        queued = true;
                        break;
                    }
                    queued
                };
                if queued {
                    let _ = Send(id as i32, pktid as i64);
                    return Ok(());
                }
            }
            trace!("icmp: reply id {} matches no ping queue", id);
            let _ = NetFreebuf(pktid);
            return Err(Error::SysErr);
        }
        ICMP_ECHO => {
            trace!("icmp: echo request queued for daemon");
            if MailboxSend(*ICMPQUEUE, pktid as i64).is_err() {
                let _ = NetFreebuf(pktid);
                return Err(Error::SysErr);
            }
            return Ok(());
        }
        _ => {
            trace!("icmp: type {} not handled", typ);
            let _ = NetFreebuf(pktid);
            return Ok(());
        }
    }
}

/// Answer an echo request by reusing its buffer: swap the addresses, flip
/// the type, recompute the checksum. The caller keeps ownership.
pub fn IcmpEchoReply(pktid: PktId) -> Result<()> {
    let (src, dst) = WithPkt(pktid, |p| {
        let ip = p.NetHdr();
        (
            NetAddr::FromIpv4Bytes(&ip[12..16]),
            NetAddr::FromIpv4Bytes(&ip[16..20]),
        )
    })?;

    let datalen = WithPkt(pktid, |p| -> Result<usize> {
        p.Pull(ICMP_HEADER_LEN)?;
        return Ok(p.len);
    })??;

    // Reply flows back to the requester: source and destination reverse.
    return IcmpSend(pktid, ICMP_ECHOREPLY, 0, datalen, &dst, &src);
}

/// Send an echo request carrying origination timestamps in its payload.
pub fn IcmpEchoRequest(dst: &NetAddr, id: u16, seq: u16) -> Result<()> {
    let pktid = NetGetbuf()?;

    let r = WithPkt(pktid, |p| -> Result<()> {
        let echo = p.Prepend(ICMP_ECHO_LEN)?;
        BigEndian::write_u16(&mut echo[0..2], id);
        BigEndian::write_u16(&mut echo[2..4], seq);
        BigEndian::write_u32(&mut echo[4..8], (ClkCount() & 0xffff_ffff) as u32);
        BigEndian::write_u32(&mut echo[8..12], ClkTicks() as u32);
        BigEndian::write_u32(&mut echo[12..16], ClkTime() as u32);
        for b in echo[16..28].iter_mut() {
            *b = 0;
        }
        return Ok(());
    })?;
    if let Err(e) = r {
        let _ = NetFreebuf(pktid);
        return Err(e);
    }

    trace!("icmp: echo request id {} seq {}", id, seq);
    let result = IcmpSend(pktid, ICMP_ECHO, 0, ICMP_ECHO_LEN, &NetAddr::None(), dst);
    NetFreebuf(pktid)?;
    return result;
}

/// Prepend the ICMP header, checksum the message and hand it to IPv4.
pub fn IcmpSend(
    pktid: PktId,
    typ: u8,
    code: u8,
    datalen: usize,
    src: &NetAddr,
    dst: &NetAddr,
) -> Result<()> {
    let r = WithPkt(pktid, |p| -> Result<()> {
        let hdr = p.Prepend(ICMP_HEADER_LEN)?;
        hdr[0] = typ;
        hdr[1] = code;
        BigEndian::write_u16(&mut hdr[2..4], 0);
        let want = datalen + ICMP_HEADER_LEN;
        let msg = &p.Payload()[..want.min(p.len)];
        let sum = super::NetChksum(msg);
        let hdr = p.PayloadMut();
        BigEndian::write_u16(&mut hdr[2..4], sum);
        return Ok(());
    })?;
    r?;

    trace!("icmp: sending type {} code {}", typ, code);
    return Ipv4Send(pktid, src, dst, IPV4_PROTO_ICMP);
}

fn IcmpQuote(offender: PktId, firstword: &[u8; 4], typ: u8, code: u8) -> Result<()> {
    let pktid = NetGetbuf()?;

    let quoted = WithPkt(offender, |p| {
        let ip = p.NetHdr();
        let ihl = (ip[0] & 0x0f) as usize * 4;
        let n = (ihl + ICMP_DEF_DATALEN).min(ip.len());
        let mut v = Vec::with_capacity(n + 4);
        v.extend_from_slice(firstword);
        v.extend_from_slice(&ip[..n]);
        (v, NetAddr::FromIpv4Bytes(&ip[12..16]))
    })?;
    let (body, dst) = quoted;

    let r = WithPkt(pktid, |p| -> Result<()> {
        let buf = p.Prepend(body.len())?;
        buf.copy_from_slice(&body);
        return Ok(());
    })?;
    if let Err(e) = r {
        let _ = NetFreebuf(pktid);
        return Err(e);
    }

    let result = IcmpSend(pktid, typ, code, body.len(), &NetAddr::None(), &dst);
    NetFreebuf(pktid)?;
    return result;
}

/// Tell the source of an undeliverable datagram why, quoting its IP
/// header and first payload bytes per RFC 792.
pub fn IcmpDestUnreach(offender: PktId, code: u8) -> Result<()> {
    trace!("icmp: destination unreachable ({})", code);
    return IcmpQuote(offender, &[0, 0, 0, 0], ICMP_UNREACH, code);
}

/// Point the source at a better first hop; the unused word carries the
/// gateway address.
pub fn IcmpRedirect(offender: PktId, code: u8, route: &RtEntry) -> Result<()> {
    trace!("icmp: redirect ({})", code);
    let mut gw = [0u8; 4];
    gw.copy_from_slice(&route.gateway.addr[..IPV4_ADDR_LEN]);
    return IcmpQuote(offender, &gw, ICMP_REDIRECT, code);
}

/// Report an expired TTL to the source.
pub fn IcmpTimeExceeded(offender: PktId, code: u8) -> Result<()> {
    trace!("icmp: time exceeded ({})", code);
    return IcmpQuote(offender, &[0, 0, 0, 0], ICMP_TIMEEXCD, code);
}
