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

//! UDP socket devices. Each endpoint owns an input ring of buffers taken
//! from its private pool; incoming datagrams are matched to the endpoint
//! with the best-scoring binding (full four-tuple, then ports-only, then
//! destination port alone). Default mode moves payloads; passive mode
//! moves whole pseudo-header datagrams.

use lazy_static::lazy_static;

use byteorder::BigEndian;
use byteorder::ByteOrder;

use super::super::kernel::interrupt::*;
use super::super::kernel::semaphore::*;
use super::super::mem::bufpool::*;
use super::super::mem::memblk::HeapWith;
use super::super::net::icmp::*;
use super::super::net::ipv4::*;
use super::super::net::netaddr::*;
use super::super::net::pkt::*;
use super::super::qlib::common::*;
use super::super::qlib::mutex::*;
use super::DevDriver;
use super::DevId;
use super::OpenArgs;

pub const NUDP: usize = 4;
pub static UDP_NAMES: [&str; NUDP] = ["UDP0", "UDP1", "UDP2", "UDP3"];

pub const UDP_HDR_LEN: usize = 8;
pub const UDP_PSEUDO_LEN: usize = 12;
pub const UDP_MAX_PKTS: usize = 32;
pub const UDP_MAX_DATALEN: usize = 1472;

pub const UDP_CTRL_ACCEPT: i32 = 1;
pub const UDP_CTRL_BIND: i32 = 2;
pub const UDP_CTRL_SETFLAG: i32 = 3;
pub const UDP_CTRL_CLRFLAG: i32 = 4;

bitflags::bitflags! {
    pub struct UdpFlags: u32 {
        const NOBLOCK = 0x01;
        const PASSIVE = 0x02;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UdpState {
    Free,
    Alloc,
    Open,
}

pub struct Udp {
    pub state: UdpState,
    pub localip: NetAddr,
    pub remoteip: NetAddr,
    pub localpt: u16,
    pub remotept: u16,
    // Ring of input-pool buffer offsets holding pseudo-header datagrams.
    pub inring: Vec<u32>,
    pub istart: usize,
    pub icount: usize,
    pub inpool: i32,
    pub isem: Sid,
    pub flags: UdpFlags,
}

lazy_static! {
    pub static ref UDPTAB: Vec<QMutex<Udp>> = (0..NUDP)
        .map(|_| {
            QMutex::new(Udp {
                state: UdpState::Free,
                localip: NetAddr::None(),
                remoteip: NetAddr::None(),
                localpt: 0,
                remotept: 0,
                inring: vec![0; UDP_MAX_PKTS],
                istart: 0,
                icount: 0,
                inpool: -1,
                isem: -1,
                flags: UdpFlags::empty(),
            })
        })
        .collect();
}

pub struct UdpDriver;

pub static UDP_DRIVER: UdpDriver = UdpDriver;

/// Reserve an unopened UDP device and return its descriptor.
pub fn UdpAlloc() -> Result<DevId> {
    let _im = Disable();
    for i in 0..NUDP {
        let mut u = UDPTAB[i].lock();
        if u.state == UdpState::Free {
            u.state = UdpState::Alloc;
            return Ok(super::UDP0 + i);
        }
    }
    return Err(Error::SysErr);
}

impl DevDriver for UdpDriver {
    fn Init(&self, minor: usize) -> Result<()> {
        let mut u = UDPTAB[minor].lock();
        u.state = UdpState::Free;
        return Ok(());
    }

    fn Open(&self, minor: usize, args: &OpenArgs) -> Result<()> {
        let (localpt, remotept, localip, remoteip) = match args {
            OpenArgs::Udp {
                localpt,
                remotept,
                localip,
                remoteip,
            } => (*localpt, *remotept, *localip, *remoteip),
            _ => return Err(Error::SysErr),
        };

        // A socket is nothing without a bound local port and address.
        if localpt == 0 {
            return Err(Error::SysErr);
        }
        let localip = match localip {
            None => return Err(Error::SysErr),
            Some(ip) => ip,
        };

        let _im = Disable();
        {
            let u = UDPTAB[minor].lock();
            if u.state != UdpState::Alloc {
                return Err(Error::SysErr);
            }
        }

        let inpool = BfpAlloc(UDP_PSEUDO_LEN + UDP_HDR_LEN + UDP_MAX_DATALEN, UDP_MAX_PKTS)?;
        let isem = match SemCreate(0) {
            Ok(s) => s,
            Err(e) => {
                let _ = BfpFree(inpool);
                return Err(e);
            }
        };

        let mut u = UDPTAB[minor].lock();
        u.localpt = localpt;
        u.remotept = remotept;
        u.localip = localip;
        u.remoteip = match remoteip {
            None => NetAddr::None(),
            Some(ip) => ip,
        };
        u.istart = 0;
        u.icount = 0;
        u.inpool = inpool;
        u.isem = isem;
        u.flags = UdpFlags::empty();
        u.state = UdpState::Open;
        return Ok(());
    }

    /// Close the endpoint. Safe while readers are blocked: they resume,
    /// re-check the state and fail; the device must not be reopened until
    /// they have all returned.
    fn Close(&self, minor: usize) -> Result<()> {
        let _im = Disable();
        let (inpool, isem) = {
            let mut u = UDPTAB[minor].lock();
            if u.state != UdpState::Open {
                return Err(Error::SysErr);
            }
            let r = (u.inpool, u.isem);
            u.state = UdpState::Free;
            u.localip = NetAddr::None();
            u.remoteip = NetAddr::None();
            u.localpt = 0;
            u.remotept = 0;
            u.istart = 0;
            u.icount = 0;
            u.inpool = -1;
            u.isem = -1;
            u.flags = UdpFlags::empty();
            r
        };

        let _ = BfpFree(inpool);
        let _ = SemFree(isem);
        return Ok(());
    }

    /// Read the next datagram: the payload in default mode, the whole
    /// pseudo-header datagram in passive mode, truncated to the caller's
    /// buffer. Non-blocking reads of an empty ring return 0.
    fn Read(&self, minor: usize, buf: &mut [u8]) -> Result<usize> {
        let _im = Disable();
        let isem = {
            let u = UDPTAB[minor].lock();
            if u.state != UdpState::Open {
                return Err(Error::SysErr);
            }
            if u.flags.contains(UdpFlags::NOBLOCK) && u.icount < 1 {
                return Ok(0);
            }
            u.isem
        };

        Wait(isem)?;

        let (off, passive) = {
            let mut u = UDPTAB[minor].lock();
            if u.state != UdpState::Open {
                return Err(Error::SysErr);
            }
            let off = u.inring[u.istart];
            u.istart = (u.istart + 1) % UDP_MAX_PKTS;
            u.icount -= 1;
            (off, u.flags.contains(UdpFlags::PASSIVE))
        };

        let count = HeapWith(|heap| {
            let base = off as usize;
            let udplen =
                BigEndian::read_u16(&heap[base + UDP_PSEUDO_LEN + 4..base + UDP_PSEUDO_LEN + 6])
                    as usize;
            let (data, count) = if passive {
                (base, udplen + UDP_PSEUDO_LEN)
            } else {
                (base + UDP_PSEUDO_LEN + UDP_HDR_LEN, udplen - UDP_HDR_LEN)
            };
            let count = count.min(buf.len());
            buf[..count].copy_from_slice(&heap[data..data + count]);
            count
        });

        BufFree(off)?;
        return Ok(count);
    }

    /// Write data out the endpoint: payloads split across datagrams in
    /// default mode, one fully formed pseudo-header datagram in passive
    /// mode.
    fn Write(&self, minor: usize, buf: &[u8]) -> Result<usize> {
        let (state, flags, remotept, remoteip) = {
            let u = UDPTAB[minor].lock();
            (u.state, u.flags, u.remotept, u.remoteip)
        };
        if state != UdpState::Open {
            return Err(Error::SysErr);
        }

        if flags.contains(UdpFlags::PASSIVE) {
            if buf.len() > UDP_PSEUDO_LEN + UDP_HDR_LEN + UDP_MAX_DATALEN
                || buf.len() < UDP_PSEUDO_LEN + UDP_HDR_LEN
            {
                return Err(Error::SysErr);
            }
            UdpSendPassive(buf)?;
            return Ok(buf.len());
        }

        if remotept == 0 || remoteip.IsNone() {
            trace!("udp: no remote binding for write");
            return Err(Error::SysErr);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut count = 0;
        while count < buf.len() {
            let pktsize = (buf.len() - count).min(UDP_MAX_DATALEN);
            if let Err(e) = UdpSend(minor, &buf[count..count + pktsize]) {
                if count == 0 {
                    return Err(e);
                }
                return Ok(count);
            }
            count += pktsize;
        }
        return Ok(buf.len());
    }

    fn Control(&self, minor: usize, func: i32, arg1: i64, arg2: i64) -> Result<i64> {
        let mut u = UDPTAB[minor].lock();
        if u.state == UdpState::Free {
            return Err(Error::SysErr);
        }

        match func {
            // arg1 is the port, arg2 an IPv4 address packed big-endian.
            UDP_CTRL_ACCEPT => {
                if arg2 < 0 {
                    return Err(Error::SysErr);
                }
                u.localpt = arg1 as u16;
                u.localip = Ipv4FromPacked(arg2 as u32);
                return Ok(0);
            }
            // arg2 < 0 clears the remote binding.
            UDP_CTRL_BIND => {
                u.remotept = arg1 as u16;
                if arg2 < 0 {
                    u.remoteip = NetAddr::None();
                } else {
                    u.remoteip = Ipv4FromPacked(arg2 as u32);
                }
                return Ok(0);
            }
            UDP_CTRL_SETFLAG => {
                let old = u.flags.bits() & arg1 as u32;
                u.flags |= UdpFlags::from_bits_truncate(arg1 as u32);
                return Ok(old as i64);
            }
            UDP_CTRL_CLRFLAG => {
                let old = u.flags.bits() & arg1 as u32;
                u.flags &= !UdpFlags::from_bits_truncate(arg1 as u32);
                return Ok(old as i64);
            }
            _ => {
                return Err(Error::SysErr);
            }
        }
    }
}

fn Ipv4FromPacked(v: u32) -> NetAddr {
    return NetAddr::Ipv4(
        (v >> 24) as u8,
        (v >> 16) as u8,
        (v >> 8) as u8,
        v as u8,
    );
}

/// Checksum a UDP datagram against its pseudo-header.
pub fn UdpChksum(msg: &[u8], src: &NetAddr, dst: &NetAddr) -> u16 {
    let mut pseudo = Vec::with_capacity(UDP_PSEUDO_LEN + msg.len());
    pseudo.extend_from_slice(&src.addr[..IPV4_ADDR_LEN]);
    pseudo.extend_from_slice(&dst.addr[..IPV4_ADDR_LEN]);
    pseudo.push(0);
    pseudo.push(IPV4_PROTO_UDP);
    let mut lenb = [0u8; 2];
    BigEndian::write_u16(&mut lenb, msg.len() as u16);
    pseudo.extend_from_slice(&lenb);
    pseudo.extend_from_slice(msg);
    return super::super::net::NetChksum(&pseudo);
}

/// Send one datagram from an endpoint's bindings.
fn UdpSend(minor: usize, payload: &[u8]) -> Result<()> {
    let (localip, remoteip, localpt, remotept) = {
        let u = UDPTAB[minor].lock();
        if u.state != UdpState::Open {
            return Err(Error::SysErr);
        }
        (u.localip, u.remoteip, u.localpt, u.remotept)
    };

    let pktid = NetGetbuf()?;
    let r = WithPkt(pktid, |p| -> Result<()> {
        let data = p.Prepend(payload.len())?;
        data.copy_from_slice(payload);

        let udplen = (UDP_HDR_LEN + payload.len()) as u16;
        let hdr = p.Prepend(UDP_HDR_LEN)?;
        BigEndian::write_u16(&mut hdr[0..2], localpt);
        BigEndian::write_u16(&mut hdr[2..4], remotept);
        BigEndian::write_u16(&mut hdr[4..6], udplen);
        BigEndian::write_u16(&mut hdr[6..8], 0);

        let mut sum = UdpChksum(p.Payload(), &localip, &remoteip);
        if sum == 0 {
            sum = 0xffff;
        }
        BigEndian::write_u16(&mut p.PayloadMut()[6..8], sum);
        return Ok(());
    })?;
    if let Err(e) = r {
        let _ = NetFreebuf(pktid);
        return Err(e);
    }

    let result = Ipv4Send(pktid, &localip, &remoteip, IPV4_PROTO_UDP);
    NetFreebuf(pktid)?;
    return result;
}

/// Send a caller-composed pseudo-header datagram.
fn UdpSendPassive(dgram: &[u8]) -> Result<()> {
    let src = NetAddr::FromIpv4Bytes(&dgram[0..4]);
    let dst = NetAddr::FromIpv4Bytes(&dgram[4..8]);
    let msg = &dgram[UDP_PSEUDO_LEN..];

    let pktid = NetGetbuf()?;
    let r = WithPkt(pktid, |p| -> Result<()> {
        let data = p.Prepend(msg.len())?;
        data.copy_from_slice(msg);
        return Ok(());
    })?;
    if let Err(e) = r {
        let _ = NetFreebuf(pktid);
        return Err(e);
    }

    let result = Ipv4Send(pktid, &src, &dst, IPV4_PROTO_UDP);
    NetFreebuf(pktid)?;
    return result;
}

/// Pick the endpoint for an incoming datagram: full match beats
/// ports-only, which beats destination-port alone.
pub fn UdpDemux(dstpt: u16, srcpt: u16, dstip: &NetAddr, srcip: &NetAddr) -> Option<usize> {
    const NO_MATCH: u32 = 0;
    const DEST_MATCH: u32 = 1;
    const PARTIAL_MATCH: u32 = 2;
    const FULL_MATCH: u32 = 3;

    let mut best = None;
    let mut score = NO_MATCH;

    for i in 0..NUDP {
        let u = UDPTAB[i].lock();
        if u.state == UdpState::Free {
            continue;
        }
        if u.localip != *dstip {
            continue;
        }

        if score < FULL_MATCH
            && u.localpt == dstpt
            && u.remotept == srcpt
            && u.remoteip == *srcip
        {
            best = Some(i);
            score = FULL_MATCH;
            break;
        }

        if score < PARTIAL_MATCH
            && u.localpt == dstpt
            && u.remotept == srcpt
            && u.remoteip.IsNone()
        {
            best = Some(i);
            score = PARTIAL_MATCH;
        }

        if score < DEST_MATCH && u.localpt == dstpt && u.remotept == 0 && u.remoteip.IsNone() {
            best = Some(i);
            score = DEST_MATCH;
        }
    }
    return best;
}

/// Accept an incoming datagram: verify its checksum, demux it, and park
/// it on the winning endpoint's input ring. Without a taker the source
/// hears port-unreachable. Takes ownership of the packet.
pub fn UdpRecv(pktid: PktId, src: &NetAddr, dst: &NetAddr) -> Result<()> {
    let parsed = WithPkt(pktid, |p| -> Result<(u16, u16, usize)> {
        let d = p.Payload();
        if d.len() < UDP_HDR_LEN {
            return Err(Error::SysErr);
        }
        let srcpt = BigEndian::read_u16(&d[0..2]);
        let dstpt = BigEndian::read_u16(&d[2..4]);
        let udplen = BigEndian::read_u16(&d[4..6]) as usize;
        if udplen < UDP_HDR_LEN
            || udplen > d.len()
            || udplen > UDP_HDR_LEN + UDP_MAX_DATALEN
        {
            return Err(Error::SysErr);
        }
        let sum = BigEndian::read_u16(&d[6..8]);
        if sum != 0 && UdpChksum(&d[..udplen], src, dst) != 0 {
            return Err(Error::SysErr);
        }
        return Ok((srcpt, dstpt, udplen));
    })?;

    let (srcpt, dstpt, udplen) = match parsed {
        Ok(t) => t,
        Err(_) => {
            trace!("udp: dropping malformed datagram");
            super::super::net::CountDropped();
            let _ = NetFreebuf(pktid);
            return Err(Error::SysErr);
        }
    };

    let minor = match UdpDemux(dstpt, srcpt, dst, src) {
        None => {
            trace!("udp: no socket for port {}", dstpt);
            let _ = IcmpDestUnreach(pktid, ICMP_PORT_UNR);
            let _ = NetFreebuf(pktid);
            return Ok(());
        }
        Some(m) => m,
    };

    let _im = Disable();
    let (inpool, full) = {
        let u = UDPTAB[minor].lock();
        if u.state != UdpState::Open {
            let _ = NetFreebuf(pktid);
            return Err(Error::SysErr);
        }
        (u.inpool, u.icount >= UDP_MAX_PKTS)
    };
    if full {
        trace!("udp: input ring full, dropping");
        super::super::net::CountDropped();
        let _ = NetFreebuf(pktid);
        return Err(Error::SysErr);
    }

    let off = BufGet(inpool)?;
    WithPkt(pktid, |p| {
        let d = p.Payload();
        HeapWith(|heap| {
            let base = off as usize;
            heap[base..base + 4].copy_from_slice(&src.addr[..IPV4_ADDR_LEN]);
            heap[base + 4..base + 8].copy_from_slice(&dst.addr[..IPV4_ADDR_LEN]);
            heap[base + 8] = 0;
            heap[base + 9] = IPV4_PROTO_UDP;
            BigEndian::write_u16(&mut heap[base + 10..base + 12], udplen as u16);
            heap[base + UDP_PSEUDO_LEN..base + UDP_PSEUDO_LEN + udplen]
                .copy_from_slice(&d[..udplen]);
        });
    })?;

    let isem = {
        let mut u = UDPTAB[minor].lock();
        if u.state != UdpState::Open {
            drop(u);
            let _ = BufFree(off);
            let _ = NetFreebuf(pktid);
            return Err(Error::SysErr);
        }
        let slot = (u.istart + u.icount) % UDP_MAX_PKTS;
        u.inring[slot] = off;
        u.icount += 1;
        u.isem
    };

    Signal(isem)?;
    return NetFreebuf(pktid);
}
