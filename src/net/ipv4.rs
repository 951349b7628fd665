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

//! Minimal IPv4: 20-byte headers without options on the way out, header
//! validation and local/forward demux on the way in.

use byteorder::BigEndian;
use byteorder::ByteOrder;

use super::super::device::raw::RawRecv;
use super::super::device::udp::UdpRecv;
use super::super::qlib::common::*;
use super::icmp::IcmpRecv;
use super::netaddr::*;
use super::pkt::*;
use super::route::*;
use super::NetChksum;
use super::NetifState;
use super::NETIFTAB;
use super::NNETIF;

pub const IPV4_VERSION: u8 = 4;
pub const IPV4_HDR_LEN: usize = 20;
pub const IPV4_MIN_IHL: u8 = 5;
pub const IPV4_MAX_IHL: u8 = 15;
pub const IPV4_TTL: u8 = 64;
pub const IPV4_TOS_ROUTINE: u8 = 0;

pub const IPV4_PROTO_ICMP: u8 = 1;
pub const IPV4_PROTO_UDP: u8 = 17;

/// Send an outgoing IPv4 datagram. The payload sits at the packet cursor;
/// the header is prepended here. A source of type NONE picks the outgoing
/// interface's address.
pub fn Ipv4Send(pktid: PktId, src: &NetAddr, dst: &NetAddr, proto: u8) -> Result<()> {
    if dst.typ != NETADDR_IPV4 {
        return Err(Error::SysErr);
    }

    let route = match RtLookup(dst) {
        None => {
            trace!("ipv4: no route to {}", dst);
            return Err(Error::SysErr);
        }
        Some(r) => r,
    };

    let nxthop = if route.gateway.IsNone() {
        *dst
    } else {
        route.gateway
    };

    let ifip = {
        let nif = NETIFTAB[route.nif as usize].lock();
        if nif.state != NetifState::Alloc {
            return Err(Error::SysErr);
        }
        nif.ip
    };

    let srcip = if src.IsNone() { ifip } else { *src };

    WithPkt(pktid, |p| -> Result<()> {
        p.nif = route.nif;
        let total = (p.len + IPV4_HDR_LEN) as u16;
        let hdr = p.Prepend(IPV4_HDR_LEN)?;
        hdr[0] = (IPV4_VERSION << 4) | (IPV4_HDR_LEN as u8 / 4);
        hdr[1] = IPV4_TOS_ROUTINE;
        BigEndian::write_u16(&mut hdr[2..4], total);
        BigEndian::write_u16(&mut hdr[4..6], 0);
        BigEndian::write_u16(&mut hdr[6..8], 0);
        hdr[8] = IPV4_TTL;
        hdr[9] = proto;
        BigEndian::write_u16(&mut hdr[10..12], 0);
        hdr[12..16].copy_from_slice(&srcip.addr[..IPV4_ADDR_LEN]);
        hdr[16..20].copy_from_slice(&dst.addr[..IPV4_ADDR_LEN]);
        let sum = NetChksum(&hdr[..IPV4_HDR_LEN]);
        BigEndian::write_u16(&mut hdr[10..12], sum);
        p.nethdr = p.curr;
        return Ok(());
    })??;

    return Ipv4SendFrag(pktid, &nxthop);
}

/// Transmit a complete datagram. Datagrams that would need link-level
/// fragmentation are refused; this is the fragmentation hook.
pub fn Ipv4SendFrag(pktid: PktId, nxthop: &NetAddr) -> Result<()> {
    let (len, nif) = WithPkt(pktid, |p| (p.len, p.nif))?;
    if nif < 0 {
        return Err(Error::SysErr);
    }
    let mtu = NETIFTAB[nif as usize].lock().mtu;
    if len > mtu {
        trace!("ipv4: datagram of {} bytes needs fragmentation", len);
        return Err(Error::SysErr);
    }
    return super::ether::NetSend(pktid, None, Some(nxthop), super::ether::ETHER_TYPE_IPV4);
}

/// Validate an IPv4 header: version, IHL bounds, total length, checksum.
pub fn Ipv4RecvValid(hdr: &[u8]) -> bool {
    if hdr.len() < IPV4_HDR_LEN {
        return false;
    }
    let ihl = hdr[0] & 0x0f;
    if (hdr[0] >> 4) != IPV4_VERSION {
        return false;
    }
    if ihl < IPV4_MIN_IHL || ihl > IPV4_MAX_IHL {
        return false;
    }
    let total = BigEndian::read_u16(&hdr[2..4]) as usize;
    if total < ihl as usize * 4 {
        return false;
    }
    if hdr.len() < ihl as usize * 4 {
        return false;
    }
    if NetChksum(&hdr[..ihl as usize * 4]) != 0 {
        return false;
    }
    return true;
}

/// True when the destination names a local interface or its broadcast.
pub fn Ipv4RecvDemux(dst: &NetAddr) -> bool {
    for i in 0..NNETIF {
        let nif = NETIFTAB[i].lock();
        if nif.state != NetifState::Alloc {
            continue;
        }
        if *dst == nif.ip || *dst == nif.ipbrc {
            return true;
        }
    }
    return false;
}

/// Handle a received IPv4 packet: validate, then deliver locally or hand
/// it to the routing path. Takes ownership of the packet.
pub fn Ipv4Recv(pktid: PktId) -> Result<()> {
    let parsed = WithPkt(pktid, |p| -> Result<(NetAddr, NetAddr, u8, u8)> {
        let hdr = p.Payload();
        if !Ipv4RecvValid(hdr) {
            return Err(Error::SysErr);
        }
        let ihl = hdr[0] & 0x0f;
        let total = BigEndian::read_u16(&hdr[2..4]) as usize;
        if total > p.len {
            return Err(Error::SysErr);
        }
        // Fragments are not reassembled.
        if BigEndian::read_u16(&hdr[6..8]) & 0x3fff != 0 {
            return Err(Error::SysErr);
        }
        let src = NetAddr::FromIpv4Bytes(&hdr[12..16]);
        let dst = NetAddr::FromIpv4Bytes(&hdr[16..20]);
        let proto = hdr[9];

        // Trim link padding and remember where the header sits.
        p.len = total;
        p.nethdr = p.curr;
        return Ok((src, dst, proto, ihl));
    })?;

    let (src, dst, proto, ihl) = match parsed {
        Ok(t) => t,
        Err(_) => {
            trace!("ipv4: dropping malformed datagram");
            super::CountDropped();
            let _ = NetFreebuf(pktid);
            return Ok(());
        }
    };

    if !Ipv4RecvDemux(&dst) {
        trace!("ipv4: forwarding datagram for {}", dst);
        return RtRecv(pktid);
    }

    WithPkt(pktid, |p| p.Pull(ihl as usize * 4))??;

    match proto {
        IPV4_PROTO_ICMP => return IcmpRecv(pktid),
        IPV4_PROTO_UDP => return UdpRecv(pktid, &src, &dst),
        _ => return RawRecv(pktid, &src, &dst, proto),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn BuildHdr(total: u16) -> [u8; IPV4_HDR_LEN] {
        let mut hdr = [0u8; IPV4_HDR_LEN];
        hdr[0] = 0x45;
        BigEndian::write_u16(&mut hdr[2..4], total);
        hdr[8] = IPV4_TTL;
        hdr[9] = IPV4_PROTO_UDP;
        hdr[12..16].copy_from_slice(&[10, 0, 0, 1]);
        hdr[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let sum = NetChksum(&hdr);
        BigEndian::write_u16(&mut hdr[10..12], sum);
        return hdr;
    }

    #[test]
    fn valid_header_roundtrip() {
        let hdr = BuildHdr(48);
        assert!(Ipv4RecvValid(&hdr));
    }

    #[test]
    fn corrupt_header_rejected() {
        let mut hdr = BuildHdr(48);
        hdr[16] = 11;
        assert!(!Ipv4RecvValid(&hdr));

        let mut bad_ver = BuildHdr(48);
        bad_ver[0] = 0x55;
        assert!(!Ipv4RecvValid(&bad_ver));

        let mut bad_ihl = BuildHdr(48);
        bad_ihl[0] = 0x44;
        assert!(!Ipv4RecvValid(&bad_ihl));

        let short = BuildHdr(10);
        assert!(!Ipv4RecvValid(&short));
    }
}
