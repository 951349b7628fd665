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

//! Link-layer framing and transmit: prepend the Ethernet header and write
//! the frame through the interface's device, resolving the destination
//! hardware address when only a protocol address is known.

use byteorder::BigEndian;
use byteorder::ByteOrder;

use super::super::device;
use super::super::qlib::common::*;
use super::arp::ArpLookup;
use super::netaddr::*;
use super::pkt::*;
use super::NetifState;
use super::NETIFTAB;

pub const ETH_HDR_LEN: usize = 14;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;

/// Add the link header and put the packet on the wire.
///
/// When `hwaddr` is None the destination protocol address `praddr` is
/// resolved first, which may block in the ARP lookup.
pub fn NetSend(
    pktid: PktId,
    hwaddr: Option<&NetAddr>,
    praddr: Option<&NetAddr>,
    ethtype: u16,
) -> Result<()> {
    let nifidx = WithPkt(pktid, |p| p.nif)?;
    if nifidx < 0 {
        return Err(Error::SysErr);
    }

    let (dev, srcmac, state) = {
        let nif = NETIFTAB[nifidx as usize].lock();
        (nif.dev, nif.hwaddr, nif.state)
    };
    if state != NetifState::Alloc {
        return Err(Error::SysErr);
    }

    // Lay down everything but the destination, which may need resolving.
    WithPkt(pktid, |p| -> Result<()> {
        let hdr = p.Prepend(ETH_HDR_LEN)?;
        hdr[6..12].copy_from_slice(&srcmac.addr[..ETH_ADDR_LEN]);
        BigEndian::write_u16(&mut hdr[12..14], ethtype);
        return Ok(());
    })??;

    let dst = match hwaddr {
        Some(h) => *h,
        None => {
            let praddr = match praddr {
                None => return Err(Error::SysErr),
                Some(a) => a,
            };
            ArpLookup(nifidx as usize, praddr)?
        }
    };

    let frame = WithPkt(pktid, |p| {
        p.PayloadMut()[..ETH_ADDR_LEN].copy_from_slice(&dst.addr[..ETH_ADDR_LEN]);
        p.Payload().to_vec()
    })?;

    let n = device::Write(dev, &frame)?;
    if n != frame.len() {
        return Err(Error::SysErr);
    }
    super::CountSent();
    return Ok(());
}
