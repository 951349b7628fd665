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

//! Network interfaces and the receive path. Each interface sits on a link
//! device; a per-interface receive thread pulls frames off the device,
//! wraps them in pool buffers and hands them to the protocol layers.

pub mod netaddr;
pub mod pkt;
pub mod ether;
pub mod arp;
pub mod route;
pub mod ipv4;
pub mod icmp;

use std::sync::Arc;

use lazy_static::lazy_static;

use byteorder::BigEndian;
use byteorder::ByteOrder;

use super::device;
use super::device::DevId;
use super::kernel::sched::*;
use super::kernel::thread::CORE_ZERO;
use super::qlib::common::*;
use super::qlib::metric::*;
use super::qlib::mutex::*;
use self::ether::*;
use self::netaddr::*;
use self::pkt::*;

pub const NNETIF: usize = 2;
// Receive threads per interface.
pub const NET_NTHR: usize = 1;
pub const NET_THR_PRIO: i32 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetifState {
    Free,
    Alloc,
}

pub struct Netif {
    pub state: NetifState,
    pub dev: DevId,
    pub hwaddr: NetAddr,
    pub hwbrc: NetAddr,
    pub ip: NetAddr,
    pub mask: NetAddr,
    pub ipbrc: NetAddr,
    pub mtu: usize,
    pub linkhdrlen: usize,
    pub recvthr: Vec<i32>,
}

lazy_static! {
    pub static ref NETIFTAB: Vec<QMutex<Netif>> = (0..NNETIF)
        .map(|_| {
            QMutex::new(Netif {
                state: NetifState::Free,
                dev: 0,
                hwaddr: NetAddr::None(),
                hwbrc: NetAddr::None(),
                ip: NetAddr::None(),
                mask: NetAddr::None(),
                ipbrc: NetAddr::None(),
                mtu: 1500,
                linkhdrlen: ETH_HDR_LEN,
                recvthr: Vec::new(),
            })
        })
        .collect();
    static ref PKTS_RECVD: Arc<U64Metric> = NewU64Metric("net.rx", "frames received");
    static ref PKTS_SENT: Arc<U64Metric> = NewU64Metric("net.tx", "frames sent");
    static ref PKTS_DROPPED: Arc<U64Metric> = NewU64Metric("net.dropped", "frames dropped");
}

/// One's-complement checksum over a byte slice, odd tail zero-padded.
pub fn NetChksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += BigEndian::read_u16(&data[i..i + 2]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    return !(sum as u16);
}

/// Initialize the network core: the packet pool and the protocol daemons.
pub fn NetInit() -> Result<()> {
    lazy_static::initialize(&NETPOOL);

    arp::ArpInit()?;
    route::RtInit()?;
    icmp::IcmpInit()?;
    return Ok(());
}

/// Bring an interface up over an opened link device and start its receive
/// threads.
pub fn NetUp(dev: DevId, ip: NetAddr, mask: NetAddr, hwaddr: NetAddr) -> Result<usize> {
    super::kernel::EnsureStarted();

    if NetLookup(dev).is_some() {
        return Err(Error::SysErr);
    }

    let mut idx = NNETIF;
    for i in 0..NNETIF {
        let mut nif = NETIFTAB[i].lock();
        if nif.state == NetifState::Free {
            nif.state = NetifState::Alloc;
            nif.dev = dev;
            nif.hwaddr = hwaddr;
            nif.hwbrc = NetAddr::EthBroadcast();
            nif.ipbrc = ip.BroadcastFor(&mask);
            nif.ip = ip;
            nif.mask = mask;
            nif.mtu = 1500;
            nif.linkhdrlen = ETH_HDR_LEN;
            nif.recvthr = Vec::new();
            idx = i;
            break;
        }
    }
    if idx == NNETIF {
        return Err(Error::SysErr);
    }

    for n in 0..NET_NTHR {
        let tid = Create(
            move || NetRecvLoop(idx),
            0,
            NET_THR_PRIO,
            &format!("netrecv{}-{}", idx, n),
        )?;
        Ready(tid, RESCHED_NO, CORE_ZERO)?;
        NETIFTAB[idx].lock().recvthr.push(tid);
    }

    info!("netif {} up: ip {} on dev {}", idx, ip, dev);
    return Ok(idx);
}

/// Take an interface down, stopping its receive threads.
pub fn NetDown(dev: DevId) -> Result<()> {
    let idx = match NetLookup(dev) {
        None => return Err(Error::SysErr),
        Some(i) => i,
    };

    let thrs = {
        let mut nif = NETIFTAB[idx].lock();
        nif.state = NetifState::Free;
        core::mem::replace(&mut nif.recvthr, Vec::new())
    };
    for tid in thrs {
        let _ = Kill(tid);
    }
    return Ok(());
}

/// Find the interface running on a device.
pub fn NetLookup(dev: DevId) -> Option<usize> {
    for i in 0..NNETIF {
        let nif = NETIFTAB[i].lock();
        if nif.state == NetifState::Alloc && nif.dev == dev {
            return Some(i);
        }
    }
    return None;
}

fn NetRecvLoop(idx: usize) -> i32 {
    let mut frame = vec![0u8; NET_MAX_PKTLEN];
    loop {
        let dev = {
            let nif = NETIFTAB[idx].lock();
            if nif.state != NetifState::Alloc {
                return 0;
            }
            nif.dev
        };

        let n = match device::Read(dev, &mut frame) {
            Ok(n) => n,
            Err(_) => return 0,
        };
        if n < ETH_HDR_LEN {
            PKTS_DROPPED.Incr();
            continue;
        }
        PKTS_RECVD.Incr();

        let pktid = match NetGetbuf() {
            Ok(p) => p,
            Err(_) => {
                PKTS_DROPPED.Incr();
                continue;
            }
        };
        let ethtype = BigEndian::read_u16(&frame[12..14]);
        let r = WithPkt(pktid, |p| {
            p.data[..n].copy_from_slice(&frame[..n]);
            p.curr = ETH_HDR_LEN;
            p.len = n - ETH_HDR_LEN;
            p.nif = idx as i32;
        });
        if r.is_err() {
            let _ = NetFreebuf(pktid);
            continue;
        }

        let r = match ethtype {
            ETHER_TYPE_ARP => arp::ArpRecv(pktid),
            ETHER_TYPE_IPV4 => ipv4::Ipv4Recv(pktid),
            _ => {
                trace!("netrecv: dropping ethertype {:#06x}", ethtype);
                PKTS_DROPPED.Incr();
                NetFreebuf(pktid)
            }
        };
        if let Err(e) = r {
            trace!("netrecv: input error {:?}", e);
        }
    }
}

pub(crate) fn CountSent() {
    PKTS_SENT.Incr();
}

pub(crate) fn CountDropped() {
    PKTS_DROPPED.Incr();
}
