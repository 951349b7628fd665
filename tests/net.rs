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

//! Network path scenarios over the Ethernet loopback link: routing,
//! ARP resolution on the wire, UDP delivery and ICMP echo.

#![allow(non_snake_case)]

use std::sync::Mutex;
use std::sync::Once;

use qmicro::device;
use qmicro::device::ethloop::*;
use qmicro::device::raw::*;
use qmicro::device::udp::*;
use qmicro::device::OpenArgs;
use qmicro::device::ELOOP0;
use qmicro::device::ELOOP1;
use qmicro::kernel::message::RecvTime;
use qmicro::kernel::thread::GetTid;
use qmicro::kernel::KernelRunOn;
use qmicro::net::arp::ArpLookup;
use qmicro::net::icmp::*;
use qmicro::net::netaddr::*;
use qmicro::net::pkt::*;
use qmicro::net::route::*;
use qmicro::net::NetLookup;
use qmicro::net::NetUp;
use qmicro::Error;

lazy_static::lazy_static! {
    static ref TESTLOCK: Mutex<()> = Mutex::new(());
}

static NETSETUP: Once = Once::new();

fn OurIp() -> NetAddr {
    return NetAddr::Ipv4(192, 168, 1, 2);
}

fn OurMask() -> NetAddr {
    return NetAddr::Ipv4(255, 255, 255, 0);
}

fn OurMac() -> NetAddr {
    return NetAddr::Eth([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
}

fn Serial() -> std::sync::MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let g = match TESTLOCK.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    };

    NETSETUP.call_once(|| {
        device::Open(ELOOP0, &OpenArgs::None).unwrap();
        let nif = NetUp(ELOOP0, OurIp(), OurMask(), OurMac()).unwrap();
        RtAdd(
            &NetAddr::Ipv4(192, 168, 1, 0),
            None,
            &OurMask(),
            nif,
        )
        .unwrap();
    });
    return g;
}

#[test]
fn route_longest_prefix_match() {
    let _s = Serial();

    let slash8 = NetAddr::Ipv4(255, 0, 0, 0);
    let slash16 = NetAddr::Ipv4(255, 255, 0, 0);
    RtAdd(&NetAddr::Ipv4(10, 0, 0, 0), None, &slash8, 0).unwrap();
    RtAdd(&NetAddr::Ipv4(10, 1, 0, 0), None, &slash16, 1).unwrap();
    RtDefault(&NetAddr::Ipv4(192, 168, 1, 1), 0).unwrap();

    let r = RtLookup(&NetAddr::Ipv4(10, 1, 2, 3)).unwrap();
    assert_eq!(r.masklen, 16);
    assert_eq!(r.nif, 1);

    let r = RtLookup(&NetAddr::Ipv4(10, 2, 3, 4)).unwrap();
    assert_eq!(r.masklen, 8);
    assert_eq!(r.nif, 0);

    // Nothing specific matches; the default route catches it.
    let r = RtLookup(&NetAddr::Ipv4(11, 2, 3, 4)).unwrap();
    assert_eq!(r.masklen, 0);

    RtRemove(&NetAddr::Ipv4(10, 0, 0, 0)).unwrap();
    RtRemove(&NetAddr::Ipv4(10, 1, 0, 0)).unwrap();
    RtRemove(&NetAddr::Ipv4(0, 0, 0, 0)).unwrap();
    assert!(RtLookup(&NetAddr::Ipv4(11, 2, 3, 4)).is_none());
}

#[test]
fn udp_demux_prefers_fullest_binding() {
    let _s = Serial();

    let x = NetAddr::Ipv4(192, 168, 1, 50);
    let y = NetAddr::Ipv4(192, 168, 1, 60);

    // E1: local port only. E2: fully bound to (X, 1000).
    let e1 = UdpAlloc().unwrap();
    device::Open(
        e1,
        &OpenArgs::Udp {
            localpt: 53,
            remotept: 0,
            localip: Some(OurIp()),
            remoteip: None,
        },
    )
    .unwrap();

    let e2 = UdpAlloc().unwrap();
    device::Open(
        e2,
        &OpenArgs::Udp {
            localpt: 53,
            remotept: 1000,
            localip: Some(OurIp()),
            remoteip: Some(x),
        },
    )
    .unwrap();

    let m1 = device::DEVTAB[e1].minor;
    let m2 = device::DEVTAB[e2].minor;

    assert_eq!(UdpDemux(53, 1000, &OurIp(), &x), Some(m2));
    assert_eq!(UdpDemux(53, 2000, &OurIp(), &y), Some(m1));
    assert_eq!(UdpDemux(99, 2000, &OurIp(), &y), None);

    device::Close(e1).unwrap();
    device::Close(e2).unwrap();
}

#[test]
fn arp_resolves_over_wire_then_caches() {
    let _s = Serial();

    let (first, wire_first, wire_second) = KernelRunOn(0, 40, || {
        let nif = NetLookup(ELOOP0).unwrap();

        let first = ArpLookup(nif, &OurIp()).unwrap();

        // Give the daemon's reply time to drain back through the link.
        qmicro::kernel::clock::Sleep(50).unwrap();
        let wire_first = device::Control(ELOOP0, ELOOP_CTRL_NOUT, 0, 0).unwrap();

        // A second lookup answers from the cache without a wire exchange.
        let again = ArpLookup(nif, &OurIp()).unwrap();
        assert_eq!(again, first);
        let wire_second = device::Control(ELOOP0, ELOOP_CTRL_NOUT, 0, 0).unwrap();

        return (first, wire_first, wire_second);
    })
    .unwrap();

    assert_eq!(first, OurMac());
    assert_eq!(wire_first, wire_second);
}

#[test]
fn arp_lookup_unanswered_times_out() {
    let _s = Serial();

    let r = KernelRunOn(0, 40, || {
        let nif = NetLookup(ELOOP0).unwrap();
        // Nobody owns this address, so nobody answers.
        return ArpLookup(nif, &NetAddr::Ipv4(192, 168, 1, 77));
    })
    .unwrap();

    assert_eq!(r, Err(Error::Timeout));
}

#[test]
fn udp_delivers_end_to_end() {
    let _s = Serial();

    let (got, n, passive) = KernelRunOn(0, 40, || {
        let sender = UdpAlloc().unwrap();
        device::Open(
            sender,
            &OpenArgs::Udp {
                localpt: 7000,
                remotept: 7001,
                localip: Some(OurIp()),
                remoteip: Some(OurIp()),
            },
        )
        .unwrap();

        let receiver = UdpAlloc().unwrap();
        device::Open(
            receiver,
            &OpenArgs::Udp {
                localpt: 7001,
                remotept: 0,
                localip: Some(OurIp()),
                remoteip: None,
            },
        )
        .unwrap();

        assert_eq!(device::Write(sender, b"hello"), Ok(5));

        let mut buf = [0u8; 64];
        let n = device::Read(receiver, &mut buf).unwrap();
        let got = buf[..n].to_vec();

        // Same datagram again, read raw through passive mode.
        device::Control(
            receiver,
            UDP_CTRL_SETFLAG,
            UdpFlags::PASSIVE.bits() as i64,
            0,
        )
        .unwrap();
        assert_eq!(device::Write(sender, b"world"), Ok(5));
        let mut pbuf = [0u8; 128];
        let pn = device::Read(receiver, &mut pbuf).unwrap();
        let passive = pbuf[..pn].to_vec();

        device::Close(sender).unwrap();
        device::Close(receiver).unwrap();
        return (got, n, passive);
    })
    .unwrap();

    assert_eq!(n, 5);
    assert_eq!(got, b"hello".to_vec());

    // Pseudo-header + UDP header + payload.
    assert_eq!(passive.len(), 12 + 8 + 5);
    assert_eq!(&passive[0..4], &[192, 168, 1, 2]);
    assert_eq!(&passive[4..8], &[192, 168, 1, 2]);
    assert_eq!(passive[9], 17);
    assert_eq!(u16::from_be_bytes([passive[12], passive[13]]), 7000);
    assert_eq!(u16::from_be_bytes([passive[14], passive[15]]), 7001);
    assert_eq!(&passive[20..25], b"world");
}

#[test]
fn udp_noblock_read_returns_zero() {
    let _s = Serial();

    KernelRunOn(0, 40, || {
        let sock = UdpAlloc().unwrap();
        device::Open(
            sock,
            &OpenArgs::Udp {
                localpt: 9100,
                remotept: 0,
                localip: Some(OurIp()),
                remoteip: None,
            },
        )
        .unwrap();

        device::Control(sock, UDP_CTRL_SETFLAG, UdpFlags::NOBLOCK.bits() as i64, 0).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(device::Read(sock, &mut buf), Ok(0));

        device::Close(sock).unwrap();
    })
    .unwrap();
}

#[test]
fn icmp_echo_roundtrip() {
    let _s = Serial();

    let (seq, typ) = KernelRunOn(0, 40, || {
        let tid = GetTid();
        EchoQueueAlloc(tid).unwrap();

        IcmpEchoRequest(&OurIp(), tid as u16, 7).unwrap();

        // The reply's pool slot arrives as a message from the receive path.
        let msg = RecvTime(2000).unwrap();
        assert!(msg >= 0);

        let pktid = EchoQueuePop(tid).unwrap();
        assert_eq!(pktid as i64, msg);

        let (typ, seq) = WithPkt(pktid, |p| {
            let d = p.Payload();
            (d[0], u16::from_be_bytes([d[6], d[7]]))
        })
        .unwrap();

        NetFreebuf(pktid).unwrap();
        EchoQueueFree(tid).unwrap();
        return (seq, typ);
    })
    .unwrap();

    assert_eq!(typ, ICMP_ECHOREPLY);
    assert_eq!(seq, 7);
}

#[test]
fn raw_socket_carries_unclaimed_protocol() {
    let _s = Serial();

    let got = KernelRunOn(0, 40, || {
        let rawdev = device::GetDev("RAW0").unwrap();
        device::Open(
            rawdev,
            &OpenArgs::Raw {
                localip: Some(OurIp()),
                remoteip: Some(OurIp()),
                proto: 200,
            },
        )
        .unwrap();

        assert_eq!(device::Write(rawdev, b"rawdata"), Ok(7));

        let mut buf = [0u8; 32];
        let n = device::Read(rawdev, &mut buf).unwrap();
        let got = buf[..n].to_vec();

        device::Close(rawdev).unwrap();
        return got;
    })
    .unwrap();

    assert_eq!(got, b"rawdata".to_vec());
}

#[test]
fn ethloop_hold_and_drop_flags() {
    let _s = Serial();

    KernelRunOn(0, 40, || {
        device::Open(ELOOP1, &OpenArgs::None).unwrap();

        let mut frame = vec![0u8; 60];
        frame[0] = 0xaa;
        frame[59] = 0xbb;

        // HOLDNXT diverts the next frame to the hold buffer.
        device::Control(
            ELOOP1,
            ELOOP_CTRL_SETFLAG,
            EloopFlags::HOLDNXT.bits() as i64,
            0,
        )
        .unwrap();
        assert_eq!(device::Write(ELOOP1, &frame), Ok(60));

        let mut held = [0u8; 128];
        let hn = GetHold(device::DEVTAB[ELOOP1].minor, &mut held).unwrap();
        assert_eq!(hn, 60);
        assert_eq!(held[0], 0xaa);
        assert_eq!(held[59], 0xbb);

        // Dropped frames never reach the ring or the counter.
        let nout0 = device::Control(ELOOP1, ELOOP_CTRL_NOUT, 0, 0).unwrap();
        device::Control(
            ELOOP1,
            ELOOP_CTRL_SETFLAG,
            EloopFlags::DROPNXT.bits() as i64,
            0,
        )
        .unwrap();
        assert_eq!(device::Write(ELOOP1, &frame), Ok(60));
        assert_eq!(device::Control(ELOOP1, ELOOP_CTRL_NOUT, 0, 0), Ok(nout0));

        // A plain write loops straight back.
        assert_eq!(device::Write(ELOOP1, &frame), Ok(60));
        let mut back = [0u8; 128];
        assert_eq!(device::Read(ELOOP1, &mut back), Ok(60));
        assert_eq!(back[0], 0xaa);

        // Double open is refused while the device is held.
        assert_eq!(
            device::Open(ELOOP1, &OpenArgs::None),
            Err(Error::SysErr)
        );

        device::Close(ELOOP1).unwrap();
    })
    .unwrap();
}

#[test]
fn seek_is_not_supported() {
    let _s = Serial();
    assert_eq!(device::Seek(ELOOP0, 0), Err(Error::SysErr));
}
