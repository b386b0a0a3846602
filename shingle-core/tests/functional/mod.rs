// vim: tw=80
//! End-to-end tests against a simulated host-managed device.
//!
//! The simulator implements just enough of ZBC to exercise the whole
//! stack: discovery, zone map initialization, I/O validation, zone
//! actions, and background refresh.

use byteorder::{BigEndian, ByteOrder};
use futures::FutureExt;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use shingle_core::{
    codec::{
        self,
        CommandBlock,
        SameCode,
        ZoneAction,
        INQUIRY,
        REPORT_HEADER_LEN,
        ZBC_IN,
        ZBC_OUT,
        ZONE_DESCRIPTOR_LEN,
    },
    device::ZonedDevice,
    sense::Completion,
    transport::{BoxTransportFut, Direction, Transport},
    types::*,
    validator::{Decision, IoRequest, DEFER_DELAY},
    zone::ZoneCondition,
};

const ZONE_LEN: LbaT = 0x1000;

#[derive(Clone, Copy, Debug)]
struct SimZone {
    start: LbaT,
    ztype: u8,
    cond:  ZoneCondition,
    wp:    LbaT,
}

impl SimZone {
    fn end(&self) -> LbaT {
        self.start + ZONE_LEN
    }
}

/// A fake host-managed device behind the [`Transport`] seam.
struct SimDevice {
    zones: Vec<SimZone>,
}

impl SimDevice {
    /// `conv` conventional zones followed by `seq` empty sequential ones.
    fn new(conv: usize, seq: usize) -> Self {
        let mut zones = Vec::with_capacity(conv + seq);
        for i in 0..conv + seq {
            let start = i as LbaT * ZONE_LEN;
            zones.push(if i < conv {
                SimZone { start, ztype: 1, cond: ZoneCondition::NoWp,
                          wp: start }
            } else {
                SimZone { start, ztype: 2, cond: ZoneCondition::Empty,
                          wp: start }
            });
        }
        SimDevice { zones }
    }

    fn max_lba(&self) -> LbaT {
        self.zones.last().map(SimZone::end).unwrap_or(0) - 1
    }

    /// The device-side effect of a successful write.
    fn write(&mut self, lba: LbaT, sectors: u32) {
        let z = self.zones.iter_mut()
            .find(|z| lba >= z.start && lba < z.end())
            .unwrap();
        if z.ztype != 2 {
            return;
        }
        assert_eq!(lba, z.wp, "simulator got an unaligned write");
        z.wp += LbaT::from(sectors);
        z.cond = if z.wp >= z.end() {
            ZoneCondition::Full
        } else {
            ZoneCondition::ImplicitOpen
        };
    }

    fn report(&self, lba: LbaT, buf: &mut [u8]) {
        let matching = self.zones.iter()
            .filter(|z| z.end() > lba)
            .collect::<Vec<_>>();
        BigEndian::write_u32(
            &mut buf[0..4],
            (matching.len() * ZONE_DESCRIPTOR_LEN) as u32,
        );
        buf[4] = SameCode::AllSame as u8;
        BigEndian::write_u64(&mut buf[8..16], self.max_lba());
        let fits = (buf.len() - REPORT_HEADER_LEN) / ZONE_DESCRIPTOR_LEN;
        for (i, z) in matching.iter().take(fits).enumerate() {
            let off = REPORT_HEADER_LEN + i * ZONE_DESCRIPTOR_LEN;
            let d = &mut buf[off..off + ZONE_DESCRIPTOR_LEN];
            d[0] = z.ztype;
            d[1] = (z.cond as u8) << 4;
            BigEndian::write_u64(&mut d[8..16], ZONE_LEN);
            BigEndian::write_u64(&mut d[16..24], z.start);
            BigEndian::write_u64(&mut d[24..32], z.wp);
        }
    }

    fn action(&mut self, action: ZoneAction, lba: LbaT, all: bool) {
        for z in self.zones.iter_mut() {
            if z.ztype != 2 || (!all && !(lba >= z.start && lba < z.end())) {
                continue;
            }
            match action {
                ZoneAction::ResetWp => {
                    z.wp = z.start;
                    z.cond = ZoneCondition::Empty;
                }
                ZoneAction::Finish => {
                    z.wp = z.end();
                    z.cond = ZoneCondition::Full;
                }
                ZoneAction::Open => z.cond = ZoneCondition::ExplicitOpen,
                ZoneAction::Close => z.cond = ZoneCondition::Closed,
            }
        }
    }
}

#[derive(Clone)]
struct SimTransport(Arc<Mutex<SimDevice>>);

impl Transport for SimTransport {
    fn execute(
        &self,
        cdb: &CommandBlock,
        _dir: Direction,
        buf: Option<IoVecMut>,
        _timeout: Duration,
    ) -> BoxTransportFut {
        let dev = self.0.clone();
        let cdb = *cdb;
        async move {
            let mut dev = dev.lock().unwrap();
            match cdb.opcode() {
                ZBC_IN => {
                    let lba = BigEndian::read_u64(&cdb.as_slice()[2..10]);
                    let mut buf = buf.ok_or(Error::InvalidCommand)?;
                    dev.report(lba, &mut buf[..]);
                }
                ZBC_OUT => {
                    let (action, lba, all) = codec::decode_zone_action(&cdb)?;
                    dev.action(action, lba, all);
                }
                INQUIRY => {
                    let mut buf = buf.ok_or(Error::InvalidCommand)?;
                    // Block Device Characteristics: host-managed
                    buf[8] = 0x2 << 4;
                }
                _ => return Err(Error::InvalidCommand),
            }
            Ok(Completion::success())
        }.boxed()
    }
}

fn harness(conv: usize, seq: usize)
    -> (Arc<Mutex<SimDevice>>, Arc<ZonedDevice>)
{
    let sim = Arc::new(Mutex::new(SimDevice::new(conv, seq)));
    let transport = Arc::new(SimTransport(sim.clone()));
    let dev = ZonedDevice::new(transport, false, ZonedModel::NotZoned);
    (sim, dev)
}

#[tokio::test]
async fn discovery_and_initialization() {
    let (_sim, dev) = harness(2, 6);
    assert_eq!(dev.identify().await.unwrap(), ZonedModel::HostManaged);
    dev.init_zones().await.unwrap();
    let map = dev.map();
    assert_eq!(map.len(), 8);
    assert_eq!(map.zone_len(), Some(ZONE_LEN));
    assert_eq!(map.max_lba(), Some(8 * ZONE_LEN - 1));
    let z = map.lookup(0).unwrap();
    assert!(z.lock().unwrap().is_conventional());
    let z = map.lookup(3 * ZONE_LEN).unwrap();
    assert!(z.lock().unwrap().is_seq());
}

#[tokio::test]
async fn sequential_write_lifecycle() {
    let (sim, dev) = harness(0, 2);
    dev.identify().await.unwrap();
    dev.init_zones().await.unwrap();
    let v = dev.validator();

    // Write the whole first zone, 256 sectors at a time.
    for i in 0..(ZONE_LEN / 256) {
        let lba = i * 256;
        let mut req = IoRequest::write(lba, 256);
        assert_eq!(v.check(&mut req), Decision::Allow, "lba {lba:#x}");
        sim.lock().unwrap().write(lba, 256);
        dev.update_wp(lba, lba + 256);
        dev.quiesce().await;
    }
    let z = dev.map().lookup(0).unwrap();
    assert_eq!(z.lock().unwrap().condition, ZoneCondition::Full);

    // The zone is now full; further writes are rejected.
    let mut req = IoRequest::write(0, 8);
    assert_eq!(v.check(&mut req),
               Decision::Reject(Error::ZoneFull { lba: 0 }));

    // The second zone only accepts writes at its write pointer.
    let mut req = IoRequest::write(ZONE_LEN + 8, 8);
    assert_eq!(
        v.check(&mut req),
        Decision::Reject(Error::Misaligned { lba: ZONE_LEN + 8,
                                             wp: ZONE_LEN })
    );
}

#[tokio::test]
async fn reads_against_the_write_pointer() {
    let (sim, dev) = harness(0, 1);
    dev.identify().await.unwrap();
    sim.lock().unwrap().write(0, 0x100);
    dev.init_zones().await.unwrap();
    let v = dev.validator();

    let mut req = IoRequest::read(0, 0x100);
    assert_eq!(v.check(&mut req), Decision::Allow);
    // Unwritten sectors complete without touching the device.
    let mut req = IoRequest::read(0x100, 8);
    assert_eq!(v.check(&mut req), Decision::Done);
}

#[tokio::test]
async fn reset_makes_a_zone_writable_again() {
    let (_sim, dev) = harness(0, 2);
    dev.identify().await.unwrap();
    dev.init_zones().await.unwrap();

    dev.zone_action(ZoneAction::Finish, 0, false).await.unwrap();
    dev.quiesce().await;
    {
        let z = dev.map().lookup(0).unwrap();
        let z = z.lock().unwrap();
        assert_eq!(z.condition, ZoneCondition::Full);
        assert_eq!(z.wp, ZONE_LEN);
    }

    dev.zone_action(ZoneAction::ResetWp, 0, false).await.unwrap();
    dev.quiesce().await;
    {
        let z = dev.map().lookup(0).unwrap();
        let z = z.lock().unwrap();
        assert_eq!(z.condition, ZoneCondition::Empty);
        assert_eq!(z.wp, 0);
    }

    let v = dev.validator();
    let mut req = IoRequest::write(0, 8);
    assert_eq!(v.check(&mut req), Decision::Allow);
}

#[tokio::test]
async fn reset_all_empties_every_zone() {
    let (sim, dev) = harness(1, 3);
    dev.identify().await.unwrap();
    for i in 1..4 {
        sim.lock().unwrap().write(i * ZONE_LEN, 64);
    }
    dev.init_zones().await.unwrap();

    dev.zone_action(ZoneAction::ResetWp, 0, true).await.unwrap();
    dev.quiesce().await;
    dev.map().for_each(|z| {
        if z.is_seq() {
            assert_eq!(z.condition, ZoneCondition::Empty);
            assert_eq!(z.wp, z.start);
        }
    });
}

#[tokio::test]
async fn refresh_recovers_from_external_changes() {
    let (sim, dev) = harness(0, 2);
    dev.identify().await.unwrap();
    dev.init_zones().await.unwrap();
    let v = dev.validator();

    // Another initiator wrote to the zone behind our back.
    sim.lock().unwrap().write(0, 0x200);
    dev.refresh(0);
    // Until the refresh lands, I/O to the zone defers.
    let mut req = IoRequest::write(0, 8);
    assert_eq!(v.check(&mut req), Decision::Defer(DEFER_DELAY));
    dev.quiesce().await;

    let mut req = IoRequest::write(0x200, 8);
    assert_eq!(v.check(&mut req), Decision::Allow);
}

#[tokio::test]
async fn mixed_layout_two_zone_scenario() {
    // A sequential zone followed by a conventional one.
    let sim = Arc::new(Mutex::new(SimDevice {
        zones: vec![
            SimZone { start: 0, ztype: 2, cond: ZoneCondition::Empty,
                      wp: 0 },
            SimZone { start: ZONE_LEN, ztype: 1, cond: ZoneCondition::NoWp,
                      wp: ZONE_LEN },
        ],
    }));
    let transport = Arc::new(SimTransport(sim));
    let dev = ZonedDevice::new(transport, false, ZonedModel::NotZoned);
    dev.identify().await.unwrap();
    dev.init_zones().await.unwrap();
    let v = dev.validator();

    let mut req = IoRequest::write(0, 8);
    assert_eq!(v.check(&mut req), Decision::Allow);
    assert_eq!(dev.map().lookup(0).unwrap().lock().unwrap().wp, 8);
    let mut req = IoRequest::write(0, 8);
    assert_eq!(v.check(&mut req),
               Decision::Reject(Error::Misaligned { lba: 0, wp: 8 }));
    // Conventional zones take reads and writes anywhere.
    let mut req = IoRequest::read(ZONE_LEN + 6, 2);
    assert_eq!(v.check(&mut req), Decision::Allow);
    let mut req = IoRequest::write(ZONE_LEN + 100, 8);
    assert_eq!(v.check(&mut req), Decision::Allow);
}

#[tokio::test]
async fn teardown_forgets_the_device() {
    let (_sim, dev) = harness(0, 2);
    dev.identify().await.unwrap();
    dev.init_zones().await.unwrap();
    dev.close().await;
    assert!(dev.map().is_empty());
    let v = dev.validator();
    let mut req = IoRequest::read(0, 8);
    // Zoned device with an unpopulated map: hold I/O until re-init.
    assert_eq!(v.check(&mut req), Decision::Defer(DEFER_DELAY));
}
