// vim: tw=80
//! Pre-dispatch I/O validation against the zone map.
//!
//! Every read and write headed for a zoned device passes through
//! [`IoValidator::check`] before it may be issued.  The validator never
//! touches the device itself; it only consults (and speculatively updates)
//! the in-memory zone state.

use std::{sync::Arc, time::Duration};

use crate::{
    types::*,
    zone::{RuntimeState, Zone, ZoneCondition, ZoneType},
    zone_map::ZoneMap,
};

/// How long a deferred request should wait before being rechecked.  Long
/// enough for an in-flight refresh to land, short enough not to starve the
/// queue.
pub const DEFER_DELAY: Duration = Duration::from_millis(5);

/// One candidate I/O, as seen by the validator.
#[derive(Clone, Copy, Debug)]
pub struct IoRequest {
    pub lba:     LbaT,
    pub sectors: u32,
    pub write:   bool,
    /// Set by the caller when it requeues this write behind a staged
    /// write pointer correction (see `ZonedDevice::update_wp`); cleared
    /// when the requeue path fires so the race can't loop forever.
    pub wp_update_pending: bool,
}

impl IoRequest {
    pub fn read(lba: LbaT, sectors: u32) -> Self {
        IoRequest { lba, sectors, write: false, wp_update_pending: false }
    }

    pub fn write(lba: LbaT, sectors: u32) -> Self {
        IoRequest { lba, sectors, write: true, wp_update_pending: false }
    }
}

/// The validator's verdict on one request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    /// Dispatch to the device.
    Allow,
    /// Complete immediately without touching the device: a read at or past
    /// the write pointer returns zeroes.
    Done,
    /// Put the request back at the head of the queue and recheck once the
    /// racing write pointer update has settled.
    Requeue,
    /// Zone state is unknown or being refreshed; retry after the given
    /// delay.
    Defer(Duration),
    /// The request can never succeed; fail it with the given error.
    Reject(Error),
}

/// Validates I/O against a shared [`ZoneMap`].
#[derive(Debug)]
pub struct IoValidator {
    map:   Arc<ZoneMap>,
    /// Whether the underlying device is host-aware or host-managed.  A
    /// non-zoned device short-circuits every check to [`Decision::Allow`].
    zoned: bool,
}

impl IoValidator {
    pub fn new(map: Arc<ZoneMap>, model: ZonedModel) -> Self {
        IoValidator { map, zoned: model.is_zoned() }
    }

    /// Judge one request.  May update the zone's speculative write pointer
    /// when it allows a sequential write.
    ///
    /// On [`Decision::Defer`] the caller should kick a refresh for
    /// `req.lba` and recheck after [`DEFER_DELAY`].
    pub fn check(&self, req: &mut IoRequest) -> Decision {
        if !self.zoned {
            return Decision::Allow;
        }
        let zone = match self.map.lookup(req.lba) {
            Some(z) => z,
            None if self.map.is_empty() => {
                // The map hasn't been populated yet; hold the request until
                // initialization finishes.
                return Decision::Defer(DEFER_DELAY);
            }
            None => {
                tracing::warn!(lba = req.lba, "I/O beyond the last zone");
                return Decision::Reject(Error::InvalidCommand);
            }
        };
        let mut zone = zone.lock().unwrap();
        if zone.state != RuntimeState::Tracked {
            // A concurrent refresh is about to overwrite this record;
            // don't let the cache hand it out again in the meantime.
            drop(zone);
            self.map.invalidate_cache();
            return Decision::Defer(DEFER_DELAY);
        }
        if req.lba + LbaT::from(req.sectors) > zone.end() {
            // No request may span zones; the device would fault the part
            // beyond the boundary, so the caller must split it first.
            return Decision::Reject(Error::CrossesZone {
                lba: req.lba,
                end: zone.end(),
            });
        }
        if !zone.is_seq() {
            // Conventional zones accept anything.  Sequential-preferred
            // zones accept anything too, but their write pointer still
            // tracks aligned writes.
            if req.write
                && zone.zone_type == ZoneType::SeqWritePreferred
                && !zone.is_full()
                && req.lba == zone.wp
            {
                zone.advance_wp(req.sectors);
            }
            return Decision::Allow;
        }
        if req.write {
            self.check_write(req, &mut zone)
        } else {
            self.check_read(req, &zone)
        }
    }

    fn check_write(&self, req: &mut IoRequest, zone: &mut Zone) -> Decision {
        if req.wp_update_pending
            && zone.wp < req.lba
            && req.lba < zone.shadow_wp
        {
            // A pointer correction for an earlier write is still in
            // flight, and this write falls inside its window.  Requeue
            // once; if the window hasn't closed by the recheck the write
            // really is misaligned.
            tracing::warn!(lba = req.lba, wp = zone.wp,
                           shadow_wp = zone.shadow_wp,
                           "non-sequential write race, requeueing");
            req.wp_update_pending = false;
            return Decision::Requeue;
        }
        if zone.is_full() {
            return Decision::Reject(Error::ZoneFull { lba: req.lba });
        }
        if req.lba == zone.wp {
            zone.advance_wp(req.sectors);
            return Decision::Allow;
        }
        Decision::Reject(Error::Misaligned { lba: req.lba, wp: zone.wp })
    }

    fn check_read(&self, req: &IoRequest, zone: &Zone) -> Decision {
        // Reading unwritten sectors of a sequential zone is satisfied with
        // zeroes; some devices fault on it instead.
        if req.lba >= zone.wp && zone.condition != ZoneCondition::Full {
            Decision::Done
        } else {
            Decision::Allow
        }
    }
}

// LCOV_EXCL_STOP
