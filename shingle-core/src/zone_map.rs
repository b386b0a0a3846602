// vim: tw=80
//! The zone map: an ordered index of every zone the device has reported,
//! keyed by start LBA, plus a one-entry lookup cache.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    types::*,
    zone::{RuntimeState, Zone},
};

/// Shared, mutable index over all known zones.
///
/// Each record is held behind its own `Mutex` so a zone can be checked and
/// updated without stalling lookups elsewhere in the map.  The map itself
/// is only write-locked for insertion and wholesale invalidation.
#[derive(Debug, Default)]
pub struct ZoneMap {
    zones:    RwLock<BTreeMap<LbaT, Arc<Mutex<Zone>>>>,
    /// Start LBA of the most recently looked-up zone.  I/O streams hit the
    /// same zone many times in a row, so this saves most tree walks.
    cache:    Mutex<Option<LbaT>>,
    /// Uniform zone length, if every zone reported so far shares one.
    zone_len: Mutex<Option<LbaT>>,
    /// One past the highest addressable LBA, from the report header.
    max_lba:  Mutex<Option<LbaT>>,
}

impl ZoneMap {
    pub fn new() -> Self {
        ZoneMap::default()
    }

    /// Find the zone containing `lba`, if any.
    ///
    /// Checks the cache first, then walks the tree and refreshes the cache
    /// on a hit.
    pub fn lookup(&self, lba: LbaT) -> Option<Arc<Mutex<Zone>>> {
        let zones = self.zones.read().unwrap();
        // Copy the cache out so its lock isn't held across the zone lock.
        let cached = *self.cache.lock().unwrap();
        if let Some(start) = cached {
            if let Some(z) = zones.get(&start) {
                if z.lock().unwrap().contains(lba) {
                    return Some(z.clone());
                }
            }
        }
        let (start, z) = zones.range(..=lba).next_back()?;
        if z.lock().unwrap().contains(lba) {
            *self.cache.lock().unwrap() = Some(*start);
            Some(z.clone())
        } else {
            None
        }
    }

    /// Insert `zone` into the map.
    ///
    /// If any existing zone overlaps the new one's extent, the map is left
    /// unchanged and the existing record is returned instead.
    pub fn insert(&self, zone: Zone) -> Option<Arc<Mutex<Zone>>> {
        let mut zones = self.zones.write().unwrap();
        let start = zone.start;
        let end = zone.end();
        if let Some((_, z)) = zones.range(..=start).next_back() {
            if z.lock().unwrap().end() > start {
                return Some(z.clone());
            }
        }
        if let Some((_, z)) = zones.range(start..).next() {
            if z.lock().unwrap().start < end {
                return Some(z.clone());
            }
        }
        zones.insert(start, Arc::new(Mutex::new(zone)));
        None
    }

    /// Number of zones currently indexed.
    pub fn len(&self) -> usize {
        self.zones.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.read().unwrap().is_empty()
    }

    /// Mark every sequential zone at or beyond the one containing `lba` as
    /// [`RuntimeState::Busy`], pending a refresh.  Conventional zones never
    /// go busy since their contents don't depend on a write pointer.
    ///
    /// Drops the lookup cache, since cached state may be about to change.
    pub fn mark_busy(&self, lba: LbaT) {
        let zones = self.zones.read().unwrap();
        let from = match zones.range(..=lba).next_back() {
            Some((start, z)) if z.lock().unwrap().contains(lba) => *start,
            _ => lba,
        };
        for z in zones.range(from..).map(|(_, z)| z) {
            let mut zone = z.lock().unwrap();
            if zone.is_seq() {
                zone.state = RuntimeState::Busy;
            }
        }
        self.invalidate_cache();
    }

    /// Forget all volatile zone state, keeping the geometry.  Every zone
    /// reverts to [`RuntimeState::Unknown`] until the next refresh.
    pub fn reset_all(&self) {
        let zones = self.zones.read().unwrap();
        for z in zones.values() {
            z.lock().unwrap().forget();
        }
        self.invalidate_cache();
    }

    /// Remove every record.  Used on teardown and full re-initialization.
    pub fn drop_all(&self) {
        self.zones.write().unwrap().clear();
        self.invalidate_cache();
        *self.zone_len.lock().unwrap() = None;
        *self.max_lba.lock().unwrap() = None;
    }

    pub fn invalidate_cache(&self) {
        *self.cache.lock().unwrap() = None;
    }

    /// Record the uniform zone length, once known.
    pub fn set_zone_len(&self, len: LbaT) {
        *self.zone_len.lock().unwrap() = Some(len);
    }

    pub fn zone_len(&self) -> Option<LbaT> {
        *self.zone_len.lock().unwrap()
    }

    /// Record the device capacity, from a report header.
    pub fn set_max_lba(&self, lba: LbaT) {
        *self.max_lba.lock().unwrap() = Some(lba);
    }

    pub fn max_lba(&self) -> Option<LbaT> {
        *self.max_lba.lock().unwrap()
    }

    /// Run `f` over every zone in ascending start order.
    pub fn for_each<F: FnMut(&Zone)>(&self, mut f: F) {
        let zones = self.zones.read().unwrap();
        for z in zones.values() {
            f(&z.lock().unwrap());
        }
    }
}

// LCOV_EXCL_STOP
