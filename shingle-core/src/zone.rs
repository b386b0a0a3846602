// vim: tw=80
//! In-memory zone records and their lifecycle.

use enum_primitive_derive::Primitive;

use crate::{codec::ZoneDescriptor, types::*};

/// Zone type, from the low nibble of descriptor byte 0.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum ZoneType {
    /// No write pointer; random writes allowed.
    Conventional      = 1,
    /// Writes must land exactly on the write pointer.
    SeqWriteRequired  = 2,
    /// Sequential writes preferred but not enforced.
    SeqWritePreferred = 3,
}

/// Device-reported zone condition, from the high nibble of descriptor byte 1.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum ZoneCondition {
    NoWp         = 0x0,
    Empty        = 0x1,
    ImplicitOpen = 0x2,
    ExplicitOpen = 0x3,
    Closed       = 0x4,
    ReadOnly     = 0xd,
    Full         = 0xe,
    Offline      = 0xf,
}

impl ZoneCondition {
    pub fn is_open(self) -> bool {
        matches!(self, ZoneCondition::ImplicitOpen | ZoneCondition::ExplicitOpen)
    }
}

/// Our own tracking state for a zone, orthogonal to the device-reported
/// condition.
///
/// Zone runtime lifecycle:
///
/// +---------+
/// | Unknown |<---------------------+
/// +---------+                      |
///     |                            | reset / re-initialization
///     | refresh issued             |
///     V                            |
/// +---------+                      |
/// |  Busy   |                      |
/// +---------+                      |
///     |                            |
///     | report merged              |
///     V                            |
/// +---------+                      |
/// | Tracked |----------------------+
/// +---------+
///
/// While a zone is `Unknown` or `Busy` the validator must defer all I/O to
/// it; only `Tracked` zones have trustworthy fields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeState {
    Unknown,
    Busy,
    Tracked,
}

/// Minimal in-memory representation of one zone on the device.
///
/// Owned exclusively by the `ZoneMap`; all other components access it
/// through `Arc<Mutex<Zone>>` handles for the duration of a single
/// check-and-update.
#[derive(Clone, Debug)]
pub struct Zone {
    /// First LBA of the zone.  Never changes.
    pub start:     LbaT,
    /// Total number of sectors in the zone.  Never changes.
    pub length:    LbaT,
    pub zone_type: ZoneType,
    pub condition: ZoneCondition,
    /// Next LBA eligible for a sequential write.  `NO_WP` for conventional
    /// zones.
    pub wp:        LbaT,
    /// Last externally confirmed write pointer.  Detects in-flight WP
    /// advances racing a stale report.
    pub shadow_wp: LbaT,
    pub state:     RuntimeState,
    /// Device-reported "reset recommended" flag.
    pub reset:     bool,
    /// Device-reported "written non-sequentially" flag.
    pub non_seq:   bool,
}

impl Zone {
    /// Build a freshly tracked zone from a decoded report descriptor.
    pub fn from_descriptor(desc: &ZoneDescriptor) -> Self {
        Zone {
            start:     desc.start,
            length:    desc.length,
            zone_type: desc.zone_type,
            condition: desc.condition,
            wp:        desc.wp,
            shadow_wp: desc.wp,
            state:     RuntimeState::Tracked,
            reset:     desc.reset,
            non_seq:   desc.non_seq,
        }
    }

    /// Does this zone enforce sequential writes at the write pointer?
    pub fn is_seq(&self) -> bool {
        self.zone_type == ZoneType::SeqWriteRequired
    }

    pub fn is_conventional(&self) -> bool {
        self.zone_type == ZoneType::Conventional
    }

    pub fn is_full(&self) -> bool {
        self.condition == ZoneCondition::Full
    }

    /// First LBA beyond the zone.
    pub fn end(&self) -> LbaT {
        self.start + self.length
    }

    pub fn contains(&self, lba: LbaT) -> bool {
        lba >= self.start && lba < self.end()
    }

    /// Account for a successful sequential write of `sectors` at the write
    /// pointer, moving the condition along `Empty -> ImplicitOpen -> Full`.
    pub fn advance_wp(&mut self, sectors: u32) {
        debug_assert!(!self.is_conventional());
        self.wp += LbaT::from(sectors);
        if self.condition == ZoneCondition::Empty {
            self.condition = ZoneCondition::ImplicitOpen;
        }
        if self.wp >= self.end() {
            self.wp = self.end();
            self.condition = ZoneCondition::Full;
        }
    }

    /// Overwrite this record's volatile fields with freshly reported ones.
    /// Used when a report collides with a `Busy`/`Unknown` record.
    pub fn merge_from(&mut self, desc: &ZoneDescriptor) {
        self.condition = desc.condition;
        self.wp = desc.wp;
        self.shadow_wp = desc.wp;
        self.reset = desc.reset;
        self.non_seq = desc.non_seq;
        self.state = RuntimeState::Tracked;
    }

    /// Forget everything the device told us about this zone.  Used on
    /// re-initialization, e.g. after a reset-write-pointer-all.
    pub fn forget(&mut self) {
        self.wp = NO_WP;
        self.shadow_wp = NO_WP;
        self.state = RuntimeState::Unknown;
    }
}

// LCOV_EXCL_STOP
