// vim: tw=80
//! Common type definitions used throughout shingle

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use thiserror::Error;
use std::io;

/// Indexes an LBA.  Zoned devices address 512-byte logical sectors.
pub type LbaT = u64;

/// Indexes a device's zones.
pub type ZoneT = u32;

/// Size of one logical sector, in bytes.
pub const BYTES_PER_SECTOR: usize = 512;

/// Sentinel write pointer value for zones that don't have one.
pub const NO_WP: LbaT = LbaT::MAX;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// shingle's error type.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// The device could not be opened, or the transport is gone.
    #[error("device unavailable")]
    DeviceUnavailable,

    /// The device completed the command with an unrecoverable error.
    #[error("command {opcode:#04x} failed")]
    CommandFailed { opcode: u8 },

    /// The sense data returned for an ATA pass-through command did not carry
    /// the pass-through signature.
    #[error("ATA pass-through protocol error")]
    PassThroughProtocol,

    /// Could not allocate a transfer buffer, even after degrading.
    #[error("cannot allocate memory")]
    NoMemory,

    /// A write to a sequential zone did not land on the write pointer.
    #[error("misaligned write at lba {lba} (wp {wp})")]
    Misaligned { lba: LbaT, wp: LbaT },

    /// A write was directed at a zone whose condition is Full.
    #[error("write to full zone at lba {lba}")]
    ZoneFull { lba: LbaT },

    /// An I/O runs past the end of its zone.
    #[error("I/O at lba {lba} crosses the zone boundary at {end}")]
    CrossesZone { lba: LbaT, end: LbaT },

    /// The device does not report itself as zoned.
    #[error("not a zoned device")]
    NotZoned,

    /// A report or descriptor buffer was too short to decode.
    #[error("truncated report data")]
    TruncatedReport,

    /// A command block was not one of ours, or used a reserved encoding.
    #[error("invalid or unsupported command block")]
    InvalidCommand,

    /// A zone descriptor used a reserved type or condition code.
    #[error("malformed zone descriptor")]
    BadDescriptor,

    /// An operating system error from the transport.
    #[error("I/O error: {0}")]
    Io(nix::errno::Errno),
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Error::Io(nix::errno::Errno::from_raw(errno)),
            None => Error::DeviceUnavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What kind of zoned device is this, per IDENTIFY DEVICE word 138 or the
/// Block Device Characteristics VPD page?
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum ZonedModel {
    /// Not a zoned device, or zoning is not reported.
    NotZoned    = 0,
    /// Sequential-write-preferred zones; nonsequential writes are accepted.
    HostAware   = 1,
    /// Sequential-write-required zones; nonsequential writes are rejected.
    HostManaged = 2,
}

impl ZonedModel {
    /// Is the zone map expected to cover this device?
    pub fn is_zoned(self) -> bool {
        self != ZonedModel::NotZoned
    }
}

// LCOV_EXCL_STOP
