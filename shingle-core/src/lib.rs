// vim: tw=80

//! Runtime zone metadata and I/O safety for zoned (SMR) block devices.
//!
//! shingle tracks the zone layout and write pointers of a host-aware or
//! host-managed device, validates reads and writes against that state
//! before they're issued, and speaks both the SCSI ZBC and ATA ZAC
//! command sets to keep the state fresh.

pub mod codec;
pub mod device;
pub mod sense;
pub mod sg;
pub mod transport;
pub mod types;
pub mod validator;
pub mod zone;
pub mod zone_map;

pub use crate::types::*;
