// vim: tw=80
//! The transport executor seam: everything the core needs from whatever
//! actually carries a command to the device.

#[cfg(test)] use mockall::automock;
use std::{pin::Pin, time::Duration};

use crate::{codec::CommandBlock, sense::Completion, types::*};

/// Fixed timeout for every zone management command.
pub const CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// How many times a command reporting a busy device is reissued before it
/// is failed.
pub const CMD_RETRIES: u32 = 5;

/// Direction of the data phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    None,
    FromDevice,
    ToDevice,
}

/// Future representing an executed command.
pub type BoxTransportFut =
    Pin<Box<dyn futures::Future<Output = Result<Completion>> + Send>>;

/// An opaque "execute command" capability.
///
/// Implementations block (or suspend) the calling task until the device
/// completes the command or the timeout fires.  They fill `buf` in place
/// for [`Direction::FromDevice`] transfers and must always populate the
/// completion's sense bytes when the device returns any.
///
/// An `Err` return means the command could not be issued at all
/// ([`Error::DeviceUnavailable`], [`Error::Io`]); a device-level failure is
/// reported through the [`Completion`] and left to
/// [`crate::sense::classify`].
#[cfg_attr(test, automock)]
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        cdb: &CommandBlock,
        dir: Direction,
        buf: Option<IoVecMut>,
        timeout: Duration,
    ) -> BoxTransportFut;
}
