// vim: tw=80
//! Completion status and sense data interpretation.
//!
//! Every protocol call funnels its raw completion through [`classify`],
//! which reduces the host/driver/status byte triad plus sense bytes to a
//! small set of outcomes.

use crate::codec::{ATA_12, ATA_16};

/// Size of the sense buffer the transport must provide.
pub const SENSE_BUF_LEN: usize = 96;

/// Driver byte: sense data is valid.
const DRIVER_SENSE: u8 = 0x08;
/// SCSI status byte: CHECK CONDITION.
const STATUS_CHECK_CONDITION: u8 = 0x02;
/// SCSI status byte: BUSY.
const STATUS_BUSY: u8 = 0x08;
/// SCSI status byte: TASK SET FULL.
const STATUS_TASK_SET_FULL: u8 = 0x28;
/// Sense byte 21 signature of a well-formed ATA pass-through return.
const ATA_PASS_THROUGH_SIGNATURE: u8 = 0x50;

/// Raw completion of one executed command, as reported by the transport.
#[derive(Clone, Debug)]
pub struct Completion {
    /// Host adapter error byte; nonzero means the command never reached the
    /// device intact.
    pub host:   u8,
    /// Mid-layer driver byte; `0x08` flags valid sense data.
    pub driver: u8,
    /// SCSI status byte from the device.
    pub status: u8,
    pub sense:  [u8; SENSE_BUF_LEN],
}

impl Completion {
    /// A completion with nothing to report.
    pub fn success() -> Self {
        Completion { host: 0, driver: 0, status: 0, sense: [0; SENSE_BUF_LEN] }
    }
}

/// What a completed command amounted to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Success,
    /// The device is temporarily unable to accept the command; worth
    /// resubmitting.
    Retryable,
    /// The device or transport reported a hard failure.
    Failed,
    /// An ATA pass-through command returned sense data without the
    /// pass-through signature.
    ProtocolError,
}

/// Interpret the completion of the command whose CDB started with `opcode`.
pub fn classify(opcode: u8, c: &Completion) -> Outcome {
    if c.status == STATUS_BUSY || c.status == STATUS_TASK_SET_FULL {
        return Outcome::Retryable;
    }
    if c.host != 0
        || (c.driver != 0 && c.driver != DRIVER_SENSE)
        || (c.status != 0 && c.status != STATUS_CHECK_CONDITION)
    {
        return Outcome::Failed;
    }
    if c.driver == DRIVER_SENSE && (opcode == ATA_16 || opcode == ATA_12) {
        // ATA pass-through reports its registers through sense data; any
        // other sense layout means the pass-through itself went wrong.
        if c.sense[21] != ATA_PASS_THROUGH_SIGNATURE {
            return Outcome::ProtocolError;
        }
    } else if c.driver == DRIVER_SENSE
        && c.status == STATUS_CHECK_CONDITION
        && c.sense[0] != 0
    {
        return Outcome::Failed;
    }
    Outcome::Success
}

// LCOV_EXCL_STOP
