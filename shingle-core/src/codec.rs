// vim: tw=80
//! Wire-format construction and parsing for ZBC (SCSI) and ZAC (ATA
//! pass-through) zone management commands.
//!
//! Everything here is pure: no I/O, no state.  The transport layer feeds
//! these command blocks to the device and hands raw result buffers back for
//! decoding.

use byteorder::{BigEndian, ByteOrder};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use crate::{
    types::*,
    zone::{ZoneCondition, ZoneType},
};

/// SCSI ZBC IN opcode (REPORT ZONES lives here).
pub const ZBC_IN: u8 = 0x95;
/// SCSI ZBC OUT opcode (zone actions live here).
pub const ZBC_OUT: u8 = 0x94;
/// ZBC IN service action: REPORT ZONES.
pub const ZI_REPORT_ZONES: u8 = 0x00;
/// SCSI INQUIRY opcode.
pub const INQUIRY: u8 = 0x12;

/// ATA PASS-THROUGH (16) opcode.
pub const ATA_16: u8 = 0x85;
/// ATA PASS-THROUGH (12) opcode.
pub const ATA_12: u8 = 0xa1;
/// ATA ZAC MANAGEMENT IN command (report zones).
pub const ATA_CMD_ZAC_MGMT_IN: u8 = 0x4a;
/// ATA ZAC MANAGEMENT OUT command (zone actions).
pub const ATA_CMD_ZAC_MGMT_OUT: u8 = 0x9f;
/// ATA IDENTIFY DEVICE command.
pub const ATA_CMD_ID_ATA: u8 = 0xec;
/// ZAC MANAGEMENT IN feature sub-command: REPORT ZONES EXT.
const ATA_SUBCMD_REPORT_ZONES: u8 = 0x00;

// SAT protocol field values for ATA PASS-THROUGH byte 1.
const PROT_NON_DATA: u8 = 3;
const PROT_PIO_IN: u8 = 4;

/// Size of a REPORT ZONES result header and of each zone descriptor.
pub const REPORT_HEADER_LEN: usize = 64;
pub const ZONE_DESCRIPTOR_LEN: usize = 64;

/// Size of an ATA IDENTIFY DEVICE result.
pub const IDENTIFY_LEN: usize = 512;

/// Only the low 48 bits of a reported LBA are significant.
const LBA_MASK: u64 = (1 << 48) - 1;

/// Zone management actions shared by ZBC OUT and ZAC MANAGEMENT OUT.  The
/// discriminants are the on-wire sub-command codes, identical for both
/// command sets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum ZoneAction {
    Close   = 0x01,
    Finish  = 0x02,
    Open    = 0x03,
    ResetWp = 0x04,
}

/// REPORT ZONES reporting options: which zone conditions to include.
///
/// The top bit of the raw option byte (0x80) is reserved by callers as the
/// "use ATA pass-through" selector; it is never part of this enum and never
/// reaches the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum ReportOption {
    /// All zones.
    All          = 0x00,
    Empty        = 0x01,
    ImplicitOpen = 0x02,
    ExplicitOpen = 0x03,
    Closed       = 0x04,
    Full         = 0x05,
    ReadOnly     = 0x06,
    Offline      = 0x07,
    /// Zones with the "reset recommended" flag set.
    NeedReset    = 0x10,
    /// Zones written non-sequentially.
    NonSeq       = 0x11,
    /// Zones without a write pointer.
    NonWp        = 0x3f,
}

/// The "same" code from a REPORT ZONES header: may the caller assume a
/// uniform zone length?
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum SameCode {
    AllDifferent       = 0,
    AllSame            = 1,
    LastDiffers        = 2,
    SameLengthDiffType = 3,
}

impl SameCode {
    /// Do all zones (except possibly the last) share one length?
    pub fn uniform_length(self) -> bool {
        matches!(self, SameCode::AllSame | SameCode::SameLengthDiffType)
    }
}

/// A fixed-layout command block, ready for the transport.  ZBC and ZAC
/// commands use 16-byte CDBs; INQUIRY uses 6.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommandBlock {
    bytes: [u8; 16],
    len:   u8,
}

impl CommandBlock {
    fn new(len: u8) -> Self {
        CommandBlock { bytes: [0; 16], len }
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// Decoded REPORT ZONES result header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReportHeader {
    /// Length in bytes of the zone descriptor list the device wanted to
    /// return.  May exceed what fit into the transfer buffer.
    pub list_bytes: u32,
    pub same:       SameCode,
    /// LBA of the last logical sector on the device.
    pub max_lba:    LbaT,
}

impl ReportHeader {
    /// How many descriptors did the device declare, fitted or not?
    pub fn nr_zones(&self) -> u32 {
        self.list_bytes / ZONE_DESCRIPTOR_LEN as u32
    }
}

/// One decoded 64-byte zone descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneDescriptor {
    pub zone_type: ZoneType,
    pub condition: ZoneCondition,
    pub reset:     bool,
    pub non_seq:   bool,
    /// Zone length in sectors.
    pub length:    LbaT,
    pub start:     LbaT,
    /// Write pointer, normalized; `NO_WP` when the zone has none.
    pub wp:        LbaT,
}

/// Pack an LBA into the alternating low/mid/high register slots of an
/// ATA-16 CDB, bytes 7-12.
fn lba_to_ata(cmd: &mut [u8], lba: LbaT) {
    cmd[1] = lba as u8;
    cmd[3] = (lba >> 8) as u8;
    cmd[5] = (lba >> 16) as u8;
    cmd[0] = (lba >> 24) as u8;
    cmd[2] = (lba >> 32) as u8;
    cmd[4] = (lba >> 40) as u8;
}

fn ata_to_lba(cmd: &[u8]) -> LbaT {
    LbaT::from(cmd[1])
        | LbaT::from(cmd[3]) << 8
        | LbaT::from(cmd[5]) << 16
        | LbaT::from(cmd[0]) << 24
        | LbaT::from(cmd[2]) << 32
        | LbaT::from(cmd[4]) << 40
}

/// ATA-16 byte 1: multiple count [7:5], protocol [4:1], extend [0].
fn ata16_byte1(multiple: u8, protocol: u8, extend: u8) -> u8 {
    ((multiple & 0x7) << 5) | ((protocol & 0xf) << 1) | (extend & 0x1)
}

/// Build a zone management command (close, finish, open, or reset write
/// pointer).  With `all` set the action applies to every zone on the device
/// and `start_lba` is ignored.
pub fn encode_zone_action(
    action: ZoneAction,
    start_lba: LbaT,
    all: bool,
    ata: bool,
) -> CommandBlock {
    let mut cmd = CommandBlock::new(16);
    if ata {
        cmd.bytes[0] = ATA_16;
        cmd.bytes[1] = ata16_byte1(0, PROT_NON_DATA, 1);
        // check-condition bit: read the registers back on completion
        cmd.bytes[2] = 1 << 5;
        if all {
            // feature MSB: apply to all zones
            cmd.bytes[3] = 0x1;
        } else {
            lba_to_ata(&mut cmd.bytes[7..13], start_lba);
        }
        cmd.bytes[4] = action as u8;
        cmd.bytes[13] = 1 << 6;
        cmd.bytes[14] = ATA_CMD_ZAC_MGMT_OUT;
    } else {
        cmd.bytes[0] = ZBC_OUT;
        cmd.bytes[1] = action as u8;
        if !all {
            BigEndian::write_u64(&mut cmd.bytes[2..10], start_lba);
        }
        cmd.bytes[14] = u8::from(all);
    }
    cmd
}

/// Recover the `(action, start_lba, all)` triple from a zone management
/// command block, for either encoding.
pub fn decode_zone_action(cmd: &CommandBlock) -> Result<(ZoneAction, LbaT, bool)> {
    match cmd.opcode() {
        ZBC_OUT => {
            let action = ZoneAction::from_u8(cmd.bytes[1])
                .ok_or(Error::InvalidCommand)?;
            let all = cmd.bytes[14] & 0x1 != 0;
            let lba = BigEndian::read_u64(&cmd.bytes[2..10]);
            Ok((action, lba, all))
        }
        ATA_16 if cmd.bytes[14] == ATA_CMD_ZAC_MGMT_OUT => {
            let action = ZoneAction::from_u8(cmd.bytes[4])
                .ok_or(Error::InvalidCommand)?;
            let all = cmd.bytes[3] & 0x1 != 0;
            let lba = ata_to_lba(&cmd.bytes[7..13]);
            Ok((action, lba, all))
        }
        _ => Err(Error::InvalidCommand),
    }
}

/// Build a REPORT ZONES command requesting zones starting at `start_lba`.
/// `buflen` is the size of the transfer buffer in bytes; for the ATA
/// encoding it must be a multiple of 512.
pub fn encode_report(
    start_lba: LbaT,
    opt: ReportOption,
    buflen: u32,
    ata: bool,
) -> CommandBlock {
    // 0x80 is the ATA pass-through selector in ioctl interfaces; it must
    // never reach the device.
    let opt = (opt as u8) & 0x7f;
    let mut cmd = CommandBlock::new(16);
    if ata {
        let sectors = buflen / BYTES_PER_SECTOR as u32;
        cmd.bytes[0] = ATA_16;
        cmd.bytes[1] = ata16_byte1(0, PROT_PIO_IN, 1);
        // from-device, 512-byte blocks, length in the sector count field
        cmd.bytes[2] = 0x0e;
        cmd.bytes[3] = opt;
        cmd.bytes[4] = ATA_SUBCMD_REPORT_ZONES;
        cmd.bytes[5] = (sectors >> 8) as u8;
        cmd.bytes[6] = sectors as u8;
        lba_to_ata(&mut cmd.bytes[7..13], start_lba);
        cmd.bytes[13] = 1 << 6;
        cmd.bytes[14] = ATA_CMD_ZAC_MGMT_IN;
    } else {
        cmd.bytes[0] = ZBC_IN;
        cmd.bytes[1] = ZI_REPORT_ZONES;
        BigEndian::write_u64(&mut cmd.bytes[2..10], start_lba);
        BigEndian::write_u32(&mut cmd.bytes[10..14], buflen);
        cmd.bytes[14] = opt;
    }
    cmd
}

/// Build an ATA IDENTIFY DEVICE command via pass-through.  The result is a
/// 512-byte buffer for [`decode_identify`].
pub fn encode_identify() -> CommandBlock {
    let mut cmd = CommandBlock::new(16);
    cmd.bytes[0] = ATA_16;
    cmd.bytes[1] = ata16_byte1(0, PROT_PIO_IN, 1);
    cmd.bytes[2] = 0x0e;
    cmd.bytes[6] = 1; // one sector
    cmd.bytes[13] = 1 << 6;
    cmd.bytes[14] = ATA_CMD_ID_ATA;
    cmd
}

/// Build an INQUIRY command.  Zoned-model discovery uses the Block Device
/// Characteristics VPD page (0xb1).
pub fn encode_inquiry(vpd: bool, page_code: u8, response_len: u16) -> CommandBlock {
    let mut cmd = CommandBlock::new(6);
    cmd.bytes[0] = INQUIRY;
    cmd.bytes[1] = u8::from(vpd);
    cmd.bytes[2] = page_code;
    BigEndian::write_u16(&mut cmd.bytes[3..5], response_len);
    cmd
}

/// Decode the zoned-model tag from a raw IDENTIFY DEVICE buffer.  Bits
/// [1:0] of the little-endian word at byte offset 138 carry it; `01` means
/// host-aware.
pub fn decode_identify(buf: &[u8]) -> Result<ZonedModel> {
    if buf.len() < IDENTIFY_LEN {
        return Err(Error::TruncatedReport);
    }
    let word = u16::from(buf[138]) | u16::from(buf[139]) << 8;
    match word & 0x3 {
        0x1 => Ok(ZonedModel::HostAware),
        _ => Ok(ZonedModel::NotZoned),
    }
}

/// Decode the zoned-model tag from a Block Device Characteristics VPD page
/// (bits [5:4] of byte 8).
pub fn decode_inquiry_vpd_b1(buf: &[u8]) -> Result<ZonedModel> {
    if buf.len() < 9 {
        return Err(Error::TruncatedReport);
    }
    ZonedModel::from_u8(buf[8] >> 4 & 0x3).ok_or(Error::BadDescriptor)
}

/// Decode the 64-byte header of a REPORT ZONES result.
pub fn decode_report_header(buf: &[u8]) -> Result<ReportHeader> {
    if buf.len() < REPORT_HEADER_LEN {
        return Err(Error::TruncatedReport);
    }
    let list_bytes = BigEndian::read_u32(&buf[0..4]);
    let same = SameCode::from_u8(buf[4] & 0xf).ok_or(Error::BadDescriptor)?;
    let max_lba = BigEndian::read_u64(&buf[8..16]) & LBA_MASK;
    Ok(ReportHeader { list_bytes, same, max_lba })
}

/// Decode one 64-byte zone descriptor.
///
/// Devices may report a stale write pointer for Empty and Full zones; the
/// decoder pins it to the zone boundary rather than trusting it literally.
pub fn decode_zone_descriptor(buf: &[u8]) -> Result<ZoneDescriptor> {
    if buf.len() < ZONE_DESCRIPTOR_LEN {
        return Err(Error::TruncatedReport);
    }
    let zone_type = ZoneType::from_u8(buf[0] & 0xf)
        .ok_or(Error::BadDescriptor)?;
    let condition = ZoneCondition::from_u8(buf[1] >> 4 & 0xf)
        .ok_or(Error::BadDescriptor)?;
    let reset = buf[1] & 0x1 != 0;
    let non_seq = buf[1] & 0x2 != 0;
    let length = BigEndian::read_u64(&buf[8..16]) & LBA_MASK;
    let start = BigEndian::read_u64(&buf[16..24]) & LBA_MASK;
    let mut wp = BigEndian::read_u64(&buf[24..32]) & LBA_MASK;

    if zone_type == ZoneType::Conventional || condition == ZoneCondition::NoWp {
        wp = NO_WP;
    } else if condition == ZoneCondition::Empty && wp != start {
        wp = start;
    } else if condition == ZoneCondition::Full && wp != start + length {
        wp = start + length;
    }

    Ok(ZoneDescriptor { zone_type, condition, reset, non_seq, length, start, wp })
}

// LCOV_EXCL_STOP
