// vim: tw=80
//! One zoned device: its transport, its zone map, and the background
//! refresh machinery that keeps the two consistent.

use divbuf::DivBufShared;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::{
    codec::{
        self,
        CommandBlock,
        ReportHeader,
        ReportOption,
        ZoneAction,
        ZoneDescriptor,
        IDENTIFY_LEN,
        REPORT_HEADER_LEN,
        ZONE_DESCRIPTOR_LEN,
    },
    sense::{classify, Completion, Outcome},
    transport::{Direction, Transport, CMD_RETRIES, CMD_TIMEOUT},
    types::*,
    validator::IoValidator,
    zone::{RuntimeState, Zone, ZoneCondition},
    zone_map::ZoneMap,
};

/// Default transfer buffer size for REPORT ZONES, in bytes.  Big enough for
/// 1023 descriptors per round trip.
pub const REPORT_BUF_SIZE: usize = 65536;

/// Smallest transfer buffer worth degrading to: one header plus nothing.
/// The ATA encoding can't go below one sector anyway.
const REPORT_BUF_FLOOR: usize = 512;

/// INQUIRY VPD page: Block Device Characteristics.
const VPD_BLOCK_DEVICE_CHARACTERISTICS: u8 = 0xb1;
const VPD_B1_LEN: u16 = 64;

/// An in-flight (or queued) zone map refresh.  At most one exists per
/// device; later requests coalesce into it.
#[derive(Clone, Copy, Debug)]
struct PendingRefresh {
    /// Where the next REPORT ZONES round trip starts.
    lba:    LbaT,
    /// Requested transfer buffer size; allocation may degrade it.
    buflen: usize,
}

#[derive(Debug, Default)]
struct Inner {
    pending:       Option<PendingRefresh>,
    /// Single staging slot for an externally confirmed write pointer.  A
    /// second correction arriving before the first drains is dropped.
    wp_correction: Option<(LbaT, LbaT)>,
    /// A refresh task is live.  Exactly one may exist per device; stagers
    /// only spawn when they flip this from `false`, and the task clears it
    /// in the same critical section where it finds no work left.
    running:       bool,
}

/// A zoned block device and its runtime metadata.
///
/// All I/O goes through the [`Transport`]; all zone bookkeeping lives in
/// the shared [`ZoneMap`].  Refreshes run on a background task so that
/// completion-path callers never wait on the device.
pub struct ZonedDevice {
    transport: Arc<dyn Transport>,
    map:       Arc<ZoneMap>,
    /// Encode commands as ATA pass-through (ZAC) rather than native SCSI
    /// (ZBC).
    ata:       bool,
    model:     Mutex<ZonedModel>,
    inner:     Mutex<Inner>,
    task:      Mutex<Option<JoinHandle<()>>>,
}

impl ZonedDevice {
    pub fn new(
        transport: Arc<dyn Transport>,
        ata: bool,
        model: ZonedModel,
    ) -> Arc<Self> {
        Arc::new(ZonedDevice {
            transport,
            map: Arc::new(ZoneMap::new()),
            ata,
            model: Mutex::new(model),
            inner: Mutex::new(Inner::default()),
            task: Mutex::new(None),
        })
    }

    pub fn map(&self) -> Arc<ZoneMap> {
        self.map.clone()
    }

    pub fn model(&self) -> ZonedModel {
        *self.model.lock().unwrap()
    }

    /// A validator bound to this device's zone map and zoned model.
    pub fn validator(&self) -> IoValidator {
        IoValidator::new(self.map.clone(), self.model())
    }

    /// Ask the device what kind of zoned device it is, and remember the
    /// answer.  ATA devices answer through IDENTIFY DEVICE word 138, SCSI
    /// devices through the Block Device Characteristics VPD page.
    pub async fn identify(&self) -> Result<ZonedModel> {
        let model = if self.ata {
            let dbs = alloc_buf(IDENTIFY_LEN)?;
            let cdb = codec::encode_identify();
            self.execute_cmd(&cdb, Direction::FromDevice, Some(&dbs)).await?;
            let db = dbs.try_const().map_err(|_| Error::NoMemory)?;
            codec::decode_identify(&db[..])?
        } else {
            let dbs = alloc_buf(usize::from(VPD_B1_LEN))?;
            let cdb = codec::encode_inquiry(
                true,
                VPD_BLOCK_DEVICE_CHARACTERISTICS,
                VPD_B1_LEN,
            );
            self.execute_cmd(&cdb, Direction::FromDevice, Some(&dbs)).await?;
            let db = dbs.try_const().map_err(|_| Error::NoMemory)?;
            codec::decode_inquiry_vpd_b1(&db[..])?
        };
        tracing::debug!(?model, ata = self.ata, "discovered zoned model");
        *self.model.lock().unwrap() = model;
        Ok(model)
    }

    /// Populate the zone map from scratch with a full scan of the device.
    ///
    /// Aborts any in-flight refresh first; a refresh started against the
    /// old map would merge into the new one incoherently.
    pub async fn init_zones(&self) -> Result<()> {
        if !self.model().is_zoned() {
            return Err(Error::NotZoned);
        }
        if let Some(h) = self.task.lock().unwrap().take() {
            h.abort();
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pending = None;
            inner.wp_correction = None;
            inner.running = false;
        }
        self.map.drop_all();
        let mut next = Some(0);
        while let Some(lba) = next {
            let p = PendingRefresh { lba, buflen: REPORT_BUF_SIZE };
            next = self.refresh_once(p).await?;
        }
        tracing::info!(zones = self.map.len(), "zone map initialized");
        Ok(())
    }

    /// Stop background work and forget everything about the device.
    pub async fn close(&self) {
        let handle = self.task.lock().unwrap().take();
        if let Some(h) = handle {
            h.abort();
            let _ = h.await;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pending = None;
            inner.wp_correction = None;
            inner.running = false;
        }
        self.map.drop_all();
    }

    /// Request a background refresh of all zones from `lba` onward,
    /// marking the affected zones busy until it lands.  A no-op if a
    /// refresh is already pending; the running one will re-report the
    /// current state anyway.
    pub fn refresh(self: &Arc<Self>, lba: LbaT) {
        self.request_refresh(lba, REPORT_BUF_SIZE, true)
    }

    /// Like [`refresh`](Self::refresh), but without busy-marking.  Used
    /// from the deferral path, where the zones in question are already
    /// `Busy` or `Unknown`.
    pub fn kick_refresh(self: &Arc<Self>, lba: LbaT) {
        self.request_refresh(lba, REPORT_BUF_SIZE, false)
    }

    /// With `busy` set, marks every sequential zone from `lba` onward
    /// [`RuntimeState::Busy`] before any I/O, so concurrent validator
    /// calls defer instead of acting on state the report will overwrite.
    fn request_refresh(
        self: &Arc<Self>,
        lba: LbaT,
        buflen: usize,
        busy: bool,
    ) {
        let spawn = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending.is_some() {
                return;
            }
            inner.pending = Some(PendingRefresh { lba, buflen });
            !std::mem::replace(&mut inner.running, true)
        };
        if busy {
            self.map.mark_busy(lba);
        }
        if spawn {
            self.spawn_refresh();
        }
    }

    /// Stage an externally confirmed write pointer for `lba`'s zone.
    ///
    /// Called from I/O completion context, so it must not block on the
    /// device; the correction drains on the refresh task.  If the slot is
    /// already occupied the correction is dropped: the zone's shadow
    /// pointer stays behind, which is safe, merely pessimistic.
    pub fn update_wp(self: &Arc<Self>, lba: LbaT, wp: LbaT) {
        let spawn = {
            let mut inner = self.inner.lock().unwrap();
            if let Some((pending_lba, pending_wp)) = inner.wp_correction {
                tracing::info!(lba, wp, pending_lba, pending_wp,
                               "write pointer update already staged");
                return;
            }
            inner.wp_correction = Some((lba, wp));
            !std::mem::replace(&mut inner.running, true)
        };
        if spawn {
            self.spawn_refresh();
        }
    }

    /// Issue a zone management command, then schedule a refresh of the
    /// affected zones.  With `all` set the action applies to every zone
    /// and `lba` is ignored.
    pub async fn zone_action(
        self: &Arc<Self>,
        action: ZoneAction,
        lba: LbaT,
        all: bool,
    ) -> Result<()> {
        let cdb = codec::encode_zone_action(action, lba, all, self.ata);
        self.execute_cmd(&cdb, Direction::None, None).await?;
        tracing::debug!(?action, lba, all, "zone action complete");
        if all {
            self.map.reset_all();
            self.refresh(0);
        } else {
            self.refresh(lba);
        }
        Ok(())
    }

    /// One raw REPORT ZONES round trip, decoded but not merged into the
    /// map.  Returns only the descriptors that fit in one transfer.
    pub async fn report_zones(
        &self,
        lba: LbaT,
        opt: ReportOption,
    ) -> Result<(ReportHeader, Vec<ZoneDescriptor>)> {
        let (dbs, buflen) = alloc_report_buf(REPORT_BUF_SIZE)?;
        let cdb = codec::encode_report(lba, opt, buflen as u32, self.ata);
        self.execute_cmd(&cdb, Direction::FromDevice, Some(&dbs)).await?;
        let db = dbs.try_const().map_err(|_| Error::NoMemory)?;
        let hdr = codec::decode_report_header(&db[..])?;
        let declared = hdr.nr_zones() as usize;
        let fitted =
            declared.min((buflen - REPORT_HEADER_LEN) / ZONE_DESCRIPTOR_LEN);
        let mut zones = Vec::with_capacity(fitted);
        for i in 0..fitted {
            let off = REPORT_HEADER_LEN + i * ZONE_DESCRIPTOR_LEN;
            zones.push(codec::decode_zone_descriptor(
                &db[off..off + ZONE_DESCRIPTOR_LEN],
            )?);
        }
        Ok((hdr, zones))
    }

    /// Wait for the background refresh task, if any, to finish.
    pub async fn quiesce(&self) {
        let handle = self.task.lock().unwrap().take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }

    /// Callers must have flipped `Inner::running` from `false` first, so
    /// any handle replaced here belongs to a task that already exited.
    fn spawn_refresh(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(this.refresh_task());
        *self.task.lock().unwrap() = Some(handle);
    }

    /// The background refresh loop.  Drains the write pointer correction
    /// slot, then reissues REPORT ZONES until the pending refresh is
    /// complete, following continuations when the device has more zones
    /// than fit one transfer.
    async fn refresh_task(self: Arc<Self>) {
        loop {
            let correction = self.inner.lock().unwrap().wp_correction.take();
            if let Some((lba, wp)) = correction {
                self.apply_wp(lba, wp);
            }
            let pending = {
                let mut inner = self.inner.lock().unwrap();
                if inner.wp_correction.is_some() {
                    // Staged while the last correction was being applied.
                    continue;
                }
                match inner.pending {
                    Some(p) => p,
                    None => {
                        // Clear `running` under the same lock that showed
                        // no work, so a stager can't slip work in between
                        // this check and the task's exit.
                        inner.running = false;
                        break;
                    }
                }
            };
            match self.refresh_once(pending).await {
                Ok(Some(next)) => {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(p) = inner.pending.as_mut() {
                        p.lba = next;
                    }
                }
                Ok(None) => {
                    self.inner.lock().unwrap().pending = None;
                    // One more pass to catch a correction staged while the
                    // report was in flight.
                }
                Err(e) => {
                    // Affected zones stay Busy; the validator will keep
                    // deferring their I/O and kicking new refreshes.  Loop
                    // once more to drain anything staged meanwhile.
                    tracing::warn!(error = %e, lba = pending.lba,
                                   "zone refresh failed");
                    self.inner.lock().unwrap().pending = None;
                    self.map.invalidate_cache();
                }
            }
        }
    }

    /// One REPORT ZONES round trip merged into the map.  Returns the LBA
    /// to continue from if the result was truncated.
    async fn refresh_once(&self, p: PendingRefresh) -> Result<Option<LbaT>> {
        let (dbs, buflen) = alloc_report_buf(p.buflen)?;
        let cdb =
            codec::encode_report(p.lba, ReportOption::All, buflen as u32,
                                 self.ata);
        self.execute_cmd(&cdb, Direction::FromDevice, Some(&dbs)).await?;
        let db = dbs.try_const().map_err(|_| Error::NoMemory)?;
        self.merge_report(&db[..])
    }

    /// Merge a raw REPORT ZONES result into the map.
    ///
    /// Records already [`RuntimeState::Tracked`] are left alone: their
    /// in-memory write pointer may be ahead of what the device reported,
    /// and the report has nothing newer to say about them.
    fn merge_report(&self, buf: &[u8]) -> Result<Option<LbaT>> {
        let hdr = codec::decode_report_header(buf)?;
        self.map.set_max_lba(hdr.max_lba);
        let declared = hdr.nr_zones() as usize;
        if declared == 0 {
            return Ok(None);
        }
        let fitted =
            declared.min((buf.len() - REPORT_HEADER_LEN) / ZONE_DESCRIPTOR_LEN);
        if fitted == 0 {
            // The buffer degraded below one descriptor; no forward progress
            // is possible.
            return Err(Error::TruncatedReport);
        }
        let mut last_end = 0;
        for i in 0..fitted {
            let off = REPORT_HEADER_LEN + i * ZONE_DESCRIPTOR_LEN;
            let desc = codec::decode_zone_descriptor(
                &buf[off..off + ZONE_DESCRIPTOR_LEN],
            )?;
            last_end = desc.start + desc.length;
            if hdr.same.uniform_length() && self.map.zone_len().is_none() {
                self.map.set_zone_len(desc.length);
            }
            if let Some(existing) =
                self.map.insert(Zone::from_descriptor(&desc))
            {
                let mut z = existing.lock().unwrap();
                if z.state != RuntimeState::Tracked {
                    z.merge_from(&desc);
                }
            }
        }
        self.map.invalidate_cache();
        if fitted < declared {
            Ok(Some(last_end))
        } else {
            Ok(None)
        }
    }

    /// Apply a drained write pointer correction to the map.  Busy zones
    /// are skipped: the refresh already in flight for them will report a
    /// fresher pointer than the correction carries.
    fn apply_wp(&self, lba: LbaT, wp: LbaT) {
        let zone = match self.map.lookup(lba) {
            Some(z) => z,
            None => {
                tracing::warn!(lba, "write pointer correction misses the map");
                return;
            }
        };
        let mut z = zone.lock().unwrap();
        if !z.is_seq() {
            return;
        }
        if z.state == RuntimeState::Busy {
            tracing::debug!(lba, "zone busy, not updating its write pointer");
            return;
        }
        if wp >= z.end() {
            z.wp = z.end();
            z.condition = ZoneCondition::Full;
        } else {
            z.wp = wp;
            if wp == z.start {
                z.condition = ZoneCondition::Empty;
            } else if !z.condition.is_open() {
                z.condition = ZoneCondition::ImplicitOpen;
            }
        }
        z.shadow_wp = z.wp;
        z.state = RuntimeState::Tracked;
        drop(z);
        self.map.invalidate_cache();
    }

    /// Execute one command, retrying transparently while the device is
    /// merely busy.
    async fn execute_cmd(
        &self,
        cdb: &CommandBlock,
        dir: Direction,
        buf: Option<&DivBufShared>,
    ) -> Result<Completion> {
        let opcode = cdb.opcode();
        for _ in 0..CMD_RETRIES {
            let bufmut = match buf {
                Some(dbs) => {
                    Some(dbs.try_mut().map_err(|_| Error::NoMemory)?)
                }
                None => None,
            };
            let completion = self
                .transport
                .execute(cdb, dir, bufmut, CMD_TIMEOUT)
                .await?;
            match classify(opcode, &completion) {
                Outcome::Success => return Ok(completion),
                Outcome::Retryable => continue,
                Outcome::Failed => {
                    return Err(Error::CommandFailed { opcode })
                }
                Outcome::ProtocolError => {
                    return Err(Error::PassThroughProtocol)
                }
            }
        }
        Err(Error::CommandFailed { opcode })
    }
}

/// Allocate a zeroed buffer of exactly `buflen` bytes.
fn alloc_buf(buflen: usize) -> Result<DivBufShared> {
    let mut v: Vec<u8> = Vec::new();
    v.try_reserve_exact(buflen).map_err(|_| Error::NoMemory)?;
    v.resize(buflen, 0);
    Ok(DivBufShared::from(v))
}

/// Allocate a report buffer, halving the size under memory pressure down
/// to [`REPORT_BUF_FLOOR`].
fn alloc_report_buf(mut buflen: usize) -> Result<(DivBufShared, usize)> {
    loop {
        match alloc_buf(buflen) {
            Ok(dbs) => return Ok((dbs, buflen)),
            Err(_) if buflen > REPORT_BUF_FLOOR => {
                buflen /= 2;
                tracing::debug!(buflen, "degrading report buffer");
            }
            Err(e) => return Err(e),
        }
    }
}

// LCOV_EXCL_STOP
