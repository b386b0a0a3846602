// vim: tw=80
//! SG_IO transport: executes command blocks against a real device node
//! through the Linux SCSI generic ioctl.

use std::{
    fs::OpenOptions,
    os::unix::io::AsRawFd,
    path::Path,
    ptr,
    sync::Arc,
    time::Duration,
};
use tokio::task;

use crate::{
    codec::CommandBlock,
    sense::{Completion, SENSE_BUF_LEN},
    transport::{BoxTransportFut, Direction, Transport},
    types::*,
};

/// FFI definitions for the SCSI generic driver.  These don't belong in
/// libc, and nix doesn't carry them either.
#[doc(hidden)]
mod ffi {
    use nix::{ioctl_readwrite_bad, libc::{c_int, c_uchar, c_uint, c_ushort,
                                          c_void}};

    pub const SG_DXFER_NONE: c_int = -1;
    pub const SG_DXFER_TO_DEV: c_int = -2;
    pub const SG_DXFER_FROM_DEV: c_int = -3;

    #[repr(C)]
    #[doc(hidden)]
    pub struct sg_io_hdr {
        pub interface_id:    c_int,
        pub dxfer_direction: c_int,
        pub cmd_len:         c_uchar,
        pub mx_sb_len:       c_uchar,
        pub iovec_count:     c_ushort,
        pub dxfer_len:       c_uint,
        pub dxferp:          *mut c_void,
        pub cmdp:            *mut c_uchar,
        pub sbp:             *mut c_uchar,
        pub timeout:         c_uint,
        pub flags:           c_uint,
        pub pack_id:         c_int,
        pub usr_ptr:         *mut c_void,
        pub status:          c_uchar,
        pub masked_status:   c_uchar,
        pub msg_status:      c_uchar,
        pub sb_len_wr:       c_uchar,
        pub host_status:     c_ushort,
        pub driver_status:   c_ushort,
        pub resid:           c_int,
        pub duration:        c_uint,
        pub info:            c_uint,
    }

    ioctl_readwrite_bad! {
        #[doc(hidden)]
        sg_io, 0x2285, sg_io_hdr
    }
}

/// A [`Transport`] backed by a device node that accepts `SG_IO`.
///
/// The ioctl blocks the issuing thread for the duration of the command, so
/// it runs on the blocking thread pool.
#[derive(Debug)]
pub struct SgTransport {
    file: Arc<std::fs::File>,
}

impl SgTransport {
    /// Open the device node at `p`.
    pub fn open<P: AsRef<Path>>(p: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(p)
            .map_err(|_| Error::DeviceUnavailable)?;
        Ok(SgTransport { file: Arc::new(file) })
    }
}

impl Transport for SgTransport {
    fn execute(
        &self,
        cdb: &CommandBlock,
        dir: Direction,
        buf: Option<IoVecMut>,
        timeout: Duration,
    ) -> BoxTransportFut {
        let file = self.file.clone();
        let cdb = *cdb;
        let blocking = task::spawn_blocking(move || -> Result<Completion> {
            let mut cmd = [0u8; 16];
            let cmdslice = cdb.as_slice();
            cmd[..cmdslice.len()].copy_from_slice(cmdslice);
            let mut sense = [0u8; SENSE_BUF_LEN];
            let mut buf = buf;
            let (dxferp, dxfer_len) = match buf.as_mut() {
                Some(b) => (b.as_mut_ptr().cast(), b.len() as u32),
                None => (ptr::null_mut(), 0),
            };
            let mut hdr = ffi::sg_io_hdr {
                interface_id:    i32::from(b'S'),
                dxfer_direction: match dir {
                    Direction::None => ffi::SG_DXFER_NONE,
                    Direction::ToDevice => ffi::SG_DXFER_TO_DEV,
                    Direction::FromDevice => ffi::SG_DXFER_FROM_DEV,
                },
                cmd_len:         cmdslice.len() as u8,
                mx_sb_len:       SENSE_BUF_LEN as u8,
                iovec_count:     0,
                dxfer_len,
                dxferp,
                cmdp:            cmd.as_mut_ptr(),
                sbp:             sense.as_mut_ptr(),
                timeout:         timeout.as_millis() as u32,
                flags:           0,
                pack_id:         0,
                usr_ptr:         ptr::null_mut(),
                status:          0,
                masked_status:   0,
                msg_status:      0,
                sb_len_wr:       0,
                host_status:     0,
                driver_status:   0,
                resid:           0,
                duration:        0,
                info:            0,
            };
            // Safe because hdr's pointers all outlive the ioctl
            unsafe { ffi::sg_io(file.as_raw_fd(), &mut hdr) }?;
            Ok(Completion {
                host:   hdr.host_status as u8,
                driver: hdr.driver_status as u8,
                status: hdr.status,
                sense,
            })
        });
        Box::pin(async move {
            blocking.await.map_err(|_| Error::DeviceUnavailable)?
        })
    }
}
