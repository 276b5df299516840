//! Virtio block device model.
//!
//! Request/response layout and dispatch are generalized directly from
//! `examples/loks0n-carbon/src/devices/virtio/blk.rs`'s `process_request`;
//! the capacity/geometry config block and the FLUSH opcode are kept as
//! that file already has them. Backing storage is a plain file accessed
//! with `pread`/`pwrite` at a sector offset, same as the teacher.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;

use super::DeviceModel;

pub const VIRTIO_BLK_DEVICE_ID: u32 = 2;
const SECTOR_SIZE: u64 = 512;
const BLK_SIZE: u32 = 512;

const VIRTIO_BLK_F_SIZE_MAX: u32 = 1 << 1;
const VIRTIO_BLK_F_SEG_MAX: u32 = 1 << 2;
const VIRTIO_BLK_F_BLK_SIZE: u32 = 1 << 6;
const VIRTIO_BLK_F_FLUSH: u32 = 1 << 9;
const VIRTIO_F_VERSION_1_HI: u32 = 1 << 0;

const SIZE_MAX: u32 = 1024 * 1024;
const SEG_MAX: u32 = 128;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

const CONFIG_CAPACITY: u64 = 0x000;
const CONFIG_SIZE_MAX: u64 = 0x008;
const CONFIG_SEG_MAX: u64 = 0x00c;
const CONFIG_BLK_SIZE: u64 = 0x014;

pub fn device_features() -> [u32; 2] {
    [
        VIRTIO_BLK_F_SIZE_MAX | VIRTIO_BLK_F_SEG_MAX | VIRTIO_BLK_F_BLK_SIZE | VIRTIO_BLK_F_FLUSH,
        VIRTIO_F_VERSION_1_HI,
    ]
}

/// A single in-flight request's header, accumulated across the start
/// descriptor and however many data descriptors follow it.
#[derive(Default)]
struct PendingRequest {
    req_type: u32,
    sector: u64,
    bytes_done: usize,
}

pub struct BlockDevice {
    disk: File,
    capacity_sectors: u64,
    pending: Option<PendingRequest>,
    request_count: u64,
}

impl BlockDevice {
    pub fn open(disk_path: &str) -> io::Result<Self> {
        let disk = OpenOptions::new().read(true).write(true).open(disk_path)?;
        let capacity_sectors = disk.metadata()?.len() / SECTOR_SIZE;
        eprintln!(
            "[virtio-blk] opened {disk_path} ({capacity_sectors} sectors, {} bytes)",
            capacity_sectors * SECTOR_SIZE
        );
        Ok(Self {
            disk,
            capacity_sectors,
            pending: None,
            request_count: 0,
        })
    }

    /// Publish the capacity/geometry config block into the device's
    /// MMIO aperture. Called once after construction; the guest reads
    /// this range as plain memory.
    pub fn publish_config(&self, config_ptr: *mut u8) {
        unsafe {
            let write_u64 = |off: u64, v: u64| {
                std::ptr::write_volatile((config_ptr.add(off as usize)) as *mut u64, v)
            };
            let write_u32 = |off: u64, v: u32| {
                std::ptr::write_volatile((config_ptr.add(off as usize)) as *mut u32, v)
            };
            write_u64(CONFIG_CAPACITY, self.capacity_sectors);
            write_u32(CONFIG_SIZE_MAX, SIZE_MAX);
            write_u32(CONFIG_SEG_MAX, SEG_MAX);
            write_u32(CONFIG_BLK_SIZE, BLK_SIZE);
        }
    }

    fn handle_read(&self, sector: u64, ptr: *mut u8, len: usize) -> u8 {
        let offset = sector * SECTOR_SIZE;
        let mut buf = vec![0u8; len];
        if let Err(e) = self.disk.read_at(&mut buf, offset) {
            eprintln!("[virtio-blk] read error at {offset}: {e}");
            return VIRTIO_BLK_S_IOERR;
        }
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, len) };
        VIRTIO_BLK_S_OK
    }

    fn handle_write(&self, sector: u64, ptr: *const u8, len: usize) -> u8 {
        let offset = sector * SECTOR_SIZE;
        let mut buf = vec![0u8; len];
        unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), len) };
        if let Err(e) = self.disk.write_at(&buf, offset) {
            eprintln!("[virtio-blk] write error at {offset}: {e}");
            return VIRTIO_BLK_S_IOERR;
        }
        VIRTIO_BLK_S_OK
    }

    fn handle_flush(&self) -> u8 {
        match self.disk.sync_all() {
            Ok(()) => VIRTIO_BLK_S_OK,
            Err(e) => {
                eprintln!("[virtio-blk] flush error: {e}");
                VIRTIO_BLK_S_IOERR
            }
        }
    }
}

impl DeviceModel for BlockDevice {
    fn num_queues(&self) -> usize {
        1
    }

    fn queue_header_size(&self) -> u64 {
        16
    }

    fn queue_has_data(&self, _queue_idx: usize) -> bool {
        true
    }

    fn process_queue_start(&mut self, _queue_idx: usize, ptr: *mut u8, len: u64) {
        let mut buf = [0u8; 16];
        let n = (len as usize).min(16);
        unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), n) };
        let req_type = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        self.pending = Some(PendingRequest {
            req_type,
            sector,
            bytes_done: 0,
        });
    }

    fn process_queue_data(&mut self, _queue_idx: usize, ptr: *mut u8, len: u64) {
        let Some(req) = self.pending.as_mut() else {
            return;
        };
        let sector = req.sector + (req.bytes_done as u64) / SECTOR_SIZE;
        match req.req_type {
            VIRTIO_BLK_T_IN => {
                self.handle_read(sector, ptr, len as usize);
            }
            VIRTIO_BLK_T_OUT => {
                self.handle_write(sector, ptr, len as usize);
            }
            _ => {}
        }
        req.bytes_done += len as usize;
    }

    fn process_queue_complete(&mut self, _queue_idx: usize, ptr: *mut u8, _len: u64) {
        let req = self.pending.take().unwrap_or_default();
        let status = match req.req_type {
            VIRTIO_BLK_T_IN | VIRTIO_BLK_T_OUT => VIRTIO_BLK_S_OK,
            VIRTIO_BLK_T_FLUSH => self.handle_flush(),
            other => {
                eprintln!("[virtio-blk] unsupported request type {other}");
                VIRTIO_BLK_S_UNSUPP
            }
        };
        unsafe { std::ptr::write_volatile(ptr, status) };
        self.request_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    struct ScratchFile {
        path: std::path::PathBuf,
    }

    impl Drop for ScratchFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn backing_file(sectors: u64, tag: &str) -> ScratchFile {
        let path = std::env::temp_dir().join(format!("tilevmm-blk-test-{tag}-{sectors}.img"));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; (sectors * SECTOR_SIZE) as usize])
            .unwrap();
        ScratchFile { path }
    }

    #[test]
    fn opens_and_reports_capacity() {
        let f = backing_file(4, "capacity");
        let dev = BlockDevice::open(f.path.to_str().unwrap()).unwrap();
        assert_eq!(dev.capacity_sectors, 4);
    }

    #[test]
    fn write_then_read_round_trips_through_the_backing_file() {
        let f = backing_file(4, "roundtrip");
        let mut dev = BlockDevice::open(f.path.to_str().unwrap()).unwrap();

        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&VIRTIO_BLK_T_OUT.to_le_bytes());
        header[8..16].copy_from_slice(&0u64.to_le_bytes());
        dev.process_queue_start(0, header.as_mut_ptr(), 16);

        let mut data = [0xabu8; 512];
        dev.process_queue_data(0, data.as_mut_ptr(), 512);

        let mut status = [0xffu8];
        dev.process_queue_complete(0, status.as_mut_ptr(), 1);
        assert_eq!(status[0], VIRTIO_BLK_S_OK);

        header[0..4].copy_from_slice(&VIRTIO_BLK_T_IN.to_le_bytes());
        dev.process_queue_start(0, header.as_mut_ptr(), 16);
        let mut readback = [0u8; 512];
        dev.process_queue_data(0, readback.as_mut_ptr(), 512);
        dev.process_queue_complete(0, status.as_mut_ptr(), 1);

        assert_eq!(status[0], VIRTIO_BLK_S_OK);
        assert_eq!(&readback[..], &data[..]);
    }

    #[test]
    fn flush_syncs_without_touching_pending_state() {
        let f = backing_file(1, "flush");
        let mut dev = BlockDevice::open(f.path.to_str().unwrap()).unwrap();
        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&VIRTIO_BLK_T_FLUSH.to_le_bytes());
        dev.process_queue_start(0, header.as_mut_ptr(), 16);
        let mut status = [0xffu8];
        dev.process_queue_complete(0, status.as_mut_ptr(), 1);
        assert_eq!(status[0], VIRTIO_BLK_S_OK);
    }
}
