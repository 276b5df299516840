//! Device driver interface (DDI) for the accelerator's kernel driver.
//!
//! This module is a thin, safe wrapper over the ioctl surface the kernel
//! driver exposes on `/dev/tenstorrent/<n>`-style device nodes. It mirrors
//! the way `examples/loks0n-carbon/src/kvm/mod.rs` wraps `/dev/kvm`: one
//! `ioctl()` per operation, one `#[repr(C)]` struct per request/response
//! pair, and a single error type that carries the underlying `nix::Error`.
//!
//! # Operations
//!
//! - `GET_DEVICE_INFO` — vendor/device id and PCI location.
//! - `QUERY_MAPPINGS` — up to [`MAX_MAPPINGS`] BAR-style (resource_id, base,
//!   size) tuples.
//! - `ALLOCATE_TLB(size)` — reserve one hardware translation window of the
//!   given size class; returns an id and the mmap offset to reach it.
//! - `CONFIGURE_TLB(id, config)` — point an allocated window at a
//!   (tile_x, tile_y, address) target. `config.addr` must already be
//!   aligned to the window's size; the driver does not do this for us.
//! - `FREE_TLB(id)` — release a window back to the device.
//! - `PIN_PAGES(vaddr, size)` — pin host pages for DMA, returning an IOVA.
//!
//! All operations that fail report [`DdiError::Ioctl`], carrying the raw
//! `nix::Error` from the failed syscall. There is no finer-grained error
//! taxonomy here: the kernel driver's ioctl numbers and layouts are opaque
//! and any failure is equally fatal to the caller.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::{ioctl_readwrite, libc};
use thiserror::Error;

/// ioctl magic byte for this driver's request numbers.
const IOCTL_MAGIC: u8 = 0xf0;

/// Maximum number of BAR-style mappings `QUERY_MAPPINGS` can report.
pub const MAX_MAPPINGS: usize = 8;

/// Vendor/device identification and PCI location, as returned by
/// `GET_DEVICE_INFO`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub device_id: u16,
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
    _pad: u8,
}

/// One (resource_id, base, size) tuple from `QUERY_MAPPINGS`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MappingEntry {
    pub resource_id: u32,
    pub base: u64,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct QueryMappingsReq {
    count: u32,
    mappings: [MappingEntry; MAX_MAPPINGS],
}

impl Default for QueryMappingsReq {
    fn default() -> Self {
        Self {
            count: 0,
            mappings: [MappingEntry::default(); MAX_MAPPINGS],
        }
    }
}

/// Configuration applied to a TLB window by `CONFIGURE_TLB`.
///
/// `addr` is the tile-local physical address the window should translate
/// to, already aligned down to the window's size class. `x_end`/`y_end`
/// are the target tile's NOC coordinates. `ordering` and `multicast` are
/// driver-defined knobs we don't exercise (left at zero).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct NocTlbConfig {
    pub addr: u64,
    pub x_end: u16,
    pub y_end: u16,
    pub ordering: u8,
    pub multicast: u8,
    _pad: [u8; 2],
}

impl NocTlbConfig {
    pub fn new(x: u16, y: u16, addr: u64) -> Self {
        Self {
            addr,
            x_end: x,
            y_end: y,
            ordering: 0,
            multicast: 0,
            _pad: [0; 2],
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct AllocateTlbReq {
    size: u64,
    id: u32,
    _pad: u32,
    mmap_offset_uc: u64,
    mmap_offset_wc: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct ConfigureTlbReq {
    id: u32,
    _pad: u32,
    config: NocTlbConfig,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FreeTlbReq {
    id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PinPagesReq {
    vaddr: u64,
    size: u64,
    iova: u64,
}

ioctl_readwrite!(ioctl_get_device_info, IOCTL_MAGIC, 0, DeviceInfo);
ioctl_readwrite!(ioctl_query_mappings, IOCTL_MAGIC, 1, QueryMappingsReq);
ioctl_readwrite!(ioctl_allocate_tlb, IOCTL_MAGIC, 2, AllocateTlbReq);
ioctl_readwrite!(ioctl_configure_tlb, IOCTL_MAGIC, 3, ConfigureTlbReq);
ioctl_readwrite!(ioctl_free_tlb, IOCTL_MAGIC, 4, FreeTlbReq);
ioctl_readwrite!(ioctl_pin_pages, IOCTL_MAGIC, 5, PinPagesReq);

/// Errors from the driver interface.
#[derive(Error, Debug)]
pub enum DdiError {
    /// Failed to open the device node.
    #[error("failed to open device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An ioctl to the kernel driver failed. This is the single
    /// `IOCTL_FAILED` error class from the spec: every driver operation
    /// collapses to this on failure, carrying the kernel's errno.
    #[error("ioctl failed: {0}")]
    Ioctl(#[source] nix::Error),

    /// mmap of a TLB's host mapping failed.
    #[error("mmap failed: {0}")]
    Mmap(#[source] nix::Error),
}

/// A freshly allocated, unconfigured TLB entry: the id and mmap offset
/// the driver handed back from `ALLOCATE_TLB`.
#[derive(Debug, Clone, Copy)]
pub struct RawTlb {
    pub id: u32,
    pub size: u64,
    pub mmap_offset: u64,
}

/// Capability surface the TLB pool needs from a driver handle.
///
/// Split out as a trait so the pool can be exercised in tests against an
/// in-process fake without a real accelerator attached, the same way the
/// virtqueue engine is parameterized over a device model rather than
/// hard-coding block/network behavior.
pub trait Ddi: Send + Sync {
    fn allocate_tlb(&self, size: u64) -> Result<RawTlb, DdiError>;
    fn configure_tlb(&self, id: u32, config: NocTlbConfig) -> Result<(), DdiError>;
    fn free_tlb(&self, id: u32) -> Result<(), DdiError>;
    /// Map an allocated TLB's host mapping into this process.
    fn map(&self, raw: &RawTlb) -> Result<*mut u8, DdiError>;
    /// Unmap a previously mapped TLB window.
    ///
    /// # Safety
    /// `ptr`/`size` must be exactly the values returned by/passed to a
    /// prior successful `map` call on this same handle.
    unsafe fn unmap(&self, ptr: *mut u8, size: usize);
}

/// An open handle to the accelerator's device node.
///
/// Stateless aside from the open file descriptor: every TLB allocated
/// through this handle is independent, and the handle may be shared
/// (via `Arc`) across threads — the kernel driver serializes ioctls
/// per-fd on its own.
pub struct DeviceHandle {
    file: File,
}

impl DeviceHandle {
    /// Open the accelerator device node at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DdiError> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path_ref)
            .map_err(|source| DdiError::Open {
                path: path_ref.display().to_string(),
                source,
            })?;
        Ok(Self { file })
    }

    /// Query vendor/device identification and PCI location.
    pub fn device_info(&self) -> Result<DeviceInfo, DdiError> {
        let mut info = DeviceInfo::default();
        unsafe { ioctl_get_device_info(self.file.as_raw_fd(), &mut info) }
            .map_err(DdiError::Ioctl)?;
        Ok(info)
    }

    /// Query the device's BAR-style memory mappings.
    pub fn query_mappings(&self) -> Result<Vec<MappingEntry>, DdiError> {
        let mut req = QueryMappingsReq::default();
        unsafe { ioctl_query_mappings(self.file.as_raw_fd(), &mut req) }
            .map_err(DdiError::Ioctl)?;
        let count = (req.count as usize).min(MAX_MAPPINGS);
        Ok(req.mappings[..count].to_vec())
    }

    /// Pin `size` bytes of host memory at `vaddr` for DMA, returning the
    /// resulting IOVA.
    ///
    /// `vaddr` must be page-aligned and `size` a multiple of the page
    /// size; the driver rejects anything else with `IOCTL_FAILED`.
    pub fn pin_pages(&self, vaddr: u64, size: u64) -> Result<u64, DdiError> {
        let mut req = PinPagesReq {
            vaddr,
            size,
            iova: 0,
        };
        unsafe { ioctl_pin_pages(self.file.as_raw_fd(), &mut req) }.map_err(DdiError::Ioctl)?;
        Ok(req.iova)
    }
}

impl Ddi for DeviceHandle {
    fn allocate_tlb(&self, size: u64) -> Result<RawTlb, DdiError> {
        let mut req = AllocateTlbReq {
            size,
            ..Default::default()
        };
        unsafe { ioctl_allocate_tlb(self.file.as_raw_fd(), &mut req) }.map_err(DdiError::Ioctl)?;
        Ok(RawTlb {
            id: req.id,
            size,
            mmap_offset: req.mmap_offset_uc,
        })
    }

    fn configure_tlb(&self, id: u32, config: NocTlbConfig) -> Result<(), DdiError> {
        let mut req = ConfigureTlbReq {
            id,
            _pad: 0,
            config,
        };
        unsafe { ioctl_configure_tlb(self.file.as_raw_fd(), &mut req) }.map_err(DdiError::Ioctl)?;
        Ok(())
    }

    fn free_tlb(&self, id: u32) -> Result<(), DdiError> {
        let mut req = FreeTlbReq { id };
        unsafe { ioctl_free_tlb(self.file.as_raw_fd(), &mut req) }.map_err(DdiError::Ioctl)?;
        Ok(())
    }

    fn map(&self, raw: &RawTlb) -> Result<*mut u8, DdiError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                raw.size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                raw.mmap_offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(DdiError::Mmap(nix::Error::last()));
        }
        Ok(ptr as *mut u8)
    }

    unsafe fn unmap(&self, ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, size);
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! An in-process stand-in for the hardware DDI, used by the TLB pool's
    //! tests. Allocation/configure/free bookkeeping is real; in place of
    //! a real mmap onto device-backed pages, every window is a view onto
    //! one process-wide `Vec<u8>` per (tile_x, tile_y, aligned address)
    //! region, so that two windows configured onto the same tile-local
    //! range actually alias the same bytes, the way two real TLB entries
    //! pointed at the same DRAM would. SPEC_FULL.md §2.1 asks for exactly
    //! this: "an in-memory fake device file (a `Vec<u8>`-backed ... fake)".
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// What `configure_tlb` recorded for one allocated-but-not-yet-mapped
    /// id: the tile and the aligned address the pool asked for.
    struct Pending {
        tile_x: u16,
        tile_y: u16,
        addr: u64,
    }

    /// One region's shared backing bytes, reused by every window that
    /// targets the same key.
    struct Region {
        bytes: Vec<u8>,
    }

    pub struct FakeDdi {
        next_id: Mutex<u32>,
        pending: Mutex<HashMap<u32, Pending>>,
        regions: Mutex<HashMap<(u16, u16, u64), Arc<Mutex<Region>>>>,
    }

    impl FakeDdi {
        pub fn new() -> Self {
            Self {
                next_id: Mutex::new(0),
                pending: Mutex::new(HashMap::new()),
                regions: Mutex::new(HashMap::new()),
            }
        }
    }

    impl Ddi for FakeDdi {
        fn allocate_tlb(&self, size: u64) -> Result<RawTlb, DdiError> {
            let mut guard = self.next_id.lock().unwrap();
            let id = *guard;
            *guard += 1;
            Ok(RawTlb {
                id,
                size,
                mmap_offset: 0,
            })
        }

        fn configure_tlb(&self, id: u32, config: NocTlbConfig) -> Result<(), DdiError> {
            self.pending.lock().unwrap().insert(
                id,
                Pending {
                    tile_x: config.x_end,
                    tile_y: config.y_end,
                    addr: config.addr,
                },
            );
            Ok(())
        }

        fn free_tlb(&self, id: u32) -> Result<(), DdiError> {
            self.pending.lock().unwrap().remove(&id);
            Ok(())
        }

        fn map(&self, raw: &RawTlb) -> Result<*mut u8, DdiError> {
            let pending = self.pending.lock().unwrap();
            let target = pending
                .get(&raw.id)
                .expect("map called before configure_tlb");
            let key = (target.tile_x, target.tile_y, target.addr);

            let region = Arc::clone(
                self.regions
                    .lock()
                    .unwrap()
                    .entry(key)
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(Region {
                            bytes: vec![0u8; raw.size as usize],
                        }))
                    }),
            );

            let region = region.lock().unwrap();
            assert!(
                raw.size as usize <= region.bytes.len(),
                "FakeDdi region for tile ({}, {}) at {:#x} was first reserved at {} bytes, \
                 too small for a later {}-byte request -- the fake only coalesces windows \
                 whose size is known up front",
                key.0,
                key.1,
                key.2,
                region.bytes.len(),
                raw.size
            );
            Ok(region.bytes.as_ptr() as *mut u8)
        }

        unsafe fn unmap(&self, _ptr: *mut u8, _size: usize) {
            // Regions are kept alive for the FakeDdi's whole lifetime so
            // that a later window re-acquired at the same (tile, addr)
            // still observes what a prior window left there, mirroring
            // guest DRAM that persists independently of any one TLB
            // window's lifetime.
        }
    }
}
