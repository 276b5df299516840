//! Cluster facade (L2CPU).
//!
//! Binds a tile's NOC coordinates and DRAM window to the TLB pool so
//! that the rest of the emulator can treat a cluster's guest memory as
//! one flat byte range, and exposes small helpers for single-register
//! access at an arbitrary tile-local address. Grounded directly on the
//! driver-side `L2CPU`/`Tile` split in the original console tooling:
//! `Tile` owns the fd and the persistent-window vector, `L2CPU` adds
//! the starting-address-relative convenience wrappers.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::ddi::Ddi;
use crate::tlb::{TlbError, TlbPool, TlbWindow, WINDOW_SIZE_2M};

/// Static description of one of the four on-die clusters.
#[derive(Debug, Clone, Copy)]
pub struct ClusterInfo {
    pub tile_x: u16,
    pub tile_y: u16,
    pub base_addr: u64,
    pub dram_size: u64,
}

/// Clusters 2 and 3 are configured at the same base address: they
/// share a backing memory tile, so writes through either alias.
pub const CLUSTER_TABLE: [ClusterInfo; 4] = [
    ClusterInfo {
        tile_x: 8,
        tile_y: 3,
        base_addr: 0x4000_3000_0000,
        dram_size: 2 * 1024 * 1024 * 1024,
    },
    ClusterInfo {
        tile_x: 8,
        tile_y: 9,
        base_addr: 0x4000_3000_0000,
        dram_size: 2 * 1024 * 1024 * 1024,
    },
    ClusterInfo {
        tile_x: 8,
        tile_y: 5,
        base_addr: 0x4000_b000_0000,
        dram_size: 4 * 1024 * 1024 * 1024,
    },
    ClusterInfo {
        tile_x: 8,
        tile_y: 7,
        base_addr: 0x4000_b000_0000,
        dram_size: 4 * 1024 * 1024 * 1024,
    },
];

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("cluster index {0} out of range (must be 0..=3)")]
    BadIndex(u8),

    #[error(transparent)]
    Tlb(#[from] TlbError),

    #[error("address {addr:#x} out of bounds (window offset {offset:#x}, usable {usable:#x})")]
    OutOfBounds {
        addr: u64,
        offset: u64,
        usable: u64,
    },
}

/// A raw view over a persistent window's usable span: a plain pointer
/// and length, valid for as long as the [`Cluster`] that produced it
/// is alive (it owns the underlying mapping and never tears it down
/// early). Kept as a bare pointer rather than borrowing the `Cluster`
/// so the console and virtio transport can hold several of these
/// alongside other borrows of the same facade.
#[derive(Debug, Clone, Copy)]
pub struct PersistentWindow {
    ptr: *mut u8,
    len: u64,
}

// Safety mirrors `TlbWindow`: the pointer targets a device mapping
// shared across threads by construction; callers serialize their own
// accesses to a given window's contents.
unsafe impl Send for PersistentWindow {}

impl PersistentWindow {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_bounds(&self, rel_offset: u64, width: u64) -> Result<(), ClusterError> {
        if rel_offset + width > self.len {
            return Err(ClusterError::OutOfBounds {
                addr: rel_offset,
                offset: rel_offset,
                usable: self.len,
            });
        }
        Ok(())
    }

    pub fn read32(&self, rel_offset: u64) -> Result<u32, ClusterError> {
        self.check_bounds(rel_offset, 4)?;
        let addr = unsafe { self.ptr.add(rel_offset as usize) } as *const u32;
        Ok(unsafe { std::ptr::read_volatile(addr) })
    }

    pub fn write32(&self, rel_offset: u64, value: u32) -> Result<(), ClusterError> {
        self.check_bounds(rel_offset, 4)?;
        let addr = unsafe { self.ptr.add(rel_offset as usize) } as *mut u32;
        unsafe { std::ptr::write_volatile(addr, value) };
        Ok(())
    }

    pub fn read64(&self, rel_offset: u64) -> Result<u64, ClusterError> {
        self.check_bounds(rel_offset, 8)?;
        let addr = unsafe { self.ptr.add(rel_offset as usize) } as *const u64;
        Ok(unsafe { std::ptr::read_volatile(addr) })
    }

    pub fn write64(&self, rel_offset: u64, value: u64) -> Result<(), ClusterError> {
        self.check_bounds(rel_offset, 8)?;
        let addr = unsafe { self.ptr.add(rel_offset as usize) } as *mut u64;
        unsafe { std::ptr::write_volatile(addr, value) };
        Ok(())
    }

    pub fn read_u8(&self, rel_offset: u64) -> Result<u8, ClusterError> {
        self.check_bounds(rel_offset, 1)?;
        Ok(unsafe { std::ptr::read_volatile(self.ptr.add(rel_offset as usize)) })
    }

    pub fn write_u8(&self, rel_offset: u64, value: u8) -> Result<(), ClusterError> {
        self.check_bounds(rel_offset, 1)?;
        unsafe { std::ptr::write_volatile(self.ptr.add(rel_offset as usize), value) };
        Ok(())
    }
}

/// The two halves of a cluster's DRAM, each reached through its own
/// TLB window. Kept alive for the facade's lifetime so every other
/// component can treat the cluster's memory as one linear range
/// without re-touching the pool on every access.
struct MemoryAperture<D: Ddi> {
    half_size: u64,
    low: TlbWindow<D>,
    high: TlbWindow<D>,
}

pub struct Cluster<D: Ddi> {
    index: u8,
    info: ClusterInfo,
    pool: Arc<TlbPool<D>>,
    aperture: MemoryAperture<D>,
    persistent: Mutex<Vec<TlbWindow<D>>>,
}

/// How many `Cluster` facades may hold a DRAM-sized window pair at
/// once, per dram-size class. The orchestrator binds one facade per
/// device thread (console, disk, network, optional cloud-init disk)
/// plus one for the shared interrupt register, all against the same
/// cluster index and therefore the same size class; this must cover
/// that count with headroom; see `orchestrator::run`.
const MAX_CONCURRENT_FACADES: usize = 8;

impl<D: Ddi> Cluster<D> {
    /// Bind cluster `index`, acquiring the two large windows that
    /// cover its full DRAM range up front.
    pub fn new(index: u8, pool: Arc<TlbPool<D>>) -> Result<Self, ClusterError> {
        let info = *CLUSTER_TABLE
            .get(index as usize)
            .ok_or(ClusterError::BadIndex(index))?;

        let half_size = info.dram_size / 2;
        pool.register_class(half_size, MAX_CONCURRENT_FACADES * 2);
        let low = pool.acquire(info.tile_x, info.tile_y, info.base_addr, half_size)?;
        let high = pool.acquire(
            info.tile_x,
            info.tile_y,
            info.base_addr + half_size,
            half_size,
        )?;

        Ok(Self {
            index,
            info,
            pool,
            aperture: MemoryAperture {
                half_size,
                low,
                high,
            },
            persistent: Mutex::new(Vec::new()),
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn coordinates(&self) -> (u16, u16) {
        (self.info.tile_x, self.info.tile_y)
    }

    pub fn starting_address(&self) -> u64 {
        self.info.base_addr
    }

    pub fn dram_size(&self) -> u64 {
        self.info.dram_size
    }

    /// Host pointer such that guest physical address `addr` (absolute,
    /// within this cluster's DRAM range) is reachable at the returned
    /// pointer. The two halves are mapped independently, so a byte
    /// range spanning the midpoint is not contiguous in host VA; no
    /// caller needs that today (the console and virtio structures
    /// this emulator places are all smaller than one half).
    pub fn memory_ptr(&self, addr: u64) -> Result<*mut u8, ClusterError> {
        let rel = addr
            .checked_sub(self.info.base_addr)
            .ok_or(ClusterError::OutOfBounds {
                addr,
                offset: 0,
                usable: self.info.dram_size,
            })?;
        if rel >= self.info.dram_size {
            return Err(ClusterError::OutOfBounds {
                addr,
                offset: rel,
                usable: self.info.dram_size,
            });
        }
        let aperture = &self.aperture;
        let ptr = if rel < aperture.half_size {
            unsafe { aperture.low.usable_ptr().add(rel as usize) }
        } else {
            unsafe {
                aperture
                    .high
                    .usable_ptr()
                    .add((rel - aperture.half_size) as usize)
            }
        };
        Ok(ptr)
    }

    /// Volatile 32-bit read at an absolute tile-local address, via a
    /// freshly acquired window torn down at the end of the call.
    pub fn read32_abs(&self, addr: u64) -> Result<u32, ClusterError> {
        let window = self
            .pool
            .acquire(self.info.tile_x, self.info.tile_y, addr, WINDOW_SIZE_2M)?;
        Ok(window.read32(0)?)
    }

    /// Volatile 32-bit write at an absolute tile-local address, via a
    /// freshly acquired window torn down at the end of the call.
    pub fn write32_abs(&self, addr: u64, value: u32) -> Result<(), ClusterError> {
        let window = self
            .pool
            .acquire(self.info.tile_x, self.info.tile_y, addr, WINDOW_SIZE_2M)?;
        Ok(window.write32(0, value)?)
    }

    /// `read32_abs` relative to this cluster's starting address.
    pub fn read32(&self, offset: u64) -> Result<u32, ClusterError> {
        self.read32_abs(self.info.base_addr + offset)
    }

    /// `write32_abs` relative to this cluster's starting address.
    pub fn write32(&self, offset: u64, value: u32) -> Result<(), ClusterError> {
        self.write32_abs(self.info.base_addr + offset, value)
    }

    /// Acquire a persistent 2 MiB window at an absolute address, kept
    /// alive until this cluster is dropped, and return a view over it.
    /// Used to pin down structures (the console descriptor, a device's
    /// MMIO aperture) that are read on every loop iteration and
    /// shouldn't pay the pool round-trip each time.
    pub fn persistent_window(&self, addr: u64) -> Result<PersistentWindow, ClusterError> {
        let window = self
            .pool
            .acquire(self.info.tile_x, self.info.tile_y, addr, WINDOW_SIZE_2M)?;
        let view = PersistentWindow {
            ptr: window.usable_ptr(),
            len: window.usable_len(),
        };
        self.persistent.lock().unwrap().push(window);
        Ok(view)
    }

    /// Relative form of [`Cluster::persistent_window`].
    pub fn persistent_window_offset(&self, offset: u64) -> Result<PersistentWindow, ClusterError> {
        self.persistent_window(self.info.base_addr + offset)
    }

    /// Decode the NOC node-ID register at its fixed absolute address:
    /// bits `[5:0]` are the tile's x coordinate, bits `[11:6]` are y.
    /// Used by the aliasing/identity property tests; nothing in the
    /// device-emulation path reads this itself.
    pub fn node_id(&self) -> Result<(u16, u16), ClusterError> {
        let raw = self.read32_abs(NOC_NODE_ID_ADDR)?;
        let x = (raw & 0x3f) as u16;
        let y = ((raw >> 6) & 0x3f) as u16;
        Ok((x, y))
    }
}

/// Fixed absolute tile-local address of the NOC node-ID register.
pub const NOC_NODE_ID_ADDR: u64 = 0xffff_f7fe_fff5_6044;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddi::fake::FakeDdi;

    fn pool() -> Arc<TlbPool<FakeDdi>> {
        Arc::new(TlbPool::new(Arc::new(FakeDdi::new())))
    }

    #[test]
    fn bad_index_rejected() {
        let pool = pool();
        assert!(matches!(
            Cluster::new(4, pool),
            Err(ClusterError::BadIndex(4))
        ));
    }

    #[test]
    fn coordinates_match_static_table() {
        let pool = pool();
        let cluster = Cluster::new(2, pool).unwrap();
        assert_eq!(cluster.coordinates(), (8, 5));
        assert_eq!(cluster.starting_address(), 0x4000_b000_0000);
    }

    #[test]
    fn clusters_2_and_3_share_base_address() {
        assert_eq!(
            CLUSTER_TABLE[2].base_addr,
            CLUSTER_TABLE[3].base_addr
        );
    }

    #[test]
    fn memory_ptr_spans_both_halves() {
        let pool = pool();
        let cluster = Cluster::new(0, pool).unwrap();
        let base = cluster.starting_address();
        let half = cluster.dram_size() / 2;
        assert!(cluster.memory_ptr(base).is_ok());
        assert!(cluster.memory_ptr(base + half).is_ok());
        assert!(cluster.memory_ptr(base + cluster.dram_size()).is_err());
    }

    #[test]
    fn read32_write32_round_trip_relative() {
        let pool = pool();
        let cluster = Cluster::new(1, pool).unwrap();
        cluster.write32(0x40, 0x1234_5678).unwrap();
        assert_eq!(cluster.read32(0x40).unwrap(), 0x1234_5678);
    }

    #[test]
    fn node_id_decodes_x_and_y_from_fixed_register() {
        let pool = pool();
        let cluster = Cluster::new(2, pool).unwrap();
        let (x, y) = cluster.coordinates();
        // The real register is hardware-populated; against the fake DDI
        // we seed it ourselves to exercise the bit-decoding contract.
        let encoded = (x as u32 & 0x3f) | ((y as u32 & 0x3f) << 6);
        cluster.write32_abs(NOC_NODE_ID_ADDR, encoded).unwrap();
        assert_eq!(cluster.node_id().unwrap(), (x, y));
    }

    #[test]
    fn persistent_window_survives_past_the_call_that_made_it() {
        let pool = pool();
        let cluster = Cluster::new(0, pool).unwrap();
        let view = cluster.persistent_window_offset(0x80).unwrap();
        assert_eq!(cluster.persistent.lock().unwrap().len(), 1);
        view.write32(0, 0x2a).unwrap();
        assert_eq!(view.read32(0).unwrap(), 0x2a);
    }
}
