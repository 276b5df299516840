//! Hardware address-translation window pool.
//!
//! The accelerator exposes a small, fixed number of hardware TLB entries
//! through its kernel driver. Each entry, once configured, projects an
//! aligned slice of a tile's physical address space into a host virtual
//! address range reachable via `mmap`. Everything above this module —
//! the cluster facade, the console, the virtio transport — reaches
//! guest memory exclusively through windows handed out here.
//!
//! Most windows are the small 2 MiB class used for register-like
//! access and the console's ring buffers. The cluster facade also asks
//! for two much larger windows (one per DRAM-sized region) to expose a
//! linear view of all of guest memory; the pool tracks capacity
//! per size class so the two uses don't compete for the same slots.
//!
//! This mirrors the way `examples/loks0n-carbon/src/kvm/vm.rs`'s `VmFd`
//! owns the one scarce KVM resource (the vCPU file descriptor) and
//! hands out safe views over it; here the scarce resource is
//! per-size-class window count.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::ddi::{Ddi, DdiError, NocTlbConfig, RawTlb};

/// The small window size class used for register-like access, the
/// console's ring buffers, and ephemeral `read32`/`write32` calls.
pub const WINDOW_SIZE_2M: u64 = 2 * 1024 * 1024;

/// Default number of concurrently held 2 MiB windows a pool allows.
///
/// The kernel driver does not report a capability for this, so the
/// pool is constructed with an explicit capacity per size class chosen
/// by the caller. This constant is what the cluster facade uses for
/// the 2 MiB class absent an override.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum TlbError {
    /// No free window of the requested size class. Non-fatal: callers
    /// may retry once a window is released.
    #[error("TLB pool exhausted for size class {0:#x}")]
    PoolExhausted(u64),

    /// A 16/32/64-bit access was not naturally aligned. Contract
    /// violation; fatal to the caller.
    #[error("misaligned access: offset {offset:#x} not aligned to {width}")]
    Misaligned { offset: u64, width: u64 },

    /// A window-relative address exceeded the window's usable span.
    /// Contract violation; fatal to the caller.
    #[error("out of bounds: offset {offset:#x} width {width} exceeds usable span {usable:#x}")]
    OutOfBounds { offset: u64, width: u64, usable: u64 },

    #[error(transparent)]
    Ddi(#[from] DdiError),
}

struct SizeClass {
    free_slots: HashSet<usize>,
}

struct PoolInner {
    classes: HashMap<u64, SizeClass>,
}

/// A process-wide pool of translation windows backed by one open device
/// handle. Internally serialized: concurrent `acquire` calls from
/// multiple threads, including across different size classes, are
/// safe and race-free.
pub struct TlbPool<D: Ddi> {
    ddi: Arc<D>,
    inner: Mutex<PoolInner>,
}

impl<D: Ddi> TlbPool<D> {
    /// Build an empty pool. Size classes are registered lazily the
    /// first time [`TlbPool::with_capacity`] is called for them, or
    /// eagerly via [`TlbPool::register_class`].
    pub fn new(ddi: Arc<D>) -> Self {
        Self {
            ddi,
            inner: Mutex::new(PoolInner {
                classes: HashMap::new(),
            }),
        }
    }

    /// Convenience constructor registering the default 2 MiB class at
    /// [`DEFAULT_POOL_CAPACITY`].
    pub fn with_default_capacity(ddi: Arc<D>) -> Self {
        let pool = Self::new(ddi);
        pool.register_class(WINDOW_SIZE_2M, DEFAULT_POOL_CAPACITY);
        pool
    }

    /// Ensure a size class exists with room for `capacity` concurrently
    /// held windows of that size. A no-op if the class is already
    /// registered (first caller's capacity wins) — callers that share
    /// one process-wide pool across several facades for the same size
    /// class must not each reset it, or they'd stomp each other's
    /// outstanding slots.
    pub fn register_class(&self, size: u64, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.classes.entry(size).or_insert_with(|| SizeClass {
            free_slots: (0..capacity).collect(),
        });
    }

    /// Acquire a window covering `target_addr` on tile `(tile_x,
    /// tile_y)`, of the given `size` size class.
    ///
    /// `target_addr` is aligned down to `size` (which must be a power
    /// of two); the low bits lost to alignment become the returned
    /// window's `offset`, and the window's usable span is
    /// `size - offset`.
    pub fn acquire(
        self: &Arc<Self>,
        tile_x: u16,
        tile_y: u16,
        target_addr: u64,
        size: u64,
    ) -> Result<TlbWindow<D>, TlbError> {
        debug_assert!(size.is_power_of_two());
        let mask = size - 1;

        let slot = {
            let mut inner = self.inner.lock().unwrap();
            let class = inner
                .classes
                .entry(size)
                .or_insert_with(|| SizeClass {
                    free_slots: HashSet::new(),
                });
            class
                .free_slots
                .iter()
                .next()
                .copied()
                .map(|s| {
                    class.free_slots.remove(&s);
                    s
                })
                .ok_or(TlbError::PoolExhausted(size))?
        };

        let aligned = target_addr & !mask;
        let offset = target_addr & mask;

        let raw = match self.ddi.allocate_tlb(size) {
            Ok(raw) => raw,
            Err(e) => {
                self.release_slot(size, slot);
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .ddi
            .configure_tlb(raw.id, NocTlbConfig::new(tile_x, tile_y, aligned))
        {
            let _ = self.ddi.free_tlb(raw.id);
            self.release_slot(size, slot);
            return Err(e.into());
        }

        let ptr = match self.ddi.map(&raw) {
            Ok(ptr) => ptr,
            Err(e) => {
                let _ = self.ddi.free_tlb(raw.id);
                self.release_slot(size, slot);
                return Err(e.into());
            }
        };

        Ok(TlbWindow {
            pool: Arc::clone(self),
            slot,
            size,
            raw,
            offset,
            ptr,
        })
    }

    fn release_slot(&self, size: u64, slot: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(class) = inner.classes.get_mut(&size) {
            class.free_slots.insert(slot);
        }
    }

    /// Number of slots currently free for `size`, for diagnostics and
    /// tests. Zero if the class was never registered.
    pub fn free_count(&self, size: u64) -> usize {
        self.inner
            .lock()
            .unwrap()
            .classes
            .get(&size)
            .map(|c| c.free_slots.len())
            .unwrap_or(0)
    }
}

/// An owning handle to one configured, mapped TLB window.
///
/// Dropping a window unmaps its host mapping, frees the on-device TLB
/// entry, and returns the pool slot to the free list, in that order.
pub struct TlbWindow<D: Ddi> {
    pool: Arc<TlbPool<D>>,
    slot: usize,
    size: u64,
    raw: RawTlb,
    offset: u64,
    ptr: *mut u8,
}

// The window's pointer targets a device mmap shared across threads by
// construction (the pool serializes acquisition, not access); callers
// are responsible for not racing on a single window's contents.
unsafe impl<D: Ddi> Send for TlbWindow<D> {}

impl<D: Ddi> TlbWindow<D> {
    /// Bytes usable starting at `offset` within this window.
    pub fn usable_len(&self) -> u64 {
        self.size - self.offset
    }

    fn check_bounds(&self, rel_offset: u64, width: u64) -> Result<(), TlbError> {
        if rel_offset % width != 0 {
            return Err(TlbError::Misaligned {
                offset: rel_offset,
                width,
            });
        }
        if rel_offset + width > self.usable_len() {
            return Err(TlbError::OutOfBounds {
                offset: rel_offset,
                width,
                usable: self.usable_len(),
            });
        }
        Ok(())
    }

    /// Volatile 32-bit read at `rel_offset` bytes into this window's
    /// usable span. `rel_offset` must be 4-byte aligned.
    pub fn read32(&self, rel_offset: u64) -> Result<u32, TlbError> {
        self.check_bounds(rel_offset, 4)?;
        let addr = unsafe { self.ptr.add((self.offset + rel_offset) as usize) } as *const u32;
        Ok(unsafe { std::ptr::read_volatile(addr) })
    }

    /// Volatile 32-bit write at `rel_offset` bytes into this window's
    /// usable span. `rel_offset` must be 4-byte aligned.
    pub fn write32(&self, rel_offset: u64, value: u32) -> Result<(), TlbError> {
        self.check_bounds(rel_offset, 4)?;
        let addr = unsafe { self.ptr.add((self.offset + rel_offset) as usize) } as *mut u32;
        unsafe { std::ptr::write_volatile(addr, value) };
        Ok(())
    }

    /// Raw host pointer to the start of this window's usable span
    /// (i.e. already advanced past the alignment offset). Used by the
    /// cluster facade to build a linear view over a persistent window.
    pub fn usable_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.add(self.offset as usize) }
    }
}

impl<D: Ddi> Drop for TlbWindow<D> {
    fn drop(&mut self) {
        unsafe { self.pool.ddi.unmap(self.ptr, self.size as usize) };
        let _ = self.pool.ddi.free_tlb(self.raw.id);
        self.pool.release_slot(self.size, self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddi::fake::FakeDdi;

    fn pool_2m(capacity: usize) -> Arc<TlbPool<FakeDdi>> {
        let pool = Arc::new(TlbPool::new(Arc::new(FakeDdi::new())));
        pool.register_class(WINDOW_SIZE_2M, capacity);
        pool
    }

    #[test]
    fn acquire_aligns_and_records_offset() {
        let pool = pool_2m(4);
        let window = pool
            .acquire(8, 3, 0x4000_3000_1234, WINDOW_SIZE_2M)
            .unwrap();
        assert_eq!(window.offset, 0x1234);
        assert_eq!(window.usable_len(), WINDOW_SIZE_2M - 0x1234);
    }

    #[test]
    fn acquire_exhausts_pool() {
        let pool = pool_2m(2);
        let a = pool.acquire(8, 3, 0, WINDOW_SIZE_2M).unwrap();
        let b = pool.acquire(8, 3, WINDOW_SIZE_2M, WINDOW_SIZE_2M).unwrap();
        assert!(matches!(
            pool.acquire(8, 3, WINDOW_SIZE_2M * 2, WINDOW_SIZE_2M),
            Err(TlbError::PoolExhausted(WINDOW_SIZE_2M))
        ));
        drop(a);
        drop(b);
    }

    #[test]
    fn drop_returns_slot_to_free_list() {
        let pool = pool_2m(1);
        {
            let _w = pool.acquire(8, 3, 0, WINDOW_SIZE_2M).unwrap();
            assert_eq!(pool.free_count(WINDOW_SIZE_2M), 0);
        }
        assert_eq!(pool.free_count(WINDOW_SIZE_2M), 1);
    }

    #[test]
    fn conservation_across_many_acquire_drop_cycles() {
        let pool = pool_2m(4);
        let initial = pool.free_count(WINDOW_SIZE_2M);
        for _ in 0..50 {
            let w1 = pool.acquire(8, 3, 0, WINDOW_SIZE_2M).unwrap();
            let w2 = pool
                .acquire(8, 9, WINDOW_SIZE_2M, WINDOW_SIZE_2M)
                .unwrap();
            drop(w1);
            drop(w2);
        }
        assert_eq!(pool.free_count(WINDOW_SIZE_2M), initial);
    }

    #[test]
    fn read_write_round_trip() {
        let pool = pool_2m(1);
        let window = pool.acquire(8, 3, 0, WINDOW_SIZE_2M).unwrap();
        window.write32(0, 0xdead_beef).unwrap();
        assert_eq!(window.read32(0).unwrap(), 0xdead_beef);
    }

    #[test]
    fn misaligned_access_rejected() {
        let pool = pool_2m(1);
        let window = pool.acquire(8, 3, 0, WINDOW_SIZE_2M).unwrap();
        assert!(window.read32(2).is_err());
    }

    #[test]
    fn out_of_bounds_access_rejected() {
        let pool = pool_2m(1);
        let window = pool.acquire(8, 3, 0x100, WINDOW_SIZE_2M).unwrap();
        assert!(window.read32(WINDOW_SIZE_2M).is_err());
    }

    #[test]
    fn concurrent_acquire_exactly_one_exhausted() {
        use std::thread;
        let pool = pool_2m(1);
        let pool_a = Arc::clone(&pool);
        let pool_b = Arc::clone(&pool);
        let a = thread::spawn(move || pool_a.acquire(8, 3, 0, WINDOW_SIZE_2M).is_ok());
        let b = thread::spawn(move || pool_b.acquire(8, 3, 0, WINDOW_SIZE_2M).is_ok());
        let results = [a.join().unwrap(), b.join().unwrap()];
        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    }

    #[test]
    fn distinct_size_classes_do_not_compete() {
        let pool = Arc::new(TlbPool::new(Arc::new(FakeDdi::new())));
        pool.register_class(WINDOW_SIZE_2M, 1);
        pool.register_class(4 * 1024 * 1024 * 1024, 1);
        let small = pool.acquire(8, 3, 0, WINDOW_SIZE_2M).unwrap();
        let large = pool
            .acquire(8, 3, 0x4000_3000_0000, 4 * 1024 * 1024 * 1024)
            .unwrap();
        assert_eq!(pool.free_count(WINDOW_SIZE_2M), 0);
        assert_eq!(pool.free_count(4 * 1024 * 1024 * 1024), 0);
        drop(small);
        drop(large);
    }
}
