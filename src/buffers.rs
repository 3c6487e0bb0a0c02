//! Overlay buffer lifecycle and the free-buffer pool
//!
//! Overlay buffers are page-aligned GPU allocations mapped into the
//! display engine's translation table: one control-block buffer per
//! handle, plus an optional data buffer for pre-formatting pixel planes.
//! Allocation is two-phase (alloc, then table map) and the partial
//! failure path releases whatever succeeded. A small condvar-guarded
//! pool recycles pre-allocated buffers between frames.

use crate::backend::{align_up, GpuAllocator, MemoryHandle, PAGE_SIZE};
use crate::{Error, Result};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, warn};

/// Secondary allocation used to pre-format pixel planes before scan-out.
#[derive(Debug)]
pub struct DataBuffer {
    pub handle: MemoryHandle,
    pub vaddr: *mut u8,
    /// Translation-table offset in pages.
    pub gtt_offset: u32,
    pub size: u32,
}

/// One GPU-mapped overlay buffer. Owned exclusively by the manager's
/// caller from allocation to destruction, never aliased across overlays.
#[derive(Debug)]
pub struct OverlayBufferHandle {
    pub handle: MemoryHandle,
    pub vaddr: *mut u8,
    /// Translation-table offset in pages.
    pub gtt_offset: u32,
    pub size: u32,
    pub data: Option<DataBuffer>,
}

impl OverlayBufferHandle {
    /// Translation-table byte offset of the control block.
    pub fn gtt_byte_offset(&self) -> u32 {
        self.gtt_offset * PAGE_SIZE
    }

    /// Translation-table byte offset of the data buffer, if present.
    pub fn data_gtt_byte_offset(&self) -> Option<u32> {
        self.data.as_ref().map(|d| d.gtt_offset * PAGE_SIZE)
    }
}

// Handles travel between the posting path and the pool; the raw CPU
// mappings they carry are only dereferenced by the owning thread.
unsafe impl Send for OverlayBufferHandle {}

/// Allocates and destroys GPU-mapped overlay buffers.
pub struct OverlayBufferManager {
    gpu: Arc<dyn GpuAllocator>,
}

impl OverlayBufferManager {
    pub fn new(gpu: Arc<dyn GpuAllocator>) -> Self {
        Self { gpu }
    }

    fn allocate_one(&self, size: u32) -> Result<(MemoryHandle, *mut u8, u32, u32)> {
        let size = align_up(size.max(1), PAGE_SIZE);
        let handle = self.gpu.alloc(size, PAGE_SIZE)?;
        let gtt_offset = match self.gpu.map_to_translation_table(handle, PAGE_SIZE) {
            Ok(offset) => offset,
            Err(e) => {
                // no leak on the partial-failure path
                if let Err(fe) = self.gpu.free(handle) {
                    warn!("orphaned allocation {} after map failure: {}", handle, fe);
                }
                return Err(e);
            }
        };
        let vaddr = match self.gpu.cpu_map(handle) {
            Ok(addr) => addr,
            Err(e) => {
                self.release_one(handle);
                return Err(e);
            }
        };
        Ok((handle, vaddr, gtt_offset, size))
    }

    fn release_one(&self, handle: MemoryHandle) -> Option<Error> {
        let mut first_err = None;
        if let Err(e) = self.gpu.unmap_from_translation_table(handle) {
            warn!("translation-table unmap failed for {}: {}", handle, e);
            first_err = Some(e);
        }
        if let Err(e) = self.gpu.free(handle) {
            warn!("free failed for {}: {}", handle, e);
            first_err = first_err.or(Some(e));
        }
        first_err
    }

    /// Allocate a control-block buffer of at least `size` bytes, plus an
    /// optional data buffer, both page-aligned and table-mapped. Nothing
    /// is leaked when a later step fails.
    pub fn allocate(&self, size: u32, data_size: Option<u32>) -> Result<OverlayBufferHandle> {
        let (handle, vaddr, gtt_offset, size) = self.allocate_one(size)?;
        let data = match data_size {
            None => None,
            Some(ds) => match self.allocate_one(ds) {
                Ok((dh, dv, dg, dsz)) => Some(DataBuffer {
                    handle: dh,
                    vaddr: dv,
                    gtt_offset: dg,
                    size: dsz,
                }),
                Err(e) => {
                    self.release_one(handle);
                    return Err(e);
                }
            },
        };
        debug!(
            "overlay buffer {} allocated: {} bytes at table page {}",
            handle, size, gtt_offset
        );
        Ok(OverlayBufferHandle {
            handle,
            vaddr,
            gtt_offset,
            size,
            data,
        })
    }

    /// Unmap and free the buffer and its data buffer. Unmap always runs
    /// before free; every step is attempted and the first failure is
    /// reported.
    pub fn destroy(&self, buffer: OverlayBufferHandle) -> Result<()> {
        let mut first_err = self.release_one(buffer.handle);
        if let Some(data) = buffer.data {
            first_err = first_err.or(self.release_one(data.handle));
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

struct PoolState {
    free: Vec<OverlayBufferHandle>,
    shutting_down: bool,
}

/// Condition-variable-guarded pool of pre-allocated overlay buffers.
///
/// `get` blocks until a buffer is free or the pool is shut down; `put`
/// returns one and wakes a waiter.
pub struct BufferPool {
    state: Mutex<PoolState>,
    available: Condvar,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: Vec::new(),
                shutting_down: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Return a buffer to the pool and wake one waiter.
    pub fn put(&self, buffer: OverlayBufferHandle) {
        let mut state = self.state.lock().unwrap();
        state.free.push(buffer);
        self.available.notify_one();
    }

    /// Take a free buffer, blocking until one is available.
    pub fn get(&self) -> Result<OverlayBufferHandle> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutting_down {
                return Err(Error::ShuttingDown);
            }
            if let Some(buffer) = state.free.pop() {
                return Ok(buffer);
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Take a free buffer without blocking.
    pub fn try_get(&self) -> Option<OverlayBufferHandle> {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return None;
        }
        state.free.pop()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    /// Unblock every waiter; subsequent `get` calls fail.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutting_down = true;
        self.available.notify_all();
    }

    /// Remove all pooled buffers for teardown.
    pub fn drain(&self) -> Vec<OverlayBufferHandle> {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.free)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeGpuAllocator;
    use proptest::prelude::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn manager() -> (OverlayBufferManager, Arc<FakeGpuAllocator>) {
        let gpu = Arc::new(FakeGpuAllocator::new());
        (OverlayBufferManager::new(gpu.clone()), gpu)
    }

    #[test]
    fn test_allocate_destroy_is_leak_free() {
        let (mgr, gpu) = manager();
        let buffer = mgr.allocate(5000, Some(100_000)).unwrap();
        assert!(gpu.outstanding_bytes() > 0);
        // sizes are rounded up to whole pages
        assert_eq!(buffer.size % PAGE_SIZE, 0);
        assert_eq!(buffer.data.as_ref().unwrap().size % PAGE_SIZE, 0);
        mgr.destroy(buffer).unwrap();
        assert_eq!(gpu.outstanding_bytes(), 0);
    }

    #[test]
    fn test_map_failure_releases_allocation() {
        let (mgr, gpu) = manager();
        gpu.set_fail_gtt_map(true);
        assert!(mgr.allocate(4096, None).is_err());
        assert_eq!(gpu.outstanding_bytes(), 0);
    }

    #[test]
    fn test_data_buffer_failure_releases_control_block() {
        let (mgr, gpu) = manager();
        // control block succeeds, data buffer allocation fails
        gpu.fail_alloc_after(1);
        assert!(mgr.allocate(4096, Some(4096)).is_err());
        assert_eq!(gpu.outstanding_bytes(), 0);
    }

    #[test]
    fn test_destroy_reports_unmap_failure_but_still_frees() {
        let (mgr, gpu) = manager();
        let buffer = mgr.allocate(4096, None).unwrap();
        gpu.set_fail_unmap(true);
        assert!(mgr.destroy(buffer).is_err());
        // the free step still ran
        assert_eq!(gpu.outstanding_bytes(), 0);
    }

    #[test]
    fn test_pool_get_blocks_until_put() {
        let (mgr, _gpu) = manager();
        let pool = Arc::new(BufferPool::new());
        let (tx, rx) = mpsc::channel();

        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || {
            let buffer = waiter_pool.get().unwrap();
            tx.send(buffer.size).unwrap();
        });

        // the getter must still be blocked
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        pool.put(mgr.allocate(4096, None).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 4096);
        waiter.join().unwrap();
    }

    #[test]
    fn test_pool_shutdown_unblocks_waiter() {
        let pool = Arc::new(BufferPool::new());
        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || waiter_pool.get());
        thread::sleep(Duration::from_millis(20));
        pool.shutdown();
        assert!(matches!(waiter.join().unwrap(), Err(Error::ShuttingDown)));
        assert!(pool.try_get().is_none());
    }

    #[test]
    fn test_pool_drain_returns_everything() {
        let (mgr, gpu) = manager();
        let pool = BufferPool::new();
        for _ in 0..3 {
            pool.put(mgr.allocate(4096, None).unwrap());
        }
        assert_eq!(pool.free_count(), 3);
        for buffer in pool.drain() {
            mgr.destroy(buffer).unwrap();
        }
        assert_eq!(pool.free_count(), 0);
        assert_eq!(gpu.outstanding_bytes(), 0);
    }

    proptest! {
        #[test]
        fn prop_teardown_returns_all_bytes(
            size in 1u32..1_000_000,
            data_size in prop::option::of(1u32..1_000_000),
        ) {
            let (mgr, gpu) = manager();
            let buffer = mgr.allocate(size, data_size)?;
            prop_assert!(gpu.outstanding_bytes() >= size as u64);
            mgr.destroy(buffer).unwrap();
            prop_assert_eq!(gpu.outstanding_bytes(), 0);
        }
    }
}
