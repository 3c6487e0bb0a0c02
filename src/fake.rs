//! In-memory fake backends
//!
//! Synthetic implementations of the backend capabilities, used by the unit
//! tests and the `test_compose` binary. The fake display device keeps its
//! connector table and framebuffer registry in plain maps, the fake
//! allocator tracks outstanding bytes so leak checks are trivial, and the
//! recording sink journals callback order.

use crate::backend::{
    ConnectorState, DisplayDevice, DisplayMode, EventSink, GpuAllocator, MemoryHandle, Output,
    Pipe, PAGE_SIZE,
};
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;

const FB_ID_BASE: u32 = 100;

/// Shared order journal. Fakes append one line per observable action so
/// tests can assert cross-component ordering.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn index_of(&self, prefix: &str) -> Option<usize> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .position(|e| e.starts_with(prefix))
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Default)]
struct VsyncGate {
    /// Pending tick timestamps per pipe index.
    ticks: Mutex<[VecDeque<u64>; 3]>,
    cond: Condvar,
    enabled: [AtomicBool; 3],
}

/// Fake display device: connector table, framebuffer registry, vsync gate
/// and an overlay register log.
pub struct FakeDisplayDevice {
    journal: Journal,
    connectors: Mutex<HashMap<Output, ConnectorState>>,
    framebuffers: Mutex<HashMap<u32, MemoryHandle>>,
    fb_counter: AtomicU32,
    bound: Mutex<HashMap<Output, (u32, DisplayMode)>>,
    gate: VsyncGate,
    register_log: Mutex<Vec<(u32, u32)>>,
    fail_next_set_mode: AtomicBool,
    fail_next_add_fb: AtomicBool,
    fail_enable_vsync: AtomicBool,
    fail_disable_vsync: AtomicBool,
}

impl FakeDisplayDevice {
    /// A device with the primary panel connected at 720x1280@60 and
    /// nothing else plugged.
    pub fn new(journal: Journal) -> Self {
        let mut panel_mode = DisplayMode::new(720, 1280, 60);
        panel_mode.preferred = true;
        let panel = ConnectorState {
            connected: true,
            has_encoder: true,
            has_crtc: true,
            modes: vec![panel_mode],
        };
        let mut connectors = HashMap::new();
        connectors.insert(Output::PanelA, panel);
        connectors.insert(Output::PanelB, ConnectorState::default());
        connectors.insert(Output::External, ConnectorState::default());
        Self {
            journal,
            connectors: Mutex::new(connectors),
            framebuffers: Mutex::new(HashMap::new()),
            fb_counter: AtomicU32::new(FB_ID_BASE),
            bound: Mutex::new(HashMap::new()),
            gate: VsyncGate::default(),
            register_log: Mutex::new(Vec::new()),
            fail_next_set_mode: AtomicBool::new(false),
            fail_next_add_fb: AtomicBool::new(false),
            fail_enable_vsync: AtomicBool::new(false),
            fail_disable_vsync: AtomicBool::new(false),
        }
    }

    pub fn set_connector(&self, output: Output, state: ConnectorState) {
        self.connectors.lock().unwrap().insert(output, state);
    }

    /// Plug the external output with the given mode list.
    pub fn plug_external(&self, modes: Vec<DisplayMode>) {
        self.set_connector(
            Output::External,
            ConnectorState {
                connected: true,
                has_encoder: true,
                has_crtc: true,
                modes,
            },
        );
    }

    pub fn unplug_external(&self) {
        self.set_connector(Output::External, ConnectorState::default());
    }

    /// Queue one vsync tick; a blocked `wait_vsync` on that pipe consumes it.
    pub fn tick(&self, pipe: Pipe, timestamp_ns: u64) {
        let mut ticks = self.gate.ticks.lock().unwrap();
        ticks[pipe.index() as usize].push_back(timestamp_ns);
        self.gate.cond.notify_all();
    }

    pub fn vsync_enabled(&self, pipe: Pipe) -> bool {
        self.gate.enabled[pipe.index() as usize].load(Ordering::Relaxed)
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.lock().unwrap().len()
    }

    pub fn bound_mode(&self, output: Output) -> Option<DisplayMode> {
        self.bound.lock().unwrap().get(&output).map(|(_, m)| *m)
    }

    /// All overlay register writes so far, as (engine_mask, ovadd) pairs.
    pub fn register_writes(&self) -> Vec<(u32, u32)> {
        self.register_log.lock().unwrap().clone()
    }

    pub fn fail_next_set_mode(&self) {
        self.fail_next_set_mode.store(true, Ordering::Relaxed);
    }

    pub fn fail_next_add_fb(&self) {
        self.fail_next_add_fb.store(true, Ordering::Relaxed);
    }

    pub fn set_fail_enable_vsync(&self, fail: bool) {
        self.fail_enable_vsync.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_disable_vsync(&self, fail: bool) {
        self.fail_disable_vsync.store(fail, Ordering::Relaxed);
    }
}

impl DisplayDevice for FakeDisplayDevice {
    fn detect_connector(&self, output: Output) -> Result<ConnectorState> {
        let connectors = self.connectors.lock().unwrap();
        Ok(connectors.get(&output).cloned().unwrap_or_default())
    }

    fn set_mode(&self, output: Output, fb_id: u32, mode: &DisplayMode) -> Result<()> {
        if self.fail_next_set_mode.swap(false, Ordering::Relaxed) {
            return Err(Error::ModeSetting {
                output,
                reason: "injected failure".into(),
            });
        }
        self.bound.lock().unwrap().insert(output, (fb_id, *mode));
        self.journal.push(format!("set_mode {} {}", output, mode));
        debug!("fake set_mode {} fb={} {}", output, fb_id, mode);
        Ok(())
    }

    fn add_framebuffer(
        &self,
        handle: MemoryHandle,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<u32> {
        if self.fail_next_add_fb.swap(false, Ordering::Relaxed) {
            return Err(Error::Device("injected add_framebuffer failure".into()));
        }
        let id = self.fb_counter.fetch_add(1, Ordering::Relaxed);
        self.framebuffers.lock().unwrap().insert(id, handle);
        self.journal
            .push(format!("add_fb {} {}x{} stride={}", id, width, height, stride));
        Ok(id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> Result<()> {
        let removed = self.framebuffers.lock().unwrap().remove(&fb_id);
        if removed.is_none() {
            return Err(Error::Device(format!("unknown framebuffer {}", fb_id)));
        }
        self.journal.push(format!("remove_fb {}", fb_id));
        Ok(())
    }

    fn set_power(&self, output: Output, on: bool) -> Result<()> {
        self.journal.push(format!("set_power {} {}", output, on));
        Ok(())
    }

    fn enable_vsync(&self, pipe: Pipe) -> Result<()> {
        if self.fail_enable_vsync.load(Ordering::Relaxed) {
            return Err(Error::Device(format!("vsync enable failed on pipe {}", pipe)));
        }
        self.gate.enabled[pipe.index() as usize].store(true, Ordering::Relaxed);
        self.journal.push(format!("vsync_on {}", pipe));
        Ok(())
    }

    fn disable_vsync(&self, pipe: Pipe) -> Result<()> {
        if self.fail_disable_vsync.load(Ordering::Relaxed) {
            return Err(Error::Device(format!(
                "vsync disable failed on pipe {}",
                pipe
            )));
        }
        self.gate.enabled[pipe.index() as usize].store(false, Ordering::Relaxed);
        // wake any wait blocked on this pipe so it can observe the disable
        self.gate.cond.notify_all();
        self.journal.push(format!("vsync_off {}", pipe));
        Ok(())
    }

    fn wait_vsync(&self, pipe: Pipe) -> Result<u64> {
        let idx = pipe.index() as usize;
        let mut ticks = self.gate.ticks.lock().unwrap();
        loop {
            if let Some(ts) = ticks[idx].pop_front() {
                return Ok(ts);
            }
            if !self.gate.enabled[idx].load(Ordering::Relaxed) {
                return Err(Error::Device(format!(
                    "vsync wait aborted: pipe {} disabled",
                    pipe
                )));
            }
            ticks = self.gate.cond.wait(ticks).unwrap();
        }
    }

    fn wait_vblank(&self, pipe: Pipe) -> Result<()> {
        // Scan-out drains are instant here; the journal keeps the ordering.
        self.journal.push(format!("wait_vblank {}", pipe));
        Ok(())
    }

    fn write_overlay(&self, engine_mask: u32, ovadd: u32) -> Result<()> {
        self.register_log.lock().unwrap().push((engine_mask, ovadd));
        self.journal
            .push(format!("write_overlay mask={:#x} ovadd={:#010x}", engine_mask, ovadd));
        Ok(())
    }
}

struct FakeAllocation {
    data: Box<[u8]>,
    size: u32,
    gtt_offset: Option<u32>,
}

/// Fake GPU allocator tracking outstanding bytes.
pub struct FakeGpuAllocator {
    allocations: Mutex<HashMap<u64, FakeAllocation>>,
    id_counter: AtomicU64,
    gtt_page_counter: AtomicU32,
    outstanding: AtomicU64,
    fail_alloc: AtomicBool,
    /// -1 disabled; n >= 0 lets n allocations succeed, then fails once.
    fail_alloc_countdown: AtomicI64,
    fail_gtt_map: AtomicBool,
    fail_unmap: AtomicBool,
    fail_free: AtomicBool,
}

impl FakeGpuAllocator {
    pub fn new() -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            gtt_page_counter: AtomicU32::new(16),
            outstanding: AtomicU64::new(0),
            fail_alloc: AtomicBool::new(false),
            fail_alloc_countdown: AtomicI64::new(-1),
            fail_gtt_map: AtomicBool::new(false),
            fail_unmap: AtomicBool::new(false),
            fail_free: AtomicBool::new(false),
        }
    }

    /// Bytes currently allocated and not yet freed.
    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn set_fail_alloc(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::Relaxed);
    }

    /// Let `n` further allocations succeed, then fail the next one.
    pub fn fail_alloc_after(&self, n: u32) {
        self.fail_alloc_countdown.store(n as i64, Ordering::Relaxed);
    }

    pub fn set_fail_gtt_map(&self, fail: bool) {
        self.fail_gtt_map.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_unmap(&self, fail: bool) {
        self.fail_unmap.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_free(&self, fail: bool) {
        self.fail_free.store(fail, Ordering::Relaxed);
    }
}

impl Default for FakeGpuAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuAllocator for FakeGpuAllocator {
    fn alloc(&self, size: u32, _align: u32) -> Result<MemoryHandle> {
        if self.fail_alloc.load(Ordering::Relaxed) {
            return Err(Error::BufferAlloc("injected alloc failure".into()));
        }
        match self.fail_alloc_countdown.load(Ordering::Relaxed) {
            -1 => {}
            0 => {
                self.fail_alloc_countdown.store(-1, Ordering::Relaxed);
                return Err(Error::BufferAlloc("injected alloc failure".into()));
            }
            _ => {
                self.fail_alloc_countdown.fetch_sub(1, Ordering::Relaxed);
            }
        }
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let allocation = FakeAllocation {
            data: vec![0u8; size as usize].into_boxed_slice(),
            size,
            gtt_offset: None,
        };
        self.allocations.lock().unwrap().insert(id, allocation);
        self.outstanding.fetch_add(size as u64, Ordering::Relaxed);
        debug!("fake alloc {} ({} bytes)", id, size);
        Ok(MemoryHandle(id))
    }

    fn free(&self, handle: MemoryHandle) -> Result<()> {
        if self.fail_free.load(Ordering::Relaxed) {
            return Err(Error::BufferAlloc(format!("injected free failure for {}", handle)));
        }
        let removed = self.allocations.lock().unwrap().remove(&handle.0);
        match removed {
            Some(a) => {
                self.outstanding.fetch_sub(a.size as u64, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::BufferAlloc(format!("unknown allocation {}", handle))),
        }
    }

    fn map_to_translation_table(&self, handle: MemoryHandle, _align: u32) -> Result<u32> {
        if self.fail_gtt_map.load(Ordering::Relaxed) {
            return Err(Error::GttMap(format!("injected map failure for {}", handle)));
        }
        let mut allocations = self.allocations.lock().unwrap();
        let allocation = allocations
            .get_mut(&handle.0)
            .ok_or_else(|| Error::GttMap(format!("unknown allocation {}", handle)))?;
        let pages = (allocation.size + PAGE_SIZE - 1) / PAGE_SIZE;
        let offset = self.gtt_page_counter.fetch_add(pages, Ordering::Relaxed);
        allocation.gtt_offset = Some(offset);
        Ok(offset)
    }

    fn unmap_from_translation_table(&self, handle: MemoryHandle) -> Result<()> {
        if self.fail_unmap.load(Ordering::Relaxed) {
            return Err(Error::GttMap(format!("injected unmap failure for {}", handle)));
        }
        let mut allocations = self.allocations.lock().unwrap();
        let allocation = allocations
            .get_mut(&handle.0)
            .ok_or_else(|| Error::GttMap(format!("unknown allocation {}", handle)))?;
        allocation.gtt_offset = None;
        Ok(())
    }

    fn cpu_map(&self, handle: MemoryHandle) -> Result<*mut u8> {
        let mut allocations = self.allocations.lock().unwrap();
        let allocation = allocations
            .get_mut(&handle.0)
            .ok_or_else(|| Error::BufferAlloc(format!("unknown allocation {}", handle)))?;
        Ok(allocation.data.as_mut_ptr())
    }
}

/// Event sink capturing everything the composer reports upward.
pub struct RecordingSink {
    journal: Journal,
    vsyncs: Mutex<Vec<(u64, Pipe)>>,
    hotplugs: Mutex<Vec<(Output, bool)>>,
    invalidates: AtomicU32,
}

impl RecordingSink {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            vsyncs: Mutex::new(Vec::new()),
            hotplugs: Mutex::new(Vec::new()),
            invalidates: AtomicU32::new(0),
        }
    }

    pub fn vsyncs(&self) -> Vec<(u64, Pipe)> {
        self.vsyncs.lock().unwrap().clone()
    }

    pub fn hotplugs(&self) -> Vec<(Output, bool)> {
        self.hotplugs.lock().unwrap().clone()
    }

    pub fn invalidate_count(&self) -> u32 {
        self.invalidates.load(Ordering::Relaxed)
    }
}

impl EventSink for RecordingSink {
    fn hotplug(&self, output: Output, connected: bool) {
        self.hotplugs.lock().unwrap().push((output, connected));
        self.journal.push(format!("hotplug {} {}", output, connected));
    }

    fn vsync(&self, timestamp_ns: u64, pipe: Pipe) {
        self.vsyncs.lock().unwrap().push((timestamp_ns, pipe));
    }

    fn invalidate(&self) {
        self.invalidates.fetch_add(1, Ordering::Relaxed);
    }
}
