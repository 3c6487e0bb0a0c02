//! Top-level composer service.
//!
//! Owns every subsystem and wires events between them: the resource
//! cache and hot-plug orchestrator keep outputs bound, the vsync
//! controller follows the routing state, and posts flow through a
//! buffer pool into the overlay pipeline. One instance serves a device.

use std::os::unix::io::RawFd;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{
    align_up, DisplayDevice, DisplayMode, EventSink, GpuAllocator, Output, Rect, PAGE_SIZE,
    STRIDE_ALIGN,
};
use crate::buffers::{BufferPool, OverlayBufferManager};
use crate::config::ComposerConfig;
use crate::hotplug::{HotplugOrchestrator, Phase};
use crate::modes::{DisplayResourceCache, Topology};
use crate::post::{format_planes, FrameDescriptor, OverlayPostingPipeline, PlaneData};
use crate::shared::{OverlayUsage, SharedOverlayContext};
use crate::vsync::{compute_target, Routing, VsyncSourceController};
use crate::Result;

/// Pool buffers must hold the largest frame any output can show. Sized
/// for doubled packed rows and 32-row luma padding, with two pages of
/// slack for plane alignment. 1080p is the floor so a display plugged
/// after start-up still fits.
fn frame_pool_bytes(cache: &DisplayResourceCache) -> u32 {
    let mut best = (1920u32, 1088u32);
    for output in Output::ALL {
        for mode in &cache.state(output).modes {
            if mode.hdisplay * mode.vdisplay > best.0 * best.1 {
                best = (mode.hdisplay, mode.vdisplay);
            }
        }
    }
    let stride = align_up(best.0 * 2, STRIDE_ALIGN);
    align_up(stride * align_up(best.1, 32) + 2 * PAGE_SIZE, PAGE_SIZE)
}

pub struct Composer {
    cache: Arc<DisplayResourceCache>,
    orchestrator: Arc<HotplugOrchestrator>,
    vsync: VsyncSourceController,
    manager: OverlayBufferManager,
    pool: BufferPool,
    shared: Arc<SharedOverlayContext>,
    pipeline: Mutex<OverlayPostingPipeline>,
    routing: Mutex<Routing>,
    vsync_on: AtomicBool,
}

impl Composer {
    /// Bring up every connected output, create the shared context and
    /// the buffer pool, and leave vsync delivery off until asked for.
    pub fn new(
        device: Arc<dyn DisplayDevice>,
        gpu: Arc<dyn GpuAllocator>,
        sink: Arc<dyn EventSink>,
        config: ComposerConfig,
    ) -> Result<Self> {
        let cache = Arc::new(DisplayResourceCache::new(device.clone(), gpu.clone()));
        let orchestrator = Arc::new(HotplugOrchestrator::new(
            cache.clone(),
            device.clone(),
            sink.clone(),
            Duration::from_millis(config.disconnect_ack_timeout_ms),
        ));
        cache.detect_all();
        for output in Output::ALL {
            if cache.is_connected(output) {
                orchestrator.handle_hotplug(output, true, None)?;
            }
        }
        info!("start-up topology {:?}", cache.topology());

        let shared = Arc::new(SharedOverlayContext::create()?);
        shared.set_topology(cache.topology());
        for output in Output::ALL {
            shared.set_output_timing(output, cache.active_mode(output).as_ref());
        }

        let manager = OverlayBufferManager::new(gpu);
        let pool = BufferPool::new();
        let bytes = frame_pool_bytes(&cache);
        let unwind = |pool: &BufferPool, manager: &OverlayBufferManager| {
            for buffer in pool.drain() {
                if let Err(e) = manager.destroy(buffer) {
                    warn!("pool unwind: {}", e);
                }
            }
        };
        for _ in 0..config.buffer_pool_size {
            match manager.allocate(bytes, None) {
                Ok(buffer) => pool.put(buffer),
                Err(e) => {
                    unwind(&pool, &manager);
                    return Err(e);
                }
            }
        }
        debug!("buffer pool ready: {} x {} bytes", config.buffer_pool_size, bytes);

        let register_page = match manager.allocate(PAGE_SIZE, None) {
            Ok(buffer) => buffer,
            Err(e) => {
                unwind(&pool, &manager);
                return Err(e);
            }
        };
        let pipeline = match OverlayPostingPipeline::new(
            device.clone(),
            cache.clone(),
            shared.clone(),
            register_page,
            0,
            &config,
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unwind(&pool, &manager);
                return Err(e);
            }
        };

        let panel_hz = cache
            .active_mode(Output::PanelA)
            .map(|m| m.vrefresh)
            .filter(|&hz| hz > 0)
            .unwrap_or_else(|| config.fallback_refresh_hz.max(1));
        let vsync =
            VsyncSourceController::new(device, sink, 1_000_000_000u64 / u64::from(panel_hz));

        Ok(Self {
            cache,
            orchestrator,
            vsync,
            manager,
            pool,
            shared,
            pipeline: Mutex::new(pipeline),
            routing: Mutex::new(Routing::default()),
            vsync_on: AtomicBool::new(false),
        })
    }

    pub fn topology(&self) -> Topology {
        self.cache.topology()
    }

    pub fn active_mode(&self, output: Output) -> Option<DisplayMode> {
        self.cache.active_mode(output)
    }

    pub fn connector_phase(&self, output: Output) -> Phase {
        self.orchestrator.phase(output)
    }

    pub fn active_vsync_mask(&self) -> u32 {
        self.vsync.active_mask()
    }

    pub fn last_vsync_ns(&self) -> u64 {
        self.vsync.last_timestamp()
    }

    pub fn free_buffers(&self) -> usize {
        self.pool.free_count()
    }

    /// File descriptor clients pass to [`SharedOverlayContext::open`].
    pub fn shared_fd(&self) -> RawFd {
        self.shared.shared_fd()
    }

    pub fn shared_size(&self) -> usize {
        self.shared.shared_size()
    }

    /// Gate vsync delivery. Enabling also arms the sources the current
    /// routing asks for; disabling disarms them all.
    pub fn vsync_control(&self, enabled: bool) {
        self.vsync_on.store(enabled, Ordering::Relaxed);
        if enabled {
            self.vsync.apply(self.current_target());
            self.vsync.vsync_control(true);
        } else {
            self.vsync.vsync_control(false);
            self.vsync.apply(0);
        }
    }

    /// Swap the content routing. Takes effect on vsync sources at once
    /// and on the overlay pipe at the next post.
    pub fn set_routing(&self, routing: Routing) {
        info!("routing {:?}", routing);
        *self.routing.lock().unwrap() = routing;
        self.pipeline.lock().unwrap().set_presentation(routing.mode);
        self.reapply_vsync();
    }

    /// Device hot-plug notification. Shared state and vsync sources are
    /// refreshed even when the plug-in itself fails, so a half-changed
    /// topology is never left behind.
    pub fn handle_hotplug_event(
        &self,
        output: Output,
        connected: bool,
        mode_hint: Option<&DisplayMode>,
    ) -> Result<()> {
        let result = self.orchestrator.handle_hotplug(output, connected, mode_hint);
        self.refresh_shared();
        self.reapply_vsync();
        result
    }

    /// Rebind an output to a new timing while it stays connected.
    pub fn handle_dynamic_mode_set(&self, output: Output, mode: &DisplayMode) -> Result<()> {
        let result = self.orchestrator.handle_dynamic_mode_set(output, mode);
        self.refresh_shared();
        self.reapply_vsync();
        result
    }

    /// Acknowledge a pending disconnect on behalf of the presentation
    /// layer.
    pub fn hotplug_ack(&self) {
        self.orchestrator.ack();
    }

    /// Move the overlay window. Clamping happens at post time.
    pub fn set_overlay_position(&self, rect: Rect) -> Result<()> {
        self.shared.set_position(0, rect)
    }

    /// Copy `planes` into a pool buffer laid out for the engine and
    /// flip the overlay to it. `frame.gtt_offset_pages` is assigned
    /// here and need not be set by the caller.
    pub fn post_frame(&self, frame: &FrameDescriptor, planes: &PlaneData<'_>) -> Result<()> {
        frame.validate()?;
        let buffer = self.pool.get()?;
        // Pool pages are mapped for this process only; nothing else
        // writes them while the buffer is checked out.
        let region = unsafe { slice::from_raw_parts_mut(buffer.vaddr, buffer.size as usize) };
        let result = format_planes(frame, planes, region).and_then(|()| {
            let mut desc = *frame;
            desc.gtt_offset_pages = buffer.gtt_offset;
            self.shared.set_usage(0, OverlayUsage::Video)?;
            self.pipeline.lock().unwrap().post(&desc)
        });
        self.pool.put(buffer);
        result
    }

    /// Stop workers, blank the overlay and return every allocation.
    /// Reports the first release failure after attempting them all.
    pub fn shutdown(self) -> Result<()> {
        let Composer {
            mut vsync,
            orchestrator,
            pipeline,
            pool,
            shared,
            manager,
            ..
        } = self;
        vsync.shutdown();
        orchestrator.shutdown();

        let mut first_err = None;
        let mut pipeline = pipeline.into_inner().unwrap();
        if let Err(e) = pipeline.disable() {
            warn!("overlay disable at shutdown: {}", e);
            first_err.get_or_insert(e);
        }
        if let Err(e) = manager.destroy(pipeline.into_buffer()) {
            warn!("register page release: {}", e);
            first_err.get_or_insert(e);
        }

        pool.shutdown();
        for buffer in pool.drain() {
            if let Err(e) = manager.destroy(buffer) {
                warn!("pool buffer release: {}", e);
                first_err.get_or_insert(e);
            }
        }

        match Arc::try_unwrap(shared) {
            Ok(context) => {
                if context.destroy() {
                    debug!("shared overlay context torn down");
                }
            }
            Err(_) => warn!("shared overlay context still referenced at shutdown"),
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn current_target(&self) -> u32 {
        compute_target(self.cache.topology(), &self.routing.lock().unwrap())
    }

    fn reapply_vsync(&self) {
        if self.vsync_on.load(Ordering::Relaxed) {
            self.vsync.apply(self.current_target());
        }
    }

    /// Push the cached topology and timings into the shared context and
    /// flag the change so the next post re-evaluates its pipe.
    fn refresh_shared(&self) {
        let topology = self.cache.topology();
        self.shared.set_topology(topology);
        for output in Output::ALL {
            self.shared
                .set_output_timing(output, self.cache.active_mode(output).as_ref());
        }
        self.shared.set_mode_changed();
        debug!("shared state refreshed, topology {:?}", topology);
    }
}
