//! Display resource cache and mode selection
//!
//! Tracks connector/mode/framebuffer state per physical output and picks
//! display timings with a deterministic tie-break: exact request match,
//! then the output's preferred mode, then the largest active area (higher
//! refresh wins ties). Selection only updates the cache; callers drive the
//! actual mode-set.

use crate::backend::{
    align_up, DisplayDevice, DisplayMode, GpuAllocator, MemoryHandle, Output, PAGE_SIZE,
    STRIDE_ALIGN,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Bytes per scan-out pixel (XRGB8888).
const FB_BYTES_PER_PIXEL: u32 = 4;

/// Cached state for one physical output.
#[derive(Debug, Clone, Default)]
pub struct OutputState {
    pub connected: bool,
    /// Currently selected timing; `None` means no valid mode.
    pub mode: Option<DisplayMode>,
    pub fb_id: Option<u32>,
    pub fb_handle: Option<MemoryHandle>,
    /// Advertised mode list from the last detection pass.
    pub modes: Vec<DisplayMode>,
}

/// Output topology derived from which outputs are connected. The external
/// display takes precedence: while it is plugged the overlay follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Unknown,
    PanelA,
    PanelB,
    DualPanel,
    External,
}

impl Topology {
    pub fn to_u32(self) -> u32 {
        match self {
            Topology::Unknown => 0,
            Topology::PanelA => 1,
            Topology::PanelB => 2,
            Topology::DualPanel => 3,
            Topology::External => 4,
        }
    }

    pub fn from_u32(raw: u32) -> Topology {
        match raw {
            1 => Topology::PanelA,
            2 => Topology::PanelB,
            3 => Topology::DualPanel,
            4 => Topology::External,
            _ => Topology::Unknown,
        }
    }
}

/// Connector/encoder/CRTC/framebuffer cache for every physical output.
pub struct DisplayResourceCache {
    device: Arc<dyn DisplayDevice>,
    gpu: Arc<dyn GpuAllocator>,
    outputs: Mutex<HashMap<Output, OutputState>>,
}

impl DisplayResourceCache {
    pub fn new(device: Arc<dyn DisplayDevice>, gpu: Arc<dyn GpuAllocator>) -> Self {
        let mut outputs = HashMap::new();
        for output in Output::ALL {
            outputs.insert(output, OutputState::default());
        }
        Self {
            device,
            gpu,
            outputs: Mutex::new(outputs),
        }
    }

    /// Refresh one output from the device. A connector without an encoder
    /// or CRTC is cached as disconnected, not reported as an error.
    pub fn detect(&self, output: Output) -> Result<OutputState> {
        let connector = self.device.detect_connector(output)?;
        let connected = connector.connected && connector.has_encoder && connector.has_crtc;
        if connector.connected && !connected {
            debug!("output {} has no encoder/CRTC, treating as disconnected", output);
        }
        let mut outputs = self.outputs.lock().unwrap();
        let state = outputs.entry(output).or_default();
        state.connected = connected;
        state.modes = connector.modes;
        Ok(state.clone())
    }

    /// Refresh every output. Per-output query failures mark that output
    /// disconnected and the pass continues.
    pub fn detect_all(&self) {
        for output in Output::ALL {
            if let Err(e) = self.detect(output) {
                warn!("detection failed for {}: {}", output, e);
                self.mark_disconnected(output);
            }
        }
    }

    /// Pick a timing from `modes`: exact request match first, then the
    /// preferred mode, then the largest area with refresh breaking ties.
    pub fn pick_mode(modes: &[DisplayMode], requested: Option<&DisplayMode>) -> Option<DisplayMode> {
        let mut preferred = None;
        let mut largest: Option<DisplayMode> = None;
        for mode in modes {
            if let Some(req) = requested {
                if mode.vrefresh == req.vrefresh
                    && mode.hdisplay == req.hdisplay
                    && mode.vdisplay == req.vdisplay
                    && mode.flags_contain(req.flags)
                {
                    return Some(*mode);
                }
            }
            if mode.preferred && preferred.is_none() {
                preferred = Some(*mode);
            }
            largest = match largest {
                None => Some(*mode),
                Some(cur)
                    if mode.area() > cur.area()
                        || (mode.area() == cur.area() && mode.vrefresh > cur.vrefresh) =>
                {
                    Some(*mode)
                }
                Some(cur) => Some(cur),
            };
        }
        preferred.or(largest)
    }

    /// Select and cache a timing for the output.
    pub fn select_mode(
        &self,
        output: Output,
        requested: Option<&DisplayMode>,
    ) -> Result<DisplayMode> {
        let mut outputs = self.outputs.lock().unwrap();
        let state = outputs.entry(output).or_default();
        let mode = Self::pick_mode(&state.modes, requested).ok_or(Error::NoMode(output))?;
        state.mode = Some(mode);
        info!("selected mode {} for {}", mode, output);
        Ok(mode)
    }

    /// Null-safe timing comparison; no current mode always counts as changed.
    pub fn is_mode_changed(current: Option<&DisplayMode>, requested: &DisplayMode) -> bool {
        match current {
            None => true,
            Some(cur) => {
                !(cur.hdisplay == requested.hdisplay
                    && cur.vdisplay == requested.vdisplay
                    && cur.vrefresh == requested.vrefresh
                    && cur.flags_contain(requested.flags))
            }
        }
    }

    /// Allocate scan-out memory sized to `mode` and register it as a
    /// framebuffer. The allocation is released if registration fails.
    pub fn create_framebuffer(&self, output: Output, mode: &DisplayMode) -> Result<u32> {
        let stride = align_up(mode.hdisplay * FB_BYTES_PER_PIXEL, STRIDE_ALIGN);
        let size = align_up(stride * mode.vdisplay, PAGE_SIZE);
        let handle = self.gpu.alloc(size, PAGE_SIZE)?;
        let fb_id = match self
            .device
            .add_framebuffer(handle, mode.hdisplay, mode.vdisplay, stride)
        {
            Ok(id) => id,
            Err(e) => {
                if let Err(fe) = self.gpu.free(handle) {
                    warn!("orphaned framebuffer memory {}: {}", handle, fe);
                }
                return Err(e);
            }
        };
        let mut outputs = self.outputs.lock().unwrap();
        let state = outputs.entry(output).or_default();
        state.fb_id = Some(fb_id);
        state.fb_handle = Some(handle);
        debug!("framebuffer {} ({} bytes) bound to {}", fb_id, size, output);
        Ok(fb_id)
    }

    /// Bind the cached framebuffer and mode through the device.
    pub fn bind_mode(&self, output: Output) -> Result<()> {
        let (fb_id, mode) = {
            let outputs = self.outputs.lock().unwrap();
            let state = outputs.get(&output).cloned().unwrap_or_default();
            let fb_id = state
                .fb_id
                .ok_or_else(|| Error::Device(format!("no framebuffer bound to {}", output)))?;
            let mode = state.mode.ok_or(Error::NoMode(output))?;
            (fb_id, mode)
        };
        self.device.set_mode(output, fb_id, &mode)
    }

    /// Unregister and free the output's framebuffer. Both steps are
    /// attempted; the first failure is reported.
    pub fn release_framebuffer(&self, output: Output) -> Result<()> {
        let (fb_id, handle) = {
            let mut outputs = self.outputs.lock().unwrap();
            let state = outputs.entry(output).or_default();
            (state.fb_id.take(), state.fb_handle.take())
        };
        let mut first_err = None;
        if let Some(id) = fb_id {
            if let Err(e) = self.device.remove_framebuffer(id) {
                warn!("framebuffer {} removal failed: {}", id, e);
                first_err = Some(e);
            }
        }
        if let Some(h) = handle {
            if let Err(e) = self.gpu.free(h) {
                warn!("framebuffer memory {} free failed: {}", h, e);
                first_err = first_err.or(Some(e));
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Drop the cached connection and timing, as after a plug-out.
    pub fn mark_disconnected(&self, output: Output) {
        let mut outputs = self.outputs.lock().unwrap();
        let state = outputs.entry(output).or_default();
        state.connected = false;
        state.mode = None;
    }

    pub fn state(&self, output: Output) -> OutputState {
        self.outputs
            .lock()
            .unwrap()
            .get(&output)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_mode(&self, output: Output) -> Option<DisplayMode> {
        self.outputs
            .lock()
            .unwrap()
            .get(&output)
            .and_then(|s| s.mode)
    }

    pub fn is_connected(&self, output: Output) -> bool {
        self.outputs
            .lock()
            .unwrap()
            .get(&output)
            .map(|s| s.connected)
            .unwrap_or(false)
    }

    /// Topology from the current connection set; the external display wins
    /// while plugged.
    pub fn topology(&self) -> Topology {
        let outputs = self.outputs.lock().unwrap();
        let connected = |o: Output| outputs.get(&o).map(|s| s.connected).unwrap_or(false);
        if connected(Output::External) {
            Topology::External
        } else if connected(Output::PanelA) && connected(Output::PanelB) {
            Topology::DualPanel
        } else if connected(Output::PanelA) {
            Topology::PanelA
        } else if connected(Output::PanelB) {
            Topology::PanelB
        } else {
            Topology::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MODE_FLAG_INTERLACE;
    use crate::fake::{FakeDisplayDevice, FakeGpuAllocator, Journal};
    use proptest::prelude::*;

    fn mode(h: u32, v: u32, r: u32) -> DisplayMode {
        DisplayMode::new(h, v, r)
    }

    fn cache_with_fakes() -> (DisplayResourceCache, Arc<FakeDisplayDevice>, Arc<FakeGpuAllocator>)
    {
        let device = Arc::new(FakeDisplayDevice::new(Journal::new()));
        let gpu = Arc::new(FakeGpuAllocator::new());
        let cache = DisplayResourceCache::new(device.clone(), gpu.clone());
        (cache, device, gpu)
    }

    #[test]
    fn test_exact_match_wins() {
        let modes = vec![mode(1280, 720, 60), mode(1920, 1080, 60), mode(1920, 1080, 30)];
        let req = mode(1920, 1080, 30);
        let picked = DisplayResourceCache::pick_mode(&modes, Some(&req)).unwrap();
        assert_eq!(picked.vrefresh, 30);
        assert_eq!(picked.hdisplay, 1920);
    }

    #[test]
    fn test_flag_containment_in_match() {
        let mut interlaced = mode(1920, 1080, 60);
        interlaced.flags = MODE_FLAG_INTERLACE;
        let modes = vec![interlaced];

        // request with no flags matches the flagged mode
        let plain = mode(1920, 1080, 60);
        assert!(DisplayResourceCache::pick_mode(&modes, Some(&plain)).is_some());

        // request with interlace matches only interlaced timings
        let progressive_only = vec![mode(1920, 1080, 60)];
        let mut req = mode(1920, 1080, 60);
        req.flags = MODE_FLAG_INTERLACE;
        let picked = DisplayResourceCache::pick_mode(&progressive_only, Some(&req)).unwrap();
        // no exact match: falls through to largest-area
        assert_eq!(picked.flags, 0);
    }

    #[test]
    fn test_preferred_beats_largest() {
        let mut small = mode(1280, 720, 60);
        small.preferred = true;
        let modes = vec![mode(1920, 1080, 60), small];
        let picked = DisplayResourceCache::pick_mode(&modes, None).unwrap();
        assert_eq!(picked.hdisplay, 1280);
    }

    #[test]
    fn test_fallback_largest_area_refresh_tiebreak() {
        let modes = vec![mode(1920, 1080, 60), mode(1920, 1080, 30), mode(1280, 720, 60)];
        let picked = DisplayResourceCache::pick_mode(&modes, None).unwrap();
        assert_eq!((picked.hdisplay, picked.vdisplay, picked.vrefresh), (1920, 1080, 60));
    }

    #[test]
    fn test_mode_changed_null_safe() {
        let m = mode(1920, 1080, 60);
        assert!(DisplayResourceCache::is_mode_changed(None, &m));
        assert!(!DisplayResourceCache::is_mode_changed(Some(&m), &m));
        let other = mode(1280, 720, 60);
        assert!(DisplayResourceCache::is_mode_changed(Some(&m), &other));
    }

    #[test]
    fn test_detect_missing_crtc_is_disconnected() {
        let (cache, device, _gpu) = cache_with_fakes();
        device.set_connector(
            Output::External,
            crate::backend::ConnectorState {
                connected: true,
                has_encoder: true,
                has_crtc: false,
                modes: vec![mode(1920, 1080, 60)],
            },
        );
        let state = cache.detect(Output::External).unwrap();
        assert!(!state.connected);
        // the mode list is still cached for later selection
        assert_eq!(state.modes.len(), 1);
    }

    #[test]
    fn test_framebuffer_roundtrip_releases_memory() {
        let (cache, device, gpu) = cache_with_fakes();
        let m = mode(720, 1280, 60);
        let fb = cache.create_framebuffer(Output::PanelA, &m).unwrap();
        assert_eq!(device.framebuffer_count(), 1);
        assert!(gpu.outstanding_bytes() > 0);
        assert_eq!(cache.state(Output::PanelA).fb_id, Some(fb));
        cache.release_framebuffer(Output::PanelA).unwrap();
        assert_eq!(device.framebuffer_count(), 0);
        assert_eq!(gpu.outstanding_bytes(), 0);
    }

    #[test]
    fn test_framebuffer_registration_failure_frees_allocation() {
        let (cache, device, gpu) = cache_with_fakes();
        device.fail_next_add_fb();
        let m = mode(720, 1280, 60);
        assert!(cache.create_framebuffer(Output::PanelA, &m).is_err());
        assert_eq!(gpu.outstanding_bytes(), 0);
    }

    #[test]
    fn test_topology_precedence() {
        let (cache, device, _gpu) = cache_with_fakes();
        cache.detect_all();
        assert_eq!(cache.topology(), Topology::PanelA);
        device.plug_external(vec![mode(1920, 1080, 60)]);
        cache.detect_all();
        assert_eq!(cache.topology(), Topology::External);
        device.unplug_external();
        cache.detect_all();
        assert_eq!(cache.topology(), Topology::PanelA);
    }

    fn arb_mode() -> impl Strategy<Value = DisplayMode> {
        (1u32..8, 1u32..8, prop::sample::select(vec![24u32, 30, 50, 60, 75]))
            .prop_map(|(h, v, r)| mode(h * 256, v * 256, r))
    }

    proptest! {
        #[test]
        fn prop_exact_match_is_order_independent(
            mut modes in prop::collection::vec(arb_mode(), 1..12),
            pick in 0usize..12,
        ) {
            let req = modes[pick % modes.len()];
            let picked = DisplayResourceCache::pick_mode(&modes, Some(&req)).unwrap();
            prop_assert_eq!(
                (picked.hdisplay, picked.vdisplay, picked.vrefresh),
                (req.hdisplay, req.vdisplay, req.vrefresh)
            );
            modes.reverse();
            let picked = DisplayResourceCache::pick_mode(&modes, Some(&req)).unwrap();
            prop_assert_eq!(
                (picked.hdisplay, picked.vdisplay, picked.vrefresh),
                (req.hdisplay, req.vdisplay, req.vrefresh)
            );
        }

        #[test]
        fn prop_fallback_is_maximal(modes in prop::collection::vec(arb_mode(), 1..12)) {
            let picked = DisplayResourceCache::pick_mode(&modes, None).unwrap();
            for m in &modes {
                prop_assert!(picked.area() >= m.area());
                if m.area() == picked.area() {
                    prop_assert!(picked.vrefresh >= m.vrefresh);
                }
            }
        }
    }
}
