//! Vsync source arbitration and delivery
//!
//! At most one hardware pipe (or the software-timed fallback) feeds
//! vsync to the windowing server at a time. The target source set is a
//! pure function of output topology and content routing; `apply`
//! reconciles it against hardware, reporting the mask that actually
//! took effect. One waiter thread services every active hardware pipe
//! in a fixed order per pass, and a second thread synthesizes vsync on
//! an absolute-deadline chain when no hardware source is selected.
//! Delivery is filtered by a separately-locked interested mask so a
//! disable never races an in-flight event.

use crate::backend::{DisplayDevice, EventSink, Pipe};
use crate::modes::Topology;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Primary panel hardware source (pipe A).
pub const SOURCE_HW_PRIMARY: u32 = 1 << 0;
/// External display hardware source (pipe B).
pub const SOURCE_HW_EXTERNAL: u32 = 1 << 1;
/// Software-timed fallback source.
pub const SOURCE_SOFTWARE: u32 = 1 << 3;

const HW_MASK: u32 = SOURCE_HW_PRIMARY | SOURCE_HW_EXTERNAL;
const ALL_SOURCES: u32 = HW_MASK | SOURCE_SOFTWARE;

/// Fixed hardware service order: primary panel first, then external.
const HW_SOURCES: [(u32, Pipe); 2] = [
    (SOURCE_HW_PRIMARY, Pipe::A),
    (SOURCE_HW_EXTERNAL, Pipe::B),
];

/// Where presented content is currently going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationMode {
    /// Local panel only.
    Local,
    /// External display mirrors the panel.
    Clone,
    /// External display is an independent extended surface.
    Extend,
}

/// Content routing inputs for source selection.
#[derive(Debug, Clone, Copy)]
pub struct Routing {
    pub mode: PresentationMode,
    /// Frames are being consumed by a remote (wireless) receiver.
    pub remote_video_active: bool,
    pub local_playback_active: bool,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            mode: PresentationMode::Local,
            remote_video_active: false,
            local_playback_active: false,
        }
    }
}

/// Select the target source set for the given topology and routing.
///
/// Exactly one hardware bit is set, or the software bit alone when
/// remote consumption leaves no hardware pipe pacing local playback.
pub fn compute_target(topology: Topology, routing: &Routing) -> u32 {
    if routing.remote_video_active && routing.local_playback_active {
        return SOURCE_SOFTWARE;
    }
    if topology == Topology::External && routing.mode == PresentationMode::Extend {
        return SOURCE_HW_EXTERNAL;
    }
    SOURCE_HW_PRIMARY
}

struct ActiveState {
    mask: u32,
    shutting_down: bool,
}

struct VsyncShared {
    active: Mutex<ActiveState>,
    wake: Condvar,
    /// Delivery filter; held independently of `active`.
    interested: Mutex<u32>,
    delivery_enabled: AtomicBool,
    /// Timestamp of the most recent vsync, delivered or filtered.
    last_timestamp: AtomicU64,
    fallback_period_ns: AtomicU64,
    epoch: Instant,
}

impl VsyncShared {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Owns the vsync worker threads and the active source mask.
pub struct VsyncSourceController {
    device: Arc<dyn DisplayDevice>,
    state: Arc<VsyncShared>,
    hw_worker: Option<JoinHandle<()>>,
    sw_worker: Option<JoinHandle<()>>,
}

impl VsyncSourceController {
    pub fn new(
        device: Arc<dyn DisplayDevice>,
        sink: Arc<dyn EventSink>,
        fallback_period_ns: u64,
    ) -> Self {
        let state = Arc::new(VsyncShared {
            active: Mutex::new(ActiveState {
                mask: 0,
                shutting_down: false,
            }),
            wake: Condvar::new(),
            interested: Mutex::new(0),
            delivery_enabled: AtomicBool::new(false),
            last_timestamp: AtomicU64::new(0),
            fallback_period_ns: AtomicU64::new(fallback_period_ns.max(1)),
            epoch: Instant::now(),
        });

        let hw_state = state.clone();
        let hw_device = device.clone();
        let hw_sink = sink.clone();
        let hw_worker = thread::Builder::new()
            .name("vsync-hw".into())
            .spawn(move || hw_worker_loop(hw_state, hw_device, hw_sink))
            .map_err(|e| warn!("vsync hardware worker spawn failed: {}", e))
            .ok();

        let sw_state = state.clone();
        let sw_worker = thread::Builder::new()
            .name("vsync-sw".into())
            .spawn(move || sw_worker_loop(sw_state, sink))
            .map_err(|e| warn!("vsync fallback worker spawn failed: {}", e))
            .ok();

        Self {
            device,
            state,
            hw_worker,
            sw_worker,
        }
    }

    /// Reconcile the active sources against `target`, returning the
    /// mask that actually took effect. A hardware call that fails
    /// leaves that source's bit unchanged.
    pub fn apply(&self, target: u32) -> u32 {
        let mut active = self.state.active.lock().unwrap();
        let mut mask = active.mask;

        for (bit, pipe) in HW_SOURCES {
            if mask & bit != 0 && target & bit == 0 {
                match self.device.disable_vsync(pipe) {
                    Ok(()) => mask &= !bit,
                    Err(e) => warn!("vsync disable failed on pipe {}: {}", pipe, e),
                }
            }
        }
        for (bit, pipe) in HW_SOURCES {
            if mask & bit == 0 && target & bit != 0 {
                match self.device.enable_vsync(pipe) {
                    Ok(()) => mask |= bit,
                    Err(e) => warn!("vsync enable failed on pipe {}: {}", pipe, e),
                }
            }
        }
        if target & SOURCE_SOFTWARE != 0 {
            mask |= SOURCE_SOFTWARE;
        } else {
            mask &= !SOURCE_SOFTWARE;
        }

        if mask != active.mask {
            info!("vsync sources {:#05b} -> {:#05b}", active.mask, mask);
        }
        active.mask = mask;
        self.refresh_interested(mask);
        self.state.wake.notify_all();
        mask
    }

    /// Enable or disable vsync delivery to the windowing server.
    /// Sources keep running; only delivery is gated.
    pub fn vsync_control(&self, enabled: bool) {
        self.state.delivery_enabled.store(enabled, Ordering::SeqCst);
        let mask = self.state.active.lock().unwrap().mask;
        self.refresh_interested(mask);
        debug!("vsync delivery {}", if enabled { "on" } else { "off" });
    }

    fn refresh_interested(&self, active_mask: u32) {
        let mut interested = self.state.interested.lock().unwrap();
        *interested = if self.state.delivery_enabled.load(Ordering::SeqCst) {
            active_mask & ALL_SOURCES
        } else {
            0
        };
    }

    /// Refresh period used by the software fallback, in nanoseconds.
    pub fn set_fallback_period_ns(&self, period_ns: u64) {
        self.state
            .fallback_period_ns
            .store(period_ns.max(1), Ordering::Relaxed);
    }

    pub fn active_mask(&self) -> u32 {
        self.state.active.lock().unwrap().mask
    }

    /// Timestamp of the most recent vsync, delivered or filtered.
    pub fn last_timestamp(&self) -> u64 {
        self.state.last_timestamp.load(Ordering::Relaxed)
    }

    /// Stop both workers and release the hardware sources.
    pub fn shutdown(&mut self) {
        {
            let mut active = self.state.active.lock().unwrap();
            active.shutting_down = true;
            for (bit, pipe) in HW_SOURCES {
                if active.mask & bit != 0 {
                    if let Err(e) = self.device.disable_vsync(pipe) {
                        warn!("vsync disable failed on pipe {} at shutdown: {}", pipe, e);
                    }
                    active.mask &= !bit;
                }
            }
            active.mask &= !SOURCE_SOFTWARE;
            self.state.wake.notify_all();
        }
        if let Some(worker) = self.hw_worker.take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.sw_worker.take() {
            let _ = worker.join();
        }
        info!("vsync controller stopped");
    }
}

impl Drop for VsyncSourceController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn hw_worker_loop(
    state: Arc<VsyncShared>,
    device: Arc<dyn DisplayDevice>,
    sink: Arc<dyn EventSink>,
) {
    loop {
        let mask = {
            let mut active = state.active.lock().unwrap();
            loop {
                if active.shutting_down {
                    return;
                }
                if active.mask & HW_MASK != 0 {
                    break active.mask;
                }
                active = state.wake.wait(active).unwrap();
            }
        };

        // one blocking wait per active pipe, fixed order, sequential
        for (bit, pipe) in HW_SOURCES {
            if mask & bit == 0 {
                continue;
            }
            match device.wait_vsync(pipe) {
                Ok(ts) => {
                    state.last_timestamp.store(ts, Ordering::Relaxed);
                    let deliver = *state.interested.lock().unwrap() & bit != 0;
                    if deliver {
                        sink.vsync(ts, pipe);
                    }
                }
                Err(e) => {
                    debug!("vsync wait on pipe {} returned: {}", pipe, e);
                    // a disabled pipe errors immediately; back off before
                    // the mask is re-read
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

fn sw_worker_loop(state: Arc<VsyncShared>, sink: Arc<dyn EventSink>) {
    let mut deadline_ns: Option<u64> = None;
    loop {
        let tick = {
            let mut active = state.active.lock().unwrap();
            loop {
                if active.shutting_down {
                    return;
                }
                if active.mask & SOURCE_SOFTWARE == 0 {
                    // chain re-seeds when the source comes back
                    deadline_ns = None;
                    active = state.wake.wait(active).unwrap();
                    continue;
                }

                let period = state.fallback_period_ns.load(Ordering::Relaxed).max(1);
                let now = state.now_ns();
                let target = match deadline_ns {
                    Some(t) => t,
                    None => {
                        // seed from the last real vsync so the chain stays
                        // on the hardware's period grid
                        let last = state.last_timestamp.load(Ordering::Relaxed);
                        let base = if last > 0 && last < now { last } else { now };
                        let periods = (now - base) / period + 1;
                        base + periods * period
                    }
                };
                deadline_ns = Some(target);

                if now >= target {
                    break target;
                }
                let wait = Duration::from_nanos(target - now);
                let (guard, _) = state.wake.wait_timeout(active, wait).unwrap();
                active = guard;
            }
        };

        state.last_timestamp.store(tick, Ordering::Relaxed);
        let deliver = *state.interested.lock().unwrap() & SOURCE_SOFTWARE != 0;
        if deliver {
            // the fallback stands in for the primary pipe
            sink.vsync(tick, Pipe::A);
        }

        let period = state.fallback_period_ns.load(Ordering::Relaxed).max(1);
        let now = state.now_ns();
        let mut next = tick + period;
        if next <= now {
            // woke late: resynchronize to the next boundary, no drift
            let behind = (now - next) / period + 1;
            next += behind * period;
        }
        deadline_ns = Some(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDisplayDevice, Journal, RecordingSink};
    use proptest::prelude::*;

    const TEST_PERIOD_NS: u64 = 2_000_000;

    fn controller() -> (
        VsyncSourceController,
        Arc<FakeDisplayDevice>,
        Arc<RecordingSink>,
    ) {
        let journal = Journal::new();
        let device = Arc::new(FakeDisplayDevice::new(journal.clone()));
        let sink = Arc::new(RecordingSink::new(journal));
        let ctl = VsyncSourceController::new(device.clone(), sink.clone(), TEST_PERIOD_NS);
        (ctl, device, sink)
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_target_local_uses_primary() {
        let routing = Routing::default();
        assert_eq!(compute_target(Topology::PanelA, &routing), SOURCE_HW_PRIMARY);
        assert_eq!(compute_target(Topology::DualPanel, &routing), SOURCE_HW_PRIMARY);
        assert_eq!(compute_target(Topology::Unknown, &routing), SOURCE_HW_PRIMARY);
    }

    #[test]
    fn test_target_extend_uses_external() {
        let routing = Routing {
            mode: PresentationMode::Extend,
            ..Routing::default()
        };
        assert_eq!(compute_target(Topology::External, &routing), SOURCE_HW_EXTERNAL);
        // clone presentation keeps the panel pipe as the timing source
        let clone = Routing {
            mode: PresentationMode::Clone,
            ..Routing::default()
        };
        assert_eq!(compute_target(Topology::External, &clone), SOURCE_HW_PRIMARY);
    }

    #[test]
    fn test_target_remote_video_uses_software() {
        let routing = Routing {
            mode: PresentationMode::Extend,
            remote_video_active: true,
            local_playback_active: true,
        };
        assert_eq!(compute_target(Topology::External, &routing), SOURCE_SOFTWARE);
        // remote video without local playback still needs a real source
        let idle = Routing {
            remote_video_active: true,
            ..Routing::default()
        };
        assert_eq!(compute_target(Topology::PanelA, &idle), SOURCE_HW_PRIMARY);
    }

    #[test]
    fn test_apply_enables_and_disables_hardware() {
        let (mut ctl, device, _sink) = controller();
        assert_eq!(ctl.apply(SOURCE_HW_PRIMARY), SOURCE_HW_PRIMARY);
        assert!(device.vsync_enabled(Pipe::A));

        assert_eq!(ctl.apply(SOURCE_HW_EXTERNAL), SOURCE_HW_EXTERNAL);
        assert!(!device.vsync_enabled(Pipe::A));
        assert!(device.vsync_enabled(Pipe::B));

        assert_eq!(ctl.apply(0), 0);
        assert!(!device.vsync_enabled(Pipe::B));
        ctl.shutdown();
    }

    #[test]
    fn test_apply_failure_leaves_bit_unchanged() {
        let (mut ctl, device, _sink) = controller();

        device.set_fail_enable_vsync(true);
        assert_eq!(ctl.apply(SOURCE_HW_PRIMARY), 0);
        device.set_fail_enable_vsync(false);

        assert_eq!(ctl.apply(SOURCE_HW_PRIMARY), SOURCE_HW_PRIMARY);
        device.set_fail_disable_vsync(true);
        // the disable failed, so the source stays active
        assert_eq!(ctl.apply(0), SOURCE_HW_PRIMARY);
        device.set_fail_disable_vsync(false);
        assert_eq!(ctl.apply(0), 0);
        ctl.shutdown();
    }

    #[test]
    fn test_delivery_and_filtering() {
        let (mut ctl, device, sink) = controller();
        ctl.apply(SOURCE_HW_PRIMARY);
        ctl.vsync_control(true);

        device.tick(Pipe::A, 1111);
        assert!(wait_until(|| sink.vsyncs().contains(&(1111, Pipe::A))));

        // filtered events still record their timestamp
        ctl.vsync_control(false);
        device.tick(Pipe::A, 2222);
        assert!(wait_until(|| ctl.last_timestamp() == 2222));
        assert!(!sink.vsyncs().contains(&(2222, Pipe::A)));
        ctl.shutdown();
    }

    #[test]
    fn test_fixed_service_order_primary_then_external() {
        let (mut ctl, device, sink) = controller();
        ctl.vsync_control(true);
        // queue the external tick first; delivery must still lead with
        // the primary pipe within one pass
        device.tick(Pipe::B, 20);
        device.tick(Pipe::A, 10);
        ctl.apply(SOURCE_HW_PRIMARY | SOURCE_HW_EXTERNAL);

        assert!(wait_until(|| sink.vsyncs().len() >= 2));
        let events = sink.vsyncs();
        assert_eq!(events[0], (10, Pipe::A));
        assert_eq!(events[1], (20, Pipe::B));
        ctl.shutdown();
    }

    #[test]
    fn test_software_fallback_ticks_and_monotonic() {
        let (mut ctl, _device, sink) = controller();
        ctl.vsync_control(true);
        ctl.apply(SOURCE_SOFTWARE);

        assert!(wait_until(|| sink.vsyncs().len() >= 3));
        let events = sink.vsyncs();
        for pair in events.windows(2) {
            assert!(pair[1].0 > pair[0].0, "timestamps must advance");
        }
        // the fallback reports on the primary pipe
        assert!(events.iter().all(|&(_, pipe)| pipe == Pipe::A));
        ctl.shutdown();
    }

    #[test]
    fn test_software_fallback_stops_when_hardware_returns() {
        let (mut ctl, _device, sink) = controller();
        ctl.vsync_control(true);
        ctl.apply(SOURCE_SOFTWARE);
        assert!(wait_until(|| !sink.vsyncs().is_empty()));

        ctl.apply(SOURCE_HW_PRIMARY);
        let settled = sink.vsyncs().len();
        thread::sleep(Duration::from_millis(20));
        // at most one in-flight tick may land after the switch
        assert!(sink.vsyncs().len() <= settled + 1);
        ctl.shutdown();
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let (mut ctl, device, _sink) = controller();
        ctl.apply(SOURCE_HW_PRIMARY | SOURCE_SOFTWARE);
        ctl.shutdown();
        assert!(!device.vsync_enabled(Pipe::A));
        assert_eq!(ctl.active_mask(), 0);
    }

    fn arb_topology() -> impl Strategy<Value = Topology> {
        prop::sample::select(vec![
            Topology::Unknown,
            Topology::PanelA,
            Topology::PanelB,
            Topology::DualPanel,
            Topology::External,
        ])
    }

    fn arb_routing() -> impl Strategy<Value = Routing> {
        (
            prop::sample::select(vec![
                PresentationMode::Local,
                PresentationMode::Clone,
                PresentationMode::Extend,
            ]),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(mode, remote, local)| Routing {
                mode,
                remote_video_active: remote,
                local_playback_active: local,
            })
    }

    proptest! {
        #[test]
        fn prop_source_exclusivity(topology in arb_topology(), routing in arb_routing()) {
            let target = compute_target(topology, &routing);
            let hw_bits = (target & HW_MASK).count_ones();
            let sw = target & SOURCE_SOFTWARE != 0;
            // exactly one hardware source, or the software source alone
            prop_assert!(
                (hw_bits == 1 && !sw) || (hw_bits == 0 && sw),
                "target {:#05b}",
                target
            );
        }
    }
}
