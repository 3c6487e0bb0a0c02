//! Hot-plug and dynamic mode-set orchestration
//!
//! Connect brings an output up in a fixed sequence: detect, select a
//! timing, allocate and bind a framebuffer, then notify the windowing
//! server. Disconnect runs the other way around and notifies first,
//! then waits (bounded) for the server's acknowledgment before tearing
//! the binding down, so the server never touches a framebuffer that is
//! being freed under it. A mode change on a connected output is a
//! synthesized disconnect/reconnect pair driven through an explicit
//! state machine, because the server only re-reads timing across a
//! connection-state change.

use crate::backend::{DisplayDevice, DisplayMode, EventSink, Output};
use crate::modes::DisplayResourceCache;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Per-output transition phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    PendingConnect,
    Connected,
    PendingDisconnect,
    /// First half of a dynamic mode set.
    Disconnecting,
    /// Second half of a dynamic mode set.
    Reconnecting,
}

enum AckOutcome {
    Acked,
    TimedOut,
    Shutdown,
}

struct AckState {
    acked: bool,
    shutting_down: bool,
}

/// Serializes plug events and mode switches per output.
pub struct HotplugOrchestrator {
    cache: Arc<DisplayResourceCache>,
    device: Arc<dyn DisplayDevice>,
    sink: Arc<dyn EventSink>,
    phases: Mutex<HashMap<Output, Phase>>,
    ack: Mutex<AckState>,
    ack_cond: Condvar,
    ack_timeout: Duration,
}

impl HotplugOrchestrator {
    pub fn new(
        cache: Arc<DisplayResourceCache>,
        device: Arc<dyn DisplayDevice>,
        sink: Arc<dyn EventSink>,
        ack_timeout: Duration,
    ) -> Self {
        let mut phases = HashMap::new();
        for output in Output::ALL {
            phases.insert(output, Phase::Disconnected);
        }
        Self {
            cache,
            device,
            sink,
            phases: Mutex::new(phases),
            ack: Mutex::new(AckState {
                acked: false,
                shutting_down: false,
            }),
            ack_cond: Condvar::new(),
            ack_timeout,
        }
    }

    pub fn phase(&self, output: Output) -> Phase {
        self.phases
            .lock()
            .unwrap()
            .get(&output)
            .copied()
            .unwrap_or(Phase::Disconnected)
    }

    fn set_phase(&self, output: Output, phase: Phase) {
        self.phases.lock().unwrap().insert(output, phase);
    }

    /// Entry point for device hot-plug notifications.
    pub fn handle_hotplug(
        &self,
        output: Output,
        connected: bool,
        mode_hint: Option<&DisplayMode>,
    ) -> Result<()> {
        if connected {
            self.connect(output, mode_hint)
        } else {
            self.disconnect(output)
        }
    }

    fn connect(&self, output: Output, mode_hint: Option<&DisplayMode>) -> Result<()> {
        info!("connect event for {}", output);
        self.set_phase(output, Phase::PendingConnect);
        match self.bring_up(output, mode_hint) {
            Ok(mode) => {
                self.set_phase(output, Phase::Connected);
                self.sink.hotplug(output, true);
                self.sink.invalidate();
                info!("{} connected at {}", output, mode);
                Ok(())
            }
            Err(e) => {
                error!("connect aborted for {}: {}", output, e);
                self.cache.mark_disconnected(output);
                self.set_phase(output, Phase::Disconnected);
                Err(e)
            }
        }
    }

    /// Detect, select, allocate, bind, power on. Returns the bound mode.
    fn bring_up(&self, output: Output, mode_hint: Option<&DisplayMode>) -> Result<DisplayMode> {
        let state = self.cache.detect(output)?;
        if !state.connected {
            return Err(Error::Disconnected(output));
        }
        let mode = self.cache.select_mode(output, mode_hint)?;
        // a repeated connect rebinds; drop any leftover framebuffer first
        if let Err(e) = self.cache.release_framebuffer(output) {
            warn!("stale framebuffer release on {}: {}", output, e);
        }
        self.cache.create_framebuffer(output, &mode)?;
        if let Err(e) = self.cache.bind_mode(output) {
            if let Err(re) = self.cache.release_framebuffer(output) {
                warn!("framebuffer release after failed bind on {}: {}", output, re);
            }
            return Err(e);
        }
        if let Err(e) = self.device.set_power(output, true) {
            warn!("power-on failed for {}: {}", output, e);
        }
        Ok(mode)
    }

    fn disconnect(&self, output: Output) -> Result<()> {
        info!("disconnect event for {}", output);
        self.set_phase(output, Phase::PendingDisconnect);
        let result = self.notify_and_teardown(output);
        self.set_phase(output, Phase::Disconnected);
        result
    }

    /// Server notification, bounded ack wait, then teardown. The
    /// teardown proceeds on timeout; only the wait is bounded.
    fn notify_and_teardown(&self, output: Output) -> Result<()> {
        self.ack.lock().unwrap().acked = false;
        self.sink.hotplug(output, false);
        match self.wait_for_ack() {
            AckOutcome::Acked => debug!("disconnect acknowledged for {}", output),
            AckOutcome::TimedOut => warn!(
                "no disconnect ack within {:?} for {}, tearing down anyway",
                self.ack_timeout, output
            ),
            AckOutcome::Shutdown => {
                debug!("shutdown during disconnect ack wait for {}", output)
            }
        }
        if let Err(e) = self.device.set_power(output, false) {
            warn!("power-off failed for {}: {}", output, e);
        }
        let result = self.cache.release_framebuffer(output);
        self.cache.mark_disconnected(output);
        result
    }

    fn wait_for_ack(&self) -> AckOutcome {
        let deadline = Instant::now() + self.ack_timeout;
        let mut state = self.ack.lock().unwrap();
        loop {
            if state.shutting_down {
                return AckOutcome::Shutdown;
            }
            if state.acked {
                state.acked = false;
                return AckOutcome::Acked;
            }
            let now = Instant::now();
            if now >= deadline {
                return AckOutcome::TimedOut;
            }
            let (guard, _) = self.ack_cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    /// The windowing server acknowledges that it has stopped using the
    /// disconnecting output.
    pub fn ack(&self) {
        let mut state = self.ack.lock().unwrap();
        state.acked = true;
        self.ack_cond.notify_all();
    }

    /// Cancel any pending ack wait; further waits return immediately.
    pub fn shutdown(&self) {
        let mut state = self.ack.lock().unwrap();
        state.shutting_down = true;
        self.ack_cond.notify_all();
    }

    /// Mode change on a connected output, as a synthesized
    /// disconnect/reconnect pair. Equal timing is a no-op.
    pub fn handle_dynamic_mode_set(&self, output: Output, hint: &DisplayMode) -> Result<()> {
        if !self.cache.is_connected(output) {
            return Err(Error::Disconnected(output));
        }
        let current = self.cache.active_mode(output);
        if !DisplayResourceCache::is_mode_changed(current.as_ref(), hint) {
            debug!("mode set to current timing on {}, nothing to do", output);
            return Ok(());
        }

        info!("dynamic mode set on {}: {}", output, hint);
        self.set_phase(output, Phase::Disconnecting);
        if let Err(e) = self.notify_and_teardown(output) {
            warn!("teardown during mode set on {} reported: {}", output, e);
        }

        self.set_phase(output, Phase::Reconnecting);
        match self.bring_up(output, Some(hint)) {
            Ok(mode) => {
                self.set_phase(output, Phase::Connected);
                self.sink.hotplug(output, true);
                self.sink.invalidate();
                info!("{} reconnected at {}", output, mode);
                Ok(())
            }
            Err(e) => {
                // no rollback: the output stays down until the next real
                // hot-plug event re-drives the connect path
                error!("reconnect aborted for {}: {}", output, e);
                self.cache.mark_disconnected(output);
                self.set_phase(output, Phase::Disconnected);
                Err(e)
            }
        }
    }
}
