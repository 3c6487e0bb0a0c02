//! Cross-process shared overlay context
//!
//! One memfd-backed region shared by every process driving the overlay
//! engine. It carries per-overlay placement (pipe, usage, destination
//! rectangle), the last-detected timing for every output, the current
//! output topology and a mode-changed flag, all guarded by a
//! process-shared pthread mutex that lives inside the region itself.
//! A reference count in the region decides which process tears the
//! mutex down: the one that observes the count reach zero, and it must
//! do so before unmapping.

use crate::backend::{DisplayMode, Output, Pipe, Rect};
use crate::modes::Topology;
use crate::{Error, Result};
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Number of overlay engines (A and C on dual-pipe hardware).
pub const OVERLAY_COUNT: usize = 2;

const OUTPUT_COUNT: usize = 3;
const REGION_NAME: &[u8] = b"overlay-shared-ctx\0";

/// What an overlay engine is currently carrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayUsage {
    Unused,
    Video,
    Graphics,
}

impl OverlayUsage {
    fn to_u32(self) -> u32 {
        match self {
            OverlayUsage::Unused => 0,
            OverlayUsage::Video => 1,
            OverlayUsage::Graphics => 2,
        }
    }

    fn from_u32(raw: u32) -> OverlayUsage {
        match raw {
            1 => OverlayUsage::Video,
            2 => OverlayUsage::Graphics,
            _ => OverlayUsage::Unused,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SharedTiming {
    width: u32,
    height: u32,
    refresh: u32,
    valid: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SharedSlot {
    pipe: u32,
    usage: u32,
    x: i32,
    y: i32,
    w: u32,
    h: u32,
}

/// On-region layout. Everything past the mutex is plain data; the mutex
/// and its attribute block stay inside the region so every mapping of
/// the same pages sees the same lock.
#[repr(C)]
struct SharedHeader {
    lock: libc::pthread_mutex_t,
    lock_attr: libc::pthread_mutexattr_t,
    refcount: AtomicU32,
    mode_changed: AtomicU32,
    topology: u32,
    outputs: [SharedTiming; OUTPUT_COUNT],
    overlays: [SharedSlot; OVERLAY_COUNT],
}

fn output_index(output: Output) -> usize {
    match output {
        Output::PanelA => 0,
        Output::PanelB => 1,
        Output::External => 2,
    }
}

/// Handle onto the shared region. The creating process initializes the
/// embedded mutex; openers only bump the reference count.
pub struct SharedOverlayContext {
    region: *mut SharedHeader,
    size: usize,
    fd: RawFd,
}

// Raw pointers make this !Send by default; all region access goes
// through the embedded process-shared mutex.
unsafe impl Send for SharedOverlayContext {}
unsafe impl Sync for SharedOverlayContext {}

/// Scoped hold of the region's process-shared mutex; unlocks on drop.
struct RegionLock<'a> {
    ctx: &'a SharedOverlayContext,
}

impl Drop for RegionLock<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(&mut (*self.ctx.region).lock);
        }
    }
}

impl SharedOverlayContext {
    /// Create and initialize the region. The caller becomes the first
    /// reference holder.
    pub fn create() -> Result<Self> {
        let size = mem::size_of::<SharedHeader>();
        let fd = unsafe {
            libc::memfd_create(REGION_NAME.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(Error::SharedContext(format!(
                "memfd_create failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let e = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::SharedContext(format!("ftruncate failed: {}", e)));
        }

        let region = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if region == libc::MAP_FAILED {
            let e = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::SharedContext(format!("mmap failed: {}", e)));
        }
        let header = region as *mut SharedHeader;

        unsafe {
            std::ptr::write_bytes(region as *mut u8, 0, size);
            (*header).refcount.store(1, Ordering::SeqCst);

            if libc::pthread_mutexattr_init(&mut (*header).lock_attr) != 0 {
                libc::munmap(region, size);
                libc::close(fd);
                return Err(Error::SharedContext("mutexattr init failed".into()));
            }
            if libc::pthread_mutexattr_setpshared(
                &mut (*header).lock_attr,
                libc::PTHREAD_PROCESS_SHARED,
            ) != 0
            {
                libc::pthread_mutexattr_destroy(&mut (*header).lock_attr);
                libc::munmap(region, size);
                libc::close(fd);
                return Err(Error::SharedContext("mutexattr setpshared failed".into()));
            }
            if libc::pthread_mutex_init(&mut (*header).lock, &(*header).lock_attr) != 0 {
                libc::pthread_mutexattr_destroy(&mut (*header).lock_attr);
                libc::munmap(region, size);
                libc::close(fd);
                return Err(Error::SharedContext("shared mutex init failed".into()));
            }
        }

        debug!("shared context created, fd {} ({} bytes)", fd, size);
        Ok(Self {
            region: header,
            size,
            fd,
        })
    }

    /// Map an existing region by file descriptor, taking one reference.
    /// The descriptor is duplicated; the caller keeps its own.
    pub fn open(fd: RawFd, size: usize) -> Result<Self> {
        if size < mem::size_of::<SharedHeader>() {
            return Err(Error::SharedContext(format!(
                "region too small: {} bytes",
                size
            )));
        }
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(Error::SharedContext(format!(
                "fd dup failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let region = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                dup,
                0,
            )
        };
        if region == libc::MAP_FAILED {
            let e = std::io::Error::last_os_error();
            unsafe { libc::close(dup) };
            return Err(Error::SharedContext(format!("mmap failed: {}", e)));
        }
        let header = region as *mut SharedHeader;
        let count = unsafe { (*header).refcount.fetch_add(1, Ordering::SeqCst) } + 1;

        debug!("shared context opened, fd {}, refcount {}", dup, count);
        Ok(Self {
            region: header,
            size,
            fd: dup,
        })
    }

    /// Drop this reference. Returns `true` if this was the last holder,
    /// in which case the embedded mutex was destroyed before the region
    /// was unmapped.
    pub fn destroy(mut self) -> bool {
        let last = self.teardown();
        mem::forget(self);
        last
    }

    fn teardown(&mut self) -> bool {
        if self.region.is_null() {
            return false;
        }
        let remaining = unsafe { (*self.region).refcount.fetch_sub(1, Ordering::SeqCst) } - 1;
        let last = remaining == 0;
        if last {
            // the mutex must go before the unmap
            unsafe {
                if libc::pthread_mutex_destroy(&mut (*self.region).lock) != 0 {
                    warn!("shared mutex destroy failed");
                }
                if libc::pthread_mutexattr_destroy(&mut (*self.region).lock_attr) != 0 {
                    warn!("shared mutexattr destroy failed");
                }
            }
            debug!("shared context: last reference, mutex destroyed");
        }
        unsafe {
            if libc::munmap(self.region as *mut libc::c_void, self.size) != 0 {
                warn!("shared context unmap failed");
            }
            libc::close(self.fd);
        }
        self.region = std::ptr::null_mut();
        last
    }

    /// Descriptor to hand to another process.
    pub fn shared_fd(&self) -> RawFd {
        self.fd
    }

    pub fn shared_size(&self) -> usize {
        self.size
    }

    pub fn ref_count(&self) -> u32 {
        unsafe { (*self.region).refcount.load(Ordering::SeqCst) }
    }

    fn lock(&self) -> RegionLock<'_> {
        unsafe {
            libc::pthread_mutex_lock(&mut (*self.region).lock);
        }
        RegionLock { ctx: self }
    }

    fn check_overlay(&self, overlay: usize) -> Result<()> {
        if overlay >= OVERLAY_COUNT {
            return Err(Error::SharedContext(format!(
                "overlay index {} out of range",
                overlay
            )));
        }
        Ok(())
    }

    pub fn set_pipe(&self, overlay: usize, pipe: Pipe) -> Result<()> {
        self.check_overlay(overlay)?;
        let _guard = self.lock();
        unsafe {
            (*self.region).overlays[overlay].pipe = pipe.index();
        }
        Ok(())
    }

    pub fn pipe(&self, overlay: usize) -> Result<Pipe> {
        self.check_overlay(overlay)?;
        let _guard = self.lock();
        let raw = unsafe { (*self.region).overlays[overlay].pipe };
        Pipe::from_index(raw)
            .ok_or_else(|| Error::SharedContext(format!("bad pipe value {}", raw)))
    }

    pub fn set_usage(&self, overlay: usize, usage: OverlayUsage) -> Result<()> {
        self.check_overlay(overlay)?;
        let _guard = self.lock();
        unsafe {
            (*self.region).overlays[overlay].usage = usage.to_u32();
        }
        Ok(())
    }

    pub fn usage(&self, overlay: usize) -> Result<OverlayUsage> {
        self.check_overlay(overlay)?;
        let _guard = self.lock();
        let raw = unsafe { (*self.region).overlays[overlay].usage };
        Ok(OverlayUsage::from_u32(raw))
    }

    pub fn set_position(&self, overlay: usize, rect: Rect) -> Result<()> {
        self.check_overlay(overlay)?;
        let _guard = self.lock();
        unsafe {
            let slot = &mut (*self.region).overlays[overlay];
            slot.x = rect.x;
            slot.y = rect.y;
            slot.w = rect.w;
            slot.h = rect.h;
        }
        Ok(())
    }

    /// Destination rectangle for the overlay, clamped to the active
    /// output's timing. While the external display owns the overlay the
    /// stored position is ignored and a full-screen rectangle on the
    /// external timing is returned instead.
    pub fn position(&self, overlay: usize) -> Result<Rect> {
        self.check_overlay(overlay)?;
        let _guard = self.lock();
        unsafe {
            let topology = Topology::from_u32((*self.region).topology);
            if topology == Topology::External {
                let hdmi = &(*self.region).outputs[output_index(Output::External)];
                if hdmi.valid != 0 {
                    return Ok(Rect::new(0, 0, hdmi.width, hdmi.height));
                }
            }

            let slot = &(*self.region).overlays[overlay];
            let mut rect = Rect::new(slot.x, slot.y, slot.w, slot.h);
            let panel = &(*self.region).outputs[output_index(Output::PanelA)];
            if panel.valid != 0 {
                if rect.x < 0 {
                    rect.x = 0;
                }
                if rect.y < 0 {
                    rect.y = 0;
                }
                if rect.x as u32 + rect.w > panel.width {
                    rect.w = panel.width.saturating_sub(rect.x as u32);
                }
                if rect.y as u32 + rect.h > panel.height {
                    rect.h = panel.height.saturating_sub(rect.y as u32);
                }
            }
            Ok(rect)
        }
    }

    /// Record the last-detected timing for an output; `None` invalidates.
    pub fn set_output_timing(&self, output: Output, mode: Option<&DisplayMode>) {
        let _guard = self.lock();
        unsafe {
            let slot = &mut (*self.region).outputs[output_index(output)];
            match mode {
                Some(m) => {
                    slot.width = m.hdisplay;
                    slot.height = m.vdisplay;
                    slot.refresh = m.vrefresh;
                    slot.valid = 1;
                }
                None => *slot = mem::zeroed(),
            }
        }
    }

    pub fn output_timing(&self, output: Output) -> Option<DisplayMode> {
        let _guard = self.lock();
        unsafe {
            let slot = &(*self.region).outputs[output_index(output)];
            if slot.valid == 0 {
                return None;
            }
            Some(DisplayMode::new(slot.width, slot.height, slot.refresh))
        }
    }

    pub fn set_topology(&self, topology: Topology) {
        let _guard = self.lock();
        unsafe {
            (*self.region).topology = topology.to_u32();
        }
    }

    pub fn topology(&self) -> Topology {
        let _guard = self.lock();
        unsafe { Topology::from_u32((*self.region).topology) }
    }

    /// Flag a topology/mode change for the posting pipeline to consume.
    pub fn set_mode_changed(&self) {
        unsafe {
            (*self.region).mode_changed.store(1, Ordering::SeqCst);
        }
    }

    /// Consume the mode-changed flag, returning whether it was set.
    pub fn take_mode_changed(&self) -> bool {
        unsafe { (*self.region).mode_changed.swap(0, Ordering::SeqCst) != 0 }
    }
}

impl Drop for SharedOverlayContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcount_destroys_mutex_exactly_once() {
        let owner = SharedOverlayContext::create().unwrap();
        let fd = owner.shared_fd();
        let size = owner.shared_size();

        let n = 4;
        let mut opened = Vec::new();
        for _ in 0..n {
            opened.push(SharedOverlayContext::open(fd, size).unwrap());
        }
        assert_eq!(owner.ref_count(), n as u32 + 1);

        // none of the first N destroys may be the last
        assert!(!owner.destroy());
        let mut last_seen = 0;
        for ctx in opened {
            if ctx.destroy() {
                last_seen += 1;
            }
        }
        assert_eq!(last_seen, 1);
    }

    #[test]
    fn test_openers_see_owner_writes() {
        let owner = SharedOverlayContext::create().unwrap();
        let peer = SharedOverlayContext::open(owner.shared_fd(), owner.shared_size()).unwrap();

        owner.set_pipe(0, Pipe::B).unwrap();
        owner.set_usage(0, OverlayUsage::Video).unwrap();
        assert_eq!(peer.pipe(0).unwrap(), Pipe::B);
        assert_eq!(peer.usage(0).unwrap(), OverlayUsage::Video);

        assert!(!peer.destroy());
        assert!(owner.destroy());
    }

    #[test]
    fn test_position_clamped_to_panel_timing() {
        let ctx = SharedOverlayContext::create().unwrap();
        ctx.set_topology(Topology::PanelA);
        ctx.set_output_timing(Output::PanelA, Some(&DisplayMode::new(720, 1280, 60)));

        ctx.set_position(0, Rect::new(-10, 100, 800, 1400)).unwrap();
        let pos = ctx.position(0).unwrap();
        assert_eq!(pos.x, 0);
        assert_eq!(pos.y, 100);
        assert_eq!(pos.w, 720);
        assert_eq!(pos.h, 1180);
        ctx.destroy();
    }

    #[test]
    fn test_position_fullscreen_on_external() {
        let ctx = SharedOverlayContext::create().unwrap();
        ctx.set_topology(Topology::External);
        ctx.set_output_timing(Output::External, Some(&DisplayMode::new(1920, 1080, 60)));

        ctx.set_position(0, Rect::new(10, 10, 100, 100)).unwrap();
        // the stored rectangle is ignored while the external output is active
        assert_eq!(ctx.position(0).unwrap(), Rect::new(0, 0, 1920, 1080));
        ctx.destroy();
    }

    #[test]
    fn test_mode_changed_flag_is_consumed() {
        let ctx = SharedOverlayContext::create().unwrap();
        assert!(!ctx.take_mode_changed());
        ctx.set_mode_changed();
        assert!(ctx.take_mode_changed());
        assert!(!ctx.take_mode_changed());
        ctx.destroy();
    }

    #[test]
    fn test_overlay_index_bounds() {
        let ctx = SharedOverlayContext::create().unwrap();
        assert!(ctx.set_pipe(OVERLAY_COUNT, Pipe::A).is_err());
        assert!(ctx.position(OVERLAY_COUNT).is_err());
        ctx.destroy();
    }
}
