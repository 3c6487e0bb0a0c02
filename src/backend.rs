//! Backend capability traits
//!
//! The composer core never talks to hardware directly. Everything it needs
//! from the platform comes through three narrow capabilities: a display
//! device (connector queries, mode-set, framebuffers, vsync, overlay
//! register writes), a GPU memory allocator (allocations plus display
//! translation-table mappings), and an event sink (the windowing server's
//! callbacks). Real backends wrap the platform's DRM/allocator stack; the
//! in-memory fakes in [`crate::fake`] implement the same traits for tests.

use crate::Result;
use std::fmt;

/// Display translation-table page size in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Scan-out stride alignment in bytes.
pub const STRIDE_ALIGN: u32 = 64;

/// Round `value` up to a multiple of `align` (power of two).
pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Physical output identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Output {
    /// Primary on-chip panel.
    PanelA,
    /// Secondary on-chip panel (dual-panel devices).
    PanelB,
    /// Removable external display (HDMI).
    External,
}

impl Output {
    /// All outputs, in detection order.
    pub const ALL: [Output; 3] = [Output::PanelA, Output::PanelB, Output::External];

    /// The display pipe that scans out this output.
    pub fn pipe(self) -> Pipe {
        match self {
            Output::PanelA => Pipe::A,
            Output::PanelB => Pipe::C,
            Output::External => Pipe::B,
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::PanelA => write!(f, "panel-a"),
            Output::PanelB => write!(f, "panel-b"),
            Output::External => write!(f, "external"),
        }
    }
}

/// Display pipe (CRTC) identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipe {
    A,
    B,
    C,
}

impl Pipe {
    /// Stable index used in vsync source bitmasks.
    pub fn index(self) -> u32 {
        match self {
            Pipe::A => 0,
            Pipe::B => 1,
            Pipe::C => 2,
        }
    }

    /// Pipe-select field of the overlay commit word (bits 6..8).
    pub fn select_bits(self) -> u32 {
        match self {
            Pipe::A => 0b00 << 6,
            Pipe::B => 0b10 << 6,
            Pipe::C => 0b01 << 6,
        }
    }

    pub fn from_index(index: u32) -> Option<Pipe> {
        match index {
            0 => Some(Pipe::A),
            1 => Some(Pipe::B),
            2 => Some(Pipe::C),
            _ => None,
        }
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pipe::A => write!(f, "A"),
            Pipe::B => write!(f, "B"),
            Pipe::C => write!(f, "C"),
        }
    }
}

/// Timing flag: interlaced scan.
pub const MODE_FLAG_INTERLACE: u32 = 1 << 0;
/// Timing flag: 16:9 picture aspect.
pub const MODE_FLAG_PAR_16_9: u32 = 1 << 1;
/// Timing flag: 4:3 picture aspect.
pub const MODE_FLAG_PAR_4_3: u32 = 1 << 2;

/// One display timing advertised by a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub hdisplay: u32,
    pub vdisplay: u32,
    /// Refresh rate in Hz.
    pub vrefresh: u32,
    /// MODE_FLAG_* bits.
    pub flags: u32,
    /// Marked preferred by the output.
    pub preferred: bool,
}

impl DisplayMode {
    pub fn new(hdisplay: u32, vdisplay: u32, vrefresh: u32) -> Self {
        Self {
            hdisplay,
            vdisplay,
            vrefresh,
            flags: 0,
            preferred: false,
        }
    }

    /// Active area in pixels, for mode-selection tie-breaking.
    pub fn area(&self) -> u64 {
        self.hdisplay as u64 * self.vdisplay as u64
    }

    /// One refresh period in nanoseconds.
    pub fn vsync_period_ns(&self) -> u64 {
        1_000_000_000 / self.vrefresh.max(1) as u64
    }

    /// Flag compatibility is containment, not equality: a request with no
    /// special flags matches any mode.
    pub fn flags_contain(&self, requested: u32) -> bool {
        requested == 0 || (self.flags & requested) == requested
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.hdisplay, self.vdisplay, self.vrefresh)
    }
}

/// Destination or source rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Full active area of a mode.
    pub fn from_mode(mode: &DisplayMode) -> Self {
        Self::new(0, 0, mode.hdisplay, mode.vdisplay)
    }
}

/// Raw connector state as reported by the display device.
#[derive(Debug, Clone, Default)]
pub struct ConnectorState {
    pub connected: bool,
    pub has_encoder: bool,
    pub has_crtc: bool,
    pub modes: Vec<DisplayMode>,
}

/// Opaque ticket for one GPU allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle(pub u64);

impl fmt::Display for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem#{}", self.0)
    }
}

/// Display-mode-set and overlay command channel.
///
/// Implementations are expected to make a blocked [`wait_vsync`] return
/// with an error once that pipe's vsync is disabled, so shutdown never
/// hangs in a device wait.
///
/// [`wait_vsync`]: DisplayDevice::wait_vsync
pub trait DisplayDevice: Send + Sync {
    /// Query one connector. Missing encoder/CRTC is reported in the state,
    /// not as an error.
    fn detect_connector(&self, output: Output) -> Result<ConnectorState>;

    /// Bind a framebuffer and timing to the output.
    fn set_mode(&self, output: Output, fb_id: u32, mode: &DisplayMode) -> Result<()>;

    /// Register scan-out memory, returning the framebuffer id.
    fn add_framebuffer(
        &self,
        handle: MemoryHandle,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<u32>;

    fn remove_framebuffer(&self, fb_id: u32) -> Result<()>;

    /// DPMS on/off for one output.
    fn set_power(&self, output: Output, on: bool) -> Result<()>;

    fn enable_vsync(&self, pipe: Pipe) -> Result<()>;

    fn disable_vsync(&self, pipe: Pipe) -> Result<()>;

    /// Block until the next vsync on `pipe`; returns the event timestamp
    /// in nanoseconds.
    fn wait_vsync(&self, pipe: Pipe) -> Result<u64>;

    /// One-shot wait for the next vblank on `pipe`, independent of the
    /// vsync event stream. Used to drain a scan-out before its memory or
    /// pipe assignment changes.
    fn wait_vblank(&self, pipe: Pipe) -> Result<()>;

    /// Write the overlay commit word to the engines selected by
    /// `engine_mask` (bit 0 = engine A, bit 2 = engine C).
    fn write_overlay(&self, engine_mask: u32, ovadd: u32) -> Result<()>;
}

/// GPU memory allocator with display translation-table mapping.
pub trait GpuAllocator: Send + Sync {
    fn alloc(&self, size: u32, align: u32) -> Result<MemoryHandle>;

    fn free(&self, handle: MemoryHandle) -> Result<()>;

    /// Map an allocation into the display translation table; returns the
    /// table offset in pages.
    fn map_to_translation_table(&self, handle: MemoryHandle, align: u32) -> Result<u32>;

    fn unmap_from_translation_table(&self, handle: MemoryHandle) -> Result<()>;

    /// CPU-visible base address of the allocation.
    fn cpu_map(&self, handle: MemoryHandle) -> Result<*mut u8>;
}

/// Callbacks into the windowing server.
pub trait EventSink: Send + Sync {
    fn hotplug(&self, output: Output, connected: bool);

    fn vsync(&self, timestamp_ns: u64, pipe: Pipe);

    /// Nudge the server to recompose after a topology change.
    fn invalidate(&self);
}
