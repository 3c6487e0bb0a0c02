//! Overlay posting pipeline.
//!
//! Turns a formatted frame plus the shared window state into one overlay
//! engine register block and commits it with a single OVADD write. The
//! pipeline owns the page the engine fetches the block from, tracks which
//! pipe the overlay is attached to, and moves the overlay between pipes
//! when the output topology changes underneath it.

use std::mem;
use std::ptr;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::backend::{
    align_up, DisplayDevice, DisplayMode, Output, Pipe, Rect, PAGE_SIZE, STRIDE_ALIGN,
};
use crate::buffers::OverlayBufferHandle;
use crate::config::ComposerConfig;
use crate::error::Error;
use crate::modes::{DisplayResourceCache, Topology};
use crate::scaler::{ScaleFactors, ScalerCoefficientEngine, N_HORIZ_UV_TAPS, N_HORIZ_Y_TAPS, N_PHASES};
use crate::shared::SharedOverlayContext;
use crate::vsync::PresentationMode;
use crate::Result;

/// OCMD: overlay scan-out enable.
pub const OCMD_ENABLE: u32 = 1 << 0;
/// OCMD source-format field.
const OCMD_FORMAT_MASK: u32 = 0xf << 10;
const OCMD_PACKED_YUV422: u32 = 0x8 << 10;
const OCMD_PLANAR_NV12: u32 = 0xb << 10;
const OCMD_PLANAR_YUV420: u32 = 0xc << 10;
/// OCMD packed-component order field; zero selects YUYV.
const OCMD_ORDER_MASK: u32 = 0x3 << 14;
const OCMD_ORDER_UYVY: u32 = 0x2 << 14;

/// OCONFIG: colour-correction output truncated to 8 bits.
const OCONFIG_CC_OUT_8BIT: u32 = 1 << 3;
/// OCONFIG: bypass the image-enhancement stage.
const OCONFIG_IEP_BYPASS: u32 = 1 << 27;

/// SCHRKEN: per-channel source chroma-key enables.
const SCHRKEN_KEY_CHANNELS: u32 = 0x7 << 24;

/// OVADD: reload the filter coefficients on this flip.
pub const OVADD_COEF_RELOAD: u32 = 1 << 0;

/// Overlay engine selectors for [`DisplayDevice::write_overlay`].
pub const ENGINE_A: u32 = 1 << 0;
pub const ENGINE_C: u32 = 1 << 2;

/// Source pixel layouts accepted by the overlay engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Three planes, U before V.
    I420,
    /// Three planes, V before U.
    Yv12,
    /// Luma plane plus one interleaved UV plane.
    Nv12,
    /// Packed 4:2:2, Y first.
    Yuy2,
    /// Packed 4:2:2, chroma first.
    Uyvy,
}

impl PixelFormat {
    /// Packed formats carry chroma inline, so luma rows are twice as wide.
    pub fn is_packed(self) -> bool {
        matches!(self, PixelFormat::Yuy2 | PixelFormat::Uyvy)
    }

    fn is_planar(self) -> bool {
        !self.is_packed()
    }
}

/// One formatted frame, resident in mapped pages, ready for scan-out.
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor {
    pub format: PixelFormat,
    /// Source width in pixels, before packed-format doubling.
    pub width: u32,
    pub height: u32,
    /// Luma (or packed) row pitch in bytes.
    pub y_stride: u32,
    /// Chroma row pitch in bytes; ignored for packed formats.
    pub uv_stride: u32,
    /// Translation-table page offset of the pixel data.
    pub gtt_offset_pages: u32,
}

impl FrameDescriptor {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Geometry(format!(
                "source {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.y_stride == 0 {
            return Err(Error::Geometry("zero luma stride".into()));
        }
        if self.format.is_planar() && self.uv_stride == 0 {
            return Err(Error::Geometry("zero chroma stride".into()));
        }
        Ok(())
    }
}

/// Overlay engine register block, fetched by the engine from a mapped
/// page when OVADD is written. Registers are grouped by function rather
/// than bus offset; only fields the pipeline programs are carried.
#[repr(C)]
#[derive(Clone)]
pub struct ControlBlock {
    pub obuf_0y: u32,
    pub obuf_1y: u32,
    pub obuf_0u: u32,
    pub obuf_1u: u32,
    pub obuf_0v: u32,
    pub obuf_1v: u32,
    pub ostart_0y: u32,
    pub ostart_1y: u32,
    pub ostart_0u: u32,
    pub ostart_1u: u32,
    pub ostart_0v: u32,
    pub ostart_1v: u32,
    pub swidth: u32,
    pub swidthsw: u32,
    pub sheight: u32,
    pub ostride: u32,
    pub dwinpos: u32,
    pub dwinsz: u32,
    pub yrgbscale: u32,
    pub uvscale: u32,
    pub uvscalev: u32,
    pub oclrc0: u32,
    pub oclrc1: u32,
    pub dclrkv: u32,
    pub dclrkm: u32,
    pub schrken: u32,
    pub oconfig: u32,
    pub ocmd: u32,
    pub y_hcoefs: [u32; N_HORIZ_Y_TAPS * N_PHASES],
    pub uv_hcoefs: [u32; N_HORIZ_UV_TAPS * N_PHASES],
}

impl ControlBlock {
    /// Zeroed block with the colour-correction and keying registers
    /// programmed from `config`. Matches the engine's reset state
    /// otherwise.
    pub fn new(config: &ComposerConfig) -> Self {
        let mut block: ControlBlock = unsafe { mem::zeroed() };
        block.oclrc0 = (config.contrast << 18) | (config.brightness as u8 as u32);
        block.oclrc1 = config.saturation;
        block.dclrkv = config.color_key;
        block.dclrkm = config.color_key_mask;
        block.oconfig |= OCONFIG_CC_OUT_8BIT;
        block.oconfig |= OCONFIG_IEP_BYPASS;
        block.schrken &= !SCHRKEN_KEY_CHANNELS;
        block.schrken |= 0xff;
        block
    }
}

/// Source plane bytes for [`format_planes`]. Planes a format does not
/// use may be empty; `u` carries the interleaved plane for NV12.
#[derive(Debug, Clone, Copy)]
pub struct PlaneData<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
}

/// Copy `rows` rows of `row_bytes` from a tightly packed source into a
/// strided destination, zeroing the pad tail of every row.
fn copy_plane_rows(
    src: &[u8],
    row_bytes: usize,
    rows: usize,
    stride: usize,
    dst: &mut [u8],
) -> Result<()> {
    if stride < row_bytes {
        return Err(Error::Geometry(format!(
            "stride {} shorter than row {}",
            stride, row_bytes
        )));
    }
    if src.len() < row_bytes * rows {
        return Err(Error::Geometry(format!(
            "source plane {} bytes, need {}",
            src.len(),
            row_bytes * rows
        )));
    }
    if dst.len() < stride * rows {
        return Err(Error::Geometry(format!(
            "destination plane {} bytes, need {}",
            dst.len(),
            stride * rows
        )));
    }
    for row in 0..rows {
        let s = &src[row * row_bytes..(row + 1) * row_bytes];
        let d = row * stride;
        dst[d..d + row_bytes].copy_from_slice(s);
        dst[d + row_bytes..d + stride].fill(0);
    }
    Ok(())
}

fn plane_region<'a>(dst: &'a mut [u8], offset: u32) -> Result<&'a mut [u8]> {
    dst.get_mut(offset as usize..).ok_or_else(|| {
        Error::Geometry(format!("plane offset {} outside the pixel buffer", offset))
    })
}

/// Lay the source planes out in `dst` the way [`OverlayPostingPipeline`]
/// will describe them to the engine: planar chroma planes start on page
/// boundaries past the previous plane's extent, NV12 chroma starts after
/// the luma height padded to 32 rows, and every row is padded to its
/// stride with zeroes.
pub fn format_planes(frame: &FrameDescriptor, planes: &PlaneData<'_>, dst: &mut [u8]) -> Result<()> {
    frame.validate()?;
    let width = frame.width as usize;
    let height = frame.height as usize;
    let y_stride = frame.y_stride as usize;
    let uv_stride = frame.uv_stride as usize;
    match frame.format {
        PixelFormat::I420 | PixelFormat::Yv12 => {
            let luma = align_up(frame.y_stride * frame.height, PAGE_SIZE);
            let chroma = align_up(frame.uv_stride * (frame.height / 2), PAGE_SIZE);
            let (first, second) = if frame.format == PixelFormat::I420 {
                (planes.u, planes.v)
            } else {
                (planes.v, planes.u)
            };
            copy_plane_rows(planes.y, width, height, y_stride, plane_region(dst, 0)?)?;
            copy_plane_rows(
                first,
                width / 2,
                height / 2,
                uv_stride,
                plane_region(dst, luma)?,
            )?;
            copy_plane_rows(
                second,
                width / 2,
                height / 2,
                uv_stride,
                plane_region(dst, luma + chroma)?,
            )?;
        }
        PixelFormat::Nv12 => {
            let chroma_base = frame.y_stride * align_up(frame.height, 32);
            copy_plane_rows(planes.y, width, height, y_stride, plane_region(dst, 0)?)?;
            copy_plane_rows(
                planes.u,
                width,
                height / 2,
                uv_stride,
                plane_region(dst, chroma_base)?,
            )?;
        }
        PixelFormat::Yuy2 | PixelFormat::Uyvy => {
            copy_plane_rows(planes.y, width * 2, height, y_stride, plane_region(dst, 0)?)?;
        }
    }
    Ok(())
}

/// Scan-line fetch width in 64-byte blocks, encoded the way SWIDTHSW
/// expects: the number of blocks a row spans starting at `offset`,
/// doubled, minus one.
fn calculate_swidthsw(offset: u32, width: u32) -> u32 {
    ((((offset + width + 0x3f) >> 6) - (offset >> 6)) << 1) - 1
}

/// Aspect-preserving placement of a source on an extended display:
/// scale to fill one axis and centre along the other.
fn extend_placement(src_w: u32, src_h: u32, mode: &DisplayMode) -> Rect {
    let slope = src_h as f32 / src_w as f32;
    let fit_w = (mode.vdisplay as f32 / slope) as u32;
    if fit_w <= mode.hdisplay {
        let x = (mode.hdisplay - fit_w) / 2;
        Rect::new(x as i32, 0, fit_w, mode.vdisplay)
    } else {
        let fit_h = (mode.hdisplay as f32 * slope) as u32;
        let y = (mode.vdisplay - fit_h) / 2;
        Rect::new(0, y as i32, mode.hdisplay, fit_h)
    }
}

/// Builds register blocks and commits them to the overlay engines.
///
/// One pipeline per overlay slot. The pipeline reads the destination
/// window and topology from the shared context at every post, so window
/// moves and display switches made by other processes take effect on
/// the next frame without an extra control call.
pub struct OverlayPostingPipeline {
    device: Arc<dyn DisplayDevice>,
    cache: Arc<DisplayResourceCache>,
    shared: Arc<SharedOverlayContext>,
    scaler: ScalerCoefficientEngine,
    block: ControlBlock,
    /// Mapped page the engine fetches the block from.
    buffer: OverlayBufferHandle,
    overlay: usize,
    pipe: Pipe,
    engines: u32,
    presentation: PresentationMode,
}

impl OverlayPostingPipeline {
    pub fn new(
        device: Arc<dyn DisplayDevice>,
        cache: Arc<DisplayResourceCache>,
        shared: Arc<SharedOverlayContext>,
        buffer: OverlayBufferHandle,
        overlay: usize,
        config: &ComposerConfig,
    ) -> Result<Self> {
        if (buffer.size as usize) < mem::size_of::<ControlBlock>() {
            return Err(Error::Init(format!(
                "register page {} bytes, control block needs {}",
                buffer.size,
                mem::size_of::<ControlBlock>()
            )));
        }
        let presentation = PresentationMode::Local;
        let topology = cache.topology();
        let pipe = target_pipe(topology, presentation);
        shared.set_pipe(overlay, pipe)?;
        Ok(Self {
            device,
            cache,
            shared,
            scaler: ScalerCoefficientEngine::new(),
            block: ControlBlock::new(config),
            buffer,
            overlay,
            pipe,
            engines: engine_mask(topology),
            presentation,
        })
    }

    pub fn pipe(&self) -> Pipe {
        self.pipe
    }

    pub fn is_enabled(&self) -> bool {
        self.block.ocmd & OCMD_ENABLE != 0
    }

    pub fn control_block(&self) -> &ControlBlock {
        &self.block
    }

    /// Route the overlay for a presentation change. The pipe move itself
    /// happens on the next post.
    pub fn set_presentation(&mut self, mode: PresentationMode) {
        if self.presentation != mode {
            self.presentation = mode;
            self.shared.set_mode_changed();
        }
    }

    /// Build the register block for `frame` and flip to it.
    pub fn post(&mut self, frame: &FrameDescriptor) -> Result<()> {
        frame.validate()?;
        if self.shared.take_mode_changed() {
            self.reassign_pipe()?;
        }
        let stored = self.shared.position(self.overlay)?;
        let dest = self.check_position(frame, stored);
        if dest.w == 0 || dest.h == 0 {
            return Err(Error::Geometry(format!(
                "window collapsed to {}x{} after clamping",
                dest.w, dest.h
            )));
        }
        self.buffer_offset_setup(frame);
        self.coordinate_setup(frame);
        let reload = self.scaling_setup(frame, dest)?;
        self.block.ocmd |= OCMD_ENABLE;
        self.commit(reload)
    }

    /// Take the overlay off the screen. Idempotent.
    pub fn disable(&mut self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.block.ocmd &= !OCMD_ENABLE;
        self.commit(false)?;
        // The engine holds its fetch until the next vblank on the pipe.
        if let Err(e) = self.device.wait_vblank(self.pipe) {
            debug!("vblank wait on pipe {} skipped: {}", self.pipe, e);
        }
        Ok(())
    }

    /// Give the register page back for teardown.
    pub fn into_buffer(self) -> OverlayBufferHandle {
        self.buffer
    }

    /// The displays changed under us. Drop the overlay from its old pipe
    /// before any register touches the new one, then follow the cached
    /// topology.
    fn reassign_pipe(&mut self) -> Result<()> {
        if self.is_enabled() {
            self.block.ocmd &= !OCMD_ENABLE;
            self.commit(false)?;
            if let Err(e) = self.device.wait_vblank(self.pipe) {
                debug!("vblank wait on pipe {} skipped: {}", self.pipe, e);
            }
        }
        self.cache.detect_all();
        let topology = self.cache.topology();
        self.shared.set_topology(topology);
        for output in Output::ALL {
            self.shared
                .set_output_timing(output, self.cache.active_mode(output).as_ref());
        }
        let pipe = target_pipe(topology, self.presentation);
        if pipe != self.pipe {
            info!("overlay {}: pipe {} -> {}", self.overlay, self.pipe, pipe);
            self.pipe = pipe;
            self.shared.set_pipe(self.overlay, pipe)?;
        }
        self.engines = engine_mask(topology);
        Ok(())
    }

    /// Extended surfaces ignore the stored window and letterbox the
    /// source on the external timing.
    fn check_position(&self, frame: &FrameDescriptor, stored: Rect) -> Rect {
        if self.presentation == PresentationMode::Extend {
            if let Some(mode) = self.shared.output_timing(Output::External) {
                return extend_placement(frame.width, frame.height, &mode);
            }
        }
        stored
    }

    fn buffer_offset_setup(&mut self, frame: &FrameDescriptor) {
        let base = frame.gtt_offset_pages * PAGE_SIZE;
        let block = &mut self.block;
        block.ostart_0y = base;
        block.ostart_1y = base;
        block.ostart_0u = base;
        block.ostart_1u = base;
        block.ostart_0v = base;
        block.ostart_1v = base;
        block.ocmd &= !(OCMD_FORMAT_MASK | OCMD_ORDER_MASK);
        match frame.format {
            PixelFormat::I420 | PixelFormat::Yv12 => {
                let luma = align_up(frame.y_stride * frame.height, PAGE_SIZE);
                let chroma = align_up(frame.uv_stride * (frame.height / 2), PAGE_SIZE);
                block.obuf_0y = base;
                if frame.format == PixelFormat::I420 {
                    block.obuf_0u = base + luma;
                    block.obuf_0v = base + luma + chroma;
                } else {
                    block.obuf_0v = base + luma;
                    block.obuf_0u = base + luma + chroma;
                }
                block.ocmd |= OCMD_PLANAR_YUV420;
            }
            PixelFormat::Nv12 => {
                block.obuf_0y = base;
                block.obuf_0u = base + frame.y_stride * align_up(frame.height, 32);
                block.obuf_0v = 0;
                block.ocmd |= OCMD_PLANAR_NV12;
            }
            PixelFormat::Yuy2 => {
                block.obuf_0y = base;
                block.obuf_0u = 0;
                block.obuf_0v = 0;
                block.ocmd |= OCMD_PACKED_YUV422;
            }
            PixelFormat::Uyvy => {
                block.obuf_0y = base;
                block.obuf_0u = 0;
                block.obuf_0v = 0;
                block.ocmd |= OCMD_PACKED_YUV422 | OCMD_ORDER_UYVY;
            }
        }
        block.obuf_1y = block.obuf_0y;
        block.obuf_1u = block.obuf_0u;
        block.obuf_1v = block.obuf_0v;
    }

    fn coordinate_setup(&mut self, frame: &FrameDescriptor) {
        let mut width = frame.width;
        if frame.format.is_packed() {
            width *= 2;
        }
        let height = frame.height;
        let block = &mut self.block;
        block.swidth = width | ((width / 2) << 16);
        let sw_y = calculate_swidthsw(block.obuf_0y, width);
        let sw_uv = calculate_swidthsw(block.obuf_0u, width / 2);
        block.swidthsw = (sw_y << 2) | (sw_uv << 18);
        block.sheight = height | ((height / 2) << 16);
        block.ostride = (frame.y_stride & !(STRIDE_ALIGN - 1))
            | ((frame.uv_stride & !(STRIDE_ALIGN - 1)) << 16);
    }

    /// Program the window and the scaler. Returns whether the filter
    /// coefficients changed and must be reloaded at flip time.
    fn scaling_setup(&mut self, frame: &FrameDescriptor, dest: Rect) -> Result<bool> {
        self.block.dwinpos = ((dest.y as u32) << 16) | dest.x as u32;
        self.block.dwinsz = (dest.h << 16) | dest.w;
        let factors = ScaleFactors::compute(frame.width, frame.height, dest.w, dest.h)?;
        let config = match self.scaler.configure(&factors)? {
            None => return Ok(false),
            Some(config) => config,
        };
        self.block.yrgbscale = config.yrgb_scale;
        self.block.uvscale = config.uv_scale;
        self.block.uvscalev = config.uv_scale_vertical;
        for pos in 0..config.y_horizontal.len() {
            self.block.y_hcoefs[pos] = config.y_horizontal.packed(pos);
        }
        for pos in 0..config.uv_horizontal.len() {
            self.block.uv_hcoefs[pos] = config.uv_horizontal.packed(pos);
        }
        Ok(true)
    }

    fn commit(&mut self, reload: bool) -> Result<()> {
        self.write_block();
        let mut ovadd = self.buffer.gtt_offset << 12;
        ovadd |= self.pipe.select_bits();
        if reload {
            ovadd |= OVADD_COEF_RELOAD;
        }
        trace!(
            "overlay {}: ovadd {:#010x} engines {:#x}",
            self.overlay,
            ovadd,
            self.engines
        );
        self.device.write_overlay(self.engines, ovadd)
    }

    /// The engine reads the whole block from the mapped page at flip
    /// time, so it must be current before OVADD is written.
    fn write_block(&self) {
        unsafe {
            ptr::copy_nonoverlapping(
                (&self.block as *const ControlBlock).cast::<u8>(),
                self.buffer.vaddr,
                mem::size_of::<ControlBlock>(),
            );
        }
    }
}

fn target_pipe(topology: Topology, presentation: PresentationMode) -> Pipe {
    match topology {
        Topology::External => match presentation {
            PresentationMode::Extend => Pipe::B,
            _ => Pipe::A,
        },
        Topology::PanelB => Pipe::C,
        _ => Pipe::A,
    }
}

fn engine_mask(topology: Topology) -> u32 {
    match topology {
        Topology::DualPanel => ENGINE_A | ENGINE_C,
        Topology::PanelB => ENGINE_C,
        _ => ENGINE_A,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::OverlayBufferManager;
    use crate::fake::{FakeDisplayDevice, FakeGpuAllocator, Journal};
    use proptest::prelude::*;

    struct Fixture {
        pipeline: OverlayPostingPipeline,
        device: Arc<FakeDisplayDevice>,
        cache: Arc<DisplayResourceCache>,
        shared: Arc<SharedOverlayContext>,
        journal: Journal,
        block_page: u32,
    }

    fn fixture() -> Fixture {
        let journal = Journal::new();
        let device = Arc::new(FakeDisplayDevice::new(journal.clone()));
        let gpu = Arc::new(FakeGpuAllocator::new());
        let cache = Arc::new(DisplayResourceCache::new(device.clone(), gpu.clone()));
        cache.detect_all();
        cache.select_mode(Output::PanelA, None).unwrap();
        let shared = Arc::new(SharedOverlayContext::create().unwrap());
        shared.set_topology(cache.topology());
        shared.set_output_timing(Output::PanelA, cache.active_mode(Output::PanelA).as_ref());
        let manager = OverlayBufferManager::new(gpu);
        let buffer = manager.allocate(PAGE_SIZE, None).unwrap();
        let block_page = buffer.gtt_offset;
        let pipeline = OverlayPostingPipeline::new(
            device.clone(),
            cache.clone(),
            shared.clone(),
            buffer,
            0,
            &ComposerConfig::default(),
        )
        .unwrap();
        Fixture {
            pipeline,
            device,
            cache,
            shared,
            journal,
            block_page,
        }
    }

    fn i420_frame() -> FrameDescriptor {
        FrameDescriptor {
            format: PixelFormat::I420,
            width: 320,
            height: 240,
            y_stride: 320,
            uv_stride: 192,
            gtt_offset_pages: 64,
        }
    }

    #[test]
    fn test_control_block_init_from_config() {
        let block = ControlBlock::new(&ComposerConfig::default());
        assert_eq!(block.oclrc0, (0x4b << 18) | 0xed);
        assert_eq!(block.oclrc1, 0x92);
        assert_eq!(block.dclrkv, 0);
        assert_eq!(block.dclrkm, 0);
        assert_eq!(block.oconfig, OCONFIG_CC_OUT_8BIT | OCONFIG_IEP_BYPASS);
        assert_eq!(block.schrken, 0xff);
        assert_eq!(block.ocmd, 0);
    }

    #[test]
    fn test_plane_offsets_i420_page_aligned() {
        let mut f = fixture();
        let frame = FrameDescriptor {
            format: PixelFormat::I420,
            width: 720,
            height: 480,
            y_stride: 768,
            uv_stride: 384,
            gtt_offset_pages: 16,
        };
        f.pipeline.buffer_offset_setup(&frame);
        let block = f.pipeline.control_block();
        let base = 16 * PAGE_SIZE;
        assert_eq!(block.obuf_0y, base);
        assert_eq!(block.obuf_0u, base + 368640);
        assert_eq!(block.obuf_0v, base + 368640 + 94208);
        assert_eq!(block.obuf_1y, block.obuf_0y);
        assert_eq!(block.obuf_1v, block.obuf_0v);
        assert_eq!(block.ostart_0y, base);
        assert_eq!(block.ocmd & OCMD_FORMAT_MASK, OCMD_PLANAR_YUV420);
    }

    #[test]
    fn test_plane_offsets_yv12_swap_chroma() {
        let mut f = fixture();
        let frame = FrameDescriptor {
            format: PixelFormat::Yv12,
            width: 720,
            height: 480,
            y_stride: 768,
            uv_stride: 384,
            gtt_offset_pages: 16,
        };
        f.pipeline.buffer_offset_setup(&frame);
        let block = f.pipeline.control_block();
        let base = 16 * PAGE_SIZE;
        assert_eq!(block.obuf_0v, base + 368640);
        assert_eq!(block.obuf_0u, base + 368640 + 94208);
        assert!(block.obuf_0u > block.obuf_0v);
    }

    #[test]
    fn test_plane_offsets_nv12_row_aligned_luma() {
        let mut f = fixture();
        let frame = FrameDescriptor {
            format: PixelFormat::Nv12,
            width: 720,
            height: 481,
            y_stride: 768,
            uv_stride: 768,
            gtt_offset_pages: 8,
        };
        f.pipeline.buffer_offset_setup(&frame);
        let block = f.pipeline.control_block();
        let base = 8 * PAGE_SIZE;
        assert_eq!(block.obuf_0u, base + 768 * 512);
        assert_eq!(block.obuf_0v, 0);
        assert_eq!(block.ocmd & OCMD_FORMAT_MASK, OCMD_PLANAR_NV12);
    }

    #[test]
    fn test_packed_formats_double_width() {
        let mut f = fixture();
        let frame = FrameDescriptor {
            format: PixelFormat::Yuy2,
            width: 640,
            height: 480,
            y_stride: 1280,
            uv_stride: 0,
            gtt_offset_pages: 4,
        };
        f.pipeline.buffer_offset_setup(&frame);
        f.pipeline.coordinate_setup(&frame);
        let block = f.pipeline.control_block();
        assert_eq!(block.obuf_0u, 0);
        assert_eq!(block.ocmd & OCMD_FORMAT_MASK, OCMD_PACKED_YUV422);
        assert_eq!(block.ocmd & OCMD_ORDER_MASK, 0);
        assert_eq!(block.swidth, 1280 | (640 << 16));
        assert_eq!(block.ostride & 0xffff, 1280);
        assert_eq!(block.sheight, 480 | (240 << 16));
    }

    #[test]
    fn test_uyvy_sets_order_field() {
        let mut f = fixture();
        let frame = FrameDescriptor {
            format: PixelFormat::Uyvy,
            width: 640,
            height: 480,
            y_stride: 1280,
            uv_stride: 0,
            gtt_offset_pages: 4,
        };
        f.pipeline.buffer_offset_setup(&frame);
        let block = f.pipeline.control_block();
        assert_eq!(block.ocmd & OCMD_ORDER_MASK, OCMD_ORDER_UYVY);
    }

    #[test]
    fn test_swidthsw_block_count() {
        // 720 bytes from a page boundary span 12 blocks of 64.
        assert_eq!(calculate_swidthsw(0, 720), 23);
        assert_eq!(calculate_swidthsw(65536, 720), 23);
        // Starting mid-block pulls in one more fetch.
        assert_eq!(calculate_swidthsw(65600, 100), 3);
    }

    #[test]
    fn test_row_padding_zeroes_tail() {
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0xaau8; 16];
        copy_plane_rows(&src, 4, 2, 8, &mut dst).unwrap();
        assert_eq!(dst, [1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8, 0, 0, 0, 0]);
    }

    #[test]
    fn test_row_padding_rejects_short_source() {
        let src = [1u8; 6];
        let mut dst = [0u8; 16];
        assert!(copy_plane_rows(&src, 4, 2, 8, &mut dst).is_err());
    }

    #[test]
    fn test_format_planes_i420_layout() {
        let frame = FrameDescriptor {
            format: PixelFormat::I420,
            width: 4,
            height: 2,
            y_stride: 64,
            uv_stride: 64,
            gtt_offset_pages: 0,
        };
        let y = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let u = [9u8, 10];
        let v = [11u8, 12];
        let mut dst = vec![0xaau8; 3 * PAGE_SIZE as usize];
        format_planes(&frame, &PlaneData { y: &y, u: &u, v: &v }, &mut dst).unwrap();
        assert_eq!(&dst[0..4], &[1, 2, 3, 4]);
        assert_eq!(&dst[64..68], &[5, 6, 7, 8]);
        assert!(dst[4..64].iter().all(|&b| b == 0));
        assert_eq!(&dst[4096..4098], &[9, 10]);
        assert_eq!(&dst[8192..8194], &[11, 12]);
    }

    #[test]
    fn test_format_planes_yv12_swaps_chroma() {
        let frame = FrameDescriptor {
            format: PixelFormat::Yv12,
            width: 4,
            height: 2,
            y_stride: 64,
            uv_stride: 64,
            gtt_offset_pages: 0,
        };
        let y = [0u8; 8];
        let u = [9u8, 10];
        let v = [11u8, 12];
        let mut dst = vec![0u8; 3 * PAGE_SIZE as usize];
        format_planes(&frame, &PlaneData { y: &y, u: &u, v: &v }, &mut dst).unwrap();
        assert_eq!(&dst[4096..4098], &[11, 12]);
        assert_eq!(&dst[8192..8194], &[9, 10]);
    }

    #[test]
    fn test_post_commit_word_and_coeff_reload() {
        let mut f = fixture();
        f.shared.set_position(0, Rect::new(0, 0, 320, 240)).unwrap();
        let frame = i420_frame();
        f.pipeline.post(&frame).unwrap();
        let writes = f.device.register_writes();
        assert_eq!(writes.len(), 1);
        let (mask, ovadd) = writes[0];
        assert_eq!(mask, ENGINE_A);
        assert_eq!(ovadd, (f.block_page << 12) | OVADD_COEF_RELOAD);
        assert!(f.pipeline.is_enabled());
        // Unity scale: integer part one, no fraction.
        assert_eq!(f.pipeline.control_block().yrgbscale, 1 << 15);

        // Same geometry again: cached coefficients, no reload bit.
        f.pipeline.post(&frame).unwrap();
        let writes = f.device.register_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].1 & OVADD_COEF_RELOAD, 0);
    }

    #[test]
    fn test_post_window_clamped_to_panel() {
        let mut f = fixture();
        f.shared
            .set_position(0, Rect::new(-8, 1000, 320, 600))
            .unwrap();
        f.pipeline.post(&i420_frame()).unwrap();
        let block = f.pipeline.control_block();
        // Panel is 720x1280: x pulled to 0, height cut to the bottom edge.
        assert_eq!(block.dwinpos, 1000 << 16);
        assert_eq!(block.dwinsz, (280 << 16) | 320);
    }

    #[test]
    fn test_post_rejects_collapsed_window() {
        let mut f = fixture();
        f.shared
            .set_position(0, Rect::new(800, 0, 320, 240))
            .unwrap();
        let err = f.pipeline.post(&i420_frame()).unwrap_err();
        assert!(matches!(err, Error::Geometry(_)));
        assert!(f.device.register_writes().is_empty());
    }

    #[test]
    fn test_extend_placement_letterboxes() {
        let hdmi = DisplayMode::new(1920, 1080, 60);
        // 4:3 source pillarboxed on a 16:9 display.
        assert_eq!(
            extend_placement(640, 480, &hdmi),
            Rect::new(240, 0, 1440, 1080)
        );
        // Tall source: centred horizontally.
        assert_eq!(
            extend_placement(480, 960, &hdmi),
            Rect::new(690, 0, 540, 1080)
        );
        // Ultra-wide source: centred vertically.
        assert_eq!(
            extend_placement(2560, 800, &DisplayMode::new(1280, 720, 60)),
            Rect::new(0, 160, 1280, 400)
        );
    }

    #[test]
    fn test_mode_change_disables_on_old_pipe_first() {
        let mut f = fixture();
        f.shared.set_position(0, Rect::new(0, 0, 320, 240)).unwrap();
        f.pipeline.post(&i420_frame()).unwrap();
        assert_eq!(f.pipeline.pipe(), Pipe::A);

        f.device.plug_external(vec![DisplayMode::new(1920, 1080, 60)]);
        f.cache.detect(Output::External).unwrap();
        f.cache.select_mode(Output::External, None).unwrap();
        f.pipeline.set_presentation(PresentationMode::Extend);

        f.pipeline.post(&i420_frame()).unwrap();
        assert_eq!(f.pipeline.pipe(), Pipe::B);
        let writes = f.device.register_writes();
        assert_eq!(writes.len(), 3);
        // Disable lands on the old pipe, and its scan-out drains, before
        // anything touches B.
        assert_eq!(writes[1].1 & 0xc0, Pipe::A.select_bits());
        assert_eq!(writes[2].1 & 0xc0, Pipe::B.select_bits());
        let entries = f.journal.entries();
        let drain = entries.iter().position(|e| e == "wait_vblank A").unwrap();
        let flip_to_b = entries
            .iter()
            .rposition(|e| e.starts_with("write_overlay"))
            .unwrap();
        assert!(drain < flip_to_b);
        // Letterboxed full-height window on the external timing.
        let block = f.pipeline.control_block();
        assert_eq!(block.dwinsz, (1080 << 16) | 1440);
        assert_eq!(block.dwinpos & 0xffff, 240);
    }

    #[test]
    fn test_presentation_change_marks_mode_switch() {
        let f = fixture();
        let mut pipeline = f.pipeline;
        assert!(!f.shared.take_mode_changed());
        pipeline.set_presentation(PresentationMode::Extend);
        assert!(f.shared.take_mode_changed());
        pipeline.set_presentation(PresentationMode::Extend);
        assert!(!f.shared.take_mode_changed());
    }

    #[test]
    fn test_disable_is_idempotent() {
        let mut f = fixture();
        f.pipeline.disable().unwrap();
        assert!(f.device.register_writes().is_empty());

        f.shared.set_position(0, Rect::new(0, 0, 320, 240)).unwrap();
        f.pipeline.post(&i420_frame()).unwrap();
        f.pipeline.disable().unwrap();
        assert!(!f.pipeline.is_enabled());
        assert_eq!(f.device.register_writes().len(), 2);
        f.pipeline.disable().unwrap();
        assert_eq!(f.device.register_writes().len(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_strides() {
        let mut frame = i420_frame();
        frame.uv_stride = 0;
        assert!(frame.validate().is_err());
        let packed = FrameDescriptor {
            format: PixelFormat::Yuy2,
            width: 64,
            height: 64,
            y_stride: 128,
            uv_stride: 0,
            gtt_offset_pages: 0,
        };
        assert!(packed.validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_swidthsw_odd_and_covering(offset in 0u32..1 << 20, width in 1u32..8192) {
            let sw = calculate_swidthsw(offset, width);
            // Always an odd block count, and wide enough for the row.
            prop_assert_eq!(sw & 1, 1);
            prop_assert!(sw >= (width >> 6).max(1));
        }

        #[test]
        fn prop_extend_placement_fits_and_centres(
            src_w in 16u32..4096,
            src_h in 16u32..4096,
        ) {
            let mode = DisplayMode::new(1920, 1080, 60);
            let rect = extend_placement(src_w, src_h, &mode);
            prop_assert!(rect.w <= mode.hdisplay);
            prop_assert!(rect.h <= mode.vdisplay);
            prop_assert!(rect.x == 0 || rect.y == 0);
            prop_assert!(rect.x as u32 * 2 + rect.w <= mode.hdisplay + 1);
            prop_assert!(rect.y as u32 * 2 + rect.h <= mode.vdisplay + 1);
        }
    }
}
