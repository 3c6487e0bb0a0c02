//! Polyphase scaler coefficient engine
//!
//! Computes the overlay scaler's fixed-point scale factors (1/4096
//! units, chroma kept exactly commensurate with luma) and the polyphase
//! windowed-sinc filter taps, encoded into the hardware's
//! sign/exponent/mantissa floating format. Coefficient generation is
//! expensive, so the engine caches on the encoded scale register values
//! and regenerates only when they change.

use crate::{Error, Result};
use std::f64::consts::PI;

/// Sub-pixel phases per filter.
pub const N_PHASES: usize = 32;
/// Horizontal luma taps.
pub const N_HORIZ_Y_TAPS: usize = 5;
/// Horizontal chroma taps.
pub const N_HORIZ_UV_TAPS: usize = 3;

/// Largest supported integer downscale ratio.
pub const MAX_SCALE_RATIO: u32 = 7;

const MIN_CUTOFF_FREQ: f64 = 1.0;
const MAX_CUTOFF_FREQ: f64 = 3.0;

/// Chroma is sub-sampled 2:1 against luma in both axes.
const UV_RATIO: u32 = 2;

/// Fixed-point scale factors for one frame geometry. All values are in
/// 1/4096 units with the integer part included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleFactors {
    x: u32,
    y: u32,
    x_uv: u32,
    y_uv: u32,
}

impl ScaleFactors {
    /// Derive the scale factors for `src` scanned out into `dst`.
    ///
    /// Chroma factors are luma divided by the sub-sampling ratio, and
    /// luma is then re-derived from the rounded chroma value so the two
    /// planes stay exactly commensurate.
    pub fn compute(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Result<Self> {
        if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
            return Err(Error::Geometry(format!(
                "degenerate scale {}x{} -> {}x{}",
                src_w, src_h, dst_w, dst_h
            )));
        }

        let (x, y) = if src_w == dst_w && src_h == dst_h {
            (1u32 << 12, 1u32 << 12)
        } else {
            let x = ((src_w as u64 - 1) << 12) / dst_w as u64;
            let y = ((src_h as u64 - 1) << 12) / dst_h as u64;
            (x as u32, y as u32)
        };

        let x_uv = x / UV_RATIO;
        let y_uv = y / UV_RATIO;
        let x = x_uv * UV_RATIO;
        let y = y_uv * UV_RATIO;

        if x >> 12 > MAX_SCALE_RATIO {
            return Err(Error::ScaleRatio(x >> 12));
        }
        if x_uv >> 12 > MAX_SCALE_RATIO {
            return Err(Error::ScaleRatio(x_uv >> 12));
        }

        Ok(Self { x, y, x_uv, y_uv })
    }

    pub fn x_luma(&self) -> u32 {
        self.x
    }

    pub fn y_luma(&self) -> u32 {
        self.y
    }

    pub fn x_chroma(&self) -> u32 {
        self.x_uv
    }

    pub fn y_chroma(&self) -> u32 {
        self.y_uv
    }

    /// Packed luma scale register: integer X at bit 15, fractional X at
    /// bit 3, fractional Y at bit 20.
    pub fn yrgb_scale_register(&self) -> u32 {
        ((self.x >> 12) << 15) | ((self.x & 0xFFF) << 3) | ((self.y & 0xFFF) << 20)
    }

    /// Packed chroma scale register, same layout as luma.
    pub fn uv_scale_register(&self) -> u32 {
        ((self.x_uv >> 12) << 15) | ((self.x_uv & 0xFFF) << 3) | ((self.y_uv & 0xFFF) << 20)
    }

    /// Packed vertical integer downscale register: luma at bit 16,
    /// chroma at bit 0.
    pub fn uv_vertical_register(&self) -> u32 {
        ((self.y >> 12) << 16) | (self.y_uv >> 12)
    }

    /// Filter cutoff for the luma plane, clamped to the supported band.
    pub fn luma_cutoff(&self) -> f64 {
        (self.x as f64 / 4096.0).clamp(MIN_CUTOFF_FREQ, MAX_CUTOFF_FREQ)
    }

    /// Filter cutoff for the chroma planes, clamped to the supported band.
    pub fn chroma_cutoff(&self) -> f64 {
        (self.x_uv as f64 / 4096.0).clamp(MIN_CUTOFF_FREQ, MAX_CUTOFF_FREQ)
    }
}

/// One encoded filter tap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoeffTap {
    pub sign: u8,
    /// Power-of-two scale selector, 2 bits.
    pub exponent: u8,
    /// Mantissa, pre-shifted into its register position.
    pub mantissa: u16,
}

impl CoeffTap {
    /// Register word: sign at bit 15, exponent at bit 12, mantissa below.
    pub fn packed(&self) -> u32 {
        ((self.sign as u32) << 15) | ((self.exponent as u32) << 12) | self.mantissa as u32
    }
}

/// Encoded coefficients for one filter, `taps` entries per phase in
/// phase-major order.
#[derive(Debug, Clone)]
pub struct FilterCoefficientSet {
    taps: usize,
    regs: Vec<CoeffTap>,
    /// Quantized values actually representable by the encoding.
    values: Vec<f64>,
}

impl FilterCoefficientSet {
    pub fn taps(&self) -> usize {
        self.taps
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    /// Register word at `pos = phase * taps + tap`.
    pub fn packed(&self, pos: usize) -> u32 {
        self.regs[pos].packed()
    }

    pub fn tap(&self, phase: usize, tap: usize) -> CoeffTap {
        self.regs[phase * self.taps + tap]
    }

    pub fn value(&self, phase: usize, tap: usize) -> f64 {
        self.values[phase * self.taps + tap]
    }

    /// Sum of the quantized taps for one phase.
    pub fn phase_sum(&self, phase: usize) -> f64 {
        self.values[phase * self.taps..][..self.taps].iter().sum()
    }
}

/// Encode one coefficient by the largest power-of-two scale (4x, 2x,
/// 1x, 0.5x the mantissa range) that keeps the mantissa in range.
/// Returns the encoded tap and the quantized value it represents, or
/// `None` when the magnitude is unrepresentable.
pub(crate) fn encode_coeff(value: f64, mant_size: u32) -> Option<(CoeffTap, f64)> {
    let max_val = 1i64 << mant_size;
    let (sign, c) = if value < 0.0 {
        (1u8, -value)
    } else {
        (0u8, value)
    };
    let res = 12 - mant_size;

    let scales = [(3u8, 4.0f64), (2, 2.0), (1, 1.0), (0, 0.5)];
    for (exponent, scale) in scales {
        let icoeff = (c * scale * max_val as f64 + 0.5) as i64;
        if icoeff < max_val {
            let quantized = icoeff as f64 / (scale * max_val as f64);
            return Some((
                CoeffTap {
                    sign,
                    exponent,
                    mantissa: (icoeff as u16) << res,
                },
                if sign == 1 { -quantized } else { quantized },
            ));
        }
    }
    None
}

fn tap_mant_size(tap: usize, taps: usize, base: u32, vert_chroma: bool) -> u32 {
    // the center tap carries two extra mantissa bits except on the
    // vertical chroma filter
    if tap == (taps - 1) / 2 && !vert_chroma {
        base + 2
    } else {
        base
    }
}

/// Residual-adjustment order: center tap first, then symmetric
/// neighbors walking outward.
fn adjust_order(taps: usize) -> Vec<usize> {
    let center = (taps - 1) / 2;
    let mut order = Vec::with_capacity(taps);
    order.push(center);
    for step in 1..=center {
        order.push(center - step);
        order.push(center + step);
    }
    for tap in 0..taps {
        if !order.contains(&tap) {
            order.push(tap);
        }
    }
    order
}

/// Design one polyphase filter: windowed-sinc generation, per-phase
/// normalization, hardware encoding, and unity-sum redistribution of
/// the quantization residual.
pub fn update_coefficients(
    taps: usize,
    cutoff: f64,
    horizontal: bool,
    luma: bool,
) -> Result<FilterCoefficientSet> {
    let mant_size: u32 = if horizontal { 7 } else { 6 };
    let vert_chroma = !horizontal && !luma;
    let num = taps * 16;

    let mut raw = vec![0.0f64; num * 2];
    for (i, slot) in raw.iter_mut().enumerate() {
        let val = (1.0 / cutoff) * taps as f64 * PI * (i as f64 - num as f64) / (2.0 * num as f64);
        let sinc = if val == 0.0 { 1.0 } else { val.sin() / val };
        let window = 0.54 - 0.46 * (2.0 * i as f64 * PI / (2.0 * num as f64 - 1.0)).cos();
        *slot = sinc * window;
    }

    let mut regs = vec![CoeffTap::default(); taps * N_PHASES];
    let mut values = vec![0.0f64; taps * N_PHASES];
    let order = adjust_order(taps);

    for phase in 0..N_PHASES {
        let mut coeffs = vec![0.0f64; taps];
        let mut sum = 0.0;
        for (j, c) in coeffs.iter_mut().enumerate() {
            *c = raw[phase + j * N_PHASES];
            sum += *c;
        }
        for c in coeffs.iter_mut() {
            *c /= sum;
        }

        for (j, c) in coeffs.iter_mut().enumerate() {
            let pos = phase * taps + j;
            let size = tap_mant_size(j, taps, mant_size, vert_chroma);
            let (tap, quantized) =
                encode_coeff(*c, size).ok_or(Error::CoeffOverflow { phase, tap: j })?;
            regs[pos] = tap;
            *c = quantized;
        }

        // Quantized values are dyadic rationals, so the sum comparison
        // against 1.0 is exact.
        let mut sum: f64 = coeffs.iter().sum();
        if sum != 1.0 {
            for &fix in &order {
                let diff = 1.0 - sum;
                coeffs[fix] += diff;
                let pos = phase * taps + fix;
                let size = tap_mant_size(fix, taps, mant_size, vert_chroma);
                let (tap, quantized) =
                    encode_coeff(coeffs[fix], size).ok_or(Error::CoeffOverflow { phase, tap: fix })?;
                regs[pos] = tap;
                coeffs[fix] = quantized;
                sum = coeffs.iter().sum();
                if sum == 1.0 {
                    break;
                }
            }
        }

        values[phase * taps..][..taps].copy_from_slice(&coeffs);
    }

    Ok(FilterCoefficientSet { taps, regs, values })
}

/// A regenerated scaler configuration: the three scale registers plus
/// the horizontal luma and chroma coefficient sets.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub yrgb_scale: u32,
    pub uv_scale: u32,
    pub uv_scale_vertical: u32,
    pub y_horizontal: FilterCoefficientSet,
    pub uv_horizontal: FilterCoefficientSet,
}

/// Regenerates coefficients only when the encoded scale registers
/// change between frames.
#[derive(Debug, Default)]
pub struct ScalerCoefficientEngine {
    cached: Option<(u32, u32, u32)>,
}

impl ScalerCoefficientEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new configuration when the factors differ from the
    /// cached ones, `None` on a cache hit. A coefficient failure leaves
    /// the cache untouched.
    pub fn configure(&mut self, factors: &ScaleFactors) -> Result<Option<ScalerConfig>> {
        let key = (
            factors.yrgb_scale_register(),
            factors.uv_scale_register(),
            factors.uv_vertical_register(),
        );
        if self.cached == Some(key) {
            return Ok(None);
        }

        let y_horizontal = update_coefficients(N_HORIZ_Y_TAPS, factors.luma_cutoff(), true, true)?;
        let uv_horizontal =
            update_coefficients(N_HORIZ_UV_TAPS, factors.chroma_cutoff(), true, false)?;

        self.cached = Some(key);
        Ok(Some(ScalerConfig {
            yrgb_scale: key.0,
            uv_scale: key.1,
            uv_scale_vertical: key.2,
            y_horizontal,
            uv_horizontal,
        }))
    }

    /// Force regeneration on the next `configure`.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}
