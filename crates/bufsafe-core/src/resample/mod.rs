//! Interpolating sample-rate conversion
//!
//! Converts one channel of samples by reading the input at fractional
//! positions spaced `1 / ratio` apart, where `ratio = output_rate /
//! input_rate`. Everything writes into caller-supplied buffers (normally pool
//! blocks) and never allocates.
//!
//! ## Interpolation Methods
//!
//! - **Linear**: 2 points, cheapest.
//! - **Cubic**: Catmull-Rom spline over 4 points.
//! - **Sinc**: 8-tap windowed sinc, band-limited.
//!
//! [`convert_block`] treats each block on its own and clamps reads at the
//! block edges. [`RateConverter`] keeps the fractional phase and the last few
//! input samples between calls, and reads [`STREAM_LATENCY`] samples behind
//! the newest input, so every kernel tap is a real sample and consecutive
//! blocks join seamlessly.

use serde::{Deserialize, Serialize};

use crate::types::Sample;

/// Samples of history a streaming converter keeps (the sinc kernel width)
pub const KERNEL_TAPS: usize = 8;

/// Input samples a [`RateConverter`] lags behind its input: half a sinc
/// kernel, so the rightmost tap never runs past the end of a block
pub const STREAM_LATENCY: usize = KERNEL_TAPS / 2;

/// Interpolation method for rate conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationMethod {
    /// Linear interpolation (2-point) - fast, audible aliasing on large ratios
    Linear,
    /// Cubic Catmull-Rom interpolation (4-point)
    #[default]
    Cubic,
    /// Sinc interpolation (8-tap) - highest quality, most CPU
    Sinc,
}

/// Outcome of one conversion call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    /// Input samples covered by the written output
    pub input_consumed: usize,
    /// Output samples written
    pub output_written: usize,
    /// Output samples that did not fit into the supplied buffer
    pub shortfall: usize,
}

impl ConversionReport {
    pub fn is_complete(&self) -> bool {
        self.shortfall == 0
    }
}

/// Output samples produced from `input_len` samples at `ratio`
pub fn output_len_for(input_len: usize, ratio: f64) -> usize {
    if input_len == 0 || !ratio.is_finite() || ratio <= 0.0 {
        return 0;
    }
    (input_len as f64 * ratio).ceil() as usize
}

// ─────────────────────────────────────────────────────────────────────────────
// Interpolation Functions
// ─────────────────────────────────────────────────────────────────────────────

#[inline]
fn lerp(s0: Sample, s1: Sample, t: f32) -> Sample {
    s0 + (s1 - s0) * t
}

/// Cubic Catmull-Rom interpolation (4-point)
///
/// Passes through all control points with a continuous first derivative.
#[inline]
fn cubic(s0: Sample, s1: Sample, s2: Sample, s3: Sample, t: f32) -> Sample {
    let t2 = t * t;
    let t3 = t2 * t;

    // Catmull-Rom basis (tension 0.5)
    let c0 = -0.5 * t3 + t2 - 0.5 * t;
    let c1 = 1.5 * t3 - 2.5 * t2 + 1.0;
    let c2 = -1.5 * t3 + 2.0 * t2 + 0.5 * t;
    let c3 = 0.5 * t3 - 0.5 * t2;

    s0 * c0 + s1 * c1 + s2 * c2 + s3 * c3
}

/// Sinc kernel with a Blackman-Harris window spanning -4..4 samples
#[inline]
fn windowed_sinc(x: f64) -> f64 {
    if x.abs() < 1e-10 {
        return 1.0;
    }

    let n = (x + 4.0) / 8.0;
    if !(0.0..=1.0).contains(&n) {
        return 0.0;
    }

    let pi_x = x * std::f64::consts::PI;
    let sinc = pi_x.sin() / pi_x;

    const A0: f64 = 0.35875;
    const A1: f64 = 0.48829;
    const A2: f64 = 0.14128;
    const A3: f64 = 0.01168;
    let tau = std::f64::consts::TAU;

    let window =
        A0 - A1 * (tau * n).cos() + A2 * (2.0 * tau * n).cos() - A3 * (3.0 * tau * n).cos();

    sinc * window
}

/// 8-tap sinc interpolation; `taps[3]` sits at offset 0
#[inline]
fn sinc(taps: &[Sample; KERNEL_TAPS], t: f64) -> Sample {
    let mut acc = 0.0f64;
    let mut weight_sum = 0.0f64;

    for (i, &sample) in taps.iter().enumerate() {
        let weight = windowed_sinc((i as f64 - 3.0) - t);
        weight_sum += weight;
        acc += sample as f64 * weight;
    }

    if weight_sum.abs() > 1e-10 {
        acc /= weight_sum;
    }
    acc as Sample
}

/// Interpolate at `position` using `fetch` to read (possibly out-of-range)
/// integer indices
#[inline]
fn interpolate<F>(fetch: F, position: f64, method: InterpolationMethod) -> Sample
where
    F: Fn(i64) -> Sample,
{
    let index = position.floor() as i64;
    let frac = position - position.floor();

    match method {
        InterpolationMethod::Linear => lerp(fetch(index), fetch(index + 1), frac as f32),
        InterpolationMethod::Cubic => cubic(
            fetch(index - 1),
            fetch(index),
            fetch(index + 1),
            fetch(index + 2),
            frac as f32,
        ),
        InterpolationMethod::Sinc => {
            let mut taps = [0.0; KERNEL_TAPS];
            for (k, tap) in taps.iter_mut().enumerate() {
                *tap = fetch(index + k as i64 - 3);
            }
            sinc(&taps, frac)
        }
    }
}

/// Read with edges clamped to the first/last sample
#[inline]
fn clamped(data: &[Sample], index: i64) -> Sample {
    let last = data.len() as i64 - 1;
    data[index.clamp(0, last) as usize]
}

/// Read `data` at a fractional position, clamping at the edges
pub fn read_interpolated(data: &[Sample], position: f64, method: InterpolationMethod) -> Sample {
    if data.is_empty() {
        return 0.0;
    }
    interpolate(|i| clamped(data, i), position, method)
}

/// Convert one self-contained block
///
/// Writes `min(output.len(), output_len_for(input.len(), ratio))` samples
/// and reports how many more would have been produced.
pub fn convert_block(
    input: &[Sample],
    output: &mut [Sample],
    ratio: f64,
    method: InterpolationMethod,
) -> ConversionReport {
    let needed = output_len_for(input.len(), ratio);
    if needed == 0 {
        return ConversionReport::default();
    }

    let step = 1.0 / ratio;
    let written = needed.min(output.len());
    for (i, out) in output[..written].iter_mut().enumerate() {
        *out = read_interpolated(input, i as f64 * step, method);
    }

    let input_consumed = if written == needed {
        input.len()
    } else {
        ((written as f64 * step).ceil() as usize).min(input.len())
    };

    ConversionReport {
        input_consumed,
        output_written: written,
        shortfall: needed - written,
    }
}

/// Streaming converter for one channel
///
/// Call [`process`](Self::process) once per block. The ratio may change
/// between blocks (drift correction) without a phase jump. Output is
/// delayed by [`STREAM_LATENCY`] input samples; the first block is
/// edge-extended backwards to fill that delay.
#[derive(Debug, Clone)]
pub struct RateConverter {
    ratio: f64,
    method: InterpolationMethod,
    /// Read position relative to the start of the next input block,
    /// before the fixed `STREAM_LATENCY` delay is applied
    position: f64,
    /// Last input samples of previous blocks, oldest first
    history: [Sample; KERNEL_TAPS],
    primed: bool,
}

impl RateConverter {
    /// `ratio = output_rate / input_rate`; non-positive ratios fall back to 1.0
    pub fn new(ratio: f64, method: InterpolationMethod) -> Self {
        Self {
            ratio: sanitize_ratio(ratio),
            method,
            position: 0.0,
            history: [0.0; KERNEL_TAPS],
            primed: false,
        }
    }

    pub fn from_rates(input_rate: u32, output_rate: u32, method: InterpolationMethod) -> Self {
        let ratio = if input_rate == 0 {
            1.0
        } else {
            output_rate as f64 / input_rate as f64
        };
        Self::new(ratio, method)
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Delay between input and output, in input samples
    pub fn latency(&self) -> usize {
        STREAM_LATENCY
    }

    pub fn set_ratio(&mut self, ratio: f64) {
        self.ratio = sanitize_ratio(ratio);
    }

    pub fn method(&self) -> InterpolationMethod {
        self.method
    }

    pub fn set_method(&mut self, method: InterpolationMethod) {
        self.method = method;
    }

    /// Forget phase and history
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.history = [0.0; KERNEL_TAPS];
        self.primed = false;
    }

    /// Convert the next block
    ///
    /// If `output` is too small, the samples that do not fit are counted in
    /// `shortfall` and the rest of the block is skipped so the stream stays
    /// in time.
    pub fn process(&mut self, input: &[Sample], output: &mut [Sample]) -> ConversionReport {
        if input.is_empty() {
            return ConversionReport::default();
        }
        if !self.primed {
            // Edge-extend the first block backwards instead of ramping from 0
            self.history = [input[0]; KERNEL_TAPS];
            self.primed = true;
        }

        let len = input.len() as f64;
        let step = 1.0 / self.ratio;
        let history = self.history;
        // With position in [0, len) and the read shifted back by
        // STREAM_LATENCY, taps span -KERNEL_TAPS..len and never clamp
        let fetch = |i: i64| -> Sample {
            if i < 0 {
                let back = (KERNEL_TAPS as i64 + i).max(0) as usize;
                history[back]
            } else {
                clamped(input, i)
            }
        };
        let delay = STREAM_LATENCY as f64;

        let mut written = 0;
        let mut position = self.position;
        while position < len && written < output.len() {
            output[written] = interpolate(fetch, position - delay, self.method);
            written += 1;
            position += step;
        }

        let mut shortfall = 0;
        let input_consumed = if position < len {
            let remaining = ((len - position) / step).ceil() as usize;
            shortfall = remaining;
            let consumed = position.max(0.0).ceil() as usize;
            position += remaining as f64 * step;
            consumed.min(input.len())
        } else {
            input.len()
        };

        self.position = position - len;
        self.push_history(input);

        ConversionReport {
            input_consumed,
            output_written: written,
            shortfall,
        }
    }

    fn push_history(&mut self, input: &[Sample]) {
        if input.len() >= KERNEL_TAPS {
            self.history
                .copy_from_slice(&input[input.len() - KERNEL_TAPS..]);
        } else {
            self.history.rotate_left(input.len());
            self.history[KERNEL_TAPS - input.len()..].copy_from_slice(input);
        }
    }
}

fn sanitize_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() && ratio > 0.0 {
        ratio
    } else {
        1.0
    }
}
