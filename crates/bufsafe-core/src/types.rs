//! Common types for bufsafe

/// Default sample rate (48kHz - standard professional audio rate)
pub const SAMPLE_RATE: u32 = 48000;

/// Audio sample type (32-bit float for processing)
pub type Sample = f32;
