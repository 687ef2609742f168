//! Register encodings of the trigger logic.

use serde::{Deserialize, Serialize};

use super::expr::{TriggerExpr, CHANNELS};
use crate::error::{Result, TluError};

/// Number of input combinations covered by the mask.
pub const COMBINATIONS: u32 = 1 << CHANNELS;

/// Trigger-logic clock feeding the internal trigger generator.
pub const TRIGGER_LOGIC_CLOCK_HZ: f64 = 160e6;

/// Shortest interval the internal generator accepts, in clock cycles.
pub const MIN_INTERNAL_INTERVAL: u32 = 2;

/// Width of one pulse-vector element.
pub const PULSE_FIELD_BITS: u32 = 5;

/// Largest value a pulse-vector element can hold.
pub const PULSE_FIELD_MAX: u32 = (1 << PULSE_FIELD_BITS) - 1;

/// 64-bit trigger pattern split over two registers.
///
/// Bit `c` of `high:low` is set iff input combination `c` fires a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerMask {
    /// Combinations 0..31
    pub low: u32,
    /// Combinations 32..63
    pub high: u32,
}

impl TriggerMask {
    /// Whether combination `c` is accepted.
    pub fn accepts(&self, combination: u8) -> bool {
        let c = u32::from(combination) & (COMBINATIONS - 1);
        if c < 32 {
            self.low & (1 << c) != 0
        } else {
            self.high & (1 << (c - 32)) != 0
        }
    }

    /// Both halves as one word.
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.high) << 32) | u64::from(self.low)
    }
}

/// Evaluate a parsed rule over every input combination.
pub fn compile_expr(expr: &TriggerExpr) -> TriggerMask {
    let mut mask = 0u64;
    for combination in 0..COMBINATIONS as u8 {
        if expr.eval(combination) {
            mask |= 1 << combination;
        }
    }
    TriggerMask {
        low: mask as u32,
        high: (mask >> 32) as u32,
    }
}

/// Parse and compile rule text into a mask.
pub fn compile(rule: &str) -> Result<TriggerMask> {
    TriggerExpr::parse(rule).map(|expr| compile_expr(&expr))
}

/// Pack six 5-bit stretch or delay values into one register word.
pub fn pack_pulse_vector(values: [u32; 6]) -> Result<u32> {
    let mut word = 0u32;
    for (i, value) in values.iter().enumerate() {
        if *value > PULSE_FIELD_MAX {
            return Err(TluError::config(format!(
                "pulse vector element {} is {}, maximum is {}",
                i, value, PULSE_FIELD_MAX
            )));
        }
        word |= value << (PULSE_FIELD_BITS * i as u32);
    }
    Ok(word)
}

/// Split a packed register word back into its six elements.
pub fn unpack_pulse_vector(word: u32) -> [u32; 6] {
    let mut values = [0u32; 6];
    for (i, value) in values.iter_mut().enumerate() {
        *value = (word >> (PULSE_FIELD_BITS * i as u32)) & PULSE_FIELD_MAX;
    }
    values
}

/// Internal trigger generator interval for `frequency_hz`.
///
/// 0 Hz disables the generator. Otherwise the interval is
/// `floor(160 MHz / frequency)`, so the generated rate is never below the
/// requested one.
pub fn internal_trigger_interval(frequency_hz: f64) -> Result<u32> {
    if !frequency_hz.is_finite() || frequency_hz < 0.0 {
        return Err(TluError::config(format!(
            "internal trigger frequency {} Hz is not a valid rate",
            frequency_hz
        )));
    }
    if frequency_hz == 0.0 {
        return Ok(0);
    }
    let interval = (TRIGGER_LOGIC_CLOCK_HZ / frequency_hz).floor();
    if interval < f64::from(MIN_INTERNAL_INTERVAL) {
        return Err(TluError::config(format!(
            "internal trigger frequency {} Hz exceeds {} Hz",
            frequency_hz,
            TRIGGER_LOGIC_CLOCK_HZ / f64::from(MIN_INTERNAL_INTERVAL)
        )));
    }
    if interval > f64::from(u32::MAX) {
        return Err(TluError::config(format!(
            "internal trigger frequency {} Hz is below the generator range",
            frequency_hz
        )));
    }
    Ok(interval as u32)
}

/// Generator frequency programmed by `interval`; 0 when disabled.
pub fn interval_to_frequency(interval: u32) -> f64 {
    if interval == 0 {
        0.0
    } else {
        TRIGGER_LOGIC_CLOCK_HZ / f64::from(interval)
    }
}
