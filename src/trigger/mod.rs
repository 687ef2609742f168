//! Trigger logic compiler.
//!
//! A rule such as `"CH1 or (CH2 and not CH3)"` over the six trigger inputs is
//! parsed into a [`TriggerExpr`] and evaluated over all 64 input
//! combinations. The result is the 64-bit pattern the firmware looks up on
//! every clock cycle, written as two 32-bit registers.

pub mod expr;
pub mod mask;

pub use expr::{TriggerExpr, CHANNELS, MAX_NESTING, MAX_RULE_TOKENS};
pub use mask::{
    compile, compile_expr, internal_trigger_interval, interval_to_frequency, pack_pulse_vector,
    unpack_pulse_vector, TriggerMask,
};
