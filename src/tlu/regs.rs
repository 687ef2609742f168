//! Register names of the TLU firmware address table.

#![allow(missing_docs)]

// Trigger logic
pub const TRIGGER_PATTERN_LOW: &str = "triggerLogic.TriggerPattern_lowW";
pub const TRIGGER_PATTERN_HIGH: &str = "triggerLogic.TriggerPattern_highW";
pub const PULSE_STRETCH: &str = "triggerLogic.PulseStretchW";
pub const PULSE_DELAY: &str = "triggerLogic.PulseDelayW";
pub const TRIGGER_VETO: &str = "triggerLogic.TriggerVetoW";
pub const INTERNAL_TRIGGER_INTERVAL: &str = "triggerLogic.InternalTriggerIntervalW";
pub const PRE_VETO_TRIGGERS: &str = "triggerLogic.PreVetoTriggersR";
pub const POST_VETO_TRIGGERS: &str = "triggerLogic.PostVetoTriggersR";
pub const RESET_COUNTERS: &str = "triggerLogic.ResetCountersW";

// DUT interfaces
pub const DUT_MASK: &str = "DUTInterfaces.DUTMaskW";
pub const IGNORE_DUT_BUSY: &str = "DUTInterfaces.IgnoreDUTBusyW";
pub const DUT_INTERFACE_MODE: &str = "DUTInterfaces.DUTInterfaceModeW";
pub const DUT_INTERFACE_MODE_MODIFIER: &str = "DUTInterfaces.DUTInterfaceModeModifierW";

// Event formatter
pub const RESET_TIMESTAMP: &str = "Event_Formatter.ResetTimestampW";
pub const CURRENT_TIMESTAMP_LOW: &str = "Event_Formatter.CurrentTimestampLR";
pub const CURRENT_TIMESTAMP_HIGH: &str = "Event_Formatter.CurrentTimestampHR";

// Event buffer
pub const EVENT_FIFO_CSR: &str = "eventBuffer.EventFifoCSR";
pub const EVENT_FIFO_FILL_LEVEL: &str = "eventBuffer.EventFifoFillLevel";
pub const EVENT_FIFO_DATA: &str = "eventBuffer.EventFifoData";

// Run control
pub const RUN_ACTIVE: &str = "Shutter.RunActiveRW";

// Identification
pub const FIRMWARE_VERSION: &str = "version";

/// Value written to [`EVENT_FIFO_CSR`] to flush the event buffer.
pub const FIFO_RESET: u32 = 0x2;
