//! # TLU DAQ Core Library
//!
//! Configuration and readout of a Trigger Logic Unit. The TLU combines up to
//! six discriminated detector inputs with a programmable trigger rule, vetoes
//! triggers while devices under test are busy, and streams timestamped event
//! frames into a FIFO that the host drains.
//!
//! ## Crate Structure
//!
//! - **`bus`**: The `RegisterBus` queue/dispatch abstraction, the `SharedBus`
//!   lock and the `MockRegisterBus` board simulator.
//! - **`clock`**: Injected monotonic time (`MonotonicClock`, `ManualClock`).
//! - **`i2c`**: OpenCores I2C master transaction engine and the peripheral
//!   address table (threshold DACs, IO expanders, EEPROM).
//! - **`trigger`**: Trigger rule parser and the 64-bit mask compiler, pulse
//!   vector packing and the internal trigger generator interval.
//! - **`event`**: Decoding of six-word FIFO frames into `EventRecord`s.
//! - **`tlu`**: Register-level board control: resets, veto, counters,
//!   timestamp, FIFO access and applying a configuration.
//! - **`acquisition`**: Run state machine, readout loop, status task and the
//!   event and telemetry sinks.
//! - **`config`**: Figment-based configuration loading and compilation into
//!   register values.
//! - **`error`**: The `TluError` taxonomy.
//! - **`logging`**: Tracing subscriber setup for binaries.

pub mod acquisition;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod i2c;
pub mod logging;
pub mod tlu;
pub mod trigger;

pub use error::{ErrorKind, Result, TluError};
