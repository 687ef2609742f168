//! I2C sub-bus to the TLU peripheral chips.
//!
//! - [`I2cMaster`] / [`I2cSession`] - transaction engine on top of the
//!   register bus
//! - [`devices`] - static address table and the few peripheral operations
//!   configuration needs

pub mod devices;
pub mod engine;

pub use devices::I2cDevice;
pub use engine::{
    I2cConfig, I2cDirection, I2cMaster, I2cOutcome, I2cSession, I2cTransaction,
};
