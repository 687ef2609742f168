//! Peripheral chips on the TLU I2C bus.
//!
//! Only the operations the configuration path needs are covered: threshold
//! DACs, the DUT-interface IO expander and the EEPROM holding the board
//! identifier.

use tracing::warn;

use crate::bus::RegisterBus;
use crate::error::{Result, TluError};
use crate::i2c::engine::I2cSession;

/// Register of the bus-enable switch written during [`I2cSession::init`].
pub const ENABLE_SWITCH_REGISTER: u8 = 0x01;
/// Direction byte for the bus-enable switch; bit 7 becomes an output.
pub const ENABLE_SWITCH_DIRECTION: u8 = 0x7F;

/// Peripheral roles with fixed 7-bit addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum I2cDevice {
    /// I2C bus-enable switch on the carrier
    EnableSwitch,
    /// Si5345 clock generator
    ClockChip,
    /// Threshold DAC for inputs 1-2
    Dac1,
    /// Threshold DAC for inputs 3-6
    Dac2,
    /// 24AA025E48 EEPROM with EUI-48 identifier
    Eeprom,
    /// IO expander driving the DUT interfaces
    IoExpander1,
    /// IO expander for front-panel outputs
    IoExpander2,
    /// Power module DAC (PMT supplies)
    PowerDac,
    /// Power module IO expander 1
    PowerExpander1,
    /// Power module IO expander 2
    PowerExpander2,
}

impl I2cDevice {
    /// Every known peripheral.
    pub const ALL: [I2cDevice; 10] = [
        I2cDevice::EnableSwitch,
        I2cDevice::ClockChip,
        I2cDevice::Dac1,
        I2cDevice::Dac2,
        I2cDevice::Eeprom,
        I2cDevice::IoExpander1,
        I2cDevice::IoExpander2,
        I2cDevice::PowerDac,
        I2cDevice::PowerExpander1,
        I2cDevice::PowerExpander2,
    ];

    /// 7-bit bus address.
    pub const fn address(self) -> u8 {
        match self {
            I2cDevice::EnableSwitch => 0x21,
            I2cDevice::ClockChip => 0x68,
            I2cDevice::Dac1 => 0x13,
            I2cDevice::Dac2 => 0x1F,
            I2cDevice::Eeprom => 0x50,
            I2cDevice::IoExpander1 => 0x74,
            I2cDevice::IoExpander2 => 0x75,
            I2cDevice::PowerDac => 0x1C,
            I2cDevice::PowerExpander1 => 0x76,
            I2cDevice::PowerExpander2 => 0x77,
        }
    }

    /// Short name for log output.
    pub fn name(self) -> &'static str {
        match self {
            I2cDevice::EnableSwitch => "enable-switch",
            I2cDevice::ClockChip => "clock-chip",
            I2cDevice::Dac1 => "dac1",
            I2cDevice::Dac2 => "dac2",
            I2cDevice::Eeprom => "eeprom",
            I2cDevice::IoExpander1 => "io-expander1",
            I2cDevice::IoExpander2 => "io-expander2",
            I2cDevice::PowerDac => "power-dac",
            I2cDevice::PowerExpander1 => "power-expander1",
            I2cDevice::PowerExpander2 => "power-expander2",
        }
    }
}

// =============================================================================
// Threshold DACs (AD5665R)
// =============================================================================

/// Command nibble: write input register n and update DAC n.
pub const DAC_CMD_WRITE_UPDATE: u8 = 0x18;
/// Command: internal reference setup.
pub const DAC_CMD_INTERNAL_REF: u8 = 0x38;

/// Discriminator thresholds are accepted in `[-THRESHOLD_RANGE_V, THRESHOLD_RANGE_V]`.
pub const THRESHOLD_RANGE_V: f64 = 1.3;

/// DAC and DAC channel wired to each trigger input, inputs 1 to 6.
pub const THRESHOLD_DAC_MAP: [(I2cDevice, u8); 6] = [
    (I2cDevice::Dac1, 1),
    (I2cDevice::Dac1, 0),
    (I2cDevice::Dac2, 3),
    (I2cDevice::Dac2, 2),
    (I2cDevice::Dac2, 1),
    (I2cDevice::Dac2, 0),
];

/// Convert a threshold voltage to a 16-bit DAC code.
pub fn threshold_to_code(volts: f64) -> Result<u16> {
    if !volts.is_finite() || volts.abs() > THRESHOLD_RANGE_V {
        return Err(TluError::config(format!(
            "threshold {volts} V outside ±{THRESHOLD_RANGE_V} V"
        )));
    }
    let fraction = (volts + THRESHOLD_RANGE_V) / (2.0 * THRESHOLD_RANGE_V);
    Ok((fraction * f64::from(u16::MAX)).round() as u16)
}

/// Write a code to one DAC channel. Returns whether the DAC acknowledged
/// both data bytes.
pub fn set_dac_code<B: RegisterBus + ?Sized>(
    session: &mut I2cSession<'_, B>,
    dac: I2cDevice,
    channel: u8,
    code: u16,
) -> Result<bool> {
    let bytes = code.to_be_bytes();
    let command = DAC_CMD_WRITE_UPDATE | (channel & 0x07);
    let written = session.write(dac.address(), command, &bytes, true)?;
    Ok(written == bytes.len())
}

/// Switch a DAC to its internal reference.
pub fn enable_internal_reference<B: RegisterBus + ?Sized>(
    session: &mut I2cSession<'_, B>,
    dac: I2cDevice,
) -> Result<bool> {
    let written = session.write(dac.address(), DAC_CMD_INTERNAL_REF, &[0x00, 0x01], true)?;
    Ok(written == 2)
}

// =============================================================================
// IO expanders (PCA9539)
// =============================================================================

/// Output port register of bank 0; bank 1 follows.
pub const EXPANDER_OUTPUT_PORT: u8 = 0x02;
/// Configuration register of bank 0 (1 = input); bank 1 follows.
pub const EXPANDER_CONFIG_PORT: u8 = 0x06;

/// Program direction and output level of one expander bank.
pub fn configure_expander<B: RegisterBus + ?Sized>(
    session: &mut I2cSession<'_, B>,
    expander: I2cDevice,
    bank: u8,
    direction: u8,
    output: u8,
) -> Result<bool> {
    let bank = bank & 0x01;
    let address = expander.address();
    let out = session.write(address, EXPANDER_OUTPUT_PORT + bank, &[output], true)?;
    let dir = session.write(address, EXPANDER_CONFIG_PORT + bank, &[direction], true)?;
    Ok(out == 1 && dir == 1)
}

/// Expander output pattern enabling the line drivers of the DUTs in `mask`.
///
/// Each DUT owns two adjacent bits: trigger/clock driver and busy receiver.
pub fn dut_driver_pattern(mask: u8) -> u8 {
    (0..4)
        .filter(|dut| mask & (1 << dut) != 0)
        .fold(0u8, |acc, dut| acc | (0b11 << (2 * dut)))
}

// =============================================================================
// EEPROM (24AA025E48)
// =============================================================================

/// Start of the factory-programmed EUI-48.
pub const EEPROM_EUI_ADDRESS: u8 = 0xFA;

/// Read the 6-byte board identifier.
pub fn read_board_id<B: RegisterBus + ?Sized>(session: &mut I2cSession<'_, B>) -> Result<[u8; 6]> {
    let bytes = session.read(I2cDevice::Eeprom.address(), EEPROM_EUI_ADDRESS, 6)?;
    let mut id = [0u8; 6];
    if bytes.len() != id.len() {
        warn!(len = bytes.len(), "Short EEPROM read");
        return Err(TluError::Timeout {
            operation: "eeprom board id".to_string(),
            completed: bytes.len(),
            requested: id.len(),
            partial: bytes,
        });
    }
    id.copy_from_slice(&bytes);
    Ok(id)
}

/// Format an EUI-48 the usual way.
pub fn format_board_id(id: &[u8; 6]) -> String {
    id.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MockI2cDevice, MockRegisterBus};
    use crate::i2c::{I2cConfig, I2cMaster};
    use tracing::Span;

    #[test]
    fn test_address_table_is_unique() {
        let addresses: std::collections::BTreeSet<u8> =
            I2cDevice::ALL.iter().map(|d| d.address()).collect();
        assert_eq!(addresses.len(), I2cDevice::ALL.len());
        assert_eq!(I2cDevice::Dac1.address(), 0x13);
        assert_eq!(I2cDevice::ClockChip.address(), 0x68);
    }

    #[test]
    fn test_threshold_to_code_endpoints() {
        assert_eq!(threshold_to_code(-1.3).unwrap(), 0);
        assert_eq!(threshold_to_code(1.3).unwrap(), u16::MAX);
        assert_eq!(threshold_to_code(0.0).unwrap(), 32768);
        assert!(threshold_to_code(1.5).is_err());
        assert!(threshold_to_code(f64::NAN).is_err());
    }

    #[test]
    fn test_dut_driver_pattern() {
        assert_eq!(dut_driver_pattern(0b0000), 0x00);
        assert_eq!(dut_driver_pattern(0b0001), 0x03);
        assert_eq!(dut_driver_pattern(0b1010), 0xCC);
        assert_eq!(dut_driver_pattern(0b1111), 0xFF);
    }

    #[test]
    fn test_set_dac_code_writes_big_endian() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        tlu.attach_i2c_device(0x1F, MockI2cDevice::new());
        let master = I2cMaster::new(I2cConfig::default(), &Span::none());
        let mut session = master.session(&mut bus);
        assert!(set_dac_code(&mut session, I2cDevice::Dac2, 2, 0xABCD).unwrap());
        drop(session);
        assert_eq!(tlu.i2c_memory(0x1F, DAC_CMD_WRITE_UPDATE | 2), Some(0xAB));
        assert_eq!(tlu.i2c_memory(0x1F, (DAC_CMD_WRITE_UPDATE | 2) + 1), Some(0xCD));
    }

    #[test]
    fn test_read_board_id() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        let mut eeprom = MockI2cDevice::new();
        eeprom.preload(EEPROM_EUI_ADDRESS, &[0xD8, 0x80, 0x39, 0x12, 0x34, 0x56]);
        tlu.attach_i2c_device(0x50, eeprom);
        let master = I2cMaster::new(I2cConfig::default(), &Span::none());
        let id = read_board_id(&mut master.session(&mut bus)).unwrap();
        assert_eq!(format_board_id(&id), "d8:80:39:12:34:56");
    }
}
