//! Register-level control of the TLU board.
//!
//! [`Tlu`] wraps the shared register bus and the I2C master. Each method
//! takes the bus lock once, so a multi-register read such as the 48-bit
//! timestamp or a counter snapshot is never split by another task.

pub mod regs;

use std::collections::BTreeSet;

use tracing::{debug, info, info_span, warn, Span};

use crate::bus::{RegisterAccess, RegisterBus, SharedBus};
use crate::config::CompiledConfig;
use crate::error::{Result, TluError};
use crate::i2c::devices::{self, I2cDevice, THRESHOLD_DAC_MAP};
use crate::i2c::{I2cConfig, I2cMaster};
use crate::trigger::unpack_pulse_vector;

/// Pre- and post-veto trigger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Triggers seen by the trigger logic
    pub pre_veto: u32,
    /// Triggers accepted while not vetoed
    pub post_veto: u32,
}

/// Counters and timestamp read in one bus transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Trigger counters
    pub counters: Counters,
    /// 48-bit timestamp in 40 MHz ticks
    pub timestamp: u64,
}

/// One FIFO drain: the fill level that was reported and the words read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FifoRead {
    /// Fill level as reported by the firmware
    pub fill_level: u32,
    /// Words read from the FIFO data port
    pub words: Vec<u32>,
}

/// What [`Tlu::init_hardware`] found on the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    /// Firmware version register
    pub firmware_version: u32,
    /// Whether the I2C enable switch confirmed
    pub i2c_enabled: bool,
    /// Addresses that acknowledged during the scan
    pub i2c_devices: BTreeSet<u8>,
    /// EUI-48 from the EEPROM, if readable
    pub board_id: Option<String>,
}

/// TLU board controller.
#[derive(Debug, Clone)]
pub struct Tlu {
    bus: SharedBus,
    i2c: I2cMaster,
    span: Span,
}

fn read_snapshot(bus: &mut dyn RegisterBus) -> Result<Snapshot> {
    let pre = bus.queue_read(regs::PRE_VETO_TRIGGERS, 1);
    let post = bus.queue_read(regs::POST_VETO_TRIGGERS, 1);
    // The low word latches the high word; order matters.
    let ts_low = bus.queue_read(regs::CURRENT_TIMESTAMP_LOW, 1);
    let ts_high = bus.queue_read(regs::CURRENT_TIMESTAMP_HIGH, 1);
    let readback = bus.dispatch()?;
    Ok(Snapshot {
        counters: Counters {
            pre_veto: readback.word(pre)?,
            post_veto: readback.word(post)?,
        },
        timestamp: combine_timestamp(readback.word(ts_high)?, readback.word(ts_low)?),
    })
}

fn combine_timestamp(high: u32, low: u32) -> u64 {
    (u64::from(high & 0xFFFF) << 32) | u64::from(low)
}

impl Tlu {
    /// Controller on `bus`, logging under `parent`.
    pub fn new(bus: SharedBus, i2c: I2cConfig, parent: &Span) -> Self {
        let span = info_span!(parent: parent, "tlu");
        let i2c = I2cMaster::new(i2c, &span);
        Self { bus, i2c, span }
    }

    /// The shared bus.
    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    /// Span the controller logs under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Bring up the I2C master, scan the sub-bus and read the board
    /// identifier. Missing peripherals are reported, not treated as errors.
    pub fn init_hardware(&self) -> Result<HardwareInfo> {
        let _enter = self.span.enter();
        let mut guard = self.bus.lock();
        let firmware_version = guard.read_register(regs::FIRMWARE_VERSION)?;
        info!(firmware = %format_args!("{:#010x}", firmware_version), "TLU firmware");

        let mut session = self.i2c.session(&mut **guard);
        let i2c_enabled = session.init()?;
        let i2c_devices = session.scan()?;

        for device in I2cDevice::ALL {
            if !i2c_devices.contains(&device.address()) {
                warn!(
                    device = device.name(),
                    address = %format_args!("{:#04x}", device.address()),
                    "Expected I2C device did not respond"
                );
            }
        }

        let board_id = match devices::read_board_id(&mut session) {
            Ok(id) => {
                let id = devices::format_board_id(&id);
                info!(board_id = %id, "Board identifier");
                Some(id)
            }
            Err(e @ TluError::Timeout { .. }) => {
                warn!(error = %e, "Board identifier unavailable");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(HardwareInfo {
            firmware_version,
            i2c_enabled,
            i2c_devices,
            board_id,
        })
    }

    /// Apply a compiled configuration. Must not be called while a run is
    /// active.
    pub fn configure(&self, config: &CompiledConfig) -> Result<()> {
        let _enter = self.span.enter();
        let mut guard = self.bus.lock();
        guard.write_registers(&[
            (regs::TRIGGER_PATTERN_LOW, config.trigger_mask.low),
            (regs::TRIGGER_PATTERN_HIGH, config.trigger_mask.high),
            (regs::PULSE_STRETCH, config.pulse_stretch),
            (regs::PULSE_DELAY, config.pulse_delay),
            (regs::INTERNAL_TRIGGER_INTERVAL, config.internal_trigger_interval),
            (regs::DUT_MASK, config.dut_mask),
            (regs::DUT_INTERFACE_MODE, config.dut_interface_mode),
            (regs::DUT_INTERFACE_MODE_MODIFIER, config.dut_mode_modifier),
            (regs::IGNORE_DUT_BUSY, config.ignore_dut_busy),
        ])?;
        info!(
            rule = %config.rule,
            mask_low = %format_args!("{:#010x}", config.trigger_mask.low),
            mask_high = %format_args!("{:#010x}", config.trigger_mask.high),
            internal_interval = config.internal_trigger_interval,
            "Trigger logic configured"
        );

        let stretch = guard.read_register(regs::PULSE_STRETCH)?;
        if stretch != config.pulse_stretch {
            warn!(
                register = regs::PULSE_STRETCH,
                expected = ?unpack_pulse_vector(config.pulse_stretch),
                actual = ?unpack_pulse_vector(stretch),
                "Pulse stretch read-back mismatch"
            );
        }

        if !config.program_i2c {
            debug!("Skipping I2C peripherals");
            return Ok(());
        }

        let mut session = self.i2c.session(&mut **guard);
        for dac in [I2cDevice::Dac1, I2cDevice::Dac2] {
            if !devices::enable_internal_reference(&mut session, dac)? {
                warn!(device = dac.name(), "DAC did not acknowledge reference setup");
            }
        }
        for (input, ((dac, channel), code)) in THRESHOLD_DAC_MAP
            .iter()
            .zip(config.threshold_codes)
            .enumerate()
        {
            if !devices::set_dac_code(&mut session, *dac, *channel, code)? {
                warn!(input = input + 1, device = dac.name(), "Threshold write not acknowledged");
            }
        }

        // Bank 0 drives the DUT line drivers, all pins outputs.
        let pattern = devices::dut_driver_pattern(config.dut_mask as u8);
        if !devices::configure_expander(&mut session, I2cDevice::IoExpander1, 0, 0x00, pattern)? {
            warn!(device = I2cDevice::IoExpander1.name(), "DUT driver setup not acknowledged");
        }
        debug!(pattern = %format_args!("{:#04x}", pattern), "DUT drivers enabled");
        Ok(())
    }

    /// Flush the event FIFO.
    pub fn reset_fifo(&self) -> Result<()> {
        self.bus
            .lock()
            .write_register(regs::EVENT_FIFO_CSR, regs::FIFO_RESET)
    }

    /// Zero the pre/post-veto counters.
    pub fn reset_counters(&self) -> Result<()> {
        self.bus.lock().write_register(regs::RESET_COUNTERS, 1)
    }

    /// Zero the timestamp counter.
    pub fn reset_timestamp(&self) -> Result<()> {
        self.bus.lock().write_register(regs::RESET_TIMESTAMP, 1)
    }

    /// Assert or release the trigger veto.
    pub fn set_trigger_veto(&self, veto: bool) -> Result<()> {
        self.bus
            .lock()
            .write_register(regs::TRIGGER_VETO, u32::from(veto))
    }

    /// Set the run-active (shutter) flag.
    pub fn set_run_active(&self, active: bool) -> Result<()> {
        self.bus
            .lock()
            .write_register(regs::RUN_ACTIVE, u32::from(active))
    }

    /// Read the 48-bit timestamp.
    pub fn timestamp(&self) -> Result<u64> {
        let mut guard = self.bus.lock();
        let low = guard.queue_read(regs::CURRENT_TIMESTAMP_LOW, 1);
        let high = guard.queue_read(regs::CURRENT_TIMESTAMP_HIGH, 1);
        let readback = guard.dispatch()?;
        Ok(combine_timestamp(readback.word(high)?, readback.word(low)?))
    }

    /// Counters and timestamp under one lock.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut guard = self.bus.lock();
        read_snapshot(&mut **guard)
    }

    /// Read the fill level and then that many words, under one lock.
    pub fn drain_fifo(&self) -> Result<FifoRead> {
        let mut guard = self.bus.lock();
        let fill_level = guard.read_register(regs::EVENT_FIFO_FILL_LEVEL)?;
        let words = guard.read_block(regs::EVENT_FIFO_DATA, fill_level as usize)?;
        Ok(FifoRead { fill_level, words })
    }
}
