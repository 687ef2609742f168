//! I2C transaction engine.
//!
//! Drives the firmware's OpenCores-style I2C master through five registers of
//! the register bus. A transfer is a sequence of command writes to
//! `i2c_cmdstatus`, each followed by a bounded poll of the same register until
//! the transfer-in-progress bit clears:
//!
//! ```text
//! write: STA|WR(addr<<1)  WR(mem)  WR(b0) .. WR(bn)  [STO]
//! read:  STA|WR(addr<<1)  WR(mem)  STA|WR(addr<<1|1)  RD .. RD|NACK|STO
//! ```
//!
//! An [`I2cSession`] mutably borrows the bus, so holding the
//! [`SharedBus`](crate::bus::SharedBus) guard for the lifetime of the session
//! is what keeps transactions from interleaving.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn, Span};

use crate::bus::{RegisterAccess, RegisterBus};
use crate::error::{Result, TluError};
use crate::i2c::devices::{I2cDevice, ENABLE_SWITCH_DIRECTION, ENABLE_SWITCH_REGISTER};

/// Prescale register, low byte.
pub const I2C_PRE_LO: &str = "i2c_master.i2c_pre_lo";
/// Prescale register, high byte.
pub const I2C_PRE_HI: &str = "i2c_master.i2c_pre_hi";
/// Control register.
pub const I2C_CTRL: &str = "i2c_master.i2c_ctrl";
/// Transmit/receive data register.
pub const I2C_RXTX: &str = "i2c_master.i2c_rxtx";
/// Command register on write, status register on read.
pub const I2C_CMDSTATUS: &str = "i2c_master.i2c_cmdstatus";

/// Control register: core enable.
pub const CTRL_ENABLE: u32 = 0x80;

/// Command: generate (repeated) start condition.
pub const CMD_START: u32 = 0x80;
/// Command: generate stop condition.
pub const CMD_STOP: u32 = 0x40;
/// Command: read a byte from the slave.
pub const CMD_READ: u32 = 0x20;
/// Command: write the rxtx byte to the slave.
pub const CMD_WRITE: u32 = 0x10;
/// Command: answer the next read with NACK.
pub const CMD_NACK: u32 = 0x08;

/// Status: no acknowledge received from the slave.
pub const STATUS_RX_NACK: u32 = 0x80;
/// Status: bus busy (start seen, stop pending).
pub const STATUS_BUSY: u32 = 0x40;
/// Status: arbitration lost.
pub const STATUS_ARBITRATION_LOST: u32 = 0x20;
/// Status: transfer in progress.
pub const STATUS_TIP: u32 = 0x02;

/// I2C master settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct I2cConfig {
    /// SCL prescale value (`f_bus / (5 * f_scl) - 1`)
    #[serde(default = "default_prescale")]
    pub prescale: u16,

    /// Maximum status polls per byte before the transfer is abandoned
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

fn default_prescale() -> u16 {
    // 50 MHz IPbus clock, 100 kHz SCL
    0x30
}

fn default_retry_limit() -> u32 {
    100
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            prescale: default_prescale(),
            retry_limit: default_retry_limit(),
        }
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cDirection {
    /// Master to slave
    Write,
    /// Slave to master
    Read,
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cOutcome {
    /// All bytes acknowledged
    Complete,
    /// Device stopped acknowledging after this many payload bytes
    NoAck(usize),
    /// Status polling exceeded the retry bound
    TimedOut,
    /// Another master won the bus
    ArbitrationLost,
}

/// Record of one I2C transaction, emitted at `trace` level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cTransaction {
    /// 7-bit device address
    pub address: u8,
    /// Transfer direction
    pub direction: I2cDirection,
    /// Bytes written, or bytes read back
    pub payload: Vec<u8>,
    /// Whether a stop condition closed the transaction
    pub stop: bool,
    /// Result of the transfer
    pub outcome: I2cOutcome,
}

/// Configured I2C master. Cheap to share; all bus access goes through
/// [`I2cMaster::session`].
#[derive(Debug, Clone)]
pub struct I2cMaster {
    config: I2cConfig,
    span: Span,
}

impl I2cMaster {
    /// Create a master whose log events are recorded under `parent`.
    pub fn new(config: I2cConfig, parent: &Span) -> Self {
        let span = tracing::debug_span!(parent: parent, "i2c", prescale = config.prescale);
        Self { config, span }
    }

    /// Master settings.
    pub fn config(&self) -> &I2cConfig {
        &self.config
    }

    /// Open a session on an exclusively borrowed bus.
    pub fn session<'a, B: RegisterBus + ?Sized>(&'a self, bus: &'a mut B) -> I2cSession<'a, B> {
        I2cSession {
            master: self,
            bus,
            open: None,
        }
    }
}

/// Exclusive use of the I2C master for a sequence of transactions.
///
/// At most one transaction is open at a time. Dropping a session with a
/// transaction still open issues a best-effort stop.
pub struct I2cSession<'a, B: RegisterBus + ?Sized> {
    master: &'a I2cMaster,
    bus: &'a mut B,
    open: Option<u8>,
}

impl<'a, B: RegisterBus + ?Sized> I2cSession<'a, B> {
    /// Program the prescaler, enable the core and switch on the board's I2C
    /// enable line.
    ///
    /// Returns whether the enable bit could be confirmed. A missing enable bit
    /// is logged but not treated as an error, since devices not gated by the
    /// switch remain reachable.
    pub fn init(&mut self) -> Result<bool> {
        let _enter = self.master.span.enter();
        let prescale = self.master.config.prescale;
        self.bus.write_registers(&[
            (I2C_CTRL, 0),
            (I2C_PRE_LO, u32::from(prescale & 0xFF)),
            (I2C_PRE_HI, u32::from(prescale >> 8)),
            (I2C_CTRL, CTRL_ENABLE),
        ])?;
        debug!(prescale, "I2C core enabled");

        let switch = I2cDevice::EnableSwitch.address();
        let written = self.write(switch, ENABLE_SWITCH_REGISTER, &[ENABLE_SWITCH_DIRECTION], true)?;
        if written != 1 {
            warn!(
                address = %format_args!("{:#04x}", switch),
                "I2C enable switch did not acknowledge; continuing without it"
            );
            return Ok(false);
        }

        let readback = match self.read(switch, ENABLE_SWITCH_REGISTER, 1) {
            Ok(bytes) => bytes.first().copied(),
            Err(TluError::Timeout { .. }) => None,
            Err(e) => return Err(e),
        };
        // Bit 7 is the enable line; it is an output once cleared in the
        // direction register.
        match readback {
            Some(value) if value & 0x80 == 0 => {
                info!(direction = %format_args!("{:#04x}", value), "I2C bus enable switch set");
                Ok(true)
            }
            other => {
                warn!(
                    register = I2C_RXTX,
                    expected = %format_args!("{:#04x}", ENABLE_SWITCH_DIRECTION),
                    actual = ?other,
                    "I2C enable bit not confirmed; bus may still work for ungated devices"
                );
                Ok(false)
            }
        }
    }

    /// Probe all 128 addresses and return those that acknowledge.
    ///
    /// Diagnostic only: arbitration loss or a stuck transfer on one address is
    /// logged and the scan moves on.
    pub fn scan(&mut self) -> Result<BTreeSet<u8>> {
        let _enter = self.master.span.enter();
        let mut found = BTreeSet::new();
        for address in 0u8..128 {
            match self.start(address, I2cDirection::Write) {
                Ok(true) => {
                    found.insert(address);
                }
                Ok(false) => {}
                Err(e @ TluError::Bus(_)) => return Err(e),
                Err(e) if e.is_fatal_to_run() => {
                    let address = format!("{:#04x}", address);
                    warn!(%address, error = %e, "Scan: arbitration lost");
                    continue;
                }
                Err(e) => {
                    let address = format!("{:#04x}", address);
                    debug!(%address, error = %e, "Scan: no response");
                }
            }
            self.stop()?;
        }
        let devices: Vec<String> = found.iter().map(|a| format!("{:#04x}", a)).collect();
        info!(?devices, "I2C scan complete");
        Ok(found)
    }

    /// Write `data` to `device` starting at memory address `mem`.
    ///
    /// Returns the number of payload bytes the device acknowledged; fewer than
    /// `data.len()` means the device stopped responding and the transaction
    /// was closed with a stop. With `stop == false` a fully acknowledged
    /// transaction is left open for a following repeated start.
    pub fn write(&mut self, device: u8, mem: u8, data: &[u8], stop: bool) -> Result<usize> {
        let _enter = self.master.span.enter();
        let mut txn = I2cTransaction {
            address: device,
            direction: I2cDirection::Write,
            payload: data.to_vec(),
            stop,
            outcome: I2cOutcome::Complete,
        };
        let result = self.write_inner(device, mem, data, stop);
        txn.outcome = match &result {
            Ok(outcome) => *outcome,
            Err(e) => error_outcome(e),
        };
        trace!(transaction = ?txn, "i2c write");
        match result {
            Ok(I2cOutcome::NoAck(written)) => Ok(written),
            Ok(_) => Ok(data.len()),
            Err(e) => Err(with_operation(e, "write", device, data.len())),
        }
    }

    fn write_inner(
        &mut self,
        device: u8,
        mem: u8,
        data: &[u8],
        stop: bool,
    ) -> Result<I2cOutcome> {
        if !self.start(device, I2cDirection::Write)? {
            self.stop()?;
            return Ok(I2cOutcome::NoAck(0));
        }
        if !self.write_byte(mem, data.is_empty() && stop)? {
            self.stop()?;
            return Ok(I2cOutcome::NoAck(0));
        }
        let mut written = 0;
        for (i, byte) in data.iter().enumerate() {
            let last = i + 1 == data.len();
            if !self.write_byte(*byte, last && stop).map_err(|e| partial(e, written))? {
                self.stop()?;
                return Ok(I2cOutcome::NoAck(written));
            }
            written += 1;
        }
        if stop {
            self.open = None;
        }
        Ok(I2cOutcome::Complete)
    }

    /// Read `n` bytes from `device` starting at memory address `mem`.
    ///
    /// A device that does not acknowledge yields [`TluError::Timeout`] with
    /// whatever was read so far in `partial`.
    pub fn read(&mut self, device: u8, mem: u8, n: usize) -> Result<Vec<u8>> {
        let _enter = self.master.span.enter();
        let result = self.read_inner(device, mem, n);
        let txn = I2cTransaction {
            address: device,
            direction: I2cDirection::Read,
            payload: result.as_ref().map(Clone::clone).unwrap_or_default(),
            stop: true,
            outcome: match &result {
                Ok(_) => I2cOutcome::Complete,
                Err(e) => error_outcome(e),
            },
        };
        trace!(transaction = ?txn, "i2c read");
        result.map_err(|e| with_operation(e, "read", device, n))
    }

    fn read_inner(&mut self, device: u8, mem: u8, n: usize) -> Result<Vec<u8>> {
        if !self.start(device, I2cDirection::Write)? || !self.write_byte(mem, false)? {
            self.stop()?;
            return Err(no_ack(device, 0, n, Vec::new()));
        }
        if !self.start(device, I2cDirection::Read)? {
            self.stop()?;
            return Err(no_ack(device, 0, n, Vec::new()));
        }
        let mut bytes = Vec::with_capacity(n);
        if n == 0 {
            self.stop()?;
            return Ok(bytes);
        }
        for i in 0..n {
            let last = i + 1 == n;
            let byte = self.read_byte(last).map_err(|e| match e {
                TluError::Timeout {
                    operation,
                    requested,
                    ..
                } => TluError::Timeout {
                    operation,
                    completed: bytes.len(),
                    requested,
                    partial: bytes.clone(),
                },
                other => other,
            })?;
            bytes.push(byte);
        }
        self.open = None;
        Ok(bytes)
    }

    /// Issue (repeated) start and the address byte. Returns whether the
    /// device acknowledged its address.
    fn start(&mut self, device: u8, direction: I2cDirection) -> Result<bool> {
        let rw = match direction {
            I2cDirection::Write => 0,
            I2cDirection::Read => 1,
        };
        self.bus
            .write_register(I2C_RXTX, (u32::from(device & 0x7F) << 1) | rw)?;
        self.open = Some(device);
        self.command(CMD_START | CMD_WRITE)?;
        let status = self.wait_transfer()?;
        Ok(status & STATUS_RX_NACK == 0)
    }

    /// Write one byte, optionally followed by stop. Returns ack.
    fn write_byte(&mut self, byte: u8, stop: bool) -> Result<bool> {
        self.bus.write_register(I2C_RXTX, u32::from(byte))?;
        let cmd = if stop { CMD_WRITE | CMD_STOP } else { CMD_WRITE };
        self.command(cmd)?;
        let status = self.wait_transfer()?;
        if stop {
            self.open = None;
        }
        Ok(status & STATUS_RX_NACK == 0)
    }

    /// Read one byte; the last byte of a read is NACKed and followed by stop.
    fn read_byte(&mut self, last: bool) -> Result<u8> {
        let cmd = if last {
            CMD_READ | CMD_NACK | CMD_STOP
        } else {
            CMD_READ
        };
        self.command(cmd)?;
        self.wait_transfer()?;
        if last {
            self.open = None;
        }
        Ok((self.bus.read_register(I2C_RXTX)? & 0xFF) as u8)
    }

    /// Close the open transaction, if any.
    fn stop(&mut self) -> Result<()> {
        if self.open.is_none() {
            return Ok(());
        }
        self.command(CMD_STOP)?;
        self.open = None;
        Ok(())
    }

    fn command(&mut self, cmd: u32) -> Result<()> {
        self.bus.write_register(I2C_CMDSTATUS, cmd)
    }

    /// Poll status until the current transfer completes.
    fn wait_transfer(&mut self) -> Result<u32> {
        let limit = self.master.config.retry_limit.max(1);
        for _ in 0..limit {
            let status = self.bus.read_register(I2C_CMDSTATUS)?;
            if status & STATUS_ARBITRATION_LOST != 0 {
                let device = self.open;
                // Leave the bus stopped; a failure here is secondary.
                if let Err(e) = self.stop() {
                    debug!(error = %e, "Stop after arbitration loss failed");
                }
                self.open = None;
                return Err(TluError::protocol(
                    I2C_CMDSTATUS,
                    format!(
                        "arbitration lost (status {:#04x}, device {:?})",
                        status, device
                    ),
                ));
            }
            if status & STATUS_TIP == 0 {
                return Ok(status);
            }
        }
        let device = self.open;
        if let Err(e) = self.stop() {
            debug!(error = %e, "Stop after poll timeout failed");
        }
        self.open = None;
        warn!(
            register = I2C_CMDSTATUS,
            retries = limit,
            device = ?device,
            "I2C transfer still in progress after retry bound"
        );
        Err(TluError::Timeout {
            operation: "i2c transfer".to_string(),
            completed: 0,
            requested: 0,
            partial: Vec::new(),
        })
    }
}

impl<'a, B: RegisterBus + ?Sized> Drop for I2cSession<'a, B> {
    fn drop(&mut self) {
        if self.open.is_some() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Failed to close I2C transaction on session drop");
            }
        }
    }
}

fn no_ack(device: u8, completed: usize, requested: usize, partial: Vec<u8>) -> TluError {
    TluError::Timeout {
        operation: format!("i2c read {:#04x}: no acknowledge", device),
        completed,
        requested,
        partial,
    }
}

fn partial(err: TluError, completed: usize) -> TluError {
    match err {
        TluError::Timeout {
            operation,
            requested,
            partial,
            ..
        } => TluError::Timeout {
            operation,
            completed,
            requested,
            partial,
        },
        other => other,
    }
}

/// Attach the operation name and request size to a timeout.
fn with_operation(err: TluError, op: &str, device: u8, requested: usize) -> TluError {
    match err {
        TluError::Timeout {
            operation,
            completed,
            partial,
            ..
        } => TluError::Timeout {
            operation: if operation.starts_with("i2c transfer") {
                format!("i2c {} {:#04x}", op, device)
            } else {
                operation
            },
            completed,
            requested,
            partial,
        },
        other => other,
    }
}

fn error_outcome(err: &TluError) -> I2cOutcome {
    match err {
        TluError::Protocol { .. } => I2cOutcome::ArbitrationLost,
        TluError::Timeout {
            operation,
            completed,
            ..
        } if operation.contains("no acknowledge") => I2cOutcome::NoAck(*completed),
        _ => I2cOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusFault, I2cBusEvent, MockI2cDevice, MockRegisterBus};
    use tracing_test::traced_test;

    fn master() -> I2cMaster {
        I2cMaster::new(I2cConfig::default(), &Span::none())
    }

    #[test]
    fn test_init_programs_prescale_and_enables_core() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        tlu.attach_i2c_device(0x21, MockI2cDevice::new());
        let master = master();
        let enabled = master.session(&mut bus).init().unwrap();
        assert!(enabled);
        assert_eq!(tlu.register(I2C_PRE_LO), Some(0x30));
        assert_eq!(tlu.register(I2C_PRE_HI), Some(0));
        assert_eq!(tlu.register(I2C_CTRL), Some(CTRL_ENABLE));
        assert_eq!(tlu.i2c_memory(0x21, ENABLE_SWITCH_REGISTER), Some(0x7F));
    }

    #[test]
    fn test_init_without_enable_switch_does_not_fail() {
        let mut bus = MockRegisterBus::new();
        let master = master();
        let enabled = master.session(&mut bus).init().unwrap();
        assert!(!enabled);
    }

    #[test]
    fn test_scan_reports_acknowledging_addresses() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        for addr in [0x13, 0x1F, 0x50, 0x68] {
            tlu.attach_i2c_device(addr, MockI2cDevice::new());
        }
        let master = master();
        let found = master.session(&mut bus).scan().unwrap();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![0x13, 0x1F, 0x50, 0x68]);
        assert!(tlu.i2c_log_well_nested());
    }

    #[test]
    fn test_scan_continues_past_arbitration_loss() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        for addr in [0x13, 0x50] {
            tlu.attach_i2c_device(addr, MockI2cDevice::new());
        }
        tlu.lose_arbitration_on(0x20);
        let master = master();
        let found = master.session(&mut bus).scan().unwrap();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![0x13, 0x50]);
        assert!(tlu.i2c_log_well_nested());
    }

    #[test]
    #[traced_test]
    fn test_empty_write_to_absent_device_is_recorded_as_nack() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        tlu.attach_i2c_device(0x50, MockI2cDevice::new());
        let master = I2cMaster::new(I2cConfig::default(), &Span::current());
        let mut session = master.session(&mut bus);
        assert_eq!(session.write(0x13, 0x00, &[], true).unwrap(), 0);
        assert!(logs_contain("outcome: NoAck(0)"));
        assert!(!logs_contain("outcome: Complete"));

        assert_eq!(session.write(0x50, 0x00, &[], true).unwrap(), 0);
        assert!(logs_contain("outcome: Complete"));
    }

    #[test]
    fn test_write_then_read_roundtrip_through_device_memory() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        tlu.attach_i2c_device(0x50, MockI2cDevice::new());
        let master = master();
        let mut session = master.session(&mut bus);
        assert_eq!(session.write(0x50, 0x10, &[0xDE, 0xAD, 0xBE], true).unwrap(), 3);
        assert_eq!(session.read(0x50, 0x11, 2).unwrap(), vec![0xAD, 0xBE]);
        drop(session);
        assert!(tlu.i2c_log_well_nested());
    }

    #[test]
    fn test_write_to_absent_device_returns_zero() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        let master = master();
        let written = master.session(&mut bus).write(0x13, 0x00, &[1, 2], true).unwrap();
        assert_eq!(written, 0);
        assert!(tlu.i2c_log_well_nested());
    }

    #[test]
    fn test_write_reports_partial_count_when_device_stops_acking() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        tlu.attach_i2c_device(0x74, MockI2cDevice::new().nack_after(2));
        let master = master();
        let written = master.session(&mut bus).write(0x74, 0x02, &[1, 2, 3], true).unwrap();
        assert!(written < 3);
        assert_eq!(written, 1);
        assert!(tlu.i2c_log_well_nested());
    }

    #[test]
    fn test_arbitration_loss_is_protocol_error_and_leaves_bus_stopped() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        tlu.attach_i2c_device(0x68, MockI2cDevice::new());
        tlu.lose_arbitration_on(0x68);
        let master = master();
        let err = master.session(&mut bus).write(0x68, 0x01, &[0x00], true).unwrap_err();
        assert!(err.is_fatal_to_run());
        assert_eq!(tlu.i2c_log().last(), Some(&I2cBusEvent::Stop));
        assert!(tlu.i2c_log_well_nested());
    }

    #[test]
    fn test_stuck_transfer_times_out_within_retry_bound() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        tlu.attach_i2c_device(0x13, MockI2cDevice::new());
        tlu.set_stuck_transfer(true);
        let config = I2cConfig {
            retry_limit: 5,
            ..I2cConfig::default()
        };
        let master = I2cMaster::new(config, &Span::none());
        let err = master.session(&mut bus).write(0x13, 0x00, &[1], true).unwrap_err();
        match err {
            TluError::Timeout {
                operation,
                completed,
                requested,
                ..
            } => {
                assert_eq!(operation, "i2c write 0x13");
                assert_eq!(completed, 0);
                assert_eq!(requested, 1);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(tlu.status_reads() <= 5 + 1);
    }

    #[test]
    fn test_read_from_absent_device_is_timeout() {
        let mut bus = MockRegisterBus::new();
        let master = master();
        let err = master.session(&mut bus).read(0x50, 0xFA, 6).unwrap_err();
        assert_eq!(err.completed_bytes(), Some(0));
    }

    #[test]
    fn test_bus_failure_propagates() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        tlu.fail_always(I2C_CMDSTATUS, BusFault::Transport);
        let master = master();
        let err = master.session(&mut bus).write(0x50, 0, &[1], true).unwrap_err();
        assert!(matches!(err, TluError::Bus(_)));
    }
}
