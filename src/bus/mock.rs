//! Simulated TLU behind a [`RegisterBus`].
//!
//! [`MockRegisterBus`] models enough of the firmware to exercise the whole
//! readout path without hardware:
//!
//! - a register file with the side effects of the reset, veto and run-control
//!   registers
//! - the event FIFO, pre/post-veto counters and a 48-bit timestamp read
//!   through two latched registers
//! - the OpenCores I2C master with attachable slave devices and a log of
//!   start/stop conditions
//! - fault injection (transport failures, protocol faults, arbitration loss,
//!   stuck transfers)
//! - an optional trigger generator that fills the FIFO while a run is active
//!
//! Tests keep a [`MockTlu`] handle to inject frames and inspect state while
//! the bus itself is owned by a [`SharedBus`](super::SharedBus).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ReadBack, ReadToken, RegisterBus};
use crate::error::{Result, TluError};
use crate::event::EVENT_WORDS;
use crate::i2c::engine::{
    CMD_READ, CMD_START, CMD_STOP, CMD_WRITE, CTRL_ENABLE, I2C_CMDSTATUS, I2C_CTRL, I2C_RXTX,
    STATUS_ARBITRATION_LOST, STATUS_BUSY, STATUS_RX_NACK, STATUS_TIP,
};
use crate::tlu::regs;

/// Firmware version reported by the simulator.
pub const MOCK_FIRMWARE_VERSION: u32 = 0x1e00_0010;

/// Kind of injected bus failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFault {
    /// Transport failure, surfaces as [`TluError::Bus`]
    Transport,
    /// Protocol fault, surfaces as [`TluError::Protocol`]
    Protocol,
}

/// Bus conditions observed by the simulated I2C master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cBusEvent {
    /// Start condition with address byte
    Start {
        /// 7-bit address
        address: u8,
        /// Read bit
        read: bool,
    },
    /// Repeated start inside an open transaction
    RepeatedStart {
        /// 7-bit address
        address: u8,
        /// Read bit
        read: bool,
    },
    /// Stop condition
    Stop,
}

/// Simulated I2C slave: 256 bytes of memory behind an auto-incrementing
/// pointer that is set by the first byte written after addressing.
#[derive(Debug, Clone)]
pub struct MockI2cDevice {
    memory: Vec<u8>,
    pointer: u8,
    ack_limit: Option<usize>,
}

impl MockI2cDevice {
    /// Device with zeroed memory that acknowledges everything.
    pub fn new() -> Self {
        Self {
            memory: vec![0; 256],
            pointer: 0,
            ack_limit: None,
        }
    }

    /// Acknowledge only the first `n` bytes written in each transaction
    /// (the memory pointer byte included).
    pub fn nack_after(mut self, n: usize) -> Self {
        self.ack_limit = Some(n);
        self
    }

    /// Fill memory starting at `at`.
    pub fn preload(&mut self, at: u8, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory[(at as usize + i) % 256] = *b;
        }
    }
}

impl Default for MockI2cDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct I2cState {
    enabled: bool,
    tx: u8,
    rx: u8,
    status: u32,
    in_transaction: bool,
    addressed: Option<(u8, bool)>,
    expect_pointer: bool,
    bytes_in_txn: usize,
    devices: HashMap<u8, MockI2cDevice>,
    log: Vec<I2cBusEvent>,
    arbitration_loss: HashSet<u8>,
    stuck: bool,
    status_reads: usize,
}

impl I2cState {
    fn ack(&mut self, acked: bool) {
        if acked {
            self.status &= !STATUS_RX_NACK;
        } else {
            self.status |= STATUS_RX_NACK;
        }
    }

    fn command(&mut self, cmd: u32) {
        if !self.enabled {
            self.ack(false);
            return;
        }
        if cmd & CMD_START != 0 {
            self.status &= !STATUS_ARBITRATION_LOST;
            let address = self.tx >> 1;
            let read = self.tx & 1 == 1;
            if self.in_transaction {
                self.log.push(I2cBusEvent::RepeatedStart { address, read });
            } else {
                self.log.push(I2cBusEvent::Start { address, read });
                self.in_transaction = true;
            }
            self.bytes_in_txn = 0;
            if self.arbitration_loss.contains(&address) {
                self.status |= STATUS_ARBITRATION_LOST;
                self.addressed = None;
            } else if self.devices.contains_key(&address) {
                self.ack(true);
                self.addressed = Some((address, read));
                self.expect_pointer = !read;
            } else {
                self.ack(false);
                self.addressed = None;
            }
        } else if cmd & CMD_WRITE != 0 {
            let acked = match self.addressed {
                Some((address, false)) => {
                    let tx = self.tx;
                    let count = self.bytes_in_txn;
                    let expect_pointer = self.expect_pointer;
                    match self.devices.get_mut(&address) {
                        Some(dev) if dev.ack_limit.map_or(true, |n| count < n) => {
                            if expect_pointer {
                                dev.pointer = tx;
                            } else {
                                dev.memory[dev.pointer as usize] = tx;
                                dev.pointer = dev.pointer.wrapping_add(1);
                            }
                            true
                        }
                        _ => false,
                    }
                }
                _ => false,
            };
            if acked {
                self.expect_pointer = false;
                self.bytes_in_txn += 1;
            }
            self.ack(acked);
        } else if cmd & CMD_READ != 0 {
            let byte = match self.addressed {
                Some((address, true)) => self.devices.get_mut(&address).map(|dev| {
                    let b = dev.memory[dev.pointer as usize];
                    dev.pointer = dev.pointer.wrapping_add(1);
                    b
                }),
                _ => None,
            };
            self.rx = byte.unwrap_or(0xFF);
            self.ack(byte.is_some());
        }
        if cmd & CMD_STOP != 0 {
            if self.in_transaction {
                self.log.push(I2cBusEvent::Stop);
                self.in_transaction = false;
            }
            self.addressed = None;
        }
    }

    fn read_status(&mut self) -> u32 {
        self.status_reads += 1;
        let mut status = self.status & !(STATUS_BUSY | STATUS_TIP);
        if self.in_transaction {
            status |= STATUS_BUSY;
        }
        if self.stuck {
            status |= STATUS_TIP;
        }
        status
    }
}

#[derive(Debug)]
struct MockState {
    registers: HashMap<String, u32>,
    write_log: Vec<(String, u32)>,
    fifo: VecDeque<u32>,
    pre_veto: u32,
    post_veto: u32,
    timestamp: u64,
    timestamp_step: u64,
    latched_high: u32,
    next_event: u32,
    generator: Option<u32>,
    stuck_fill_level: Option<u32>,
    faults: HashMap<String, (BusFault, bool)>,
    dispatches: usize,
    i2c: I2cState,
}

impl MockState {
    fn new() -> Self {
        let mut registers = HashMap::new();
        registers.insert(regs::FIRMWARE_VERSION.to_string(), MOCK_FIRMWARE_VERSION);
        Self {
            registers,
            write_log: Vec::new(),
            fifo: VecDeque::new(),
            pre_veto: 0,
            post_veto: 0,
            timestamp: 0,
            timestamp_step: 0,
            latched_high: 0,
            next_event: 0,
            generator: None,
            stuck_fill_level: None,
            faults: HashMap::new(),
            dispatches: 0,
            i2c: I2cState::default(),
        }
    }

    fn check_fault(&mut self, name: &str) -> Result<()> {
        let Some((fault, once)) = self.faults.get(name).copied() else {
            return Ok(());
        };
        if once {
            self.faults.remove(name);
        }
        Err(match fault {
            BusFault::Transport => TluError::Bus(format!("transport failure on '{name}'")),
            BusFault::Protocol => TluError::protocol(name, "injected bus fault"),
        })
    }

    fn reg(&self, name: &str) -> u32 {
        self.registers.get(name).copied().unwrap_or(0)
    }

    fn push_frame(&mut self, frame: &[u32; EVENT_WORDS]) {
        self.fifo.extend(frame.iter().copied());
        self.pre_veto = self.pre_veto.wrapping_add(1);
        self.post_veto = self.post_veto.wrapping_add(1);
    }

    fn run_generator(&mut self) {
        let Some(per_poll) = self.generator else {
            return;
        };
        if self.reg(regs::RUN_ACTIVE) == 0 || self.reg(regs::TRIGGER_VETO) != 0 {
            return;
        }
        for _ in 0..per_poll {
            self.next_event = self.next_event.wrapping_add(1);
            self.timestamp += 1000;
            let frame = synth_frame(0x3, 0x001, self.timestamp, self.next_event, [1; 6]);
            self.push_frame(&frame);
        }
    }

    fn write(&mut self, name: &str, value: u32) {
        self.write_log.push((name.to_string(), value));
        self.registers.insert(name.to_string(), value);
        match name {
            regs::RESET_COUNTERS if value != 0 => {
                self.pre_veto = 0;
                self.post_veto = 0;
            }
            regs::RESET_TIMESTAMP if value != 0 => {
                self.timestamp = 0;
                self.next_event = 0;
            }
            regs::EVENT_FIFO_CSR if value & regs::FIFO_RESET != 0 => self.fifo.clear(),
            I2C_CTRL => self.i2c.enabled = value & CTRL_ENABLE != 0,
            I2C_RXTX => self.i2c.tx = (value & 0xFF) as u8,
            I2C_CMDSTATUS => self.i2c.command(value),
            _ => {}
        }
    }

    fn read(&mut self, name: &str, words: usize) -> Vec<u32> {
        match name {
            regs::EVENT_FIFO_DATA => (0..words)
                .map(|_| self.fifo.pop_front().unwrap_or(0))
                .collect(),
            _ => (0..words).map(|_| self.read_word(name)).collect(),
        }
    }

    fn read_word(&mut self, name: &str) -> u32 {
        match name {
            regs::PRE_VETO_TRIGGERS => self.pre_veto,
            regs::POST_VETO_TRIGGERS => self.post_veto,
            regs::CURRENT_TIMESTAMP_LOW => {
                let ts = self.timestamp;
                self.timestamp += self.timestamp_step;
                self.latched_high = ((ts >> 32) & 0xFFFF) as u32;
                ts as u32
            }
            regs::CURRENT_TIMESTAMP_HIGH => self.latched_high,
            regs::EVENT_FIFO_FILL_LEVEL => {
                if let Some(level) = self.stuck_fill_level {
                    return level;
                }
                self.run_generator();
                self.fifo.len() as u32
            }
            I2C_CMDSTATUS => self.i2c.read_status(),
            I2C_RXTX => u32::from(self.i2c.rx),
            _ => self.reg(name),
        }
    }
}

enum Op {
    Write { name: String, value: u32 },
    Read { name: String, words: usize },
}

/// In-memory [`RegisterBus`] simulating a TLU.
pub struct MockRegisterBus {
    state: Arc<Mutex<MockState>>,
    queue: Vec<Op>,
    reads_queued: usize,
}

impl MockRegisterBus {
    /// Fresh simulator with empty FIFO and no I2C devices.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new())),
            queue: Vec::new(),
            reads_queued: 0,
        }
    }

    /// Handle for injecting data and inspecting state.
    pub fn handle(&self) -> MockTlu {
        MockTlu {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for MockRegisterBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBus for MockRegisterBus {
    fn queue_write(&mut self, name: &str, value: u32) {
        self.queue.push(Op::Write {
            name: name.to_string(),
            value,
        });
    }

    fn queue_read(&mut self, name: &str, words: usize) -> ReadToken {
        self.queue.push(Op::Read {
            name: name.to_string(),
            words,
        });
        let token = ReadToken::new(self.reads_queued);
        self.reads_queued += 1;
        token
    }

    fn dispatch(&mut self) -> Result<ReadBack> {
        let ops = std::mem::take(&mut self.queue);
        self.reads_queued = 0;
        let mut state = self.state.lock();
        state.dispatches += 1;
        let mut blocks = Vec::new();
        for op in ops {
            match op {
                Op::Write { name, value } => {
                    state.check_fault(&name)?;
                    state.write(&name, value);
                }
                Op::Read { name, words } => {
                    state.check_fault(&name)?;
                    blocks.push(state.read(&name, words));
                }
            }
        }
        Ok(ReadBack::new(blocks))
    }
}

/// Test-side handle onto a [`MockRegisterBus`].
#[derive(Clone)]
pub struct MockTlu {
    state: Arc<Mutex<MockState>>,
}

impl MockTlu {
    /// Last value written to `name`, if any.
    pub fn register(&self, name: &str) -> Option<u32> {
        self.state.lock().registers.get(name).copied()
    }

    /// All register writes in order, I2C master traffic excluded.
    pub fn write_log(&self) -> Vec<(String, u32)> {
        self.state
            .lock()
            .write_log
            .iter()
            .filter(|(n, _)| !n.starts_with("i2c_master."))
            .cloned()
            .collect()
    }

    /// Number of dispatches executed.
    pub fn dispatch_count(&self) -> usize {
        self.state.lock().dispatches
    }

    /// Append well-formed frames to the FIFO, counting each as one accepted
    /// trigger.
    pub fn inject_frames(&self, frames: &[[u32; EVENT_WORDS]]) {
        let mut state = self.state.lock();
        for frame in frames {
            state.push_frame(frame);
        }
    }

    /// Append raw words to the FIFO without touching the counters.
    pub fn inject_words(&self, words: &[u32]) {
        self.state.lock().fifo.extend(words.iter().copied());
    }

    /// Words currently waiting in the FIFO.
    pub fn fifo_len(&self) -> usize {
        self.state.lock().fifo.len()
    }

    /// Overwrite the pre/post-veto counters.
    pub fn set_counters(&self, pre_veto: u32, post_veto: u32) {
        let mut state = self.state.lock();
        state.pre_veto = pre_veto;
        state.post_veto = post_veto;
    }

    /// Current `(pre_veto, post_veto)` counters.
    pub fn counters(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.pre_veto, state.post_veto)
    }

    /// Set the 48-bit timestamp counter.
    pub fn set_timestamp(&self, ticks: u64) {
        self.state.lock().timestamp = ticks & 0xFFFF_FFFF_FFFF;
    }

    /// Advance the timestamp by `ticks` on every low-word read.
    pub fn set_timestamp_step(&self, ticks: u64) {
        self.state.lock().timestamp_step = ticks;
    }

    /// Generate `frames_per_poll` frames on each fill-level read while the
    /// run is active and the veto released.
    pub fn enable_trigger_generator(&self, frames_per_poll: u32) {
        self.state.lock().generator = Some(frames_per_poll);
    }

    /// Report `level` from the fill-level register regardless of the FIFO
    /// contents; `None` restores normal behaviour.
    pub fn set_stuck_fill_level(&self, level: Option<u32>) {
        self.state.lock().stuck_fill_level = level;
    }

    /// Fail every access to `name`.
    pub fn fail_always(&self, name: &str, fault: BusFault) {
        self.state
            .lock()
            .faults
            .insert(name.to_string(), (fault, false));
    }

    /// Fail the next access to `name` only.
    pub fn fail_next(&self, name: &str, fault: BusFault) {
        self.state
            .lock()
            .faults
            .insert(name.to_string(), (fault, true));
    }

    /// Attach a slave at `address`.
    pub fn attach_i2c_device(&self, address: u8, device: MockI2cDevice) {
        self.state.lock().i2c.devices.insert(address & 0x7F, device);
    }

    /// Byte at `offset` of the slave at `address`.
    pub fn i2c_memory(&self, address: u8, offset: u8) -> Option<u8> {
        self.state
            .lock()
            .i2c
            .devices
            .get(&address)
            .map(|dev| dev.memory[offset as usize])
    }

    /// Lose arbitration whenever `address` is addressed.
    pub fn lose_arbitration_on(&self, address: u8) {
        self.state.lock().i2c.arbitration_loss.insert(address);
    }

    /// Keep the transfer-in-progress bit permanently set.
    pub fn set_stuck_transfer(&self, stuck: bool) {
        self.state.lock().i2c.stuck = stuck;
    }

    /// Number of I2C status register reads.
    pub fn status_reads(&self) -> usize {
        self.state.lock().i2c.status_reads
    }

    /// Start/stop conditions seen on the I2C bus.
    pub fn i2c_log(&self) -> Vec<I2cBusEvent> {
        self.state.lock().i2c.log.clone()
    }

    /// Whether every transaction in the log is closed before the next one
    /// starts, and repeated starts stay on the device that opened the
    /// transaction.
    pub fn i2c_log_well_nested(&self) -> bool {
        let mut open: Option<u8> = None;
        for event in self.state.lock().i2c.log.iter() {
            match (*event, open) {
                (I2cBusEvent::Start { address, .. }, None) => open = Some(address),
                (I2cBusEvent::RepeatedStart { address, .. }, Some(current))
                    if address == current => {}
                (I2cBusEvent::Stop, Some(_)) => open = None,
                _ => return false,
            }
        }
        open.is_none()
    }
}

/// Build one event frame in the FIFO layout.
pub fn synth_frame(
    event_type: u8,
    fired: u16,
    timestamp: u64,
    event_number: u32,
    scalers: [u8; 6],
) -> [u32; EVENT_WORDS] {
    let w0 = (u32::from(event_type & 0xF) << 28)
        | (u32::from(fired & 0xFFF) << 16)
        | ((timestamp >> 32) & 0xFFFF) as u32;
    let w1 = timestamp as u32;
    let w2 = u32::from_be_bytes([scalers[0], scalers[1], scalers[2], scalers[3]]);
    let w4 = u32::from_be_bytes([scalers[4], scalers[5], 0, 0]);
    [w0, w1, w2, event_number, w4, 0]
}
