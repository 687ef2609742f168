//! Register bus abstraction.
//!
//! The TLU firmware exposes hierarchical, named 32-bit registers
//! (`triggerLogic.TriggerPattern_lowW`, `eventBuffer.EventFifoData`, ...).
//! Operations are queued on a [`RegisterBus`] and only reach the hardware on
//! an explicit [`RegisterBus::dispatch`]. Values returned by queued reads are
//! available from the [`ReadBack`] of that dispatch.
//!
//! Most callers use the [`RegisterAccess`] extension, which wraps a single
//! queued operation and its dispatch:
//!
//! ```
//! use tlu_daq::bus::{MockRegisterBus, RegisterAccess};
//!
//! # fn main() -> tlu_daq::Result<()> {
//! let mut bus = MockRegisterBus::new();
//! bus.write_register("triggerLogic.TriggerVetoW", 1)?;
//! assert_eq!(bus.read_register("triggerLogic.TriggerVetoW")?, 1);
//! # Ok(())
//! # }
//! ```
//!
//! Everything above this module shares one bus through [`SharedBus`], which
//! serializes multi-access sequences such as I2C transactions and 48-bit
//! timestamp reads.

pub mod mock;
mod shared;

pub use mock::{BusFault, I2cBusEvent, MockI2cDevice, MockRegisterBus, MockTlu};
pub use shared::SharedBus;

use crate::error::{Result, TluError};

/// Handle to the result of a queued read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadToken(usize);

impl ReadToken {
    /// Token for the `index`-th read queued since the last dispatch.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position of the read within its dispatch.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Values returned by one dispatch, one block per queued read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadBack {
    blocks: Vec<Vec<u32>>,
}

impl ReadBack {
    /// Wrap the blocks returned by a transport, in queue order.
    pub fn new(blocks: Vec<Vec<u32>>) -> Self {
        Self { blocks }
    }

    /// First word of the block read for `token`.
    pub fn word(&self, token: ReadToken) -> Result<u32> {
        self.block(token)?
            .first()
            .copied()
            .ok_or_else(|| TluError::Bus(format!("read {} returned no data", token.index())))
    }

    /// Full block read for `token`.
    pub fn block(&self, token: ReadToken) -> Result<&[u32]> {
        self.blocks
            .get(token.index())
            .map(Vec::as_slice)
            .ok_or_else(|| TluError::Bus(format!("no read queued at index {}", token.index())))
    }

    /// Take ownership of the block read for `token`.
    pub fn into_block(mut self, token: ReadToken) -> Result<Vec<u32>> {
        if token.index() >= self.blocks.len() {
            return Err(TluError::Bus(format!(
                "no read queued at index {}",
                token.index()
            )));
        }
        Ok(self.blocks.swap_remove(token.index()))
    }
}

/// Named-register transport with an explicit commit boundary.
///
/// Implementations queue operations in order and execute them on
/// [`dispatch`](RegisterBus::dispatch). A failed dispatch discards whatever
/// was still queued.
pub trait RegisterBus: Send {
    /// Queue a write of `value` to register `name`.
    fn queue_write(&mut self, name: &str, value: u32);

    /// Queue a read of `words` consecutive words from register `name`.
    ///
    /// For FIFO-style registers the same address is read `words` times.
    fn queue_read(&mut self, name: &str, words: usize) -> ReadToken;

    /// Execute all queued operations.
    fn dispatch(&mut self) -> Result<ReadBack>;
}

impl<B: RegisterBus + ?Sized> RegisterBus for Box<B> {
    fn queue_write(&mut self, name: &str, value: u32) {
        (**self).queue_write(name, value)
    }

    fn queue_read(&mut self, name: &str, words: usize) -> ReadToken {
        (**self).queue_read(name, words)
    }

    fn dispatch(&mut self) -> Result<ReadBack> {
        (**self).dispatch()
    }
}

/// Single-operation helpers over any [`RegisterBus`].
pub trait RegisterAccess: RegisterBus {
    /// Write one register and dispatch.
    fn write_register(&mut self, name: &str, value: u32) -> Result<()> {
        self.queue_write(name, value);
        self.dispatch()?;
        Ok(())
    }

    /// Write several registers in one dispatch, in order.
    fn write_registers(&mut self, writes: &[(&str, u32)]) -> Result<()> {
        for (name, value) in writes {
            self.queue_write(name, *value);
        }
        self.dispatch()?;
        Ok(())
    }

    /// Read one register and dispatch.
    fn read_register(&mut self, name: &str) -> Result<u32> {
        let token = self.queue_read(name, 1);
        self.dispatch()?.word(token)
    }

    /// Read `words` words from one register and dispatch.
    fn read_block(&mut self, name: &str, words: usize) -> Result<Vec<u32>> {
        if words == 0 {
            return Ok(Vec::new());
        }
        let token = self.queue_read(name, words);
        self.dispatch()?.into_block(token)
    }
}

impl<B: RegisterBus + ?Sized> RegisterAccess for B {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readback_indexing() {
        let rb = ReadBack::new(vec![vec![7], vec![1, 2, 3]]);
        assert_eq!(rb.word(ReadToken::new(0)).unwrap(), 7);
        assert_eq!(rb.block(ReadToken::new(1)).unwrap(), &[1, 2, 3]);
        assert!(rb.word(ReadToken::new(2)).is_err());
        assert_eq!(rb.into_block(ReadToken::new(1)).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_queued_writes_apply_on_dispatch_only() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        bus.queue_write("triggerLogic.PulseStretchW", 5);
        assert_eq!(tlu.register("triggerLogic.PulseStretchW"), None);
        bus.dispatch().unwrap();
        assert_eq!(tlu.register("triggerLogic.PulseStretchW"), Some(5));
    }

    #[test]
    fn test_read_block_zero_words_skips_dispatch() {
        let mut bus = MockRegisterBus::new();
        let tlu = bus.handle();
        let words = bus.read_block("eventBuffer.EventFifoData", 0).unwrap();
        assert!(words.is_empty());
        assert_eq!(tlu.dispatch_count(), 0);
    }
}
