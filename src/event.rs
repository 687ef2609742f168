//! Event FIFO frame decoding.
//!
//! Each accepted trigger produces six 32-bit words in the event FIFO:
//!
//! ```text
//! w0  [31:28] event type  [27:16] fired inputs  [15:0] timestamp[47:32]
//! w1  timestamp[31:0]
//! w2  scaler bytes 0..3, most significant first
//! w3  event number
//! w4  [31:24] scaler 4  [23:16] scaler 5
//! w5  reserved
//! ```

use serde::{Deserialize, Serialize};

/// Words per event frame.
pub const EVENT_WORDS: usize = 6;

/// One decoded trigger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Firmware event counter
    pub event_number: u32,
    /// 48-bit timestamp in 40 MHz ticks
    pub timestamp: u64,
    /// 4-bit event type
    pub event_type: u8,
    /// 12-bit fired field; bits 0..5 are the trigger inputs
    pub fired: u16,
    /// Per-input scaler bytes
    pub scalers: [u8; 6],
    /// The frame as read
    pub raw: [u32; EVENT_WORDS],
}

impl EventRecord {
    /// Trigger inputs that fired, bit `i` is input `i + 1`.
    pub fn inputs(&self) -> u8 {
        (self.fired & 0x3F) as u8
    }
}

/// Decode one frame. Never fails; every bit pattern maps to a record.
pub fn decode(words: [u32; EVENT_WORDS]) -> EventRecord {
    let [w0, w1, w2, w3, w4, _] = words;
    let s = w2.to_be_bytes();
    let t = w4.to_be_bytes();
    EventRecord {
        event_number: w3,
        timestamp: (u64::from(w0 & 0xFFFF) << 32) | u64::from(w1),
        event_type: (w0 >> 28) as u8,
        fired: ((w0 >> 16) & 0xFFF) as u16,
        scalers: [s[0], s[1], s[2], s[3], t[0], t[1]],
        raw: words,
    }
}

/// Decode consecutive frames. Trailing words short of a full frame are
/// ignored; callers check alignment first.
pub fn decode_block(words: &[u32]) -> Vec<EventRecord> {
    words
        .chunks_exact(EVENT_WORDS)
        .map(|chunk| {
            let mut frame = [0u32; EVENT_WORDS];
            frame.copy_from_slice(chunk);
            decode(frame)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::synth_frame;

    #[test]
    fn test_decode_zero_frame() {
        let rec = decode([0; 6]);
        assert_eq!(rec.event_number, 0);
        assert_eq!(rec.timestamp, 0);
        assert_eq!(rec.event_type, 0);
        assert_eq!(rec.fired, 0);
        assert_eq!(rec.scalers, [0; 6]);
    }

    #[test]
    fn test_decode_field_layout() {
        let rec = decode([
            0x3042_1234,
            0x5678_9ABC,
            0x0102_0304,
            42,
            0x0506_FFFF,
            0xDEAD_BEEF,
        ]);
        assert_eq!(rec.event_type, 0x3);
        assert_eq!(rec.fired, 0x042);
        assert_eq!(rec.inputs(), 0x02);
        assert_eq!(rec.timestamp, 0x1234_5678_9ABC);
        assert_eq!(rec.scalers, [1, 2, 3, 4, 5, 6]);
        assert_eq!(rec.event_number, 42);
        assert_eq!(rec.raw[5], 0xDEAD_BEEF);
    }

    #[test]
    fn test_decode_is_total() {
        let patterns = [0u32, u32::MAX, 0xAAAA_AAAA, 0x5555_5555, 0x8000_0001];
        for a in patterns {
            for b in patterns {
                let rec = decode([a, b, a, b, a, b]);
                assert!(rec.timestamp < 1 << 48);
                assert!(rec.event_type < 16);
                assert!(rec.fired < 1 << 12);
                assert_eq!(rec.raw, [a, b, a, b, a, b]);
            }
        }
    }

    #[test]
    fn test_decode_matches_simulator_frame() {
        let frame = synth_frame(0x2, 0x003, 0xABCD_0000_1111, 7, [9, 8, 7, 6, 5, 4]);
        let rec = decode(frame);
        assert_eq!(rec.event_type, 0x2);
        assert_eq!(rec.inputs(), 0x03);
        assert_eq!(rec.timestamp, 0xABCD_0000_1111);
        assert_eq!(rec.event_number, 7);
        assert_eq!(rec.scalers, [9, 8, 7, 6, 5, 4]);
    }

    #[test]
    fn test_decode_block_preserves_order() {
        let words: Vec<u32> = (1..=3)
            .flat_map(|n| synth_frame(0, 1, n as u64, n, [0; 6]))
            .collect();
        let numbers: Vec<u32> = decode_block(&words).iter().map(|r| r.event_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
