//! Bit-packed input messages.
//!
//! Layout, after a 1-bit format selector and a 32-bit start frame:
//!
//! * coalesced (`0`): `[run:4][value]? [last]` followed by an optional
//!   consistency report. Covers `run + 1` frames: `run` copies of `value`
//!   then `last`.
//! * run-length (`1`): `[run:6][value]` pairs terminated by a zero run. Used
//!   for historical catch-up; never carries a report.
//!
//! Values occupy exactly the declared input bit width.

use crate::bitstream::{BitReader, BitWriter};
use crate::error::ProtocolError;
use crate::hash::StateHash;
use crate::{ConnectionId, Frame, JleId};

const COALESCED_RUN_BITS: u8 = 4;
const RLE_RUN_BITS: u8 = 6;

/// Longest run the coalesced header can express.
pub const MAX_COALESCED_RUN: usize = (1 << COALESCED_RUN_BITS) - 1;
/// Longest run a single RLE pair can express.
pub const MAX_RLE_RUN: usize = (1 << RLE_RUN_BITS) - 1;
/// Upper bound on frames in one decoded batch.
pub const MAX_BATCH_FRAMES: usize = 1 << 14;

/// Inputs for one slot over consecutive frames starting at `start_frame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBatch {
    pub start_frame: Frame,
    pub values: Vec<u32>,
}

impl InputBatch {
    pub fn new(start_frame: Frame, values: Vec<u32>) -> Self {
        Self {
            start_frame,
            values,
        }
    }

    /// First frame not covered by this batch.
    pub fn frame_after(&self) -> Frame {
        self.start_frame + self.values.len() as Frame
    }

    pub fn frames(&self) -> impl Iterator<Item = (Frame, u32)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(move |(i, v)| (self.start_frame + i as Frame, *v))
    }

    /// True when the batch fits the coalesced form.
    pub fn can_coalesce(&self) -> bool {
        match self.values.split_last() {
            None => false,
            Some((_, head)) if head.len() > MAX_COALESCED_RUN => false,
            Some((_, head)) => head.windows(2).all(|w| w[0] == w[1]),
        }
    }
}

/// Piggybacked on coalesced input: the sender's NCF and the hash of its
/// snapshot there, tagged with the history it was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub ncf: Frame,
    pub jle_epoch: JleId,
    pub coordinator: ConnectionId,
    pub hash: StateHash,
}

/// Mask selecting the low `bits` bits.
pub fn value_mask(bits: u8) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Encodes coalesced when possible (attaching `report`), RLE otherwise.
pub fn encode(batch: &InputBatch, bits: u8, report: Option<&ConsistencyReport>) -> Vec<u8> {
    if batch.can_coalesce() {
        encode_coalesced(batch, bits, report)
    } else {
        encode_rle(batch, bits)
    }
}

fn encode_coalesced(batch: &InputBatch, bits: u8, report: Option<&ConsistencyReport>) -> Vec<u8> {
    let mut writer = BitWriter::new();
    writer.write_bit(false);
    writer.write_i32(batch.start_frame);

    let (last, head) = batch
        .values
        .split_last()
        .map(|(l, h)| (*l, h))
        .unwrap_or((0, &[]));
    writer.write_bits(head.len() as u64, COALESCED_RUN_BITS);
    if let Some(first) = head.first() {
        writer.write_bits(*first as u64, bits);
    }
    writer.write_bits(last as u64, bits);

    match report {
        Some(report) => {
            writer.write_bit(true);
            writer.write_i32(report.ncf);
            writer.write_bits(report.jle_epoch as u64, 32);
            writer.write_bits(report.coordinator as u64, 32);
            writer.write_u64(report.hash.0);
        }
        None => writer.write_bit(false),
    }
    writer.into_bytes()
}

/// Run-length form; always usable, used for catch-up.
pub fn encode_rle(batch: &InputBatch, bits: u8) -> Vec<u8> {
    let mut writer = BitWriter::new();
    writer.write_bit(true);
    writer.write_i32(batch.start_frame);

    let mut index = 0;
    while index < batch.values.len() {
        let value = batch.values[index];
        let run = batch.values[index..]
            .iter()
            .take(MAX_RLE_RUN)
            .take_while(|v| **v == value)
            .count();
        writer.write_bits(run as u64, RLE_RUN_BITS);
        writer.write_bits(value as u64, bits);
        index += run;
    }
    writer.write_bits(0, RLE_RUN_BITS);
    writer.into_bytes()
}

pub fn decode(
    bytes: &[u8],
    bits: u8,
) -> Result<(InputBatch, Option<ConsistencyReport>), ProtocolError> {
    let mut reader = BitReader::new(bytes);
    let run_length_encoded = reader.read_bit()?;
    let start_frame = reader.read_i32()?;

    let mut values = Vec::new();
    let mut report = None;

    if run_length_encoded {
        loop {
            let run = reader.read_bits(RLE_RUN_BITS)? as usize;
            if run == 0 {
                break;
            }
            let value = reader.read_bits(bits)? as u32;
            if values.len() + run > MAX_BATCH_FRAMES {
                return Err(ProtocolError::TooLarge {
                    size: values.len() + run,
                    limit: MAX_BATCH_FRAMES,
                });
            }
            values.extend(std::iter::repeat(value).take(run));
        }
    } else {
        let run = reader.read_bits(COALESCED_RUN_BITS)? as usize;
        if run > 0 {
            let value = reader.read_bits(bits)? as u32;
            values.extend(std::iter::repeat(value).take(run));
        }
        values.push(reader.read_bits(bits)? as u32);

        if reader.read_bit()? {
            report = Some(ConsistencyReport {
                ncf: reader.read_i32()?,
                jle_epoch: reader.read_bits(32)? as JleId,
                coordinator: reader.read_bits(32)? as ConnectionId,
                hash: StateHash(reader.read_u64()?),
            });
        }
    }

    reader.finish()?;
    if start_frame.checked_add(values.len() as Frame).is_none() {
        return Err(ProtocolError::Malformed("frame overflow".to_string()));
    }
    Ok((InputBatch::new(start_frame, values), report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_report() -> ConsistencyReport {
        ConsistencyReport {
            ncf: 117,
            jle_epoch: 4,
            coordinator: 2,
            hash: StateHash(0xDEAD_BEEF_0000_0010),
        }
    }

    #[test]
    fn test_single_frame_uses_coalesced_with_report() {
        let batch = InputBatch::new(120, vec![0b101]);
        let report = sample_report();
        let bytes = encode(&batch, 3, Some(&report));

        let (decoded, decoded_report) = decode(&bytes, 3).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded_report, Some(report));
        assert_eq!(decoded.frame_after(), 121);
    }

    #[test]
    fn test_run_then_last_value_coalesces() {
        let batch = InputBatch::new(10, vec![2, 2, 2, 2, 7]);
        assert!(batch.can_coalesce());
        let bytes = encode(&batch, 3, None);
        assert_eq!(bytes[0] & 1, 0);
        assert_eq!(decode(&bytes, 3).unwrap(), (batch, None));
    }

    #[test]
    fn test_mixed_values_fall_back_to_rle_without_report() {
        let batch = InputBatch::new(-5, vec![1, 2, 1, 1, 3]);
        assert!(!batch.can_coalesce());
        let bytes = encode(&batch, 2, Some(&sample_report()));
        assert_eq!(bytes[0] & 1, 1);
        let (decoded, report) = decode(&bytes, 2).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(report, None);
    }

    #[test]
    fn test_long_runs_are_split() {
        let batch = InputBatch::new(0, vec![9; MAX_RLE_RUN * 2 + 5]);
        let bytes = encode_rle(&batch, 4);
        let (decoded, _) = decode(&bytes, 4).unwrap();
        assert_eq!(decoded.values.len(), MAX_RLE_RUN * 2 + 5);
        assert_eq!(decoded.frame_after(), (MAX_RLE_RUN * 2 + 5) as Frame);
    }

    #[test]
    fn test_empty_rle_batch() {
        let batch = InputBatch::new(33, vec![]);
        let (decoded, _) = decode(&encode(&batch, 8, None), 8).unwrap();
        assert_eq!(decoded.frame_after(), 33);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let bytes = encode(&InputBatch::new(1, vec![1, 2, 3]), 8, None);
        assert!(decode(&bytes[..bytes.len() - 1], 8).is_err());
        assert!(decode(&[], 8).is_err());
    }

    #[test]
    fn test_full_width_values() {
        let batch = InputBatch::new(1, vec![u32::MAX, 0, u32::MAX]);
        let (decoded, _) = decode(&encode(&batch, 32, None), 32).unwrap();
        assert_eq!(decoded, batch);
    }

    proptest! {
        #[test]
        fn prop_encode_decode_reproduces_sequence(
            bits in 1u8..=16,
            start in -1000i32..100_000,
            raw in proptest::collection::vec(any::<u32>(), 0..200),
            repeat in 1usize..20,
        ) {
            let mask = value_mask(bits);
            let values: Vec<u32> = raw
                .iter()
                .flat_map(|v| std::iter::repeat(*v & mask).take(repeat))
                .collect();
            let batch = InputBatch::new(start, values);
            let (decoded, _) = decode(&encode(&batch, bits, None), bits).unwrap();
            prop_assert_eq!(decoded.frame_after(), start + batch.values.len() as Frame);
            prop_assert_eq!(decoded, batch);
        }
    }
}
