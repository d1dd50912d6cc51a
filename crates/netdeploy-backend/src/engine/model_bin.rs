//! Reader for the binary weight file (`.bin`).

use half::f16;

use crate::error::EngineError;

/// Tag for a flagged float32 blob.
pub const TAG_FLOAT32: u32 = 0;
/// Tag for a flagged float16 blob.
pub const TAG_FLOAT16: u32 = 0x0130_6B47;

/// How a weight blob is laid out in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightEncoding {
    /// A 4-byte tag selects the payload encoding.
    Flagged,
    /// Plain little-endian float32 values.
    Raw,
}

/// Sequential cursor over weight bytes, read by layers in declaration order.
pub struct ModelBin<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ModelBin<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// Read `count` weights.
    pub fn load(&mut self, count: usize, encoding: WeightEncoding) -> Result<Vec<f32>, EngineError> {
        match encoding {
            WeightEncoding::Raw => self.read_f32(count),
            WeightEncoding::Flagged => {
                let tag = u32::from_le_bytes(self.take(4)?.try_into().map_err(|_| short_read(4))?);
                match tag {
                    TAG_FLOAT32 => self.read_f32(count),
                    TAG_FLOAT16 => self.read_f16(count),
                    other => Err(EngineError::Weights(format!(
                        "unsupported weight encoding tag {:#010x} at offset {}",
                        other,
                        self.offset - 4
                    ))),
                }
            }
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], EngineError> {
        if self.remaining() < len {
            return Err(EngineError::Weights(format!(
                "need {} bytes at offset {}, only {} left",
                len,
                self.offset,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_f32(&mut self, count: usize) -> Result<Vec<f32>, EngineError> {
        let bytes = self.take(count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn read_f16(&mut self, count: usize) -> Result<Vec<f32>, EngineError> {
        let bytes = self.take(count * 2)?;
        let values = bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect();
        // payloads are padded to 4-byte alignment
        if count % 2 == 1 {
            self.take(2)?;
        }
        Ok(values)
    }
}

fn short_read(len: usize) -> EngineError {
    EngineError::Weights(format!("short read of {} bytes", len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_flagged_then_raw() {
        let mut bytes = TAG_FLOAT32.to_le_bytes().to_vec();
        bytes.extend(f32_bytes(&[1.0, 2.0]));
        bytes.extend(f32_bytes(&[3.0]));

        let mut mb = ModelBin::new(&bytes);
        assert_eq!(mb.load(2, WeightEncoding::Flagged).unwrap(), vec![1.0, 2.0]);
        assert_eq!(mb.load(1, WeightEncoding::Raw).unwrap(), vec![3.0]);
        assert_eq!(mb.remaining(), 0);
    }

    #[test]
    fn test_float16_payload() {
        let mut bytes = TAG_FLOAT16.to_le_bytes().to_vec();
        // 1.0, -2.0, 0.5 and two bytes of padding
        for bits in [0x3c00u16, 0xc000, 0x3800] {
            bytes.extend(bits.to_le_bytes());
        }
        bytes.extend([0, 0]);

        let mut mb = ModelBin::new(&bytes);
        assert_eq!(mb.load(3, WeightEncoding::Flagged).unwrap(), vec![1.0, -2.0, 0.5]);
        assert_eq!(mb.remaining(), 0);
    }

    #[test]
    fn test_float16_special_values() {
        let mut bytes = TAG_FLOAT16.to_le_bytes().to_vec();
        // zero, +inf, nan, smallest subnormal
        for bits in [0x0000u16, 0x7c00, 0x7e00, 0x0001] {
            bytes.extend(bits.to_le_bytes());
        }

        let mut mb = ModelBin::new(&bytes);
        let values = mb.load(4, WeightEncoding::Flagged).unwrap();
        assert_eq!(values[0], 0.0);
        assert!(values[1].is_infinite() && values[1] > 0.0);
        assert!(values[2].is_nan());
        assert_eq!(values[3], 2f32.powi(-24));
        assert_eq!(mb.remaining(), 0);
    }

    #[test]
    fn test_quantized_tag_rejected() {
        let bytes = 0x000D_4B38u32.to_le_bytes();
        let mut mb = ModelBin::new(&bytes);
        assert!(matches!(
            mb.load(1, WeightEncoding::Flagged),
            Err(EngineError::Weights(_))
        ));
    }

    #[test]
    fn test_short_read() {
        let bytes = f32_bytes(&[1.0]);
        let mut mb = ModelBin::new(&bytes);
        assert!(mb.load(2, WeightEncoding::Raw).is_err());
    }
}
