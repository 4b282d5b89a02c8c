use crate::errors::DaclError;

/// Maximum signal width we can extract into a single value.
pub const MAX_SIGNAL_BITS: u32 = 32;
/// Number of bits in a classic CAN payload.
pub const FRAME_BITS: u32 = 64;

/// Layout of a DBC-style signal inside an 8 byte payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSpec {
    pub start_bit: u32,
    pub bit_length: u32,
    /// Intel byte order when true, Motorola when false
    pub little_endian: bool,
    pub factor: f64,
    pub offset: f64,
}

impl SignalSpec {
    pub const fn little_endian(start_bit: u32, bit_length: u32, factor: f64, offset: f64) -> Self {
        Self {
            start_bit,
            bit_length,
            little_endian: true,
            factor,
            offset,
        }
    }

    pub const fn big_endian(start_bit: u32, bit_length: u32, factor: f64, offset: f64) -> Self {
        Self {
            start_bit,
            bit_length,
            little_endian: false,
            factor,
            offset,
        }
    }

    pub fn validate(&self) -> Result<(), DaclError> {
        if self.bit_length == 0 || self.bit_length > MAX_SIGNAL_BITS {
            return Err(DaclError::InvalidSignal {
                reason: format!(
                    "bit length {} outside 1..={}",
                    self.bit_length, MAX_SIGNAL_BITS
                ),
            });
        }
        let end = self.start_bit.checked_add(self.bit_length);
        if end.is_none_or(|end| end > FRAME_BITS) {
            return Err(DaclError::InvalidSignal {
                reason: format!(
                    "start bit {} with length {} exceeds the {} bit payload",
                    self.start_bit, self.bit_length, FRAME_BITS
                ),
            });
        }
        Ok(())
    }

    /// Number of payload bytes the signal touches, counted from its first byte.
    pub fn byte_span(&self) -> usize {
        ((u64::from(self.bit_length) + u64::from(self.start_bit % 8) + 7) / 8) as usize
    }

    /// Smallest DLC that still carries every byte of the signal.
    pub fn required_len(&self) -> usize {
        (self.start_bit / 8) as usize + self.byte_span()
    }
}

/// Extracts the raw (unscaled) bit field described by `spec`.
pub fn extract_raw(data: &[u8; 8], spec: &SignalSpec) -> Result<u64, DaclError> {
    spec.validate()?;

    let start_byte = (spec.start_bit / 8) as usize;
    let shift = spec.start_bit % 8;

    let mut raw: u64 = 0;
    for (i, byte) in data[start_byte..start_byte + spec.byte_span()]
        .iter()
        .enumerate()
    {
        if spec.little_endian {
            raw |= u64::from(*byte) << (i * 8);
        } else {
            raw = (raw << 8) | u64::from(*byte);
        }
    }

    raw >>= shift;
    raw &= (1u64 << spec.bit_length) - 1;
    Ok(raw)
}

/// Extracts a signal and applies its linear conversion, truncating toward zero.
pub fn extract_signal(data: &[u8; 8], spec: &SignalSpec) -> Result<i64, DaclError> {
    let raw = extract_raw(data, spec)?;
    let scaled = raw as f64 * spec.factor + spec.offset;
    Ok(scaled.trunc() as i64)
}
