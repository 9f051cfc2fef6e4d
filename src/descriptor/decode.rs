//! Byte decoding and firmware-unit encoding for descriptors

use super::{DataKind, Descriptor};
use crate::types::{DataValue, Sample};
use chrono::{DateTime, Utc};

/// Widen little-endian `bytes` of declared `width` to 64 bits.
///
/// Missing most-significant bytes are padded with zeros, or with ones when
/// the value is signed and the highest available byte is negative.
pub(crate) fn widen(bytes: &[u8], width: usize, signed: bool) -> i64 {
    let width = width.min(8);
    let available = &bytes[..bytes.len().min(width)];
    let Some(&top) = available.last() else {
        return 0;
    };
    let negative = signed && top & 0x80 != 0;
    let mut buf = if negative { [0xffu8; 8] } else { [0u8; 8] };
    buf[..available.len()].copy_from_slice(available);
    i64::from_le_bytes(buf)
}

impl Descriptor {
    /// Decode one frame into a timestamped sample.
    ///
    /// Live frames arrive with the wire header already stripped and are read
    /// from this descriptor's sub-offset; replayed log payloads are already
    /// positioned and are read from the start.
    pub fn decode(&self, raw: &[u8], log_replay: bool, timestamp: DateTime<Utc>) -> Sample {
        Sample {
            address: self.address,
            timestamp,
            value: self.value(raw, log_replay),
        }
    }

    /// Decode every repeated unit of a frame, in order
    pub fn decode_all(&self, raw: &[u8], log_replay: bool, timestamp: DateTime<Utc>) -> Vec<Sample> {
        let unit = self.layout.unit_length();
        let repeats = self.layout.repeat_count() as usize;
        if repeats <= 1 || unit == 0 {
            return vec![self.decode(raw, log_replay, timestamp)];
        }
        let data = self.positioned(raw, log_replay);
        (0..repeats)
            .map(|i| {
                let start = (i * unit).min(data.len());
                Sample {
                    address: self.address,
                    timestamp,
                    value: self.value_of(&data[start..]),
                }
            })
            .collect()
    }

    /// Decode the value only
    pub fn value(&self, raw: &[u8], log_replay: bool) -> DataValue {
        self.value_of(self.positioned(raw, log_replay))
    }

    fn positioned<'a>(&self, raw: &'a [u8], log_replay: bool) -> &'a [u8] {
        if log_replay {
            raw
        } else {
            raw.get(self.layout.sub_offset() as usize..).unwrap_or(&[])
        }
    }

    fn value_of(&self, data: &[u8]) -> DataValue {
        let width = self.layout.first_size() as usize;
        let signed = self.layout.is_signed();
        match self.kind {
            DataKind::Uint => {
                if signed {
                    DataValue::Signed(widen(data, width, true))
                } else {
                    DataValue::Unsigned(widen(data, width, false) as u64)
                }
            }
            DataKind::Int => DataValue::Signed(widen(data, width, signed)),
            DataKind::Bool => DataValue::Bool(data.first().is_some_and(|&b| b != 0)),
            DataKind::UFloat => {
                let raw = widen(data, width, false) as u64;
                DataValue::Float(raw as f32 / self.scale())
            }
            DataKind::SFloat => DataValue::Float(widen(data, width, true) as f32 / self.scale()),
            DataKind::Vector => {
                let scale = self.scale();
                let mut offset = 0usize;
                let components = self
                    .layout
                    .field_sizes()
                    .iter()
                    .map(|&size| {
                        let size = size as usize;
                        let field = data.get(offset..).unwrap_or(&[]);
                        offset += size;
                        widen(field, size, signed) as f32 / scale
                    })
                    .collect();
                DataValue::Vector(components)
            }
            DataKind::Bytes => {
                let unit = self.layout.unit_length();
                let end = if unit == 0 { data.len() } else { unit.min(data.len()) };
                DataValue::Bytes(data[..end].to_vec())
            }
            DataKind::Array => {
                if self.parts.is_empty() {
                    return DataValue::Bytes(data.to_vec());
                }
                let mut offset = 0usize;
                let values = self
                    .parts
                    .iter()
                    .map(|part| {
                        let chunk = data.get(offset..).unwrap_or(&[]);
                        offset += part.layout.frame_length();
                        part.value_of(chunk)
                    })
                    .collect();
                DataValue::Array(values)
            }
        }
    }

    /// Convert a host value into firmware units: multiply by scale, truncate
    pub fn to_wire(&self, value: f32) -> i64 {
        match self.kind {
            DataKind::Uint | DataKind::Int | DataKind::Bool | DataKind::Bytes => value as i64,
            _ => (value * self.scale()) as i64,
        }
    }

    /// `to_wire` serialized little-endian into `width` bytes
    pub fn to_wire_bytes(&self, value: f32, width: usize) -> Vec<u8> {
        let wire = self.to_wire(value).to_le_bytes();
        wire[..width.min(8)].to_vec()
    }
}
