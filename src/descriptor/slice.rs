//! Read-only byte ranges of a descriptor

use super::Descriptor;
use crate::error::{BoardError, Result};
use crate::types::Address;
use serde::{Deserialize, Serialize};

/// A byte range inside a descriptor's frame.
///
/// Slices exist only to address bytes on the board (e.g. to copy part of a
/// trigger's payload into an event command). They cannot be decoded,
/// reparented, or fed into a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSlice {
    pub address: Address,
    pub offset: u8,
    pub length: u8,
}

impl Descriptor {
    /// Slice `length` bytes starting at `offset` of this descriptor's frame
    pub fn slice(&self, offset: i32, length: i32) -> Result<DataSlice> {
        let available = self.layout.frame_length();
        let out_of_range = offset < 0
            || length < 0
            || (offset as i64 + length as i64) > available as i64;
        if out_of_range {
            return Err(BoardError::Index {
                offset,
                length,
                available,
            });
        }
        Ok(DataSlice {
            address: self.address,
            offset: offset as u8,
            length: length as u8,
        })
    }

    /// The whole frame as a slice
    pub fn as_slice(&self) -> DataSlice {
        DataSlice {
            address: self.address,
            offset: self.layout.sub_offset(),
            length: self.layout.unit_length() as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::descriptor::Descriptor;
    use crate::error::BoardError;
    use crate::types::{module, Address};

    #[test]
    fn test_slice_within_frame() {
        let d = Descriptor::uint(Address::new(module::GPIO, 0x07, 1), 4).unwrap();
        let s = d.slice(1, 2).unwrap();
        assert_eq!((s.offset, s.length), (1, 2));
        assert_eq!(s.address, d.address());
        assert!(d.slice(0, 4).is_ok());
    }

    #[test]
    fn test_slice_rejects_out_of_range() {
        let d = Descriptor::uint(Address::new(module::GPIO, 0x07, 1), 4).unwrap();
        assert!(matches!(d.slice(-1, 2), Err(BoardError::Index { .. })));
        assert!(matches!(d.slice(3, 2), Err(BoardError::Index { available: 4, .. })));
    }

    #[test]
    fn test_component_as_slice() {
        let d = Descriptor::vector(Address::unindexed(module::ACCELEROMETER, 0x04), 3, 2, 1.0).unwrap();
        let z = d.component(2).unwrap().as_slice();
        assert_eq!((z.offset, z.length), (4, 2));
    }
}
