//! Byte geometry of a board data frame
//!
//! A [`Layout`] describes how a frame is laid out: the byte width of each
//! field in one unit, how many units are repeated back to back, where the
//! view starts inside its parent frame, and whether the fields are signed.
//!
//! Layouts are immutable. The `with_*` helpers mirror what the firmware does
//! to a frame as it passes through a processor: every derived copy resets
//! the sub-offset to zero and changes exactly one attribute.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while constructing a layout
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("frame length {0} does not fit in a single byte")]
    FrameTooLong(usize),

    #[error("view at offset {offset} with unit length {unit_length} exceeds frame length {frame_length}")]
    ViewOutOfBounds {
        offset: usize,
        unit_length: usize,
        frame_length: usize,
    },

    #[error("field width must be non-zero")]
    ZeroWidthField,

    #[error("vector needs 2 or 3 components, got {0}")]
    ComponentCount(u8),
}

/// Geometry of a data frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    field_sizes: Vec<u8>,
    repeat_count: u8,
    sub_offset: u8,
    signed: bool,
}

impl Layout {
    /// Create a layout, checking that the whole frame fits a byte length
    pub fn new(
        field_sizes: Vec<u8>,
        repeat_count: u8,
        sub_offset: u8,
        signed: bool,
    ) -> Result<Self, LayoutError> {
        if field_sizes.iter().any(|&s| s == 0) {
            return Err(LayoutError::ZeroWidthField);
        }
        let unit: usize = field_sizes.iter().map(|&s| s as usize).sum();
        let frame = unit * repeat_count as usize;
        if frame > u8::MAX as usize {
            return Err(LayoutError::FrameTooLong(frame));
        }
        if sub_offset as usize + unit > u8::MAX as usize {
            return Err(LayoutError::FrameTooLong(sub_offset as usize + unit));
        }
        Ok(Self {
            field_sizes,
            repeat_count,
            sub_offset,
            signed,
        })
    }

    /// Single field, single unit, offset zero
    pub fn scalar(size: u8, signed: bool) -> Result<Self, LayoutError> {
        Self::new(vec![size], 1, 0, signed)
    }

    /// Layout of a frame with no fixed fields (e.g. an opaque buffer output)
    pub fn empty() -> Self {
        Self {
            field_sizes: Vec::new(),
            repeat_count: 0,
            sub_offset: 0,
            signed: false,
        }
    }

    pub fn field_sizes(&self) -> &[u8] {
        &self.field_sizes
    }

    pub fn repeat_count(&self) -> u8 {
        self.repeat_count
    }

    pub fn sub_offset(&self) -> u8 {
        self.sub_offset
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Width of the first field, used when every field has the same size
    pub fn first_size(&self) -> u8 {
        self.field_sizes.first().copied().unwrap_or(0)
    }

    /// Bytes in one repeated unit
    pub fn unit_length(&self) -> usize {
        self.field_sizes.iter().map(|&s| s as usize).sum()
    }

    /// Bytes in the whole frame
    pub fn frame_length(&self) -> usize {
        self.unit_length() * self.repeat_count as usize
    }

    /// A sibling view over a parent frame with this layout.
    ///
    /// The view must lie entirely inside the parent frame.
    pub fn sub_view(&self, offset: u8, field_sizes: Vec<u8>) -> Result<Layout, LayoutError> {
        let view = Layout::new(field_sizes, 1, offset, self.signed)?;
        let frame_length = self.frame_length();
        if offset as usize + view.unit_length() > frame_length {
            return Err(LayoutError::ViewOutOfBounds {
                offset: offset as usize,
                unit_length: view.unit_length(),
                frame_length,
            });
        }
        Ok(view)
    }

    /// Same geometry with the sub-offset cleared
    pub fn with_zero_offset(&self) -> Layout {
        Layout {
            sub_offset: 0,
            ..self.clone()
        }
    }

    /// Every field resized to `size`, offset cleared
    pub fn with_size(&self, size: u8) -> Result<Layout, LayoutError> {
        Layout::new(
            vec![size; self.field_sizes.len()],
            self.repeat_count,
            0,
            self.signed,
        )
    }

    /// Signedness replaced, offset cleared
    pub fn with_signed(&self, signed: bool) -> Layout {
        Layout {
            signed,
            ..self.with_zero_offset()
        }
    }

    /// Repeat count replaced, offset cleared
    pub fn with_repeat(&self, repeat_count: u8) -> Result<Layout, LayoutError> {
        Layout::new(self.field_sizes.clone(), repeat_count, 0, self.signed)
    }

    /// The frame descriptor byte sent ahead of operator bytes when this layout
    /// feeds a processor: `(length - 1) << 5 | offset`.
    pub fn frame_descriptor(&self) -> u8 {
        let length = u8::try_from(self.frame_length()).unwrap_or(u8::MAX);
        ((length.saturating_sub(1) & 0x7) << 5) | (self.sub_offset & 0x1f)
    }
}
