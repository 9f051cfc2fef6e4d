//! Typed data descriptors
//!
//! A [`Descriptor`] is the host's view of one data frame the board can
//! produce: where it comes from ([`Address`]), how its bytes are laid out
//! ([`Layout`]), and how to turn those bytes into a [`DataValue`] (its
//! [`DataKind`]).
//!
//! Descriptors form a tree. A descriptor minted for a processor output
//! owns a copy of the descriptor that feeds it (`input`), which is where an
//! unscaled output inherits its scale from. Vector descriptors also carry
//! `split` children: per-component views over the same frame at different
//! sub-offsets, so a single axis can be routed on its own.
//!
//! # Main Types
//!
//! - [`DataKind`] - Closed set of decode/encode variants
//! - [`Descriptor`] - Identity + layout + variant + provenance
//! - [`DataSlice`] - Read-only byte range of a descriptor, for addressing only

mod decode;
mod slice;

pub(crate) use decode::widen;
pub use slice::DataSlice;

use crate::layout::{Layout, LayoutError};
use crate::types::{Address, NO_ID};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decode/encode variant of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    /// Unsigned integer
    Uint,
    /// Signed integer
    Int,
    /// Single-byte flag
    Bool,
    /// Unsigned fixed-point value, divided by scale
    UFloat,
    /// Signed fixed-point value, divided by scale
    SFloat,
    /// Opaque bytes
    Bytes,
    /// 2 or 3 scaled components
    Vector,
    /// Heterogeneous sub-messages (fuser output)
    Array,
}

impl DataKind {
    pub fn name(&self) -> &'static str {
        match self {
            DataKind::Uint => "uint",
            DataKind::Int => "int",
            DataKind::Bool => "bool",
            DataKind::UFloat => "ufloat",
            DataKind::SFloat => "sfloat",
            DataKind::Bytes => "bytes",
            DataKind::Vector => "vector",
            DataKind::Array => "array",
        }
    }

    /// Variant produced when this kind's values become signed
    pub fn signed_counterpart(&self) -> DataKind {
        match self {
            DataKind::Uint => DataKind::Int,
            DataKind::UFloat => DataKind::SFloat,
            other => *other,
        }
    }

    /// Variant produced when this kind's values become unsigned
    pub fn unsigned_counterpart(&self) -> DataKind {
        match self {
            DataKind::Int => DataKind::Uint,
            DataKind::SFloat => DataKind::UFloat,
            other => *other,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataKind::UFloat | DataKind::SFloat | DataKind::Vector)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Host-side description of a board data frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    kind: DataKind,
    address: Address,
    layout: Layout,
    /// Explicit scale; `None` inherits from `input`
    scale: Option<f32>,
    input: Option<Box<Descriptor>>,
    split: Vec<Descriptor>,
    /// Sub-message descriptors of an array frame, in frame order
    parts: Vec<Descriptor>,
}

impl Descriptor {
    /// Create a root descriptor for a board producer
    pub fn new(kind: DataKind, address: Address, layout: Layout) -> Self {
        let mut descriptor = Self {
            kind,
            address,
            layout,
            scale: None,
            input: None,
            split: Vec::new(),
            parts: Vec::new(),
        };
        descriptor.split = descriptor.compute_split();
        descriptor
    }

    /// Unsigned integer of `size` bytes
    pub fn uint(address: Address, size: u8) -> Result<Self, LayoutError> {
        Ok(Self::new(DataKind::Uint, address, Layout::scalar(size, false)?))
    }

    /// Signed integer of `size` bytes
    pub fn int(address: Address, size: u8) -> Result<Self, LayoutError> {
        Ok(Self::new(DataKind::Int, address, Layout::scalar(size, true)?))
    }

    /// Fixed-point float of `size` bytes with the given scale
    pub fn float(address: Address, size: u8, signed: bool, scale: f32) -> Result<Self, LayoutError> {
        let kind = if signed {
            DataKind::SFloat
        } else {
            DataKind::UFloat
        };
        Ok(Self::new(kind, address, Layout::scalar(size, signed)?).with_scale(scale))
    }

    /// Signed vector of `components` fields, each `size` bytes
    pub fn vector(address: Address, components: u8, size: u8, scale: f32) -> Result<Self, LayoutError> {
        if !(2..=3).contains(&components) {
            return Err(LayoutError::ComponentCount(components));
        }
        let layout = Layout::new(vec![size; components as usize], 1, 0, true)?;
        Ok(Self::new(DataKind::Vector, address, layout).with_scale(scale))
    }

    /// Array frame built from the given sub-message descriptors
    pub fn array(input: Option<Descriptor>, address: Address, layout: Layout, parts: Vec<Descriptor>) -> Self {
        let mut descriptor = Self::new(DataKind::Array, address, layout);
        descriptor.input = input.map(Box::new);
        descriptor.parts = parts;
        descriptor
    }

    /// Override the scale used by float variants
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self.split = self.compute_split();
        self
    }

    /// Same descriptor at a new board-assigned id
    pub fn with_id(mut self, id: u8) -> Self {
        self.address = self.address.with_id(id);
        for child in &mut self.split {
            child.address = child.address.with_id(id);
        }
        self
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn input(&self) -> Option<&Descriptor> {
        self.input.as_deref()
    }

    pub fn split(&self) -> &[Descriptor] {
        &self.split
    }

    pub fn parts(&self) -> &[Descriptor] {
        &self.parts
    }

    /// Per-component view, if this descriptor supports splitting
    pub fn component(&self, index: usize) -> Option<&Descriptor> {
        self.split.get(index)
    }

    /// Scale of firmware units per host unit, inherited from `input` unless set
    pub fn scale(&self) -> f32 {
        match (self.scale, &self.input) {
            (Some(scale), _) => scale,
            (None, Some(input)) => input.scale(),
            (None, None) => 1.0,
        }
    }

    /// Same variant under a new identity and layout, fed by `new_input`.
    ///
    /// Split children are recomputed for the new layout.
    pub fn reparent(&self, new_input: Descriptor, address: Address, layout: Layout) -> Descriptor {
        let mut derived = Descriptor {
            kind: self.kind,
            address,
            layout,
            scale: None,
            input: Some(Box::new(new_input)),
            split: Vec::new(),
            parts: self.parts.clone(),
        };
        derived.split = derived.compute_split();
        derived
    }

    /// A different variant under a new identity, fed by `input`
    pub fn derived(kind: DataKind, input: Descriptor, address: Address, layout: Layout) -> Descriptor {
        let mut derived = Descriptor {
            kind,
            address,
            layout,
            scale: None,
            input: Some(Box::new(input)),
            split: Vec::new(),
            parts: Vec::new(),
        };
        derived.split = derived.compute_split();
        derived
    }

    /// Root descriptor of a persisted processor state (no upstream)
    pub fn state(kind: DataKind, address: Address, layout: Layout, scale: f32) -> Descriptor {
        Descriptor::new(kind, address, layout).with_scale(scale)
    }

    fn compute_split(&self) -> Vec<Descriptor> {
        if self.kind != DataKind::Vector {
            return Vec::new();
        }
        let component_kind = if self.layout.is_signed() {
            DataKind::SFloat
        } else {
            DataKind::UFloat
        };
        let mut offset = self.layout.sub_offset();
        let mut children = Vec::with_capacity(self.layout.field_sizes().len());
        for &size in self.layout.field_sizes() {
            // Vector layouts are validated on construction, so every view fits
            if let Ok(view) = self.layout.sub_view(offset, vec![size]) {
                children.push(Descriptor {
                    kind: component_kind,
                    address: self.address,
                    layout: view,
                    scale: Some(self.scale()),
                    input: None,
                    split: Vec::new(),
                    parts: Vec::new(),
                });
            }
            offset = offset.saturating_add(size);
        }
        children
    }

    /// Check if this descriptor names an indexed board register
    pub fn is_indexed(&self) -> bool {
        self.address.id != NO_ID
    }
}
