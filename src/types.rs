//! Core data types for boardlink
//!
//! This module contains the wire-level vocabulary shared by every layer:
//! module and register ids, the three-byte [`Address`] that names a data
//! source on the board, and the closed set of decoded value shapes.
//!
//! # Register byte
//!
//! The second byte of every command packs flags above a 6-bit opcode:
//!
//! - bit 7: read request (the board answers on the same register with bit 7 set)
//! - bit 6: silent read (the answer bypasses the default notification path)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder id for registers that are not indexed
pub const NO_ID: u8 = 0xff;

/// Register flag marking a read request
pub const READ_FLAG: u8 = 0x80;

/// Register flag marking a silent read
pub const SILENT_FLAG: u8 = 0x40;

/// Firmware module ids
pub mod module {
    pub const SWITCH: u8 = 0x01;
    pub const LED: u8 = 0x02;
    pub const ACCELEROMETER: u8 = 0x03;
    pub const TEMPERATURE: u8 = 0x04;
    pub const GPIO: u8 = 0x05;
    pub const HAPTIC: u8 = 0x08;
    pub const DATA_PROCESSOR: u8 = 0x09;
    pub const EVENT: u8 = 0x0a;
    pub const LOGGING: u8 = 0x0b;
    pub const TIMER: u8 = 0x0c;
    pub const MACRO: u8 = 0x0f;
    pub const GYRO: u8 = 0x13;
    pub const SENSOR_FUSION: u8 = 0x19;
    pub const DEBUG: u8 = 0xfe;
}

/// Register opcodes of the data processor module
pub mod dp {
    pub const ADD: u8 = 0x02;
    pub const NOTIFY: u8 = 0x03;
    pub const STATE: u8 = 0x04;
    pub const PARAMETER: u8 = 0x05;
    pub const REMOVE: u8 = 0x06;
    pub const NOTIFY_ENABLE: u8 = 0x07;
    pub const REMOVE_ALL: u8 = 0x08;
}

/// Register opcodes of the event module
pub mod event {
    pub const ENTRY: u8 = 0x02;
    pub const CMD_PARAMETERS: u8 = 0x03;
    pub const REMOVE: u8 = 0x04;
    pub const REMOVE_ALL: u8 = 0x05;
}

/// Register opcodes of the macro module
pub mod macros {
    pub const BEGIN: u8 = 0x02;
    pub const ADD_COMMAND: u8 = 0x03;
    pub const END: u8 = 0x04;
    pub const EXECUTE: u8 = 0x05;
    pub const ERASE_ALL: u8 = 0x08;
    pub const ADD_PARTIAL: u8 = 0x09;
}

/// Register of every module's info read
pub const MODULE_INFO: u8 = 0x00;

/// Mark a register as a read request
pub fn read_register(register: u8) -> u8 {
    register | READ_FLAG
}

/// Mark a register as a silent read request
pub fn silent_read_register(register: u8) -> u8 {
    register | READ_FLAG | SILENT_FLAG
}

/// Strip the read flags from a register byte
pub fn opcode(register: u8) -> u8 {
    register & 0x3f
}

/// Wire address of a data source: (module, register, sub-id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub module: u8,
    pub register: u8,
    pub id: u8,
}

impl Address {
    pub const fn new(module: u8, register: u8, id: u8) -> Self {
        Self {
            module,
            register,
            id,
        }
    }

    /// Address of a non-indexed register
    pub const fn unindexed(module: u8, register: u8) -> Self {
        Self::new(module, register, NO_ID)
    }

    /// Output address of the data processor with the given id
    pub const fn processor_output(id: u8) -> Self {
        Self::new(module::DATA_PROCESSOR, dp::NOTIFY, id)
    }

    /// Persisted state address of the data processor with the given id
    pub fn processor_state(id: u8) -> Self {
        Self::new(module::DATA_PROCESSOR, silent_read_register(dp::STATE), id)
    }

    /// Check if this is a data processor notify address
    pub fn is_processor_output(&self) -> bool {
        self.module == module::DATA_PROCESSOR && self.register == dp::NOTIFY
    }

    pub fn has_id(&self) -> bool {
        self.id != NO_ID
    }

    pub fn with_id(self, id: u8) -> Self {
        Self { id, ..self }
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [self.module, self.register, self.id]
    }

    /// Routing key of frames produced at this address
    pub fn key(&self) -> (u8, u8) {
        (self.module, self.register)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}",
            self.module, self.register, self.id
        )
    }
}

/// A decoded board value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    /// Unsigned integer
    Unsigned(u64),
    /// Signed integer
    Signed(i64),
    /// Fixed-point value divided by its scale
    Float(f32),
    /// Single-byte flag
    Bool(bool),
    /// Scaled 2 or 3 component vector
    Vector(Vec<f32>),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// Heterogeneous sub-messages, one per fused source
    Array(Vec<DataValue>),
}

impl DataValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DataValue::Unsigned(v) => Some(*v),
            DataValue::Signed(v) if *v >= 0 => Some(*v as u64),
            DataValue::Bool(b) => Some(*b as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DataValue::Signed(v) => Some(*v),
            DataValue::Unsigned(v) => i64::try_from(*v).ok(),
            DataValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Any scalar as a float
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            DataValue::Float(v) => Some(*v),
            DataValue::Unsigned(v) => Some(*v as f32),
            DataValue::Signed(v) => Some(*v as f32),
            DataValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Bool(b) => Some(*b),
            DataValue::Unsigned(v) => Some(*v != 0),
            DataValue::Signed(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            DataValue::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DataValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[DataValue]> {
        match self {
            DataValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// A decoded value with the time it was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Source of the value
    pub address: Address,
    /// When the frame was received (or logged, for replayed data)
    pub timestamp: DateTime<Utc>,
    pub value: DataValue,
}

/// Revision info a module reports on discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: u8,
    /// Implementation id, `None` if the module is absent on this board
    pub implementation: Option<u8>,
    pub revision: Option<u8>,
    pub extra: Vec<u8>,
}

impl ModuleInfo {
    /// Parse a `[module, 0x80, impl, rev, extra...]` reply
    pub fn from_response(response: &[u8]) -> Option<Self> {
        let id = *response.first()?;
        if response.len() < 4 {
            return Some(Self {
                id,
                implementation: None,
                revision: None,
                extra: Vec::new(),
            });
        }
        Some(Self {
            id,
            implementation: Some(response[2]),
            revision: Some(response[3]),
            extra: response[4..].to_vec(),
        })
    }

    pub fn is_present(&self) -> bool {
        self.implementation.is_some()
    }
}
