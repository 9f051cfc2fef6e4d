//! Operator configurations and their firmware encodings
//!
//! Each [`OperatorConfig`] variant is one kind of on-board processor. The
//! host never runs these computations; it only needs to serialize them into
//! the bytes the firmware expects (`encode`) and, after a reconnect, turn
//! pulled bytes back into a config (`parse`).
//!
//! Encodings pack widths and flags into the first byte after the operator
//! id. Width fields are always `(size - 1)` masked to the bits the firmware
//! reads, so oversized inputs wrap exactly as they do on the board.

use crate::descriptor::Descriptor;
use crate::error::{BoardError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Firmware ids of each operator
pub mod id {
    pub const PASSTHROUGH: u8 = 0x01;
    pub const ACCUMULATOR: u8 = 0x02;
    pub const AVERAGE: u8 = 0x03;
    pub const COMPARISON: u8 = 0x06;
    pub const COMBINER: u8 = 0x07;
    pub const TIME: u8 = 0x08;
    pub const MATH: u8 = 0x09;
    pub const DELAY: u8 = 0x0a;
    pub const PULSE: u8 = 0x0b;
    pub const DIFFERENTIAL: u8 = 0x0c;
    pub const THRESHOLD: u8 = 0x0d;
    pub const BUFFER: u8 = 0x0f;
    pub const PACKER: u8 = 0x10;
    pub const ACCOUNTER: u8 = 0x11;
    pub const FUSER: u8 = 0x1b;
}

/// Prescale byte the firmware expects after an accounter config
const ACCOUNTER_PRESCALE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassthroughMode {
    All = 0,
    Conditional = 1,
    Count = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeMode {
    Absolute = 0,
    Differential = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathOp {
    Add = 1,
    Multiply = 2,
    Divide = 3,
    Modulus = 4,
    Exponent = 5,
    Sqrt = 6,
    LeftShift = 7,
    RightShift = 8,
    Subtract = 9,
    AbsValue = 10,
    Constant = 11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PulseMode {
    Width = 0,
    Area = 1,
    Peak = 2,
    OnDetect = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq = 0,
    Neq = 1,
    Lt = 2,
    Lte = 3,
    Gt = 4,
    Gte = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOutput {
    /// Input value when the comparison passes
    Absolute = 0,
    /// Reference value that matched
    Reference = 1,
    /// Index of the matching reference
    Zone = 2,
    /// 1 on pass, 0 on fail
    PassFail = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdMode {
    Absolute = 0,
    Binary = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DifferentialMode {
    Absolute = 0,
    Difference = 1,
    Binary = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccounterMode {
    Count = 0,
    Time = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombineMode {
    Rms = 0,
    Rss = 1,
}

/// Comparison processor variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Comparison {
    Single {
        op: ComparisonOp,
        reference: f32,
    },
    Multi {
        op: ComparisonOp,
        mode: ComparisonOutput,
        references: Vec<f32>,
    },
}

/// A persisted-state source joined by a fuser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSource {
    /// Board id of the buffer processor
    pub id: u8,
    /// State descriptor of that processor
    pub state: Descriptor,
}

/// Configuration of one processor stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperatorConfig {
    Passthrough { mode: PassthroughMode, count: u16 },
    Accumulate { counter: bool, output_size: u8 },
    Average { samples: u8, high_pass: bool },
    Delay { samples: u8 },
    Time { mode: TimeMode, period_ms: u32 },
    Buffer,
    Math { op: MathOp, rhs: f32, multi_channel: bool },
    Pulse { mode: PulseMode, threshold: f32, width: u16 },
    Comparison(Comparison),
    Threshold { mode: ThresholdMode, boundary: f32, hysteresis: f32 },
    Differential { mode: DifferentialMode, distance: f32 },
    Packer { count: u8 },
    Accounter { mode: AccounterMode, length: u8 },
    Fuser { sources: Vec<FusedSource> },
    Combine { mode: CombineMode },
}

impl OperatorConfig {
    /// Human-readable operator name
    pub fn name(&self) -> String {
        match self {
            OperatorConfig::Passthrough { .. } => "passthrough".into(),
            OperatorConfig::Accumulate { counter: true, .. } => "counter".into(),
            OperatorConfig::Accumulate { .. } => "accumulate".into(),
            OperatorConfig::Average { .. } => "average".into(),
            OperatorConfig::Delay { .. } => "delay".into(),
            OperatorConfig::Time { .. } => "time".into(),
            OperatorConfig::Buffer => "buffer".into(),
            OperatorConfig::Math { op, .. } => format!("math.{:?}", op).to_lowercase(),
            OperatorConfig::Pulse { mode, .. } => format!("pulse.{:?}", mode).to_lowercase(),
            OperatorConfig::Comparison(Comparison::Single { .. }) => "comparison.single".into(),
            OperatorConfig::Comparison(Comparison::Multi { mode, .. }) => {
                format!("comparison.multi.{:?}", mode).to_lowercase()
            }
            OperatorConfig::Threshold { mode, .. } => format!("threshold.{:?}", mode).to_lowercase(),
            OperatorConfig::Differential { mode, .. } => {
                format!("differential.{:?}", mode).to_lowercase()
            }
            OperatorConfig::Packer { .. } => "packer".into(),
            OperatorConfig::Accounter { .. } => "accounter".into(),
            OperatorConfig::Fuser { .. } => "fuser".into(),
            OperatorConfig::Combine { mode } => format!("combine.{:?}", mode).to_lowercase(),
        }
    }

    /// Serialize into the operator bytes that follow the frame descriptor
    /// byte in a processor create command.
    ///
    /// `output` is the descriptor the compiler derived for this stage; its
    /// width and sign feed the encoding of width-changing operators.
    pub fn encode(&self, input: &Descriptor, output: &Descriptor) -> Vec<u8> {
        let layout = input.layout();
        let frame = u8::try_from(layout.frame_length()).unwrap_or(u8::MAX).max(1);
        let size = layout.first_size().max(1);
        let signed = layout.is_signed() as u8;
        match self {
            OperatorConfig::Passthrough { mode, count } => {
                let [lo, hi] = count.to_le_bytes();
                vec![id::PASSTHROUGH, *mode as u8, lo, hi]
            }
            OperatorConfig::Accumulate {
                counter,
                output_size,
            } => vec![
                id::ACCUMULATOR,
                ((output_size.wrapping_sub(1)) & 0x3)
                    | (((frame - 1) & 0x3) << 2)
                    | ((*counter as u8) << 4),
            ],
            OperatorConfig::Average { samples, high_pass } => {
                let values = layout.field_sizes().len().max(1) * layout.repeat_count().max(1) as usize;
                let count = u8::try_from(values).unwrap_or(u8::MAX);
                vec![
                    id::AVERAGE,
                    ((size - 1) & 0x3)
                        | (((size - 1) & 0x3) << 2)
                        | (((count - 1) & 0x3) << 4)
                        | (signed << 6)
                        | ((*high_pass as u8) << 7),
                    *samples,
                ]
            }
            OperatorConfig::Delay { samples } => vec![id::DELAY, (frame - 1) & 0x0f, *samples],
            OperatorConfig::Time { mode, period_ms } => {
                let mut bytes = vec![id::TIME, ((frame - 1) & 0x7) | ((*mode as u8) << 3)];
                bytes.extend_from_slice(&period_ms.to_le_bytes());
                bytes
            }
            OperatorConfig::Buffer => vec![id::BUFFER, (frame - 1) & 0x1f],
            OperatorConfig::Math {
                op,
                rhs,
                multi_channel,
            } => {
                let out_size = output.layout().first_size().max(1);
                let (wire_op, wire_rhs) = math_wire_operand(input, *op, *rhs);
                let channels = if *multi_channel {
                    (layout.field_sizes().len().max(1) - 1) as u8
                } else {
                    0
                };
                let mut bytes = vec![
                    id::MATH,
                    ((out_size - 1) & 0x3)
                        | (((size - 1) & 0x3) << 2)
                        | ((output.layout().is_signed() as u8) << 4),
                    wire_op as u8,
                ];
                bytes.extend_from_slice(&wire_rhs.to_le_bytes());
                bytes.push(channels);
                bytes
            }
            OperatorConfig::Pulse {
                mode,
                threshold,
                width,
            } => {
                let mut bytes = vec![id::PULSE, frame - 1, 0x00, *mode as u8];
                bytes.extend_from_slice(&(input.to_wire(*threshold) as i32).to_le_bytes());
                bytes.extend_from_slice(&width.to_le_bytes());
                bytes
            }
            OperatorConfig::Comparison(Comparison::Single { op, reference }) => {
                let mut bytes = vec![id::COMPARISON, signed, *op as u8, 0x00];
                bytes.extend_from_slice(&(input.to_wire(*reference) as i32).to_le_bytes());
                bytes
            }
            OperatorConfig::Comparison(Comparison::Multi {
                op,
                mode,
                references,
            }) => {
                let mut bytes = vec![
                    id::COMPARISON,
                    signed | (((size - 1) & 0x3) << 1) | ((*op as u8 & 0x7) << 3) | ((*mode as u8) << 6),
                ];
                for reference in references {
                    bytes.extend_from_slice(&input.to_wire_bytes(*reference, size as usize));
                }
                bytes
            }
            OperatorConfig::Threshold {
                mode,
                boundary,
                hysteresis,
            } => {
                let mut bytes = vec![
                    id::THRESHOLD,
                    ((frame - 1) & 0x3) | (signed << 2) | ((*mode as u8) << 3),
                ];
                bytes.extend_from_slice(&(input.to_wire(*boundary) as i32).to_le_bytes());
                bytes.extend_from_slice(&(input.to_wire(*hysteresis) as u16).to_le_bytes());
                bytes
            }
            OperatorConfig::Differential { mode, distance } => {
                let mut bytes = vec![
                    id::DIFFERENTIAL,
                    ((frame - 1) & 0x3) | (signed << 2) | ((*mode as u8) << 3),
                ];
                bytes.extend_from_slice(&(input.to_wire(*distance) as i32).to_le_bytes());
                bytes
            }
            OperatorConfig::Packer { count } => vec![
                id::PACKER,
                (frame - 1) & 0x1f,
                count.wrapping_sub(1) & 0x1f,
            ],
            OperatorConfig::Accounter { mode, length } => vec![
                id::ACCOUNTER,
                (*mode as u8) | ((length.wrapping_sub(1) & 0x3) << 4),
                ACCOUNTER_PRESCALE,
            ],
            OperatorConfig::Fuser { sources } => {
                let mut bytes = vec![id::FUSER, sources.len() as u8];
                bytes.extend(sources.iter().map(|s| s.id));
                bytes
            }
            OperatorConfig::Combine { mode } => {
                let count = layout.field_sizes().len().max(1) as u8;
                vec![
                    id::COMBINER,
                    ((size - 1) & 0x3)
                        | (((size - 1) & 0x3) << 2)
                        | (((count - 1) & 0x3) << 4)
                        | (signed << 6),
                    *mode as u8,
                ]
            }
        }
    }

    /// Rebuild a config from operator bytes pulled off the board.
    ///
    /// `input` converts firmware units back into host values; `fused_state`
    /// resolves the state descriptor of a processor id referenced by a fuser.
    pub fn parse(
        bytes: &[u8],
        input: &Descriptor,
        fused_state: &dyn Fn(u8) -> Option<Descriptor>,
    ) -> Result<OperatorConfig> {
        let short = || BoardError::Protocol(format!("operator bytes too short: {:02x?}", bytes));
        let byte = |i: usize| bytes.get(i).copied().ok_or_else(short);
        let i32_at = |i: usize| -> Result<i32> {
            let b = bytes.get(i..i + 4).ok_or_else(short)?;
            Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };
        let u16_at = |i: usize| -> Result<u16> {
            let b = bytes.get(i..i + 2).ok_or_else(short)?;
            Ok(u16::from_le_bytes([b[0], b[1]]))
        };
        let from_wire = |v: i64| -> f32 {
            if input.kind().is_float() {
                v as f32 / input.scale()
            } else {
                v as f32
            }
        };

        let config = match byte(0)? {
            id::PASSTHROUGH => OperatorConfig::Passthrough {
                mode: match byte(1)? {
                    0 => PassthroughMode::All,
                    1 => PassthroughMode::Conditional,
                    _ => PassthroughMode::Count,
                },
                count: u16_at(2)?,
            },
            id::ACCUMULATOR => {
                let b = byte(1)?;
                OperatorConfig::Accumulate {
                    counter: b & 0x10 != 0,
                    output_size: (b & 0x3) + 1,
                }
            }
            id::AVERAGE => OperatorConfig::Average {
                samples: byte(2)?,
                high_pass: byte(1)? & 0x80 != 0,
            },
            id::DELAY => OperatorConfig::Delay { samples: byte(2)? },
            id::TIME => {
                let b = bytes.get(2..6).ok_or_else(short)?;
                OperatorConfig::Time {
                    mode: if (byte(1)? >> 3) & 0x1 == 0 {
                        TimeMode::Absolute
                    } else {
                        TimeMode::Differential
                    },
                    period_ms: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                }
            }
            id::BUFFER => OperatorConfig::Buffer,
            id::MATH => {
                let op = math_op_from(byte(2)?).ok_or_else(short)?;
                let rhs = i32_at(3)? as i64;
                let value = match op {
                    MathOp::Multiply | MathOp::Divide | MathOp::LeftShift | MathOp::RightShift => {
                        rhs as f32
                    }
                    _ => from_wire(rhs),
                };
                OperatorConfig::Math {
                    op,
                    rhs: value,
                    multi_channel: byte(7).unwrap_or(0) != 0,
                }
            }
            id::PULSE => OperatorConfig::Pulse {
                mode: match byte(3)? {
                    0 => PulseMode::Width,
                    1 => PulseMode::Area,
                    2 => PulseMode::Peak,
                    _ => PulseMode::OnDetect,
                },
                threshold: from_wire(i32_at(4)? as i64),
                width: u16_at(8)?,
            },
            id::COMPARISON => {
                if bytes.len() == 8 && byte(3)? == 0 && byte(1)? <= 1 {
                    OperatorConfig::Comparison(Comparison::Single {
                        op: comparison_op_from(byte(2)?),
                        reference: from_wire(i32_at(4)? as i64),
                    })
                } else {
                    let b = byte(1)?;
                    let signed = b & 0x1 != 0;
                    let width = (((b >> 1) & 0x3) + 1) as usize;
                    let references = bytes[2..]
                        .chunks(width)
                        .map(|chunk| from_wire(crate::descriptor::widen(chunk, width, signed)))
                        .collect();
                    OperatorConfig::Comparison(Comparison::Multi {
                        op: comparison_op_from((b >> 3) & 0x7),
                        mode: match (b >> 6) & 0x3 {
                            0 => ComparisonOutput::Absolute,
                            1 => ComparisonOutput::Reference,
                            2 => ComparisonOutput::Zone,
                            _ => ComparisonOutput::PassFail,
                        },
                        references,
                    })
                }
            }
            id::THRESHOLD => OperatorConfig::Threshold {
                mode: if (byte(1)? >> 3) & 0x1 == 0 {
                    ThresholdMode::Absolute
                } else {
                    ThresholdMode::Binary
                },
                boundary: from_wire(i32_at(2)? as i64),
                hysteresis: from_wire(u16_at(6)? as i64),
            },
            id::DIFFERENTIAL => OperatorConfig::Differential {
                mode: match (byte(1)? >> 3) & 0x3 {
                    0 => DifferentialMode::Absolute,
                    1 => DifferentialMode::Difference,
                    _ => DifferentialMode::Binary,
                },
                distance: from_wire(i32_at(2)? as i64),
            },
            id::PACKER => OperatorConfig::Packer {
                count: (byte(2)? & 0x1f) + 1,
            },
            id::ACCOUNTER => {
                let b = byte(1)?;
                OperatorConfig::Accounter {
                    mode: if b & 0x3 == 0 {
                        AccounterMode::Count
                    } else {
                        AccounterMode::Time
                    },
                    length: ((b >> 4) & 0x3) + 1,
                }
            }
            id::FUSER => {
                let count = byte(1)? as usize;
                let ids = bytes.get(2..2 + count).ok_or_else(short)?;
                let sources = ids
                    .iter()
                    .map(|&id| {
                        fused_state(id)
                            .map(|state| FusedSource { id, state })
                            .ok_or_else(|| BoardError::UnknownProcessor(format!("fused id {}", id)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                OperatorConfig::Fuser { sources }
            }
            id::COMBINER => OperatorConfig::Combine {
                mode: if byte(2)? == 0 {
                    CombineMode::Rms
                } else {
                    CombineMode::Rss
                },
            },
            other => {
                return Err(BoardError::Protocol(format!(
                    "unknown operator id 0x{:02x}",
                    other
                )))
            }
        };
        Ok(config)
    }
}

impl fmt::Display for OperatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Operator and operand actually sent for a math stage.
///
/// The firmware only multiplies and divides by integers, so a fractional
/// multiplier is sent as a division by its reciprocal and vice versa.
fn math_wire_operand(input: &Descriptor, op: MathOp, rhs: f32) -> (MathOp, i32) {
    match op {
        MathOp::Multiply if rhs.abs() < 1.0 && rhs != 0.0 => (MathOp::Divide, (1.0 / rhs) as i32),
        MathOp::Divide if rhs.abs() < 1.0 && rhs != 0.0 => (MathOp::Multiply, (1.0 / rhs) as i32),
        MathOp::Multiply | MathOp::Divide | MathOp::LeftShift | MathOp::RightShift => (op, rhs as i32),
        _ => (op, input.to_wire(rhs) as i32),
    }
}

fn math_op_from(code: u8) -> Option<MathOp> {
    Some(match code {
        1 => MathOp::Add,
        2 => MathOp::Multiply,
        3 => MathOp::Divide,
        4 => MathOp::Modulus,
        5 => MathOp::Exponent,
        6 => MathOp::Sqrt,
        7 => MathOp::LeftShift,
        8 => MathOp::RightShift,
        9 => MathOp::Subtract,
        10 => MathOp::AbsValue,
        11 => MathOp::Constant,
        _ => return None,
    })
}

fn comparison_op_from(code: u8) -> ComparisonOp {
    match code {
        0 => ComparisonOp::Eq,
        1 => ComparisonOp::Neq,
        2 => ComparisonOp::Lt,
        3 => ComparisonOp::Lte,
        4 => ComparisonOp::Gt,
        _ => ComparisonOp::Gte,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{module, Address};

    fn temp() -> Descriptor {
        Descriptor::float(Address::new(module::TEMPERATURE, 0x01, 0), 2, true, 8.0).unwrap()
    }

    fn adc() -> Descriptor {
        Descriptor::uint(Address::new(module::GPIO, 0x07, 0), 2).unwrap()
    }

    fn no_fused(_: u8) -> Option<Descriptor> {
        None
    }

    #[test]
    fn test_counter_encoding() {
        let out = Descriptor::uint(Address::processor_output(0xff), 4).unwrap();
        let config = OperatorConfig::Accumulate {
            counter: true,
            output_size: 4,
        };
        assert_eq!(config.encode(&adc(), &out), vec![0x02, 0x03 | (0x1 << 2) | 0x10]);
    }

    #[test]
    fn test_packer_encoding_at_limits() {
        let config = OperatorConfig::Packer { count: 32 };
        let out = Descriptor::uint(Address::processor_output(0xff), 2).unwrap();
        assert_eq!(config.encode(&adc(), &out), vec![id::PACKER, 0x01, 0x1f]);

        let empty = Descriptor::derived(
            crate::descriptor::DataKind::Bytes,
            adc(),
            Address::processor_output(0xff),
            crate::layout::Layout::empty(),
        );
        assert_eq!(config.encode(&empty, &out), vec![id::PACKER, 0x00, 0x1f]);
    }

    #[test]
    fn test_comparison_reference_is_scaled() {
        let config = OperatorConfig::Comparison(Comparison::Single {
            op: ComparisonOp::Gt,
            reference: 25.0,
        });
        let bytes = config.encode(&temp(), &temp());
        assert_eq!(bytes, vec![0x06, 0x01, 0x04, 0x00, 200, 0, 0, 0]);
    }

    #[test]
    fn test_fractional_multiply_becomes_divide() {
        let config = OperatorConfig::Math {
            op: MathOp::Multiply,
            rhs: 0.25,
            multi_channel: false,
        };
        let bytes = config.encode(&adc(), &adc());
        assert_eq!(bytes[2], MathOp::Divide as u8);
        assert_eq!(&bytes[3..7], &4i32.to_le_bytes());
    }

    #[test]
    fn test_parse_round_trips_threshold() {
        let config = OperatorConfig::Threshold {
            mode: ThresholdMode::Binary,
            boundary: 30.0,
            hysteresis: 0.5,
        };
        let bytes = config.encode(&temp(), &temp());
        let parsed = OperatorConfig::parse(&bytes, &temp(), &no_fused).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_parse_multi_comparison() {
        let config = OperatorConfig::Comparison(Comparison::Multi {
            op: ComparisonOp::Lt,
            mode: ComparisonOutput::Zone,
            references: vec![100.0, 200.0, 300.0],
        });
        let bytes = config.encode(&adc(), &adc());
        let parsed = OperatorConfig::parse(&bytes, &adc(), &no_fused).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_parse_unknown_operator() {
        let err = OperatorConfig::parse(&[0x55, 0x00], &adc(), &no_fused).unwrap_err();
        assert!(matches!(err, BoardError::Protocol(_)));
    }

    #[test]
    fn test_parse_fuser_requires_known_states() {
        let err = OperatorConfig::parse(&[id::FUSER, 1, 4], &adc(), &no_fused).unwrap_err();
        assert!(matches!(err, BoardError::UnknownProcessor(_)));
    }
}
