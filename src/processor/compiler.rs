use super::config::{
    Comparison, ComparisonOutput, DifferentialMode, MathOp, OperatorConfig, PulseMode,
    ThresholdMode,
};
use crate::descriptor::{DataKind, Descriptor};
use crate::error::{BoardError, Result};
use crate::layout::Layout;
use crate::types::{Address, NO_ID};

/// Output and optional persisted-state descriptor of one processor stage
pub type Derivation = (Descriptor, Option<Descriptor>);

/// Derives processor output descriptors from operator configurations
pub struct ProcessorCompiler;

impl ProcessorCompiler {
    /// Compute the descriptors a processor will produce when fed by `input`.
    ///
    /// This is a pure function of its arguments: the board never reports
    /// output geometry, so every width, sign and scale rule here must match
    /// what the firmware does to the frame. Outputs are minted at the
    /// data processor notify/state registers with a placeholder id; the
    /// caller stamps the board-assigned id with [`Descriptor::with_id`].
    ///
    /// # Errors
    /// [`BoardError::UnsupportedDerivation`] when no rule covers the pair
    /// or an operator parameter is outside what the firmware can encode
    /// (packer count 1..=32, accumulator and accounter widths 1..=4).
    /// [`BoardError::Layout`] when the output frame would exceed 255 bytes.
    pub fn derive(input: &Descriptor, op: &OperatorConfig) -> Result<Derivation> {
        let out = Address::processor_output(NO_ID);
        let state = Address::processor_state(NO_ID);
        let layout = input.layout();
        let kind = input.kind();

        let derivation = match op {
            OperatorConfig::Buffer => (
                Descriptor::derived(DataKind::Bytes, input.clone(), out, Layout::empty()),
                Some(Self::state_copy(input, layout.with_zero_offset())),
            ),
            OperatorConfig::Accumulate {
                counter,
                output_size,
            } => {
                if !(1..=4).contains(output_size) {
                    return Err(Self::unsupported(input, op));
                }
                let attrs = Layout::new(
                    vec![*output_size],
                    1,
                    0,
                    !*counter && layout.is_signed(),
                )?;
                if *counter {
                    (
                        Descriptor::derived(DataKind::Uint, input.clone(), out, attrs.clone()),
                        Some(Descriptor::new(DataKind::Uint, state, attrs)),
                    )
                } else {
                    Self::require_scalar(input, op)?;
                    (
                        Self::copy(input, attrs.clone()),
                        Some(Self::state_copy(input, attrs)),
                    )
                }
            }
            OperatorConfig::Average { .. }
            | OperatorConfig::Delay { .. }
            | OperatorConfig::Time { .. } => (Self::copy(input, layout.with_zero_offset()), None),
            OperatorConfig::Passthrough { .. } => (
                Self::copy(input, layout.with_zero_offset()),
                Some(Descriptor::new(
                    DataKind::Uint,
                    state,
                    Layout::scalar(2, false)?,
                )),
            ),
            OperatorConfig::Math { op: math, rhs, .. } => {
                if matches!(kind, DataKind::Bytes | DataKind::Array) {
                    return Err(Self::unsupported(input, op));
                }
                (Self::math(input, *math, *rhs)?, None)
            }
            OperatorConfig::Pulse { mode, .. } => {
                Self::require_numeric(input, op)?;
                let output = match mode {
                    PulseMode::Width => Descriptor::derived(
                        DataKind::Uint,
                        input.clone(),
                        out,
                        Layout::scalar(2, false)?,
                    ),
                    PulseMode::Area => Self::copy(input, layout.with_size(4)?),
                    PulseMode::Peak => Self::copy(input, layout.with_zero_offset()),
                    PulseMode::OnDetect => Descriptor::derived(
                        DataKind::Uint,
                        input.clone(),
                        out,
                        Layout::scalar(1, false)?,
                    ),
                };
                (output, None)
            }
            OperatorConfig::Comparison(comparison) => {
                Self::require_numeric(input, op)?;
                let output = match comparison {
                    Comparison::Multi {
                        mode: ComparisonOutput::PassFail | ComparisonOutput::Zone,
                        ..
                    } => Descriptor::derived(
                        DataKind::Uint,
                        input.clone(),
                        out,
                        Layout::scalar(1, false)?,
                    ),
                    _ => Self::copy(input, layout.with_zero_offset()),
                };
                (output, None)
            }
            OperatorConfig::Threshold { mode, .. } => {
                Self::require_numeric(input, op)?;
                let output = match mode {
                    ThresholdMode::Absolute => Self::copy(input, layout.with_zero_offset()),
                    ThresholdMode::Binary => Self::pass_fail(input)?,
                };
                (output, None)
            }
            OperatorConfig::Differential { mode, .. } => {
                Self::require_numeric(input, op)?;
                let output = match mode {
                    DifferentialMode::Absolute => Self::copy(input, layout.with_zero_offset()),
                    DifferentialMode::Binary => Self::pass_fail(input)?,
                    DifferentialMode::Difference => Self::difference(input, op)?,
                };
                (output, None)
            }
            OperatorConfig::Packer { count } => {
                if !(1..=32).contains(count) {
                    return Err(Self::unsupported(input, op));
                }
                (Self::copy(input, layout.with_repeat(*count)?), None)
            }
            OperatorConfig::Accounter { length, .. } => {
                if !(1..=4).contains(length) {
                    return Err(Self::unsupported(input, op));
                }
                let frame = layout.frame_length();
                let frame = u8::try_from(frame)
                    .map_err(|_| crate::layout::LayoutError::FrameTooLong(frame))?;
                let attrs = Layout::new(vec![*length, frame], 1, 0, layout.is_signed())?;
                (Self::copy(input, attrs), None)
            }
            OperatorConfig::Fuser { sources } => {
                let fused = layout.frame_length()
                    + sources
                        .iter()
                        .map(|s| s.state.layout().frame_length())
                        .sum::<usize>();
                let fused = u8::try_from(fused)
                    .map_err(|_| crate::layout::LayoutError::FrameTooLong(fused))?;
                let mut parts = vec![input.clone()];
                parts.extend(sources.iter().map(|s| s.state.clone()));
                (
                    Descriptor::array(
                        Some(input.clone()),
                        out,
                        Layout::new(vec![fused], 1, 0, false)?,
                        parts,
                    ),
                    None,
                )
            }
            OperatorConfig::Combine { .. } => {
                if kind != DataKind::Vector {
                    return Err(Self::unsupported(input, op));
                }
                let size = layout.first_size();
                (
                    Descriptor::derived(
                        DataKind::UFloat,
                        input.clone(),
                        out,
                        Layout::scalar(size, false)?,
                    ),
                    None,
                )
            }
        };
        Ok(derivation)
    }

    fn math(input: &Descriptor, op: MathOp, rhs: f32) -> Result<Descriptor> {
        let layout = input.layout();
        let out = Address::processor_output(NO_ID);
        let width = layout.first_size();
        let widen_sign = |attrs: Layout| -> (DataKind, Layout) {
            if layout.is_signed() || rhs < 0.0 {
                (input.kind().signed_counterpart(), attrs.with_signed(true))
            } else {
                (input.kind(), attrs)
            }
        };
        let output = match op {
            MathOp::Add => {
                let (kind, attrs) = widen_sign(layout.with_size(4)?);
                Self::copy_as(kind, input, attrs)
            }
            MathOp::Multiply => {
                let size = if rhs.abs() < 1.0 { width } else { 4 };
                let (kind, attrs) = widen_sign(layout.with_size(size)?);
                Self::copy_as(kind, input, attrs)
            }
            MathOp::Divide => {
                let size = if rhs.abs() < 1.0 { 4 } else { width };
                let (kind, attrs) = widen_sign(layout.with_size(size)?);
                Self::copy_as(kind, input, attrs)
            }
            MathOp::Subtract => Self::pass_fail(input)?,
            MathOp::AbsValue => Self::copy_as(
                input.kind().unsigned_counterpart(),
                input,
                layout.with_signed(false),
            ),
            MathOp::Modulus => Self::copy(input, layout.with_zero_offset()),
            MathOp::Exponent => {
                Descriptor::derived(DataKind::Bytes, input.clone(), out, layout.with_size(4)?)
            }
            MathOp::LeftShift => {
                let size = (width as i32 + rhs as i32 / 8).clamp(1, 4) as u8;
                Descriptor::derived(DataKind::Bytes, input.clone(), out, layout.with_size(size)?)
            }
            MathOp::RightShift => {
                let size = (width as i32 - rhs as i32 / 8).max(1) as u8;
                Descriptor::derived(DataKind::Bytes, input.clone(), out, layout.with_size(size)?)
            }
            MathOp::Sqrt => {
                Descriptor::derived(DataKind::Bytes, input.clone(), out, layout.with_signed(false))
            }
            MathOp::Constant => {
                let signed = rhs < 0.0;
                let kind = if signed { DataKind::Int } else { DataKind::Uint };
                Descriptor::derived(kind, input.clone(), out, Layout::scalar(4, signed)?)
            }
        };
        Ok(output)
    }

    /// Differential "difference" output depends on the concrete numeric variant
    fn difference(input: &Descriptor, op: &OperatorConfig) -> Result<Descriptor> {
        let attrs = input.layout().with_signed(true);
        match input.kind() {
            DataKind::Uint | DataKind::Int => Ok(Self::copy_as(DataKind::Int, input, attrs)),
            DataKind::UFloat | DataKind::SFloat => Ok(Self::copy_as(DataKind::SFloat, input, attrs)),
            _ => Err(Self::unsupported(input, op)),
        }
    }

    /// One signed byte: 1 on pass, -1 / 0 on fail
    fn pass_fail(input: &Descriptor) -> Result<Descriptor> {
        Ok(Descriptor::derived(
            DataKind::Int,
            input.clone(),
            Address::processor_output(NO_ID),
            Layout::scalar(1, true)?,
        ))
    }

    fn copy(input: &Descriptor, layout: Layout) -> Descriptor {
        input.reparent(input.clone(), Address::processor_output(NO_ID), layout)
    }

    fn copy_as(kind: DataKind, input: &Descriptor, layout: Layout) -> Descriptor {
        if kind == input.kind() {
            Self::copy(input, layout)
        } else {
            Descriptor::derived(kind, input.clone(), Address::processor_output(NO_ID), layout)
        }
    }

    fn state_copy(input: &Descriptor, layout: Layout) -> Descriptor {
        Descriptor::state(
            input.kind(),
            Address::processor_state(NO_ID),
            layout,
            input.scale(),
        )
    }

    fn require_numeric(input: &Descriptor, op: &OperatorConfig) -> Result<()> {
        match input.kind() {
            DataKind::Bytes | DataKind::Array => Err(Self::unsupported(input, op)),
            _ => Ok(()),
        }
    }

    fn require_scalar(input: &Descriptor, op: &OperatorConfig) -> Result<()> {
        match input.kind() {
            DataKind::Bytes | DataKind::Array | DataKind::Vector => Err(Self::unsupported(input, op)),
            _ => Ok(()),
        }
    }

    fn unsupported(input: &Descriptor, op: &OperatorConfig) -> BoardError {
        BoardError::UnsupportedDerivation {
            kind: input.kind().name(),
            operator: op.name(),
        }
    }
}
