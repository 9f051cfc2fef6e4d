//! On-board data processors
//!
//! - [`config`] - Operator configurations and their firmware byte encodings
//! - [`compiler`] - Derives the output descriptors a processor will produce
//! - [`manager`] - Creates, removes, pulls and reconstructs processor chains

pub mod compiler;
pub mod config;
pub mod manager;

pub use compiler::ProcessorCompiler;
pub use config::OperatorConfig;
pub use manager::{ChainEntry, Processor, ProcessorManager, ProcessorTable, StageSpec, Upstream};
