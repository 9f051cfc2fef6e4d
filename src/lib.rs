//! # boardlink: host-side protocol engine for remote sensor boards
//!
//! A sensor board exposes producers (sensor outputs, GPIO pins, processor
//! outputs) addressed by `(module, register, id)`. This crate keeps the
//! host's model of a connected board: what every producer's bytes mean,
//! which processors, events and macros exist on it, and which request each
//! inbound frame answers.
//!
//! ## Architecture
//!
//! - **Descriptors**: [`descriptor::Descriptor`] describes a producer's wire
//!   shape and decodes its frames into [`types::Sample`]s
//! - **Processors**: [`processor::ProcessorCompiler`] derives what an
//!   on-board operator produces; [`processor::ProcessorManager`] creates,
//!   pulls and reconstructs chains
//! - **Recorder**: commands sent while recording become board events or
//!   macros instead of going out
//! - **Backend**: [`backend::Link`] serializes requests per reply key and
//!   times them out; [`backend::Transport`] is the byte-level seam
//! - **Session**: [`Session`] ties one board's state together
//!
//! ## Configuration
//!
//! [`LinkConfig`] holds timeouts and frame limits and round-trips through
//! TOML.
//!
//! ## Example
//!
//! ```ignore
//! use boardlink::{LinkConfig, Session};
//! use boardlink::processor::{OperatorConfig, StageSpec};
//!
//! let config = LinkConfig::load_or_default("boardlink.toml");
//! let session = Arc::new(Session::new(transport, config, Handle::current())?);
//!
//! let chain = session
//!     .commit_chain(vec![
//!         StageSpec::from_source(temperature, OperatorConfig::Average { samples: 8, high_pass: false }),
//!     ])
//!     .await?;
//! let mut samples = session.stream(&chain[0].output)?;
//! while let Some(sample) = samples.recv().await {
//!     println!("{:?}", sample.value);
//! }
//! ```

pub mod backend;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod layout;
pub mod processor;
pub mod recorder;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use backend::{Link, Transport};
pub use config::LinkConfig;
pub use descriptor::{DataKind, DataSlice, Descriptor};
pub use error::{BoardError, Result};
pub use layout::Layout;
pub use session::{Session, SessionSnapshot};
pub use types::{Address, DataValue, ModuleInfo, Sample};
