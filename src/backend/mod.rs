//! Board link plumbing
//!
//! # Components
//!
//! - [`Transport`] - Outbound byte channel implemented by the host application
//! - [`Correlator`] - FIFO matcher pairing requests with board echoes
//! - [`Link`] - Transport + per-key correlators + command recorder
//! - [`MockBoard`] - Simulated firmware for testing without hardware (feature-gated)

pub mod correlator;
pub mod link;
#[cfg(any(test, feature = "mock-board"))]
pub mod mock_board;
pub mod transport;

pub use correlator::{Correlator, Deferred};
pub use link::{Link, ReplyKey};
#[cfg(any(test, feature = "mock-board"))]
pub use mock_board::MockBoard;
pub use transport::{Transport, DEFAULT_MAX_FRAME_LEN};
