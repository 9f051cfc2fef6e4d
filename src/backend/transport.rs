//! Byte channel abstraction
//!
//! The engine does not own the link to the board. Anything that can push a
//! command frame out (BLE characteristic, serial port, a test double) plugs
//! in through [`Transport`]; inbound frames are handed back to
//! [`Session::on_receive`](crate::session::Session::on_receive) by whoever
//! owns the receive side.

use crate::error::Result;

/// Largest single-frame payload the reference firmware accepts
pub const DEFAULT_MAX_FRAME_LEN: usize = 18;

/// Outbound half of the board link
///
/// Implementations must deliver frames in the order `send` is called. They
/// may call back into the session synchronously from inside `send` (a
/// loopback test board does), so the engine never holds a lock across it.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Transmit one command frame
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Maximum command length that fits in one frame
    fn max_frame_len(&self) -> usize {
        DEFAULT_MAX_FRAME_LEN
    }
}

/// Frame rendered as hex for logs
pub fn hex(frame: &[u8]) -> String {
    frame
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("-")
}
