//! Command recording for board-side events and macros
//!
//! While a recording is open, commands that would normally go straight to
//! the board are captured instead. Committing turns the captured commands
//! into event entries ([`event`]) or macro commands ([`macros`]).
//!
//! ```text
//! Idle --begin--> Recording --take--> Idle
//! ```

pub mod event;
pub mod macros;

use crate::descriptor::DataSlice;
use crate::error::{BoardError, Result};
use crate::types::Address;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Copy `source.length` bytes of the trigger payload, starting at
/// `source.offset`, into the recorded command at `dest_offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub source: DataSlice,
    pub dest_offset: u8,
}

impl Feedback {
    /// The two bytes appended to an event entry
    pub fn encode(&self) -> [u8; 2] {
        [
            0x01 | ((self.source.length & 0x7) << 1) | ((self.source.offset & 0xf) << 4),
            self.dest_offset,
        ]
    }
}

/// What the open recording will become
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingTarget {
    /// Commands run whenever `trigger` produces data
    Event {
        trigger: Address,
        feedback: Option<Feedback>,
    },
    /// Commands stored as a macro
    Macro { auto_run: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Recording(RecordingTarget),
}

/// Capture buffer plus its Idle/Recording state
#[derive(Debug)]
pub struct CommandRecorder {
    state: State,
    buffer: Vec<Vec<u8>>,
}

impl Default for CommandRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRecorder {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            buffer: Vec::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, State::Recording(_))
    }

    /// Clear the buffer and start capturing
    pub fn begin(&mut self, target: RecordingTarget) -> Result<()> {
        if let State::Recording(current) = &self.state {
            return Err(BoardError::Recorder(format!(
                "already recording {:?}",
                current
            )));
        }
        debug!("recording started for {:?}", target);
        self.buffer.clear();
        self.state = State::Recording(target);
        Ok(())
    }

    /// Capture `frame` if recording. Returns `false` when it should be sent.
    pub fn capture(&mut self, frame: &[u8]) -> bool {
        if !self.is_recording() {
            return false;
        }
        self.buffer.push(frame.to_vec());
        true
    }

    /// Close the recording and hand back what was captured
    pub fn take(&mut self) -> Result<(RecordingTarget, Vec<Vec<u8>>)> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => Err(BoardError::Recorder("no recording in progress".into())),
            State::Recording(target) => Ok((target, std::mem::take(&mut self.buffer))),
        }
    }

    /// Drop the recording without committing it
    pub fn abort(&mut self) {
        self.state = State::Idle;
        self.buffer.clear();
    }

    pub fn captured(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_does_not_capture() {
        let mut recorder = CommandRecorder::new();
        assert!(!recorder.capture(&[0x02, 0x03, 0x01]));
        assert_eq!(recorder.captured(), 0);
    }

    #[test]
    fn test_capture_preserves_order() {
        let mut recorder = CommandRecorder::new();
        recorder.begin(RecordingTarget::Macro { auto_run: true }).unwrap();
        assert!(recorder.capture(&[0x02, 0x03, 0x01]));
        assert!(recorder.capture(&[0x08, 0x01, 0x02]));
        let (target, commands) = recorder.take().unwrap();
        assert_eq!(target, RecordingTarget::Macro { auto_run: true });
        assert_eq!(commands, vec![vec![0x02, 0x03, 0x01], vec![0x08, 0x01, 0x02]]);
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_begin_twice_rejected() {
        let mut recorder = CommandRecorder::new();
        recorder.begin(RecordingTarget::Macro { auto_run: false }).unwrap();
        assert!(matches!(
            recorder.begin(RecordingTarget::Macro { auto_run: false }),
            Err(BoardError::Recorder(_))
        ));
    }

    #[test]
    fn test_take_when_idle_rejected() {
        let mut recorder = CommandRecorder::new();
        assert!(recorder.take().is_err());
    }

    #[test]
    fn test_begin_clears_aborted_buffer() {
        let mut recorder = CommandRecorder::new();
        recorder.begin(RecordingTarget::Macro { auto_run: false }).unwrap();
        recorder.capture(&[0x01, 0x02]);
        recorder.abort();
        recorder.begin(RecordingTarget::Macro { auto_run: false }).unwrap();
        assert_eq!(recorder.captured(), 0);
    }

    #[test]
    fn test_feedback_encoding() {
        let feedback = Feedback {
            source: DataSlice {
                address: Address::processor_output(1),
                offset: 2,
                length: 2,
            },
            dest_offset: 3,
        };
        assert_eq!(feedback.encode(), [0x01 | (2 << 1) | (2 << 4), 3]);
    }
}
