//! Simulated board firmware for testing without hardware
//!
//! [`MockBoard`] implements [`Transport`] and answers commands the way the
//! firmware does: processor creates are echoed with a fresh id, config reads
//! return the stored create bytes, event entries are echoed once their
//! parameters arrive, and macro begins return a macro id. Replies are
//! delivered synchronously from inside `send`, through the sink installed
//! with [`MockBoard::attach`].
//!
//! Failure injection:
//!
//! - [`MockBoard::drop_create`] - the n-th processor create never gets a reply
//! - [`MockBoard::drop_event`] - the n-th event entry never gets a reply
//! - [`MockBoard::set_silent`] - no replies at all
//!
//! # Enabling
//!
//! Compiled for unit tests, or for downstream crates with the `mock-board`
//! feature.

use super::transport::{hex, Transport, DEFAULT_MAX_FRAME_LEN};
use crate::error::{BoardError, Result};
use crate::types::{dp, event, macros, module, opcode, MODULE_INFO, NO_ID, READ_FLAG};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

type Sink = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Default)]
struct Firmware {
    sent: Vec<Vec<u8>>,
    /// Processor id -> create bytes after the `[DP, ADD]` header
    processors: BTreeMap<u8, Vec<u8>>,
    states: HashMap<u8, Vec<u8>>,
    next_processor: u8,
    creates_seen: usize,
    drop_create_at: Option<usize>,
    /// Event id -> (entry bytes, parameter bytes)
    events: BTreeMap<u8, (Vec<u8>, Vec<u8>)>,
    pending_entry: Option<Vec<u8>>,
    next_event: u8,
    entries_seen: usize,
    drop_event_at: Option<usize>,
    /// Macro id -> stored commands, reassembled from partial frames
    macros: BTreeMap<u8, Vec<Vec<u8>>>,
    recording_macro: Option<u8>,
    partial: Option<Vec<u8>>,
    next_macro: u8,
    executed: Vec<u8>,
    modules: HashMap<u8, Vec<u8>>,
    /// (module, register opcode, id) -> current value
    registers: HashMap<(u8, u8, u8), Vec<u8>>,
    notify_enabled: HashMap<u8, bool>,
    silent: bool,
    /// Frames to this (module, register) fail to send
    rejected: Option<(u8, u8)>,
}

/// In-process board double
pub struct MockBoard {
    firmware: Mutex<Firmware>,
    sink: Mutex<Option<Sink>>,
    max_frame_len: usize,
}

impl Default for MockBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBoard {
    /// A board with no modules, processors, events or macros
    pub fn new() -> Self {
        Self {
            firmware: Mutex::new(Firmware::default()),
            sink: Mutex::new(None),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Install the receiver of board-to-host frames
    pub fn attach<F>(&self, sink: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.lock_sink() = Some(Arc::new(sink));
    }

    /// Report `info` bytes (implementation, revision, extra) for a module
    pub fn add_module(&self, module: u8, info: &[u8]) {
        self.lock().modules.insert(module, info.to_vec());
    }

    /// Set the value returned by reads of an address
    pub fn set_register(&self, module: u8, register: u8, id: u8, value: &[u8]) {
        self.lock()
            .registers
            .insert((module, opcode(register), id), value.to_vec());
    }

    /// Skip the reply to the `n`-th processor create from now (1-based)
    pub fn drop_create(&self, n: usize) {
        let mut fw = self.lock();
        fw.drop_create_at = Some(fw.creates_seen + n);
    }

    /// Skip the reply to the `n`-th event entry from now (1-based)
    pub fn drop_event(&self, n: usize) {
        let mut fw = self.lock();
        fw.drop_event_at = Some(fw.entries_seen + n);
    }

    /// Fail every send to `(module, register)` as a transport error
    pub fn reject_frames_to(&self, module: u8, register: u8) {
        self.lock().rejected = Some((module, register));
    }

    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Deliver a frame as if the board had produced it
    pub fn emit(&self, frame: &[u8]) {
        let sink = self.lock_sink().clone();
        if let Some(sink) = sink {
            sink(frame);
        }
    }

    /// Every frame received so far, in order
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// Frames received so far whose first two bytes match
    pub fn sent_to(&self, module: u8, register: u8) -> Vec<Vec<u8>> {
        self.lock()
            .sent
            .iter()
            .filter(|f| f.len() >= 2 && f[0] == module && f[1] == register)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    /// Ids of processors currently on the board
    pub fn processor_ids(&self) -> Vec<u8> {
        self.lock().processors.keys().copied().collect()
    }

    pub fn event_ids(&self) -> Vec<u8> {
        self.lock().events.keys().copied().collect()
    }

    /// Commands stored under a macro id
    pub fn macro_commands(&self, id: u8) -> Option<Vec<Vec<u8>>> {
        self.lock().macros.get(&id).cloned()
    }

    pub fn executed_macros(&self) -> Vec<u8> {
        self.lock().executed.clone()
    }

    pub fn is_notify_enabled(&self, id: u8) -> bool {
        self.lock().notify_enabled.get(&id).copied().unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, Firmware> {
        self.firmware
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_sink(&self) -> MutexGuard<'_, Option<Sink>> {
        self.sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Firmware {
    /// Apply one command and return the frames the board answers with
    fn handle(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let (m, reg) = (frame[0], frame[1]);
        let payload = frame.get(2..).unwrap_or(&[]);
        let is_read = reg & READ_FLAG != 0;
        let op = opcode(reg);

        match (m, op, is_read) {
            (_, MODULE_INFO, true) => {
                let mut reply = vec![m, reg];
                if let Some(info) = self.modules.get(&m) {
                    reply.extend_from_slice(info);
                }
                vec![reply]
            }
            (module::DATA_PROCESSOR, dp::ADD, false) => self.create_processor(payload),
            (module::DATA_PROCESSOR, dp::ADD, true) => {
                let id = payload.first().copied().unwrap_or(0);
                match self.processors.get(&id) {
                    Some(config) => {
                        let mut reply = vec![m, reg];
                        reply.extend_from_slice(config);
                        vec![reply]
                    }
                    None => Vec::new(),
                }
            }
            (module::DATA_PROCESSOR, dp::STATE, true) => {
                let id = payload.first().copied().unwrap_or(0);
                let mut reply = vec![m, reg, id];
                reply.extend(self.states.get(&id).cloned().unwrap_or_default());
                vec![reply]
            }
            (module::DATA_PROCESSOR, dp::STATE, false) => {
                if let Some((&id, value)) = payload.split_first() {
                    self.states.insert(id, value.to_vec());
                }
                Vec::new()
            }
            (module::DATA_PROCESSOR, dp::PARAMETER, false) => {
                if let Some((&id, operator)) = payload.split_first() {
                    if let Some(config) = self.processors.get_mut(&id) {
                        // Source (3) + frame descriptor (1) stay, operator bytes change
                        config.truncate(4);
                        config.extend_from_slice(operator);
                    }
                }
                Vec::new()
            }
            (module::DATA_PROCESSOR, dp::REMOVE, false) => {
                if let Some(id) = payload.first() {
                    self.processors.remove(id);
                    self.states.remove(id);
                }
                Vec::new()
            }
            (module::DATA_PROCESSOR, dp::REMOVE_ALL, false) => {
                self.processors.clear();
                self.states.clear();
                Vec::new()
            }
            (module::DATA_PROCESSOR, dp::NOTIFY_ENABLE, false) => {
                if let [id, enable, ..] = payload {
                    self.notify_enabled.insert(*id, *enable != 0);
                }
                Vec::new()
            }
            (module::EVENT, event::ENTRY, false) => {
                self.pending_entry = Some(payload.to_vec());
                Vec::new()
            }
            (module::EVENT, event::CMD_PARAMETERS, false) => self.finish_event(payload),
            (module::EVENT, event::REMOVE, false) => {
                if let Some(id) = payload.first() {
                    self.events.remove(id);
                }
                Vec::new()
            }
            (module::EVENT, event::REMOVE_ALL, false) => {
                self.events.clear();
                Vec::new()
            }
            (module::MACRO, macros::BEGIN, false) => {
                let id = self.next_macro;
                self.next_macro = self.next_macro.wrapping_add(1);
                self.macros.insert(id, Vec::new());
                self.recording_macro = Some(id);
                vec![vec![m, reg, id]]
            }
            (module::MACRO, macros::ADD_PARTIAL, false) => {
                self.partial = Some(payload.to_vec());
                Vec::new()
            }
            (module::MACRO, macros::ADD_COMMAND, false) => {
                let mut command = self.partial.take().unwrap_or_default();
                command.extend_from_slice(payload);
                if let Some(commands) = self
                    .recording_macro
                    .and_then(|id| self.macros.get_mut(&id))
                {
                    commands.push(command);
                }
                Vec::new()
            }
            (module::MACRO, macros::END, false) => {
                self.recording_macro = None;
                Vec::new()
            }
            (module::MACRO, macros::EXECUTE, false) => {
                if let Some(&id) = payload.first() {
                    self.executed.push(id);
                }
                Vec::new()
            }
            (module::MACRO, macros::ERASE_ALL, false) => {
                self.macros.clear();
                Vec::new()
            }
            (_, _, true) => {
                let id = payload.first().copied();
                let key = (m, op, id.unwrap_or(NO_ID));
                match self.registers.get(&key) {
                    Some(value) => {
                        let mut reply = vec![m, reg];
                        reply.extend(id);
                        reply.extend_from_slice(value);
                        vec![reply]
                    }
                    None => Vec::new(),
                }
            }
            (_, _, false) => {
                // Plain write: [module, register, id?, value...]. Remember it
                // under both readings so either kind of later read finds it.
                self.registers
                    .insert((m, op, NO_ID), payload.to_vec());
                if let Some((&id, value)) = payload.split_first() {
                    self.registers.insert((m, op, id), value.to_vec());
                }
                Vec::new()
            }
        }
    }

    fn create_processor(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        self.creates_seen += 1;
        if self.drop_create_at == Some(self.creates_seen) {
            return Vec::new();
        }
        let id = self.next_processor;
        self.next_processor = self.next_processor.wrapping_add(1);
        self.processors.insert(id, payload.to_vec());
        vec![vec![module::DATA_PROCESSOR, dp::ADD, id]]
    }

    fn finish_event(&mut self, params: &[u8]) -> Vec<Vec<u8>> {
        let Some(entry) = self.pending_entry.take() else {
            return Vec::new();
        };
        self.entries_seen += 1;
        if self.drop_event_at == Some(self.entries_seen) {
            return Vec::new();
        }
        let id = self.next_event;
        self.next_event = self.next_event.wrapping_add(1);
        self.events.insert(id, (entry, params.to_vec()));
        vec![vec![module::EVENT, event::ENTRY, id]]
    }
}

impl Transport for MockBoard {
    fn send(&self, frame: &[u8]) -> Result<()> {
        if frame.len() < 2 {
            return Err(BoardError::Transport(format!(
                "frame too short: {}",
                hex(frame)
            )));
        }
        trace!("mock board <- {}", hex(frame));
        let replies = {
            let mut fw = self.lock();
            if fw.rejected == Some((frame[0], frame[1])) {
                return Err(BoardError::Transport(format!("rejected {}", hex(frame))));
            }
            fw.sent.push(frame.to_vec());
            let replies = fw.handle(frame);
            if fw.silent {
                Vec::new()
            } else {
                replies
            }
        };
        for reply in replies {
            trace!("mock board -> {}", hex(&reply));
            self.emit(&reply);
        }
        Ok(())
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn capture(board: &MockBoard) -> Arc<StdMutex<Vec<Vec<u8>>>> {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        board.attach(move |frame| sink.lock().unwrap().push(frame.to_vec()));
        received
    }

    #[test]
    fn test_create_echoes_sequential_ids() {
        let board = MockBoard::new();
        let received = capture(&board);
        board.send(&[0x09, 0x02, 0x05, 0x07, 0x00, 0x20, 0x03, 0x05, 0x04]).unwrap();
        board.send(&[0x09, 0x02, 0x09, 0x03, 0x00, 0x20, 0x0f, 0x01]).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![vec![0x09, 0x02, 0x00], vec![0x09, 0x02, 0x01]]);
        assert_eq!(board.processor_ids(), vec![0, 1]);
    }

    #[test]
    fn test_config_read_returns_create_bytes() {
        let board = MockBoard::new();
        let received = capture(&board);
        board.send(&[0x09, 0x02, 0x05, 0x07, 0x00, 0x20, 0x03, 0x05, 0x04]).unwrap();
        board.send(&[0x09, 0x82, 0x00]).unwrap();
        let replies = received.lock().unwrap();
        assert_eq!(replies[1], vec![0x09, 0x82, 0x05, 0x07, 0x00, 0x20, 0x03, 0x05, 0x04]);
    }

    #[test]
    fn test_dropped_create_gets_no_reply() {
        let board = MockBoard::new();
        let received = capture(&board);
        board.drop_create(1);
        board.send(&[0x09, 0x02, 0x05, 0x07, 0x00, 0x20, 0x03]).unwrap();
        assert!(received.lock().unwrap().is_empty());
        assert!(board.processor_ids().is_empty());
    }

    #[test]
    fn test_event_echo_after_parameters() {
        let board = MockBoard::new();
        let received = capture(&board);
        board.send(&[0x0a, 0x02, 0x09, 0x03, 0x00, 0x02, 0x03, 0x03]).unwrap();
        assert!(received.lock().unwrap().is_empty());
        board.send(&[0x0a, 0x03, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![vec![0x0a, 0x02, 0x00]]);
    }

    #[test]
    fn test_macro_reassembles_partial_commands() {
        let board = MockBoard::new();
        let _received = capture(&board);
        board.send(&[0x0f, 0x02, 0x01]).unwrap();
        board.send(&[0x0f, 0x09, 0x03, 0x04]).unwrap();
        board.send(&[0x0f, 0x03, 0x01, 0x02]).unwrap();
        board.send(&[0x0f, 0x04]).unwrap();
        assert_eq!(board.macro_commands(0), Some(vec![vec![0x03, 0x04, 0x01, 0x02]]));
    }

    #[test]
    fn test_rejected_register_fails_send() {
        let board = MockBoard::new();
        board.reject_frames_to(module::MACRO, macros::ADD_COMMAND);
        assert!(board.send(&[0x0f, 0x03, 0x01]).is_err());
        board.send(&[0x0f, 0x04]).unwrap();
        assert_eq!(board.sent(), vec![vec![0x0f, 0x04]]);
    }

    #[test]
    fn test_short_frame_rejected() {
        let board = MockBoard::new();
        assert!(matches!(board.send(&[0x09]), Err(BoardError::Transport(_))));
    }
}
