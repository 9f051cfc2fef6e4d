//! Board-side macros
//!
//! A macro is a list of commands stored on the board, optionally run at
//! boot. Writing one is a correlated begin (`[MACRO, BEGIN, auto_run]`
//! echoed with the macro id), a settle delay, one add-command frame per
//! command, and `[MACRO, END]`.

use crate::backend::Link;
use crate::error::{BoardError, Result};
use crate::types::{macros, module};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// A macro stored on the board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardMacro {
    pub id: u8,
    pub auto_run: bool,
    pub commands: Vec<Vec<u8>>,
}

/// Frames that store one command in the macro being written.
///
/// Commands at least `max_frame_len` long do not fit behind the add-command
/// header, so their first two bytes go ahead in an add-partial frame.
pub fn command_frames(command: &[u8], max_frame_len: usize) -> Vec<Vec<u8>> {
    if command.len() >= max_frame_len && command.len() > 2 {
        let (head, body) = command.split_at(2);
        let mut partial = vec![module::MACRO, macros::ADD_PARTIAL];
        partial.extend_from_slice(head);
        let mut rest = vec![module::MACRO, macros::ADD_COMMAND];
        rest.extend_from_slice(body);
        vec![partial, rest]
    } else {
        let mut frame = vec![module::MACRO, macros::ADD_COMMAND];
        frame.extend_from_slice(command);
        vec![frame]
    }
}

/// Tracks the macros written through this link
pub struct MacroManager {
    link: Arc<Link>,
    stored: Mutex<BTreeMap<u8, BoardMacro>>,
}

impl MacroManager {
    pub fn new(link: Arc<Link>) -> Self {
        Self {
            link,
            stored: Mutex::new(BTreeMap::new()),
        }
    }

    /// Write `commands` to the board as a new macro
    pub async fn commit(&self, auto_run: bool, commands: Vec<Vec<u8>>) -> Result<BoardMacro> {
        let reply = self
            .link
            .request(
                (module::MACRO, macros::BEGIN),
                self.link.config().response_timeout(),
                vec![vec![module::MACRO, macros::BEGIN, auto_run as u8]],
            )
            .await?;
        let id = *reply
            .get(2)
            .ok_or_else(|| BoardError::Protocol("macro begin echo carries no id".into()))?;

        let settle = self.link.config().macro_settle_delay();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        if let Err(e) = self.write_commands(&commands) {
            // Close the macro so the board stops treating commands as part of it
            warn!("writing macro {} failed, closing it: {}", id, e);
            if let Err(end) = self.link.transmit(&[module::MACRO, macros::END]) {
                debug!("closing macro {} failed too: {}", id, end);
            }
            return Err(e.with_context(format!("writing macro {}", id)));
        }
        self.link.transmit(&[module::MACRO, macros::END])?;
        debug!("macro {} holds {} commands", id, commands.len());
        info!("created macro {} (auto run: {})", id, auto_run);

        let board_macro = BoardMacro {
            id,
            auto_run,
            commands,
        };
        self.lock().insert(id, board_macro.clone());
        Ok(board_macro)
    }

    fn write_commands(&self, commands: &[Vec<u8>]) -> Result<()> {
        let max_frame_len = self.link.max_frame_len();
        for command in commands {
            for frame in command_frames(command, max_frame_len) {
                self.link.transmit(&frame)?;
            }
        }
        Ok(())
    }

    /// Run a stored macro now
    pub fn execute(&self, id: u8) -> Result<()> {
        self.link.send_command(&[module::MACRO, macros::EXECUTE, id])
    }

    /// Erase every macro stored on the board
    pub fn erase_all(&self) -> Result<()> {
        self.lock().clear();
        self.link.transmit(&[module::MACRO, macros::ERASE_ALL])?;
        info!("erased all macros");
        Ok(())
    }

    pub fn stored(&self) -> Vec<BoardMacro> {
        self.lock().values().cloned().collect()
    }

    pub fn restore(&self, stored: Vec<BoardMacro>) {
        *self.lock() = stored.into_iter().map(|m| (m.id, m)).collect();
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u8, BoardMacro>> {
        self.stored
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBoard;
    use crate::config::LinkConfig;
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio::runtime::Handle;

    fn setup(config: LinkConfig) -> (Arc<MockBoard>, MacroManager) {
        let board = Arc::new(MockBoard::new());
        let link = Arc::new(Link::new(board.clone(), config, Handle::current()));
        let weak = Arc::downgrade(&link);
        board.attach(move |frame| {
            if let Some(link) = weak.upgrade() {
                link.dispatch(frame);
            }
        });
        (board, MacroManager::new(link))
    }

    #[test]
    fn test_short_command_single_frame() {
        let frames = command_frames(&[0x02, 0x03, 0x01], 18);
        assert_eq!(frames, vec![vec![0x0f, 0x03, 0x02, 0x03, 0x01]]);
    }

    #[test]
    fn test_command_at_limit_is_split() {
        let command: Vec<u8> = (0..18).collect();
        let frames = command_frames(&command, 18);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![0x0f, 0x09, 0x00, 0x01]);
        assert_eq!(frames[1][..2], [0x0f, 0x03]);
        assert_eq!(frames[1].len(), 18);
    }

    proptest! {
        #[test]
        fn test_split_reassembles(command in prop::collection::vec(any::<u8>(), 18..40)) {
            let frames = command_frames(&command, 18);
            prop_assert_eq!(frames.len(), 2);
            prop_assert_eq!(frames[0].len(), 4);
            let mut joined = frames[0][2..].to_vec();
            joined.extend_from_slice(&frames[1][2..]);
            prop_assert_eq!(joined, command);
        }
    }

    #[tokio::test]
    async fn test_commit_writes_macro() {
        let (board, manager) = setup(LinkConfig::default());
        let long: Vec<u8> = (0..20).collect();
        let stored = manager
            .commit(true, vec![vec![0x02, 0x03, 0x01], long.clone()])
            .await
            .unwrap();
        assert_eq!(stored.id, 0);
        assert_eq!(board.macro_commands(0), Some(vec![vec![0x02, 0x03, 0x01], long]));
        assert_eq!(board.sent().last().unwrap(), &vec![0x0f, 0x04]);
        assert_eq!(board.sent()[0], vec![0x0f, 0x02, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_precedes_commands() {
        let config = LinkConfig {
            macro_settle_delay_ms: 20,
            ..Default::default()
        };
        let (board, manager) = setup(config);
        let start = tokio::time::Instant::now();
        manager.commit(false, vec![vec![0x02, 0x03, 0x01]]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(board.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_timeout_sends_nothing_else() {
        let (board, manager) = setup(LinkConfig::default());
        board.set_silent(true);
        let err = manager.commit(false, vec![vec![0x02, 0x03, 0x01]]).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(board.sent(), vec![vec![0x0f, 0x02, 0x00]]);
    }

    #[tokio::test]
    async fn test_failed_command_write_closes_macro() {
        let (board, manager) = setup(LinkConfig::default());
        board.reject_frames_to(module::MACRO, macros::ADD_COMMAND);

        let err = manager
            .commit(false, vec![vec![0x02, 0x03, 0x01], vec![0x02, 0x03, 0x00]])
            .await
            .unwrap_err();
        assert!(matches!(err.root(), BoardError::Transport(_)));
        assert!(err.to_string().contains("writing macro 0"));

        assert_eq!(
            board.sent(),
            vec![vec![0x0f, 0x02, 0x00], vec![0x0f, macros::END]]
        );
        assert_eq!(board.macro_commands(0), Some(Vec::new()));
        assert!(manager.stored().is_empty());
    }

    #[tokio::test]
    async fn test_execute_and_erase() {
        let (board, manager) = setup(LinkConfig::default());
        manager.commit(false, vec![vec![0x02, 0x03, 0x01]]).await.unwrap();
        manager.execute(0).unwrap();
        assert_eq!(board.executed_macros(), vec![0]);
        manager.erase_all().unwrap();
        assert!(manager.stored().is_empty());
        assert_eq!(board.macro_commands(0), None);
    }
}
