//! Board-side events
//!
//! An event binds a trigger address to a command: whenever the trigger
//! produces data, the board replays the command. Each recorded command
//! becomes one event entry:
//!
//! ```text
//! [EVENT, ENTRY, trig_mod, trig_reg, trig_id, cmd_mod, cmd_reg, param_len, (feedback x2)]
//! [EVENT, CMD_PARAMETERS, params...]
//! ```
//!
//! The board echoes `[EVENT, ENTRY, id]` after the parameters frame.

use super::Feedback;
use crate::backend::Link;
use crate::error::{BoardError, Result};
use crate::types::{event, module, Address};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// An event entry that exists on the board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardEvent {
    pub id: u8,
    pub trigger: Address,
    pub command: Vec<u8>,
    pub feedback: Option<Feedback>,
}

/// Entry and parameters frames for one recorded command
pub fn entry_frames(trigger: Address, command: &[u8], feedback: Option<&Feedback>) -> Result<[Vec<u8>; 2]> {
    let [cmd_module, cmd_register, params @ ..] = command else {
        return Err(BoardError::Recorder(format!(
            "command of {} bytes has no module/register header",
            command.len()
        )));
    };
    let mut entry = vec![module::EVENT, event::ENTRY];
    entry.extend_from_slice(&trigger.to_bytes());
    entry.extend_from_slice(&[*cmd_module, *cmd_register, params.len() as u8]);
    if let Some(feedback) = feedback {
        entry.extend_from_slice(&feedback.encode());
    }

    let mut parameters = vec![module::EVENT, event::CMD_PARAMETERS];
    parameters.extend_from_slice(params);
    Ok([entry, parameters])
}

/// Tracks the events created through this link
pub struct EventManager {
    link: Arc<Link>,
    active: Mutex<BTreeMap<u8, BoardEvent>>,
}

impl EventManager {
    pub fn new(link: Arc<Link>) -> Self {
        Self {
            link,
            active: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create one event entry per command, in order.
    ///
    /// If any entry fails, the entries of this batch that were already
    /// created are removed before the error is returned.
    pub async fn commit(
        &self,
        trigger: Address,
        feedback: Option<Feedback>,
        commands: Vec<Vec<u8>>,
    ) -> Result<Vec<BoardEvent>> {
        let feedback = match feedback {
            Some(_) if !self.link.config().event_feedback_enabled => {
                debug!("event feedback disabled, dropping it for {}", trigger);
                None
            }
            other => other,
        };

        // Validate every command before anything goes out
        let batches = commands
            .iter()
            .map(|c| entry_frames(trigger, c, feedback.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let total = batches.len();
        let mut created: Vec<BoardEvent> = Vec::with_capacity(total);
        for (index, (frames, command)) in batches.into_iter().zip(commands).enumerate() {
            match self.create(frames).await {
                Ok(id) => {
                    info!("created event {} on {}", id, trigger);
                    let board_event = BoardEvent {
                        id,
                        trigger,
                        command,
                        feedback,
                    };
                    self.lock().insert(id, board_event.clone());
                    created.push(board_event);
                }
                Err(e) => {
                    self.rollback(&created);
                    return Err(e.with_context(format!("creating event {} of {}", index + 1, total)));
                }
            }
        }
        Ok(created)
    }

    async fn create(&self, frames: [Vec<u8>; 2]) -> Result<u8> {
        let reply = self
            .link
            .request(
                (module::EVENT, event::ENTRY),
                self.link.config().response_timeout(),
                frames.into(),
            )
            .await?;
        reply
            .get(2)
            .copied()
            .ok_or_else(|| BoardError::Protocol("event echo carries no id".into()))
    }

    fn rollback(&self, created: &[BoardEvent]) {
        if created.is_empty() {
            return;
        }
        warn!("rolling back {} events", created.len());
        for board_event in created.iter().rev() {
            if let Err(e) = self.send_remove(board_event.id) {
                warn!("failed to remove event {}: {}", board_event.id, e);
            }
            self.lock().remove(&board_event.id);
        }
    }

    /// Remove one event entry
    pub fn remove(&self, id: u8) -> Result<BoardEvent> {
        let board_event = self
            .lock()
            .remove(&id)
            .ok_or_else(|| BoardError::Recorder(format!("no event with id {}", id)))?;
        self.send_remove(id)?;
        info!("removed event {}", id);
        Ok(board_event)
    }

    /// Remove every event entry on the board
    pub fn remove_all(&self) -> Result<()> {
        self.lock().clear();
        self.link.transmit(&[module::EVENT, event::REMOVE_ALL])
    }

    fn send_remove(&self, id: u8) -> Result<()> {
        self.link.transmit(&[module::EVENT, event::REMOVE, id])
    }

    pub fn active(&self) -> Vec<BoardEvent> {
        self.lock().values().cloned().collect()
    }

    pub fn restore(&self, events: Vec<BoardEvent>) {
        *self.lock() = events.into_iter().map(|e| (e.id, e)).collect();
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u8, BoardEvent>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBoard;
    use crate::config::LinkConfig;
    use crate::descriptor::DataSlice;
    use tokio::runtime::Handle;

    fn setup(config: LinkConfig) -> (Arc<MockBoard>, EventManager) {
        let board = Arc::new(MockBoard::new());
        let link = Arc::new(Link::new(board.clone(), config, Handle::current()));
        let weak = Arc::downgrade(&link);
        board.attach(move |frame| {
            if let Some(link) = weak.upgrade() {
                link.dispatch(frame);
            }
        });
        (board, EventManager::new(link))
    }

    fn switch() -> Address {
        Address::unindexed(module::SWITCH, 0x01)
    }

    fn feedback() -> Feedback {
        Feedback {
            source: DataSlice {
                address: switch(),
                offset: 0,
                length: 1,
            },
            dest_offset: 1,
        }
    }

    #[test]
    fn test_entry_frames_layout() {
        let [entry, params] = entry_frames(switch(), &[0x02, 0x03, 0x01, 0x02], None).unwrap();
        assert_eq!(entry, vec![0x0a, 0x02, 0x01, 0x01, 0xff, 0x02, 0x03, 0x02]);
        assert_eq!(params, vec![0x0a, 0x03, 0x01, 0x02]);
    }

    #[test]
    fn test_entry_frames_reject_headerless_command() {
        assert!(matches!(
            entry_frames(switch(), &[0x02], None),
            Err(BoardError::Recorder(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_sends_entry_then_parameters() {
        let (board, events) = setup(LinkConfig::default());
        let created = events
            .commit(switch(), None, vec![vec![0x02, 0x03, 0x01], vec![0x08, 0x01, 0x02, 0x00]])
            .await
            .unwrap();
        assert_eq!(created.iter().map(|e| e.id).collect::<Vec<_>>(), vec![0, 1]);

        let sent = board.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0][..2], [0x0a, 0x02]);
        assert_eq!(sent[1], vec![0x0a, 0x03, 0x01]);
        assert_eq!(sent[2][5..7], [0x08, 0x01]);
        assert_eq!(sent[3], vec![0x0a, 0x03, 0x02, 0x00]);
    }

    #[tokio::test]
    async fn test_feedback_bytes_follow_entry() {
        let (board, events) = setup(LinkConfig::default());
        events
            .commit(switch(), Some(feedback()), vec![vec![0x02, 0x03, 0x00]])
            .await
            .unwrap();
        let entry = &board.sent_to(module::EVENT, event::ENTRY)[0];
        assert_eq!(entry[8..], [0x03, 0x01]);
    }

    #[tokio::test]
    async fn test_feedback_dropped_when_disabled() {
        let config = LinkConfig {
            event_feedback_enabled: false,
            ..Default::default()
        };
        let (board, events) = setup(config);
        let created = events
            .commit(switch(), Some(feedback()), vec![vec![0x02, 0x03, 0x00]])
            .await
            .unwrap();
        assert!(created[0].feedback.is_none());
        assert_eq!(board.sent_to(module::EVENT, event::ENTRY)[0].len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_entry_rolls_back_batch() {
        let (board, events) = setup(LinkConfig::default());
        board.drop_event(2);
        let err = events
            .commit(switch(), None, vec![vec![0x02, 0x03, 0x01], vec![0x02, 0x03, 0x02]])
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(events.active().is_empty());
        assert_eq!(board.sent_to(module::EVENT, event::REMOVE), vec![vec![0x0a, 0x04, 0x00]]);
    }

    #[tokio::test]
    async fn test_remove_unknown_event() {
        let (_board, events) = setup(LinkConfig::default());
        assert!(events.remove(3).is_err());
    }
}
