//! Shared outbound path and reply routing for one board
//!
//! [`Link`] owns the transport, one [`Correlator`] per reply key, and the
//! command recorder. Everything that talks to the board goes through it:
//!
//! - [`Link::transmit`] - raw send, used for internal traffic
//! - [`Link::send_command`] - user commands; captured while recording
//! - [`Link::request`] - correlated request that resolves on the board's echo
//! - [`Link::dispatch`] - hands an inbound frame to the waiting request

use super::correlator::{Correlator, Deferred};
use super::transport::{hex, Transport};
use crate::config::LinkConfig;
use crate::error::{BoardError, Result};
use crate::recorder::CommandRecorder;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, trace};

/// Reply key of a frame: its module and register bytes
pub type ReplyKey = (u8, u8);

/// Outbound half of a session
pub struct Link {
    transport: Arc<dyn Transport>,
    runtime: Handle,
    config: LinkConfig,
    correlators: Mutex<HashMap<ReplyKey, Correlator<Vec<u8>>>>,
    recorder: Mutex<CommandRecorder>,
}

impl Link {
    pub fn new(transport: Arc<dyn Transport>, config: LinkConfig, runtime: Handle) -> Self {
        Self {
            transport,
            runtime,
            config,
            correlators: Mutex::new(HashMap::new()),
            recorder: Mutex::new(CommandRecorder::new()),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Longest command that fits a single frame on this link
    pub fn max_frame_len(&self) -> usize {
        self.transport.max_frame_len().min(self.config.max_frame_len)
    }

    /// Send a frame now, bypassing the recorder
    pub fn transmit(&self, frame: &[u8]) -> Result<()> {
        debug!("-> {}", hex(frame));
        self.transport.send(frame)
    }

    /// Send a user command, or capture it if a recording is open
    pub fn send_command(&self, frame: &[u8]) -> Result<()> {
        if self.recorder().capture(frame) {
            debug!("recorded {}", hex(frame));
            return Ok(());
        }
        self.transmit(frame)
    }

    /// Queue `frames` for sending once every earlier request on `key` has
    /// settled; resolves with the first inbound frame on `key` after that.
    pub fn request(&self, key: ReplyKey, timeout: Duration, frames: Vec<Vec<u8>>) -> Deferred<Vec<u8>> {
        let transport = Arc::clone(&self.transport);
        self.correlator(key).submit(timeout, move || {
            for frame in &frames {
                debug!("-> {}", hex(frame));
                transport.send(frame)?;
            }
            Ok(())
        })
    }

    /// Route an inbound frame to the request waiting on its key.
    ///
    /// Returns `false` when no request is waiting.
    pub fn dispatch(&self, frame: &[u8]) -> bool {
        let [module, register, ..] = frame else {
            return false;
        };
        let correlator = self.lock_correlators().get(&(*module, *register)).cloned();
        match correlator {
            Some(correlator) if correlator.pending() > 0 => {
                trace!("reply for {}", correlator.label());
                correlator.complete(frame.to_vec())
            }
            _ => false,
        }
    }

    /// Requests not yet settled on `key`
    pub fn pending(&self, key: ReplyKey) -> usize {
        self.lock_correlators()
            .get(&key)
            .map(|c| c.pending())
            .unwrap_or(0)
    }

    /// Fail every waiting request
    pub fn close(&self) {
        let correlators: Vec<_> = self.lock_correlators().values().cloned().collect();
        for correlator in correlators {
            correlator.fail_all(|| BoardError::Channel("link closed".into()));
        }
    }

    pub fn recorder(&self) -> MutexGuard<'_, CommandRecorder> {
        self.recorder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn correlator(&self, key: ReplyKey) -> Correlator<Vec<u8>> {
        self.lock_correlators()
            .entry(key)
            .or_insert_with(|| {
                Correlator::new(format!("{:02x}:{:02x}", key.0, key.1), self.runtime.clone())
            })
            .clone()
    }

    fn lock_correlators(&self) -> MutexGuard<'_, HashMap<ReplyKey, Correlator<Vec<u8>>>> {
        self.correlators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::transport::MockTransport;
    use crate::recorder::RecordingTarget;
    use mockall::Sequence;

    fn link_with(mock: MockTransport) -> Link {
        Link::new(Arc::new(mock), LinkConfig::default(), Handle::current())
    }

    #[tokio::test]
    async fn test_request_sends_all_frames_in_order() {
        let mut mock = MockTransport::new();
        let mut seq = Sequence::new();
        mock.expect_send()
            .withf(|f| f.to_vec() == vec![0x0a, 0x02, 0x01])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_send()
            .withf(|f| f.to_vec() == vec![0x0a, 0x03, 0x09])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let link = link_with(mock);

        let reply = link.request(
            (0x0a, 0x02),
            Duration::from_secs(1),
            vec![vec![0x0a, 0x02, 0x01], vec![0x0a, 0x03, 0x09]],
        );
        assert!(link.dispatch(&[0x0a, 0x02, 0x05]));
        assert_eq!(reply.await.unwrap(), vec![0x0a, 0x02, 0x05]);
    }

    #[tokio::test]
    async fn test_transport_failure_fails_request() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .returning(|_| Err(BoardError::Transport("unplugged".into())));
        let link = link_with(mock);
        let reply = link.request((0x09, 0x02), Duration::from_secs(1), vec![vec![0x09, 0x02]]);
        assert!(matches!(reply.await, Err(BoardError::Transport(_))));
        assert_eq!(link.pending((0x09, 0x02)), 0);
    }

    #[tokio::test]
    async fn test_send_command_captured_while_recording() {
        let mut mock = MockTransport::new();
        mock.expect_send().times(1).returning(|_| Ok(()));
        let link = link_with(mock);

        link.recorder()
            .begin(RecordingTarget::Macro { auto_run: false })
            .unwrap();
        link.send_command(&[0x02, 0x03, 0x01]).unwrap();
        assert_eq!(link.recorder().captured(), 1);

        // Internal traffic is never recorded
        link.transmit(&[0x0f, 0x04]).unwrap();
        assert_eq!(link.recorder().captured(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_frame_not_dispatched() {
        let link = link_with(MockTransport::new());
        assert!(!link.dispatch(&[0x09, 0x02, 0x00]));
        assert!(!link.dispatch(&[0x09]));
    }

    #[tokio::test]
    async fn test_close_fails_waiting_requests() {
        let mut mock = MockTransport::new();
        mock.expect_send().returning(|_| Ok(()));
        let link = link_with(mock);
        let reply = link.request((0x0f, 0x02), Duration::from_secs(1), vec![vec![0x0f, 0x02, 0x00]]);
        link.close();
        assert!(matches!(reply.await, Err(BoardError::Channel(_))));
    }

    #[tokio::test]
    async fn test_max_frame_len_takes_smaller_limit() {
        let mut mock = MockTransport::new();
        mock.expect_max_frame_len().return_const(20usize);
        let link = link_with(mock);
        assert_eq!(link.max_frame_len(), 18);
    }
}
