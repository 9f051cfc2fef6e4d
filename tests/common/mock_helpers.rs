//! Mock construction helpers

use boardlink::{BoardError, LinkConfig, Session, Transport};
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Transport that records every frame and answers through a script.
///
/// The script sees each outbound frame and returns the frames the board
/// sends back; they are fed to the attached session before `send` returns.
pub struct ScriptedBoard {
    sent: Mutex<Vec<Vec<u8>>>,
    responder: Mutex<Responder>,
    session: Mutex<Weak<Session>>,
    fail_sends: Mutex<bool>,
}

impl ScriptedBoard {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(responder)),
            session: Mutex::new(Weak::new()),
            fail_sends: Mutex::new(false),
        })
    }

    /// A board that never answers
    pub fn silent() -> Arc<Self> {
        Self::new(|_| Vec::new())
    }

    pub fn attach(&self, session: &Arc<Session>) {
        *self.session.lock().unwrap() = Arc::downgrade(session);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().unwrap() = fail;
    }

    /// Push a frame to the session as if the board produced it
    pub fn emit(&self, frame: &[u8]) {
        let session = self.session.lock().unwrap().upgrade();
        if let Some(session) = session {
            session.on_receive(frame);
        }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent frames addressed to `(module, register)`
    pub fn sent_to(&self, module: u8, register: u8) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter(|f| f.len() >= 2 && f[0] == module && f[1] == register)
            .collect()
    }
}

impl Transport for ScriptedBoard {
    fn send(&self, frame: &[u8]) -> boardlink::Result<()> {
        if *self.fail_sends.lock().unwrap() {
            return Err(BoardError::Transport("link down".into()));
        }
        self.sent.lock().unwrap().push(frame.to_vec());
        let replies = (self.responder.lock().unwrap())(frame);
        for reply in replies {
            self.emit(&reply);
        }
        Ok(())
    }
}

/// Open a session over `board` and route its replies back in
pub fn connect(board: &Arc<ScriptedBoard>, config: LinkConfig) -> Arc<Session> {
    let transport: Arc<dyn Transport> = board.clone();
    let session = Arc::new(Session::new(transport, config, Handle::current()).unwrap());
    board.attach(&session);
    session
}

/// Responder that acknowledges processor creates with sequential ids and
/// event entries after their parameters frame, starting at 0.
///
/// The `n`-th processor create in `dropped` (1-based) is never answered.
pub fn echo_ids(dropped: &'static [usize]) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send {
    let mut creates = 0usize;
    let mut next_processor = 0u8;
    let mut next_event = 0u8;
    let mut next_macro = 0u8;
    move |frame| match frame {
        [0x09, 0x02, ..] => {
            creates += 1;
            if dropped.contains(&creates) {
                return Vec::new();
            }
            let id = next_processor;
            next_processor += 1;
            vec![vec![0x09, 0x02, id]]
        }
        [0x0a, 0x03, ..] => {
            let id = next_event;
            next_event += 1;
            vec![vec![0x0a, 0x02, id]]
        }
        [0x0f, 0x02, ..] => {
            let id = next_macro;
            next_macro += 1;
            vec![vec![0x0f, 0x02, id]]
        }
        _ => Vec::new(),
    }
}
