//! Board session
//!
//! A [`Session`] is everything the host knows about one connected board:
//! the producers it exposes, the modules it reported, the processors,
//! events and macros created on it, and the requests waiting for replies.
//! It is created on connect and dropped on disconnect; nothing here is
//! process-wide.
//!
//! # Data flow
//!
//! ```text
//! caller ──► Session ──► Link ──► Transport ──► board
//!                          ▲                      │
//!   Sample ◄── stream ◄── on_receive ◄────────────┘
//! ```
//!
//! Inbound frames first go to the request waiting on their
//! (module, register) key. Frames nobody is waiting for are decoded for
//! streaming subscribers, or dropped.
//!
//! # Example
//!
//! ```ignore
//! use boardlink::{LinkConfig, Session};
//! use boardlink::processor::{OperatorConfig, StageSpec};
//!
//! let session = Arc::new(Session::new(transport, LinkConfig::default(), Handle::current())?);
//! // The transport's receive side calls session.on_receive(&frame)
//!
//! let chain = session
//!     .commit_chain(vec![StageSpec::from_source(adc, OperatorConfig::Average { samples: 4, high_pass: false })])
//!     .await?;
//! let mut samples = session.stream(&chain[0].output)?;
//! ```

use crate::backend::transport::hex;
use crate::backend::{Link, Transport};
use crate::config::LinkConfig;
use crate::descriptor::Descriptor;
use crate::error::{BoardError, Result};
use crate::processor::{ChainEntry, OperatorConfig, Processor, ProcessorManager, ProcessorTable, StageSpec};
use crate::recorder::event::{BoardEvent, EventManager};
use crate::recorder::macros::{BoardMacro, MacroManager};
use crate::recorder::{Feedback, RecordingTarget};
use crate::types::{read_register, Address, DataValue, ModuleInfo, Sample, MODULE_INFO};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Plain export of a session's host-side state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub producers: BTreeMap<String, Descriptor>,
    pub modules: Vec<ModuleInfo>,
    pub processors: ProcessorTable,
    pub events: Vec<BoardEvent>,
    pub macros: Vec<BoardMacro>,
}

impl SessionSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BoardError::Serialization(format!("Failed to serialize snapshot: {}", e)))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| BoardError::Serialization(format!("Failed to parse snapshot: {}", e)))
    }
}

struct Subscription {
    descriptor: Descriptor,
    tx: mpsc::UnboundedSender<Sample>,
}

/// Host-side state of one connected board
pub struct Session {
    link: Arc<Link>,
    processors: ProcessorManager,
    events: EventManager,
    macros: MacroManager,
    producers: Mutex<BTreeMap<String, Descriptor>>,
    modules: Mutex<BTreeMap<u8, ModuleInfo>>,
    subscriptions: Mutex<HashMap<(u8, u8), Vec<Subscription>>>,
}

impl Session {
    /// Open a session over `transport`; timers run on `runtime`
    pub fn new(transport: Arc<dyn Transport>, config: LinkConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let link = Arc::new(Link::new(transport, config, runtime));
        info!("session opened");
        Ok(Self {
            processors: ProcessorManager::new(Arc::clone(&link)),
            events: EventManager::new(Arc::clone(&link)),
            macros: MacroManager::new(Arc::clone(&link)),
            link,
            producers: Mutex::new(BTreeMap::new()),
            modules: Mutex::new(BTreeMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        self.link.config()
    }

    /// Feed one frame received from the board
    pub fn on_receive(&self, frame: &[u8]) {
        trace!("<- {}", hex(frame));
        if self.link.dispatch(frame) {
            return;
        }
        if !self.route_stream(frame) {
            debug!("dropping unsolicited frame {}", hex(frame));
        }
    }

    fn route_stream(&self, frame: &[u8]) -> bool {
        let [module, register, rest @ ..] = frame else {
            return false;
        };
        let mut subscriptions = lock(&self.subscriptions);
        let Some(subscribers) = subscriptions.get_mut(&(*module, *register)) else {
            return false;
        };
        let timestamp = Utc::now();
        let mut delivered = false;
        subscribers.retain(|sub| {
            let address = sub.descriptor.address();
            let data = if address.has_id() {
                match rest.split_first() {
                    Some((&id, data)) if id == address.id => data,
                    _ => return true,
                }
            } else {
                rest
            };
            delivered = true;
            sub.descriptor
                .decode_all(data, false, timestamp)
                .into_iter()
                .all(|sample| sub.tx.send(sample).is_ok())
        });
        delivered
    }

    /// Send a command, or capture it if an event or macro is being recorded
    pub fn send_command(&self, frame: &[u8]) -> Result<()> {
        self.link.send_command(frame)
    }

    // --- producers and modules ---

    /// Make a board producer known under `name`
    pub fn register_producer(&self, name: impl Into<String>, descriptor: Descriptor) {
        lock(&self.producers).insert(name.into(), descriptor);
    }

    pub fn producer(&self, name: &str) -> Option<Descriptor> {
        lock(&self.producers).get(name).cloned()
    }

    /// Ask a module for its implementation and revision
    pub async fn discover(&self, module: u8) -> Result<ModuleInfo> {
        let register = read_register(MODULE_INFO);
        let reply = self
            .link
            .request(
                (module, register),
                self.config().response_timeout(),
                vec![vec![module, register]],
            )
            .await?;
        let info = ModuleInfo::from_response(&reply)
            .ok_or_else(|| BoardError::Protocol(format!("empty info reply from module {}", module)))?;
        debug!("module {:02x}: {:?}", module, info);
        lock(&self.modules).insert(module, info.clone());
        Ok(info)
    }

    pub fn module_info(&self, module: u8) -> Option<ModuleInfo> {
        lock(&self.modules).get(&module).cloned()
    }

    // --- reads, writes and streaming ---

    /// Read a producer's current value
    pub async fn read(&self, descriptor: &Descriptor) -> Result<Sample> {
        let address = descriptor.address();
        let register = read_register(address.register);
        let mut frame = vec![address.module, register];
        if address.has_id() {
            frame.push(address.id);
        }
        let header = frame.len();
        let reply = self
            .link
            .request(
                (address.module, register),
                self.config().response_timeout(),
                vec![frame],
            )
            .await?;
        Ok(descriptor.decode(reply.get(header..).unwrap_or(&[]), false, Utc::now()))
    }

    /// Write `value` (host units) to a producer's register
    pub fn write(&self, descriptor: &Descriptor, value: f32) -> Result<()> {
        let address = descriptor.address();
        let mut frame = vec![address.module, address.register];
        if address.has_id() {
            frame.push(address.id);
        }
        frame.extend(descriptor.to_wire_bytes(value, descriptor.layout().frame_length().max(1)));
        self.link.send_command(&frame)
    }

    /// Subscribe to decoded samples from a producer.
    ///
    /// Processor outputs have their notifications switched on; other
    /// producers are started by the caller.
    pub fn stream(&self, descriptor: &Descriptor) -> Result<mpsc::UnboundedReceiver<Sample>> {
        let address = descriptor.address();
        if address.is_processor_output() {
            self.processors.set_notify(address.id, true)?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscriptions)
            .entry(address.key())
            .or_default()
            .push(Subscription {
                descriptor: descriptor.clone(),
                tx,
            });
        debug!("streaming {}", address);
        Ok(rx)
    }

    /// Drop every subscription to `descriptor`'s address
    pub fn unstream(&self, descriptor: &Descriptor) -> Result<()> {
        let address = descriptor.address();
        if let Some(subscribers) = lock(&self.subscriptions).get_mut(&address.key()) {
            subscribers.retain(|sub| sub.descriptor.address() != address);
        }
        if address.is_processor_output() {
            self.processors.set_notify(address.id, false)?;
        }
        Ok(())
    }

    // --- processors ---

    pub fn processors(&self) -> &ProcessorManager {
        &self.processors
    }

    /// Create a processor chain; see [`ProcessorManager::commit_chain`]
    pub async fn commit_chain(&self, specs: Vec<StageSpec>) -> Result<Vec<Processor>> {
        self.processors.commit_chain(specs).await
    }

    pub fn remove_processor(&self, id: u8) -> Result<Processor> {
        self.processors.remove(id)
    }

    pub async fn pull_chain(&self, id: u8) -> Result<Vec<ChainEntry>> {
        self.processors.pull_chain(id).await
    }

    /// Pull the chain ending at `id` and rebuild it against the registered
    /// producer that feeds it
    pub async fn recover_chain(&self, id: u8) -> Result<Vec<Processor>> {
        let entries = self.processors.pull_chain(id).await?;
        let Some(first) = entries.first() else {
            return Ok(Vec::new());
        };
        let root = self.producer_at(first.source).ok_or_else(|| {
            BoardError::UnknownProcessor(format!("no producer registered at {}", first.source))
        })?;
        self.processors.reconstruct(&entries, &root)
    }

    fn producer_at(&self, address: Address) -> Option<Descriptor> {
        lock(&self.producers)
            .values()
            .find(|d| d.address().key() == address.key() && d.address().id == address.id)
            .cloned()
    }

    pub async fn read_state(&self, name: &str) -> Result<DataValue> {
        self.processors.read_state(name).await
    }

    pub fn set_state(&self, name: &str, value: f32) -> Result<()> {
        self.processors.set_state(name, value)
    }

    pub fn modify(&self, name: &str, config: OperatorConfig) -> Result<Processor> {
        self.processors.modify(name, config)
    }

    pub fn remove_all_processors(&self) -> Result<()> {
        self.processors.remove_all()
    }

    // --- events ---

    /// Start recording commands to run whenever `trigger` produces data
    pub fn begin_event(&self, trigger: Address, feedback: Option<Feedback>) -> Result<()> {
        self.link
            .recorder()
            .begin(RecordingTarget::Event { trigger, feedback })
    }

    /// Turn the recorded commands into event entries on the board
    pub async fn commit_events(&self) -> Result<Vec<BoardEvent>> {
        let (target, commands) = self.link.recorder().take()?;
        let RecordingTarget::Event { trigger, feedback } = target else {
            return Err(BoardError::Recorder("the open recording is a macro".into()));
        };
        self.events.commit(trigger, feedback, commands).await
    }

    pub fn remove_event(&self, id: u8) -> Result<BoardEvent> {
        self.events.remove(id)
    }

    pub fn remove_all_events(&self) -> Result<()> {
        self.events.remove_all()
    }

    pub fn events(&self) -> Vec<BoardEvent> {
        self.events.active()
    }

    // --- macros ---

    /// Start recording commands into a macro
    pub fn begin_macro(&self, auto_run: bool) -> Result<()> {
        self.link.recorder().begin(RecordingTarget::Macro { auto_run })
    }

    /// Write the recorded commands to the board as a macro
    pub async fn commit_macro(&self) -> Result<BoardMacro> {
        let (target, commands) = self.link.recorder().take()?;
        let RecordingTarget::Macro { auto_run } = target else {
            return Err(BoardError::Recorder("the open recording is an event".into()));
        };
        self.macros.commit(auto_run, commands).await
    }

    pub fn execute_macro(&self, id: u8) -> Result<()> {
        self.macros.execute(id)
    }

    pub fn erase_macros(&self) -> Result<()> {
        self.macros.erase_all()
    }

    pub fn macros(&self) -> Vec<BoardMacro> {
        self.macros.stored()
    }

    /// Discard an open recording
    pub fn abort_recording(&self) {
        self.link.recorder().abort();
    }

    pub fn is_recording(&self) -> bool {
        self.link.recorder().is_recording()
    }

    // --- snapshots ---

    /// Export the host-side state by value
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            producers: lock(&self.producers).clone(),
            modules: lock(&self.modules).values().cloned().collect(),
            processors: self.processors.table(),
            events: self.events.active(),
            macros: self.macros.stored(),
        }
    }

    /// Replace the host-side state with a snapshot
    pub fn restore(&self, snapshot: SessionSnapshot) {
        info!(
            "restoring snapshot: {} processors, {} events, {} macros",
            snapshot.processors.len(),
            snapshot.events.len(),
            snapshot.macros.len()
        );
        *lock(&self.producers) = snapshot.producers;
        *lock(&self.modules) = snapshot.modules.into_iter().map(|m| (m.id, m)).collect();
        self.processors.restore(snapshot.processors);
        self.events.restore(snapshot.events);
        self.macros.restore(snapshot.macros);
    }

    /// Fail every waiting request and drop all subscriptions
    pub fn close(&self) {
        self.link.close();
        lock(&self.subscriptions).clear();
        info!("session closed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
