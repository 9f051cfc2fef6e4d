//! Processor lifecycle on the board
//!
//! The manager creates processor chains one stage at a time, keeps the
//! host-side table of what lives on the board, and rebuilds that table from
//! the board after a reconnect.
//!
//! # Batch creation
//!
//! The firmware handles one pending create at a time, and the id it echoes
//! is the only way to address the new processor. [`ProcessorManager::commit_chain`]
//! therefore sends each stage only after the previous echo arrived. If any
//! stage fails, every stage of the same batch that was already created is
//! removed again before the error is returned.

use super::compiler::ProcessorCompiler;
use super::config::OperatorConfig;
use crate::backend::Link;
use crate::descriptor::Descriptor;
use crate::error::{BoardError, Result, ResultExt};
use crate::types::{dp, module, read_register, silent_read_register, Address, DataValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Where a stage in a chain takes its input from
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream {
    /// An existing producer: a sensor, a split component, or a processor
    /// created earlier
    Source(Descriptor),
    /// Output of an earlier stage in the same batch, by index
    Stage(usize),
}

/// One stage of a chain to create
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: Option<String>,
    pub upstream: Upstream,
    pub config: OperatorConfig,
}

impl StageSpec {
    /// Stage fed by an existing producer
    pub fn from_source(source: Descriptor, config: OperatorConfig) -> Self {
        Self {
            name: None,
            upstream: Upstream::Source(source),
            config,
        }
    }

    /// Stage fed by stage `index` of the same batch
    pub fn after(index: usize, config: OperatorConfig) -> Self {
        Self {
            name: None,
            upstream: Upstream::Stage(index),
            config,
        }
    }

    /// Tag the stage so it can be looked up by name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A processor that exists on the board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processor {
    pub id: u8,
    pub name: Option<String>,
    pub config: OperatorConfig,
    pub input: Descriptor,
    pub output: Descriptor,
    pub state: Option<Descriptor>,
}

/// One hop of a chain pulled off the board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub id: u8,
    /// Address feeding this processor
    pub source: Address,
    /// Frame descriptor byte: `(length - 1) << 5 | offset`
    pub frame: u8,
    /// Operator bytes
    pub config: Vec<u8>,
}

impl ChainEntry {
    /// Parse a config read reply: `[DP, READ(ADD), module, register, id, frame, operator...]`
    fn from_reply(id: u8, reply: &[u8]) -> Result<Self> {
        match reply {
            [_, _, source_module, source_register, source_id, frame, config @ ..] if !config.is_empty() => {
                Ok(Self {
                    id,
                    source: Address::new(*source_module, *source_register, *source_id),
                    frame: *frame,
                    config: config.to_vec(),
                })
            }
            _ => Err(BoardError::Protocol(format!(
                "processor {} config reply too short ({} bytes)",
                id,
                reply.len()
            ))),
        }
    }

    pub fn frame_offset(&self) -> u8 {
        self.frame & 0x1f
    }
}

/// Host view of the processors on the board
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorTable {
    active: BTreeMap<u8, Processor>,
    names: BTreeMap<String, u8>,
}

impl ProcessorTable {
    pub fn insert(&mut self, processor: Processor) {
        if let Some(name) = &processor.name {
            self.names.insert(name.clone(), processor.id);
        }
        self.active.insert(processor.id, processor);
    }

    pub fn remove(&mut self, id: u8) -> Option<Processor> {
        let processor = self.active.remove(&id)?;
        self.names.retain(|_, v| *v != id);
        Some(processor)
    }

    pub fn get(&self, id: u8) -> Option<&Processor> {
        self.active.get(&id)
    }

    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.names.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&Processor> {
        self.id_of(name).and_then(|id| self.active.get(&id))
    }

    /// Persisted-state descriptor of processor `id`
    pub fn state_of(&self, id: u8) -> Option<Descriptor> {
        self.active.get(&id).and_then(|p| p.state.clone())
    }

    pub fn ids(&self) -> Vec<u8> {
        self.active.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Processor> {
        self.active.values()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.names.clear();
    }
}

/// Creates, removes and tracks processors
pub struct ProcessorManager {
    link: Arc<Link>,
    table: Mutex<ProcessorTable>,
}

impl ProcessorManager {
    pub fn new(link: Arc<Link>) -> Self {
        Self {
            link,
            table: Mutex::new(ProcessorTable::default()),
        }
    }

    /// Create every stage of `specs` in order.
    ///
    /// All stages are compiled before anything is sent, so an unsupported
    /// operator fails the batch without touching the board.
    pub async fn commit_chain(&self, specs: Vec<StageSpec>) -> Result<Vec<Processor>> {
        let mut planned: Vec<Descriptor> = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let input = resolve(&spec.upstream, &planned, index)?;
            let (output, _) = ProcessorCompiler::derive(&input, &spec.config)?;
            planned.push(output);
        }

        let total = specs.len();
        let mut created: Vec<Processor> = Vec::with_capacity(total);
        for (index, spec) in specs.into_iter().enumerate() {
            let outputs: Vec<Descriptor> = created.iter().map(|p| p.output.clone()).collect();
            match self.create(spec, &outputs, index).await {
                Ok(processor) => {
                    self.lock().insert(processor.clone());
                    created.push(processor);
                }
                Err(e) => {
                    self.rollback(&created);
                    return Err(e.with_context(format!("creating processor {} of {}", index + 1, total)));
                }
            }
        }
        Ok(created)
    }

    async fn create(&self, spec: StageSpec, outputs: &[Descriptor], index: usize) -> Result<Processor> {
        let input = resolve(&spec.upstream, outputs, index)?;
        let (output, state) = ProcessorCompiler::derive(&input, &spec.config)?;

        let mut frame = vec![module::DATA_PROCESSOR, dp::ADD];
        frame.extend_from_slice(&input.address().to_bytes());
        frame.push(input.layout().frame_descriptor());
        frame.extend(spec.config.encode(&input, &output));

        let reply = self
            .link
            .request(
                (module::DATA_PROCESSOR, dp::ADD),
                self.link.config().response_timeout(),
                vec![frame],
            )
            .await?;
        let id = *reply
            .get(2)
            .ok_or_else(|| BoardError::Protocol("processor create echo carries no id".into()))?;

        info!("created processor {} ({}) fed by {}", id, spec.config, input.address());
        Ok(Processor {
            id,
            name: spec.name,
            config: spec.config,
            input,
            output: output.with_id(id),
            state: state.map(|s| s.with_id(id)),
        })
    }

    fn rollback(&self, created: &[Processor]) {
        if created.is_empty() {
            return;
        }
        warn!("rolling back {} processors", created.len());
        for processor in created.iter().rev() {
            if let Err(e) = self.send_remove(processor.id) {
                warn!("failed to remove processor {}: {}", processor.id, e);
            }
            self.lock().remove(processor.id);
        }
    }

    /// Remove a processor. Dependents are left for the caller to remove.
    pub fn remove(&self, id: u8) -> Result<Processor> {
        let processor = self
            .lock()
            .remove(id)
            .ok_or_else(|| BoardError::UnknownProcessor(format!("id {}", id)))?;
        self.send_remove(id)?;
        info!("removed processor {}", id);
        Ok(processor)
    }

    pub fn remove_named(&self, name: &str) -> Result<Processor> {
        let id = self.id_of(name)?;
        self.remove(id)
    }

    /// Remove every processor on the board, tracked or not
    pub fn remove_all(&self) -> Result<()> {
        self.lock().clear();
        self.link.transmit(&[module::DATA_PROCESSOR, dp::REMOVE_ALL])?;
        info!("removed all processors");
        Ok(())
    }

    fn send_remove(&self, id: u8) -> Result<()> {
        self.link.transmit(&[module::DATA_PROCESSOR, dp::REMOVE, id])
    }

    /// Walk a chain backwards from `id` to its root, one config read per hop.
    ///
    /// Entries come back root first.
    pub async fn pull_chain(&self, id: u8) -> Result<Vec<ChainEntry>> {
        let register = read_register(dp::ADD);
        let mut entries = VecDeque::new();
        let mut next = id;
        for _ in 0..=u8::MAX as usize {
            let reply = self
                .link
                .request(
                    (module::DATA_PROCESSOR, register),
                    self.link.config().config_read_timeout(),
                    vec![vec![module::DATA_PROCESSOR, register, next]],
                )
                .await
                .with_context(|| format!("reading config of processor {}", next))?;
            let entry = ChainEntry::from_reply(next, &reply)?;
            debug!("processor {} fed by {}", next, entry.source);
            let source = entry.source;
            entries.push_front(entry);
            if !source.is_processor_output() {
                return Ok(entries.into());
            }
            next = source.id;
        }
        Err(BoardError::Protocol(format!(
            "processor chain ending at {} does not reach a producer",
            id
        )))
    }

    /// Rebuild processors from a pulled chain fed by `root`.
    ///
    /// Each hop's operator bytes are parsed against its input and the output
    /// is derived again, exactly as when the chain was first created.
    pub fn reconstruct(&self, entries: &[ChainEntry], root: &Descriptor) -> Result<Vec<Processor>> {
        let Some(first) = entries.first() else {
            return Ok(Vec::new());
        };
        if first.source.key() != root.address().key() {
            return Err(BoardError::Protocol(format!(
                "chain is fed by {}, not {}",
                first.source,
                root.address()
            )));
        }

        let mut input = view_for(root, first);
        let mut rebuilt = Vec::with_capacity(entries.len());
        for entry in entries {
            let config = {
                let table = self.lock();
                OperatorConfig::parse(&entry.config, &input, &|id: u8| table.state_of(id))
                    .with_context(|| format!("parsing processor {}", entry.id))?
            };
            let (output, state) = ProcessorCompiler::derive(&input, &config)?;
            let processor = Processor {
                id: entry.id,
                name: None,
                config,
                input: input.clone(),
                output: output.with_id(entry.id),
                state: state.map(|s| s.with_id(entry.id)),
            };
            input = processor.output.clone();
            self.lock().insert(processor.clone());
            rebuilt.push(processor);
        }
        info!("reconstructed {} processors from the board", rebuilt.len());
        Ok(rebuilt)
    }

    /// Read a processor's persisted state
    pub async fn read_state(&self, name: &str) -> Result<DataValue> {
        let (id, state) = self.state_descriptor(name)?;
        let register = silent_read_register(dp::STATE);
        let reply = self
            .link
            .request(
                (module::DATA_PROCESSOR, register),
                self.link.config().response_timeout(),
                vec![vec![module::DATA_PROCESSOR, register, id]],
            )
            .await?;
        Ok(state.value(reply.get(3..).unwrap_or(&[]), false))
    }

    /// Overwrite a processor's persisted state (e.g. reset a counter)
    pub fn set_state(&self, name: &str, value: f32) -> Result<()> {
        let (id, state) = self.state_descriptor(name)?;
        let mut frame = vec![module::DATA_PROCESSOR, dp::STATE, id];
        frame.extend(state.to_wire_bytes(value, state.layout().frame_length().max(1)));
        self.link.send_command(&frame)
    }

    /// Replace a processor's operator parameters in place
    pub fn modify(&self, name: &str, config: OperatorConfig) -> Result<Processor> {
        let current = self.get(name)?;
        let (output, state) = ProcessorCompiler::derive(&current.input, &config)?;
        let mut frame = vec![module::DATA_PROCESSOR, dp::PARAMETER, current.id];
        frame.extend(config.encode(&current.input, &output));
        self.link.send_command(&frame)?;

        let updated = Processor {
            config,
            output: output.with_id(current.id),
            state: state.map(|s| s.with_id(current.id)),
            ..current
        };
        self.lock().insert(updated.clone());
        Ok(updated)
    }

    /// Turn streaming of a processor's output on or off
    pub fn set_notify(&self, id: u8, enable: bool) -> Result<()> {
        self.link
            .send_command(&[module::DATA_PROCESSOR, dp::NOTIFY_ENABLE, id, enable as u8])
    }

    pub fn get(&self, name: &str) -> Result<Processor> {
        self.lock()
            .by_name(name)
            .cloned()
            .ok_or_else(|| BoardError::UnknownProcessor(name.to_string()))
    }

    pub fn by_id(&self, id: u8) -> Option<Processor> {
        self.lock().get(id).cloned()
    }

    pub fn id_of(&self, name: &str) -> Result<u8> {
        self.lock()
            .id_of(name)
            .ok_or_else(|| BoardError::UnknownProcessor(name.to_string()))
    }

    pub fn active_ids(&self) -> Vec<u8> {
        self.lock().ids()
    }

    /// Copy of the processor table
    pub fn table(&self) -> ProcessorTable {
        self.lock().clone()
    }

    /// Replace the processor table
    pub fn restore(&self, table: ProcessorTable) {
        *self.lock() = table;
    }

    fn state_descriptor(&self, name: &str) -> Result<(u8, Descriptor)> {
        let processor = self.get(name)?;
        let state = processor
            .state
            .ok_or_else(|| BoardError::UnknownProcessor(format!("{} has no state", name)))?;
        Ok((processor.id, state))
    }

    fn lock(&self) -> MutexGuard<'_, ProcessorTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn resolve(upstream: &Upstream, outputs: &[Descriptor], index: usize) -> Result<Descriptor> {
    match upstream {
        Upstream::Source(descriptor) => Ok(descriptor.clone()),
        Upstream::Stage(stage) => outputs.get(*stage).filter(|_| *stage < index).cloned().ok_or_else(|| {
            BoardError::UnknownProcessor(format!(
                "stage {} feeds from stage {}, which does not precede it",
                index, stage
            ))
        }),
    }
}

/// The descriptor view of `root` that a chain entry's frame byte selects
fn view_for(root: &Descriptor, entry: &ChainEntry) -> Descriptor {
    if entry.frame == root.layout().frame_descriptor() {
        return root.clone();
    }
    root.split()
        .iter()
        .find(|c| c.layout().frame_descriptor() == entry.frame)
        .cloned()
        .unwrap_or_else(|| {
            debug!(
                "no view of {} at offset {}, using the whole frame",
                root.address(),
                entry.frame_offset()
            );
            root.clone()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBoard;
    use crate::config::LinkConfig;
    use crate::descriptor::DataKind;
    use crate::processor::config::{MathOp, ThresholdMode};
    use crate::types::NO_ID;
    use tokio::runtime::Handle;

    fn setup() -> (Arc<MockBoard>, Arc<ProcessorManager>) {
        let board = Arc::new(MockBoard::new());
        let link = Arc::new(Link::new(board.clone(), LinkConfig::default(), Handle::current()));
        let manager = Arc::new(ProcessorManager::new(Arc::clone(&link)));
        let weak = Arc::downgrade(&link);
        board.attach(move |frame| {
            if let Some(link) = weak.upgrade() {
                link.dispatch(frame);
            }
        });
        (board, manager)
    }

    fn adc() -> Descriptor {
        Descriptor::uint(Address::new(module::GPIO, 0x07, 0), 2).unwrap()
    }

    fn accel() -> Descriptor {
        Descriptor::vector(Address::unindexed(module::ACCELEROMETER, 0x04), 3, 2, 16384.0).unwrap()
    }

    fn average() -> OperatorConfig {
        OperatorConfig::Average {
            samples: 4,
            high_pass: false,
        }
    }

    #[tokio::test]
    async fn test_commit_chain_links_stages() {
        let (board, manager) = setup();
        let created = manager
            .commit_chain(vec![
                StageSpec::from_source(adc(), average()).named("smooth"),
                StageSpec::after(
                    0,
                    OperatorConfig::Threshold {
                        mode: ThresholdMode::Binary,
                        boundary: 512.0,
                        hysteresis: 0.0,
                    },
                ),
            ])
            .await
            .unwrap();

        assert_eq!(created.len(), 2);
        assert_eq!(created[1].input.address(), Address::processor_output(created[0].id));
        assert_eq!(manager.id_of("smooth").unwrap(), created[0].id);

        let creates = board.sent_to(module::DATA_PROCESSOR, dp::ADD);
        assert_eq!(&creates[0][2..6], &[module::GPIO, 0x07, 0x00, 0x20]);
        assert_eq!(&creates[1][2..5], &[module::DATA_PROCESSOR, dp::NOTIFY, created[0].id]);
    }

    #[tokio::test]
    async fn test_unsupported_stage_sends_nothing() {
        let (board, manager) = setup();
        let err = manager
            .commit_chain(vec![
                StageSpec::from_source(adc(), OperatorConfig::Buffer),
                StageSpec::after(
                    0,
                    OperatorConfig::Math {
                        op: MathOp::Add,
                        rhs: 1.0,
                        multi_channel: false,
                    },
                ),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::UnsupportedDerivation { .. }));
        assert!(board.sent().is_empty());
    }

    #[tokio::test]
    async fn test_forward_stage_reference_rejected() {
        let (_board, manager) = setup();
        let err = manager
            .commit_chain(vec![StageSpec::after(0, average())])
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::UnknownProcessor(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stage_rolls_back_batch() {
        let (board, manager) = setup();
        board.drop_create(2);
        let err = manager
            .commit_chain(vec![
                StageSpec::from_source(adc(), average()),
                StageSpec::after(0, average()),
            ])
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(manager.active_ids().is_empty());
        assert_eq!(board.sent_to(module::DATA_PROCESSOR, dp::REMOVE), vec![vec![0x09, 0x06, 0x00]]);
        assert!(board.processor_ids().is_empty());
    }

    #[tokio::test]
    async fn test_pull_and_reconstruct_split_chain() {
        let (_board, manager) = setup();
        let z = accel().component(2).unwrap().clone();
        let created = manager
            .commit_chain(vec![
                StageSpec::from_source(z, average()),
                StageSpec::after(
                    0,
                    OperatorConfig::Accumulate {
                        counter: true,
                        output_size: 4,
                    },
                ),
            ])
            .await
            .unwrap();
        let last = created[1].id;

        let entries = manager.pull_chain(last).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source, Address::unindexed(module::ACCELEROMETER, 0x04));
        assert_eq!(entries[0].frame_offset(), 4);
        assert_eq!(entries[1].source, Address::processor_output(created[0].id));

        manager.restore(ProcessorTable::default());
        let rebuilt = manager.reconstruct(&entries, &accel()).unwrap();
        assert_eq!(rebuilt[0].input.layout().sub_offset(), 4);
        assert_eq!(rebuilt[0].output, created[0].output);
        assert_eq!(rebuilt[1].config, created[1].config);
        assert_eq!(rebuilt[1].state.as_ref().unwrap().kind(), DataKind::Uint);
        assert_eq!(manager.active_ids(), vec![created[0].id, last]);
    }

    #[tokio::test]
    async fn test_reconstruct_rejects_wrong_root() {
        let (_board, manager) = setup();
        let entries = vec![ChainEntry {
            id: 0,
            source: Address::new(module::GPIO, 0x07, 0),
            frame: 0x20,
            config: vec![0x0f, 0x01],
        }];
        assert!(matches!(
            manager.reconstruct(&entries, &accel()),
            Err(BoardError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_state_read_and_write() {
        let (board, manager) = setup();
        manager
            .commit_chain(vec![StageSpec::from_source(
                adc(),
                OperatorConfig::Accumulate {
                    counter: true,
                    output_size: 4,
                },
            )
            .named("count")])
            .await
            .unwrap();

        manager.set_state("count", 10.0).unwrap();
        assert_eq!(board.sent_to(module::DATA_PROCESSOR, dp::STATE), vec![vec![0x09, 0x04, 0x00, 10, 0, 0, 0]]);
        assert_eq!(manager.read_state("count").await.unwrap(), DataValue::Unsigned(10));
    }

    #[tokio::test]
    async fn test_modify_updates_parameters() {
        let (board, manager) = setup();
        manager
            .commit_chain(vec![StageSpec::from_source(adc(), average()).named("avg")])
            .await
            .unwrap();
        let updated = manager
            .modify(
                "avg",
                OperatorConfig::Average {
                    samples: 8,
                    high_pass: false,
                },
            )
            .unwrap();
        assert_eq!(updated.id, 0);
        let frames = board.sent_to(module::DATA_PROCESSOR, dp::PARAMETER);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][..4], [0x09, 0x05, 0x00, 0x03]);
        assert_eq!(*frames[0].last().unwrap(), 8);
    }

    #[tokio::test]
    async fn test_remove_is_fire_and_forget() {
        let (board, manager) = setup();
        let created = manager
            .commit_chain(vec![StageSpec::from_source(adc(), average()).named("avg")])
            .await
            .unwrap();
        manager.remove(created[0].id).unwrap();
        assert!(manager.get("avg").is_err());
        assert!(board.processor_ids().is_empty());
        assert!(matches!(manager.remove(created[0].id), Err(BoardError::UnknownProcessor(_))));
    }

    #[test]
    fn test_chain_entry_rejects_short_reply() {
        assert!(ChainEntry::from_reply(1, &[0x09, 0x82, 0x09, 0x03]).is_err());
        let entry = ChainEntry::from_reply(1, &[0x09, 0x82, 0x03, 0x04, NO_ID, 0xa4, 0x03, 0x05, 0x04]).unwrap();
        assert_eq!(entry.frame_offset(), 4);
        assert_eq!(entry.config, vec![0x03, 0x05, 0x04]);
    }
}
