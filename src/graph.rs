//! The component/buffer arena and its connection records.
//!
//! Connections are explicit attachment records: each component owns a small
//! table of `{buffer, direction, pin}` entries and the graph keeps a reverse
//! index from buffer id to its producer and consumer. The object graph is an
//! arena of typed handles; there are no back-pointers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::{AudioBuffer, BufferId};
use crate::component::{ComponentId, ComponentState};
use crate::error::EngineError;
use crate::module::ModuleAdapter;
use crate::pipeline::PipelineId;

/// Which side of a component a buffer is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachDirection {
    /// The component reads from the buffer.
    Source,
    /// The component writes into the buffer.
    Sink,
}

/// One attachment record owned by a component.
#[derive(Debug, Clone, Copy)]
pub struct Attachment {
    /// The attached buffer.
    pub buffer: BufferId,
    /// Which side of the component it occupies.
    pub direction: AttachDirection,
    /// Position among attachments of the same direction.
    pub pin: u32,
}

/// Reverse index entry: who produces into and consumes from a buffer.
///
/// Exactly one component may occupy each side; multi-consumer fan-out is
/// modelled by cloning buffers, never by sharing a read pointer.
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferEnds {
    /// Component writing into the buffer.
    pub producer: Option<ComponentId>,
    /// Component reading from the buffer.
    pub consumer: Option<ComponentId>,
}

/// A component instance plus its attachment table.
pub(crate) struct ComponentNode {
    pub adapter: ModuleAdapter,
    pub attachments: Vec<Attachment>,
    pub pipeline: PipelineId,
}

/// Objects logged per pipeline for reverse-order unwind.
#[derive(Debug, Clone, Copy)]
pub(crate) enum GraphObject {
    Component(ComponentId),
    Buffer(BufferId),
}

/// Arena of components and buffers with typed handles.
#[derive(Default)]
pub struct AudioGraph {
    components: HashMap<ComponentId, ComponentNode>,
    buffers: HashMap<BufferId, Arc<AudioBuffer>>,
    ends: HashMap<BufferId, BufferEnds>,
    creation_log: HashMap<PipelineId, Vec<GraphObject>>,
}

impl AudioGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_component(
        &mut self,
        pipeline: PipelineId,
        adapter: ModuleAdapter,
    ) -> Result<(), EngineError> {
        let id = adapter.id();
        if self.components.contains_key(&id) {
            return Err(EngineError::DuplicateId {
                what: id.to_string(),
            });
        }
        self.components.insert(
            id,
            ComponentNode {
                adapter,
                attachments: Vec::new(),
                pipeline,
            },
        );
        self.creation_log
            .entry(pipeline)
            .or_default()
            .push(GraphObject::Component(id));
        Ok(())
    }

    pub(crate) fn insert_buffer(
        &mut self,
        pipeline: PipelineId,
        buffer: Arc<AudioBuffer>,
    ) -> Result<(), EngineError> {
        let id = buffer.id();
        if self.buffers.contains_key(&id) {
            return Err(EngineError::DuplicateId {
                what: id.to_string(),
            });
        }
        self.buffers.insert(id, buffer);
        self.ends.insert(id, BufferEnds::default());
        self.creation_log
            .entry(pipeline)
            .or_default()
            .push(GraphObject::Buffer(id));
        Ok(())
    }

    /// Attaches `component` as the producer writing into `buffer`.
    pub(crate) fn connect_producer(
        &mut self,
        component: ComponentId,
        buffer: BufferId,
    ) -> Result<(), EngineError> {
        if !self.buffers.contains_key(&buffer) {
            return Err(EngineError::UnknownBuffer { id: buffer });
        }
        let node = self
            .components
            .get_mut(&component)
            .ok_or(EngineError::UnknownComponent { id: component })?;
        let pin = node
            .attachments
            .iter()
            .filter(|a| a.direction == AttachDirection::Sink)
            .count();
        if pin >= node.adapter.max_sinks() {
            return Err(EngineError::EndpointOccupied {
                buffer,
                side: "producer",
            });
        }
        let ends = self.ends.entry(buffer).or_default();
        if ends.producer.is_some() {
            return Err(EngineError::EndpointOccupied {
                buffer,
                side: "producer",
            });
        }
        ends.producer = Some(component);
        node.attachments.push(Attachment {
            buffer,
            direction: AttachDirection::Sink,
            pin: pin as u32,
        });
        Ok(())
    }

    /// Attaches `component` as the consumer reading from `buffer`.
    pub(crate) fn connect_consumer(
        &mut self,
        buffer: BufferId,
        component: ComponentId,
    ) -> Result<(), EngineError> {
        if !self.buffers.contains_key(&buffer) {
            return Err(EngineError::UnknownBuffer { id: buffer });
        }
        let node = self
            .components
            .get_mut(&component)
            .ok_or(EngineError::UnknownComponent { id: component })?;
        let pin = node
            .attachments
            .iter()
            .filter(|a| a.direction == AttachDirection::Source)
            .count();
        // Single-source components reject a second attachment; mixers accept
        // up to their fan-in bound.
        if pin >= node.adapter.max_sources() {
            return Err(EngineError::EndpointOccupied {
                buffer,
                side: "consumer",
            });
        }
        let ends = self.ends.entry(buffer).or_default();
        if ends.consumer.is_some() {
            return Err(EngineError::EndpointOccupied {
                buffer,
                side: "consumer",
            });
        }
        ends.consumer = Some(component);
        node.attachments.push(Attachment {
            buffer,
            direction: AttachDirection::Source,
            pin: pin as u32,
        });
        Ok(())
    }

    pub(crate) fn component(&self, id: ComponentId) -> Result<&ComponentNode, EngineError> {
        self.components
            .get(&id)
            .ok_or(EngineError::UnknownComponent { id })
    }

    pub(crate) fn component_mut(
        &mut self,
        id: ComponentId,
    ) -> Result<&mut ComponentNode, EngineError> {
        self.components
            .get_mut(&id)
            .ok_or(EngineError::UnknownComponent { id })
    }

    /// Shared handle to a buffer.
    pub fn buffer(&self, id: BufferId) -> Result<Arc<AudioBuffer>, EngineError> {
        self.buffers
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownBuffer { id })
    }

    /// Reverse index entry of a buffer.
    pub fn ends(&self, id: BufferId) -> Result<BufferEnds, EngineError> {
        self.ends
            .get(&id)
            .copied()
            .ok_or(EngineError::UnknownBuffer { id })
    }

    /// Lifecycle state of a component, if it exists.
    pub fn component_state(&self, id: ComponentId) -> Option<ComponentState> {
        self.components.get(&id).map(|n| n.adapter.state())
    }

    /// Buffers attached to the component's source side, in pin order.
    pub(crate) fn source_buffers(&self, id: ComponentId) -> Vec<Arc<AudioBuffer>> {
        self.attached(id, AttachDirection::Source)
    }

    /// Buffers attached to the component's sink side, in pin order.
    pub(crate) fn sink_buffers(&self, id: ComponentId) -> Vec<Arc<AudioBuffer>> {
        self.attached(id, AttachDirection::Sink)
    }

    fn attached(&self, id: ComponentId, direction: AttachDirection) -> Vec<Arc<AudioBuffer>> {
        let Some(node) = self.components.get(&id) else {
            return Vec::new();
        };
        let mut list: Vec<_> = node
            .attachments
            .iter()
            .filter(|a| a.direction == direction)
            .collect();
        list.sort_by_key(|a| a.pin);
        list.iter()
            .filter_map(|a| self.buffers.get(&a.buffer).cloned())
            .collect()
    }

    /// States of the components on the far side of each attachment, in pin
    /// order; a missing peer mirrors the component's own state so it is
    /// never skipped.
    pub(crate) fn peer_states(
        &self,
        id: ComponentId,
        direction: AttachDirection,
    ) -> Vec<ComponentState> {
        let Some(node) = self.components.get(&id) else {
            return Vec::new();
        };
        let own = node.adapter.state();
        let mut list: Vec<_> = node
            .attachments
            .iter()
            .filter(|a| a.direction == direction)
            .collect();
        list.sort_by_key(|a| a.pin);
        list.iter()
            .map(|a| {
                let ends = self.ends.get(&a.buffer).copied().unwrap_or_default();
                let peer = match direction {
                    AttachDirection::Source => ends.producer,
                    AttachDirection::Sink => ends.consumer,
                };
                peer.and_then(|p| self.component_state(p)).unwrap_or(own)
            })
            .collect()
    }

    /// Components belonging to a pipeline, in creation order.
    pub(crate) fn components_in(&self, pipeline: PipelineId) -> Vec<ComponentId> {
        self.creation_log
            .get(&pipeline)
            .into_iter()
            .flatten()
            .filter_map(|o| match o {
                GraphObject::Component(id) => Some(*id),
                GraphObject::Buffer(_) => None,
            })
            .collect()
    }

    /// Topological order of a pipeline's components, source endpoint first.
    ///
    /// Only edges whose both ends belong to the pipeline participate; shared
    /// buffers to other pipelines are cross-pipeline edges handled by the
    /// scheduler.
    ///
    /// # Errors
    ///
    /// [`EngineError::GraphCycle`] when the subgraph has a cycle and
    /// [`EngineError::GraphDisconnected`] when it is not weakly connected.
    pub(crate) fn topo_order(
        &self,
        pipeline: PipelineId,
    ) -> Result<Vec<ComponentId>, EngineError> {
        let members = self.components_in(pipeline);
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let member_set: std::collections::HashSet<_> = members.iter().copied().collect();

        // Edges producer -> consumer through each buffer.
        let mut out_edges: HashMap<ComponentId, Vec<ComponentId>> = HashMap::new();
        let mut in_degree: HashMap<ComponentId, usize> =
            members.iter().map(|&id| (id, 0)).collect();
        for ends in self.ends.values() {
            if let (Some(p), Some(c)) = (ends.producer, ends.consumer) {
                if member_set.contains(&p) && member_set.contains(&c) {
                    out_edges.entry(p).or_default().push(c);
                    if let Some(d) = in_degree.get_mut(&c) {
                        *d += 1;
                    }
                }
            }
        }

        // Kahn's algorithm; ready components keep creation order so the walk
        // is stable.
        let mut ready: Vec<ComponentId> = members
            .iter()
            .copied()
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(members.len());
        while let Some(id) = ready.first().copied() {
            ready.remove(0);
            order.push(id);
            for next in out_edges.get(&id).cloned().unwrap_or_default() {
                if let Some(d) = in_degree.get_mut(&next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(next);
                    }
                }
            }
        }
        if order.len() != members.len() {
            return Err(EngineError::GraphCycle { pipeline });
        }

        // Weak connectivity over the same edge set.
        let mut undirected: HashMap<ComponentId, Vec<ComponentId>> = HashMap::new();
        for (from, tos) in &out_edges {
            for to in tos {
                undirected.entry(*from).or_default().push(*to);
                undirected.entry(*to).or_default().push(*from);
            }
        }
        if members.len() > 1 {
            let mut seen = std::collections::HashSet::new();
            let mut stack = vec![members[0]];
            while let Some(id) = stack.pop() {
                if seen.insert(id) {
                    stack.extend(undirected.get(&id).into_iter().flatten().copied());
                }
            }
            if seen.len() != members.len() {
                return Err(EngineError::GraphDisconnected { pipeline });
            }
        }

        Ok(order)
    }

    /// Cross-pipeline feeding edges: `(producer pipeline, consumer pipeline)`
    /// for every buffer shared between two pipelines.
    pub(crate) fn pipeline_edges(&self) -> Vec<(PipelineId, PipelineId)> {
        let mut edges = Vec::new();
        for ends in self.ends.values() {
            if let (Some(p), Some(c)) = (ends.producer, ends.consumer) {
                let (Some(pp), Some(cp)) = (
                    self.components.get(&p).map(|n| n.pipeline),
                    self.components.get(&c).map(|n| n.pipeline),
                ) else {
                    continue;
                };
                if pp != cp && !edges.contains(&(pp, cp)) {
                    edges.push((pp, cp));
                }
            }
        }
        edges
    }

    /// Removes everything created for a pipeline, newest object first.
    pub(crate) fn remove_pipeline(&mut self, pipeline: PipelineId) {
        let log = self.creation_log.remove(&pipeline).unwrap_or_default();
        for object in log.into_iter().rev() {
            match object {
                GraphObject::Component(id) => {
                    if let Some(node) = self.components.remove(&id) {
                        for attachment in node.attachments {
                            if let Some(ends) = self.ends.get_mut(&attachment.buffer) {
                                if ends.producer == Some(id) {
                                    ends.producer = None;
                                }
                                if ends.consumer == Some(id) {
                                    ends.consumer = None;
                                }
                            }
                        }
                    }
                }
                GraphObject::Buffer(id) => {
                    self.buffers.remove(&id);
                    // Detach the dangling references of surviving components.
                    self.ends.remove(&id);
                    for node in self.components.values_mut() {
                        node.attachments.retain(|a| a.buffer != id);
                    }
                }
            }
        }
    }

    /// Number of live components.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}
