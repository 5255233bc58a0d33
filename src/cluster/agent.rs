//! The fixed RPC surface between the client and the agents it dispatches.
//!
//! Agents are plain values: the node already knows how to run them, so only
//! their identity and parameters travel. Every message an agent can receive
//! is an [`AgentMessage`]; every answer is an [`AgentResponse`].

use std::{fmt, time::Duration};

use rkyv::{Archive, Deserialize, Serialize};

use super::{hex::HexDisplayExt, ranges::DataRanges, scene::SceneFragment};

/// Digest identifying one agent instance, unique per (session, slot).
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Hash, Eq, PartialEq)]
#[archive(check_bytes)]
#[archive_attr(derive(Hash, Eq, PartialEq))]
pub struct AgentId(pub [u8; 32]);

impl AgentId {
    pub fn derive(session: &[u8], name: &str, slot: u32) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(session);
        hasher.update(name.as_bytes());
        hasher.update(&slot.to_le_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl AsRef<[u8]> for AgentId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self.short_hex())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_hex())
    }
}

/// Display axes a data scalar can be mapped to.
#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum DisplayAxis {
    X,
    Y,
    Z,
    Color,
    Alpha,
    /// Steps through values over time.
    Animation,
    /// Selects one value by an explicit control.
    SelectValue,
}

impl DisplayAxis {
    /// Mappings to these axes turn a sequence into a control-bound switch.
    pub fn is_selector(&self) -> bool {
        matches!(self, DisplayAxis::Animation | DisplayAxis::SelectValue)
    }
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct AxisMapping {
    pub scalar: String,
    pub display: DisplayAxis,
}

impl AxisMapping {
    pub fn new(scalar: impl Into<String>, display: DisplayAxis) -> Self {
        Self {
            scalar: scalar.into(),
            display,
        }
    }
}

/// Display constants applied to every appearance a node emits.
#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum ConstantMapping {
    Alpha(f32),
    Color([f32; 3]),
    PointSize(f32),
    LineWidth(f32),
}

#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum RenderStyle {
    /// One colored point per sample.
    Points,
    /// Textured slice stacks along each grid axis; falls back to points for
    /// non-grid domains.
    Volume,
}

/// A unit of work dispatched to one worker slot. It begins executing when
/// the node enrolls it and lives for the rest of the session.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct ComputeAgent {
    pub id: AgentId,
    /// Partition slot this agent serves; echoed on delivery so results can
    /// be demultiplexed.
    pub slot: u32,
    pub name: String,
    pub style: RenderStyle,
    pub maps: Vec<AxisMapping>,
    pub constants: Vec<ConstantMapping>,
    /// Per-round deadline the client will apply, in milliseconds.
    pub deadline_ms: u64,
}

impl ComputeAgent {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// What the client knows about an agent before it has a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTemplate {
    pub name: String,
    pub style: RenderStyle,
    pub maps: Vec<AxisMapping>,
    pub constants: Vec<ConstantMapping>,
}

impl AgentTemplate {
    pub fn new(name: impl Into<String>, style: RenderStyle) -> Self {
        Self {
            name: name.into(),
            style,
            maps: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn with_map(mut self, map: AxisMapping) -> Self {
        self.maps.push(map);
        self
    }

    pub fn with_constant(mut self, constant: ConstantMapping) -> Self {
        self.constants.push(constant);
        self
    }

    pub fn instantiate(&self, session: &[u8], slot: u32, deadline: Duration) -> ComputeAgent {
        ComputeAgent {
            id: AgentId::derive(session, &self.name, slot),
            slot,
            name: self.name.clone(),
            style: self.style,
            maps: self.maps.clone(),
            constants: self.constants.clone(),
            deadline_ms: deadline.as_millis() as u64,
        }
    }
}

/// Sent before a transform round; `go` enables the next transform.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct PrepareAction {
    pub go: bool,
    pub initialize: bool,
    pub display: String,
    pub maps: Vec<AxisMapping>,
    pub constants: Vec<ConstantMapping>,
}

impl PrepareAction {
    pub fn go(display: impl Into<String>) -> Self {
        Self {
            go: true,
            initialize: false,
            display: display.into(),
            maps: Vec::new(),
            constants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum AgentMessage {
    PrepareAction(PrepareAction),
    /// Build a fragment at the given stride (1 = full resolution).
    Transform { resolution: u32 },
    ComputeRanges,
    Stop,
}

impl AgentMessage {
    pub fn op(&self) -> &'static str {
        match self {
            AgentMessage::PrepareAction(_) => "prepare_action",
            AgentMessage::Transform { .. } => "transform",
            AgentMessage::ComputeRanges => "compute_ranges",
            AgentMessage::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum AgentResponse {
    Prepared,
    Fragment(SceneFragment),
    /// Nothing changed since the last transform.
    Suppressed,
    /// The fragment went to the node's registered callback instead.
    Delivered,
    Infeasible(String),
    /// The node lost its data source; the link is dead for this session.
    Disconnected(String),
    Ranges(DataRanges),
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_differ_per_slot_and_session() {
        let a = AgentId::derive(b"s1", "render", 0);
        assert_eq!(a, AgentId::derive(b"s1", "render", 0));
        assert_ne!(a, AgentId::derive(b"s1", "render", 1));
        assert_ne!(a, AgentId::derive(b"s2", "render", 0));
    }

    #[test]
    fn template_embeds_slot() {
        let template = AgentTemplate::new("render", RenderStyle::Points)
            .with_constant(ConstantMapping::PointSize(2.));
        let agent = template.instantiate(b"s", 3, Duration::from_millis(1500));
        assert_eq!(agent.slot, 3);
        assert_eq!(agent.deadline(), Duration::from_millis(1500));
        assert_eq!(agent.constants, vec![ConstantMapping::PointSize(2.)]);
    }
}
