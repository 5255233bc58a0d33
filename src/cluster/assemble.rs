//! Client-side composition of per-slot fragments into one scene.

use hashbrown::{HashMap, HashSet};
use tracing::{debug, warn};

use super::{
    error::{Error, Result},
    scene::{Appearance, NodeIndex, SceneFragment, SceneNode, SwitchKind},
};

/// Current value of each named display control (animation, select value).
#[derive(Debug, Clone, Default)]
pub struct AxisControls {
    values: HashMap<String, f64>,
}

impl AxisControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, axis: impl Into<String>, value: f64) {
        self.values.insert(axis.into(), value);
    }

    pub fn get(&self, axis: &str) -> Option<f64> {
        self.values.get(axis).copied()
    }

    pub fn remove(&mut self, axis: &str) -> Option<f64> {
        self.values.remove(axis)
    }
}

/// A switch following a display control.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSwitch {
    pub axis: String,
    pub values: Vec<f64>,
    pub children: Vec<RenderNode>,
    pub selected: Option<usize>,
}

impl ControlSwitch {
    /// Shows the child whose step value is nearest `value`.
    pub fn select(&mut self, value: f64) {
        self.selected = self
            .values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .min_by(|(_, a), (_, b)| (*a - value).abs().total_cmp(&(*b - value).abs()))
            .map(|(n, _)| n);
    }

    pub fn selected_child(&self) -> Option<&RenderNode> {
        self.children.get(self.selected?)
    }
}

/// Six orderings of the same slices: ascending x, y, z, then descending
/// x, y, z. One is shown at a time, chosen from the view direction.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSwitch {
    pub orderings: Vec<RenderNode>,
    pub selected: usize,
}

impl ViewSwitch {
    pub fn orient(&mut self, view: [f32; 3]) {
        self.selected = ordering_for_view(view);
    }

    pub fn selected_child(&self) -> Option<&RenderNode> {
        self.orderings.get(self.selected)
    }
}

/// `view` points from the scene toward the eye. The dominant axis picks the
/// stack; a negative component picks its reversed ordering.
pub fn ordering_for_view(view: [f32; 3]) -> usize {
    let (axis, component) = view
        .iter()
        .copied()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.abs().total_cmp(&b.abs()))
        .unwrap_or((2, 1.));
    if component < 0. {
        axis + 3
    } else {
        axis
    }
}

/// The client's live scene graph.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderNode {
    Group(Vec<RenderNode>),
    Select(ControlSwitch),
    ViewOrdered(ViewSwitch),
    Shape(Appearance),
}

impl RenderNode {
    fn for_each_mut<F>(&mut self, f: &mut F)
    where
        F: FnMut(&mut RenderNode),
    {
        f(self);
        match self {
            RenderNode::Group(children) => {
                children.iter_mut().for_each(|c| c.for_each_mut(f))
            }
            RenderNode::Select(switch) => {
                switch.children.iter_mut().for_each(|c| c.for_each_mut(f))
            }
            RenderNode::ViewOrdered(switch) => {
                switch.orderings.iter_mut().for_each(|c| c.for_each_mut(f))
            }
            RenderNode::Shape(_) => {}
        }
    }

    fn collect_visible<'a>(&'a self, out: &mut Vec<&'a Appearance>) {
        match self {
            RenderNode::Group(children) => {
                children.iter().for_each(|c| c.collect_visible(out))
            }
            RenderNode::Select(switch) => {
                if let Some(child) = switch.selected_child() {
                    child.collect_visible(out);
                }
            }
            RenderNode::ViewOrdered(switch) => {
                if let Some(child) = switch.selected_child() {
                    child.collect_visible(out);
                }
            }
            RenderNode::Shape(appearance) => out.push(appearance),
        }
    }
}

/// The assembled scene: a group with one child per contributing slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub root: RenderNode,
    pub diagnostics: Vec<String>,
}

impl Composite {
    pub fn children(&self) -> &[RenderNode] {
        match &self.root {
            RenderNode::Group(children) => children,
            _ => &[],
        }
    }

    /// Shapes that would be drawn with the current switch selections, in
    /// drawing order.
    pub fn visible(&self) -> Vec<&Appearance> {
        let mut out = Vec::new();
        self.root.collect_visible(&mut out);
        out
    }

    /// Re-selects every control-bound switch from `controls`.
    pub fn update_controls(&mut self, controls: &AxisControls) {
        self.root.for_each_mut(&mut |node| {
            if let RenderNode::Select(switch) = node {
                if let Some(value) = controls.get(&switch.axis) {
                    switch.select(value);
                }
            }
        });
    }

    /// Re-orders every volume for a new view direction.
    pub fn orient(&mut self, view: [f32; 3]) {
        self.root.for_each_mut(&mut |node| {
            if let RenderNode::ViewOrdered(switch) = node {
                switch.orient(view);
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct ClientAssembler {
    controls: AxisControls,
    view: [f32; 3],
}

impl Default for ClientAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientAssembler {
    pub fn new() -> Self {
        Self {
            controls: AxisControls::new(),
            view: [0., 0., 1.],
        }
    }

    pub fn controls(&self) -> &AxisControls {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut AxisControls {
        &mut self.controls
    }

    pub fn view(&self) -> [f32; 3] {
        self.view
    }

    pub fn set_view(&mut self, view: [f32; 3]) {
        self.view = view;
    }

    /// Wraps every non-null fragment as one child of a new group. A fragment
    /// that cannot be rebuilt is dropped with a diagnostic.
    pub fn assemble(&self, fragments: Vec<Option<SceneFragment>>) -> Composite {
        let mut children = Vec::with_capacity(fragments.len());
        let mut diagnostics = Vec::new();
        for (slot, fragment) in fragments.into_iter().enumerate() {
            let Some(fragment) = fragment else {
                continue;
            };
            let mut seen = HashSet::new();
            match self.rebuild(&fragment, fragment.root_index(), None, &mut seen) {
                Ok(node) => children.push(node),
                Err(e) => {
                    warn!(slot, error = %e, "dropping fragment");
                    diagnostics.push(format!("slot {}: {}", slot, e));
                }
            }
        }
        debug!(children = children.len(), "assembled composite");
        Composite {
            root: RenderNode::Group(children),
            diagnostics,
        }
    }

    /// Every node must sit below its parent and be reached once; the first
    /// rules out cycles, the second shared subtrees.
    fn rebuild(
        &self,
        fragment: &SceneFragment,
        index: NodeIndex,
        parent: Option<NodeIndex>,
        seen: &mut HashSet<NodeIndex>,
    ) -> Result<RenderNode> {
        if parent.is_some_and(|p| index >= p) {
            Err(Error::TransformFailure(format!(
                "node {} is not below its parent",
                index
            )))?
        }
        visit(seen, index)?;
        let node = fragment.node(index).ok_or_else(|| {
            Error::TransformFailure(format!("missing node {}", index))
        })?;
        let children = |seen: &mut HashSet<NodeIndex>| -> Result<Vec<RenderNode>> {
            node.children()
                .iter()
                .map(|&c| self.rebuild(fragment, c, Some(index), seen))
                .collect()
        };
        Ok(match node {
            SceneNode::Appearance(appearance) => RenderNode::Shape(appearance.clone()),
            SceneNode::Group(_) => RenderNode::Group(children(seen)?),
            SceneNode::Switch {
                kind: SwitchKind::ControlBound { axis, values },
                children: kids,
            } => {
                if values.len() != kids.len() {
                    Err(Error::TransformFailure(format!(
                        "switch on {} has {} values for {} children",
                        axis,
                        values.len(),
                        kids.len()
                    )))?
                }
                let value = self.controls.get(axis).ok_or_else(|| {
                    Error::TransformFailure(format!("no control for axis {}", axis))
                })?;
                let mut switch = ControlSwitch {
                    axis: axis.clone(),
                    values: values.clone(),
                    children: children(seen)?,
                    selected: None,
                };
                switch.select(value);
                RenderNode::Select(switch)
            }
            SceneNode::Switch {
                kind: SwitchKind::OrderingOnly,
                children: kids,
            } => RenderNode::ViewOrdered(self.view_switch(fragment, index, kids, seen)?),
        })
    }

    fn view_switch(
        &self,
        fragment: &SceneFragment,
        index: NodeIndex,
        stacks: &[NodeIndex],
        seen: &mut HashSet<NodeIndex>,
    ) -> Result<ViewSwitch> {
        if stacks.len() != 3 {
            Err(Error::TransformFailure(format!(
                "ordering switch needs 3 stacks, got {}",
                stacks.len()
            )))?
        }
        let mut ascending = Vec::with_capacity(3);
        for &stack in stacks {
            if stack >= index {
                Err(Error::TransformFailure(format!(
                    "node {} is not below its parent",
                    stack
                )))?
            }
            visit(seen, stack)?;
            let slices = fragment
                .node(stack)
                .ok_or_else(|| Error::TransformFailure(format!("missing node {}", stack)))?
                .children()
                .iter()
                .map(|&s| {
                    visit(seen, s)?;
                    match fragment.node(s) {
                        Some(SceneNode::Appearance(a)) if s < stack => Ok(a.clone()),
                        _ => Err(Error::TransformFailure(format!(
                            "slice {} is not an appearance below its stack",
                            s
                        ))),
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            ascending.push(slices);
        }
        let descending: Vec<Vec<Appearance>> = ascending
            .iter()
            .map(|slices| slices.iter().rev().cloned().collect())
            .collect();
        let orderings = ascending
            .into_iter()
            .chain(descending)
            .map(|slices| RenderNode::Group(slices.into_iter().map(RenderNode::Shape).collect()))
            .collect();
        Ok(ViewSwitch {
            orderings,
            selected: ordering_for_view(self.view),
        })
    }
}

fn visit(seen: &mut HashSet<NodeIndex>, index: NodeIndex) -> Result<()> {
    if !seen.insert(index) {
        Err(Error::TransformFailure(format!(
            "node {} is reached more than once",
            index
        )))?
    }
    Ok(())
}
