//! Scene fragments: the serialized partial scene graphs nodes send back to
//! the client.
//!
//! A fragment is an arena of [`SceneNode`]s addressed by index, rooted at
//! `root`. Children always refer to earlier entries, so a fragment is a tree
//! by construction and archives without recursive types.

use rkyv::{Archive, Deserialize, Serialize};

pub type NodeIndex = u32;

#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Primitive {
    Points,
    Lines,
    Triangles,
    /// Four vertices per quad, counter-clockwise.
    Quads,
}

/// Vertex data for one drawable.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct Geometry {
    pub primitive: Primitive,
    /// `x, y, z` triples.
    pub coordinates: Vec<f32>,
    /// `r, g, b, a` per vertex; empty if the appearance color applies.
    pub colors: Vec<u8>,
    /// `s, t` pairs; empty unless textured.
    pub texture_coords: Vec<f32>,
}

impl Geometry {
    pub fn vertex_count(&self) -> usize {
        self.coordinates.len() / 3
    }

    pub fn byte_len(&self) -> usize {
        self.coordinates.len() * 4 + self.colors.len() + self.texture_coords.len() * 4
    }
}

/// Packed `0xAARRGGBB` pixels, row major.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl PixelBuffer {
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((x + y * self.width) as usize).copied()
    }
}

/// A drawable with everything needed to rebuild its appearance on the
/// client: geometry, rendering attributes, optional color/alpha overrides
/// and an optional texture.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct Appearance {
    pub geometry: Geometry,
    pub point_size: f32,
    pub line_width: f32,
    pub alpha: Option<f32>,
    pub color: Option<[f32; 3]>,
    pub image: Option<PixelBuffer>,
    /// Power-of-two texture dimensions the image is padded to, or zero.
    pub texture_width: u32,
    pub texture_height: u32,
}

impl Appearance {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            point_size: 1.,
            line_width: 1.,
            alpha: None,
            color: None,
            image: None,
            texture_width: 0,
            texture_height: 0,
        }
    }

    pub fn with_image(mut self, image: PixelBuffer) -> Self {
        self.texture_width = image.width.next_power_of_two();
        self.texture_height = image.height.next_power_of_two();
        self.image = Some(image);
        self
    }

    pub fn byte_len(&self) -> usize {
        self.geometry.byte_len()
            + self.image.as_ref().map_or(0, |i| i.pixels.len() * 4)
    }
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum SwitchKind {
    /// Child `n` is shown when the named display axis is nearest to
    /// `values[n]`.
    ControlBound { axis: String, values: Vec<f64> },
    /// Exactly three children: slice stacks along x, y and z. The client
    /// expands them into six view-ordered groups.
    OrderingOnly,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum SceneNode {
    Group(Vec<NodeIndex>),
    Switch {
        kind: SwitchKind,
        children: Vec<NodeIndex>,
    },
    Appearance(Appearance),
}

impl SceneNode {
    pub fn children(&self) -> &[NodeIndex] {
        match self {
            SceneNode::Group(children) | SceneNode::Switch { children, .. } => {
                children
            }
            SceneNode::Appearance(_) => &[],
        }
    }
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct SceneFragment {
    nodes: Vec<SceneNode>,
    root: NodeIndex,
}

impl SceneFragment {
    /// A fragment holding only an empty group.
    pub fn empty() -> Self {
        Self {
            nodes: vec![SceneNode::Group(Vec::new())],
            root: 0,
        }
    }

    pub fn builder() -> FragmentBuilder {
        FragmentBuilder::default()
    }

    pub fn root_index(&self) -> NodeIndex {
        self.root
    }

    pub fn root(&self) -> Option<&SceneNode> {
        self.node(self.root)
    }

    pub fn node(&self, index: NodeIndex) -> Option<&SceneNode> {
        self.nodes.get(index as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.appearances().next().is_none()
    }

    pub fn appearances(&self) -> impl Iterator<Item = &Appearance> {
        self.nodes.iter().filter_map(|n| match n {
            SceneNode::Appearance(a) => Some(a),
            _ => None,
        })
    }

    pub fn byte_len(&self) -> usize {
        self.appearances().map(Appearance::byte_len).sum()
    }
}

/// Appends nodes bottom-up; every index handed out is valid as a child of
/// nodes added later.
#[derive(Debug, Default)]
pub struct FragmentBuilder {
    nodes: Vec<SceneNode>,
}

impl FragmentBuilder {
    fn push(&mut self, node: SceneNode) -> NodeIndex {
        self.nodes.push(node);
        (self.nodes.len() - 1) as NodeIndex
    }

    pub fn leaf(&mut self, appearance: Appearance) -> NodeIndex {
        self.push(SceneNode::Appearance(appearance))
    }

    pub fn group(&mut self, children: Vec<NodeIndex>) -> NodeIndex {
        self.push(SceneNode::Group(children))
    }

    pub fn switch(&mut self, kind: SwitchKind, children: Vec<NodeIndex>) -> NodeIndex {
        self.push(SceneNode::Switch { kind, children })
    }

    pub fn finish(self, root: NodeIndex) -> SceneFragment {
        SceneFragment {
            nodes: self.nodes,
            root,
        }
    }
}
