//! Turning node data into scene fragments.

use std::mem::size_of;

use super::{
    agent::{AxisMapping, ComputeAgent, ConstantMapping, RenderStyle},
    error::{Error, Result},
    grid::{Field, Grid3, NodeData},
    scene::{
        Appearance, FragmentBuilder, Geometry, NodeIndex, PixelBuffer, Primitive,
        SceneFragment, SwitchKind,
    },
};

/// Everything a depictor needs to know about how the data should look.
#[derive(Debug, Clone, PartialEq)]
pub struct DepictParams {
    pub style: RenderStyle,
    pub maps: Vec<AxisMapping>,
    pub constants: Vec<ConstantMapping>,
}

impl DepictParams {
    pub fn new(style: RenderStyle) -> Self {
        Self {
            style,
            maps: Vec::new(),
            constants: Vec::new(),
        }
    }

    /// True if `axis` is mapped to an animation or select-value control.
    pub fn selects(&self, axis: &str) -> bool {
        self.maps
            .iter()
            .any(|m| m.scalar == axis && m.display.is_selector())
    }

    fn alpha(&self) -> Option<f32> {
        self.constants.iter().rev().find_map(|c| match c {
            ConstantMapping::Alpha(a) => Some(*a),
            _ => None,
        })
    }

    fn apply(&self, appearance: &mut Appearance) {
        for constant in &self.constants {
            match *constant {
                ConstantMapping::Alpha(a) => appearance.alpha = Some(a),
                ConstantMapping::Color(c) => appearance.color = Some(c),
                ConstantMapping::PointSize(s) => appearance.point_size = s,
                ConstantMapping::LineWidth(w) => appearance.line_width = w,
            }
        }
    }
}

impl From<&ComputeAgent> for DepictParams {
    fn from(agent: &ComputeAgent) -> Self {
        Self {
            style: agent.style,
            maps: agent.maps.clone(),
            constants: agent.constants.clone(),
        }
    }
}

/// Byte allowance for one fragment. Every allocation a depictor makes is
/// charged here first, then reserved fallibly.
#[derive(Debug, Clone)]
pub struct Budget {
    remaining: usize,
}

impl Budget {
    pub fn new(bytes: usize) -> Self {
        Self { remaining: bytes }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn take(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.remaining {
            Err(Error::ResourceExhausted(format!(
                "fragment needs {} more bytes, {} left",
                bytes, self.remaining
            )))?
        }
        self.remaining -= bytes;
        Ok(())
    }

    /// An empty vector with room for `len` elements.
    pub fn vec<T>(&mut self, len: usize) -> Result<Vec<T>> {
        let bytes = len
            .checked_mul(size_of::<T>())
            .ok_or_else(|| Error::ResourceExhausted(format!("{} elements", len)))?;
        self.take(bytes)?;
        let mut v = Vec::new();
        v.try_reserve_exact(len)?;
        Ok(v)
    }
}

pub trait Depictor: Send + Sync {
    fn depict(
        &self,
        data: &NodeData,
        params: &DepictParams,
        budget: &mut Budget,
    ) -> Result<SceneFragment>;
}

/// Points for scattered data, textured slice stacks for volumes, and a
/// switch or group over the steps of a sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDepictor;

impl Depictor for DefaultDepictor {
    fn depict(
        &self,
        data: &NodeData,
        params: &DepictParams,
        budget: &mut Budget,
    ) -> Result<SceneFragment> {
        let mut b = SceneFragment::builder();
        let root = match data {
            NodeData::Field(field) => {
                let range = field.value_range();
                let child = field_into(&mut b, field, range, params, budget)?;
                b.group(vec![child])
            }
            NodeData::Sequence {
                axis,
                steps,
                fields,
            } => {
                // one color scale across every step
                let range = fields
                    .iter()
                    .filter_map(Field::value_range)
                    .reduce(|(lo, hi), (l, h)| (lo.min(l), hi.max(h)));
                let mut children = Vec::with_capacity(fields.len());
                for field in fields {
                    children.push(field_into(&mut b, field, range, params, budget)?);
                }
                if params.selects(axis) {
                    let kind = SwitchKind::ControlBound {
                        axis: axis.clone(),
                        values: steps.clone(),
                    };
                    let switch = b.switch(kind, children);
                    b.group(vec![switch])
                } else {
                    b.group(children)
                }
            }
        };
        Ok(b.finish(root))
    }
}

fn field_into(
    b: &mut FragmentBuilder,
    field: &Field,
    range: Option<(f32, f32)>,
    params: &DepictParams,
    budget: &mut Budget,
) -> Result<NodeIndex> {
    match (params.style, field.domain.regular_grid()) {
        (RenderStyle::Volume, Some(grid)) => volume_into(b, grid, field, range, params, budget),
        _ => {
            let appearance = points(field, range, params, budget)?;
            Ok(b.leaf(appearance))
        }
    }
}

fn points(
    field: &Field,
    range: Option<(f32, f32)>,
    params: &DepictParams,
    budget: &mut Budget,
) -> Result<Appearance> {
    let samples = field.domain.samples();
    let mut coordinates: Vec<f32> = budget.vec(samples.len() * 3)?;
    let mut colors: Vec<u8> = budget.vec(samples.len() * 4)?;
    let alpha = params.alpha().unwrap_or(1.);
    for (p, v) in samples.iter().zip(&field.values) {
        coordinates.extend_from_slice(p);
        colors.extend_from_slice(&rgba(*v, range, alpha));
    }
    let mut appearance = Appearance::new(Geometry {
        primitive: Primitive::Points,
        coordinates,
        colors,
        texture_coords: Vec::new(),
    });
    params.apply(&mut appearance);
    Ok(appearance)
}

/// An ordering-only switch over three stacks of textured slices, one stack
/// per grid axis, each slice ordered by ascending index.
fn volume_into(
    b: &mut FragmentBuilder,
    grid: &Grid3,
    field: &Field,
    range: Option<(f32, f32)>,
    params: &DepictParams,
    budget: &mut Budget,
) -> Result<NodeIndex> {
    let [nx, ny, nz] = grid.lengths();
    let alpha = params.alpha().unwrap_or(0.5);
    let value = |i, j, k| field.values[grid.index(i, j, k)];
    let mut stacks = Vec::with_capacity(3);

    let mut x_stack = Vec::with_capacity(nx);
    for i in 0..nx {
        let corners = [
            grid.sample(i, 0, 0),
            grid.sample(i, ny - 1, 0),
            grid.sample(i, ny - 1, nz - 1),
            grid.sample(i, 0, nz - 1),
        ];
        let quad = slice(corners, ny, nz, |u, w| value(i, u, w), range, alpha, params, budget)?;
        x_stack.push(b.leaf(quad));
    }
    stacks.push(b.group(x_stack));

    let mut y_stack = Vec::with_capacity(ny);
    for j in 0..ny {
        let corners = [
            grid.sample(0, j, 0),
            grid.sample(nx - 1, j, 0),
            grid.sample(nx - 1, j, nz - 1),
            grid.sample(0, j, nz - 1),
        ];
        let quad = slice(corners, nx, nz, |u, w| value(u, j, w), range, alpha, params, budget)?;
        y_stack.push(b.leaf(quad));
    }
    stacks.push(b.group(y_stack));

    let mut z_stack = Vec::with_capacity(nz);
    for k in 0..nz {
        let corners = [
            grid.sample(0, 0, k),
            grid.sample(nx - 1, 0, k),
            grid.sample(nx - 1, ny - 1, k),
            grid.sample(0, ny - 1, k),
        ];
        let quad = slice(corners, nx, ny, |u, w| value(u, w, k), range, alpha, params, budget)?;
        z_stack.push(b.leaf(quad));
    }
    stacks.push(b.group(z_stack));

    Ok(b.switch(SwitchKind::OrderingOnly, stacks))
}

#[allow(clippy::too_many_arguments)]
fn slice<F>(
    corners: [[f32; 3]; 4],
    width: usize,
    height: usize,
    value: F,
    range: Option<(f32, f32)>,
    alpha: f32,
    params: &DepictParams,
    budget: &mut Budget,
) -> Result<Appearance>
where
    F: Fn(usize, usize) -> f32,
{
    let mut pixels: Vec<u32> = budget.vec(width * height)?;
    for w in 0..height {
        for u in 0..width {
            pixels.push(argb(rgba(value(u, w), range, alpha)));
        }
    }
    let image = PixelBuffer {
        width: width as u32,
        height: height as u32,
        pixels,
    };
    let mut coordinates: Vec<f32> = budget.vec(12)?;
    for corner in &corners {
        coordinates.extend_from_slice(corner);
    }
    let (s, t) = (
        width as f32 / width.next_power_of_two() as f32,
        height as f32 / height.next_power_of_two() as f32,
    );
    let mut appearance = Appearance::new(Geometry {
        primitive: Primitive::Quads,
        coordinates,
        colors: Vec::new(),
        texture_coords: vec![0., 0., s, 0., s, t, 0., t],
    })
    .with_image(image);
    params.apply(&mut appearance);
    Ok(appearance)
}

/// Blue through green to red over `range`; missing values are transparent.
fn rgba(value: f32, range: Option<(f32, f32)>, alpha: f32) -> [u8; 4] {
    if !value.is_finite() {
        return [0; 4];
    }
    let t = match range {
        Some((lo, hi)) if hi > lo => ((value - lo) / (hi - lo)).clamp(0., 1.),
        _ => 0.5,
    };
    let channel = |c: f32| (c * 255.).round() as u8;
    [
        channel(t),
        channel(1. - (2. * t - 1.).abs()),
        channel(1. - t),
        channel(alpha.clamp(0., 1.)),
    ]
}

fn argb([r, g, b, a]: [u8; 4]) -> u32 {
    u32::from_be_bytes([a, r, g, b])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        agent::DisplayAxis,
        grid::Domain,
        scene::SceneNode,
        space::CoordSpace,
    };

    fn cube(n: usize) -> Field {
        let last = (n - 1) as f32;
        let grid = Grid3::linear([0.; 3], [last; 3], [n; 3], CoordSpace::meters(3)).unwrap();
        Field::from_fn("t", grid, |p| p[0] + p[1] + p[2])
    }

    fn unlimited() -> Budget {
        Budget::new(usize::MAX)
    }

    #[test]
    fn points_carry_one_vertex_per_sample() {
        let data = NodeData::Field(cube(3));
        let params = DepictParams::new(RenderStyle::Points);
        let fragment = DefaultDepictor.depict(&data, &params, &mut unlimited()).unwrap();
        let appearance = fragment.appearances().next().unwrap();
        assert_eq!(appearance.geometry.vertex_count(), 27);
        assert_eq!(appearance.geometry.colors.len(), 27 * 4);
    }

    #[test]
    fn volumes_become_three_slice_stacks() {
        let data = NodeData::Field(cube(4));
        let params = DepictParams::new(RenderStyle::Volume);
        let fragment = DefaultDepictor.depict(&data, &params, &mut unlimited()).unwrap();
        let root = fragment.root().unwrap();
        let switch = fragment.node(root.children()[0]).unwrap();
        let SceneNode::Switch {
            kind: SwitchKind::OrderingOnly,
            children,
        } = switch
        else {
            panic!("expected an ordering-only switch, got {:?}", switch);
        };
        assert_eq!(children.len(), 3);
        for stack in children {
            assert_eq!(fragment.node(*stack).unwrap().children().len(), 4);
        }
        let first = fragment.appearances().next().unwrap();
        let image = first.image.as_ref().unwrap();
        assert_eq!((image.width, image.height), (4, 4));
        // corner (0, 0, 0) holds the minimum value, fully blue
        assert_eq!(image.pixel(0, 0), Some(u32::from_be_bytes([128, 0, 0, 255])));
    }

    #[test]
    fn flat_grids_fall_back_to_points() {
        let flat = Grid3::linear([0.; 3], [2., 2., 0.], [3, 3, 1], CoordSpace::meters(3)).unwrap();
        let data = NodeData::Field(Field::from_fn("t", flat, |p| p[0]));
        let params = DepictParams::new(RenderStyle::Volume);
        let fragment = DefaultDepictor.depict(&data, &params, &mut unlimited()).unwrap();
        let appearance = fragment.appearances().next().unwrap();
        assert_eq!(appearance.geometry.primitive, Primitive::Points);
    }

    #[test]
    fn selected_sequences_become_control_bound_switches() {
        let data = NodeData::sequence("time", vec![0., 30., 60.], vec![cube(2), cube(2), cube(2)])
            .unwrap();
        let mut params = DepictParams::new(RenderStyle::Points);
        let plain = DefaultDepictor.depict(&data, &params, &mut unlimited()).unwrap();
        assert_eq!(plain.root().unwrap().children().len(), 3);

        params.maps.push(AxisMapping::new("time", DisplayAxis::Animation));
        let switched = DefaultDepictor.depict(&data, &params, &mut unlimited()).unwrap();
        let child = switched.node(switched.root().unwrap().children()[0]).unwrap();
        assert!(matches!(
            child,
            SceneNode::Switch { kind: SwitchKind::ControlBound { axis, values }, children }
                if axis == "time" && values.len() == 3 && children.len() == 3
        ));
    }

    #[test]
    fn constants_override_appearance() {
        let data = NodeData::Field(cube(2));
        let mut params = DepictParams::new(RenderStyle::Points);
        params.constants = vec![ConstantMapping::PointSize(4.), ConstantMapping::Alpha(0.25)];
        let fragment = DefaultDepictor.depict(&data, &params, &mut unlimited()).unwrap();
        let appearance = fragment.appearances().next().unwrap();
        assert_eq!(appearance.point_size, 4.);
        assert_eq!(appearance.alpha, Some(0.25));
        assert_eq!(appearance.geometry.colors[3], 64);
    }

    #[test]
    fn budget_exhaustion_is_reported() {
        let data = NodeData::Field(cube(5));
        let params = DepictParams::new(RenderStyle::Points);
        let err = DefaultDepictor
            .depict(&data, &params, &mut Budget::new(100))
            .unwrap_err();
        assert!(err.is_exhaustion());
    }

    #[test]
    fn missing_values_are_transparent() {
        let field = Field::new(
            "s",
            Domain::Scattered {
                samples: vec![[0.; 3], [1.; 3]],
                space: CoordSpace::meters(3),
            },
            vec![f32::NAN, 1.],
        )
        .unwrap();
        let params = DepictParams::new(RenderStyle::Points);
        let fragment = DefaultDepictor
            .depict(&NodeData::Field(field), &params, &mut unlimited())
            .unwrap();
        let colors = &fragment.appearances().next().unwrap().geometry.colors;
        assert_eq!(&colors[..4], &[0, 0, 0, 0]);
    }
}
