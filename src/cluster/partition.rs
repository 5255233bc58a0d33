use rkyv::{Archive, Deserialize, Serialize};

use super::{
    error::{Error, Result},
    grid::Grid3,
    space::{squared_distance, CoordSpace, Point},
};

/// One evenly sampled axis of a linear representative set.
#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct LinearAxis {
    pub first: f64,
    pub last: f64,
    pub len: usize,
}

impl LinearAxis {
    pub fn new(first: f64, last: f64, len: usize) -> Self {
        Self { first, last, len }
    }

    /// Nearest sample index, or `None` more than half a step outside.
    fn index_of(&self, value: f64) -> Option<usize> {
        if !value.is_finite() {
            return None;
        }
        if self.len == 1 {
            return Some(0);
        }
        let step = (self.last - self.first) / (self.len - 1) as f64;
        if step == 0. {
            return Some(0);
        }
        let index = (0.5 + (value - self.first) / step).floor();
        if index < 0. || index >= self.len as f64 {
            None
        } else {
            Some(index as usize)
        }
    }

    fn value(&self, index: usize) -> f64 {
        if self.len <= 1 {
            self.first
        } else {
            self.first + (self.last - self.first) * index as f64 / (self.len - 1) as f64
        }
    }
}

/// How the representative samples of a partition are laid out.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum Representatives {
    /// Arbitrary points; a query belongs to the nearest one.
    Scattered(Vec<Vec<f64>>),
    /// A regular lattice indexed directly; slot
    /// `i0 + len0 * (i1 + len1 * (i2 + ...))`.
    Linear(Vec<LinearAxis>),
}

/// Outcome of resolving a point against a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Owned by worker slot `n`.
    Slot(usize),
    /// The point cannot be expressed in the partition's space; it belongs
    /// to the client's own non-partitioned slot.
    Fallback,
    /// Inside the partition's space but outside every region.
    Unowned,
}

/// Maps points in a coordinate space to the worker slot that owns them.
/// Built once per session by the client and immutable afterwards.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct SpatialPartition {
    representatives: Representatives,
    space: CoordSpace,
}

impl SpatialPartition {
    pub fn scattered(space: CoordSpace, points: Vec<Vec<f64>>) -> Result<Self> {
        if points.is_empty() {
            Err(Error::config("partition needs at least one point"))?
        }
        if let Some(p) = points.iter().find(|p| p.len() != space.dimension()) {
            Err(Error::config(format!(
                "representative point {:?} is not {}-dimensional",
                p,
                space.dimension()
            )))?
        }
        Ok(Self {
            representatives: Representatives::Scattered(points),
            space,
        })
    }

    pub fn linear(space: CoordSpace, axes: Vec<LinearAxis>) -> Result<Self> {
        if axes.len() != space.dimension() {
            Err(Error::config(format!(
                "{} axes for a {}-dimensional space",
                axes.len(),
                space.dimension()
            )))?
        }
        if axes.iter().any(|a| a.len == 0) {
            Err(Error::config("partition axes need at least one sample"))?
        }
        Ok(Self {
            representatives: Representatives::Linear(axes),
            space,
        })
    }

    /// `divide × divide` representatives spread over the x/y extent of
    /// `grid` at its middle z level; pairs with [`Grid3::split`].
    pub fn from_grid_corners(grid: &Grid3, divide: usize) -> Result<Self> {
        if divide == 0 {
            Err(Error::config("divide must be >= 1"))?
        }
        let [x_len, y_len, z_len] = grid.lengths();
        let spread = |n: usize, len: usize| {
            if divide == 1 {
                0
            } else {
                n * (len - 1) / (divide - 1)
            }
        };
        let mut points = Vec::with_capacity(divide * divide);
        for j in 0..divide {
            for i in 0..divide {
                let p = grid.sample(spread(i, x_len), spread(j, y_len), z_len / 2);
                points.push(p.iter().map(|&c| c as f64).collect());
            }
        }
        Self::scattered(grid.space().clone(), points)
    }

    /// Number of representative samples, i.e. worker slots.
    pub fn size(&self) -> usize {
        match &self.representatives {
            Representatives::Scattered(points) => points.len(),
            Representatives::Linear(axes) => axes.iter().map(|a| a.len).product(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.space.dimension()
    }

    pub fn space(&self) -> &CoordSpace {
        &self.space
    }

    pub fn representatives(&self) -> &Representatives {
        &self.representatives
    }

    /// Coordinates of representative `slot`.
    pub fn representative(&self, slot: usize) -> Option<Vec<f64>> {
        if slot >= self.size() {
            return None;
        }
        match &self.representatives {
            Representatives::Scattered(points) => points.get(slot).cloned(),
            Representatives::Linear(axes) => {
                let mut rest = slot;
                let mut coords = Vec::with_capacity(axes.len());
                for axis in axes {
                    coords.push(axis.value(rest % axis.len));
                    rest /= axis.len;
                }
                Some(coords)
            }
        }
    }

    pub fn resolve(&self, point: &Point) -> Resolution {
        if point.dimension() != self.dimension() {
            return Resolution::Fallback;
        }
        if !point.space.can_convert(&self.space) {
            return Resolution::Fallback;
        }
        if self.size() == 1 {
            return Resolution::Slot(0);
        }
        let coords = match point.in_space(&self.space) {
            Some(coords) => coords,
            None => return Resolution::Fallback,
        };
        match self.index_of(&coords) {
            Some(slot) => Resolution::Slot(slot),
            None => Resolution::Unowned,
        }
    }

    fn index_of(&self, coords: &[f64]) -> Option<usize> {
        match &self.representatives {
            Representatives::Scattered(points) => {
                if coords.iter().any(|c| !c.is_finite()) {
                    return None;
                }
                points
                    .iter()
                    .map(|p| squared_distance(p, coords))
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.total_cmp(b))
                    .map(|(slot, _)| slot)
            }
            Representatives::Linear(axes) => {
                let mut slot = 0;
                let mut stride = 1;
                for (axis, value) in axes.iter().zip(coords) {
                    slot += axis.index_of(*value)? * stride;
                    stride *= axis.len;
                }
                Some(slot)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::space::{Frame, Unit};

    fn quadrants() -> SpatialPartition {
        SpatialPartition::linear(
            CoordSpace::meters(2),
            vec![LinearAxis::new(0., 10., 2), LinearAxis::new(0., 10., 2)],
        )
        .unwrap()
    }

    fn at(x: f64, y: f64) -> Point {
        Point::new(vec![x, y], CoordSpace::meters(2))
    }

    #[test]
    fn quadrant_centroids() {
        let ps = quadrants();
        assert_eq!(ps.size(), 4);
        assert_eq!(ps.resolve(&at(2.5, 2.5)), Resolution::Slot(0));
        assert_eq!(ps.resolve(&at(7.5, 2.5)), Resolution::Slot(1));
        assert_eq!(ps.resolve(&at(2.5, 7.5)), Resolution::Slot(2));
        assert_eq!(ps.resolve(&at(7.5, 7.5)), Resolution::Slot(3));
    }

    #[test]
    fn scattered_nearest_neighbour() {
        let ps = SpatialPartition::scattered(
            CoordSpace::meters(2),
            vec![
                vec![0., 0.],
                vec![10., 0.],
                vec![0., 10.],
                vec![10., 10.],
            ],
        )
        .unwrap();
        assert_eq!(ps.resolve(&at(7.5, 2.5)), Resolution::Slot(1));
        assert_eq!(ps.resolve(&at(f64::NAN, 2.5)), Resolution::Unowned);
    }

    #[test]
    fn converts_units_before_lookup() {
        let ps = quadrants();
        let km = CoordSpace::cartesian(vec![Unit::Kilometers, Unit::Kilometers]);
        let p = Point::new(vec![0.0075, 0.0025], km);
        assert_eq!(ps.resolve(&p), Resolution::Slot(1));
    }

    #[test]
    fn single_representative_always_slot_zero() {
        let ps = SpatialPartition::scattered(CoordSpace::meters(2), vec![vec![3., 3.]])
            .unwrap();
        for p in [at(-1e9, 4.), at(0., 0.), at(1e12, -7.)] {
            assert_eq!(ps.resolve(&p), Resolution::Slot(0));
        }
    }

    #[test]
    fn unconvertible_points_fall_back() {
        let ps = quadrants();
        let geo = CoordSpace::new(Frame::Geodetic, vec![Unit::Degrees, Unit::Degrees]);
        assert_eq!(ps.resolve(&Point::new(vec![1., 1.], geo)), Resolution::Fallback);
        let three = Point::new(vec![1., 1., 1.], CoordSpace::meters(3));
        assert_eq!(ps.resolve(&three), Resolution::Fallback);
    }

    #[test]
    fn outside_the_lattice_is_unowned() {
        assert_eq!(quadrants().resolve(&at(20., 2.)), Resolution::Unowned);
        assert_eq!(quadrants().resolve(&at(-6., 2.)), Resolution::Unowned);
    }

    #[test]
    fn representatives_of_linear_partition() {
        let ps = quadrants();
        assert_eq!(ps.representative(1), Some(vec![10., 0.]));
        assert_eq!(ps.representative(2), Some(vec![0., 10.]));
        assert_eq!(ps.representative(4), None);
    }

    #[test]
    fn corners_of_a_grid() {
        let grid = Grid3::linear([0.; 3], [8., 8., 4.], [9, 9, 5], CoordSpace::meters(3))
            .unwrap();
        let ps = SpatialPartition::from_grid_corners(&grid, 2).unwrap();
        assert_eq!(ps.size(), 4);
        assert_eq!(ps.representative(3), Some(vec![8., 8., 2.]));
        let p = Point::new(vec![6., 1., 0.], CoordSpace::meters(3));
        assert_eq!(ps.resolve(&p), Resolution::Slot(1));
    }
}
