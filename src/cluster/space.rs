use std::f64::consts::PI;
use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

/// What an axis measures. Values only convert between units of the same
/// quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Length,
    Angle,
    Scalar,
}

#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Unit {
    Centimeters,
    Meters,
    Kilometers,

    Inches,
    Feet,
    Yards,
    Miles,

    Degrees,
    Radians,

    /// Dimensionless, e.g. grid indices.
    Scalar,
}

impl Unit {
    pub fn quantity(&self) -> Quantity {
        match self {
            Unit::Degrees | Unit::Radians => Quantity::Angle,
            Unit::Scalar => Quantity::Scalar,
            _ => Quantity::Length,
        }
    }

    /// Size of one unit in the base unit of its quantity (meters, radians).
    pub fn in_base(&self) -> f64 {
        match self {
            Unit::Centimeters => 0.01,
            Unit::Meters => 1.,
            Unit::Kilometers => 1000.,

            Unit::Inches => 0.0254,
            Unit::Feet => 0.3048,
            Unit::Yards => 0.9144,
            Unit::Miles => 1609.344,

            Unit::Degrees => PI / 180.,
            Unit::Radians => 1.,

            Unit::Scalar => 1.,
        }
    }

    pub fn abbreviation(&self) -> &'static str {
        match self {
            Unit::Centimeters => "cm",
            Unit::Meters => "m",
            Unit::Kilometers => "km",

            Unit::Inches => "in",
            Unit::Feet => "ft",
            Unit::Yards => "yd",
            Unit::Miles => "mi",

            Unit::Degrees => "deg",
            Unit::Radians => "rad",

            Unit::Scalar => "",
        }
    }

    /// Factor taking a value in `self` to a value in `to`, if the two
    /// measure the same quantity.
    pub fn ratio_to(&self, to: Unit) -> Option<f64> {
        if self.quantity() != to.quantity() {
            return None;
        }
        if *self == to {
            return Some(1.);
        }
        Some(self.in_base() / to.in_base())
    }
}

/// The reference frame of a coordinate space. Points only convert between
/// spaces that share a frame.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Frame {
    Cartesian,
    /// latitude, longitude and optional altitude
    Geodetic,
    /// Application-specific frame, e.g. `"image"` for pixel coordinates.
    Named(String),
}

/// A frame plus one unit per axis.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct CoordSpace {
    pub frame: Frame,
    pub units: Vec<Unit>,
}

impl CoordSpace {
    pub fn new(frame: Frame, units: Vec<Unit>) -> Self {
        Self { frame, units }
    }

    pub fn cartesian(units: Vec<Unit>) -> Self {
        Self::new(Frame::Cartesian, units)
    }

    /// Cartesian meters in `dimension` axes.
    pub fn meters(dimension: usize) -> Self {
        Self::cartesian(vec![Unit::Meters; dimension])
    }

    pub fn dimension(&self) -> usize {
        self.units.len()
    }

    pub fn can_convert(&self, to: &CoordSpace) -> bool {
        self.frame == to.frame
            && self.dimension() == to.dimension()
            && self
                .units
                .iter()
                .zip(&to.units)
                .all(|(a, b)| a.quantity() == b.quantity())
    }

    /// Expresses `coords` (in this space) in `to`. `None` when the spaces
    /// cannot be reconciled or `coords` has the wrong dimension.
    pub fn convert(&self, coords: &[f64], to: &CoordSpace) -> Option<Vec<f64>> {
        if coords.len() != self.dimension() || !self.can_convert(to) {
            return None;
        }
        coords
            .iter()
            .zip(self.units.iter().zip(&to.units))
            .map(|(v, (from, to))| from.ratio_to(*to).map(|r| v * r))
            .collect()
    }
}

impl fmt::Display for CoordSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let units: Vec<_> = self.units.iter().map(|u| u.abbreviation()).collect();
        write!(f, "{:?}({})", self.frame, units.join(","))
    }
}

/// A query point together with the space its coordinates are expressed in.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub coords: Vec<f64>,
    pub space: CoordSpace,
}

impl Point {
    pub fn new(coords: Vec<f64>, space: CoordSpace) -> Self {
        Self { coords, space }
    }

    pub fn dimension(&self) -> usize {
        self.coords.len()
    }

    /// This point's coordinates in `to`, if convertible.
    pub fn in_space(&self, to: &CoordSpace) -> Option<Vec<f64>> {
        self.space.convert(&self.coords, to)
    }
}

pub(crate) fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_equal(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn unit_conversion() {
        let km = CoordSpace::cartesian(vec![Unit::Kilometers, Unit::Miles]);
        let m = CoordSpace::meters(2);
        let out = km.convert(&[1.5, 1.], &m).unwrap();
        assert!(approx_equal(out[0], 1500.));
        assert!(approx_equal(out[1], 1609.344));
    }

    #[test]
    fn angles_convert_among_themselves() {
        let deg = CoordSpace::new(Frame::Geodetic, vec![Unit::Degrees, Unit::Degrees]);
        let rad = CoordSpace::new(Frame::Geodetic, vec![Unit::Radians, Unit::Radians]);
        let out = deg.convert(&[180., 90.], &rad).unwrap();
        assert!(approx_equal(out[0], PI));
        assert!(approx_equal(out[1], PI / 2.));
    }

    #[test]
    fn incompatible_spaces() {
        let m = CoordSpace::meters(2);
        let geo = CoordSpace::new(Frame::Geodetic, vec![Unit::Degrees, Unit::Degrees]);
        let mixed = CoordSpace::cartesian(vec![Unit::Meters, Unit::Degrees]);
        assert!(!m.can_convert(&geo));
        assert!(!m.can_convert(&mixed));
        assert!(!m.can_convert(&CoordSpace::meters(3)));
        assert_eq!(m.convert(&[1.], &m), None);
    }
}
