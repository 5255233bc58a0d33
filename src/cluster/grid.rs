use super::{
    error::{Error, Result},
    ranges::DataRanges,
    space::CoordSpace,
};

/// A gridded 3-D sample set. Sample positions are stored explicitly, so the
/// grid may be curvilinear; it is "regular" in topology, not in spacing.
///
/// Sample `(i, j, k)` lives at `i + x_len * (j + y_len * k)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid3 {
    lengths: [usize; 3],
    samples: Vec<[f32; 3]>,
    space: CoordSpace,
}

impl Grid3 {
    pub fn new(
        lengths: [usize; 3],
        samples: Vec<[f32; 3]>,
        space: CoordSpace,
    ) -> Result<Self> {
        if space.dimension() != 3 {
            Err(Error::config(format!(
                "grid space must be 3-dimensional, got {}",
                space
            )))?
        }
        if lengths.iter().any(|&l| l == 0) {
            Err(Error::config("grid lengths must be >= 1"))?
        }
        let expected = lengths[0] * lengths[1] * lengths[2];
        if samples.len() != expected {
            Err(Error::config(format!(
                "grid {:?} needs {} samples, got {}",
                lengths,
                expected,
                samples.len()
            )))?
        }
        Ok(Self {
            lengths,
            samples,
            space,
        })
    }

    /// Evenly spaced grid from `first` to `last` (inclusive) on each axis.
    pub fn linear(
        first: [f32; 3],
        last: [f32; 3],
        lengths: [usize; 3],
        space: CoordSpace,
    ) -> Result<Self> {
        let step = |axis: usize, n: usize| {
            if lengths[axis] <= 1 {
                first[axis]
            } else {
                first[axis]
                    + (last[axis] - first[axis]) * n as f32
                        / (lengths[axis] - 1) as f32
            }
        };
        let [x_len, y_len, z_len] = lengths;
        let mut samples = Vec::with_capacity(x_len * y_len * z_len);
        for k in 0..z_len {
            for j in 0..y_len {
                for i in 0..x_len {
                    samples.push([step(0, i), step(1, j), step(2, k)]);
                }
            }
        }
        Self::new(lengths, samples, space)
    }

    pub fn lengths(&self) -> [usize; 3] {
        self.lengths
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[[f32; 3]] {
        &self.samples
    }

    pub fn space(&self) -> &CoordSpace {
        &self.space
    }

    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.lengths[0] * (j + self.lengths[1] * k)
    }

    pub fn sample(&self, i: usize, j: usize, k: usize) -> [f32; 3] {
        self.samples[self.index(i, j, k)]
    }

    /// Number of axes with more than one sample.
    pub fn manifold_dimension(&self) -> usize {
        self.lengths.iter().filter(|&&l| l > 1).count()
    }

    /// Keeps every `stride`-th sample along each axis, boundary inclusive,
    /// so each axis shrinks to `1 + (len - 1) / stride`. Returns the coarser
    /// grid and, for each of its samples, the source index it came from.
    pub fn downsample(&self, stride: usize) -> (Grid3, Vec<usize>) {
        let stride = stride.max(1);
        let [x_len, y_len, z_len] = self.lengths;
        let new_lengths = [
            1 + (x_len - 1) / stride,
            1 + (y_len - 1) / stride,
            1 + (z_len - 1) / stride,
        ];
        self.pick(new_lengths, |x, y, z| {
            (x * stride, y * stride, z * stride)
        })
    }

    /// Cuts out block `k` of a `divide × divide` split over the x/y axes,
    /// keeping every z level. The last block on each axis absorbs the
    /// remainder.
    pub fn split(&self, divide: usize, k: usize) -> Result<(Grid3, Vec<usize>)> {
        if divide == 0 || k >= divide * divide {
            Err(Error::config(format!(
                "block {} out of range for a {}x{} split",
                k, divide, divide
            )))?
        }
        let [x_len, y_len, z_len] = self.lengths;
        if x_len < divide || y_len < divide {
            Err(Error::config(format!(
                "grid {:?} too small for a {}x{} split",
                self.lengths, divide, divide
            )))?
        }
        let bounds = |block: usize, len: usize| {
            let lo = block * len / divide;
            let hi = if block == divide - 1 {
                len
            } else {
                (block + 1) * len / divide
            };
            (lo, hi)
        };
        let (ig, igp) = bounds(k % divide, x_len);
        let (jg, jgp) = bounds(k / divide, y_len);
        Ok(self.pick([igp - ig, jgp - jg, z_len], |x, y, z| (x + ig, y + jg, z)))
    }

    fn pick<F>(&self, lengths: [usize; 3], source: F) -> (Grid3, Vec<usize>)
    where
        F: Fn(usize, usize, usize) -> (usize, usize, usize),
    {
        let mut indices = Vec::with_capacity(lengths.iter().product());
        for z in 0..lengths[2] {
            for y in 0..lengths[1] {
                for x in 0..lengths[0] {
                    let (i, j, k) = source(x, y, z);
                    indices.push(self.index(i, j, k));
                }
            }
        }
        let samples = indices.iter().map(|&n| self.samples[n]).collect();
        let grid = Grid3 {
            lengths,
            samples,
            space: self.space.clone(),
        };
        (grid, indices)
    }
}

/// The sample set a field is defined over.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    Grid(Grid3),
    Scattered {
        samples: Vec<[f32; 3]>,
        space: CoordSpace,
    },
}

impl Domain {
    pub fn len(&self) -> usize {
        match self {
            Domain::Grid(grid) => grid.len(),
            Domain::Scattered { samples, .. } => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn samples(&self) -> &[[f32; 3]] {
        match self {
            Domain::Grid(grid) => grid.samples(),
            Domain::Scattered { samples, .. } => samples,
        }
    }

    /// The grid, if this domain is a grid spanning all three axes.
    pub fn regular_grid(&self) -> Option<&Grid3> {
        match self {
            Domain::Grid(grid) if grid.manifold_dimension() == 3 => Some(grid),
            _ => None,
        }
    }
}

/// One scalar value per domain sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub domain: Domain,
    pub values: Vec<f32>,
}

impl Field {
    pub fn new(
        name: impl Into<String>,
        domain: Domain,
        values: Vec<f32>,
    ) -> Result<Self> {
        if domain.len() != values.len() {
            Err(Error::config(format!(
                "{} values for a domain of {} samples",
                values.len(),
                domain.len()
            )))?
        }
        Ok(Self {
            name: name.into(),
            domain,
            values,
        })
    }

    /// Evaluates `f` at every grid sample.
    pub fn from_fn<F>(name: impl Into<String>, grid: Grid3, f: F) -> Self
    where
        F: Fn([f32; 3]) -> f32,
    {
        let values = grid.samples().iter().map(|&p| f(p)).collect();
        Self {
            name: name.into(),
            domain: Domain::Grid(grid),
            values,
        }
    }

    /// Coarser copy over every `stride`-th sample of a regular 3-axis grid.
    /// `None` for any other domain, or for `stride <= 1`.
    pub fn downsample(&self, stride: usize) -> Option<Field> {
        if stride <= 1 {
            return None;
        }
        let grid = self.domain.regular_grid()?;
        let (coarse, indices) = grid.downsample(stride);
        // the coarse samples coincide with source samples, so resampling
        // reduces to picking the value at the source index
        Some(self.resampled(coarse, &indices))
    }

    /// Block `k` of a `divide × divide` x/y split; grid domains only.
    pub fn split(&self, divide: usize, k: usize) -> Result<Field> {
        match &self.domain {
            Domain::Grid(grid) => {
                let (block, indices) = grid.split(divide, k)?;
                Ok(self.resampled(block, &indices))
            }
            Domain::Scattered { .. } => {
                Err(Error::config("only grid domains can be split"))
            }
        }
    }

    fn resampled(&self, grid: Grid3, indices: &[usize]) -> Field {
        Field {
            name: self.name.clone(),
            domain: Domain::Grid(grid),
            values: indices.iter().map(|&n| self.values[n]).collect(),
        }
    }

    pub fn value_range(&self) -> Option<(f32, f32)> {
        self.values
            .iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    pub fn ranges(&self) -> DataRanges {
        let mut ranges = DataRanges::new();
        for p in self.domain.samples() {
            ranges.include("x", p[0] as f64);
            ranges.include("y", p[1] as f64);
            ranges.include("z", p[2] as f64);
        }
        for v in &self.values {
            ranges.include("value", *v as f64);
        }
        ranges
    }
}

/// Everything a node can hold for one partition slot.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Field(Field),
    /// Fields indexed by a named axis, e.g. time steps.
    Sequence {
        axis: String,
        steps: Vec<f64>,
        fields: Vec<Field>,
    },
}

impl NodeData {
    pub fn sequence(
        axis: impl Into<String>,
        steps: Vec<f64>,
        fields: Vec<Field>,
    ) -> Result<Self> {
        if steps.len() != fields.len() || steps.is_empty() {
            Err(Error::config(format!(
                "sequence needs one field per step, got {} steps and {} fields",
                steps.len(),
                fields.len()
            )))?
        }
        Ok(NodeData::Sequence {
            axis: axis.into(),
            steps,
            fields,
        })
    }

    /// Down-sampled copy, or `None` if no field has a regular 3-axis grid.
    /// Fields over other domains are kept at full resolution.
    pub fn downsample(&self, stride: usize) -> Option<NodeData> {
        match self {
            NodeData::Field(field) => field.downsample(stride).map(NodeData::Field),
            NodeData::Sequence {
                axis,
                steps,
                fields,
            } => {
                let coarse: Vec<Option<Field>> =
                    fields.iter().map(|f| f.downsample(stride)).collect();
                if coarse.iter().all(Option::is_none) {
                    return None;
                }
                let fields = coarse
                    .into_iter()
                    .zip(fields)
                    .map(|(c, f)| c.unwrap_or_else(|| f.clone()))
                    .collect();
                Some(NodeData::Sequence {
                    axis: axis.clone(),
                    steps: steps.clone(),
                    fields,
                })
            }
        }
    }

    pub fn ranges(&self) -> DataRanges {
        match self {
            NodeData::Field(field) => field.ranges(),
            NodeData::Sequence {
                axis,
                steps,
                fields,
            } => {
                let mut ranges = DataRanges::new();
                for step in steps {
                    ranges.include(axis, *step);
                }
                for field in fields {
                    ranges.merge(&field.ranges());
                }
                ranges
            }
        }
    }

    pub fn sample_count(&self) -> usize {
        match self {
            NodeData::Field(field) => field.values.len(),
            NodeData::Sequence { fields, .. } => {
                fields.iter().map(|f| f.values.len()).sum()
            }
        }
    }
}
