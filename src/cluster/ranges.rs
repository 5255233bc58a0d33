use rkyv::{Archive, Deserialize, Serialize};

#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct AxisRange {
    pub axis: String,
    pub min: f64,
    pub max: f64,
}

/// Per-axis value ranges of a node's data, used by the client to scale its
/// display before any geometry arrives.
#[derive(Debug, Clone, Default, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct DataRanges {
    pub axes: Vec<AxisRange>,
}

impl DataRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Widens the range of `axis` to include `value`. Non-finite values are
    /// ignored.
    pub fn include(&mut self, axis: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        match self.axes.iter_mut().find(|r| r.axis == axis) {
            Some(range) => {
                range.min = range.min.min(value);
                range.max = range.max.max(value);
            }
            None => self.axes.push(AxisRange {
                axis: axis.to_owned(),
                min: value,
                max: value,
            }),
        }
    }

    pub fn get(&self, axis: &str) -> Option<(f64, f64)> {
        self.axes
            .iter()
            .find(|r| r.axis == axis)
            .map(|r| (r.min, r.max))
    }

    pub fn merge(&mut self, other: &DataRanges) {
        for range in &other.axes {
            self.include(&range.axis, range.min);
            self.include(&range.axis, range.max);
        }
    }

    /// Union of every present response; `None` if no slot answered.
    pub fn merge_all<I>(responses: I) -> Option<DataRanges>
    where
        I: IntoIterator<Item = Option<DataRanges>>,
    {
        responses.into_iter().flatten().reduce(|mut acc, r| {
            acc.merge(&r);
            acc
        })
    }
}
