use super::error::{Error, Result};

/// Ordered endpoints, one per partition slot plus a final slot for the
/// non-partitioned remainder held by the client.
#[derive(Debug, Clone)]
pub struct ClusterTable<E> {
    slots: Vec<E>,
}

impl<E> ClusterTable<E> {
    pub fn new(slots: Vec<E>) -> Result<Self> {
        if slots.is_empty() {
            Err(Error::config("cluster table needs at least one slot"))?
        }
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&E> {
        self.slots.get(slot)
    }

    pub fn fallback_slot(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn fallback(&self) -> &E {
        &self.slots[self.fallback_slot()]
    }

    /// The first `workers` endpoints, i.e. those owning partition slots.
    pub fn workers(&self, workers: usize) -> &[E] {
        &self.slots[..workers.min(self.slots.len())]
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.slots.iter()
    }

    /// Checks that a partition of `size` slots fits, leaving the fallback
    /// slot free.
    pub fn check_fits(&self, size: usize) -> Result<()> {
        if self.slots.len() < size + 1 {
            Err(Error::config(format!(
                "table of {} endpoints cannot serve a partition of {} slots",
                self.slots.len(),
                size
            )))?
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_the_last_slot() {
        let table = ClusterTable::new(vec!["a", "b", "c"]).unwrap();
        assert_eq!(*table.fallback(), "c");
        assert_eq!(table.workers(2), &["a", "b"]);
        assert!(table.check_fits(2).is_ok());
        assert!(table.check_fits(3).is_err());
    }

    #[test]
    fn empty_tables_are_rejected() {
        assert!(ClusterTable::<u8>::new(vec![]).is_err());
    }
}
