use core::fmt;

/// Hex rendering of identity bytes. Only the first `limit` bytes are
/// printed.
pub struct HexSlice<'a> {
    bytes: &'a [u8],
    limit: usize,
}

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.bytes.iter().take(self.limit) {
            write!(f, "{:02x}", byte)?;
        }
        if self.bytes.len() > self.limit {
            write!(f, "…")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    /// Full-width hex.
    fn hex(&self) -> HexSlice<'_>;
    /// First six bytes, for log lines.
    fn short_hex(&self) -> HexSlice<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexSlice<'_> {
        HexSlice {
            bytes: self.as_ref(),
            limit: usize::MAX,
        }
    }

    fn short_hex(&self) -> HexSlice<'_> {
        HexSlice {
            bytes: self.as_ref(),
            limit: 6,
        }
    }
}
