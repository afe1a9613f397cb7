use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable identifier of an entry within one [`HandleTable`](crate::HandleTable).
///
/// Allocated from a per-table counter and never reissued, even after the entry
/// it named has been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(i32);

impl Handle {
    /// "No such entry." Encoded as `-1` on the wire.
    pub const NOT_SET: Handle = Handle(-1);

    /// First handle issued by a parameter table.
    pub const FIRST_PARAM: Handle = Handle(0);
    /// First handle issued by the I/O-type table.
    ///
    /// I/O and checkpoint handles double as command ids, so they start above
    /// the built-in command range.
    pub const FIRST_IO_TYPE: Handle = Handle(1000);
    /// First handle issued by the checkpoint-type table.
    pub const FIRST_CHK_TYPE: Handle = Handle(2000);

    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i32 {
        self.0
    }

    pub const fn is_set(self) -> bool {
        self.0 >= 0
    }

    pub(crate) fn next(self) -> Handle {
        Handle(self.0.saturating_add(1))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Handle {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Handle)
    }
}

impl From<Handle> for i32 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_set_is_minus_one() {
        assert_eq!(Handle::NOT_SET.get(), -1);
        assert!(!Handle::NOT_SET.is_set());
        assert!(Handle::FIRST_PARAM.is_set());
    }

    #[test]
    fn parses_wire_text() {
        assert_eq!("1002".parse::<Handle>().unwrap(), Handle::new(1002));
        assert_eq!("-1".parse::<Handle>().unwrap(), Handle::NOT_SET);
        assert!("x".parse::<Handle>().is_err());
    }
}
