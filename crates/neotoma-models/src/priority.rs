//! The closed source-priority ladder (`§4.4`). Higher wins in the reducer's
//! total order.

use std::fmt;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct SourcePriority(i32);

impl SourcePriority {
    /// Legacy or unknown provenance.
    pub const LEGACY: SourcePriority = SourcePriority(0);
    /// Default for AI/extractor output.
    pub const AI_EXTRACTION: SourcePriority = SourcePriority(100);
    /// Caller-asserted fields submitted through structured ingest.
    pub const STRUCTURED: SourcePriority = SourcePriority(500);
    /// A user correction, or a deletion tombstone.
    pub const CORRECTION: SourcePriority = SourcePriority(1000);
    /// A restoration; strictly supersedes a deletion at `CORRECTION`.
    pub const RESTORATION: SourcePriority = SourcePriority(1001);

    pub fn value(&self) -> i32 {
        self.0
    }

    /// Constructs a priority from a raw value without restricting it to the
    /// named rungs above. The ladder is "closed" in the sense that callers
    /// are expected to use the named constants; this escape hatch exists for
    /// deserializing rows already in storage and for tests.
    pub fn from_raw(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for SourcePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SourcePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourcePriority({})", self.0)
    }
}

impl serde::Serialize for SourcePriority {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for SourcePriority {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(i32::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restoration_outranks_correction() {
        assert!(SourcePriority::RESTORATION > SourcePriority::CORRECTION);
    }

    #[test]
    fn ladder_is_strictly_ordered() {
        assert!(SourcePriority::LEGACY < SourcePriority::AI_EXTRACTION);
        assert!(SourcePriority::AI_EXTRACTION < SourcePriority::STRUCTURED);
        assert!(SourcePriority::STRUCTURED < SourcePriority::CORRECTION);
    }
}
