//! Generation labels and the metadata describing the active one.

use std::fmt;

use serde::Serialize;

/// One of the two alternating on-disk generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Generation {
    /// Stored in `generation_a`.
    A,
    /// Stored in `generation_b`.
    B,
}

impl Generation {
    /// Build target of the very first import.
    pub const DEFAULT: Self = Self::A;

    /// Both labels.
    pub const ALL: [Self; 2] = [Self::A, Self::B];

    /// The alternate generation.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Label persisted in System Metadata.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    /// Parses a persisted label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            _ => None,
        }
    }

    /// Table holding this generation's channel collections.
    pub(crate) const fn table(self) -> &'static str {
        match self {
            Self::A => "generation_a",
            Self::B => "generation_b",
        }
    }

    /// DDL for this generation's table.
    pub(crate) fn create_table_sql(self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                channel_id  TEXT NOT NULL,
                time_key    BLOB NOT NULL,
                record      BLOB NOT NULL,
                PRIMARY KEY (channel_id, time_key)
            ) WITHOUT ROWID;",
            self.table()
        )
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of System Metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationInfo {
    /// Currently active generation.
    pub generation: Generation,
    /// Monotonic counter, incremented by every promotion.
    pub version: u64,
    /// Time of the promotion (epoch seconds).
    pub imported_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_other_alternates() {
        // Arrange & Act & Assert
        assert_eq!(Generation::A.other(), Generation::B);
        assert_eq!(Generation::B.other(), Generation::A);
        assert_eq!(Generation::DEFAULT.other().other(), Generation::DEFAULT);
    }

    #[test]
    fn test_label_roundtrip() {
        // Arrange & Act & Assert
        for generation in Generation::ALL {
            assert_eq!(Generation::from_label(generation.label()), Some(generation));
        }
        assert_eq!(Generation::from_label("programs1"), None);
        assert_eq!(Generation::from_label(""), None);
    }

    #[test]
    fn test_tables_are_distinct() {
        // Arrange & Act & Assert
        assert_ne!(Generation::A.table(), Generation::B.table());
        assert!(Generation::B.create_table_sql().contains("generation_b"));
    }
}
