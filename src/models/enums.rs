use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(DocumentStatus {
    Unique => "unique",
    Duplicate => "duplicate",
    Version => "version",
});

str_enum!(ExtractionStatus {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
});

str_enum!(ExtractionStrategy {
    Scanned => "scanned",
    TextWithTables => "text_with_tables",
    TextOnly => "text_only",
});

str_enum!(VersionGroupState {
    Resolved => "resolved",
    Ambiguous => "ambiguous",
    Manual => "manual",
});

str_enum!(DedupStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl ExtractionStrategy {
    /// Scanned pages and tables lose their structure under native text
    /// extraction, so both go to the external extractor.
    pub fn requires_deep_extraction(&self) -> bool {
        matches!(self, Self::Scanned | Self::TextWithTables)
    }
}

impl DedupStatus {
    /// Legal run-lock transitions: `pending|completed|failed → running → completed|failed`.
    pub fn can_transition_to(&self, next: DedupStatus) -> bool {
        match (self, next) {
            (Self::Running, Self::Completed | Self::Failed) => true,
            (Self::Pending | Self::Completed | Self::Failed, Self::Running) => true,
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}
