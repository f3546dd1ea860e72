// =============================================================================
// Shared types used across the Meridian screener
// =============================================================================

use serde::{Deserialize, Serialize};

/// Subscriber access tier. Determines which fields of a snapshot a
/// connection may receive. Resolved once at connect time and immutable for
/// the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Plus,
    Pro,
}

impl Default for Tier {
    fn default() -> Self {
        Self::Free
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Plus => write!(f, "plus"),
            Self::Pro => write!(f, "pro"),
        }
    }
}

impl Tier {
    /// All tiers, broadest field set last.
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Plus, Tier::Pro];

    /// Stable index used for per-tier channel arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Free => 0,
            Self::Plus => 1,
            Self::Pro => 2,
        }
    }
}

/// Metric timeframes, tagged so that field-name drift is caught at compile
/// time instead of at serialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M2,
    M3,
    M5,
    M10,
    M15,
    M60,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M2,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M10,
        Timeframe::M15,
        Timeframe::M60,
    ];

    /// Window length in minutes.
    pub fn minutes(self) -> i64 {
        match self {
            Self::M1 => 1,
            Self::M2 => 2,
            Self::M3 => 3,
            Self::M5 => 5,
            Self::M10 => 10,
            Self::M15 => 15,
            Self::M60 => 60,
        }
    }

    /// Window length in milliseconds (candle timestamps are epoch millis).
    pub fn millis(self) -> i64 {
        self.minutes() * 60_000
    }

    /// Column/field prefix, e.g. `m5` for `m5_r_pct`, `m5_vol`, `m5_rsi`.
    pub fn label(self) -> &'static str {
        match self {
            Self::M1 => "m1",
            Self::M2 => "m2",
            Self::M3 => "m3",
            Self::M5 => "m5",
            Self::M10 => "m10",
            Self::M15 => "m15",
            Self::M60 => "m60",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Quote currencies the screener tracks. Symbols with any other quote are
/// ignored at ingest time.
pub fn has_supported_quote(symbol: &str, quotes: &[String]) -> bool {
    quotes.iter().any(|q| symbol.ends_with(q.as_str()))
}
