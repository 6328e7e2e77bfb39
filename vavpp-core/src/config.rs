//! # Filter Options
//!
//! User-facing options of the post-processing filter. Options are accepted
//! either as a suboption string (`deint=bob:interlaced-only=no`) or as JSON.
//!
//! | key                                        | values                          | default |
//! |--------------------------------------------|---------------------------------|---------|
//! | `deint` / `deinterlace-algorithm`          | no, first-field, bob, weave,    | bob     |
//! |                                            | motion-adaptive,                |         |
//! |                                            | motion-compensated              |         |
//! | `interlaced-only`                          | yes / no                        | yes     |
//! | `reversal-bug` / `reversal-workaround`     | yes / no                        | yes     |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::DeintAlgorithm;
use crate::error::VppError;

// ============================================================================
// Deinterlacing Mode
// ============================================================================

/// Deinterlacing mode as selected by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeintMode {
    #[serde(rename = "no", alias = "none")]
    None,
    /// Bob on the first field only, one output per input.
    FirstField,
    Bob,
    Weave,
    MotionAdaptive,
    MotionCompensated,
}

impl DeintMode {
    pub const ALL: [DeintMode; 6] = [
        Self::None,
        Self::FirstField,
        Self::Bob,
        Self::Weave,
        Self::MotionAdaptive,
        Self::MotionCompensated,
    ];

    /// Backend algorithm implementing this mode. `DeintAlgorithm::None` means
    /// no deinterlacing filter is requested.
    pub fn algorithm(self) -> DeintAlgorithm {
        match self {
            Self::None => DeintAlgorithm::None,
            Self::FirstField | Self::Bob => DeintAlgorithm::Bob,
            Self::Weave => DeintAlgorithm::Weave,
            Self::MotionAdaptive => DeintAlgorithm::MotionAdaptive,
            Self::MotionCompensated => DeintAlgorithm::MotionCompensated,
        }
    }

    /// Whether every input frame produces one output per field.
    ///
    /// Weave merges both fields into one picture and first-field drops the
    /// second field, so neither doubles the frame rate.
    pub fn doubles_fields(self) -> bool {
        matches!(self, Self::Bob | Self::MotionAdaptive | Self::MotionCompensated)
    }

    pub fn is_enabled(self) -> bool {
        self != Self::None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "no",
            Self::FirstField => "first-field",
            Self::Bob => "bob",
            Self::Weave => "weave",
            Self::MotionAdaptive => "motion-adaptive",
            Self::MotionCompensated => "motion-compensated",
        }
    }
}

impl Default for DeintMode {
    fn default() -> Self {
        DeintMode::Bob
    }
}

impl fmt::Display for DeintMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeintMode {
    type Err = VppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "no" | "none" | "off" => Ok(Self::None),
            "first-field" => Ok(Self::FirstField),
            "bob" => Ok(Self::Bob),
            "weave" => Ok(Self::Weave),
            "motion-adaptive" => Ok(Self::MotionAdaptive),
            "motion-compensated" => Ok(Self::MotionCompensated),
            other => Err(VppError::InvalidOption(format!("unknown deint mode '{}'", other))),
        }
    }
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeintOptions {
    #[serde(alias = "deinterlace-algorithm")]
    pub deint: DeintMode,
    /// Only deinterlace frames flagged as interlaced.
    pub interlaced_only: bool,
    /// Swap forward/backward references and equalize their counts for
    /// drivers that fill the two lists in the opposite order.
    #[serde(alias = "reversal-workaround")]
    pub reversal_bug: bool,
}

impl Default for DeintOptions {
    fn default() -> Self {
        Self {
            deint: DeintMode::Bob,
            interlaced_only: true,
            reversal_bug: true,
        }
    }
}

impl DeintOptions {
    pub fn from_json(json: &str) -> Result<Self, VppError> {
        serde_json::from_str(json).map_err(|e| VppError::InvalidOption(e.to_string()))
    }

    /// Render back into suboption form.
    pub fn to_suboptions(&self) -> String {
        format!(
            "deint={}:interlaced-only={}:reversal-bug={}",
            self.deint,
            yes_no(self.interlaced_only),
            yes_no(self.reversal_bug)
        )
    }
}

impl FromStr for DeintOptions {
    type Err = VppError;

    /// Parse `key=value` pairs separated by `:` or `,`. Unspecified keys keep
    /// their defaults; a bare flag name means `yes`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut opts = DeintOptions::default();

        for item in s.split([':', ',']).map(str::trim).filter(|i| !i.is_empty()) {
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (item, "yes"),
            };

            match key {
                "deint" | "deinterlace-algorithm" | "deinterlace_algorithm" => {
                    opts.deint = value.parse()?;
                }
                "interlaced-only" | "interlaced_only" => {
                    opts.interlaced_only = parse_flag(key, value)?;
                }
                "reversal-bug" | "reversal-workaround" | "reversal_workaround" => {
                    opts.reversal_bug = parse_flag(key, value)?;
                }
                _ => return Err(VppError::InvalidOption(format!("unknown option '{}'", key))),
            }
        }

        Ok(opts)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, VppError> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Ok(true),
        "no" | "false" | "0" | "off" => Ok(false),
        other => Err(VppError::InvalidOption(format!("'{}' expects yes/no, got '{}'", key, other))),
    }
}

fn yes_no(v: bool) -> &'static str {
    if v { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_filter_defaults() {
        let opts = DeintOptions::default();
        assert_eq!(opts.deint, DeintMode::Bob);
        assert!(opts.interlaced_only);
        assert!(opts.reversal_bug);
    }

    #[test]
    fn parses_suboption_string() {
        let opts: DeintOptions = "deint=motion-adaptive:interlaced-only=no:reversal-bug=no"
            .parse()
            .unwrap();
        assert_eq!(opts.deint, DeintMode::MotionAdaptive);
        assert!(!opts.interlaced_only);
        assert!(!opts.reversal_bug);

        let round_trip: DeintOptions = opts.to_suboptions().parse().unwrap();
        assert_eq!(round_trip, opts);
    }

    #[test]
    fn accepts_aliases_and_bare_flags() {
        let opts: DeintOptions = "deinterlace-algorithm=weave,reversal-workaround=no,interlaced-only"
            .parse()
            .unwrap();
        assert_eq!(opts.deint, DeintMode::Weave);
        assert!(!opts.reversal_bug);
        assert!(opts.interlaced_only);
    }

    #[test]
    fn rejects_unknown_values() {
        assert!("deint=yadif".parse::<DeintOptions>().is_err());
        assert!("interlaced-only=maybe".parse::<DeintOptions>().is_err());
        assert!("sharpen=1".parse::<DeintOptions>().is_err());
    }

    #[test]
    fn parses_json() {
        let opts = DeintOptions::from_json(r#"{"deint": "no", "reversal-workaround": false}"#).unwrap();
        assert_eq!(opts.deint, DeintMode::None);
        assert!(!opts.reversal_bug);
        assert!(opts.interlaced_only);
    }

    #[test]
    fn algorithm_table() {
        assert_eq!(DeintMode::None.algorithm(), DeintAlgorithm::None);
        assert_eq!(DeintMode::FirstField.algorithm(), DeintAlgorithm::Bob);
        assert_eq!(DeintMode::Bob.algorithm(), DeintAlgorithm::Bob);
        assert_eq!(DeintMode::MotionCompensated.algorithm(), DeintAlgorithm::MotionCompensated);

        let doubling: Vec<_> = DeintMode::ALL.iter().filter(|m| m.doubles_fields()).collect();
        assert_eq!(
            doubling,
            [&DeintMode::Bob, &DeintMode::MotionAdaptive, &DeintMode::MotionCompensated]
        );
    }
}
