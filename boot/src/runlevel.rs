//! Runlevel masks.
//!
//! A service declares the runlevels it is active in with a bracketed list,
//! e.g. `[2345]`, `[S]` or `[!06]`.  Internally that is a 10-bit set where
//! bit 0 is the bootstrap level `S` and bits 1-9 are the ordinary runlevels.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest runlevel.
pub const MAX_RUNLEVEL: u8 = 9;

/// Mask used when a declaration has no `[...]` prefix.
pub const DEFAULT_RUNLEVELS: &str = "[234]";

/// All of 1-9 set, bootstrap clear.  Seed value for `!` masks.
const NEGATED_SEED: u16 = 0x3FE;

const ALL_LEVELS: u16 = 0x3FF;

/// Set of runlevels a service is active in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RunlevelMask(u16);

impl RunlevelMask {
    /// The empty mask.
    pub const EMPTY: RunlevelMask = RunlevelMask(0);

    /// Parse the optional `[...]` notation.
    ///
    /// `None` yields the default mask.  Parsing never fails: the first
    /// character is taken to be the opening bracket and skipped, `!`
    /// switches to "all but" mode for the rest of the scan, `s`/`S` mean
    /// level 0 and anything that is not a digit is ignored.  The scan ends
    /// at `]` or at the end of the input, so `[23` is the same as `[23]`.
    pub fn parse(text: Option<&str>) -> Self {
        let text = text.unwrap_or(DEFAULT_RUNLEVELS);
        let mut negate = false;
        let mut bits = 0u16;

        for ch in text.chars().skip(1) {
            let level = match ch {
                ']' => break,
                '!' => {
                    negate = true;
                    bits = NEGATED_SEED;
                    continue;
                }
                's' | 'S' => 0,
                '0'..='9' => ch as u16 - '0' as u16,
                _ => continue,
            };

            if negate {
                bits &= !(1 << level);
            } else {
                bits |= 1 << level;
            }
        }

        RunlevelMask(bits)
    }

    /// Build a mask from raw bits, dropping anything above level 9.
    pub fn from_bits(bits: u16) -> Self {
        RunlevelMask(bits & ALL_LEVELS)
    }

    /// Build a mask from a list of levels.  Levels above 9 are ignored.
    pub fn from_levels(levels: &[u8]) -> Self {
        let mut mask = Self::EMPTY;
        for &level in levels {
            mask.insert(level);
        }
        mask
    }

    /// Raw bits, always within `0..=1023`.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Whether the mask includes `level`.
    pub fn contains(&self, level: u8) -> bool {
        level <= MAX_RUNLEVEL && self.0 & (1 << level) != 0
    }

    pub fn insert(&mut self, level: u8) {
        if level <= MAX_RUNLEVEL {
            self.0 |= 1 << level;
        }
    }

    pub fn remove(&mut self, level: u8) {
        if level <= MAX_RUNLEVEL {
            self.0 &= !(1 << level);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Only the bootstrap level is set.
    pub fn is_bootstrap_only(&self) -> bool {
        self.0 == 1
    }

    /// Levels in ascending order.
    pub fn levels(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=MAX_RUNLEVEL).filter(move |&l| self.contains(l))
    }
}

impl fmt::Display for RunlevelMask {
    /// Formats as the bracketed notation accepted by [`RunlevelMask::parse`],
    /// writing level 0 as `S`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for level in self.levels() {
            if level == 0 {
                f.write_str("S")?;
            } else {
                write!(f, "{}", level)?;
            }
        }
        f.write_str("]")
    }
}

/// Human name of a runlevel for log messages.
pub fn runlevel_name(level: u8) -> String {
    match level {
        0 => "S".to_string(),
        l => l.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mask() {
        let mask = RunlevelMask::parse(None);
        assert_eq!(mask, RunlevelMask::parse(Some("[234]")));
        assert_eq!(mask.levels().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_negated_mask() {
        let mask = RunlevelMask::parse(Some("[!06]"));
        for level in [1, 2, 3, 4, 5, 7, 8, 9] {
            assert!(mask.contains(level), "level {} should be set", level);
        }
        assert!(!mask.contains(0));
        assert!(!mask.contains(6));
    }

    #[test]
    fn test_negation_without_levels() {
        let mask = RunlevelMask::parse(Some("[!]"));
        assert_eq!(mask.bits(), 0x3FE);
    }

    #[test]
    fn test_bootstrap_aliases() {
        assert_eq!(RunlevelMask::parse(Some("[S]")), RunlevelMask::parse(Some("[0]")));
        assert_eq!(RunlevelMask::parse(Some("[s]")), RunlevelMask::parse(Some("[0]")));
        assert!(RunlevelMask::parse(Some("[S]")).is_bootstrap_only());
    }

    #[test]
    fn test_permissive_parsing() {
        // Junk is skipped, an unterminated list still counts.
        assert_eq!(RunlevelMask::parse(Some("[2x,3")).levels().collect::<Vec<_>>(), vec![2, 3]);
        // Nothing after the bracket is an empty mask, not an error.
        assert!(RunlevelMask::parse(Some("[]")).is_empty());
        // Digits after the closing bracket are not part of the mask.
        assert_eq!(RunlevelMask::parse(Some("[1]5")).levels().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_format_round_trip() {
        for text in ["[234]", "[S12345]", "[!06]", "[!]", "[S]", "[]", "[0123456789]"] {
            let mask = RunlevelMask::parse(Some(text));
            assert_eq!(RunlevelMask::parse(Some(&mask.to_string())), mask, "{}", text);
        }
        assert_eq!(RunlevelMask::parse(Some("[0 2]")).to_string(), "[S2]");
    }

    #[test]
    fn test_from_bits_is_clamped() {
        assert_eq!(RunlevelMask::from_bits(0xFFFF).bits(), 1023);
    }

    #[test]
    fn test_from_levels() {
        assert_eq!(
            RunlevelMask::from_levels(&[2, 3, 4]),
            RunlevelMask::parse(Some("[234]"))
        );
        assert_eq!(RunlevelMask::from_levels(&[0, 12]), RunlevelMask::parse(Some("[S]")));
        assert_eq!(RunlevelMask::from_levels(&[]), RunlevelMask::EMPTY);
    }
}
