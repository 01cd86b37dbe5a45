//! Component name (xname) handling.
//!
//! Fleet components are addressed by a structured name of the form
//! `x<cabinet>c<chassis>s<slot>b<board>n<node>`, truncatable at any
//! level (`x3000` is a cabinet, `x3000c0s12b0` a board controller).
//! Names are case-insensitive on input and stored lowercased.
//!
//! The grammar accepted here is the subset of the HMS naming scheme the
//! heartbeat service actually tracks. Anything it cannot classify maps
//! to [`HmsType::Invalid`].

use std::fmt;

// ════════════════════════════════════════════════════════════════════════════
// HMS TYPE
// ════════════════════════════════════════════════════════════════════════════

/// Classification of a component name by its deepest populated level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HmsType {
    /// `x<cab>`
    Cabinet,
    /// `x<cab>c<chassis>`
    Chassis,
    /// `x<cab>c<chassis>s<slot>`
    Slot,
    /// `x<cab>c<chassis>s<slot>b<board>`
    NodeBmc,
    /// `x<cab>c<chassis>s<slot>b<board>n<node>`
    Node,
    /// Not a recognizable component name.
    Invalid,
}

impl fmt::Display for HmsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HmsType::Cabinet => "Cabinet",
            HmsType::Chassis => "Chassis",
            HmsType::Slot => "Slot",
            HmsType::NodeBmc => "NodeBMC",
            HmsType::Node => "Node",
            HmsType::Invalid => "INVALID",
        };
        write!(f, "{}", s)
    }
}

/// Normalize a component name: trim whitespace and lowercase.
///
/// All KV keys and wire responses use the normalized form, so both
/// ingestion endpoints converge on the same record regardless of the
/// case the sender used.
pub fn normalize(xname: &str) -> String {
    xname.trim().to_ascii_lowercase()
}

/// Classify a (already normalized or raw) component name.
pub fn hms_type(xname: &str) -> HmsType {
    let s = normalize(xname);
    let mut chars = s.chars().peekable();

    // Leading 'x' plus at least one digit is mandatory.
    if chars.next() != Some('x') {
        return HmsType::Invalid;
    }
    if !eat_digits(&mut chars) {
        return HmsType::Invalid;
    }

    // Each deeper level is optional but strictly ordered, and each
    // level marker must be followed by digits.
    let levels = ['c', 's', 'b', 'n'];
    let types = [HmsType::Chassis, HmsType::Slot, HmsType::NodeBmc, HmsType::Node];
    let mut deepest = HmsType::Cabinet;

    for (marker, ty) in levels.iter().zip(types.iter()) {
        match chars.peek() {
            None => return deepest,
            Some(ch) if ch == marker => {
                chars.next();
                if !eat_digits(&mut chars) {
                    return HmsType::Invalid;
                }
                deepest = *ty;
            }
            Some(_) => return HmsType::Invalid,
        }
    }

    if chars.next().is_some() {
        return HmsType::Invalid;
    }
    deepest
}

/// True if the name parses as any known HMS type.
pub fn is_valid(xname: &str) -> bool {
    hms_type(xname) != HmsType::Invalid
}

fn eat_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> bool {
    let mut any = false;
    while let Some(ch) = chars.peek() {
        if ch.is_ascii_digit() {
            chars.next();
            any = true;
        } else {
            break;
        }
    }
    any
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_name() {
        assert_eq!(hms_type("x1c2s2b0n3"), HmsType::Node);
        assert_eq!(hms_type("x3000c0s19b1n0"), HmsType::Node);
    }

    #[test]
    fn test_truncated_levels() {
        assert_eq!(hms_type("x0"), HmsType::Cabinet);
        assert_eq!(hms_type("x0c1"), HmsType::Chassis);
        assert_eq!(hms_type("x0c1s2"), HmsType::Slot);
        assert_eq!(hms_type("x0c1s2b0"), HmsType::NodeBmc);
    }

    #[test]
    fn test_case_normalization() {
        assert_eq!(normalize("  X1C2S2B0N3 "), "x1c2s2b0n3");
        assert_eq!(hms_type("X1C2S2B0N3"), HmsType::Node);
    }

    #[test]
    fn test_invalid_names() {
        assert_eq!(hms_type(""), HmsType::Invalid);
        assert_eq!(hms_type("node1"), HmsType::Invalid);
        assert_eq!(hms_type("x"), HmsType::Invalid);
        assert_eq!(hms_type("xc0"), HmsType::Invalid);
        // Out-of-order level markers
        assert_eq!(hms_type("x0s1c2"), HmsType::Invalid);
        // Marker with no digits
        assert_eq!(hms_type("x0c"), HmsType::Invalid);
        // Trailing junk
        assert_eq!(hms_type("x0c1s2b0n3z"), HmsType::Invalid);
    }

    #[test]
    fn test_is_valid() {
        assert!(is_valid("x1c2s2b0n3"));
        assert!(!is_valid("fred"));
    }
}
