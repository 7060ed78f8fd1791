//! Group-name sanitization and upload filename validation (§4.1).

const DEFAULT_GROUP: &str = "Default";

/// Trims, strips disallowed characters, and substitutes `"Default"` for
/// empty/absent input (§8 boundary behavior).
pub fn sanitize_group_name(raw: Option<&str>) -> String {
    let trimmed = raw.unwrap_or("").trim();
    if trimmed.is_empty() {
        return DEFAULT_GROUP.to_string();
    }
    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        DEFAULT_GROUP.to_string()
    } else {
        cleaned
    }
}

/// Accepted upload extensions (§4.1): `.gcode`, `.3mf`, `.bgcode`, `.gcode.3mf`.
pub fn validate_gcode_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".gcode")
        || lower.ends_with(".3mf")
        || lower.ends_with(".bgcode")
        || lower.ends_with(".gcode.3mf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_or_none_normalizes_to_default() {
        assert_eq!(sanitize_group_name(None), "Default");
        assert_eq!(sanitize_group_name(Some("")), "Default");
        assert_eq!(sanitize_group_name(Some("   ")), "Default");
    }

    #[test]
    fn strips_disallowed_characters() {
        assert_eq!(sanitize_group_name(Some("  Bay #1! ")), "Bay 1");
    }

    #[test]
    fn keeps_reasonable_labels_untouched() {
        assert_eq!(sanitize_group_name(Some("North Wing")), "North Wing");
    }

    #[test]
    fn validates_known_extensions() {
        assert!(validate_gcode_file("part.gcode"));
        assert!(validate_gcode_file("part.3mf"));
        assert!(validate_gcode_file("part.bgcode"));
        assert!(validate_gcode_file("part.gcode.3mf"));
        assert!(validate_gcode_file("PART.GCODE"));
        assert!(!validate_gcode_file("part.stl"));
        assert!(!validate_gcode_file("part"));
    }
}
