use crate::constants::limits::MAX_MODE;
use crate::constants::permissions::DEFAULT_FILE_MODE;

/// Parses an octal permission string ("0644", "644", "0o644").
///
/// Empty, non-octal or out-of-range input yields the default file mode.
pub fn parse_permissions(raw: &str) -> u32 {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0o")
        .or_else(|| trimmed.strip_prefix("0O"))
        .unwrap_or(trimmed);
    // from_str_radix accepts a leading sign; permission strings never carry one.
    if digits.is_empty() || !digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return DEFAULT_FILE_MODE;
    }
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= MAX_MODE => mode,
        _ => DEFAULT_FILE_MODE,
    }
}

pub fn format_permissions(mode: u32) -> String {
    format!("{:04o}", mode & MAX_MODE)
}

#[cfg(test)]
mod tests {
    use super::{format_permissions, parse_permissions};

    #[test]
    fn parses_with_and_without_leading_zero() {
        for (raw, expected) in [
            ("755", 0o755),
            ("0755", 0o755),
            ("777", 0o777),
            ("0777", 0o777),
            ("0600", 0o600),
            ("600", 0o600),
            ("0o640", 0o640),
            ("4755", 0o4755),
        ] {
            assert_eq!(parse_permissions(raw), expected, "input {}", raw);
        }
    }

    #[test]
    fn canonical_strings_round_trip() {
        for raw in ["0644", "0755", "0700", "0000", "1777", "4755"] {
            assert_eq!(format_permissions(parse_permissions(raw)), raw);
        }
    }

    #[test]
    fn invalid_input_falls_back_to_0644() {
        for raw in ["", "   ", "rwx", "0999", "12a", "77777", "-644", "+755", "+0644"] {
            assert_eq!(parse_permissions(raw), 0o644, "input {:?}", raw);
        }
    }
}
