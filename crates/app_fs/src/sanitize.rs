//! Filename validity checks for Windows compatibility
//!
//! Target names produced by a rename decision or carried in an operation
//! plan are checked here before the engine touches the disk.

/// Windows reserved filenames
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL",
    "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9",
    "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Windows forbidden characters
const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Why a filename is invalid, if it is
pub fn invalid_name_reason(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("empty name");
    }

    for c in name.chars() {
        if FORBIDDEN_CHARS.contains(&c) {
            return Some("contains a forbidden character");
        }
        if c.is_control() {
            return Some("contains a control character");
        }
    }

    let name_upper = name.to_uppercase();
    let base_name = name_upper.split('.').next().unwrap_or("");
    if RESERVED_NAMES.contains(&base_name) {
        return Some("reserved device name");
    }

    if name.ends_with('.') || name.ends_with(' ') {
        return Some("trailing dot or space");
    }

    None
}

/// Check if a filename is valid for Windows
pub fn is_valid_filename(name: &str) -> bool {
    invalid_name_reason(name).is_none()
}

/// Rewrite a filename so it passes the validity check (underscore policy)
pub fn sanitize_filename(name: &str) -> String {
    let mut result = String::with_capacity(name.len());

    for c in name.chars() {
        if FORBIDDEN_CHARS.contains(&c) || c.is_control() {
            result.push('_');
        } else {
            result.push(c);
        }
    }

    let name_upper = result.to_uppercase();
    let base_name = name_upper.split('.').next().unwrap_or("");
    if RESERVED_NAMES.contains(&base_name) {
        result = format!("_{}", result);
    }

    // Windows silently strips trailing dots and spaces
    while result.ends_with('.') || result.ends_with(' ') {
        result.pop();
    }

    if result.is_empty() {
        result = "_unnamed".to_string();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_for_colon() {
        assert!(invalid_name_reason("image:01.jpg").is_some());
        assert!(invalid_name_reason("image01.jpg").is_none());
    }

    #[test]
    fn test_reserved() {
        assert!(!is_valid_filename("CON"));
        assert!(!is_valid_filename("aux.txt"));
        assert!(is_valid_filename("CONSOLE.txt"));
    }

    #[test]
    fn test_trailing() {
        assert!(!is_valid_filename("test."));
        assert!(!is_valid_filename("test "));
        assert!(is_valid_filename("test"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_filename("a:b?.txt"), "a_b_.txt");
        assert_eq!(sanitize_filename("NUL.dat"), "_NUL.dat");
        assert_eq!(sanitize_filename("name."), "name");
    }
}
