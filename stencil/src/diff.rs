//! Unified diffs of generated content against the project tree.

use similar::TextDiff;

/// A line-oriented unified diff of `old` against `new`, headed with the
/// file's path on both sides. An empty `old` yields a pure addition diff.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(path, path)
        .to_string()
}

/// True when the contents are identical and no write is needed.
pub fn is_unchanged(old: &str, new: &str) -> bool {
    old == new
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_file_is_pure_addition() {
        let diff = unified_diff("greeting.txt", "", "hello world\n");
        assert!(diff.contains("+hello world"));
        assert!(!diff.lines().any(|l| l.starts_with('-') && !l.starts_with("---")));
    }

    #[test]
    fn test_single_line_change() {
        let diff = unified_diff("greeting.txt", "hello world\n", "hello mars\n");
        let removed: Vec<_> = diff
            .lines()
            .filter(|l| l.starts_with('-') && !l.starts_with("---"))
            .collect();
        let added: Vec<_> = diff
            .lines()
            .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
            .collect();
        assert_eq!(removed, vec!["-hello world"]);
        assert_eq!(added, vec!["+hello mars"]);
    }

    #[test]
    fn test_unchanged_content() {
        assert!(is_unchanged("same\n", "same\n"));
        assert!(!is_unchanged("same\n", "different\n"));
    }
}
