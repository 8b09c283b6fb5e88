/// Truncate tool output to at most `max_bytes` of content.
/// Cuts at a char boundary and appends a marker with the original and kept sizes.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let boundary = floor_char_boundary(output, max_bytes);
    format!(
        "{}\n\n[truncated: {} bytes -> {} bytes]",
        &output[..boundary],
        output.len(),
        boundary
    )
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_limit_unchanged() {
        assert_eq!(truncate_output("hello world", 1024), "hello world");
        assert_eq!(truncate_output("", 10), "");
        let exact = "a".repeat(100);
        assert_eq!(truncate_output(&exact, 100), exact);
    }

    #[test]
    fn one_over_truncates() {
        let result = truncate_output(&"a".repeat(101), 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.ends_with("[truncated: 101 bytes -> 100 bytes]"));
    }

    #[test]
    fn multibyte_cut_lands_on_boundary() {
        // Each crab is 4 bytes; 10 bytes keeps two of them.
        let result = truncate_output(&"🦀".repeat(100), 10);
        assert!(result.starts_with("🦀🦀\n"));
        assert!(result.contains("[truncated: 400 bytes -> 8 bytes]"));
    }
}
