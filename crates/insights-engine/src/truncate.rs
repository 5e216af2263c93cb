/// Cap on a single tool output submitted back to a run.
pub const MAX_TOOL_OUTPUT: usize = 512 * 1024; // 512KB

/// Truncate tool output if it exceeds `max_bytes`.
/// Cuts at a char boundary and appends a marker showing original vs truncated size.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut boundary = max_bytes;
    while !output.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let truncated = &output[..boundary];
    format!(
        "{truncated}\n\n[truncated: {} bytes -> {} bytes]",
        output.len(),
        boundary
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_truncation_when_within_limit() {
        let input = "[{\"month\": 1}]";
        assert_eq!(truncate_output(input, 1024), input);
    }

    #[test]
    fn truncates_at_limit() {
        let input = "a".repeat(1000);
        let result = truncate_output(&input, 100);
        assert!(result.starts_with("aaaa"));
        assert!(result.contains("[truncated: 1000 bytes -> 100 bytes]"));
    }

    #[test]
    fn truncates_at_char_boundary() {
        // 3-byte chars
        let input = "€".repeat(100);
        let result = truncate_output(&input, 10);
        assert!(result.starts_with("€€€\n"));
        assert!(result.contains("[truncated: 300 bytes -> 9 bytes]"));
    }

    #[test]
    fn exact_boundary_no_truncation() {
        let input = "a".repeat(100);
        assert_eq!(truncate_output(&input, 100), input);
    }

    #[test]
    fn empty_string() {
        assert_eq!(truncate_output("", MAX_TOOL_OUTPUT), "");
    }
}
