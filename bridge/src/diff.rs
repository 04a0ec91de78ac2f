//! Diff canonicalization and content signatures.
//!
//! The child emits the same diff through several event paths (item-level
//! short diff, turn-level contextual diff, approval-embedded diff). One
//! canonical rendering per (turn, signature) is surfaced; the signature is
//! sha256 over normalized file headers, hunk headers and body.

use sha2::Digest;
use sha2::Sha256;

pub fn diff_signature(diff: &str) -> String {
    let canonical = canonicalize(diff);
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Keep only the content-bearing lines: `---`/`+++` headers with `a/`/`b/`
/// prefixes and timestamps removed, `@@` hunk headers, and hunk body lines.
/// `diff --git`, `index`, and mode lines are presentation noise.
fn canonicalize(diff: &str) -> String {
    let mut out = String::new();
    for line in diff.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("--- ") {
            out.push_str("--- ");
            out.push_str(normalize_file_header(rest));
            out.push('\n');
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            out.push_str("+++ ");
            out.push_str(normalize_file_header(rest));
            out.push('\n');
        } else if line.starts_with("@@") {
            out.push_str(line);
            out.push('\n');
        } else if line.starts_with('+') || line.starts_with('-') || line.starts_with(' ') {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn normalize_file_header(header: &str) -> &str {
    // Strip a trailing timestamp column, then the git a/ b/ prefix.
    let path = header.split('\t').next().unwrap_or(header);
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SHORT: &str = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,2 +1,2 @@\n-old\n+new\n";

    #[test]
    fn signature_is_deterministic() {
        assert_eq!(diff_signature(SHORT), diff_signature(SHORT));
        assert_eq!(diff_signature(SHORT).len(), 64);
    }

    #[test]
    fn git_noise_does_not_change_the_signature() {
        let noisy = format!(
            "diff --git a/src/lib.rs b/src/lib.rs\nindex 1111111..2222222 100644\n{SHORT}"
        );
        assert_eq!(diff_signature(&noisy), diff_signature(SHORT));
    }

    #[test]
    fn timestamps_in_headers_are_ignored() {
        let timestamped =
            "--- a/src/lib.rs\t2025-01-01 00:00:00\n+++ b/src/lib.rs\t2025-01-02 00:00:00\n@@ -1,2 +1,2 @@\n-old\n+new\n";
        assert_eq!(diff_signature(timestamped), diff_signature(SHORT));
    }

    #[test]
    fn different_bodies_differ() {
        let other = SHORT.replace("+new", "+other");
        assert_ne!(diff_signature(&other), diff_signature(SHORT));
    }
}
