//! Line-oriented three-way merge.
//!
//! Reconciles two derived versions (`local`, `remote`) against a common
//! ancestor (`base`). Regions where only one side diverged take that side;
//! regions where both sides made the same change are kept once; regions
//! where the sides disagree are emitted between conflict markers:
//!
//! ```text
//! <<<<<<< LOCAL
//! <local lines>
//! =======
//! <remote lines>
//! >>>>>>> REMOTE
//! ```
//!
//! The merge is a pure function of its three inputs.

const MARKER_LOCAL: &str = "<<<<<<< LOCAL";
const MARKER_SEP: &str = "=======";
const MARKER_REMOTE: &str = ">>>>>>> REMOTE";

/// Result of a three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub content: Vec<u8>,
    pub has_conflicts: bool,
}

/// Merge `local` and `remote` against `base`.
pub fn merge(base: &[u8], local: &[u8], remote: &[u8]) -> MergeOutcome {
    // Trivial resolutions preserve input bytes exactly.
    if local == remote {
        return MergeOutcome {
            content: local.to_vec(),
            has_conflicts: false,
        };
    }
    if base == local {
        return MergeOutcome {
            content: remote.to_vec(),
            has_conflicts: false,
        };
    }
    if base == remote {
        return MergeOutcome {
            content: local.to_vec(),
            has_conflicts: false,
        };
    }

    let base_text = String::from_utf8_lossy(base);
    let local_text = String::from_utf8_lossy(local);
    let remote_text = String::from_utf8_lossy(remote);

    let base_lines = split_lines(&base_text);
    let local_lines = split_lines(&local_text);
    let remote_lines = split_lines(&remote_text);

    // Stable lines are base positions matched by both derived versions.
    let matches_local = lcs_pairs(&base_lines, &local_lines);
    let matches_remote = lcs_pairs(&base_lines, &remote_lines);
    let sync_points = intersect_on_base(&matches_local, &matches_remote);

    let mut out: Vec<String> = Vec::new();
    let mut has_conflicts = false;
    let (mut b0, mut l0, mut r0) = (0usize, 0usize, 0usize);

    for &(bi, li, ri) in &sync_points {
        resolve_chunk(
            &base_lines[b0..bi],
            &local_lines[l0..li],
            &remote_lines[r0..ri],
            &mut out,
            &mut has_conflicts,
        );
        out.push(base_lines[bi].to_string());
        b0 = bi + 1;
        l0 = li + 1;
        r0 = ri + 1;
    }
    resolve_chunk(
        &base_lines[b0..],
        &local_lines[l0..],
        &remote_lines[r0..],
        &mut out,
        &mut has_conflicts,
    );

    let mut content = out.join("\n");
    let wants_newline = local_text.ends_with('\n') || remote_text.ends_with('\n');
    if !content.is_empty() && wants_newline {
        content.push('\n');
    }

    MergeOutcome {
        content: content.into_bytes(),
        has_conflicts,
    }
}

/// Resolve one unstable region between two sync points.
fn resolve_chunk(
    base: &[&str],
    local: &[&str],
    remote: &[&str],
    out: &mut Vec<String>,
    has_conflicts: &mut bool,
) {
    if local == remote {
        // Both sides made the same change; keep it once.
        out.extend(local.iter().map(|l| l.to_string()));
    } else if local == base {
        out.extend(remote.iter().map(|l| l.to_string()));
    } else if remote == base {
        out.extend(local.iter().map(|l| l.to_string()));
    } else {
        *has_conflicts = true;
        out.push(MARKER_LOCAL.to_string());
        out.extend(local.iter().map(|l| l.to_string()));
        out.push(MARKER_SEP.to_string());
        out.extend(remote.iter().map(|l| l.to_string()));
        out.push(MARKER_REMOTE.to_string());
    }
}

/// Split into lines without terminators; a trailing newline does not produce
/// an empty final line.
fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<&str> = text.split('\n').collect();
    if text.ends_with('\n') {
        lines.pop();
    }
    lines
}

/// Longest common subsequence of two line slices, as (index_a, index_b)
/// pairs in ascending order.
fn lcs_pairs(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 {
        return Vec::new();
    }

    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if a[i] == b[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let mut pairs = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

/// Keep only base positions matched on both sides. LCS pairs are monotone in
/// both coordinates, so the result is monotone in all three.
fn intersect_on_base(
    left: &[(usize, usize)],
    right: &[(usize, usize)],
) -> Vec<(usize, usize, usize)> {
    let mut sync = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < left.len() && j < right.len() {
        match left[i].0.cmp(&right[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                sync.push((left[i].0, left[i].1, right[j].1));
                i += 1;
                j += 1;
            }
        }
    }
    sync
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge_str(base: &str, local: &str, remote: &str) -> (String, bool) {
        let outcome = merge(base.as_bytes(), local.as_bytes(), remote.as_bytes());
        (String::from_utf8(outcome.content).unwrap(), outcome.has_conflicts)
    }

    #[test]
    fn non_overlapping_edits_merge_cleanly() {
        let base = "Line 1\nLine 2\nLine 3";
        let local = "Line 1\nLine 2\nLine 3 - B edited";
        let remote = "Line 1 - A edited\nLine 2\nLine 3";

        let (merged, conflicts) = merge_str(base, local, remote);
        assert!(!conflicts);
        assert!(merged.contains("Line 1 - A edited"));
        assert!(merged.contains("Line 3 - B edited"));
        assert!(merged.contains("Line 2"));
        assert!(!merged.contains(MARKER_LOCAL));
    }

    #[test]
    fn overlapping_edits_emit_markers() {
        let (merged, conflicts) =
            merge_str("Original line", "B edited this line", "A edited this line");
        assert!(conflicts);
        let expected = "<<<<<<< LOCAL\nB edited this line\n=======\nA edited this line\n>>>>>>> REMOTE";
        assert_eq!(merged, expected);
    }

    #[test]
    fn identical_hunks_are_kept_once() {
        let base = "a\nb\nc";
        let local = "a\nB!\nc";
        let remote = "a\nB!\nc";
        let (merged, conflicts) = merge_str(base, local, remote);
        assert!(!conflicts);
        assert_eq!(merged, "a\nB!\nc");
    }

    #[test]
    fn one_sided_change_wins_without_markers() {
        let base = "x\ny\nz";
        let (merged, conflicts) = merge_str(base, "x\ny\nz", "x\nY2\nz");
        assert!(!conflicts);
        assert_eq!(merged, "x\nY2\nz");

        let (merged, conflicts) = merge_str(base, "x\nY1\nz", "x\ny\nz");
        assert!(!conflicts);
        assert_eq!(merged, "x\nY1\nz");
    }

    #[test]
    fn deletion_against_unrelated_edit_merges() {
        let base = "a\nb\nc\nd";
        let local = "a\nc\nd";
        let remote = "a\nb\nc\nd - tail";
        let (merged, conflicts) = merge_str(base, local, remote);
        assert!(!conflicts);
        assert_eq!(merged, "a\nc\nd - tail");
    }

    #[test]
    fn appends_on_both_sides_conflict() {
        let base = "shared";
        let (merged, conflicts) = merge_str(base, "shared\nfrom local", "shared\nfrom remote");
        assert!(conflicts);
        assert!(merged.contains("from local"));
        assert!(merged.contains("from remote"));
        assert!(merged.starts_with("shared\n"));
    }

    #[test]
    fn merge_is_deterministic() {
        let base = "1\n2\n3\n4\n5";
        let local = "1\ntwo\n3\n4\nfive";
        let remote = "1\n2\nthree\n4\n5";
        let first = merge(base.as_bytes(), local.as_bytes(), remote.as_bytes());
        for _ in 0..5 {
            let again = merge(base.as_bytes(), local.as_bytes(), remote.as_bytes());
            assert_eq!(again, first);
        }
    }

    #[test]
    fn empty_base_with_divergent_content_conflicts() {
        let (merged, conflicts) = merge_str("", "only local", "only remote");
        assert!(conflicts);
        assert!(merged.contains(MARKER_SEP));
    }

    #[test]
    fn trailing_newline_is_preserved() {
        let base = "a\nb\n";
        let local = "a\nb2\n";
        let remote = "a\nb\n";
        let (merged, _) = merge_str(base, local, remote);
        assert_eq!(merged, "a\nb2\n");
    }
}
