//! Distance metrics between a patched run and the original program.
use super::coverage::CoverageMap;
use std::collections::BTreeSet;

/// Character-level Levenshtein distance.
pub fn levenshtein(left: &str, right: &str) -> usize {
    if left == right {
        return 0;
    }
    let right: Vec<char> = right.chars().collect();
    let mut previous: Vec<usize> = (0..=right.len()).collect();
    let mut current = vec![0; right.len() + 1];
    for (i, a) in left.chars().enumerate() {
        current[0] = i + 1;
        for (j, b) in right.iter().enumerate() {
            let cost = usize::from(a != *b);
            current[j + 1] = (current[j] + 1).min(previous[j + 1] + 1).min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[right.len()]
}

/// Length of the longest common subsequence.
pub fn lcs_len<T: PartialEq>(left: &[T], right: &[T]) -> usize {
    let mut previous = vec![0usize; right.len() + 1];
    let mut current = vec![0usize; right.len() + 1];
    for a in left {
        for (j, b) in right.iter().enumerate() {
            current[j + 1] = if a == b {
                previous[j] + 1
            } else {
                current[j].max(previous[j + 1])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[right.len()]
}

/// `1 - LCS / max(len)`; two empty traces are identical.
pub fn trace_distance(patched: &[String], original: &[String]) -> f64 {
    let longest = patched.len().max(original.len());
    if longest == 0 {
        return 0.0;
    }
    1.0 - lcs_len(patched, original) as f64 / longest as f64
}

/// Sum of hit-count differences over the union of edges.
pub fn coverage_distance(patched: &CoverageMap, original: &CoverageMap) -> u64 {
    let edges: BTreeSet<&String> = patched.keys().chain(original.keys()).collect();
    edges
        .into_iter()
        .map(|edge| {
            let a = patched.get(edge).copied().unwrap_or(0);
            let b = original.get(edge).copied().unwrap_or(0);
            a.abs_diff(b)
        })
        .sum()
}

/// Arithmetic mean; zero for no samples.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_counts_edits() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("x=1", "x=1"), 0);
        assert_eq!(levenshtein("len-1", "len"), 2);
    }

    #[test]
    fn lcs_over_locations() {
        let a: Vec<String> = ["f.c:1", "f.c:2", "f.c:3", "f.c:5"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["f.c:1", "f.c:3", "f.c:4", "f.c:5"].iter().map(|s| s.to_string()).collect();
        assert_eq!(lcs_len(&a, &b), 3);
        assert!((trace_distance(&a, &b) - 0.25).abs() < 1e-9);
        assert_eq!(trace_distance(&[], &[]), 0.0);
    }

    #[test]
    fn one_sided_edges_count_fully() {
        let patched: CoverageMap = [("a".to_string(), 3), ("b".to_string(), 1)].into_iter().collect();
        let original: CoverageMap = [("a".to_string(), 1), ("c".to_string(), 4)].into_iter().collect();
        assert_eq!(coverage_distance(&patched, &original), 2 + 1 + 4);
        assert_eq!(coverage_distance(&original, &original), 0);
    }

    #[test]
    fn mean_of_nothing_is_zero() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[1.0, 2.0, 6.0]), 3.0);
    }
}
