// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace tree navigation and covered-interval arithmetic.
//!
//! A trace is stored as a flat `Vec<Span>`; parent/child links are derived on
//! demand as span-id to index mappings instead of a pointer graph.

use std::collections::{HashMap, HashSet};

use crate::span::Span;

/// An ordered sequence of spans sharing one trace id.
pub type Trace = Vec<Span>;

/// Map each span id to the indices of its children within `trace`.
///
/// Only parent ids that resolve to a span of the trace produce entries; a
/// span whose parent id resolves nowhere is simply absent from every child
/// list and is treated as top-level by callers.
pub fn children_map(trace: &[Span]) -> HashMap<u64, Vec<usize>> {
    let ids: HashSet<u64> = trace.iter().map(|s| s.span_id).collect();
    let mut children: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, span) in trace.iter().enumerate() {
        if span.parent_id == 0 || span.parent_id == span.span_id {
            continue;
        }
        if ids.contains(&span.parent_id) {
            children.entry(span.parent_id).or_default().push(i);
        }
    }
    children
}

/// Length of the union of the `[start, end)` intervals of `spans`, with every
/// interval clipped at `origin`. Overlapping intervals are merged, so the
/// result never exceeds the sum of the individual durations.
pub fn covered_duration<'a>(spans: impl Iterator<Item = &'a Span>, origin: i64) -> i64 {
    let mut intervals: Vec<(i64, i64)> = spans
        .map(|s| (s.start.max(origin), s.end()))
        .filter(|(start, end)| end > start)
        .collect();
    intervals.sort_unstable();

    let mut total = 0i64;
    let mut current: Option<(i64, i64)> = None;
    for (start, end) in intervals {
        match current {
            Some((_, cur_end)) if start <= cur_end => {
                let merged_end = cur_end.max(end);
                current = current.map(|(cur_start, _)| (cur_start, merged_end));
            }
            _ => {
                if let Some((cur_start, cur_end)) = current {
                    total += cur_end - cur_start;
                }
                current = Some((start, end));
            }
        }
    }
    if let Some((cur_start, cur_end)) = current {
        total += cur_end - cur_start;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(span_id: u64, parent_id: u64, start: i64, duration: i64) -> Span {
        Span {
            trace_id: 1,
            span_id,
            parent_id,
            service: "s".to_string(),
            start,
            duration,
            ..Default::default()
        }
    }

    #[test]
    fn test_children_map() {
        let trace = vec![
            span(1, 0, 0, 100),
            span(2, 1, 10, 20),
            span(3, 1, 40, 20),
            span(4, 2, 12, 5),
        ];
        let children = children_map(&trace);
        assert_eq!(children[&1], vec![1, 2]);
        assert_eq!(children[&2], vec![3]);
        assert!(!children.contains_key(&3));
    }

    #[test]
    fn test_children_map_unresolvable_parent() {
        let trace = vec![span(52, 42, 0, 10)];
        assert!(children_map(&trace).is_empty());
    }

    #[test]
    fn test_covered_duration_merges_overlaps() {
        let spans = vec![span(1, 0, 10, 40), span(2, 0, 40, 30)];
        // [10, 50) u [40, 70) = [10, 70)
        assert_eq!(covered_duration(spans.iter(), 0), 60);
    }

    #[test]
    fn test_covered_duration_clips_at_origin() {
        let spans = vec![span(1, 0, 0, 50)];
        assert_eq!(covered_duration(spans.iter(), 30), 20);
    }

    #[test]
    fn test_covered_duration_disjoint() {
        let spans = vec![span(1, 0, 0, 10), span(2, 0, 20, 10)];
        assert_eq!(covered_duration(spans.iter(), 0), 20);
    }

    #[test]
    fn test_covered_at_most_sum_of_durations() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let spans: Vec<Span> = (0..20)
                .map(|i| span(i, 0, rng.gen_range(0..1000), rng.gen_range(0..200)))
                .collect();
            let sum: i64 = spans.iter().map(|s| s.duration).sum();
            assert!(covered_duration(spans.iter(), 0) <= sum);
        }
    }
}
