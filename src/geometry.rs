//! Rectangle math and detection fusion.
//!
//! Pure functions that merge DOM-derived and vision-derived element
//! detections into one deduplicated list in natural reading order. All
//! comparisons happen in viewport coordinates; inputs are never mutated.

use crate::types::InteractiveElement;

/// IoU threshold above which two detections are considered the same region.
pub const DEFAULT_IOU_THRESHOLD: f64 = 0.7;

/// Vertical distance within which two elements belong to the same row.
pub const DEFAULT_ROW_THRESHOLD: f64 = 20.0;

/// Intersection-over-union of two rects. Returns 0 for disjoint rects and for
/// a degenerate empty union.
pub fn iou(a: &crate::types::ElementRect, b: &crate::types::ElementRect) -> f64 {
    let left = a.left.max(b.left);
    let top = a.top.max(b.top);
    let right = a.right.min(b.right);
    let bottom = a.bottom.min(b.bottom);

    if right < left || bottom < top {
        return 0.0;
    }

    let intersection = (right - left) * (bottom - top);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// True iff every edge of `inner` lies within `outer` (non-strict).
pub fn is_contained(inner: &crate::types::ElementRect, outer: &crate::types::ElementRect) -> bool {
    inner.left >= outer.left
        && inner.top >= outer.top
        && inner.right <= outer.right
        && inner.bottom <= outer.bottom
}

/// Priority-greedy overlap filter.
///
/// Candidates are visited in descending area order (weight breaks ties), each
/// compared against the accepted set:
/// - IoU above `iou_threshold` with an accepted element discards the
///   candidate;
/// - a candidate fully contained in an accepted element is discarded;
/// - an accepted element fully contained in the candidate is superseded
///   (removed), and the candidate keeps being evaluated against the rest.
///
/// Single left-to-right pass; a removed element is not reconsidered.
pub fn filter_overlapping_elements(
    mut elements: Vec<InteractiveElement>,
    iou_threshold: f64,
) -> Vec<InteractiveElement> {
    elements.sort_by(|a, b| {
        let area_cmp = b
            .viewport_rect
            .area()
            .partial_cmp(&a.viewport_rect.area())
            .unwrap_or(std::cmp::Ordering::Equal);
        area_cmp.then(
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });

    let mut accepted: Vec<InteractiveElement> = Vec::new();

    'candidates: for candidate in elements {
        let mut index = 0;
        while index < accepted.len() {
            let kept = &accepted[index];
            if iou(&candidate.viewport_rect, &kept.viewport_rect) > iou_threshold {
                continue 'candidates;
            }
            if is_contained(&candidate.viewport_rect, &kept.viewport_rect) {
                continue 'candidates;
            }
            if is_contained(&kept.viewport_rect, &candidate.viewport_rect) {
                accepted.remove(index);
                continue;
            }
            index += 1;
        }
        accepted.push(candidate);
    }

    accepted
}

/// Sort elements into natural reading order and reassign contiguous indices.
///
/// Elements whose top coordinates differ by at most `row_threshold` share a
/// row; rows are ordered top-to-bottom by the first member's top, members
/// left-to-right by their left edge with `z_index` as the tie-break.
pub fn sort_elements_by_position(
    elements: Vec<InteractiveElement>,
    row_threshold: f64,
) -> Vec<InteractiveElement> {
    let mut by_top = elements;
    by_top.sort_by(|a, b| {
        a.viewport_rect
            .top
            .partial_cmp(&b.viewport_rect.top)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut rows: Vec<Vec<InteractiveElement>> = Vec::new();
    for element in by_top {
        match rows.last_mut() {
            Some(row)
                if (element.viewport_rect.top - row[0].viewport_rect.top).abs()
                    <= row_threshold =>
            {
                row.push(element);
            }
            _ => rows.push(vec![element]),
        }
    }

    for row in rows.iter_mut() {
        row.sort_by(|a, b| {
            let x_cmp = a
                .viewport_rect
                .left
                .partial_cmp(&b.viewport_rect.left)
                .unwrap_or(std::cmp::Ordering::Equal);
            x_cmp.then(b.z_index.cmp(&a.z_index))
        });
    }

    let mut ordered: Vec<InteractiveElement> = rows.into_iter().flatten().collect();
    for (index, element) in ordered.iter_mut().enumerate() {
        element.index = index;
    }
    ordered
}

/// Fusion entry point: concatenate DOM-derived and vision-derived detections,
/// deduplicate, and order. The only place indices are assigned.
pub fn fuse_elements(
    dom_elements: Vec<InteractiveElement>,
    cv_elements: Vec<InteractiveElement>,
) -> Vec<InteractiveElement> {
    let mut combined = dom_elements;
    combined.extend(cv_elements);
    let filtered = filter_overlapping_elements(combined, DEFAULT_IOU_THRESHOLD);
    sort_elements_by_position(filtered, DEFAULT_ROW_THRESHOLD)
}
