//! Window policy: which indices stay live around the current position, and in
//! which order they should be prepared.

use crate::config::WindowSettings;
use std::collections::BTreeSet;

/// Direction of the last index move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Forward,
    Backward,
    #[default]
    Unknown,
}

impl Direction {
    /// Direction of travel from `old` to `new`.
    pub fn between(old: Option<usize>, new: usize) -> Self {
        match old {
            Some(old) if new > old => Direction::Forward,
            Some(old) if new < old => Direction::Backward,
            _ => Direction::Unknown,
        }
    }
}

/// The live range around a center index. Derived on every index change, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub center: usize,
    pub backward_radius: usize,
    pub forward_radius: usize,
    pub preload_extra: usize,
    pub direction: Direction,
}

impl Window {
    pub fn new(center: usize, settings: &WindowSettings, direction: Direction) -> Self {
        Self {
            center,
            backward_radius: settings.backward_radius,
            forward_radius: settings.forward_radius,
            preload_extra: settings.preload_extra,
            direction,
        }
    }

    /// Radii after applying the direction bias.
    pub fn effective_radii(&self) -> (usize, usize) {
        match self.direction {
            Direction::Forward => (self.backward_radius, self.forward_radius + self.preload_extra),
            Direction::Backward => (self.backward_radius + self.preload_extra, self.forward_radius),
            Direction::Unknown => (self.backward_radius, self.forward_radius),
        }
    }

    /// Indices to keep for a feed of `item_count` items.
    pub fn keep_set(&self, item_count: usize) -> BTreeSet<usize> {
        let (backward, forward) = self.effective_radii();
        compute_window(self.center, item_count, backward, forward)
    }

    /// Keep set in preparation order, center first.
    pub fn priority_order(&self, item_count: usize) -> Vec<usize> {
        let keep = self.keep_set(item_count);
        order_by_priority(keep, self.center)
    }
}

/// Contiguous range `[center - backward, center + forward]` clipped to `0..item_count`.
///
/// Returns an empty set when the feed is empty. A center past the end is clamped
/// to the last item.
pub fn compute_window(
    center: usize,
    item_count: usize,
    backward_radius: usize,
    forward_radius: usize,
) -> BTreeSet<usize> {
    if item_count == 0 {
        return BTreeSet::new();
    }
    let center = center.min(item_count - 1);
    let start = center.saturating_sub(backward_radius);
    let end = center.saturating_add(forward_radius).min(item_count - 1);
    (start..=end).collect()
}

/// Sort indices by distance from `center`, ties broken by the lower index.
pub fn order_by_priority(indices: impl IntoIterator<Item = usize>, center: usize) -> Vec<usize> {
    let mut ordered: Vec<usize> = indices.into_iter().collect();
    ordered.sort_by_key(|&i| (i.abs_diff(center), i));
    ordered.dedup();
    ordered
}
