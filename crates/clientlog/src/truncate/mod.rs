// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size bounding of nested records.
//!
//! [`Truncator::bound_size`] shrinks a record in place until its estimated
//! compact-JSON size fits a byte limit. Two strategies run in priority order,
//! one step per iteration:
//!
//! 1. **String shortening**: the longest string anywhere in the structure is
//!    cut to `min_string_length` characters followed by the marker.
//! 2. **Structural reduction**: once no string can be shortened, the nested
//!    array or object contributing the most bytes is halved. Arrays keep their
//!    first half; objects drop their largest members.
//!
//! The loop stops once the record fits, when a step makes no progress, or
//! after `max_iterations` steps. A record that still does not fit is not an
//! error; callers only learn whether anything was changed.

pub mod size;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::errors::TruncateError;
use size::{escaped_char_len, escaped_content_len, estimated_size, member_size};

pub const DEFAULT_MIN_STRING_LENGTH: usize = 10;
pub const DEFAULT_MAX_ITERATIONS: usize = 100;
pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_MARKER: &str = "...[truncated]";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TruncateConfig {
    /// Characters kept from a shortened string.
    pub min_string_length: usize,
    pub max_iterations: usize,
    /// Deepest container considered for structural reduction.
    pub max_depth: usize,
    pub marker: String,
}

impl Default for TruncateConfig {
    fn default() -> Self {
        TruncateConfig {
            min_string_length: DEFAULT_MIN_STRING_LENGTH,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_depth: DEFAULT_MAX_DEPTH,
            marker: DEFAULT_MARKER.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Clone, Debug, Default)]
pub struct Truncator {
    config: TruncateConfig,
}

impl Truncator {
    #[must_use]
    pub fn new(config: TruncateConfig) -> Self {
        Truncator { config }
    }

    #[must_use]
    pub fn config(&self) -> &TruncateConfig {
        &self.config
    }

    /// Shrinks `value` in place towards `limit_bytes`.
    ///
    /// Returns `true` if anything was modified, whether or not the record
    /// ended up under the limit.
    ///
    /// # Errors
    ///
    /// [`TruncateError::EmptyInput`] for a `null` value and
    /// [`TruncateError::NonPositiveLimit`] for a zero limit.
    pub fn bound_size(&self, value: &mut Value, limit_bytes: usize) -> Result<bool, TruncateError> {
        if value.is_null() {
            return Err(TruncateError::EmptyInput);
        }
        if limit_bytes == 0 {
            return Err(TruncateError::NonPositiveLimit);
        }

        let original = estimated_size(value);
        let mut size = original;
        if size <= limit_bytes {
            return Ok(false);
        }

        let mut truncated = false;
        let mut iterations = 0;
        while iterations < self.config.max_iterations && size > limit_bytes {
            iterations += 1;
            if !self.shorten_longest_string(value) && !self.reduce_largest_container(value) {
                break;
            }
            truncated = true;

            let new_size = estimated_size(value);
            let improved = new_size < size;
            size = new_size;
            if !improved {
                break;
            }
        }

        debug!(
            original,
            size, limit_bytes, iterations, truncated, "bounded record size"
        );
        Ok(truncated)
    }

    fn shorten_longest_string(&self, value: &mut Value) -> bool {
        let keep = self.config.min_string_length;
        let threshold = keep + self.config.marker.chars().count();
        let marker_len = escaped_content_len(&self.config.marker);
        // A multibyte marker may outweigh what the cut saves.
        let shortenable = |s: &str| {
            s.chars().count() > threshold
                && escaped_content_len(s)
                    > s.chars().take(keep).map(escaped_char_len).sum::<usize>() + marker_len
        };
        let Some(longest) = longest_string(value, &shortenable) else {
            return false;
        };
        let mut shortened: String = longest.chars().take(keep).collect();
        shortened.push_str(&self.config.marker);
        *longest = shortened;
        true
    }

    fn reduce_largest_container(&self, value: &mut Value) -> bool {
        let mut best = None;
        let mut path = Vec::new();
        find_largest_container(value, 0, self.config.max_depth, &mut path, &mut best);

        let Some((_, path)) = best else {
            return false;
        };
        let Some(target) = navigate_mut(value, &path) else {
            return false;
        };

        match target {
            Value::Array(items) => {
                let keep = (items.len() / 2).max(1);
                items.truncate(keep);
                true
            }
            Value::Object(map) => {
                let mut members: Vec<(String, usize)> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), member_size(k, v)))
                    .collect();
                // Stable sort keeps key order among equal contributions.
                members.sort_by(|a, b| b.1.cmp(&a.1));
                let remove = map.len() / 2;
                for (key, _) in members.into_iter().take(remove) {
                    map.remove(&key);
                }
                true
            }
            _ => false,
        }
    }
}

/// Longest string accepted by `shortenable`. Ties keep the first one found
/// in traversal order.
fn longest_string<'a, F>(value: &'a mut Value, shortenable: &F) -> Option<&'a mut String>
where
    F: Fn(&str) -> bool,
{
    match value {
        Value::String(s) if shortenable(s) => Some(s),
        Value::Array(items) => items
            .iter_mut()
            .filter_map(|v| longest_string(v, shortenable))
            .reduce(|best, candidate| {
                if candidate.len() > best.len() {
                    candidate
                } else {
                    best
                }
            }),
        Value::Object(map) => map
            .values_mut()
            .filter_map(|v| longest_string(v, shortenable))
            .reduce(|best, candidate| {
                if candidate.len() > best.len() {
                    candidate
                } else {
                    best
                }
            }),
        _ => None,
    }
}

/// Records the path of the largest reducible container below the root.
fn find_largest_container(
    value: &Value,
    depth: usize,
    max_depth: usize,
    path: &mut Vec<Segment>,
    best: &mut Option<(usize, Vec<Segment>)>,
) {
    let reducible = match value {
        Value::Array(items) => items.len() > 1,
        Value::Object(map) => map.len() > 1,
        _ => return,
    };

    if depth > 0 && reducible {
        let size = estimated_size(value);
        if best.as_ref().map_or(true, |(best_size, _)| size > *best_size) {
            *best = Some((size, path.clone()));
        }
    }

    if depth >= max_depth {
        return;
    }

    match value {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                path.push(Segment::Index(index));
                find_largest_container(item, depth + 1, max_depth, path, best);
                path.pop();
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                path.push(Segment::Key(key.clone()));
                find_largest_container(item, depth + 1, max_depth, path, best);
                path.pop();
            }
        }
        _ => {}
    }
}

fn navigate_mut<'a>(value: &'a mut Value, path: &[Segment]) -> Option<&'a mut Value> {
    path.iter().try_fold(value, |current, segment| match segment {
        Segment::Key(key) => current.as_object_mut()?.get_mut(key),
        Segment::Index(index) => current.as_array_mut()?.get_mut(*index),
    })
}
