//! Named segments over a single flat vector.
//!
//! A [`NamedVectorView`] partitions one `DVector<f64>` into contiguous,
//! non-overlapping segments identified by name. Ranges are resolved once at
//! setup and then reused as plain `(offset, len)` indices by every consumer,
//! so hot paths never touch the name map.

use std::collections::HashMap;

use nalgebra::{DVector, DVectorView, DVectorViewMut};

use crate::error::SchemaError;

/// An `(offset, len)` segment of a flat vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamedRange {
    pub offset: usize,
    pub len: usize,
}

impl NamedRange {
    /// Sentinel returned for labels that do not exist.
    pub const INVALID: Self = Self {
        offset: usize::MAX,
        len: 0,
    };

    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub const fn is_valid(&self) -> bool {
        self.offset != usize::MAX
    }

    /// One past the last index, `None` if it does not fit in `usize`.
    pub const fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.len)
    }
}

/// Flat vector partitioned into named segments.
#[derive(Debug, Clone)]
pub struct NamedVectorView {
    values: DVector<f64>,
    ranges: HashMap<String, NamedRange>,
    order: Vec<String>,
}

impl Default for NamedVectorView {
    fn default() -> Self {
        Self {
            values: DVector::zeros(0),
            ranges: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl NamedVectorView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a zero-filled segment of `len` entries.
    pub fn add_label(&mut self, name: &str, len: usize) -> Result<NamedRange, SchemaError> {
        if self.ranges.contains_key(name) {
            tracing::warn!(label = name, "label already registered");
            return Err(SchemaError::DuplicateLabel(name.to_owned()));
        }
        let range = NamedRange::new(self.values.len(), len);
        let end = range.end().ok_or(SchemaError::InvalidRange {
            offset: range.offset,
            len,
            total: self.values.len(),
        })?;
        self.values.resize_vertically_mut(end, 0.0);
        self.ranges.insert(name.to_owned(), range);
        self.order.push(name.to_owned());
        Ok(range)
    }

    /// Range of `name`, or [`NamedRange::INVALID`] if it is not registered.
    pub fn range(&self, name: &str) -> NamedRange {
        self.ranges.get(name).copied().unwrap_or(NamedRange::INVALID)
    }

    /// Range of `name`, failing with [`SchemaError::UnknownLabel`].
    pub fn try_range(&self, name: &str) -> Result<NamedRange, SchemaError> {
        self.ranges
            .get(name)
            .copied()
            .ok_or_else(|| SchemaError::UnknownLabel(name.to_owned()))
    }

    fn check(&self, range: NamedRange) -> Result<(), SchemaError> {
        let fits = range.end().is_some_and(|end| end <= self.values.len());
        if range.is_valid() && fits {
            Ok(())
        } else {
            Err(SchemaError::InvalidRange {
                offset: range.offset,
                len: range.len,
                total: self.values.len(),
            })
        }
    }

    /// Read-only view over `range`.
    pub fn slice(&self, range: NamedRange) -> Result<DVectorView<'_, f64>, SchemaError> {
        self.check(range)?;
        Ok(self.values.rows(range.offset, range.len))
    }

    /// Read-write view over `range`.
    pub fn slice_mut(&mut self, range: NamedRange) -> Result<DVectorViewMut<'_, f64>, SchemaError> {
        self.check(range)?;
        Ok(self.values.rows_mut(range.offset, range.len))
    }

    /// Read-only view over the segment called `name`.
    pub fn label(&self, name: &str) -> Result<DVectorView<'_, f64>, SchemaError> {
        let range = self.try_range(name)?;
        self.slice(range)
    }

    /// Read-write view over the segment called `name`.
    pub fn label_mut(&mut self, name: &str) -> Result<DVectorViewMut<'_, f64>, SchemaError> {
        let range = self.try_range(name)?;
        self.slice_mut(range)
    }

    /// Replace the whole backing vector. The length must match.
    pub fn set_values(&mut self, values: &DVector<f64>) -> Result<(), SchemaError> {
        if values.len() != self.values.len() {
            return Err(SchemaError::LengthMismatch {
                expected: self.values.len(),
                got: values.len(),
            });
        }
        self.values.copy_from(values);
        Ok(())
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut DVector<f64> {
        &mut self.values
    }

    /// Entry at a flat index.
    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Set every entry to zero, keeping the labels.
    pub fn zero(&mut self) {
        self.values.fill(0.0);
    }

    /// Drop every label and the backing vector.
    pub fn clear(&mut self) {
        self.values = DVector::zeros(0);
        self.ranges.clear();
        self.order.clear();
    }

    /// Labels in declaration order.
    pub fn labels(&self) -> &[String] {
        &self.order
    }

    pub fn num_labels(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_schema() -> NamedVectorView {
        let mut view = NamedVectorView::new();
        view.add_label("base_position", 3).unwrap();
        view.add_label("base_quaternion", 4).unwrap();
        view.add_label("joint_positions", 12).unwrap();
        view.add_label("momentum", 6).unwrap();
        view
    }

    #[test]
    fn ranges_partition_in_declaration_order() {
        let view = state_schema();
        let mut expected_offset = 0;
        for name in view.labels() {
            let range = view.range(name);
            assert!(range.is_valid());
            assert_eq!(range.offset, expected_offset);
            expected_offset = range.end().unwrap();
        }
        assert_eq!(expected_offset, view.len());
        assert_eq!(view.len(), 25);
        assert_eq!(view.num_labels(), 4);
    }

    #[test]
    fn duplicate_label_rejected_and_schema_unchanged() {
        let mut view = state_schema();
        let err = view.add_label("momentum", 3).unwrap_err();
        assert_eq!(err, SchemaError::DuplicateLabel("momentum".into()));
        assert_eq!(view.len(), 25);
        assert_eq!(view.range("momentum"), NamedRange::new(19, 6));
    }

    #[test]
    fn unknown_label_returns_sentinel() {
        let view = state_schema();
        let range = view.range("forces");
        assert_eq!(range, NamedRange::INVALID);
        assert!(!range.is_valid());
        assert!(matches!(
            view.try_range("forces"),
            Err(SchemaError::UnknownLabel(_))
        ));
        assert!(view.slice(range).is_err());
    }

    #[test]
    fn out_of_bounds_ranges_are_rejected() {
        let mut view = NamedVectorView::new();
        view.add_label("a", 3).unwrap();
        let overflowing = NamedRange::new(usize::MAX - 1, 5);
        assert_eq!(overflowing.end(), None);
        assert_eq!(
            view.slice(overflowing).unwrap_err(),
            SchemaError::InvalidRange {
                offset: usize::MAX - 1,
                len: 5,
                total: 3
            }
        );
        assert!(view.slice_mut(overflowing).is_err());
        assert!(view.slice(NamedRange::new(2, 2)).is_err());
        assert!(view.slice_mut(NamedRange::new(3, 1)).is_err());
        assert_eq!(view.slice(NamedRange::new(1, 2)).unwrap().len(), 2);
        assert_eq!(view.slice(NamedRange::new(3, 0)).unwrap().len(), 0);
    }

    #[test]
    fn slice_mut_writes_through() {
        let mut view = state_schema();
        let range = view.range("base_quaternion");
        view.slice_mut(range).unwrap()[0] = 1.0;
        assert_eq!(view.get(3), Some(1.0));
        assert_eq!(view.label("base_quaternion").unwrap()[0], 1.0);
        view.label_mut("base_position").unwrap().fill(2.0);
        assert_eq!(view.values().rows(0, 3).sum(), 6.0);
    }

    #[test]
    fn set_values_checks_length() {
        let mut view = state_schema();
        let err = view.set_values(&DVector::zeros(10)).unwrap_err();
        assert_eq!(
            err,
            SchemaError::LengthMismatch {
                expected: 25,
                got: 10
            }
        );
        let full = DVector::from_fn(25, |i, _| i as f64);
        view.set_values(&full).unwrap();
        assert_eq!(view.label("momentum").unwrap()[0], 19.0);
    }

    #[test]
    fn new_segments_are_zero_filled() {
        let mut view = NamedVectorView::new();
        view.add_label("a", 2).unwrap();
        view.values_mut().fill(5.0);
        view.add_label("b", 3).unwrap();
        assert_eq!(view.label("a").unwrap().sum(), 10.0);
        assert_eq!(view.label("b").unwrap().sum(), 0.0);
    }

    #[test]
    fn zero_and_clear() {
        let mut view = state_schema();
        view.values_mut().fill(1.0);
        view.zero();
        assert_eq!(view.values().sum(), 0.0);
        assert_eq!(view.len(), 25);

        view.clear();
        assert!(view.is_empty());
        assert_eq!(view.num_labels(), 0);
        assert!(!view.range("momentum").is_valid());
        // Labels may be reused after clear
        assert_eq!(view.add_label("momentum", 6).unwrap(), NamedRange::new(0, 6));
    }

    #[test]
    fn zero_length_label_is_valid() {
        let mut view = NamedVectorView::new();
        let empty = view.add_label("nothing", 0).unwrap();
        assert!(empty.is_valid());
        assert_eq!(view.slice(empty).unwrap().len(), 0);
    }
}
