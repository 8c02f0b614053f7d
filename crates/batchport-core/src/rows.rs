use std::ops::Range;

use crate::ValidationError;

/// Row-major block of `f32` feature vectors that all share one width.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowBatch {
    width: usize,
    data: Vec<f32>,
}

impl RowBatch {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(width: usize, rows: usize) -> Self {
        Self {
            width,
            data: Vec::with_capacity(width * rows),
        }
    }

    /// Wraps an already flattened buffer. `None` if it is not a whole number of rows.
    pub fn from_flat(width: usize, data: Vec<f32>) -> Option<Self> {
        if width == 0 || data.len() % width != 0 {
            return None;
        }
        Some(Self { width, data })
    }

    /// Copies caller rows into a batch, checking each one against `width`.
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R], width: usize) -> Result<Self, ValidationError> {
        if rows.is_empty() {
            return Err(ValidationError::EmptyRequest);
        }

        let multi = rows.len() > 1;
        let mut batch = Self::with_capacity(width, rows.len());
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != width {
                return Err(ValidationError::FeatureSize {
                    expected: width,
                    actual: row.len(),
                    item: multi.then_some(i),
                });
            }
            batch.data.extend_from_slice(row);
        }
        Ok(batch)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(self.width)?;
        self.data.get(start..start + self.width)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> + '_ {
        self.data.chunks_exact(self.width.max(1))
    }

    /// Appends every row of `other`. Widths must match.
    pub fn append(&mut self, other: &RowBatch) {
        debug_assert_eq!(self.width, other.width, "row width mismatch");
        self.data.extend_from_slice(&other.data);
    }

    /// Copies out rows `range` as a new batch.
    pub fn slice(&self, range: Range<usize>) -> RowBatch {
        let start = range.start * self.width;
        let end = range.end * self.width;
        RowBatch {
            width: self.width,
            data: self.data[start..end].to_vec(),
        }
    }

    pub fn to_vecs(&self) -> Vec<Vec<f32>> {
        self.iter().map(<[f32]>::to_vec).collect()
    }
}
