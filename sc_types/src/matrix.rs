//! Sparse count matrices, features in rows and cells in columns.

use anyhow::Result;
use sprs::CsMat;
use std::fmt;

use crate::error::{check_length, PipelineError};

/// A features × cells matrix stored in compressed sparse row format.
#[derive(Clone)]
pub struct CountMatrix {
    inner: CsMat<f64>,
    bounds: Vec<usize>,
}

impl CountMatrix {
    /// Assemble a matrix from per-row entries. Each row lists `(column, value)`
    /// pairs in any order; duplicate coordinates are summed.
    pub fn from_rows(num_columns: usize, rows: Vec<Vec<(usize, f64)>>) -> Result<Self> {
        let num_rows = rows.len();
        let mut indptr = Vec::with_capacity(num_rows + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for (r, mut row) in rows.into_iter().enumerate() {
            row.sort_by_key(|&(c, _)| c);
            let mut last: Option<usize> = None;
            for (c, v) in row {
                if c >= num_columns {
                    return Err(PipelineError::consistency(format!(
                        "entry ({r}, {c}) is outside a matrix with {num_columns} columns"
                    ))
                    .into());
                }
                if last == Some(c) {
                    if let Some(prev) = data.last_mut() {
                        *prev += v;
                    }
                    continue;
                }
                indices.push(c);
                data.push(v);
                last = Some(c);
            }
            indptr.push(indices.len());
        }
        Ok(CountMatrix {
            inner: CsMat::new((num_rows, num_columns), indptr.clone(), indices, data),
            bounds: indptr,
        })
    }

    /// Assemble a matrix from `(row, column, value)` triplets.
    pub fn from_triplets(
        num_rows: usize,
        num_columns: usize,
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Result<Self> {
        let mut rows = vec![Vec::new(); num_rows];
        for (r, c, v) in triplets {
            let row = rows.get_mut(r).ok_or_else(|| {
                PipelineError::consistency(format!(
                    "entry ({r}, {c}) is outside a matrix with {num_rows} rows"
                ))
            })?;
            row.push((c, v));
        }
        Self::from_rows(num_columns, rows)
    }

    /// Build from dense rows, skipping zeros.
    pub fn from_dense(num_columns: usize, rows: &[Vec<f64>]) -> Result<Self> {
        let sparse = rows
            .iter()
            .enumerate()
            .map(|(r, row)| {
                check_length(&format!("row {r}"), row.len(), num_columns)?;
                Ok(row
                    .iter()
                    .enumerate()
                    .filter(|(_, &v)| v != 0.0)
                    .map(|(c, &v)| (c, v))
                    .collect())
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_rows(num_columns, sparse)
    }

    /// An empty matrix with `num_columns` cells and no features.
    pub fn empty(num_columns: usize) -> Self {
        CountMatrix {
            inner: CsMat::new((0, num_columns), vec![0], Vec::new(), Vec::new()),
            bounds: vec![0],
        }
    }

    /// Number of features.
    pub fn num_rows(&self) -> usize {
        self.inner.rows()
    }

    /// Number of cells.
    pub fn num_columns(&self) -> usize {
        self.inner.cols()
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.inner.nnz()
    }

    /// Stored values, row-major. Exposed for identity checks.
    pub fn data(&self) -> &[f64] {
        self.inner.data()
    }

    /// Column indices and values of a row.
    pub fn row(&self, row: usize) -> (&[usize], &[f64]) {
        if row + 1 >= self.bounds.len() {
            return (&[], &[]);
        }
        let (start, end) = (self.bounds[row], self.bounds[row + 1]);
        (
            &self.inner.indices()[start..end],
            &self.inner.data()[start..end],
        )
    }

    /// A row expanded to a dense vector over all cells.
    pub fn row_dense(&self, row: usize) -> Vec<f64> {
        let mut out = vec![0.0; self.num_columns()];
        let (indices, values) = self.row(row);
        for (&c, &v) in indices.iter().zip(values) {
            out[c] = v;
        }
        out
    }

    /// Iterate rows as `(indices, values)` pairs.
    pub fn rows(&self) -> impl Iterator<Item = (&[usize], &[f64])> + '_ {
        (0..self.num_rows()).map(move |r| self.row(r))
    }

    /// Total count per cell.
    pub fn column_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.num_columns()];
        for (indices, values) in self.rows() {
            for (&c, &v) in indices.iter().zip(values) {
                sums[c] += v;
            }
        }
        sums
    }

    /// Number of features with a positive count, per cell.
    pub fn column_detected(&self) -> Vec<f64> {
        let mut detected = vec![0.0; self.num_columns()];
        for (indices, values) in self.rows() {
            for (&c, &v) in indices.iter().zip(values) {
                if v > 0.0 {
                    detected[c] += 1.0;
                }
            }
        }
        detected
    }

    /// A new matrix holding the listed rows, in the listed order.
    pub fn subset_rows(&self, rows: &[usize]) -> Result<Self> {
        let n = self.num_rows();
        let picked = rows
            .iter()
            .map(|&r| {
                if r >= n {
                    return Err(PipelineError::consistency(format!(
                        "row {r} is out of range for a matrix with {n} rows"
                    ))
                    .into());
                }
                let (indices, values) = self.row(r);
                Ok(indices.iter().copied().zip(values.iter().copied()).collect())
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_rows(self.num_columns(), picked)
    }

    /// A new matrix holding the listed columns, in the listed order.
    pub fn subset_columns(&self, columns: &[usize]) -> Result<Self> {
        let n = self.num_columns();
        let mut targets: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (new, &old) in columns.iter().enumerate() {
            if old >= n {
                return Err(PipelineError::consistency(format!(
                    "column {old} is out of range for a matrix with {n} columns"
                ))
                .into());
            }
            targets[old].push(new);
        }
        let rows = self
            .rows()
            .map(|(indices, values)| {
                let mut row = Vec::with_capacity(indices.len());
                for (&c, &v) in indices.iter().zip(values) {
                    row.extend(targets[c].iter().map(|&new| (new, v)));
                }
                row
            })
            .collect();
        Self::from_rows(columns.len(), rows)
    }

    /// Drop the columns flagged in `discard`.
    pub fn filter_columns(&self, discard: &[bool]) -> Result<Self> {
        check_length("discard vector", discard.len(), self.num_columns())?;
        let keep: Vec<usize> = (0..discard.len()).filter(|&c| !discard[c]).collect();
        self.subset_columns(&keep)
    }

    /// Concatenate matrices with identical rows side by side.
    pub fn cbind(parts: &[&CountMatrix]) -> Result<Self> {
        let num_rows = parts.first().map_or(0, |m| m.num_rows());
        let mut rows = vec![Vec::new(); num_rows];
        let mut offset = 0;
        for (i, part) in parts.iter().enumerate() {
            check_length(&format!("rows of matrix {i}"), part.num_rows(), num_rows)?;
            for (r, (indices, values)) in part.rows().enumerate() {
                rows[r].extend(indices.iter().zip(values).map(|(&c, &v)| (c + offset, v)));
            }
            offset += part.num_columns();
        }
        Self::from_rows(offset, rows)
    }

    /// A new matrix with `f(row, column, value)` applied to every stored entry.
    pub fn map_entries(&self, f: impl Fn(usize, usize, f64) -> f64) -> Self {
        let mut inner = self.inner.clone();
        let indices = self.inner.indices();
        let data = inner.data_mut();
        for r in 0..self.num_rows() {
            for k in self.bounds[r]..self.bounds[r + 1] {
                data[k] = f(r, indices[k], data[k]);
            }
        }
        CountMatrix {
            inner,
            bounds: self.bounds.clone(),
        }
    }
}

impl PartialEq for CountMatrix {
    fn eq(&self, other: &Self) -> bool {
        self.num_rows() == other.num_rows()
            && self.num_columns() == other.num_columns()
            && self.rows().zip(other.rows()).all(|(a, b)| a == b)
    }
}

impl fmt::Debug for CountMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountMatrix")
            .field("rows", &self.num_rows())
            .field("columns", &self.num_columns())
            .field("nnz", &self.nnz())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> CountMatrix {
        CountMatrix::from_dense(
            4,
            &[
                vec![1.0, 0.0, 2.0, 0.0],
                vec![0.0, 3.0, 0.0, 0.0],
                vec![4.0, 0.0, 0.0, 5.0],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_sums_and_detected() {
        let m = example();
        assert_eq!(m.num_rows(), 3);
        assert_eq!(m.num_columns(), 4);
        assert_eq!(m.nnz(), 5);
        assert_eq!(m.column_sums(), vec![5.0, 3.0, 2.0, 5.0]);
        assert_eq!(m.column_detected(), vec![2.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_duplicate_triplets_are_summed() -> Result<()> {
        let m = CountMatrix::from_triplets(2, 2, vec![(0, 1, 1.0), (0, 1, 2.0), (1, 0, 4.0)])?;
        assert_eq!(m.row_dense(0), vec![0.0, 3.0]);
        assert_eq!(m.row_dense(1), vec![4.0, 0.0]);
        assert!(CountMatrix::from_triplets(2, 2, vec![(2, 0, 1.0)]).is_err());
        Ok(())
    }

    #[test]
    fn test_subset_columns_with_repeats() -> Result<()> {
        let m = example().subset_columns(&[3, 0, 0])?;
        assert_eq!(m.row_dense(0), vec![0.0, 1.0, 1.0]);
        assert_eq!(m.row_dense(2), vec![5.0, 4.0, 4.0]);
        assert!(example().subset_columns(&[4]).is_err());
        Ok(())
    }

    #[test]
    fn test_filter_and_rows() -> Result<()> {
        let m = example();
        let f = m.filter_columns(&[false, true, false, true])?;
        assert_eq!(f.num_columns(), 2);
        assert_eq!(f.row_dense(2), vec![4.0, 0.0]);
        assert!(m.filter_columns(&[false]).is_err());

        let s = m.subset_rows(&[2, 0])?;
        assert_eq!(s.row_dense(0), m.row_dense(2));
        assert_eq!(s.row_dense(1), m.row_dense(0));
        Ok(())
    }

    #[test]
    fn test_cbind() -> Result<()> {
        let m = example();
        let both = CountMatrix::cbind(&[&m, &m])?;
        assert_eq!(both.num_columns(), 8);
        assert_eq!(both.row_dense(1), vec![0.0, 3.0, 0.0, 0.0, 0.0, 3.0, 0.0, 0.0]);
        let short = m.subset_rows(&[0])?;
        assert!(CountMatrix::cbind(&[&m, &short]).is_err());
        Ok(())
    }

    #[test]
    fn test_map_entries() {
        let m = example().map_entries(|r, c, v| v * 10.0 + (r * 100 + c) as f64 * 1000.0);
        assert_eq!(m.row_dense(0), vec![10.0, 0.0, 2020.0, 0.0]);
        assert_eq!(m.row_dense(2), vec![200_040.0, 0.0, 0.0, 203_050.0]);
    }
}
