//! Annotation tables: named columns of equal length, row-aligned to features
//! or cells.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::{check_length, PipelineError};

/// A single annotation column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Column {
    Str(Vec<String>),
    Num(Vec<f64>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Str(v) => v.len(),
            Column::Num(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of row `i` rendered as a string.
    pub fn get_str(&self, i: usize) -> Option<String> {
        match self {
            Column::Str(v) => v.get(i).cloned(),
            Column::Num(v) => v.get(i).map(|x| format_number(*x)),
        }
    }

    /// All values rendered as strings.
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            Column::Str(v) => v.clone(),
            Column::Num(v) => v.iter().map(|x| format_number(*x)).collect(),
        }
    }

    fn subset(&self, rows: &[usize]) -> Column {
        match self {
            Column::Str(v) => Column::Str(rows.iter().map(|&i| v[i].clone()).collect()),
            Column::Num(v) => Column::Num(rows.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Parse string values as numbers when every one of them is numeric.
    pub fn infer(values: Vec<String>) -> Column {
        let parsed: Option<Vec<f64>> = values.iter().map(|s| s.parse::<f64>().ok()).collect();
        match parsed {
            Some(nums) if !nums.is_empty() => Column::Num(nums),
            _ => Column::Str(values),
        }
    }
}

fn format_number(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{x}")
    }
}

/// Named columns of uniform length.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    num_rows: usize,
    columns: Vec<(String, Column)>,
}

impl DataFrame {
    /// A table with `num_rows` rows and no columns.
    pub fn new(num_rows: usize) -> Self {
        DataFrame {
            num_rows,
            columns: Vec::new(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// Add or replace a column. Its length must match the row count.
    pub fn add_column(&mut self, name: &str, column: Column) -> Result<()> {
        check_length(&format!("column {name:?}"), column.len(), self.num_rows)?;
        match self.columns.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = column,
            None => self.columns.push((name.to_string(), column)),
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, column)| column)
    }

    /// Look up a column, failing with a reference error when it is missing.
    pub fn require_column(&self, name: &str) -> Result<&Column> {
        self.column(name).ok_or_else(|| {
            PipelineError::reference(format!("no annotation column named {name:?}")).into()
        })
    }

    /// The first column, conventionally the identifiers.
    pub fn first_column(&self) -> Option<&Column> {
        self.columns.first().map(|(_, column)| column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(name, col)| (name.as_str(), col))
    }

    /// A new table holding the listed rows, in the listed order.
    pub fn subset_rows(&self, rows: &[usize]) -> Result<Self> {
        if let Some(&bad) = rows.iter().find(|&&i| i >= self.num_rows) {
            return Err(PipelineError::consistency(format!(
                "row {bad} is out of range for a table with {} rows",
                self.num_rows
            ))
            .into());
        }
        Ok(DataFrame {
            num_rows: rows.len(),
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.subset(rows)))
                .collect(),
        })
    }

    /// Stack tables vertically. Columns missing from a table are filled with
    /// empty strings (or NaN for numeric columns present everywhere else).
    pub fn concat(frames: &[&DataFrame]) -> Self {
        let mut names: Vec<String> = Vec::new();
        for frame in frames {
            for name in frame.column_names() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        let num_rows = frames.iter().map(|f| f.num_rows).sum();
        let columns = names
            .into_iter()
            .map(|name| {
                let all_numeric = frames
                    .iter()
                    .all(|f| matches!(f.column(&name), Some(Column::Num(_)) | None));
                let column = if all_numeric {
                    let mut values = Vec::with_capacity(num_rows);
                    for frame in frames {
                        match frame.column(&name) {
                            Some(Column::Num(v)) => values.extend_from_slice(v),
                            _ => values.extend(std::iter::repeat(f64::NAN).take(frame.num_rows)),
                        }
                    }
                    Column::Num(values)
                } else {
                    let mut values = Vec::with_capacity(num_rows);
                    for frame in frames {
                        match frame.column(&name) {
                            Some(col) => values.extend(col.to_strings()),
                            None => values
                                .extend(std::iter::repeat(String::new()).take(frame.num_rows)),
                        }
                    }
                    Column::Str(values)
                };
                (name, column)
            })
            .collect();
        DataFrame { num_rows, columns }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_add_column_checks_length() {
        let mut df = DataFrame::new(3);
        df.add_column("id", Column::Str(vec!["a".into(), "b".into(), "c".into()]))
            .unwrap();
        let err = df.add_column("x", Column::Num(vec![1.0])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Consistency(_))
        ));
        assert!(matches!(
            df.require_column("nope")
                .unwrap_err()
                .downcast_ref::<PipelineError>(),
            Some(PipelineError::Reference(_))
        ));
    }

    #[test]
    fn test_subset_and_concat() -> Result<()> {
        let mut a = DataFrame::new(2);
        a.add_column("id", Column::Str(vec!["a".into(), "b".into()]))?;
        a.add_column("score", Column::Num(vec![1.0, 2.5]))?;
        let mut b = DataFrame::new(1);
        b.add_column("id", Column::Str(vec!["c".into()]))?;

        let both = DataFrame::concat(&[&a, &b]);
        assert_eq!(both.num_rows(), 3);
        assert_eq!(
            both.column("id"),
            Some(&Column::Str(vec!["a".into(), "b".into(), "c".into()]))
        );
        match both.column("score") {
            Some(Column::Num(v)) => {
                assert_eq!(&v[..2], &[1.0, 2.5]);
                assert!(v[2].is_nan());
            }
            other => panic!("unexpected column {other:?}"),
        }

        let sub = both.subset_rows(&[2, 0])?;
        assert_eq!(sub.column("id").unwrap().to_strings(), vec!["c", "a"]);
        assert!(both.subset_rows(&[3]).is_err());
        Ok(())
    }

    #[test]
    fn test_infer_column() {
        assert_eq!(
            Column::infer(vec!["1".into(), "2.5".into()]),
            Column::Num(vec![1.0, 2.5])
        );
        assert_eq!(
            Column::infer(vec!["1".into(), "x".into()]),
            Column::Str(vec!["1".into(), "x".into()])
        );
        assert_eq!(Column::Num(vec![3.0]).get_str(0).as_deref(), Some("3"));
    }
}
