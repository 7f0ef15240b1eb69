//! Helpers shared by the step `serialize`/`unserialize` implementations.

use anyhow::{Context, Result};
use ndarray::Array2;
use sc_store::names::{PARAMETERS, RESULTS};
use sc_store::{read_parameters, write_parameters, Group};
use sc_types::error::check_length;
use sc_types::PipelineError;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::step::Step;

/// The group of `step` in a state document.
pub(crate) fn step_group(document: &Group, step: Step) -> Result<&Group> {
    document
        .group(step.name())
        .with_context(|| format!("state document has no {step} step"))
}

/// Create the `parameters` subgroup of a step and fill it.
pub(crate) fn write_step_parameters<P: Serialize>(step: &mut Group, params: &P) -> Result<()> {
    write_parameters(step.create_group(PARAMETERS), params)
}

/// Parameters of a persisted step; defaults when the group is absent.
pub(crate) fn read_step_parameters<P: DeserializeOwned + Default>(step: &Group) -> Result<P> {
    match step.group_opt(PARAMETERS) {
        Some(group) => read_parameters(group),
        None => Ok(P::default()),
    }
}

/// The `results` subgroup, present once the step has computed.
pub(crate) fn results(step: &Group) -> Option<&Group> {
    step.group_opt(RESULTS)
}

/// Store a dense matrix as a row-major array plus its shape.
pub(crate) fn write_array2(group: &mut Group, name: &str, array: &Array2<f64>) {
    let g = group.create_group(name);
    g.write("shape", vec![array.nrows() as i64, array.ncols() as i64]);
    g.write("data", array.iter().copied().collect::<Vec<f64>>());
}

pub(crate) fn read_array2(group: &Group, name: &str) -> Result<Array2<f64>> {
    let g = group.group(name)?;
    let shape: Vec<usize> = g.read("shape")?;
    check_length(&format!("shape of {name:?}"), shape.len(), 2)?;
    let data: Vec<f64> = g.read("data")?;
    check_length(&format!("data of {name:?}"), data.len(), shape[0] * shape[1])?;
    Array2::from_shape_vec((shape[0], shape[1]), data)
        .map_err(|e| PipelineError::consistency(format!("{name:?}: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_array2_roundtrip() -> Result<()> {
        let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let mut g = Group::new();
        write_array2(&mut g, "pcs", &a);
        assert_eq!(read_array2(&g, "pcs")?, a);

        g.group_mut("pcs")?.write("shape", vec![4i64, 4]);
        assert!(read_array2(&g, "pcs").is_err());
        Ok(())
    }
}
