//! Append-only training data storage.

use crate::error::ImputeError;
use ndarray::Array1;

/// One row of training (or query) data. The response may contain atom values
/// and NaN missing sentinels; predictors must be fully observed.
#[derive(Clone, Debug)]
pub struct Observation {
    pub x: Array1<f64>,
    pub y: Array1<f64>,
}

impl Observation {
    pub fn new(x: Array1<f64>, y: Array1<f64>) -> Self {
        Self { x, y }
    }
}

/// Dimension-checked observation store. Rows are appended before training and
/// never mutated afterwards; the sweep machinery only ever borrows them.
#[derive(Clone, Debug)]
pub struct DataSet {
    xdim: usize,
    ydim: usize,
    rows: Vec<Observation>,
}

impl DataSet {
    pub fn new(xdim: usize, ydim: usize) -> Self {
        Self {
            xdim,
            ydim,
            rows: Vec::new(),
        }
    }

    pub fn xdim(&self) -> usize {
        self.xdim
    }

    pub fn ydim(&self) -> usize {
        self.ydim
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Observation] {
        &self.rows
    }

    pub fn push(&mut self, observation: Observation) -> Result<(), ImputeError> {
        validate_row(&observation, self.xdim, self.ydim)?;
        self.rows.push(observation);
        Ok(())
    }
}

/// Shared validation for training rows and external imputation queries.
pub fn validate_row(
    observation: &Observation,
    xdim: usize,
    ydim: usize,
) -> Result<(), ImputeError> {
    if observation.x.len() != xdim {
        return Err(ImputeError::DimensionMismatch {
            what: "predictor vector",
            expected: xdim,
            found: observation.x.len(),
        });
    }
    if observation.y.len() != ydim {
        return Err(ImputeError::DimensionMismatch {
            what: "response vector",
            expected: ydim,
            found: observation.y.len(),
        });
    }
    if observation.x.iter().any(|v| !v.is_finite()) {
        return Err(ImputeError::InvalidArgument(
            "predictor vector must be fully observed and finite".to_string(),
        ));
    }
    if observation.y.iter().any(|v| v.is_infinite()) {
        return Err(ImputeError::InvalidArgument(
            "response cells must be finite or the NaN missing sentinel".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn push_validates_dimensions() {
        let mut data = DataSet::new(2, 1);
        assert!(
            data.push(Observation::new(array![1.0, 2.0], array![3.0]))
                .is_ok()
        );
        assert!(matches!(
            data.push(Observation::new(array![1.0], array![3.0])),
            Err(ImputeError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            data.push(Observation::new(array![1.0, 2.0], array![3.0, 4.0])),
            Err(ImputeError::DimensionMismatch { .. })
        ));
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn nan_response_is_accepted_as_missing() {
        let mut data = DataSet::new(1, 2);
        assert!(
            data.push(Observation::new(array![1.0], array![f64::NAN, 2.0]))
                .is_ok()
        );
    }

    #[test]
    fn non_finite_predictors_are_rejected() {
        let mut data = DataSet::new(1, 1);
        assert!(
            data.push(Observation::new(array![f64::NAN], array![1.0]))
                .is_err()
        );
        assert!(
            data.push(Observation::new(array![1.0], array![f64::INFINITY]))
                .is_err()
        );
    }
}
