//! The outcome of fitting one data generating process to one peptide

/// Summary statistics of the label incorporation distribution implied by a set of
/// model parameters
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModelSummary {
    /// The expected fraction of label element atoms carrying the heavy isotope
    pub mean: f64,
    /// The variance of the incorporation probability, only defined for models which let
    /// it vary
    pub variance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FitResult {
    pub dgp_name: String,
    pub params: Vec<f64>,
    /// The winsorized mean absolute error at `params`
    pub loss: f64,
    /// The expected envelope at `params`
    pub fitted_dist: Vec<f64>,
    pub summary: ModelSummary,
    /// The number of objective function evaluations
    pub nfev: usize,
    /// The number of basin hops taken
    pub nit: usize,
    /// The number of basin hops accepted
    pub naccepted: usize,
}

impl FitResult {
    pub fn mean(&self) -> f64 {
        self.summary.mean
    }

    pub fn variance(&self) -> Option<f64> {
        self.summary.variance
    }
}
