/*! Data generating processes describing how the label element's heavy isotope is
incorporated into a peptide, and the machinery to fit them to observed envelopes.

Every model produces a label incorporation distribution over the number of heavy atoms,
convolves it with the isotopic envelope of the rest of the molecule, and optionally mixes
the result with the peptide's natural, unenriched envelope.
*/
use std::fmt::{self, Display};
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{Binomial, Discrete};
use statrs::function::beta::checked_ln_beta;
use statrs::function::factorial::ln_binomial;
use thiserror::Error;
use tracing::trace;

use crate::fit_result::{FitResult, ModelSummary};
use crate::optimize::{basin_hopping, random_displacement, BasinHoppingParams};
use crate::peptide::Peptide;
use crate::stats::{convolve, nanmean, nanquantile, nansum};

/// Residuals at or above this quantile are clamped to it before averaging
pub const WINSORIZE_QUANTILE: f64 = 0.9;

/// The beta-binomial step proposer keeps `a / (a + b)` at or above `1 / (1 + this)`
pub const MIN_BETA_RATIO: f64 = 19.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DgpError {
    #[error("{model} takes {expected} parameters but {received} were given")]
    ParameterCount {
        model: &'static str,
        expected: usize,
        received: usize,
    },
    #[error("Peptide {0} has no observations to fit")]
    EmptyObservations(String),
    #[error("Label element {element} does not occur in {sequence}")]
    MissingLabelElement { element: String, sequence: String },
    #[error("Invalid distribution parameters for {model}: {params:?}")]
    InvalidParameters {
        model: &'static str,
        params: Vec<f64>,
    },
    #[error("{0} is not a known data generating process")]
    UnknownModel(String),
}

/// The binomial probability mass at `k = 0..n`, excluding `n` itself
pub fn binomial_pmf(n: u32, p: f64) -> Option<Vec<f64>> {
    let dist = Binomial::new(p, n as u64).ok()?;
    Some((0..n as u64).map(|k| dist.pmf(k)).collect())
}

/// The beta-binomial probability mass at `k = 0..n`, excluding `n` itself
pub fn betabinomial_pmf(n: u32, a: f64, b: f64) -> Option<Vec<f64>> {
    let n = n as u64;
    let denom = checked_ln_beta(a, b).ok()?;
    (0..n)
        .map(|k| {
            let kf = k as f64;
            let num = checked_ln_beta(kf + a, (n - k) as f64 + b).ok()?;
            Some((ln_binomial(n, k) + num - denom).exp())
        })
        .collect()
}

/// The mean absolute error between `expected` and every row of `observed`, with the
/// largest residuals clamped to the [`WINSORIZE_QUANTILE`] of all residuals.
/// Missing observations are ignored.
pub fn winsorized_loss(expected: &[f64], observed: &[Vec<f64>]) -> f64 {
    let mut residuals: Vec<f64> = observed
        .iter()
        .flat_map(|row| row.iter().zip(expected).map(|(o, e)| (e - o).abs()))
        .collect();
    let q = nanquantile(&residuals, WINSORIZE_QUANTILE);
    for r in residuals.iter_mut() {
        if *r >= q {
            *r = q;
        }
    }
    nanmean(&residuals)
}

/// Convolve a label distribution with the peptide's background envelope, mix it with the
/// unenriched envelope at `fraction` if given, and normalize.
fn enriched_envelope(peptide: &Peptide, label_dist: &[f64], fraction: Option<f64>) -> Vec<f64> {
    let mut exp = peptide.reshape(&convolve(label_dist, &peptide.background));
    if let Some(f) = fraction {
        for (e, u) in exp.iter_mut().zip(peptide.unenriched.iter()) {
            *e = u * (1.0 - f) + *e * f;
        }
    }
    let total = nansum(&exp);
    exp.iter_mut().for_each(|e| *e /= total);
    exp
}

fn beta_summary(a: f64, b: f64) -> ModelSummary {
    let s = a + b;
    ModelSummary {
        mean: a / s,
        variance: Some((a * b) / (s.powi(2) * (s + 1.0))),
    }
}

/// Uniform displacement clipped to `bounds`, then the second to last parameter (`a`) is
/// clamped to at least `b / 19` where `b` is the last.
fn beta_binomial_step<R: Rng>(
    x: &[f64],
    stepsize: f64,
    bounds: &[(f64, f64)],
    rng: &mut R,
) -> Vec<f64> {
    let mut next = random_displacement(x, stepsize, bounds, rng);
    let n = next.len();
    if n >= 2 {
        let b = next[n - 1];
        let upper = bounds[n - 2].1;
        next[n - 2] = next[n - 2].max(b / MIN_BETA_RATIO).min(upper);
    }
    next
}

/// A statistical model of label incorporation which can be fit to a [`Peptide`]
pub trait DataGeneratingProcess {
    fn name(&self) -> &'static str;

    /// The box constraints on each parameter
    fn bounds(&self) -> &'static [(f64, f64)];

    fn initial_guess(&self, peptide: &Peptide) -> Vec<f64>;

    /// The normalized envelope this model predicts for `peptide` at `params`, `npeaks` long
    fn expected(&self, peptide: &Peptide, params: &[f64]) -> Result<Vec<f64>, DgpError>;

    fn summarize(&self, params: &[f64]) -> ModelSummary;

    /// Propose a new starting point for the next basin hop
    fn propose_step<R: Rng>(&self, params: &[f64], stepsize: f64, rng: &mut R) -> Vec<f64> {
        random_displacement(params, stepsize, self.bounds(), rng)
    }

    fn check_params(&self, params: &[f64]) -> Result<(), DgpError> {
        let expected = self.bounds().len();
        if params.len() != expected {
            return Err(DgpError::ParameterCount {
                model: self.name(),
                expected,
                received: params.len(),
            });
        }
        Ok(())
    }

    fn loss(&self, peptide: &Peptide, params: &[f64]) -> Result<f64, DgpError> {
        let exp = self.expected(peptide, params)?;
        Ok(winsorized_loss(&exp, &peptide.obs))
    }

    /// Fit this model to `peptide` by basin hopping from [`DataGeneratingProcess::initial_guess`].
    ///
    /// Parameters at which the loss can't be computed are treated as infinitely bad.
    #[tracing::instrument(level = "debug", skip_all, fields(model = self.name(), peptide = %peptide.sequence))]
    fn fit(
        &self,
        peptide: &Peptide,
        params: &BasinHoppingParams,
        seed: u64,
    ) -> Result<FitResult, DgpError> {
        if !peptide.has_observations() {
            return Err(DgpError::EmptyObservations(peptide.sequence.clone()));
        }
        let x0 = self.initial_guess(peptide);
        self.loss(peptide, &x0)?;

        let bounds = self.bounds();
        let mut rng = StdRng::seed_from_u64(seed);
        let result = basin_hopping(
            |x| {
                self.loss(peptide, x)
                    .ok()
                    .filter(|v| !v.is_nan())
                    .unwrap_or(f64::INFINITY)
            },
            &x0,
            bounds,
            |x, stepsize, rng| self.propose_step(x, stepsize, rng),
            params,
            &mut rng,
        );
        trace!(
            "Fit {} with loss {} after {} evaluations",
            self.name(),
            result.fun,
            result.nfev
        );

        let fitted_dist = self.expected(peptide, &result.x)?;
        Ok(FitResult {
            dgp_name: self.name().to_string(),
            summary: self.summarize(&result.x),
            params: result.x,
            loss: result.fun,
            fitted_dist,
            nfev: result.nfev,
            nit: result.nit,
            naccepted: result.naccepted,
        })
    }
}

fn label_count(peptide: &Peptide) -> Result<u32, DgpError> {
    match peptide.label_count() {
        0 => Err(DgpError::MissingLabelElement {
            element: peptide.label_element.clone(),
            sequence: peptide.sequence.clone(),
        }),
        n => Ok(n),
    }
}

/// Every label atom is heavy with the same probability `p`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Binom;

impl DataGeneratingProcess for Binom {
    fn name(&self) -> &'static str {
        "Binom"
    }

    fn bounds(&self) -> &'static [(f64, f64)] {
        &[(0.0, 1.0)]
    }

    fn initial_guess(&self, _peptide: &Peptide) -> Vec<f64> {
        vec![0.5]
    }

    fn expected(&self, peptide: &Peptide, params: &[f64]) -> Result<Vec<f64>, DgpError> {
        self.check_params(params)?;
        let label = binomial_pmf(label_count(peptide)?, params[0]).ok_or_else(|| {
            DgpError::InvalidParameters {
                model: self.name(),
                params: params.to_vec(),
            }
        })?;
        Ok(enriched_envelope(peptide, &label, None))
    }

    fn summarize(&self, params: &[f64]) -> ModelSummary {
        ModelSummary {
            mean: params.first().copied().unwrap_or(f64::NAN),
            variance: None,
        }
    }
}

/// A fraction `f` of the peptide pool is labeled binomially with probability `p`, the
/// remainder was never exposed to the label
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BinomQuiescentMix;

impl DataGeneratingProcess for BinomQuiescentMix {
    fn name(&self) -> &'static str {
        "BinomQuiescentMix"
    }

    fn bounds(&self) -> &'static [(f64, f64)] {
        &[(0.0, 1.0), (0.1, 1.0)]
    }

    fn initial_guess(&self, _peptide: &Peptide) -> Vec<f64> {
        vec![0.5, 0.5]
    }

    fn expected(&self, peptide: &Peptide, params: &[f64]) -> Result<Vec<f64>, DgpError> {
        self.check_params(params)?;
        let label = binomial_pmf(label_count(peptide)?, params[1]).ok_or_else(|| {
            DgpError::InvalidParameters {
                model: self.name(),
                params: params.to_vec(),
            }
        })?;
        Ok(enriched_envelope(peptide, &label, Some(params[0])))
    }

    fn summarize(&self, params: &[f64]) -> ModelSummary {
        ModelSummary {
            mean: params.get(1).copied().unwrap_or(f64::NAN),
            variance: None,
        }
    }
}

/// The heavy isotope probability varies between molecules following `Beta(a, b)`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Betabinom;

impl DataGeneratingProcess for Betabinom {
    fn name(&self) -> &'static str {
        "Betabinom"
    }

    fn bounds(&self) -> &'static [(f64, f64)] {
        &[(1.0, 100.0), (1.0, 100.0)]
    }

    fn initial_guess(&self, _peptide: &Peptide) -> Vec<f64> {
        vec![4.0, 3.0]
    }

    fn expected(&self, peptide: &Peptide, params: &[f64]) -> Result<Vec<f64>, DgpError> {
        self.check_params(params)?;
        let label = betabinomial_pmf(label_count(peptide)?, params[0], params[1]).ok_or_else(
            || DgpError::InvalidParameters {
                model: self.name(),
                params: params.to_vec(),
            },
        )?;
        Ok(enriched_envelope(peptide, &label, None))
    }

    fn summarize(&self, params: &[f64]) -> ModelSummary {
        match params {
            [a, b] => beta_summary(*a, *b),
            _ => ModelSummary {
                mean: f64::NAN,
                variance: None,
            },
        }
    }

    fn propose_step<R: Rng>(&self, params: &[f64], stepsize: f64, rng: &mut R) -> Vec<f64> {
        beta_binomial_step(params, stepsize, self.bounds(), rng)
    }
}

/// A fraction `f` of the peptide pool is labeled following `Betabinom(a, b)`, the
/// remainder was never exposed to the label
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BetabinomQuiescentMix;

impl DataGeneratingProcess for BetabinomQuiescentMix {
    fn name(&self) -> &'static str {
        "BetabinomQuiescentMix"
    }

    fn bounds(&self) -> &'static [(f64, f64)] {
        &[(0.0, 1.0), (1.0, 100.0), (1.0, 100.0)]
    }

    fn initial_guess(&self, _peptide: &Peptide) -> Vec<f64> {
        vec![0.5, 4.0, 3.0]
    }

    fn expected(&self, peptide: &Peptide, params: &[f64]) -> Result<Vec<f64>, DgpError> {
        self.check_params(params)?;
        let label = betabinomial_pmf(label_count(peptide)?, params[1], params[2]).ok_or_else(
            || DgpError::InvalidParameters {
                model: self.name(),
                params: params.to_vec(),
            },
        )?;
        Ok(enriched_envelope(peptide, &label, Some(params[0])))
    }

    fn summarize(&self, params: &[f64]) -> ModelSummary {
        match params {
            [_, a, b] => beta_summary(*a, *b),
            _ => ModelSummary {
                mean: f64::NAN,
                variance: None,
            },
        }
    }

    fn propose_step<R: Rng>(&self, params: &[f64], stepsize: f64, rng: &mut R) -> Vec<f64> {
        beta_binomial_step(params, stepsize, self.bounds(), rng)
    }
}

/// The closed set of data generating processes, addressable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataGeneratingProcesses {
    Binom,
    BinomQuiescentMix,
    Betabinom,
    BetabinomQuiescentMix,
}

macro_rules! dispatch {
    ($self:ident, $model:ident => $body:expr) => {
        match $self {
            DataGeneratingProcesses::Binom => {
                let $model = Binom;
                $body
            }
            DataGeneratingProcesses::BinomQuiescentMix => {
                let $model = BinomQuiescentMix;
                $body
            }
            DataGeneratingProcesses::Betabinom => {
                let $model = Betabinom;
                $body
            }
            DataGeneratingProcesses::BetabinomQuiescentMix => {
                let $model = BetabinomQuiescentMix;
                $body
            }
        }
    };
}

impl DataGeneratingProcesses {
    pub const fn all() -> [Self; 4] {
        [
            Self::Binom,
            Self::BinomQuiescentMix,
            Self::Betabinom,
            Self::BetabinomQuiescentMix,
        ]
    }
}

impl DataGeneratingProcess for DataGeneratingProcesses {
    fn name(&self) -> &'static str {
        dispatch!(self, m => m.name())
    }

    fn bounds(&self) -> &'static [(f64, f64)] {
        dispatch!(self, m => m.bounds())
    }

    fn initial_guess(&self, peptide: &Peptide) -> Vec<f64> {
        dispatch!(self, m => m.initial_guess(peptide))
    }

    fn expected(&self, peptide: &Peptide, params: &[f64]) -> Result<Vec<f64>, DgpError> {
        dispatch!(self, m => m.expected(peptide, params))
    }

    fn summarize(&self, params: &[f64]) -> ModelSummary {
        dispatch!(self, m => m.summarize(params))
    }

    fn propose_step<R: Rng>(&self, params: &[f64], stepsize: f64, rng: &mut R) -> Vec<f64> {
        dispatch!(self, m => m.propose_step(params, stepsize, rng))
    }
}

impl Display for DataGeneratingProcesses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataGeneratingProcesses {
    type Err = DgpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| DgpError::UnknownModel(s.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_data::synthetic_peptide;

    fn assert_params_close(observed: &[f64], expected: &[f64]) {
        assert_eq!(observed.len(), expected.len());
        for (o, e) in observed.iter().zip(expected) {
            assert!((o - e).abs() <= 1e-3, "{observed:?} != {expected:?}");
        }
    }

    fn quick() -> BasinHoppingParams {
        BasinHoppingParams {
            niter: 20,
            interval: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_pmf_excludes_n() {
        let p = binomial_pmf(4, 0.5).unwrap();
        assert_eq!(p.len(), 4);
        let expected = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0];
        assert_params_close(&p, &expected);

        // Beta(1, 1) makes every count equally likely
        let p = betabinomial_pmf(4, 1.0, 1.0).unwrap();
        assert_eq!(p.len(), 4);
        for v in p {
            assert!((v - 0.2).abs() < 1e-12);
        }

        assert!(binomial_pmf(4, 1.5).is_none());
        assert!(betabinomial_pmf(4, 0.0, 1.0).is_none());
    }

    #[test]
    fn test_winsorized_loss() {
        let expected = [0.0; 10];
        let observed = vec![(1..=10).map(|i| i as f64).collect::<Vec<_>>()];
        // The 90th percentile of 1..=10 is 9.1, clamping 10 to 9.1
        let loss = winsorized_loss(&expected, &observed);
        assert!((loss - (45.0 + 9.1) / 10.0).abs() < 1e-12);

        // Missing cells are skipped, the 90th percentile of [1, 2] is 1.9
        let observed = vec![vec![f64::NAN, 1.0], vec![2.0, f64::NAN]];
        let loss = winsorized_loss(&[0.0, 0.0], &observed);
        assert!((loss - 1.45).abs() < 1e-12);
    }

    #[test]
    fn test_expected_normalized() {
        let peptide = synthetic_peptide("PEPTIDEK", DataGeneratingProcesses::Binom, &[0.3], 2);
        for dgp in DataGeneratingProcesses::all() {
            let guess = dgp.initial_guess(&peptide);
            let exp = dgp.expected(&peptide, &guess).unwrap();
            assert_eq!(exp.len(), peptide.npeaks);
            assert!((nansum(&exp) - 1.0).abs() < 1e-12, "{dgp}");
        }
    }

    #[test]
    fn test_parameter_count() {
        let peptide = synthetic_peptide("PEPTIDEK", DataGeneratingProcesses::Binom, &[0.3], 1);
        let err = Betabinom.expected(&peptide, &[4.0]).unwrap_err();
        assert_eq!(
            err,
            DgpError::ParameterCount {
                model: "Betabinom",
                expected: 2,
                received: 1
            }
        );
    }

    #[test]
    fn test_registry() {
        for dgp in DataGeneratingProcesses::all() {
            let name = dgp.to_string();
            assert_eq!(name.parse::<DataGeneratingProcesses>().unwrap(), dgp);
        }
        assert_eq!(
            "BetabinomQuiescentMix".parse::<DataGeneratingProcesses>(),
            Ok(DataGeneratingProcesses::BetabinomQuiescentMix)
        );
        assert!(matches!(
            "Poisson".parse::<DataGeneratingProcesses>(),
            Err(DgpError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_beta_binomial_step_clamp() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let x = Betabinom.propose_step(&[1.0, 99.0], 0.5, &mut rng);
            assert!(x[0] >= x[1] / MIN_BETA_RATIO - 1e-12, "{x:?}");
            assert!(x[0] <= 100.0 && x[1] <= 100.0 && x[1] >= 1.0);

            let x = BetabinomQuiescentMix.propose_step(&[0.5, 1.0, 99.0], 0.5, &mut rng);
            assert!(x[1] >= x[2] / MIN_BETA_RATIO - 1e-12, "{x:?}");
            assert!((0.0..=1.0).contains(&x[0]));
        }
    }

    #[test]
    fn test_summaries() {
        let s = Betabinom.summarize(&[4.0, 3.0]);
        assert!((s.mean - 4.0 / 7.0).abs() < 1e-12);
        assert!((s.variance.unwrap() - 12.0 / (49.0 * 8.0)).abs() < 1e-12);
        let s = BinomQuiescentMix.summarize(&[0.2, 0.7]);
        assert_eq!(s.mean, 0.7);
        assert_eq!(s.variance, None);
    }

    #[test]
    fn test_empty_observations() {
        let mut peptide = synthetic_peptide("PEPTIDEK", DataGeneratingProcesses::Binom, &[0.3], 1);
        for row in peptide.obs.iter_mut() {
            row.iter_mut().for_each(|v| *v = f64::NAN);
        }
        assert!(matches!(
            Binom.fit(&peptide, &quick(), 1),
            Err(DgpError::EmptyObservations(_))
        ));
    }

    #[test]
    fn test_recover_binom() {
        let peptide = synthetic_peptide("PEPTIDEK", DataGeneratingProcesses::Binom, &[0.3], 3);
        let fit = Binom.fit(&peptide, &quick(), 1).unwrap();
        assert!(fit.loss < 0.01);
        assert_params_close(&fit.params, &[0.3]);
        assert_eq!(fit.dgp_name, "Binom");
        assert_eq!(fit.fitted_dist.len(), peptide.npeaks);
    }

    #[test]
    fn test_recover_binom_quiescent_mix() {
        let truth = [0.5, 0.5];
        let peptide =
            synthetic_peptide("PEPTIDEK", DataGeneratingProcesses::BinomQuiescentMix, &truth, 3);
        let fit = BinomQuiescentMix.fit(&peptide, &quick(), 1).unwrap();
        assert!(fit.loss < 0.01);
        assert_params_close(&fit.params, &truth);
    }

    #[test]
    fn test_recover_betabinom() {
        let truth = [4.0, 3.0];
        let peptide = synthetic_peptide("PEPTIDEK", DataGeneratingProcesses::Betabinom, &truth, 3);
        let fit = Betabinom.fit(&peptide, &quick(), 1).unwrap();
        assert!(fit.loss < 0.01);
        assert_params_close(&fit.params, &truth);
        assert!((fit.mean() - 4.0 / 7.0).abs() < 1e-3);
    }

    #[test]
    fn test_recover_betabinom_quiescent_mix() {
        let truth = [0.5, 4.0, 3.0];
        let peptide =
            synthetic_peptide("PEPTIDEK", DataGeneratingProcesses::BetabinomQuiescentMix, &truth, 3);
        let fit = BetabinomQuiescentMix.fit(&peptide, &quick(), 1).unwrap();
        assert!(fit.loss < 0.01);
        assert_params_close(&fit.params, &truth);
    }

    #[test_log::test]
    fn test_recover_away_from_initial_guess() {
        let params = BasinHoppingParams::default();

        let truth = [10.0, 20.0];
        let peptide = synthetic_peptide("PEPTIDEK", DataGeneratingProcesses::Betabinom, &truth, 3);
        assert_ne!(Betabinom.initial_guess(&peptide), truth);
        let fit = Betabinom.fit(&peptide, &params, 1).unwrap();
        assert!(fit.loss < 0.01);
        assert_params_close(&fit.params, &truth);
        assert!((fit.mean() - 1.0 / 3.0).abs() < 1e-3);

        let truth = [0.3, 8.0, 2.0];
        let peptide =
            synthetic_peptide("PEPTIDEK", DataGeneratingProcesses::BetabinomQuiescentMix, &truth, 3);
        let fit = BetabinomQuiescentMix.fit(&peptide, &params, 1).unwrap();
        assert!(fit.loss < 0.01);
        assert_params_close(&fit.params, &truth);
    }
}
