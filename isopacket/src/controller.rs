/*! Fit every configured data generating process to every peptide in parallel, then select
the best model per peptide and prune peptides which are poorly fit or not enriched.

Fitting is fail-fast: the first peptide whose fit raises an error or panics cancels every
task which has not yet started, and the whole pass fails.
*/
use std::any::Any;
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::dgp::{DataGeneratingProcess, DataGeneratingProcesses, DgpError};
use crate::fit_result::FitResult;
use crate::optimize::BasinHoppingParams;
use crate::peptide::Peptide;

/// How far the canonical mean incorporation must exceed the natural abundance of the
/// label element's heavy isotope for a peptide to count as enriched
pub const ENRICHMENT_MARGIN: f64 = 0.01;

#[derive(Debug, Error)]
pub enum WorkerFaultSource {
    #[error(transparent)]
    Model(#[from] DgpError),
    #[error("worker panicked: {0}")]
    Panic(String),
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("Unknown data generating process: {0}")]
    UnknownModel(String),
    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(
        #[source]
        #[from]
        rayon::ThreadPoolBuildError,
    ),
    #[error("Fitting peptide {index} failed: {source}")]
    WorkerFault {
        index: usize,
        #[source]
        source: WorkerFaultSource,
    },
    #[error("No natural abundance is configured for label element {0}")]
    MissingNaturalAbundance(String),
    #[error("Invalid fit configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct FitConfig {
    /// The names of the models to fit, in the order they are tried
    pub data_generating_processes: Vec<String>,
    /// The number of worker threads. Zero or less uses every core.
    pub threads: i32,
    /// Peptides whose best fit has a loss above this are discarded
    pub max_peptide_err: f64,
    /// The natural abundance of the heavy isotope of each label element
    pub natural_abundance: BTreeMap<String, f64>,
    /// The base seed for the step proposers' random number generators
    pub seed: u64,
    pub basin_hopping: BasinHoppingParams,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            data_generating_processes: DataGeneratingProcesses::all()
                .iter()
                .map(|m| m.to_string())
                .collect(),
            threads: 0,
            max_peptide_err: 0.05,
            natural_abundance: [("H", 0.000115), ("C", 0.0107), ("N", 0.00364), ("O", 0.00205)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            seed: 1,
            basin_hopping: BasinHoppingParams::default(),
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<(), FitError> {
        if self.data_generating_processes.is_empty() {
            return Err(FitError::InvalidConfig(
                "at least one data generating process is required".into(),
            ));
        }
        if !(self.max_peptide_err >= 0.0) {
            return Err(FitError::InvalidConfig(format!(
                "max_peptide_err must be non-negative, got {}",
                self.max_peptide_err
            )));
        }
        if let Some((element, value)) = self
            .natural_abundance
            .iter()
            .find(|(_, v)| !(0.0..=1.0).contains(*v))
        {
            return Err(FitError::InvalidConfig(format!(
                "natural abundance of {element} must be between 0 and 1, got {value}"
            )));
        }
        let bh = &self.basin_hopping;
        if !(bh.temperature > 0.0) {
            return Err(FitError::InvalidConfig(format!(
                "basin hopping temperature must be positive, got {}",
                bh.temperature
            )));
        }
        if !(bh.stepwise_factor > 0.0 && bh.stepwise_factor <= 1.0) {
            return Err(FitError::InvalidConfig(format!(
                "basin hopping stepwise factor must be in (0, 1], got {}",
                bh.stepwise_factor
            )));
        }
        Ok(())
    }
}

/// Counts of what happened to peptides over a fitting pass
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct FitProgress {
    pub peptides: usize,
    pub fits: usize,
    pub pruned_high_error: usize,
    pub pruned_unenriched: usize,
    pub retained: usize,
}

impl Add for FitProgress {
    type Output = FitProgress;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for FitProgress {
    fn add_assign(&mut self, rhs: Self) {
        self.peptides += rhs.peptides;
        self.fits += rhs.fits;
        self.pruned_high_error += rhs.pruned_high_error;
        self.pruned_unenriched += rhs.pruned_unenriched;
        self.retained += rhs.retained;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The index of the fit with the lowest loss. The first of several equal fits wins and a
/// NaN loss ranks as infinitely bad.
pub fn select_canonical(fits: &[FitResult]) -> Option<usize> {
    let rank = |fit: &FitResult| {
        if fit.loss.is_nan() {
            f64::INFINITY
        } else {
            fit.loss
        }
    };
    let mut best: Option<usize> = None;
    for (i, fit) in fits.iter().enumerate() {
        match best {
            Some(j) if !(rank(fit) < rank(&fits[j])) => {}
            _ => best = Some(i),
        }
    }
    best
}

#[derive(Debug, Clone)]
pub struct FitController {
    config: FitConfig,
    dgps: Vec<DataGeneratingProcesses>,
}

impl FitController {
    pub fn new(config: FitConfig) -> Result<Self, FitError> {
        config.validate()?;
        let dgps = config
            .data_generating_processes
            .iter()
            .map(|name| {
                name.parse::<DataGeneratingProcesses>()
                    .map_err(|_| FitError::UnknownModel(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { config, dgps })
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn dgps(&self) -> &[DataGeneratingProcesses] {
        &self.dgps
    }

    pub fn create_threadpool(&self) -> Result<rayon::ThreadPool, FitError> {
        let num_threads = if self.config.threads > 0 {
            self.config.threads as usize
        } else {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };
        debug!("Using {} cores", num_threads);
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?)
    }

    /// Fit every configured model to `peptide` in order.
    ///
    /// Returns `None` without doing any work if `cancel` is already set. Otherwise `started`
    /// is incremented before fitting, and `cancel` is set if any model fails or panics.
    pub fn fit_all_dgps(
        &self,
        peptide: &Peptide,
        index: usize,
        cancel: &AtomicBool,
        started: &AtomicUsize,
    ) -> Option<Result<Vec<FitResult>, FitError>> {
        if cancel.load(Ordering::SeqCst) {
            return None;
        }
        started.fetch_add(1, Ordering::SeqCst);
        let seed = self.config.seed.wrapping_add(index as u64);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.dgps
                .iter()
                .map(|dgp| dgp.fit(peptide, &self.config.basin_hopping, seed))
                .collect::<Result<Vec<_>, _>>()
        }));
        let source = match outcome {
            Ok(Ok(fits)) => return Some(Ok(fits)),
            Ok(Err(err)) => WorkerFaultSource::Model(err),
            Err(payload) => WorkerFaultSource::Panic(panic_message(payload)),
        };
        cancel.store(true, Ordering::SeqCst);
        error!(
            "Fitting peptide {index} ({}) failed, cancelling remaining work: {source}",
            peptide.sequence
        );
        Some(Err(FitError::WorkerFault { index, source }))
    }

    /// Fit every peptide on the current thread pool, returning one list of fits per peptide
    /// in the same order, or the fault of the lowest indexed failed peptide.
    pub fn fit_pass(
        &self,
        peptides: &[Peptide],
        cancel: &AtomicBool,
        started: &AtomicUsize,
    ) -> Result<Vec<Vec<FitResult>>, FitError> {
        let results: Vec<_> = (0..peptides.len())
            .into_par_iter()
            .map(|i| self.fit_all_dgps(&peptides[i], i, cancel, started))
            .collect();
        // Tasks are only skipped after a fault, and the first fault in index order wins
        results.into_iter().flatten().collect()
    }

    /// Fit, select and prune `peptides`. Fails without partial results if any peptide's
    /// fit fails.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn fit_peptides(
        &self,
        mut peptides: Vec<Peptide>,
    ) -> Result<(Vec<Peptide>, FitProgress), FitError> {
        let cancel = AtomicBool::new(false);
        let started = AtomicUsize::new(0);
        info!(
            "Fitting {} models to {} peptides",
            self.dgps.len(),
            peptides.len()
        );
        let pool = self.create_threadpool()?;
        let fits = pool.install(|| self.fit_pass(&peptides, &cancel, &started))?;

        let mut progress = FitProgress {
            peptides: peptides.len(),
            ..Default::default()
        };
        for (peptide, fit_results) in peptides.iter_mut().zip(fits) {
            progress.fits += fit_results.len();
            peptide.fit_results = fit_results;
            self.model_selection(peptide);
        }
        let (peptides, pruned) = self.prune(peptides)?;
        progress += pruned;
        Ok((peptides, progress))
    }

    pub fn model_selection(&self, peptide: &mut Peptide) {
        peptide.canonical_fit = select_canonical(&peptide.fit_results);
    }

    /// Drop peptides whose canonical fit is worse than `max_peptide_err` or whose
    /// canonical mean incorporation is within [`ENRICHMENT_MARGIN`] of natural abundance.
    pub fn prune(&self, peptides: Vec<Peptide>) -> Result<(Vec<Peptide>, FitProgress), FitError> {
        let mut progress = FitProgress::default();
        let mut kept = Vec::with_capacity(peptides.len());
        for peptide in peptides {
            let Some(fit) = peptide.canonical_fit() else {
                progress.pruned_high_error += 1;
                continue;
            };
            if !(fit.loss <= self.config.max_peptide_err) {
                progress.pruned_high_error += 1;
                continue;
            }
            let abundance = *self
                .config
                .natural_abundance
                .get(&peptide.label_element)
                .ok_or_else(|| FitError::MissingNaturalAbundance(peptide.label_element.clone()))?;
            if fit.mean() <= abundance + ENRICHMENT_MARGIN {
                progress.pruned_unenriched += 1;
                continue;
            }
            kept.push(peptide);
        }
        progress.retained = kept.len();
        info!(
            "Removed {} peptides with a fit error above {} and {} peptides without enrichment, {} remain",
            progress.pruned_high_error,
            self.config.max_peptide_err,
            progress.pruned_unenriched,
            progress.retained
        );
        Ok((kept, progress))
    }
}
