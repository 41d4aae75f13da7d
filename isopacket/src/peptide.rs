/*! Aggregation of PSMs into peptides with a cleaned observation matrix */
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Display};

use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, info};

use crate::fit_result::FitResult;
use crate::formula::ChemicalFormula;
use crate::psm::{Metadata, MetadataValue, Psm};
use crate::stats::{interp, nansum};

/// The largest amount a normalized point may exceed the interpolation of its alternating
/// neighbors before it is treated as an artifact
pub const CLEANING_THRESHOLD: f64 = 0.05;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PeptideError {
    #[error("A peptide must have at least one PSM")]
    NoPsms,
}

/// Zero pad or truncate `values` to `npeaks`
pub fn reshape(values: &[f64], npeaks: usize) -> Vec<f64> {
    let mut out: Vec<f64> = values.iter().take(npeaks).copied().collect();
    out.resize(npeaks, 0.0);
    out
}

/// Remove isolated points and points that stand out from the trend of a normalized
/// intensity vector, then renormalize.
///
/// 1. Left to right, a point with more than one missing value among itself and its two
///    neighbors becomes missing. Earlier removals are visible to later points.
/// 2. Missing values are zero filled.
/// 3. Odd positions are interpolated from the even positions and vice versa.
/// 4. A point more than [`CLEANING_THRESHOLD`] above its interpolation becomes `NaN`,
///    unless it was zero filled. The first point is never removed.
/// 5. The vector is divided by its `NaN`-ignoring sum.
pub fn clean(values: &[f64]) -> Vec<f64> {
    let mut vals = values.to_vec();
    let n = vals.len();
    for i in 1..n.saturating_sub(1) {
        let missing = vals[i - 1..=i + 1].iter().filter(|v| v.is_nan()).count();
        if missing > 1 {
            vals[i] = f64::NAN;
        }
    }

    let filled: Vec<bool> = vals.iter().map(|v| v.is_nan()).collect();
    for (v, was_missing) in vals.iter_mut().zip(filled.iter()) {
        if *was_missing {
            *v = 0.0;
        }
    }

    if n >= 2 {
        let (even_x, even_y): (Vec<f64>, Vec<f64>) =
            (0..n).step_by(2).map(|i| (i as f64, vals[i])).unzip();
        let (odd_x, odd_y): (Vec<f64>, Vec<f64>) =
            (1..n).step_by(2).map(|i| (i as f64, vals[i])).unzip();

        let outliers: Vec<usize> = (1..n)
            .filter(|i| !filled[*i])
            .filter(|i| {
                let trend = if i % 2 == 0 {
                    interp(*i as f64, &odd_x, &odd_y)
                } else {
                    interp(*i as f64, &even_x, &even_y)
                };
                vals[*i] - trend > CLEANING_THRESHOLD
            })
            .collect();
        for i in outliers {
            vals[i] = f64::NAN;
        }
    }

    let total = nansum(&vals);
    vals.iter_mut().for_each(|v| *v /= total);
    vals
}

/// A value in a flattened peptide report
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(untagged)
)]
pub enum ReportValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Missing,
}

impl Display for ReportValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
            Self::Missing => Ok(()),
        }
    }
}

impl From<&MetadataValue> for ReportValue {
    fn from(value: &MetadataValue) -> Self {
        match value {
            MetadataValue::Number(x) => Self::Float(*x),
            MetadataValue::Text(s) => Self::Text(s.clone()),
        }
    }
}

impl From<f64> for ReportValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<usize> for ReportValue {
    fn from(value: usize) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<&str> for ReportValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl<T: Into<ReportValue>> From<Option<T>> for ReportValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Missing)
    }
}

/// An ordered record where setting an existing key replaces its value in place
#[derive(Debug, Default, Clone, PartialEq)]
struct ReportBuilder {
    fields: Vec<(String, ReportValue)>,
}

impl ReportBuilder {
    fn set(&mut self, key: impl Into<String>, value: impl Into<ReportValue>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    fn set_fit(&mut self, prefix: &str, fit: &FitResult) {
        self.set(format!("{prefix}_fit"), fit.loss);
        self.set(format!("{prefix}_mean"), fit.mean());
        self.set(format!("{prefix}_variance"), fit.variance());
        self.set(format!("{prefix}_nfev"), fit.nfev);
        self.set(format!("{prefix}_nit"), fit.nit);
        for (i, param) in fit.params.iter().enumerate() {
            self.set(format!("{prefix}_param{i}"), *param);
        }
    }
}

/// The PSMs of one sequence in one file, with their observations normalized, cleaned and
/// stacked into a PSM by peak matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Peptide {
    pub psms: Vec<Psm>,
    pub sequence: String,
    pub raw_sequence: String,
    pub file: String,
    pub proteins: String,
    pub label: String,
    pub label_element: String,
    pub formula: ChemicalFormula,
    pub mz: Vec<f64>,
    pub background: Vec<f64>,
    pub design_metadata: Metadata,
    pub psm_metadata: Vec<Metadata>,
    /// The longest observation vector among the PSMs
    pub npeaks: usize,
    /// One cleaned, normalized row per PSM, each `npeaks` long
    pub obs: Vec<Vec<f64>>,
    pub unenriched: Vec<f64>,
    pub mz_err: Vec<Vec<f64>>,
    pub fit_results: Vec<FitResult>,
    /// The index of the canonical fit in `fit_results`
    pub canonical_fit: Option<usize>,
}

impl Peptide {
    pub fn new(psms: Vec<Psm>) -> Result<Self, PeptideError> {
        let first = psms.first().ok_or(PeptideError::NoPsms)?;
        let npeaks = psms.iter().map(|p| p.intensity.len()).max().unwrap_or_default();

        let obs = psms
            .iter()
            .map(|p| {
                let total = nansum(&p.intensity);
                let mut normed: Vec<f64> = p.intensity.iter().map(|v| v / total).collect();
                normed.resize(npeaks, f64::NAN);
                clean(&normed)
            })
            .collect();
        let mz_err = psms.iter().map(|p| reshape(&p.mz_err, npeaks)).collect();

        Ok(Self {
            sequence: first.sequence.clone(),
            raw_sequence: first.raw_sequence.clone(),
            file: first.file.clone(),
            proteins: first.proteins.clone(),
            label: first.label.clone(),
            label_element: first.label_element.clone(),
            formula: first.formula.clone(),
            mz: first.mz.clone(),
            background: first.background.clone(),
            design_metadata: first.design_metadata.clone(),
            psm_metadata: psms.iter().map(|p| p.psm_metadata.clone()).collect(),
            unenriched: reshape(&first.unenriched, npeaks),
            npeaks,
            obs,
            mz_err,
            psms,
            fit_results: Vec::new(),
            canonical_fit: None,
        })
    }

    pub fn reshape(&self, values: &[f64]) -> Vec<f64> {
        reshape(values, self.npeaks)
    }

    /// The number of atoms of the label element in the formula
    pub fn label_count(&self) -> u32 {
        self.formula.get(&self.label_element)
    }

    /// Whether any cell of the observation matrix holds a value
    pub fn has_observations(&self) -> bool {
        self.obs.iter().flatten().any(|v| !v.is_nan())
    }

    pub fn canonical_fit(&self) -> Option<&FitResult> {
        self.canonical_fit.and_then(|i| self.fit_results.get(i))
    }

    /// Flatten the peptide, its PSM metadata and its fits into an ordered record
    pub fn report(&self) -> Vec<(String, ReportValue)> {
        let mut record = ReportBuilder::default();
        record.set("peptide", self.raw_sequence.as_str());
        record.set("proteins", self.proteins.as_str());
        record.set("sequence", self.sequence.as_str());
        record.set("file", self.file.as_str());
        record.set("label", self.label.as_str());
        record.set("label_element", self.label_element.as_str());
        record.set("npeaks", self.npeaks);
        for (key, value) in self.design_metadata.iter() {
            record.set(key.as_str(), value);
        }
        record.set("PSM_count", self.psm_metadata.len());

        let columns: BTreeSet<&String> = self.psm_metadata.iter().flat_map(|m| m.keys()).collect();
        for column in columns {
            let values: Vec<&MetadataValue> = self
                .psm_metadata
                .iter()
                .filter_map(|m| m.get(column))
                .collect();
            let numbers: Option<Vec<f64>> = values.iter().map(|v| v.as_number()).collect();
            match numbers {
                Some(numbers) => {
                    let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                    record.set(format!("PSMs_mean_{column}"), mean);
                }
                None => {
                    let joined = values
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .join(";");
                    record.set(format!("PSMs_unique_{column}"), joined.as_str());
                }
            }
        }

        if let Some(fit) = self.canonical_fit() {
            record.set("canonical_DGP", fit.dgp_name.as_str());
            record.set_fit("canonical", fit);
        }
        for fit in self.fit_results.iter() {
            record.set_fit(&fit.dgp_name, fit);
        }
        record.fields
    }
}

/// Group PSMs into peptides by their fingerprint, in first-seen order.
///
/// `excluded` PSMs only join peptides that already have a usable PSM, they never found
/// a peptide of their own.
pub fn initialize_peptides(
    usable: Vec<Psm>,
    excluded: Vec<Psm>,
) -> Result<Vec<Peptide>, PeptideError> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<Psm>> = Vec::new();
    for psm in usable {
        let key = (psm.sequence.clone(), psm.file.clone());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(psm);
    }

    let mut n_joined = 0usize;
    for psm in excluded {
        let (sequence, file) = psm.fingerprint();
        if let Some(slot) = index.get(&(sequence.to_string(), file.to_string())) {
            groups[*slot].push(psm);
            n_joined += 1;
        }
    }
    debug!("{n_joined} excluded PSMs joined an existing peptide");

    let peptides = groups
        .into_iter()
        .map(Peptide::new)
        .collect::<Result<Vec<_>, _>>()?;
    info!("{} peptides have been identified", peptides.len());
    Ok(peptides)
}

/// Count how many peptides were built for each label
pub fn count_by_label(peptides: &[Peptide]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for peptide in peptides {
        *counts.entry(peptide.label.clone()).or_default() += 1;
    }
    counts
}
