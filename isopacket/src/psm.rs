/*! Peptide-spectrum matches carrying the theoretical and observed isotopic signal of one identification */
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::path::Path;

use mzpeaks::{CentroidPeak, MZPeakSetType};
use tracing::trace;

use crate::align::align_scans;
use crate::formula::{clean_seq, ChemicalFormula, FormulaError, ResidueTable};
use crate::isotopic_model::{calc_mz, isotope_packet, label_element, IsotopicEnvelopeGenerator};

/// A single metadata value, which is either numeric or free text
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(untagged)
)]
pub enum MetadataValue {
    Number(f64),
    Text(String),
}

impl MetadataValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(x) => Some(*x),
            Self::Text(_) => None,
        }
    }
}

impl Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// One identification row from a search engine's output
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Identification {
    /// The peptide sequence as reported, possibly with flanking residues
    pub sequence: String,
    pub file: String,
    pub scan: usize,
    pub charge: i32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub proteins: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: Metadata,
}

/// The file name of `path` without its directory or extension
pub fn base_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Check whether an intensity vector holds enough signal to be fit: more than 5 finite
/// values, at least 5 of which are consecutive.
pub fn is_usable(intensity: &[f64]) -> bool {
    let finite = intensity.iter().filter(|v| v.is_finite()).count();
    if finite <= 5 {
        return false;
    }
    let mut run = 0;
    for v in intensity {
        if v.is_finite() {
            run += 1;
            if run >= 5 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// A peptide-spectrum match under a particular label.
///
/// The theoretical fields are derived on construction. `intensity` and `mz_err` are empty
/// until [`Psm::parse_scans`] aligns observed peaks to the `mz` ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct Psm {
    pub raw_sequence: String,
    pub sequence: String,
    pub file: String,
    pub base_name: String,
    pub scan: usize,
    pub charge: i32,
    pub proteins: String,
    pub psm_metadata: Metadata,
    pub design_metadata: Metadata,
    pub label: String,
    pub label_element: String,
    pub is_labeled: bool,
    pub formula: ChemicalFormula,
    /// The theoretical m/z ladder
    pub mz: Vec<f64>,
    /// The isotopic envelope of the formula without the label element
    pub background: Vec<f64>,
    /// The isotopic envelope of the formula, zero padded to the ladder length
    pub unenriched: Vec<f64>,
    pub intensity: Vec<f64>,
    pub mz_err: Vec<f64>,
}

impl Psm {
    /// Build a PSM for `identification` under `label`, deriving its formula, m/z ladder and
    /// theoretical envelopes.
    pub fn new<G: IsotopicEnvelopeGenerator + ?Sized>(
        identification: &Identification,
        label: &str,
        is_labeled: bool,
        design_metadata: &Metadata,
        residues: &ResidueTable,
        generator: &mut G,
    ) -> Result<Self, FormulaError> {
        let sequence = clean_seq(&identification.sequence)?;
        let element = label_element(label)?.to_string();
        let formula = residues.calc_formula(&sequence)?;
        let charge = identification.charge;

        let mz = calc_mz(&formula, charge, label, generator)?;
        let background = isotope_packet(&formula.omit(&element)?, charge, generator)?;
        let mut unenriched = isotope_packet(&formula, charge, generator)?;
        unenriched.resize(mz.len(), 0.0);

        trace!(
            "Built PSM {} for {}/{} with {} ladder points",
            sequence,
            identification.file,
            identification.scan,
            mz.len()
        );

        Ok(Self {
            raw_sequence: identification.sequence.clone(),
            sequence,
            file: identification.file.clone(),
            base_name: base_name(&identification.file),
            scan: identification.scan,
            charge,
            proteins: identification.proteins.clone(),
            psm_metadata: identification.metadata.clone(),
            design_metadata: design_metadata.clone(),
            label: label.to_string(),
            label_element: element,
            is_labeled,
            formula,
            mz,
            background,
            unenriched,
            intensity: Vec::new(),
            mz_err: Vec::new(),
        })
    }

    /// Build the PSMs for an identification from a file whose design assigns it `label`.
    ///
    /// An empty `label` marks a control file. A control identification is duplicated once
    /// per label in `labels`, the set of labels used anywhere in the experiment, with
    /// `is_labeled` unset.
    pub fn from_design<G: IsotopicEnvelopeGenerator + ?Sized>(
        identification: &Identification,
        label: &str,
        design_metadata: &Metadata,
        labels: &BTreeSet<String>,
        residues: &ResidueTable,
        generator: &mut G,
    ) -> Result<Vec<Self>, FormulaError> {
        if label.is_empty() {
            labels
                .iter()
                .map(|label| {
                    Self::new(identification, label, false, design_metadata, residues, generator)
                })
                .collect()
        } else {
            Ok(vec![Self::new(
                identification,
                label,
                true,
                design_metadata,
                residues,
                generator,
            )?])
        }
    }

    /// Align the peaks of nearby scans to this PSM's m/z ladder, storing the averaged
    /// intensities and m/z errors.
    pub fn parse_scans<'a, I>(&mut self, scans: I)
    where
        I: IntoIterator<Item = &'a MZPeakSetType<CentroidPeak>>,
    {
        let aligned = align_scans(scans, &self.mz);
        self.intensity = aligned.intensity;
        self.mz_err = aligned.mz_err;
    }

    pub fn is_usable(&self) -> bool {
        is_usable(&self.intensity)
    }

    /// The key PSMs are grouped into peptides by
    pub fn fingerprint(&self) -> (&str, &str) {
        (&self.sequence, &self.file)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_data::{identification, make_psm, NominalEnvelopeGenerator};
    use mzpeaks::CentroidPeak;

    const NAN: f64 = f64::NAN;

    #[test]
    fn test_usable() {
        let consecutive = [NAN, 1.0, 1.0, 1.0, 1.0, 1.0, NAN, 1.0, NAN];
        assert!(is_usable(&consecutive));

        let scattered = [1.0, NAN, 1.0, NAN, 1.0, NAN, 1.0, NAN, 1.0];
        assert!(!is_usable(&scattered));

        let only_five = [NAN, 1.0, 1.0, 1.0, 1.0, 1.0, NAN];
        assert!(!is_usable(&only_five));

        let short_runs = [1.0, 1.0, 1.0, 1.0, NAN, 1.0, 1.0, 1.0, 1.0];
        assert!(!is_usable(&short_runs));
        assert!(!is_usable(&[]));
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/data/runs/sample_01.mzML"), "sample_01");
        assert_eq!(base_name("sample_02"), "sample_02");
    }

    #[test]
    fn test_build_psm() -> Result<(), FormulaError> {
        let psm = make_psm("K.PEPTIDEK.A", "/data/run1.mzML", 10, "N[15]");
        assert_eq!(psm.sequence, "PEPTIDEK");
        assert_eq!(psm.base_name, "run1");
        assert_eq!(psm.label_element, "N");
        assert!(psm.is_labeled);
        assert_eq!(psm.background.len(), 6);
        assert_eq!(psm.unenriched.len(), psm.mz.len());
        assert!(psm.unenriched[6..].iter().all(|v| *v == 0.0));
        assert!(psm.intensity.is_empty());
        assert_eq!(psm.fingerprint(), ("PEPTIDEK", "/data/run1.mzML"));
        assert_eq!(psm.formula.get("N"), 9);
        Ok(())
    }

    #[test]
    fn test_control_duplication() -> Result<(), FormulaError> {
        let mut generator = NominalEnvelopeGenerator::default();
        let labels: BTreeSet<String> = ["C[13]", "N[15]"].iter().map(|s| s.to_string()).collect();
        let psms = Psm::from_design(
            &identification("PEPTIDEK", "control.mzML", 3),
            "",
            &Metadata::new(),
            &labels,
            &ResidueTable::standard(),
            &mut generator,
        )?;
        assert_eq!(psms.len(), 2);
        assert!(psms.iter().all(|p| !p.is_labeled));
        assert_eq!(psms[0].label, "C[13]");
        assert_eq!(psms[1].label_element, "N");

        let psms = Psm::from_design(
            &identification("PEPTIDEK", "heavy.mzML", 3),
            "C[13]",
            &Metadata::new(),
            &labels,
            &ResidueTable::standard(),
            &mut generator,
        )?;
        assert_eq!(psms.len(), 1);
        assert!(psms[0].is_labeled);
        Ok(())
    }

    #[test]
    fn test_unknown_residue() {
        let mut generator = NominalEnvelopeGenerator::default();
        let result = Psm::new(
            &identification("PEPTIDEX", "run.mzML", 1),
            "C[13]",
            true,
            &Metadata::new(),
            &ResidueTable::standard(),
            &mut generator,
        );
        assert!(matches!(result, Err(FormulaError::UnknownResidue(_))));
    }

    #[test]
    fn test_parse_scans() {
        let mut psm = make_psm("PEPTIDEK", "run1.mzML", 10, "C[13]");
        let peaks: Vec<_> = psm.mz[..7]
            .iter()
            .enumerate()
            .map(|(i, mz)| CentroidPeak::new(*mz + 1e-4, 100.0 / (i + 1) as f32, i as u32))
            .collect();
        let scans = vec![MZPeakSetType::new(peaks)];
        psm.parse_scans(&scans);
        assert_eq!(psm.intensity.len(), psm.mz.len());
        assert_eq!(psm.intensity[0], 100.0);
        assert!((psm.mz_err[0] + 1e-4).abs() < 1e-9);
        assert!(psm.intensity[7..].iter().all(|v| v.is_nan()));
        assert!(psm.is_usable());
    }
}
