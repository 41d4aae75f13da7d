/*! Isotopic envelopes for elemental formulae and the theoretical m/z ladder a labeled peptide spans */
use std::collections::btree_map::{self, BTreeMap, Entry as BEntry};
use std::sync::LazyLock;

#[doc(hidden)]
pub use chemical_elements::isotopic_pattern::{
    BafflingRecursiveIsotopicPatternGenerator, TheoreticalIsotopicPattern,
};
use chemical_elements::PROTON as _PROTON;

use regex::Regex;
use tracing::trace;

use crate::formula::{ChemicalFormula, FormulaError};

/// The mass of H+, a hydrogen atom minus an electron
pub const PROTON: f64 = _PROTON;

/// The number of peaks computed for the background and unenriched envelopes, and
/// the number of leading ladder points taken from the natural isotopic pattern
pub const INITIAL_PEAKS: usize = 6;

/// The number of peaks computed for the fully substituted formula. The first of these
/// is dropped from the ladder as it is already covered by the labeled series.
pub const TERMINAL_PEAKS: usize = 30;

/// The mass shift of a single labeled atom for each supported heavy isotope
const LABEL_MASS_SHIFTS: [(&str, f64); 8] = [
    ("H[2]", 1.0062767458900002),
    ("C[13]", 1.0033548350700006),
    ("N[15]", 0.9970348944500014),
    ("O[17]", 1.0042171369299986),
    ("O[18]", 2.0042449932900013),
    ("S[33]", 0.9993877353999991),
    ("S[34]", 1.9957958295999987),
    ("S[36]", 3.9950095355999977),
];

static ELEMENT_SYMBOL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Z][a-z]?").unwrap());

/// The mass difference between a heavy isotope label like `C[13]` and the most abundant
/// isotope of its element
pub fn label_mass_shift(label: &str) -> Result<f64, FormulaError> {
    LABEL_MASS_SHIFTS
        .iter()
        .find(|(name, _)| *name == label)
        .map(|(_, shift)| *shift)
        .ok_or_else(|| FormulaError::UnknownLabel(label.to_string()))
}

/// Extract the element symbol from a label, e.g. `C` from `C[13]`
pub fn label_element(label: &str) -> Result<&str, FormulaError> {
    ELEMENT_SYMBOL
        .find(label)
        .map(|m| m.as_str())
        .ok_or_else(|| FormulaError::UnknownLabel(label.to_string()))
}

/// A theoretical isotopic pattern as parallel m/z and relative intensity arrays
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsotopicEnvelope {
    pub mz: Vec<f64>,
    pub intensity: Vec<f64>,
}

impl IsotopicEnvelope {
    pub fn new(mz: Vec<f64>, intensity: Vec<f64>) -> Self {
        Self { mz, intensity }
    }

    pub fn len(&self) -> usize {
        self.mz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mz.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.intensity.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.mz.iter().copied().zip(self.intensity.iter().copied())
    }

    /// Scale the intensities so that they sum to 1
    pub fn normalize(mut self) -> Self {
        let total = self.total();
        if total > 0.0 {
            self.intensity.iter_mut().for_each(|i| *i /= total);
        }
        self
    }
}

impl FromIterator<(f64, f64)> for IsotopicEnvelope {
    fn from_iter<T: IntoIterator<Item = (f64, f64)>>(iter: T) -> Self {
        let (mz, intensity) = iter.into_iter().unzip();
        Self { mz, intensity }
    }
}

/// The capability to compute a theoretical isotopic envelope from an elemental formula
pub trait IsotopicEnvelopeGenerator {
    /// Compute the first `npeaks` isotopic peaks of `formula` at `charge`.
    ///
    /// The returned intensities sum to 1 over the returned peaks.
    fn isotopic_envelope(
        &mut self,
        formula: &ChemicalFormula,
        charge: i32,
        npeaks: usize,
    ) -> Result<IsotopicEnvelope, FormulaError>;
}

impl<G: IsotopicEnvelopeGenerator + ?Sized> IsotopicEnvelopeGenerator for &mut G {
    fn isotopic_envelope(
        &mut self,
        formula: &ChemicalFormula,
        charge: i32,
        npeaks: usize,
    ) -> Result<IsotopicEnvelope, FormulaError> {
        (**self).isotopic_envelope(formula, charge, npeaks)
    }
}

/// Compute isotopic envelopes with the coarse fine-structure aggregated isotopic pattern
/// algorithm from `chemical_elements`.
#[derive(Debug, Clone)]
pub struct BrainpyGenerator {
    generator: BafflingRecursiveIsotopicPatternGenerator<'static>,
}

impl Default for BrainpyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl BrainpyGenerator {
    pub fn new() -> Self {
        Self {
            generator: BafflingRecursiveIsotopicPatternGenerator::new(),
        }
    }
}

impl IsotopicEnvelopeGenerator for BrainpyGenerator {
    fn isotopic_envelope(
        &mut self,
        formula: &ChemicalFormula,
        charge: i32,
        npeaks: usize,
    ) -> Result<IsotopicEnvelope, FormulaError> {
        let composition = formula.to_composition()?;
        let peaks = self
            .generator
            .isotopic_variants(composition, npeaks, charge, PROTON);
        let pattern = TheoreticalIsotopicPattern::from(peaks);
        let envelope: IsotopicEnvelope = pattern
            .peaks
            .iter()
            .take(npeaks)
            .map(|p| (p.mz, p.intensity))
            .collect();
        Ok(envelope.normalize())
    }
}

/// The parameters that uniquely identify an isotopic envelope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvelopeKey {
    pub formula: ChemicalFormula,
    pub charge: i32,
    pub npeaks: usize,
}

/// An [`IsotopicEnvelopeGenerator`] that memoizes the envelopes produced by another generator.
///
/// Entries are never evicted, the cache lives as long as the generator does. The key space
/// is small in practice since the same formulae recur across every PSM of a peptide.
#[derive(Debug, Clone, Default)]
pub struct CachingEnvelopeGenerator<G: IsotopicEnvelopeGenerator> {
    inner: G,
    cache: BTreeMap<EnvelopeKey, IsotopicEnvelope>,
    hits: usize,
}

impl<G: IsotopicEnvelopeGenerator> CachingEnvelopeGenerator<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            cache: BTreeMap::new(),
            hits: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// The number of requests answered from the cache
    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn iter(&self) -> btree_map::Iter<'_, EnvelopeKey, IsotopicEnvelope> {
        self.cache.iter()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.hits = 0;
    }

    pub fn into_inner(self) -> G {
        self.inner
    }
}

impl<G: IsotopicEnvelopeGenerator> From<G> for CachingEnvelopeGenerator<G> {
    fn from(inner: G) -> Self {
        Self::new(inner)
    }
}

impl<G: IsotopicEnvelopeGenerator> IsotopicEnvelopeGenerator for CachingEnvelopeGenerator<G> {
    fn isotopic_envelope(
        &mut self,
        formula: &ChemicalFormula,
        charge: i32,
        npeaks: usize,
    ) -> Result<IsotopicEnvelope, FormulaError> {
        let key = EnvelopeKey {
            formula: formula.clone(),
            charge,
            npeaks,
        };
        match self.cache.entry(key) {
            BEntry::Occupied(ent) => {
                self.hits += 1;
                Ok(ent.get().clone())
            }
            BEntry::Vacant(ent) => {
                let envelope = self.inner.isotopic_envelope(formula, charge, npeaks)?;
                trace!("Caching envelope for {formula} at charge {charge}");
                Ok(ent.insert(envelope).clone())
            }
        }
    }
}

/// The first [`INITIAL_PEAKS`] relative intensities of the isotopic envelope of `formula`
pub fn isotope_packet<G: IsotopicEnvelopeGenerator + ?Sized>(
    formula: &ChemicalFormula,
    charge: i32,
    generator: &mut G,
) -> Result<Vec<f64>, FormulaError> {
    Ok(generator
        .isotopic_envelope(formula, charge, INITIAL_PEAKS)?
        .intensity)
}

/// Compute the theoretical m/z ladder spanning the natural isotopic pattern of `formula`
/// through complete substitution of the label element by its heavy isotope `label`.
///
/// The ladder is made of three segments:
/// 1. The first [`INITIAL_PEAKS`] peaks of the natural isotopic pattern
/// 2. One point per additional labeled atom, spaced by the label's mass shift
/// 3. The isotopic pattern of the fully substituted formula, skipping its first peak
pub fn calc_mz<G: IsotopicEnvelopeGenerator + ?Sized>(
    formula: &ChemicalFormula,
    charge: i32,
    label: &str,
    generator: &mut G,
) -> Result<Vec<f64>, FormulaError> {
    let element = label_element(label)?;
    let shift = label_mass_shift(label)?;
    let n_label = formula.get(element) as usize;

    let initial = generator.isotopic_envelope(formula, charge, INITIAL_PEAKS)?;
    let mz0 = match initial.mz.first() {
        Some(mz0) => *mz0,
        None => return Ok(Vec::new()),
    };

    let substituted = formula.substitute(element, label)?;
    let terminal = generator.isotopic_envelope(&substituted, charge, TERMINAL_PEAKS)?;

    let z = charge as f64;
    let mut ladder = initial.mz;
    let start = ladder.len();
    ladder.extend((start..=n_label).map(|k| mz0 + (k as f64 * shift) / z));
    ladder.extend(terminal.mz.into_iter().skip(1));
    Ok(ladder)
}
