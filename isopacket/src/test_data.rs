//! Deterministic fixtures shared by the unit tests
use std::collections::BTreeSet;

use crate::dgp::{DataGeneratingProcess, DataGeneratingProcesses};
use crate::formula::{ChemicalFormula, FormulaError, ResidueTable};
use crate::isotopic_model::{IsotopicEnvelope, IsotopicEnvelopeGenerator, PROTON};
use crate::peptide::Peptide;
use crate::psm::{Identification, Metadata, MetadataValue, Psm};

const NEUTRON: f64 = 1.00335483;

/// Monoisotopic masses and the expected number of heavy atoms contributed per atom
const ELEMENTS: [(&str, f64, f64); 13] = [
    ("H", 1.00782503207, 0.000115),
    ("C", 12.0, 0.0107),
    ("N", 14.0030740048, 0.00364),
    ("O", 15.99491461956, 0.00205),
    ("S", 31.97207100, 0.0429),
    ("H[2]", 2.0141017778, 0.0),
    ("C[13]", 13.0033548378, 0.0),
    ("N[15]", 15.0001088982, 0.0),
    ("O[17]", 16.99913170, 0.0),
    ("O[18]", 17.9991610, 0.0),
    ("S[33]", 32.97145876, 0.0),
    ("S[34]", 33.96786690, 0.0),
    ("S[36]", 35.96708076, 0.0),
];

/// An [`IsotopicEnvelopeGenerator`] which approximates the isotopic envelope with a Poisson
/// distribution so tests don't depend on the exact output of the isotopic pattern calculator.
#[derive(Debug, Default, Clone)]
pub struct NominalEnvelopeGenerator {
    calls: usize,
}

impl NominalEnvelopeGenerator {
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl IsotopicEnvelopeGenerator for NominalEnvelopeGenerator {
    fn isotopic_envelope(
        &mut self,
        formula: &ChemicalFormula,
        charge: i32,
        npeaks: usize,
    ) -> Result<IsotopicEnvelope, FormulaError> {
        self.calls += 1;
        let mut mass: f64 = 0.0;
        let mut lambda: f64 = 0.0;
        for (element, count) in formula.iter() {
            let (_, element_mass, heavy) = ELEMENTS
                .iter()
                .find(|(name, _, _)| *name == element.as_str())
                .ok_or_else(|| FormulaError::InvalidElement(element.clone()))?;
            mass += element_mass * *count as f64;
            lambda += heavy * *count as f64;
        }
        let z = charge as f64;
        let mut term = (-lambda).exp();
        let envelope: IsotopicEnvelope = (0..npeaks)
            .map(|k| {
                if k > 0 {
                    term *= lambda / k as f64;
                }
                ((mass + k as f64 * NEUTRON) / z + PROTON, term)
            })
            .collect();
        Ok(envelope.normalize())
    }
}

pub fn metadata(pairs: &[(&str, MetadataValue)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn identification(sequence: &str, file: &str, scan: usize) -> Identification {
    Identification {
        sequence: sequence.to_string(),
        file: file.to_string(),
        scan,
        charge: 2,
        proteins: "sp|P00001|TEST".to_string(),
        metadata: metadata(&[
            ("score", MetadataValue::Number(scan as f64)),
            ("engine", MetadataValue::Text("search".to_string())),
        ]),
    }
}

/// Build a labeled PSM with the nominal generator and no observations
pub fn make_psm(sequence: &str, file: &str, scan: usize, label: &str) -> Psm {
    let mut generator = NominalEnvelopeGenerator::default();
    let design = metadata(&[("condition", MetadataValue::Text("heavy".to_string()))]);
    let labels: BTreeSet<String> = [label.to_string()].into_iter().collect();
    Psm::from_design(
        &identification(sequence, file, scan),
        label,
        &design,
        &labels,
        &ResidueTable::standard(),
        &mut generator,
    )
    .unwrap()
    .remove(0)
}

/// Build a peptide from `n_psms` PSMs whose observations are exactly the expected envelope
/// of `dgp` at `params`.
pub fn synthetic_peptide(
    sequence: &str,
    dgp: DataGeneratingProcesses,
    params: &[f64],
    n_psms: usize,
) -> Peptide {
    let template = make_psm(sequence, "run1.mzML", 0, "C[13]");
    let scaffold = Peptide::new(vec![with_intensity(template.clone(), vec![1.0; template.mz.len()])])
        .unwrap();
    let expected = dgp.expected(&scaffold, params).unwrap();
    let psms = (0..n_psms)
        .map(|i| {
            let mut psm = template.clone();
            psm.scan = i;
            with_intensity(psm, expected.iter().map(|v| v * 1e6).collect())
        })
        .collect();
    Peptide::new(psms).unwrap()
}

pub fn with_intensity(mut psm: Psm, intensity: Vec<f64>) -> Psm {
    psm.mz_err = vec![0.0; intensity.len()];
    psm.intensity = intensity;
    psm
}
