//! `isopacket` fits statistical models of stable isotope label incorporation to the
//! isotopic envelopes of peptides.
//!
//! PSMs are built from identifications by computing their formula, theoretical m/z ladder
//! and natural isotopic envelopes ([`psm`], [`formula`], [`isotopic_model`]). Observed peaks
//! are aligned to the ladder ([`align`]), PSMs are grouped into [`peptide::Peptide`]s, and
//! each configured [`dgp::DataGeneratingProcess`] is fit to every peptide by the
//! [`controller::FitController`].
pub mod align;
pub mod controller;
pub mod dgp;
pub mod fit_result;
pub mod formula;
pub mod isotopic_model;
pub mod optimize;
pub mod peptide;
pub mod psm;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_data;

pub use crate::controller::{FitConfig, FitController, FitError, FitProgress};
pub use crate::dgp::{DataGeneratingProcess, DataGeneratingProcesses, DgpError};
pub use crate::fit_result::{FitResult, ModelSummary};
pub use crate::formula::{ChemicalFormula, FormulaError, ResidueTable};
pub use crate::isotopic_model::{
    BrainpyGenerator, CachingEnvelopeGenerator, IsotopicEnvelope, IsotopicEnvelopeGenerator,
};
pub use crate::peptide::{initialize_peptides, Peptide, PeptideError, ReportValue};
pub use crate::psm::{Identification, Metadata, MetadataValue, Psm};
