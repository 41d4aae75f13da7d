use std::ops::{Add, AddAssign};

use tracing::info;

use isopacket::FitProgress;

/// Counts of what happened to identifications on their way to becoming peptides
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProgressRecord {
    pub identifications: usize,
    pub without_design: usize,
    pub psms: usize,
    pub usable_psms: usize,
    pub excluded_psms: usize,
    pub peptides: usize,
    pub fit: FitProgress,
}

impl ProgressRecord {
    pub fn log(&self) {
        info!(
            "Identifications: {} | Without Design Entry: {}",
            self.identifications, self.without_design
        );
        info!(
            "PSMs: {} | Usable: {} | Excluded: {}",
            self.psms, self.usable_psms, self.excluded_psms
        );
        info!("Peptides: {} | Fits: {}", self.peptides, self.fit.fits);
        info!(
            "Pruned High Error: {} | Pruned Unenriched: {} | Retained: {}",
            self.fit.pruned_high_error, self.fit.pruned_unenriched, self.fit.retained
        );
    }
}

impl Add for ProgressRecord {
    type Output = ProgressRecord;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for ProgressRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.identifications += rhs.identifications;
        self.without_design += rhs.without_design;
        self.psms += rhs.psms;
        self.usable_psms += rhs.usable_psms;
        self.excluded_psms += rhs.excluded_psms;
        self.peptides += rhs.peptides;
        self.fit += rhs.fit;
    }
}
