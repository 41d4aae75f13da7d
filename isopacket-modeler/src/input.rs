use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use flate2::bufread::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use mzpeaks::{CentroidPeak, MZPeakSetType};

use isopacket::psm::{base_name, Identification, Metadata};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// The centroided peaks of one scan near an identification, sorted by m/z
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPeaks {
    pub mz: Vec<f64>,
    pub intensity: Vec<f32>,
}

impl ScanPeaks {
    pub fn to_peak_set(&self) -> MZPeakSetType<CentroidPeak> {
        MZPeakSetType::new(
            self.mz
                .iter()
                .zip(self.intensity.iter())
                .enumerate()
                .map(|(i, (mz, inten))| CentroidPeak::new(*mz, *inten, i as u32))
                .collect(),
        )
    }
}

/// An identification with the scans to read its isotopic envelope from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsmRecord {
    #[serde(flatten)]
    pub identification: Identification,
    #[serde(default)]
    pub scans: Vec<ScanPeaks>,
}

/// How one file of the experiment was labeled. An empty label marks a control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignEntry {
    pub file: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInput {
    pub design: Vec<DesignEntry>,
    pub psms: Vec<PsmRecord>,
}

impl ExperimentInput {
    /// Every non-control label used in the design
    pub fn labels(&self) -> BTreeSet<String> {
        self.design
            .iter()
            .filter(|d| !d.label.is_empty())
            .map(|d| d.label.clone())
            .collect()
    }

    /// Look up design entries by the base name of their file
    pub fn design_index(&self) -> HashMap<String, &DesignEntry> {
        self.design
            .iter()
            .map(|d| (base_name(&d.file), d))
            .collect()
    }
}

/// Read a JSON experiment description, transparently decompressing gzip
pub fn read_experiment<R: BufRead>(mut reader: R) -> io::Result<ExperimentInput> {
    let compressed = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    debug!("Reading experiment description (compressed? {compressed})");
    let parsed = if compressed {
        serde_json::from_reader(io::BufReader::new(MultiGzDecoder::new(reader)))
    } else {
        serde_json::from_reader(reader)
    };
    parsed.map_err(io::Error::from)
}

/// Read an experiment description from `path`, or STDIN if `path` is `-`
pub fn read_experiment_from(path: &str) -> io::Result<ExperimentInput> {
    if path == "-" {
        read_experiment(io::stdin().lock())
    } else {
        let handle = fs::File::open(Path::new(path)).map_err(|e| {
            io::Error::new(e.kind(), format!("Failed to open {path}: {e}"))
        })?;
        read_experiment(io::BufReader::new(handle))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use mzpeaks::prelude::*;

    const DOCUMENT: &str = r#"{
        "design": [
            {"file": "heavy_run", "label": "C[13]", "metadata": {"condition": "heavy"}},
            {"file": "control_run.mzML"}
        ],
        "psms": [
            {"sequence": "PEPTIDEK", "file": "/data/heavy_run.mzML", "scan": 4, "charge": 2,
             "metadata": {"score": 1.5},
             "scans": [{"mz": [464.73, 465.24], "intensity": [100.0, 50.0]}]}
        ]
    }"#;

    #[test]
    fn test_read_plain() -> io::Result<()> {
        let input = read_experiment(DOCUMENT.as_bytes())?;
        assert_eq!(input.psms.len(), 1);
        let record = &input.psms[0];
        assert_eq!(record.identification.scan, 4);
        assert_eq!(record.identification.proteins, "");
        assert_eq!(record.scans[0].to_peak_set().len(), 2);
        assert_eq!(input.labels().len(), 1);

        let index = input.design_index();
        assert_eq!(index["heavy_run"].label, "C[13]");
        assert_eq!(index["control_run"].label, "");
        assert!(index.contains_key(&base_name(&record.identification.file)));
        Ok(())
    }

    #[test]
    fn test_read_gzip() -> io::Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(DOCUMENT.as_bytes())?;
        let buffer = encoder.finish()?;
        let input = read_experiment(buffer.as_slice())?;
        assert_eq!(input.design.len(), 2);
        Ok(())
    }

    #[test]
    fn test_read_malformed() {
        let err = read_experiment(&b"{\"design\": 5}"[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
