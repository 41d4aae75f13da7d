use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;
use tracing::{debug, instrument};

use isopacket::peptide::{Peptide, ReportValue};

/// The union of the records' keys, in the order they are first seen
pub fn report_columns(records: &[Vec<(String, ReportValue)>]) -> Vec<String> {
    records
        .iter()
        .flat_map(|r| r.iter().map(|(k, _)| k.clone()))
        .unique()
        .collect()
}

/// Write one tab separated row per peptide. Columns a peptide lacks are left empty.
#[instrument(level = "debug", skip_all)]
pub fn write_report<W: Write>(peptides: &[Peptide], writer: W) -> Result<usize, csv::Error> {
    let records: Vec<_> = peptides.iter().map(|p| p.report()).collect();
    let columns = report_columns(&records);
    debug!("Writing {} rows with {} columns", records.len(), columns.len());

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);
    if !records.is_empty() {
        writer.write_record(&columns)?;
    }
    for record in records.iter() {
        let row = columns.iter().map(|column| {
            record
                .iter()
                .find(|(k, _)| k == column)
                .map(|(_, v)| v.to_string())
                .unwrap_or_default()
        });
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// Open the report destination, STDOUT for `-` and gzip compressed for paths ending in `.gz`
pub fn open_output(path: &Path) -> io::Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(io::BufWriter::new(io::stdout())));
    }
    let handle = io::BufWriter::new(fs::File::create(path)?);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(GzEncoder::new(handle, Compression::best())))
    } else {
        Ok(Box::new(handle))
    }
}
