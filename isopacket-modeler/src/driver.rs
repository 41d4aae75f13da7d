use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use isopacket::peptide::{count_by_label, initialize_peptides};
use isopacket::psm::base_name;
use isopacket::{
    BrainpyGenerator, CachingEnvelopeGenerator, FitConfig, FitController, FitError, FormulaError,
    PeptideError, Psm, ResidueTable,
};

use crate::input::{read_experiment_from, ExperimentInput};
use crate::progress::ProgressRecord;
use crate::write::{open_output, write_report};

/// Read from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "isopacket.toml";
pub const ENV_PREFIX: &str = "ISOPACKET_";

#[derive(Debug, Error)]
pub enum IsopacketModelerError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Failed to write the report: {0}")]
    CSVError(
        #[source]
        #[from]
        csv::Error,
    ),
    #[error("Failed to read the configuration: {0}")]
    ConfigError(
        #[source]
        #[from]
        figment::Error,
    ),
    #[error("Failed to serialize the configuration: {0}")]
    ConfigSerializationError(
        #[source]
        #[from]
        toml::ser::Error,
    ),
    #[error("{0}")]
    FormulaError(
        #[source]
        #[from]
        FormulaError,
    ),
    #[error("{0}")]
    PeptideError(
        #[source]
        #[from]
        PeptideError,
    ),
    #[error("{0}")]
    FitError(
        #[source]
        #[from]
        FitError,
    ),
}

/// Merge the fit configuration from the built-in defaults, `isopacket.toml` in the working
/// directory, `config_file`, and `ISOPACKET_` prefixed environment variables, in that order.
///
/// Nested keys are separated by a double underscore in environment variables, as in
/// `ISOPACKET_BASIN_HOPPING__NITER`.
pub fn load_fit_config(config_file: Option<&Path>) -> Result<FitConfig, IsopacketModelerError> {
    let mut figment = Figment::from(Serialized::defaults(FitConfig::default()));
    if Path::new(DEFAULT_CONFIG_FILE).exists() {
        figment = figment.merge(Toml::file_exact(DEFAULT_CONFIG_FILE));
    }
    if let Some(path) = config_file {
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Configuration file {} does not exist", path.display()),
            )
            .into());
        }
        figment = figment.merge(Toml::file_exact(path));
    }
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
    Ok(figment.extract()?)
}

fn default_output() -> PathBuf {
    PathBuf::from("-")
}

/// Fit isotopic label incorporation models to the peptides of a labeling experiment.
///
/// Read identifications with their nearby scans and the experimental design, group them
/// into peptides, fit each data generating process to each peptide, and write a tab
/// separated report of the peptides which are well fit and enriched.
#[derive(Parser, Debug, Deserialize, Serialize)]
#[command(author, version)]
pub struct IsopacketModeler {
    /// The JSON file to read identifications, scans and the design from, optionally gzip
    /// compressed, or if '-' is passed, read from STDIN
    #[arg()]
    pub input_file: String,

    /// The path to write the report to, or if '-' is passed, write to STDOUT.
    ///
    /// Paths ending in `.gz` are gzip compressed.
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    #[serde(default = "default_output")]
    pub output_file: PathBuf,

    /// A tab separated table of residue compositions to use instead of the standard amino acids
    #[arg(short = 'r', long = "residues")]
    pub residues: Option<PathBuf>,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read fit parameters from.
    ///
    /// Configurations are also read from `isopacket.toml` in the working directory.
    /// Environment variables prefixed with `ISOPACKET_` will be read too.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(short = 't', long = "threads", allow_negative_numbers = true)]
    pub threads: Option<i32>,

    /// A data generating process to fit. May be repeated. Defaults to all of them.
    #[arg(short = 'd', long = "dgp", value_delimiter = ',')]
    #[serde(default)]
    pub dgp: Vec<String>,

    /// Discard peptides whose best fit has a loss above this
    #[arg(short = 'e', long = "max-peptide-err")]
    pub max_peptide_err: Option<f64>,

    #[arg(skip)]
    #[serde(default)]
    pub fit: FitConfig,
}

impl IsopacketModeler {
    /// The fit configuration with command line overrides applied
    pub fn fit_config(&self) -> FitConfig {
        let mut config = self.fit.clone();
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if !self.dgp.is_empty() {
            config.data_generating_processes = self.dgp.clone();
        }
        if let Some(max_peptide_err) = self.max_peptide_err {
            config.max_peptide_err = max_peptide_err;
        }
        config
    }

    fn load_residues(&self) -> Result<ResidueTable, IsopacketModelerError> {
        match self.residues.as_ref() {
            Some(path) => {
                info!("Reading residue compositions from {}", path.display());
                Ok(ResidueTable::from_path(path)?)
            }
            None => Ok(ResidueTable::standard()),
        }
    }

    /// Build every PSM the design implies, align its scans, and split them into usable and
    /// excluded PSMs
    fn build_psms(
        &self,
        experiment: &ExperimentInput,
        residues: &ResidueTable,
        progress: &mut ProgressRecord,
    ) -> Result<(Vec<Psm>, Vec<Psm>), IsopacketModelerError> {
        let labels = experiment.labels();
        let design = experiment.design_index();
        let mut generator = CachingEnvelopeGenerator::new(BrainpyGenerator::new());

        let mut pending = Vec::with_capacity(experiment.psms.len());
        for record in experiment.psms.iter() {
            progress.identifications += 1;
            let identification = &record.identification;
            let Some(entry) = design.get(&base_name(&identification.file)) else {
                warn!(
                    "No design entry for {}, skipping scan {}",
                    identification.file, identification.scan
                );
                progress.without_design += 1;
                continue;
            };
            for psm in Psm::from_design(
                identification,
                &entry.label,
                &entry.metadata,
                &labels,
                residues,
                &mut generator,
            )? {
                pending.push((psm, record.scans.as_slice()));
            }
        }
        debug!(
            "Computed {} distinct isotopic envelopes with {} cache hits",
            generator.len(),
            generator.hits()
        );

        let psms: Vec<Psm> = pending
            .into_par_iter()
            .map(|(mut psm, scans)| {
                let peaks: Vec<_> = scans.iter().map(|s| s.to_peak_set()).collect();
                psm.parse_scans(&peaks);
                psm
            })
            .collect();
        progress.psms = psms.len();

        let (usable, excluded): (Vec<_>, Vec<_>) = psms.into_iter().partition(|p| p.is_usable());
        progress.usable_psms = usable.len();
        progress.excluded_psms = excluded.len();
        info!(
            "{} PSMs are usable, {} were excluded",
            usable.len(),
            excluded.len()
        );
        Ok((usable, excluded))
    }

    pub fn main(&self) -> Result<ProgressRecord, IsopacketModelerError> {
        info!(
            "isopacket-modeler v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Input: {}", self.input_file);
        info!("Output: {}", self.output_file.display());

        let config = self.fit_config();
        debug!("Fit configuration:\n{}", toml::to_string_pretty(&config)?);
        let controller = FitController::new(config)?;
        let residues = self.load_residues()?;
        let experiment = read_experiment_from(&self.input_file)?;

        let mut progress = ProgressRecord::default();
        let (usable, excluded) = controller
            .create_threadpool()?
            .install(|| self.build_psms(&experiment, &residues, &mut progress))?;

        let peptides = initialize_peptides(usable, excluded)?;
        progress.peptides = peptides.len();
        for (label, count) in count_by_label(&peptides) {
            info!("{count} peptides labeled with {label}");
        }

        let (peptides, fit_progress) = controller.fit_peptides(peptides)?;
        progress.fit = fit_progress;

        let written = write_report(&peptides, open_output(&self.output_file)?)?;
        info!("Wrote {written} peptides to {}", self.output_file.display());
        progress.log();
        Ok(progress)
    }
}
