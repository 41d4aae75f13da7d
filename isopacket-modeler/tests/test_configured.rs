use std::path::{Path, PathBuf};

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use isopacket::FitConfig;
use isopacket_modeler::{load_fit_config, IsopacketModeler};

#[test]
fn test_config_file_layering() {
    let config = load_fit_config(Some(Path::new("./tests/data/quick.toml"))).unwrap();
    assert_eq!(
        config.data_generating_processes,
        vec!["Binom", "BetabinomQuiescentMix"]
    );
    assert_eq!(config.threads, 2);
    assert_eq!(config.seed, 7);
    assert_eq!(config.basin_hopping.niter, 5);
    // Keys missing from the file keep their defaults
    assert_eq!(config.basin_hopping.temperature, 2.0);
    assert_eq!(config.basin_hopping.stepsize, 0.5);
}

#[test]
fn test_no_config_file_in_working_directory() {
    assert!(!Path::new(isopacket_modeler::DEFAULT_CONFIG_FILE).exists());
    let config = load_fit_config(None).unwrap();
    assert_eq!(config, FitConfig::default());
}

#[test]
fn test_missing_config_file() {
    assert!(load_fit_config(Some(Path::new("./tests/data/not_real.toml"))).is_err());
}

#[test]
fn test_defaults_without_files() {
    let config: FitConfig = Figment::from(Serialized::defaults(FitConfig::default()))
        .extract()
        .unwrap();
    assert_eq!(config, FitConfig::default());
    assert_eq!(config.data_generating_processes.len(), 4);
    assert_eq!(config.natural_abundance["C"], 0.0107);
}

#[test_log::test]
fn test_configured_driver() {
    let config = Figment::new().merge(Toml::file_exact("./tests/data/driver.toml"));
    let driver: IsopacketModeler = config.extract().unwrap();
    assert_eq!(driver.output_file, PathBuf::from("-"));
    let fit = driver.fit_config();
    assert_eq!(fit.data_generating_processes, vec!["Binom"]);
    assert_eq!(fit.threads, 1);
    assert_eq!(fit.basin_hopping.niter, 2);
    assert_eq!(fit.max_peptide_err, FitConfig::default().max_peptide_err);

    let progress = driver.main().unwrap();
    assert_eq!(progress.identifications, 5);
    assert_eq!(progress.psms, 5);
    assert_eq!(progress.usable_psms, 4);
    assert_eq!(progress.excluded_psms, 1);
    assert_eq!(progress.peptides, 2);
    assert_eq!(progress.fit.fits, 2);
}
