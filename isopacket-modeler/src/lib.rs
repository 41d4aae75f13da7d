mod driver;
mod input;
mod progress;
mod write;

pub use driver::{
    load_fit_config, IsopacketModeler, IsopacketModelerError, DEFAULT_CONFIG_FILE, ENV_PREFIX,
};
pub use input::{read_experiment, DesignEntry, ExperimentInput, PsmRecord, ScanPeaks};
pub use progress::ProgressRecord;
pub use write::{report_columns, write_report};
