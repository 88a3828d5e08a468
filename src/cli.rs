//! Command-line interface definitions and argument parsing

use crate::data::ColumnMap;
use crate::logging::LogFormat;
use crate::model::FitConfig;
use clap::Parser;
use std::path::PathBuf;

/// Customer retention state analysis using a 4-state categorical HMM
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the input CSV file
    #[arg(short, long, env = "CHURNSTATE_INPUT", default_value = "data.csv")]
    pub input: PathBuf,

    /// Column with prior-year online usage
    #[arg(long, default_value = "9Online")]
    pub online_prior: String,

    /// Column with prior-year billpay usage
    #[arg(long, default_value = "9Billpay")]
    pub billpay_prior: String,

    /// Column with current-year online usage
    #[arg(long, default_value = "0Online")]
    pub online_current: String,

    /// Column with current-year billpay usage
    #[arg(long, default_value = "0Billpay")]
    pub billpay_current: String,

    /// Column with current-year profit; a present value marks a retained customer
    #[arg(long, default_value = "0Profit")]
    pub profit_current: String,

    /// Random seed for the EM starting values
    #[arg(long, default_value = "123")]
    pub seed: u64,

    /// Maximum EM iterations
    #[arg(long, default_value = "10000")]
    pub max_iters: usize,

    /// Relative log-likelihood change for EM convergence
    #[arg(long, default_value = "1e-6")]
    pub tolerance: f64,

    /// Number of random EM starts
    #[arg(long, default_value = "1")]
    pub restarts: usize,

    /// Write fitted parameters and labels as JSON
    #[arg(long, value_name = "PATH")]
    pub params_json: Option<PathBuf>,

    /// Write the decoded state of every row as CSV
    #[arg(long, value_name = "PATH")]
    pub assignments: Option<PathBuf>,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Human)]
    pub log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Source column names for data preparation
    pub fn column_map(&self) -> ColumnMap {
        ColumnMap {
            online_prior: self.online_prior.clone(),
            billpay_prior: self.billpay_prior.clone(),
            online_current: self.online_current.clone(),
            billpay_current: self.billpay_current.clone(),
            profit_current: self.profit_current.clone(),
        }
    }

    /// EM settings for the model fit
    pub fn fit_config(&self) -> FitConfig {
        FitConfig {
            max_iterations: self.max_iters,
            tolerance: self.tolerance,
            seed: self.seed,
            restarts: self.restarts,
        }
    }
}
