//! churnstate: customer retention state analysis
//!
//! This is the main entrypoint that orchestrates data preparation, model
//! fitting, state labeling and the printed report.

use anyhow::Result;
use churnstate::{fit_hmm, label_states, load_and_prepare, logging, report, Args};
use clap::Parser;
use std::io::{self, Write};
use std::time::Instant;
use tracing::{error, info};

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();
    logging::init_logging(args.verbose, args.log_format);

    let start_time = Instant::now();

    // Step 1: Load and prepare observations. Integrity errors abort the run.
    info!(input = %args.input.display(), "loading input");
    let prepared = load_and_prepare(&args.input, &args.column_map())?;
    info!(customers = prepared.table.len(), "observations prepared");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    report::write_data_summary(&mut out, &prepared)?;

    // Step 2: Fit the HMM. A failed fit ends with a diagnostic, not an error.
    let fit_config = args.fit_config();
    info!(
        seed = fit_config.seed,
        max_iterations = fit_config.max_iterations,
        tolerance = fit_config.tolerance,
        restarts = fit_config.restarts,
        "fitting HMM"
    );
    let fitted = match fit_hmm(&prepared.table, &fit_config) {
        Ok(fitted) => fitted,
        Err(err) => {
            error!(error = %err, "model fit failed");
            report::write_fit_failure(&mut out, &err)?;
            out.flush()?;
            return Ok(());
        }
    };

    // Step 3: Label states and report
    let labels = label_states(&fitted.params);
    report::write_fit_report(&mut out, &fitted, &labels)?;
    out.flush()?;

    if let Some(path) = &args.params_json {
        report::write_params_json(path, &fitted, &labels)?;
    }
    if let Some(path) = &args.assignments {
        report::write_assignments(path, &fitted, &labels)?;
    }

    info!(
        elapsed_secs = start_time.elapsed().as_secs_f64(),
        "analysis complete"
    );
    Ok(())
}
