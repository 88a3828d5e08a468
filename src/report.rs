//! Text report and file exports for a fitted model

use crate::data::{PreparedData, Variable};
use crate::error::ModelFitError;
use crate::model::FittedHmm;
use anyhow::Context;
use ndarray::Array2;
use polars::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use tracing::info;

/// Round for display. Returns a copy; fitted parameters are never rounded.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Display copy of a matrix rounded to 3 decimals.
pub fn rounded(matrix: &Array2<f64>) -> Array2<f64> {
    matrix.mapv(round3)
}

/// Missing-value summary, categorical summary and factor levels.
pub fn write_data_summary<W: Write>(out: &mut W, prepared: &PreparedData) -> io::Result<()> {
    writeln!(out, "=== Missing Values (before imputation) ===")?;
    for entry in &prepared.missing {
        writeln!(out, "  {:<20} {:>8}", entry.column, entry.missing)?;
    }

    let table = &prepared.table;
    writeln!(out, "\n=== Categorical Summary ({} customers) ===", table.len())?;
    for variable in Variable::ALL {
        let levels = variable.levels();
        let counts = table.level_counts(variable);
        writeln!(
            out,
            "  {:<26} {}: {:>7}   {}: {:>7}",
            variable.name(),
            levels[0],
            counts[0],
            levels[1],
            counts[1]
        )?;
    }

    writeln!(out, "\n=== Factor Levels ===")?;
    for variable in Variable::ALL {
        writeln!(out, "  {:<26} {}", variable.name(), variable.levels().join(", "))?;
    }
    Ok(())
}

/// Fit statistics, per-state emission tables and the transition matrix,
/// which is printed a second time as a follow-up section.
pub fn write_fit_report<W: Write>(
    out: &mut W,
    fitted: &FittedHmm,
    labels: &[String],
) -> io::Result<()> {
    let params = &fitted.params;

    writeln!(out, "\n=== Model Fit ===")?;
    writeln!(out, "  States:          {}", params.num_states())?;
    writeln!(out, "  Observations:    {}", fitted.n_observations())?;
    writeln!(out, "  Iterations:      {}", fitted.iterations)?;
    writeln!(out, "  Log-likelihood:  {:.3}", fitted.log_likelihood)?;
    writeln!(out, "  Parameters:      {}", fitted.num_parameters())?;
    writeln!(out, "  AIC:             {:.3}", fitted.aic())?;
    writeln!(out, "  BIC:             {:.3}", fitted.bic())?;

    writeln!(out, "\n=== Initial State Probabilities ===")?;
    for (state, p) in params.initial().iter().enumerate() {
        writeln!(out, "  {:<40} {:.3}", labels[state], round3(*p))?;
    }

    writeln!(out, "\n=== Emission Probabilities ===")?;
    for (state, label) in labels.iter().enumerate() {
        writeln!(out, "\nState {state}: {label}")?;
        for variable in Variable::ALL {
            let levels = variable.levels();
            let [p0, p1] = params.emission(state, variable);
            writeln!(
                out,
                "  {:<26} {:>6} {:.3}   {:>6} {:.3}",
                variable.name(),
                levels[0],
                round3(p0),
                levels[1],
                round3(p1)
            )?;
        }
    }

    writeln!(out, "\n=== Transition Matrix ===")?;
    write_transition_matrix(out, params.transition(), labels)?;

    writeln!(out, "\n=== Decoded State Occupancy ===")?;
    let total = fitted.n_observations().max(1) as f64;
    for (state, count) in fitted.state_occupancy().iter().enumerate() {
        let percentage = *count as f64 / total * 100.0;
        writeln!(out, "  {:<40} {:>7} ({:.1}%)", labels[state], count, percentage)?;
    }

    writeln!(out, "\n=== Transition Probabilities Between Customer States ===")?;
    write_transition_matrix(out, params.transition(), labels)?;
    Ok(())
}

/// Matrix with state labels as row and column headers.
fn write_transition_matrix<W: Write>(
    out: &mut W,
    transition: &Array2<f64>,
    labels: &[String],
) -> io::Result<()> {
    let width = labels.iter().map(String::len).max().unwrap_or(0).max(5);
    let display = rounded(transition);

    write!(out, "{:<width$}", "from \\ to")?;
    for label in labels {
        write!(out, " | {label:>width$}")?;
    }
    writeln!(out)?;

    for (label, row) in labels.iter().zip(display.outer_iter()) {
        write!(out, "{label:<width$}")?;
        for p in row.iter() {
            write!(out, " | {p:>width$.3}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Diagnostic shown when the fit fails; the run still ends normally.
pub fn write_fit_failure<W: Write>(out: &mut W, err: &ModelFitError) -> io::Result<()> {
    writeln!(out, "\n=== Model Fit Failed ===")?;
    writeln!(out, "  Cause:      {err}")?;
    writeln!(out, "  Suggestion: {}", err.remediation())?;
    writeln!(
        out,
        "  Inspect the prepared table above and check the source columns for missing values."
    )?;
    Ok(())
}

/// Serializable view of a fitted model.
#[derive(Debug, Clone, Serialize)]
pub struct ParamsExport {
    pub num_states: usize,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    pub labels: Vec<String>,
    pub initial: Vec<f64>,
    pub transition: Vec<Vec<f64>>,
    pub emissions: Vec<StateEmissions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateEmissions {
    pub state: usize,
    pub label: String,
    pub variables: Vec<VariableEmission>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableEmission {
    pub variable: &'static str,
    pub levels: [&'static str; 2],
    pub probabilities: [f64; 2],
}

impl ParamsExport {
    pub fn new(fitted: &FittedHmm, labels: &[String]) -> Self {
        let params = &fitted.params;
        let emissions = labels
            .iter()
            .enumerate()
            .map(|(state, label)| StateEmissions {
                state,
                label: label.clone(),
                variables: Variable::ALL
                    .iter()
                    .map(|&variable| VariableEmission {
                        variable: variable.name(),
                        levels: variable.levels(),
                        probabilities: params.emission(state, variable),
                    })
                    .collect(),
            })
            .collect();

        Self {
            num_states: params.num_states(),
            log_likelihood: fitted.log_likelihood,
            aic: fitted.aic(),
            bic: fitted.bic(),
            labels: labels.to_vec(),
            initial: params.initial().to_vec(),
            transition: params
                .transition()
                .outer_iter()
                .map(|row| row.to_vec())
                .collect(),
            emissions,
        }
    }
}

/// Write the fitted parameters and labels as pretty-printed JSON.
pub fn write_params_json(path: &Path, fitted: &FittedHmm, labels: &[String]) -> crate::Result<()> {
    let export = ParamsExport::new(fitted, labels);
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, &export)?;
    info!(path = %path.display(), "wrote parameter export");
    Ok(())
}

/// Write one CSV row per observation: decoded state, its label and its
/// posterior probability.
pub fn write_assignments(path: &Path, fitted: &FittedHmm, labels: &[String]) -> crate::Result<()> {
    let rows = fitted.n_observations();
    let state_labels: Vec<String> = fitted.states.iter().map(|&s| labels[s].clone()).collect();
    let posterior: Vec<f64> = fitted
        .states
        .iter()
        .enumerate()
        .map(|(t, &s)| fitted.posteriors[[t, s]])
        .collect();

    let mut df = DataFrame::new(vec![
        Series::new("row".into(), (0..rows as u64).collect::<Vec<u64>>()).into(),
        Series::new(
            "state".into(),
            fitted.states.iter().map(|&s| s as u32).collect::<Vec<u32>>(),
        )
        .into(),
        Series::new("label".into(), state_labels).into(),
        Series::new("posterior".into(), posterior).into(),
    ])?;

    let mut file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
    info!(path = %path.display(), rows, "wrote state assignments");
    Ok(())
}
