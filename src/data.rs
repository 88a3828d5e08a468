//! Data loading and categorical recoding using Polars

use crate::error::DataIntegrityError;
use anyhow::Context;
use polars::prelude::*;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Online or billpay channel usage in one year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Usage {
    No,
    Yes,
}

impl Usage {
    /// Category index: No = 0, Yes = 1.
    pub fn code(self) -> usize {
        match self {
            Usage::No => 0,
            Usage::Yes => 1,
        }
    }
}

/// Whether the customer is still with the bank in the current year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Retention {
    Left,
    Stayed,
}

impl Retention {
    /// Category index: Left = 0, Stayed = 1.
    pub fn code(self) -> usize {
        match self {
            Retention::Left => 0,
            Retention::Stayed => 1,
        }
    }
}

/// The five observed variables, in the fixed order used by every
/// consumer of the fitted emission parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    OnlinePrior,
    BillpayPrior,
    OnlineCurrent,
    BillpayCurrent,
    Retained,
}

impl Variable {
    /// Number of observed variables.
    pub const COUNT: usize = 5;

    /// All variables in encoding order.
    pub const ALL: [Variable; 5] = [
        Variable::OnlinePrior,
        Variable::BillpayPrior,
        Variable::OnlineCurrent,
        Variable::BillpayCurrent,
        Variable::Retained,
    ];

    /// Position of this variable in observation codes and emission arrays.
    pub fn index(self) -> usize {
        match self {
            Variable::OnlinePrior => 0,
            Variable::BillpayPrior => 1,
            Variable::OnlineCurrent => 2,
            Variable::BillpayCurrent => 3,
            Variable::Retained => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Variable::OnlinePrior => "onlineUsagePriorYear",
            Variable::BillpayPrior => "billpayUsagePriorYear",
            Variable::OnlineCurrent => "onlineUsageCurrentYear",
            Variable::BillpayCurrent => "billpayUsageCurrentYear",
            Variable::Retained => "retained",
        }
    }

    /// Level names, indexed by category code.
    pub fn levels(self) -> [&'static str; 2] {
        match self {
            Variable::Retained => ["Left", "Stayed"],
            _ => ["No", "Yes"],
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One prepared customer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub online_prior: Usage,
    pub billpay_prior: Usage,
    pub online_current: Usage,
    pub billpay_current: Usage,
    pub retained: Retention,
}

impl Observation {
    /// Category code of one variable.
    pub fn category(&self, variable: Variable) -> usize {
        match variable {
            Variable::OnlinePrior => self.online_prior.code(),
            Variable::BillpayPrior => self.billpay_prior.code(),
            Variable::OnlineCurrent => self.online_current.code(),
            Variable::BillpayCurrent => self.billpay_current.code(),
            Variable::Retained => self.retained.code(),
        }
    }

    /// Category codes of all variables, in `Variable::ALL` order.
    pub fn codes(&self) -> [usize; Variable::COUNT] {
        Variable::ALL.map(|variable| self.category(variable))
    }
}

/// Source column names for each observed variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub online_prior: String,
    pub billpay_prior: String,
    pub online_current: String,
    pub billpay_current: String,
    /// Current-period profit; its presence marks a retained customer.
    pub profit_current: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            online_prior: "9Online".to_string(),
            billpay_prior: "9Billpay".to_string(),
            online_current: "0Online".to_string(),
            billpay_current: "0Billpay".to_string(),
            profit_current: "0Profit".to_string(),
        }
    }
}

impl ColumnMap {
    /// Source column a variable is derived from.
    pub fn source(&self, variable: Variable) -> &str {
        match variable {
            Variable::OnlinePrior => &self.online_prior,
            Variable::BillpayPrior => &self.billpay_prior,
            Variable::OnlineCurrent => &self.online_current,
            Variable::BillpayCurrent => &self.billpay_current,
            Variable::Retained => &self.profit_current,
        }
    }
}

/// Prepared observations, one per customer, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservationTable {
    rows: Vec<Observation>,
}

impl ObservationTable {
    pub fn new(rows: Vec<Observation>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Observation] {
        &self.rows
    }

    /// Category codes per row, the form the model consumes.
    pub fn codes(&self) -> Vec<[usize; Variable::COUNT]> {
        self.rows.iter().map(Observation::codes).collect()
    }

    /// Row count per level of one variable. Both levels are always
    /// reported, including a level nobody falls into.
    pub fn level_counts(&self, variable: Variable) -> [usize; 2] {
        let mut counts = [0; 2];
        for row in &self.rows {
            counts[row.category(variable)] += 1;
        }
        counts
    }
}

/// Missing values found in one source column before imputation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingCount {
    pub column: String,
    pub missing: usize,
}

/// Output of preparation: the observation table plus the raw missing-value
/// summary for reporting.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub table: ObservationTable,
    pub missing: Vec<MissingCount>,
}

/// Load the input CSV with every column read as text.
pub fn load_raw_table(file_path: &Path) -> crate::Result<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(file_path.to_path_buf()))
        .with_context(|| format!("failed to open {}", file_path.display()))?
        .finish()
        .with_context(|| format!("failed to parse {}", file_path.display()))?;

    info!(rows = df.height(), columns = df.width(), "loaded raw table");
    Ok(df)
}

/// Load a CSV file and recode it into observations.
///
/// # Arguments
/// * `file_path` - Path to the CSV file
/// * `columns` - Source column names for the five variables
///
/// # Returns
/// * `PreparedData` with the observation table and raw missing-value counts
pub fn load_and_prepare(file_path: &Path, columns: &ColumnMap) -> crate::Result<PreparedData> {
    let df = load_raw_table(file_path)?;
    let prepared = prepare_observations(&df, columns)?;
    Ok(prepared)
}

/// Recode a raw table into two-level observations.
///
/// Missing usage values become `No`; `retained` is `Stayed` exactly when the
/// current-period profit is present. The input frame is not modified.
///
/// # Arguments
/// * `df` - Raw table with every source column present
/// * `columns` - Source column names for the five variables
///
/// # Returns
/// * `PreparedData`, or `DataIntegrityError` naming the offending column
pub fn prepare_observations(
    df: &DataFrame,
    columns: &ColumnMap,
) -> Result<PreparedData, DataIntegrityError> {
    if df.height() == 0 {
        return Err(DataIntegrityError::EmptyTable);
    }

    let mut missing = Vec::with_capacity(Variable::COUNT);
    let mut usage = Vec::with_capacity(4);
    for variable in &Variable::ALL[..4] {
        let name = columns.source(*variable);
        let values = text_column(df, name)?;
        missing.push(MissingCount {
            column: name.to_string(),
            missing: values.iter().filter(|v| is_missing(v.as_deref())).count(),
        });
        usage.push(recode_usage(name, &values)?);
    }

    let profit_name = columns.source(Variable::Retained);
    let profit = text_column(df, profit_name)?;
    let retained: Vec<Retention> = profit
        .iter()
        .map(|value| {
            if is_missing(value.as_deref()) {
                Retention::Left
            } else {
                Retention::Stayed
            }
        })
        .collect();
    missing.push(MissingCount {
        column: profit_name.to_string(),
        missing: retained.iter().filter(|r| **r == Retention::Left).count(),
    });

    let rows = (0..df.height())
        .map(|i| Observation {
            online_prior: usage[0][i],
            billpay_prior: usage[1][i],
            online_current: usage[2][i],
            billpay_current: usage[3][i],
            retained: retained[i],
        })
        .collect();
    let table = ObservationTable::new(rows);

    for variable in Variable::ALL {
        let counts = table.level_counts(variable);
        debug!(variable = variable.name(), ?counts, "recoded variable");
    }

    Ok(PreparedData { table, missing })
}

/// Extract a column as optional strings, casting non-text columns.
fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, DataIntegrityError> {
    let column = df
        .column(name)
        .map_err(|_| DataIntegrityError::MissingColumn {
            column: name.to_string(),
        })?;

    let unreadable = |err: PolarsError| DataIntegrityError::Unreadable {
        column: name.to_string(),
        message: err.to_string(),
    };
    let series = column
        .as_materialized_series()
        .cast(&DataType::String)
        .map_err(unreadable)?;
    let values = series.str().map_err(unreadable)?;

    Ok(values
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect())
}

/// Impute missing to `No` and reject anything outside the two levels.
fn recode_usage(column: &str, values: &[Option<String>]) -> Result<Vec<Usage>, DataIntegrityError> {
    values
        .iter()
        .enumerate()
        .map(|(row, value)| {
            let Some(text) = value.as_deref().filter(|text| !is_missing(Some(*text))) else {
                return Ok(Usage::No);
            };
            parse_usage(text).ok_or_else(|| DataIntegrityError::UnexpectedCategory {
                column: column.to_string(),
                row,
                value: text.to_string(),
            })
        })
        .collect()
}

fn is_missing(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(text) => {
            let text = text.trim();
            text.is_empty()
                || text.eq_ignore_ascii_case("na")
                || text.eq_ignore_ascii_case("nan")
                || text.eq_ignore_ascii_case("null")
        }
    }
}

fn parse_usage(text: &str) -> Option<Usage> {
    let text = text.trim();
    match text.to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" => return Some(Usage::Yes),
        "no" | "n" | "false" => return Some(Usage::No),
        _ => {}
    }
    match text.parse::<f64>() {
        Ok(x) if x == 0.0 => Some(Usage::No),
        Ok(x) if x == 1.0 => Some(Usage::Yes),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn frame(columns: &[(&str, Vec<Option<&str>>)]) -> DataFrame {
        DataFrame::new(
            columns
                .iter()
                .map(|(name, values)| Series::new((*name).into(), values.clone()).into())
                .collect(),
        )
        .unwrap()
    }

    fn create_test_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ID,9Profit,9Online,9Billpay,0Profit,0Online,0Billpay").unwrap();
        writeln!(file, "1,21,0,0,-5,0,0").unwrap();
        writeln!(file, "2,-6,1,0,,NA,NA").unwrap();
        writeln!(file, "3,52,0,0,48,1,1").unwrap();
        writeln!(file, "4,310,1,1,232,1,1").unwrap();
        file
    }

    #[test]
    fn test_load_and_prepare() {
        let file = create_test_csv();
        let prepared = load_and_prepare(file.path(), &ColumnMap::default()).unwrap();

        assert_eq!(prepared.table.len(), 4);
        let rows = prepared.table.rows();
        assert_eq!(rows[1].online_prior, Usage::Yes);
        assert_eq!(rows[1].online_current, Usage::No);
        assert_eq!(rows[1].retained, Retention::Left);
        assert_eq!(rows[2].online_current, Usage::Yes);
        assert_eq!(rows[2].retained, Retention::Stayed);
        assert_eq!(rows[3].codes(), [1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_missing_summary_counts_raw_values() {
        let file = create_test_csv();
        let prepared = load_and_prepare(file.path(), &ColumnMap::default()).unwrap();

        let by_column: Vec<(&str, usize)> = prepared
            .missing
            .iter()
            .map(|m| (m.column.as_str(), m.missing))
            .collect();
        assert_eq!(
            by_column,
            vec![("9Online", 0), ("9Billpay", 0), ("0Online", 1), ("0Billpay", 1), ("0Profit", 1)]
        );
    }

    #[test]
    fn test_missing_usage_imputed_to_no() {
        let df = frame(&[
            ("9Online", vec![None, Some("1")]),
            ("9Billpay", vec![Some("NA"), Some("0")]),
            ("0Online", vec![Some(""), Some("yes")]),
            ("0Billpay", vec![None, Some("1.0")]),
            ("0Profit", vec![Some("10"), None]),
        ]);
        let prepared = prepare_observations(&df, &ColumnMap::default()).unwrap();
        let rows = prepared.table.rows();

        assert_eq!(rows[0].codes(), [0, 0, 0, 0, 1]);
        assert_eq!(rows[1].codes(), [1, 0, 1, 1, 0]);
    }

    #[test]
    fn test_single_level_column_stays_two_level() {
        let df = frame(&[
            ("9Online", vec![Some("0"), Some("0"), Some("0")]),
            ("9Billpay", vec![Some("0"), Some("1"), Some("0")]),
            ("0Online", vec![Some("1"), None, Some("0")]),
            ("0Billpay", vec![Some("0"), Some("0"), Some("1")]),
            ("0Profit", vec![Some("1"), Some("2"), None]),
        ]);
        let prepared = prepare_observations(&df, &ColumnMap::default()).unwrap();

        assert_eq!(prepared.table.level_counts(Variable::OnlinePrior), [3, 0]);
        assert_eq!(Variable::OnlinePrior.levels(), ["No", "Yes"]);
    }

    #[test]
    fn test_third_category_rejected() {
        let df = frame(&[
            ("9Online", vec![Some("0"), Some("2")]),
            ("9Billpay", vec![Some("0"), Some("0")]),
            ("0Online", vec![Some("0"), Some("0")]),
            ("0Billpay", vec![Some("0"), Some("0")]),
            ("0Profit", vec![Some("1"), Some("1")]),
        ]);
        let err = prepare_observations(&df, &ColumnMap::default()).unwrap_err();

        assert_eq!(
            err,
            DataIntegrityError::UnexpectedCategory {
                column: "9Online".to_string(),
                row: 1,
                value: "2".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_column_rejected() {
        let df = frame(&[("9Online", vec![Some("0")])]);
        let err = prepare_observations(&df, &ColumnMap::default()).unwrap_err();
        assert_eq!(err.column(), Some("9Billpay"));
    }

    #[test]
    fn test_empty_table_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "9Online,9Billpay,0Online,0Billpay,0Profit").unwrap();
        let df = load_raw_table(file.path()).unwrap();

        let err = prepare_observations(&df, &ColumnMap::default()).unwrap_err();
        assert_eq!(err, DataIntegrityError::EmptyTable);
    }

    #[test]
    fn test_custom_column_map() {
        let df = frame(&[
            ("web_a", vec![Some("1")]),
            ("bill_a", vec![Some("0")]),
            ("web_b", vec![Some("1")]),
            ("bill_b", vec![Some("1")]),
            ("profit_b", vec![Some("3.5")]),
        ]);
        let columns = ColumnMap {
            online_prior: "web_a".to_string(),
            billpay_prior: "bill_a".to_string(),
            online_current: "web_b".to_string(),
            billpay_current: "bill_b".to_string(),
            profit_current: "profit_b".to_string(),
        };
        let prepared = prepare_observations(&df, &columns).unwrap();
        assert_eq!(prepared.table.rows()[0].codes(), [1, 0, 1, 1, 1]);
    }

    fn flag() -> impl Strategy<Value = Option<&'static str>> {
        prop_oneof![Just(None), Just(Some("0")), Just(Some("1")), Just(Some("NA"))]
    }

    proptest! {
        #[test]
        fn prop_every_row_recodes_and_retention_tracks_profit(
            rows in prop::collection::vec(
                (flag(), flag(), flag(), flag(), prop::option::of(Just("42.0"))),
                1..40,
            )
        ) {
            let df = frame(&[
                ("9Online", rows.iter().map(|r| r.0).collect()),
                ("9Billpay", rows.iter().map(|r| r.1).collect()),
                ("0Online", rows.iter().map(|r| r.2).collect()),
                ("0Billpay", rows.iter().map(|r| r.3).collect()),
                ("0Profit", rows.iter().map(|r| r.4).collect()),
            ]);
            let prepared = prepare_observations(&df, &ColumnMap::default()).unwrap();

            prop_assert_eq!(prepared.table.len(), rows.len());
            for (raw, obs) in rows.iter().zip(prepared.table.rows()) {
                prop_assert!(obs.codes().iter().all(|c| *c < 2));
                let stayed = obs.retained == Retention::Stayed;
                prop_assert_eq!(stayed, raw.4.is_some());
                let expect_online = raw.0 == Some("1");
                prop_assert_eq!(obs.online_prior == Usage::Yes, expect_online);
            }
        }
    }
}
