//! Column-level transformations over a joined record set.
//!
//! [`apply`] runs rename, coercion and derived columns in that order. The
//! remaining helpers (normalization, composite indices, roll-up and change
//! between vintages) are standalone passes a caller chains after it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::domain::Value;
use crate::error::CensusError;
use crate::geography::{GeographyLevel, identifier_width};
use crate::joiner::{JoinedGeometry, JoinedRecord};

/// Census annotation values that stand in for suppressed or unavailable data.
pub const MISSING_CODES: [f64; 6] = [
    -666_666_666.0,
    -999_999_999.0,
    -888_888_888.0,
    -222_222_222.0,
    -333_333_333.0,
    -555_555_555.0,
];

/// Declared column order plus the joined records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSet {
    columns: Vec<String>,
    records: Vec<JoinedRecord>,
}

impl RecordSet {
    pub fn new(columns: Vec<String>, records: Vec<JoinedRecord>) -> Self {
        Self { columns, records }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[JoinedRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<JoinedRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn geometry_absent(&self) -> usize {
        self.records
            .iter()
            .filter(|record| !record.has_geometry())
            .count()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|candidate| candidate == column)
    }

    /// Numeric values of `column`, one per record.
    pub fn numbers(&self, column: &str) -> Result<Vec<Option<f64>>, CensusError> {
        if !self.has_column(column) {
            return Err(CensusError::UnknownColumn(column.to_string()));
        }
        Ok(self
            .records
            .iter()
            .map(|record| record.get(column).as_f64())
            .collect())
    }

    fn push_column(&mut self, column: &str) -> Result<(), CensusError> {
        if self.has_column(column) {
            return Err(CensusError::ColumnCollision(column.to_string()));
        }
        self.columns.push(column.to_string());
        Ok(())
    }
}

type CustomFn = Arc<dyn Fn(&JoinedRecord) -> Value + Send + Sync>;

#[derive(Clone)]
pub enum Derivation {
    /// `numerator / denominator * scale`.
    Ratio {
        numerator: String,
        denominator: String,
        scale: f64,
    },
    Sum(Vec<String>),
    Difference {
        minuend: String,
        subtrahend: String,
    },
    /// `(to - from) / from * 100`.
    PercentChange { from: String, to: String },
    Custom {
        inputs: Vec<String>,
        compute: CustomFn,
    },
}

impl fmt::Debug for Derivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Derivation::Ratio {
                numerator,
                denominator,
                scale,
            } => write!(f, "Ratio({numerator} / {denominator} * {scale})"),
            Derivation::Sum(columns) => write!(f, "Sum({})", columns.join(" + ")),
            Derivation::Difference {
                minuend,
                subtrahend,
            } => write!(f, "Difference({minuend} - {subtrahend})"),
            Derivation::PercentChange { from, to } => write!(f, "PercentChange({from} -> {to})"),
            Derivation::Custom { inputs, .. } => write!(f, "Custom({})", inputs.join(", ")),
        }
    }
}

impl Derivation {
    fn inputs(&self) -> Vec<&str> {
        match self {
            Derivation::Ratio {
                numerator,
                denominator,
                ..
            } => vec![numerator.as_str(), denominator.as_str()],
            Derivation::Sum(columns) => columns.iter().map(String::as_str).collect(),
            Derivation::Difference {
                minuend,
                subtrahend,
            } => vec![minuend.as_str(), subtrahend.as_str()],
            Derivation::PercentChange { from, to } => vec![from.as_str(), to.as_str()],
            Derivation::Custom { inputs, .. } => inputs.iter().map(String::as_str).collect(),
        }
    }

    fn evaluate(&self, record: &JoinedRecord) -> Value {
        let number = |column: &String| record.get(column).as_f64();
        let value = match self {
            Derivation::Ratio {
                numerator,
                denominator,
                scale,
            } => match (number(numerator), number(denominator)) {
                (_, None) | (_, Some(0.0)) => Value::Undefined,
                (None, _) => Value::Missing,
                (Some(n), Some(d)) => Value::Number(n / d * scale),
            },
            Derivation::Sum(columns) => columns
                .iter()
                .map(|column| number(column))
                .sum::<Option<f64>>()
                .map(Value::Number)
                .unwrap_or(Value::Missing),
            Derivation::Difference {
                minuend,
                subtrahend,
            } => match (number(minuend), number(subtrahend)) {
                (Some(a), Some(b)) => Value::Number(a - b),
                _ => Value::Missing,
            },
            Derivation::PercentChange { from, to } => match (number(from), number(to)) {
                (None, _) | (Some(0.0), _) => Value::Undefined,
                (_, None) => Value::Missing,
                (Some(from), Some(to)) => Value::Number((to - from) / from * 100.0),
            },
            Derivation::Custom { compute, .. } => compute(record),
        };
        match value {
            Value::Number(value) if !value.is_finite() => Value::Undefined,
            other => other,
        }
    }
}

/// A named column computed from existing ones.
#[derive(Debug, Clone)]
pub struct DerivedColumn {
    pub name: String,
    pub derivation: Derivation,
}

impl DerivedColumn {
    pub fn new(name: impl Into<String>, derivation: Derivation) -> Self {
        Self {
            name: name.into(),
            derivation,
        }
    }

    pub fn ratio(name: impl Into<String>, numerator: &str, denominator: &str) -> Self {
        Self::scaled_ratio(name, numerator, denominator, 1.0)
    }

    pub fn percentage(name: impl Into<String>, numerator: &str, denominator: &str) -> Self {
        Self::scaled_ratio(name, numerator, denominator, 100.0)
    }

    pub fn scaled_ratio(
        name: impl Into<String>,
        numerator: &str,
        denominator: &str,
        scale: f64,
    ) -> Self {
        Self::new(
            name,
            Derivation::Ratio {
                numerator: numerator.to_string(),
                denominator: denominator.to_string(),
                scale,
            },
        )
    }

    pub fn sum(name: impl Into<String>, columns: &[&str]) -> Self {
        Self::new(
            name,
            Derivation::Sum(columns.iter().map(|column| column.to_string()).collect()),
        )
    }

    pub fn difference(name: impl Into<String>, minuend: &str, subtrahend: &str) -> Self {
        Self::new(
            name,
            Derivation::Difference {
                minuend: minuend.to_string(),
                subtrahend: subtrahend.to_string(),
            },
        )
    }

    pub fn percent_change(name: impl Into<String>, from: &str, to: &str) -> Self {
        Self::new(
            name,
            Derivation::PercentChange {
                from: from.to_string(),
                to: to.to_string(),
            },
        )
    }

    pub fn custom<F>(name: impl Into<String>, inputs: &[&str], compute: F) -> Self
    where
        F: Fn(&JoinedRecord) -> Value + Send + Sync + 'static,
    {
        Self::new(
            name,
            Derivation::Custom {
                inputs: inputs.iter().map(|column| column.to_string()).collect(),
                compute: Arc::new(compute),
            },
        )
    }
}

/// Rename, coercion and derived columns applied as one step.
#[derive(Debug, Clone)]
pub struct Transformer {
    rename: Vec<(String, String)>,
    derived: Vec<DerivedColumn>,
    coerce: bool,
}

impl Default for Transformer {
    fn default() -> Self {
        Self {
            rename: Vec::new(),
            derived: Vec::new(),
            coerce: true,
        }
    }
}

impl Transformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rename.push((from.into(), to.into()));
        self
    }

    pub fn derive(mut self, column: DerivedColumn) -> Self {
        self.derived.push(column);
        self
    }

    pub fn derive_all(mut self, columns: impl IntoIterator<Item = DerivedColumn>) -> Self {
        self.derived.extend(columns);
        self
    }

    pub fn without_coercion(mut self) -> Self {
        self.coerce = false;
        self
    }

    pub fn apply(&self, records: RecordSet) -> Result<RecordSet, CensusError> {
        let renamed = rename_columns(records, &self.rename)?;
        let coerced = if self.coerce {
            coerce_values(renamed)
        } else {
            renamed
        };
        derive_columns(coerced, &self.derived)
    }
}

/// Renames, coerces and derives in one call.
pub fn apply(
    records: RecordSet,
    rename_map: &[(String, String)],
    derived: &[DerivedColumn],
) -> Result<RecordSet, CensusError> {
    Transformer {
        rename: rename_map.to_vec(),
        derived: derived.to_vec(),
        coerce: true,
    }
    .apply(records)
}

pub fn rename_columns(
    mut records: RecordSet,
    rename_map: &[(String, String)],
) -> Result<RecordSet, CensusError> {
    if rename_map.is_empty() {
        return Ok(records);
    }
    let mut mapping = HashMap::new();
    for (from, to) in rename_map {
        if !records.has_column(from) {
            return Err(CensusError::UnknownColumn(from.clone()));
        }
        if mapping.insert(from.as_str(), to.as_str()).is_some() {
            return Err(CensusError::ColumnCollision(format!("{from} renamed twice")));
        }
    }

    let mut targets = HashSet::new();
    let columns = records
        .columns
        .iter()
        .map(|column| {
            let target = mapping.get(column.as_str()).copied().unwrap_or(column.as_str());
            if targets.insert(target) {
                Ok(target.to_string())
            } else {
                Err(CensusError::ColumnCollision(target.to_string()))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    for record in &mut records.records {
        let values = std::mem::take(&mut record.values);
        record.values = values
            .into_iter()
            .map(|(column, value)| match mapping.get(column.as_str()) {
                Some(target) => (target.to_string(), value),
                None => (column, value),
            })
            .collect();
    }
    records.columns = columns;
    Ok(records)
}

/// Normalizes one value: numeric text parses, annotation codes and
/// non-numeric text become missing.
pub fn clean_value(value: Value) -> Value {
    match value {
        Value::Number(number) if !number.is_finite() || MISSING_CODES.contains(&number) => {
            Value::Missing
        }
        Value::Text(text) => match text.trim().parse::<f64>() {
            Ok(number) => clean_value(Value::Number(number)),
            Err(_) => Value::Missing,
        },
        other => other,
    }
}

pub fn coerce_values(mut records: RecordSet) -> RecordSet {
    for record in &mut records.records {
        for value in record.values.values_mut() {
            *value = clean_value(std::mem::replace(value, Value::Missing));
        }
    }
    records
}

pub fn derive_columns(
    mut records: RecordSet,
    derived: &[DerivedColumn],
) -> Result<RecordSet, CensusError> {
    for column in derived {
        for input in column.derivation.inputs() {
            if !records.has_column(input) {
                return Err(CensusError::UnknownColumn(input.to_string()));
            }
        }
        records.push_column(&column.name)?;
        let mut undefined = 0usize;
        for record in &mut records.records {
            let value = column.derivation.evaluate(record);
            if value == Value::Undefined {
                undefined += 1;
            }
            record.values.insert(column.name.clone(), value);
        }
        debug!(column = %column.name, undefined, "derived column");
    }
    Ok(records)
}

/// Common percentages over an ACS profile, for whichever source columns
/// are present.
pub fn demographic_rates(columns: &[String], total_population: &str) -> Vec<DerivedColumn> {
    let has = |column: &str| columns.iter().any(|candidate| candidate == column);
    let mut derived = Vec::new();
    if !has(total_population) {
        return derived;
    }
    for (source, target) in [
        ("white_alone", "pct_white"),
        ("black_alone", "pct_black"),
        ("hispanic_latino", "pct_hispanic"),
        ("below_poverty_level", "poverty_rate"),
    ] {
        if has(source) {
            derived.push(DerivedColumn::percentage(target, source, total_population));
        }
    }
    if has("unemployed") && has("labor_force") {
        derived.push(DerivedColumn::percentage(
            "unemployment_rate",
            "unemployed",
            "labor_force",
        ));
    }
    derived
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Scales to `[0, 1]`.
    MinMax,
    ZScore,
    /// Median-centred, scaled by the interquartile range.
    Robust,
}

/// Appends `output` holding the normalized values of `column`. A zero spread
/// yields `Undefined` for every present value.
pub fn normalize(
    mut records: RecordSet,
    column: &str,
    method: Normalization,
    output: Option<&str>,
) -> Result<RecordSet, CensusError> {
    let output = output
        .map(str::to_string)
        .unwrap_or_else(|| format!("{column}_normalized"));
    let numbers = records.numbers(column)?;
    let mut present = numbers.iter().flatten().copied().collect::<Vec<_>>();
    records.push_column(&output)?;

    let (center, spread) = match method {
        Normalization::MinMax => {
            let min = present.iter().copied().fold(f64::INFINITY, f64::min);
            let max = present.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (min, max - min)
        }
        Normalization::ZScore => {
            let n = present.len() as f64;
            let mean = present.iter().sum::<f64>() / n;
            // Sample standard deviation.
            let variance =
                present.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / (n - 1.0);
            (mean, variance.sqrt())
        }
        Normalization::Robust => {
            present.sort_by(f64::total_cmp);
            let median = quantile(&present, 0.5);
            (median, quantile(&present, 0.75) - quantile(&present, 0.25))
        }
    };

    for (record, number) in records.records.iter_mut().zip(numbers) {
        let value = match number {
            None => Value::Missing,
            Some(_) if spread == 0.0 || !spread.is_finite() => Value::Undefined,
            Some(number) => Value::Number((number - center) / spread),
        };
        record.values.insert(output.clone(), value);
    }
    Ok(records)
}

// Linear interpolation between closest ranks; `sorted` must be ascending.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Mean,
    Min,
    Max,
}

/// Groups records under their ancestor at `level` by GEOID prefix and
/// aggregates every column (`Sum` unless listed in `aggregates`). Missing
/// values are skipped; a group with no present value stays missing.
/// Geometry is dropped.
pub fn rollup(
    records: &RecordSet,
    level: GeographyLevel,
    aggregates: &[(&str, Aggregate)],
) -> Result<RecordSet, CensusError> {
    if level < GeographyLevel::State {
        return Err(CensusError::InvalidLevel(format!(
            "{level} identifiers are not GEOID prefixes"
        )));
    }
    for (column, _) in aggregates {
        if !records.has_column(column) {
            return Err(CensusError::UnknownColumn(column.to_string()));
        }
    }
    let width = identifier_width(level);
    let mut groups: BTreeMap<String, Vec<&JoinedRecord>> = BTreeMap::new();
    for record in &records.records {
        let Some(prefix) = record.geoid.get(..width).filter(|_| record.geoid.len() > width) else {
            return Err(CensusError::InvalidIdentifier {
                level: level.to_string(),
                id: record.geoid.clone(),
            });
        };
        groups.entry(prefix.to_string()).or_default().push(record);
    }

    let rolled = groups
        .into_iter()
        .map(|(geoid, members)| {
            let values = records
                .columns
                .iter()
                .map(|column| {
                    let method = aggregates
                        .iter()
                        .find(|(name, _)| name == column)
                        .map(|(_, method)| *method)
                        .unwrap_or(Aggregate::Sum);
                    let present = members
                        .iter()
                        .filter_map(|record| record.get(column).as_f64())
                        .collect::<Vec<_>>();
                    (column.clone(), aggregate(&present, method))
                })
                .collect();
            JoinedRecord {
                geoid,
                name: None,
                values,
                geometry: JoinedGeometry::Absent,
            }
        })
        .collect();
    Ok(RecordSet::new(records.columns.clone(), rolled))
}

fn aggregate(values: &[f64], method: Aggregate) -> Value {
    if values.is_empty() {
        return Value::Missing;
    }
    let result = match method {
        Aggregate::Sum => values.iter().sum(),
        Aggregate::Mean => values.iter().sum::<f64>() / values.len() as f64,
        Aggregate::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregate::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    };
    Value::Number(result)
}

/// Appends `output`, the weighted sum of `components` with weights scaled to
/// sum to one. With `normalize_components`, each component is first min-max
/// normalized into `{column}_normalized` (an existing column of that name is
/// reused). A missing component makes the index missing; an undefined one
/// makes it undefined.
pub fn composite_index(
    mut records: RecordSet,
    components: &[(&str, f64)],
    output: &str,
    normalize_components: bool,
) -> Result<RecordSet, CensusError> {
    if components.is_empty() {
        return Err(CensusError::Config(format!("index {output} has no components")));
    }
    let total_weight = components.iter().map(|(_, weight)| weight).sum::<f64>();
    if total_weight == 0.0 || !total_weight.is_finite() {
        return Err(CensusError::Config(format!(
            "index {output} weights sum to {total_weight}"
        )));
    }

    let mut inputs = Vec::with_capacity(components.len());
    for (column, weight) in components {
        if !records.has_column(column) {
            return Err(CensusError::UnknownColumn(column.to_string()));
        }
        let input = if normalize_components {
            let normalized = format!("{column}_normalized");
            if !records.has_column(&normalized) {
                records =
                    normalize(records, column, Normalization::MinMax, Some(normalized.as_str()))?;
            }
            normalized
        } else {
            column.to_string()
        };
        inputs.push((input, weight / total_weight));
    }
    records.push_column(output)?;

    for record in &mut records.records {
        let mut index = Some(0.0);
        let mut undefined = false;
        for (input, weight) in &inputs {
            match record.get(input) {
                Value::Undefined => undefined = true,
                value => {
                    index = index.zip(value.as_f64()).map(|(sum, value)| sum + value * weight);
                }
            }
        }
        let value = match index {
            _ if undefined => Value::Undefined,
            Some(index) if index.is_finite() => Value::Number(index),
            Some(_) => Value::Undefined,
            None => Value::Missing,
        };
        record.values.insert(output.to_string(), value);
    }
    debug!(index = output, components = inputs.len(), "composite index");
    Ok(records)
}

/// Compares `column` between two vintages of the same geographies.
///
/// Records are inner-joined by GEOID in `earlier` order. The result carries
/// `{column}_t1`, `{column}_t2`, `{column}_change` and `{column}_pct_change`,
/// with the name and geometry of the later record. Percent change follows the
/// ratio policy: a missing or zero earlier value is undefined.
pub fn change_between(
    earlier: &RecordSet,
    later: &RecordSet,
    column: &str,
) -> Result<RecordSet, CensusError> {
    for records in [earlier, later] {
        if !records.has_column(column) {
            return Err(CensusError::UnknownColumn(column.to_string()));
        }
    }
    let mut index = HashMap::new();
    for record in &later.records {
        if index.insert(record.geoid.as_str(), record).is_some() {
            return Err(CensusError::DuplicateJoinKey(record.geoid.clone()));
        }
    }

    let from = format!("{column}_t1");
    let to = format!("{column}_t2");
    let mut seen = HashSet::new();
    let mut joined = Vec::new();
    for record in &earlier.records {
        if !seen.insert(record.geoid.as_str()) {
            return Err(CensusError::DuplicateJoinKey(record.geoid.clone()));
        }
        let Some(current) = index.get(record.geoid.as_str()) else {
            continue;
        };
        joined.push(JoinedRecord {
            geoid: record.geoid.clone(),
            name: current.name.clone().or_else(|| record.name.clone()),
            values: BTreeMap::from([
                (from.clone(), record.get(column).clone()),
                (to.clone(), current.get(column).clone()),
            ]),
            geometry: current.geometry.clone(),
        });
    }
    debug!(
        column,
        earlier = earlier.len(),
        later = later.len(),
        matched = joined.len(),
        "change between vintages"
    );

    derive_columns(
        RecordSet::new(vec![from.clone(), to.clone()], joined),
        &[
            DerivedColumn::difference(format!("{column}_change"), &to, &from),
            DerivedColumn::percent_change(format!("{column}_pct_change"), &from, &to),
        ],
    )
}
