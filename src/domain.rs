use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::CensusError;

/// Serialized form of [`Value::Undefined`].
pub const UNDEFINED_SENTINEL: &str = "undefined";

static VARIABLE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9]*(_[A-Z0-9]+)*$").expect("valid regex"));

static ESTIMATE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<stem>.+_\d{3})E$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Product {
    Acs5,
    Acs1,
    Decennial,
    Pep,
}

impl Product {
    pub fn as_str(self) -> &'static str {
        match self {
            Product::Acs5 => "acs5",
            Product::Acs1 => "acs1",
            Product::Decennial => "decennial",
            Product::Pep => "pep",
        }
    }

    pub fn is_available(self, year: u16) -> bool {
        match self {
            Product::Acs5 => (2009..=2023).contains(&year),
            // The 2020 1-year release was replaced by experimental estimates.
            Product::Acs1 => (2005..=2023).contains(&year) && year != 2020,
            Product::Decennial => matches!(year, 2000 | 2010 | 2020),
            Product::Pep => (2015..=2019).contains(&year),
        }
    }

    pub fn check_available(self, year: u16) -> Result<(), CensusError> {
        if self.is_available(year) {
            return Ok(());
        }
        Err(CensusError::UnavailableProductYear {
            product: self.to_string(),
            year,
        })
    }

    /// Dataset path below the API root for this product and vintage.
    pub fn endpoint(self, year: u16) -> String {
        match self {
            Product::Acs5 => format!("{year}/acs/acs5"),
            Product::Acs1 => format!("{year}/acs/acs1"),
            Product::Decennial if year == 2020 => format!("{year}/dec/dhc"),
            Product::Decennial => format!("{year}/dec/sf1"),
            Product::Pep => format!("{year}/pep/population"),
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Product {
    type Err = CensusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "acs5" => Ok(Product::Acs5),
            "acs1" => Ok(Product::Acs1),
            "decennial" | "dec" => Ok(Product::Decennial),
            "pep" => Ok(Product::Pep),
            _ => Err(CensusError::Config(format!("unknown product {value}"))),
        }
    }
}

/// Ordered mapping from source variable code to output column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableSpec {
    entries: Vec<(String, String)>,
}

impl VariableSpec {
    pub fn new<I, C, N>(entries: I) -> Result<Self, CensusError>
    where
        I: IntoIterator<Item = (C, N)>,
        C: Into<String>,
        N: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(code, name)| (code.into().trim().to_string(), name.into()))
            .collect::<Vec<_>>();

        let mut codes = HashSet::new();
        let mut names = HashSet::new();
        for (code, name) in &entries {
            if code == "NAME" || !VARIABLE_CODE.is_match(code) {
                return Err(CensusError::InvalidVariableSpec(format!(
                    "malformed code {code}"
                )));
            }
            if !codes.insert(code.as_str()) {
                return Err(CensusError::InvalidVariableSpec(format!(
                    "duplicate code {code}"
                )));
            }
            if name.trim().is_empty() || !names.insert(name.as_str()) {
                return Err(CensusError::InvalidVariableSpec(format!(
                    "duplicate or empty column name {name:?}"
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn from_codes<I, C>(codes: I) -> Result<Self, CensusError>
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        Self::new(codes.into_iter().map(|code| {
            let code = code.into();
            (code.clone(), code)
        }))
    }

    /// Appends the margin-of-error variable for every estimate code.
    pub fn with_margins(self) -> Result<Self, CensusError> {
        let mut entries = self.entries.clone();
        for (code, name) in &self.entries {
            if let Some(captures) = ESTIMATE_CODE.captures(code) {
                let margin = format!("{}M", &captures["stem"]);
                if self.column_for(&margin).is_none() {
                    entries.push((margin, format!("{name}_moe")));
                }
            }
        }
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(code, _)| code.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn column_for(&self, code: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == code)
            .map(|(_, name)| name.as_str())
    }

    pub fn columns(&self) -> Vec<String> {
        self.entries.iter().map(|(_, name)| name.clone()).collect()
    }

    /// Splits into consecutive specs of at most `ceiling` codes each. An
    /// empty spec still yields one (name-only) chunk.
    pub fn chunks(&self, ceiling: usize) -> Vec<VariableSpec> {
        if self.entries.is_empty() {
            return vec![self.clone()];
        }
        self.entries
            .chunks(ceiling.max(1))
            .map(|chunk| VariableSpec {
                entries: chunk.to_vec(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
    Missing,
    Undefined,
}

impl Value {
    pub fn from_json(raw: &serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Value::Missing,
            serde_json::Value::Number(number) => {
                number.as_f64().map(Value::Number).unwrap_or(Value::Missing)
            }
            serde_json::Value::String(text) => Value::Text(text.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Number(value) => serializer.serialize_f64(*value),
            Value::Text(text) => serializer.serialize_str(text),
            Value::Missing => serializer.serialize_none(),
            Value::Undefined => serializer.serialize_str(UNDEFINED_SENTINEL),
        }
    }
}

/// One tabular row keyed by its geography identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub geoid: String,
    pub name: Option<String>,
    pub values: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(geoid: impl Into<String>) -> Self {
        Self {
            geoid: geoid.into(),
            name: None,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, column: impl Into<String>, value: Value) -> Self {
        self.values.insert(column.into(), value);
        self
    }

    pub fn get(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&Value::Missing)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn product_availability() {
        assert!(Product::Acs5.is_available(2022));
        assert!(!Product::Acs5.is_available(2008));
        assert!(!Product::Acs1.is_available(2020));
        assert!(Product::Decennial.is_available(2010));
        assert_matches!(
            Product::Decennial.check_available(2015),
            Err(CensusError::UnavailableProductYear { year: 2015, .. })
        );
    }

    #[test]
    fn decennial_endpoint_by_vintage() {
        assert_eq!(Product::Decennial.endpoint(2020), "2020/dec/dhc");
        assert_eq!(Product::Decennial.endpoint(2010), "2010/dec/sf1");
    }

    #[test]
    fn variable_spec_rejects_duplicates() {
        let err = VariableSpec::from_codes(["B01003_001E", "B01003_001E"]).unwrap_err();
        assert_matches!(err, CensusError::InvalidVariableSpec(_));
        let err = VariableSpec::from_codes(["b01003 001e"]).unwrap_err();
        assert_matches!(err, CensusError::InvalidVariableSpec(_));
    }

    #[test]
    fn margins_follow_estimates() {
        let spec = VariableSpec::new([
            ("B01003_001E", "total_population"),
            ("B19013_001E", "median_household_income"),
        ])
        .unwrap()
        .with_margins()
        .unwrap();
        assert_eq!(spec.len(), 4);
        assert_eq!(spec.column_for("B01003_001M"), Some("total_population_moe"));
        assert_eq!(
            spec.columns().last().map(String::as_str),
            Some("median_household_income_moe")
        );
    }

    #[test]
    fn chunks_preserve_order() {
        let codes = (0..60).map(|i| format!("B01001_{i:03}E"));
        let spec = VariableSpec::from_codes(codes).unwrap();
        let chunks = spec.chunks(50);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 50);
        assert_eq!(chunks[1].codes().next(), Some("B01001_050E"));
    }

    #[test]
    fn undefined_serializes_as_sentinel() {
        let json = serde_json::to_string(&vec![Value::Undefined, Value::Missing]).unwrap();
        assert_eq!(json, r#"["undefined",null]"#);
    }
}
