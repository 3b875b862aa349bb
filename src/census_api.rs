use std::collections::BTreeMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::domain::{Product, Row, Value, VariableSpec};
use crate::error::CensusError;
use crate::fetcher::backoff_delay;
use crate::geography::{GeographyInstance, GeographyLevel};
use crate::source::{GeographyCatalog, GeographyFilter, SourceError, StatisticsSource};

pub const DEFAULT_BASE_URL: &str = "https://api.census.gov/data";

/// Geography columns the API appends to every table, outermost first.
const GEO_COLUMNS: [&str; 8] = [
    "us",
    "region",
    "division",
    "state",
    "county",
    "tract",
    "block group",
    "block",
];

const ENUMERATION_RETRIES: usize = 2;

/// One entry of a dataset's variable dictionary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableInfo {
    #[serde(default, rename = "name")]
    pub code: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub concept: Option<String>,
    #[serde(default)]
    pub predicate_type: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VariableDictionary {
    variables: BTreeMap<String, VariableInfo>,
}

/// Blocking client for the census data API.
pub struct CensusApiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl CensusApiClient {
    pub fn new() -> Result<Self, CensusError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("census-etl/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CensusError::Config(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| CensusError::Config(err.to_string()))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            min_interval: Duration::ZERO,
            last_request: Mutex::new(None),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Spaces consecutive requests at least `interval` apart across threads.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn dataset_url(&self, product: Product, year: u16) -> String {
        format!("{}/{}", self.base_url, product.endpoint(year))
    }

    pub fn variable_url(&self, product: Product, year: u16, code: Option<&str>) -> String {
        match code {
            Some(code) => format!("{}/variables/{code}.json", self.dataset_url(product, year)),
            None => format!("{}/variables.json", self.dataset_url(product, year)),
        }
    }

    /// Label, concept and type of one variable code.
    pub fn variable_metadata(
        &self,
        product: Product,
        year: u16,
        code: &str,
    ) -> Result<VariableInfo, CensusError> {
        product.check_available(year)?;
        let url = self.variable_url(product, year, Some(code));
        let mut info: VariableInfo = self.get_json(&url).map_err(|err| match err {
            SourceError::InvalidGeography(_) => CensusError::InvalidVariableSpec(format!(
                "unknown variable {code} in {product} {year}"
            )),
            other => CensusError::VariableLookup(format!("{code}: {other}")),
        })?;
        if info.code.is_empty() {
            info.code = code.to_string();
        }
        Ok(info)
    }

    /// Variables whose label or concept contains `keyword`, ignoring case,
    /// ordered by code.
    pub fn search_variables(
        &self,
        product: Product,
        year: u16,
        keyword: &str,
    ) -> Result<Vec<VariableInfo>, CensusError> {
        product.check_available(year)?;
        let url = self.variable_url(product, year, None);
        let dictionary: VariableDictionary = self
            .get_json(&url)
            .map_err(|err| CensusError::VariableLookup(format!("{product} {year}: {err}")))?;
        let matches = search_dictionary(dictionary.variables, keyword);
        debug!(keyword, matches = matches.len(), "variable search");
        Ok(matches)
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SourceError> {
        self.throttle();
        debug!(url = %url, "census api request");
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key)]);
        }
        let response = request.send().map_err(|err| SourceError::Transport {
            status: None,
            message: err.to_string(),
        })?;
        let status = response.status().as_u16();
        match status {
            404 => return Err(SourceError::InvalidGeography(url.to_string())),
            429 => return Err(SourceError::RateLimited),
            200..=299 => {}
            _ => {
                return Err(SourceError::Transport {
                    status: Some(status),
                    message: response.text().unwrap_or_default(),
                });
            }
        }
        response.json().map_err(|err| SourceError::Transport {
            status: Some(status),
            message: format!("unreadable census api payload: {err}"),
        })
    }

    fn throttle(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let Ok(mut last) = self.last_request.lock() else {
            return;
        };
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                thread::sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    fn get_table(
        &self,
        product: Product,
        year: u16,
        columns: &[&str],
        filter: &GeographyFilter,
    ) -> Result<Vec<Vec<JsonValue>>, SourceError> {
        let url = self.dataset_url(product, year);
        let params = query_params(columns, filter, self.api_key.as_deref());
        self.throttle();
        debug!(url = %url, r#for = %filter.for_clause(), "census api request");

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .map_err(|err| SourceError::Transport {
                status: None,
                message: err.to_string(),
            })?;
        let status = response.status().as_u16();
        match status {
            204 | 404 => {
                return Err(SourceError::InvalidGeography(format!(
                    "no data for {} {}",
                    filter.for_clause(),
                    filter.in_clause().unwrap_or_default()
                )));
            }
            429 => return Err(SourceError::RateLimited),
            400 => {
                let message = response.text().unwrap_or_default();
                return Err(SourceError::InvalidVariable(message.trim().to_string()));
            }
            200..=299 => {}
            _ => {
                let message = response
                    .text()
                    .unwrap_or_else(|_| "census api request failed".to_string());
                return Err(SourceError::Transport {
                    status: Some(status),
                    message,
                });
            }
        }
        response.json().map_err(|err| SourceError::Transport {
            status: Some(status),
            message: format!("unreadable census api payload: {err}"),
        })
    }
}

impl StatisticsSource for CensusApiClient {
    fn fetch(
        &self,
        product: Product,
        year: u16,
        variables: &VariableSpec,
        filter: &GeographyFilter,
    ) -> Result<Vec<Row>, SourceError> {
        let mut columns = vec!["NAME"];
        columns.extend(variables.codes());
        let table = self.get_table(product, year, &columns, filter)?;
        parse_table(&table, variables)
    }
}

impl GeographyCatalog for CensusApiClient {
    fn enumerate_children(
        &self,
        parent: &GeographyInstance,
        child_level: GeographyLevel,
        year: u16,
    ) -> Result<Vec<(String, Option<String>)>, SourceError> {
        let filter = GeographyFilter::children_of(parent, child_level);
        let product = catalog_product(year);
        let empty = VariableSpec::default();
        let mut attempt = 0usize;
        let rows = loop {
            match self
                .get_table(product, year, &["NAME"], &filter)
                .and_then(|table| parse_table(&table, &empty))
            {
                Ok(rows) => break rows,
                // A parent without children answers 204.
                Err(SourceError::InvalidGeography(_)) => break Vec::new(),
                Err(err) if err.is_transient() && attempt < ENUMERATION_RETRIES => {
                    thread::sleep(backoff_delay(
                        Duration::from_millis(500),
                        Duration::from_secs(5),
                        attempt,
                    ));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };
        Ok(rows.into_iter().map(|row| (row.geoid, row.name)).collect())
    }
}

/// Dataset used to list geographies for a vintage.
fn catalog_product(year: u16) -> Product {
    [Product::Acs5, Product::Decennial, Product::Acs1, Product::Pep]
        .into_iter()
        .find(|product| product.is_available(year))
        .unwrap_or(Product::Acs5)
}

fn search_dictionary(
    variables: BTreeMap<String, VariableInfo>,
    keyword: &str,
) -> Vec<VariableInfo> {
    let keyword = keyword.to_lowercase();
    variables
        .into_iter()
        .filter(|(_, info)| {
            info.label.to_lowercase().contains(&keyword)
                || info
                    .concept
                    .as_deref()
                    .is_some_and(|concept| concept.to_lowercase().contains(&keyword))
        })
        .map(|(code, mut info)| {
            info.code = code;
            info
        })
        .collect()
}

pub fn query_params(
    columns: &[&str],
    filter: &GeographyFilter,
    api_key: Option<&str>,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("get".to_string(), columns.join(",")),
        ("for".to_string(), filter.for_clause()),
    ];
    if let Some(within) = filter.in_clause() {
        params.push(("in".to_string(), within));
    }
    if let Some(key) = api_key {
        params.push(("key".to_string(), key.to_string()));
    }
    params
}

/// Converts the API's header-first array of arrays into rows keyed by GEOID,
/// with values keyed by variable code.
pub fn parse_table(
    table: &[Vec<JsonValue>],
    variables: &VariableSpec,
) -> Result<Vec<Row>, SourceError> {
    let Some((header, body)) = table.split_first() else {
        return Ok(Vec::new());
    };
    let header = header
        .iter()
        .map(|cell| cell.as_str().unwrap_or_default())
        .collect::<Vec<_>>();
    let position = |column: &str| header.iter().position(|name| *name == column);

    let mut geo_positions = GEO_COLUMNS
        .iter()
        .filter_map(|column| position(column).map(|index| (*column, index)))
        .collect::<Vec<_>>();
    // Block codes already carry their block group digit.
    if geo_positions.iter().any(|(column, _)| *column == "block") {
        geo_positions.retain(|(column, _)| *column != "block group");
    }
    if geo_positions.is_empty() {
        return Err(SourceError::Transport {
            status: Some(200),
            message: "census api response has no geography columns".to_string(),
        });
    }
    let name_position = position("NAME");
    let value_positions = variables
        .codes()
        .map(|code| (code.to_string(), position(code)))
        .collect::<Vec<_>>();

    let rows = body
        .iter()
        .map(|cells| {
            let geoid = geo_positions
                .iter()
                .map(|(_, index)| cells.get(*index).and_then(JsonValue::as_str).unwrap_or(""))
                .collect::<String>();
            let name = name_position
                .and_then(|index| cells.get(index))
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            let values = value_positions
                .iter()
                .map(|(code, index)| {
                    let value = index
                        .and_then(|index| cells.get(index))
                        .map(Value::from_json)
                        .unwrap_or(Value::Missing);
                    (code.clone(), value)
                })
                .collect();
            Row {
                geoid,
                name,
                values,
            }
        })
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn table(value: JsonValue) -> Vec<Vec<JsonValue>> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_county_table() {
        let spec = VariableSpec::from_codes(["B01003_001E"]).unwrap();
        let rows = parse_table(
            &table(json!([
                ["NAME", "B01003_001E", "state", "county"],
                ["Franklin County, Ohio", "1321414", "39", "049"],
                ["Adams County, Ohio", null, "39", "001"]
            ])),
            &spec,
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].geoid, "39049");
        assert_eq!(rows[0].name.as_deref(), Some("Franklin County, Ohio"));
        assert_eq!(rows[0].get("B01003_001E"), &Value::Text("1321414".to_string()));
        assert_eq!(rows[1].get("B01003_001E"), &Value::Missing);
    }

    #[test]
    fn block_geoid_skips_block_group_column() {
        let rows = parse_table(
            &table(json!([
                ["NAME", "state", "county", "tract", "block group", "block"],
                ["Block 1012", "39", "049", "000100", "1", "1012"]
            ])),
            &VariableSpec::default(),
        )
        .unwrap();
        assert_eq!(rows[0].geoid, "390490001001012");
    }

    #[test]
    fn query_includes_in_clause_and_key() {
        let tract =
            GeographyInstance::new(GeographyLevel::Tract, "39049000100", None).unwrap();
        let params = query_params(
            &["NAME", "B01003_001E"],
            &GeographyFilter::for_instance(&tract),
            Some("secret"),
        );
        assert_eq!(
            params,
            vec![
                ("get".to_string(), "NAME,B01003_001E".to_string()),
                ("for".to_string(), "tract:000100".to_string()),
                ("in".to_string(), "state:39 county:049".to_string()),
                ("key".to_string(), "secret".to_string()),
            ]
        );
    }

    #[test]
    fn variable_urls() {
        let client = CensusApiClient::new()
            .unwrap()
            .with_base_url("http://localhost/data/");
        assert_eq!(
            client.variable_url(Product::Acs5, 2022, Some("B01003_001E")),
            format!(
                "http://localhost/data/{}/variables/B01003_001E.json",
                Product::Acs5.endpoint(2022)
            )
        );
        assert!(client.variable_url(Product::Acs5, 2022, None).ends_with("/variables.json"));
    }

    #[test]
    fn search_matches_label_or_concept() {
        let dictionary: VariableDictionary = serde_json::from_value(json!({
            "variables": {
                "B19013_001E": {
                    "label": "Estimate!!Median household income in the past 12 months",
                    "concept": "MEDIAN HOUSEHOLD INCOME",
                    "predicateType": "int",
                    "group": "B19013"
                },
                "B01003_001E": {
                    "label": "Estimate!!Total",
                    "concept": "TOTAL POPULATION",
                    "predicateType": "int",
                    "group": "B01003"
                },
                "B19301_001E": {
                    "label": "Estimate!!Per capita income",
                    "group": "B19301"
                },
                "for": {"label": "Census API FIPS 'for' clause"}
            }
        }))
        .unwrap();

        let found = search_dictionary(dictionary.variables, "Income");
        let codes: Vec<_> = found.iter().map(|info| info.code.as_str()).collect();
        assert_eq!(codes, vec!["B19013_001E", "B19301_001E"]);
        assert_eq!(found[0].predicate_type.as_deref(), Some("int"));
        assert_eq!(found[1].concept, None);
    }

    #[test]
    fn metadata_payload_parses() {
        let info: VariableInfo = serde_json::from_value(json!({
            "name": "B01003_001E",
            "label": "Estimate!!Total",
            "concept": "TOTAL POPULATION",
            "predicateType": "int",
            "group": "B01003",
            "limit": 0
        }))
        .unwrap();
        assert_eq!(info.code, "B01003_001E");
        assert_eq!(info.group.as_deref(), Some("B01003"));
    }

    #[test]
    fn catalog_prefers_five_year() {
        assert_eq!(catalog_product(2022), Product::Acs5);
        assert_eq!(catalog_product(2000), Product::Decennial);
    }
}
