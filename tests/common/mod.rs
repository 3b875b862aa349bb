#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use tempfile::TempDir;

use census_etl::boundaries::{BoundaryFeature, GeometrySource};
use census_etl::domain::{Product, Row, Value, VariableSpec};
use census_etl::fetcher::CancelFlag;
use census_etl::geography::{GeographyInstance, GeographyLevel};
use census_etl::geometry::{Crs, Geometry};
use census_etl::source::{GeographyCatalog, GeographyFilter, SourceError, StatisticsSource};
use census_etl::store::BoundaryCache;

/// Ohio's 88 county codes: the odd numbers 001 through 175.
pub fn ohio_county_codes() -> Vec<String> {
    (1..=175).step_by(2).map(|code| format!("{code:03}")).collect()
}

pub fn temp_cache() -> (TempDir, BoundaryCache) {
    let temp = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, BoundaryCache::with_root(root))
}

pub fn county(geoid: &str) -> GeographyInstance {
    GeographyInstance::new(GeographyLevel::County, geoid, None).unwrap()
}

pub fn codes(count: usize) -> VariableSpec {
    VariableSpec::from_codes((1..=count).map(|i| format!("B01001_{i:03}E"))).unwrap()
}

#[derive(Default)]
pub struct MockCatalog {
    children: HashMap<(String, GeographyLevel), Vec<(String, Option<String>)>>,
    pub calls: Mutex<usize>,
}

impl MockCatalog {
    /// Ohio with all 88 counties and three tracts in Franklin County.
    pub fn ohio() -> Self {
        let mut catalog = Self::default();
        // Listed in reverse to exercise resolver ordering.
        let counties = ohio_county_codes()
            .into_iter()
            .rev()
            .map(|code| (format!("39{code}"), Some(format!("County {code}, Ohio"))))
            .collect();
        catalog
            .children
            .insert(("39".to_string(), GeographyLevel::County), counties);
        catalog.children.insert(
            ("39049".to_string(), GeographyLevel::Tract),
            vec![
                ("39049000300".to_string(), None),
                ("39049000100".to_string(), None),
                ("39049000200".to_string(), None),
            ],
        );
        catalog
    }

    pub fn with_children(
        mut self,
        parent: &str,
        level: GeographyLevel,
        children: &[&str],
    ) -> Self {
        self.children.insert(
            (parent.to_string(), level),
            children.iter().map(|id| (id.to_string(), None)).collect(),
        );
        self
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl GeographyCatalog for MockCatalog {
    fn enumerate_children(
        &self,
        parent: &GeographyInstance,
        child_level: GeographyLevel,
        _year: u16,
    ) -> Result<Vec<(String, Option<String>)>, SourceError> {
        *self.calls.lock().unwrap() += 1;
        Ok(self
            .children
            .get(&(parent.id().to_string(), child_level))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Fails transiently on the first `n` attempts, then succeeds.
    FailTimes(usize),
    AlwaysTransient,
    InvalidVariable,
    InvalidGeography,
}

#[derive(Default)]
pub struct MockSource {
    scripts: HashMap<String, Script>,
    overrides: HashMap<(String, String), Value>,
    stagger: bool,
    cancel_after: Option<(usize, CancelFlag)>,
    pub calls: Mutex<Vec<(String, usize)>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, geoid: &str, script: Script) -> Self {
        self.scripts.insert(geoid.to_string(), script);
        self
    }

    pub fn with_value(mut self, geoid: &str, code: &str, value: Value) -> Self {
        self.overrides
            .insert((geoid.to_string(), code.to_string()), value);
        self
    }

    /// Sleeps a geoid-dependent few milliseconds so completions interleave.
    pub fn staggered(mut self) -> Self {
        self.stagger = true;
        self
    }

    /// Sets `cancel` while serving call number `calls`; that call still
    /// completes normally.
    pub fn with_cancel_after(mut self, calls: usize, cancel: CancelFlag) -> Self {
        self.cancel_after = Some((calls, cancel));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, geoid: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == geoid)
            .count()
    }

    pub fn chunk_sizes_for(&self, geoid: &str) -> Vec<usize> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == geoid)
            .map(|(_, size)| *size)
            .collect()
    }
}

pub fn geoid_of(filter: &GeographyFilter) -> String {
    filter
        .within
        .iter()
        .map(|(_, code)| code.as_str())
        .chain([filter.code.as_str()])
        .collect()
}

impl StatisticsSource for MockSource {
    fn fetch(
        &self,
        _product: Product,
        _year: u16,
        variables: &VariableSpec,
        filter: &GeographyFilter,
    ) -> Result<Vec<Row>, SourceError> {
        let geoid = geoid_of(filter);
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((geoid.clone(), variables.len()));
            if let Some((after, cancel)) = &self.cancel_after {
                if calls.len() >= *after {
                    cancel.cancel();
                }
            }
            calls.iter().filter(|(id, _)| *id == geoid).count()
        };
        if self.stagger {
            let spread = geoid.bytes().map(u64::from).sum::<u64>() % 7;
            thread::sleep(Duration::from_millis(spread));
        }
        match self.scripts.get(&geoid) {
            Some(Script::FailTimes(n)) if attempt <= *n => {
                return Err(SourceError::Transport {
                    status: Some(503),
                    message: "service unavailable".to_string(),
                });
            }
            Some(Script::AlwaysTransient) => return Err(SourceError::RateLimited),
            Some(Script::InvalidVariable) => {
                return Err(SourceError::InvalidVariable("unknown variable".to_string()));
            }
            Some(Script::InvalidGeography) => {
                return Err(SourceError::InvalidGeography(geoid));
            }
            _ => {}
        }

        let mut row = Row::new(geoid.clone());
        row.name = Some(format!("Area {geoid}"));
        for code in variables.codes() {
            let value = self
                .overrides
                .get(&(geoid.clone(), code.to_string()))
                .cloned()
                .unwrap_or(Value::Text("10".to_string()));
            row.values.insert(code.to_string(), value);
        }
        Ok(vec![row])
    }
}

pub fn square(geoid: &str, crs: Crs) -> BoundaryFeature {
    BoundaryFeature {
        geoid: geoid.to_string(),
        name: Some(format!("Boundary {geoid}")),
        geometry: Geometry::Polygon(vec![vec![
            [-83.0, 40.0],
            [-82.9, 40.0],
            [-82.9, 40.1],
            [-83.0, 40.1],
            [-83.0, 40.0],
        ]]),
        crs,
    }
}

#[derive(Default)]
pub struct MockGeometry {
    features: HashMap<(GeographyLevel, u16), Vec<BoundaryFeature>>,
    delay: Option<Duration>,
    pub calls: Mutex<usize>,
}

impl MockGeometry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_features(mut self, level: GeographyLevel, year: u16, geoids: &[&str]) -> Self {
        self.features.insert(
            (level, year),
            geoids.iter().map(|geoid| square(geoid, Crs::NAD83)).collect(),
        );
        self
    }

    pub fn with_feature_list(
        mut self,
        level: GeographyLevel,
        year: u16,
        features: Vec<BoundaryFeature>,
    ) -> Self {
        self.features.insert((level, year), features);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl GeometrySource for MockGeometry {
    fn fetch_geometry(
        &self,
        level: GeographyLevel,
        year: u16,
    ) -> Result<Vec<BoundaryFeature>, SourceError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        Ok(self
            .features
            .get(&(level, year))
            .cloned()
            .unwrap_or_default())
    }
}
