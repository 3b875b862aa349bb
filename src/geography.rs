//! The fixed census geography hierarchy.
//!
//! Levels form a containment chain from the nation down to census blocks.
//! Below the state level every identifier embeds its parent's identifier as a
//! prefix (a tract GEOID is `state(2) + county(3) + tract(6)`), while nation,
//! region, division and state codes stand on their own.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CensusError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum GeographyLevel {
    Nation,
    Region,
    Division,
    State,
    County,
    Tract,
    BlockGroup,
    Block,
}

struct LevelInfo {
    name: &'static str,
    api_name: &'static str,
    parent: Option<GeographyLevel>,
    prefix_parent: Option<GeographyLevel>,
    segment_width: usize,
    width: usize,
}

const LEVELS: [LevelInfo; 8] = [
    LevelInfo {
        name: "nation",
        api_name: "us",
        parent: None,
        prefix_parent: None,
        segment_width: 1,
        width: 1,
    },
    LevelInfo {
        name: "region",
        api_name: "region",
        parent: Some(GeographyLevel::Nation),
        prefix_parent: None,
        segment_width: 1,
        width: 1,
    },
    LevelInfo {
        name: "division",
        api_name: "division",
        parent: Some(GeographyLevel::Region),
        prefix_parent: None,
        segment_width: 1,
        width: 1,
    },
    LevelInfo {
        name: "state",
        api_name: "state",
        parent: Some(GeographyLevel::Division),
        prefix_parent: None,
        segment_width: 2,
        width: 2,
    },
    LevelInfo {
        name: "county",
        api_name: "county",
        parent: Some(GeographyLevel::State),
        prefix_parent: Some(GeographyLevel::State),
        segment_width: 3,
        width: 5,
    },
    LevelInfo {
        name: "tract",
        api_name: "tract",
        parent: Some(GeographyLevel::County),
        prefix_parent: Some(GeographyLevel::County),
        segment_width: 6,
        width: 11,
    },
    LevelInfo {
        name: "block-group",
        api_name: "block group",
        parent: Some(GeographyLevel::Tract),
        prefix_parent: Some(GeographyLevel::Tract),
        segment_width: 1,
        width: 12,
    },
    // A 4-digit block code starts with its block group digit, so a block
    // GEOID is the block group GEOID plus three digits.
    LevelInfo {
        name: "block",
        api_name: "block",
        parent: Some(GeographyLevel::BlockGroup),
        prefix_parent: Some(GeographyLevel::BlockGroup),
        segment_width: 3,
        width: 15,
    },
];

impl GeographyLevel {
    pub const ALL: [GeographyLevel; 8] = [
        GeographyLevel::Nation,
        GeographyLevel::Region,
        GeographyLevel::Division,
        GeographyLevel::State,
        GeographyLevel::County,
        GeographyLevel::Tract,
        GeographyLevel::BlockGroup,
        GeographyLevel::Block,
    ];

    fn info(self) -> &'static LevelInfo {
        &LEVELS[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        self.info().name
    }

    /// Name used in the census API `for`/`in` clauses.
    pub fn api_name(self) -> &'static str {
        self.info().api_name
    }

    pub fn depth(self) -> usize {
        self as usize
    }

    /// True when the identifier carries no inherited prefix.
    pub fn is_self_identifying(self) -> bool {
        self.info().prefix_parent.is_none()
    }
}

impl fmt::Display for GeographyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GeographyLevel {
    type Err = CensusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "nation" | "us" => Ok(GeographyLevel::Nation),
            "region" => Ok(GeographyLevel::Region),
            "division" => Ok(GeographyLevel::Division),
            "state" => Ok(GeographyLevel::State),
            "county" => Ok(GeographyLevel::County),
            "tract" => Ok(GeographyLevel::Tract),
            "block-group" | "bg" => Ok(GeographyLevel::BlockGroup),
            "block" => Ok(GeographyLevel::Block),
            _ => Err(CensusError::InvalidLevel(value.to_string())),
        }
    }
}

/// Containment parent of `level`, `None` for the nation.
pub fn parent_level(level: GeographyLevel) -> Option<GeographyLevel> {
    level.info().parent
}

/// Level whose identifier prefixes identifiers at `level`.
pub fn prefix_parent(level: GeographyLevel) -> Option<GeographyLevel> {
    level.info().prefix_parent
}

/// Containment ancestors of `level`, nearest first.
pub fn ancestors(level: GeographyLevel) -> Vec<GeographyLevel> {
    let mut items = Vec::new();
    let mut current = parent_level(level);
    while let Some(next) = current {
        items.push(next);
        current = parent_level(next);
    }
    items
}

pub fn identifier_width(level: GeographyLevel) -> usize {
    level.info().width
}

pub fn segment_width(level: GeographyLevel) -> usize {
    level.info().segment_width
}

/// Nation, region and division codes must name an entry of the static
/// tables; other levels only need the right number of digits.
pub fn validate_identifier(level: GeographyLevel, id: &str) -> bool {
    match level {
        GeographyLevel::Nation => id == "1",
        GeographyLevel::Region => REGIONS.iter().any(|(code, _)| *code == id),
        GeographyLevel::Division => DIVISIONS.iter().any(|(code, _, _)| *code == id),
        _ => id.len() == identifier_width(level) && id.chars().all(|ch| ch.is_ascii_digit()),
    }
}

pub fn is_prefix_consistent(child_id: &str, parent_id: &str) -> bool {
    !parent_id.is_empty() && child_id.len() > parent_id.len() && child_id.starts_with(parent_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawInstance")]
pub struct GeographyInstance {
    level: GeographyLevel,
    id: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct RawInstance {
    level: GeographyLevel,
    id: String,
    #[serde(default)]
    name: Option<String>,
}

impl TryFrom<RawInstance> for GeographyInstance {
    type Error = CensusError;

    fn try_from(raw: RawInstance) -> Result<Self, Self::Error> {
        Self::new(raw.level, raw.id, raw.name)
    }
}

impl GeographyInstance {
    pub fn new(
        level: GeographyLevel,
        id: impl Into<String>,
        name: Option<String>,
    ) -> Result<Self, CensusError> {
        let id = id.into();
        if !validate_identifier(level, &id) {
            return Err(CensusError::InvalidIdentifier {
                level: level.to_string(),
                id,
            });
        }
        Ok(Self { level, id, name })
    }

    pub fn nation() -> Self {
        Self {
            level: GeographyLevel::Nation,
            id: "1".to_string(),
            name: Some("United States".to_string()),
        }
    }

    /// Builds the child at `level` identified by its own code segment.
    pub fn child(
        &self,
        level: GeographyLevel,
        segment: &str,
        name: Option<String>,
    ) -> Result<Self, CensusError> {
        let id = match prefix_parent(level) {
            Some(prefix) if prefix == self.level => format!("{}{}", self.id, segment),
            Some(_) => {
                return Err(CensusError::InvalidIdentifier {
                    level: level.to_string(),
                    id: format!("{}:{}", self.id, segment),
                });
            }
            None => segment.to_string(),
        };
        Self::new(level, id, name)
    }

    pub fn level(&self) -> GeographyLevel {
        self.level
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Code of this instance as the census API expects it in a `for` clause.
    pub fn api_code(&self) -> &str {
        match self.level {
            GeographyLevel::Block => &self.id[identifier_width(GeographyLevel::Tract)..],
            level => match prefix_parent(level) {
                Some(prefix) => &self.id[identifier_width(prefix)..],
                None => &self.id,
            },
        }
    }
}

impl fmt::Display for GeographyInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}:{} ({})", self.level, self.id, name),
            None => write!(f, "{}:{}", self.level, self.id),
        }
    }
}

/// Splits a GEOID into its `(level, code)` components, outermost first.
pub fn parse_geoid(geoid: &str) -> Result<Vec<(GeographyLevel, String)>, CensusError> {
    let level = [
        GeographyLevel::State,
        GeographyLevel::County,
        GeographyLevel::Tract,
        GeographyLevel::BlockGroup,
        GeographyLevel::Block,
    ]
    .into_iter()
    .find(|level| validate_identifier(*level, geoid))
    .ok_or_else(|| CensusError::InvalidIdentifier {
        level: "geoid".to_string(),
        id: geoid.to_string(),
    })?;

    let mut chain = vec![level];
    let mut current = prefix_parent(level);
    while let Some(next) = current {
        chain.push(next);
        current = prefix_parent(next);
    }
    chain.reverse();

    let mut start = 0;
    let mut parts = Vec::new();
    for level in chain {
        let end = identifier_width(level);
        parts.push((level, geoid[start..end].to_string()));
        start = end;
    }
    Ok(parts)
}

/// Concatenates state, county, tract and block group codes into a GEOID.
pub fn build_geoid(
    state: &str,
    county: Option<&str>,
    tract: Option<&str>,
    block_group: Option<&str>,
) -> String {
    let mut geoid = state.to_string();
    for part in [county, tract, block_group].into_iter().flatten() {
        geoid.push_str(part);
    }
    geoid
}

pub struct StateInfo {
    pub fips: &'static str,
    pub name: &'static str,
    pub abbreviation: &'static str,
    pub division: Option<&'static str>,
}

const fn state(
    fips: &'static str,
    name: &'static str,
    abbreviation: &'static str,
    division: Option<&'static str>,
) -> StateInfo {
    StateInfo {
        fips,
        name,
        abbreviation,
        division,
    }
}

pub const REGIONS: [(&str, &str); 4] = [
    ("1", "Northeast"),
    ("2", "Midwest"),
    ("3", "South"),
    ("4", "West"),
];

/// Census divisions as `(code, name, region)`.
pub const DIVISIONS: [(&str, &str, &str); 9] = [
    ("1", "New England", "1"),
    ("2", "Middle Atlantic", "1"),
    ("3", "East North Central", "2"),
    ("4", "West North Central", "2"),
    ("5", "South Atlantic", "3"),
    ("6", "East South Central", "3"),
    ("7", "West South Central", "3"),
    ("8", "Mountain", "4"),
    ("9", "Pacific", "4"),
];

// Puerto Rico sits outside every region and division.
pub const STATES: [StateInfo; 52] = [
    state("01", "Alabama", "AL", Some("6")),
    state("02", "Alaska", "AK", Some("9")),
    state("04", "Arizona", "AZ", Some("8")),
    state("05", "Arkansas", "AR", Some("7")),
    state("06", "California", "CA", Some("9")),
    state("08", "Colorado", "CO", Some("8")),
    state("09", "Connecticut", "CT", Some("1")),
    state("10", "Delaware", "DE", Some("5")),
    state("11", "District of Columbia", "DC", Some("5")),
    state("12", "Florida", "FL", Some("5")),
    state("13", "Georgia", "GA", Some("5")),
    state("15", "Hawaii", "HI", Some("9")),
    state("16", "Idaho", "ID", Some("8")),
    state("17", "Illinois", "IL", Some("3")),
    state("18", "Indiana", "IN", Some("3")),
    state("19", "Iowa", "IA", Some("4")),
    state("20", "Kansas", "KS", Some("4")),
    state("21", "Kentucky", "KY", Some("6")),
    state("22", "Louisiana", "LA", Some("7")),
    state("23", "Maine", "ME", Some("1")),
    state("24", "Maryland", "MD", Some("5")),
    state("25", "Massachusetts", "MA", Some("1")),
    state("26", "Michigan", "MI", Some("3")),
    state("27", "Minnesota", "MN", Some("4")),
    state("28", "Mississippi", "MS", Some("6")),
    state("29", "Missouri", "MO", Some("4")),
    state("30", "Montana", "MT", Some("8")),
    state("31", "Nebraska", "NE", Some("4")),
    state("32", "Nevada", "NV", Some("8")),
    state("33", "New Hampshire", "NH", Some("1")),
    state("34", "New Jersey", "NJ", Some("2")),
    state("35", "New Mexico", "NM", Some("8")),
    state("36", "New York", "NY", Some("2")),
    state("37", "North Carolina", "NC", Some("5")),
    state("38", "North Dakota", "ND", Some("4")),
    state("39", "Ohio", "OH", Some("3")),
    state("40", "Oklahoma", "OK", Some("7")),
    state("41", "Oregon", "OR", Some("9")),
    state("42", "Pennsylvania", "PA", Some("2")),
    state("44", "Rhode Island", "RI", Some("1")),
    state("45", "South Carolina", "SC", Some("5")),
    state("46", "South Dakota", "SD", Some("4")),
    state("47", "Tennessee", "TN", Some("6")),
    state("48", "Texas", "TX", Some("7")),
    state("49", "Utah", "UT", Some("8")),
    state("50", "Vermont", "VT", Some("1")),
    state("51", "Virginia", "VA", Some("5")),
    state("53", "Washington", "WA", Some("9")),
    state("54", "West Virginia", "WV", Some("5")),
    state("55", "Wisconsin", "WI", Some("3")),
    state("56", "Wyoming", "WY", Some("8")),
    state("72", "Puerto Rico", "PR", None),
];

/// Resolves a state FIPS code, full name or USPS abbreviation to its FIPS code.
pub fn state_fips(value: &str) -> Result<&'static str, CensusError> {
    let trimmed = value.trim();
    STATES
        .iter()
        .find(|state| {
            state.fips == trimmed
                || state.name.eq_ignore_ascii_case(trimmed)
                || state.abbreviation.eq_ignore_ascii_case(trimmed)
        })
        .map(|state| state.fips)
        .ok_or_else(|| CensusError::InvalidIdentifier {
            level: GeographyLevel::State.to_string(),
            id: value.to_string(),
        })
}

fn division_region(division: &str) -> Option<&'static str> {
    DIVISIONS
        .iter()
        .find(|(code, _, _)| *code == division)
        .map(|(_, _, region)| *region)
}

/// Children that follow from the static tables rather than a catalog lookup:
/// regions, divisions and states under any summary-level parent.
pub fn static_children(
    parent: &GeographyInstance,
    child: GeographyLevel,
) -> Option<Vec<GeographyInstance>> {
    let parent_id = parent.id();
    let make = |level: GeographyLevel, id: &str, name: &str| GeographyInstance {
        level,
        id: id.to_string(),
        name: Some(name.to_string()),
    };
    match (parent.level(), child) {
        (GeographyLevel::Nation, GeographyLevel::Region) => Some(
            REGIONS
                .iter()
                .map(|(id, name)| make(child, id, name))
                .collect(),
        ),
        (GeographyLevel::Nation, GeographyLevel::Division) => Some(
            DIVISIONS
                .iter()
                .map(|(id, name, _)| make(child, id, name))
                .collect(),
        ),
        (GeographyLevel::Region, GeographyLevel::Division) => Some(
            DIVISIONS
                .iter()
                .filter(|(_, _, region)| *region == parent_id)
                .map(|(id, name, _)| make(child, id, name))
                .collect(),
        ),
        (GeographyLevel::Nation, GeographyLevel::State) => Some(
            STATES
                .iter()
                .map(|state| make(child, state.fips, state.name))
                .collect(),
        ),
        (GeographyLevel::Region, GeographyLevel::State) => Some(
            STATES
                .iter()
                .filter(|state| {
                    state.division.and_then(division_region) == Some(parent_id)
                })
                .map(|state| make(child, state.fips, state.name))
                .collect(),
        ),
        (GeographyLevel::Division, GeographyLevel::State) => Some(
            STATES
                .iter()
                .filter(|state| state.division == Some(parent_id))
                .map(|state| make(child, state.fips, state.name))
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn widths_follow_prefix_chain() {
        for level in GeographyLevel::ALL {
            if let Some(prefix) = prefix_parent(level) {
                assert_eq!(
                    identifier_width(level),
                    identifier_width(prefix) + segment_width(level),
                    "{level}"
                );
            }
        }
    }

    #[test]
    fn parse_level_names() {
        let level: GeographyLevel = "block group".parse().unwrap();
        assert_eq!(level, GeographyLevel::BlockGroup);
        let err = "zcta".parse::<GeographyLevel>().unwrap_err();
        assert_matches!(err, CensusError::InvalidLevel(_));
    }

    #[test]
    fn block_api_code_includes_block_group_digit() {
        let block = GeographyInstance::new(GeographyLevel::Block, "390490001001012", None).unwrap();
        assert_eq!(block.api_code(), "1012");
        let tract = GeographyInstance::new(GeographyLevel::Tract, "39049000100", None).unwrap();
        assert_eq!(tract.api_code(), "000100");
    }

    #[test]
    fn parse_and_build_geoid() {
        let parts = parse_geoid("390490001001").unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[2], (GeographyLevel::Tract, "000100".to_string()));
        assert_eq!(
            build_geoid("39", Some("049"), Some("000100"), Some("1")),
            "390490001001"
        );
    }

    #[test]
    fn summary_level_codes_must_exist() {
        assert!(validate_identifier(GeographyLevel::Nation, "1"));
        assert!(!validate_identifier(GeographyLevel::Nation, "5"));
        assert!(validate_identifier(GeographyLevel::Region, "4"));
        assert!(!validate_identifier(GeographyLevel::Region, "7"));
        assert!(!validate_identifier(GeographyLevel::Region, "0"));
        assert!(validate_identifier(GeographyLevel::Division, "9"));
        assert!(!validate_identifier(GeographyLevel::Division, "0"));
        assert_matches!(
            GeographyInstance::new(GeographyLevel::Region, "7", None),
            Err(CensusError::InvalidIdentifier { .. })
        );
    }

    #[test]
    fn deserialization_validates_identifiers() {
        let tract: GeographyInstance = serde_json::from_str(
            r#"{"level":"tract","id":"39049000100","name":null}"#,
        )
        .unwrap();
        assert_eq!(tract.api_code(), "000100");

        let short = serde_json::from_str::<GeographyInstance>(r#"{"level":"tract","id":"39"}"#);
        assert!(short.unwrap_err().to_string().contains("invalid tract identifier"));
        let region = serde_json::from_str::<GeographyInstance>(r#"{"level":"region","id":"7"}"#);
        assert!(region.is_err());
    }

    #[test]
    fn states_by_division() {
        let division = GeographyInstance::new(GeographyLevel::Division, "3", None).unwrap();
        let states = static_children(&division, GeographyLevel::State).unwrap();
        let ids: Vec<_> = states.iter().map(|state| state.id()).collect();
        assert_eq!(ids, vec!["17", "18", "26", "39", "55"]);
    }
}
