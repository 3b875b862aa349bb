use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::{debug, info};

use crate::domain::Product;
use crate::error::CensusError;
use crate::geography::{
    GeographyInstance, GeographyLevel, ancestors, is_prefix_consistent, segment_width, state_fips,
    static_children, validate_identifier,
};
use crate::source::GeographyCatalog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeValue {
    Explicit(String),
    Wildcard,
}

impl fmt::Display for ScopeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeValue::Explicit(code) => write!(f, "{code}"),
            ScopeValue::Wildcard => write!(f, "*"),
        }
    }
}

/// Explicit-or-wildcard constraints on the levels above a target level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    constraints: BTreeMap<GeographyLevel, ScopeValue>,
}

impl ScopeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a constraint; `*` is a wildcard and state names or USPS
    /// abbreviations are normalized to FIPS codes.
    pub fn with(mut self, level: GeographyLevel, value: &str) -> Result<Self, CensusError> {
        let value = value.trim();
        let scope_value = if value == "*" {
            ScopeValue::Wildcard
        } else if level == GeographyLevel::State {
            ScopeValue::Explicit(state_fips(value)?.to_string())
        } else {
            ScopeValue::Explicit(value.to_string())
        };
        self.constraints.insert(level, scope_value);
        Ok(self)
    }

    pub fn get(&self, level: GeographyLevel) -> Option<&ScopeValue> {
        self.constraints.get(&level)
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (GeographyLevel, &ScopeValue)> {
        self.constraints.iter().map(|(level, value)| (*level, value))
    }
}

impl fmt::Display for ScopeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .iter()
            .map(|(level, value)| format!("{level}={value}"))
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join(" "))
    }
}

/// Parses `state=39 county=*` (whitespace or comma separated).
impl FromStr for ScopeFilter {
    type Err = CensusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut filter = ScopeFilter::new();
        for part in value
            .split(|ch: char| ch == ',' || ch.is_whitespace())
            .filter(|part| !part.is_empty())
        {
            let (level, code) = part
                .split_once(['=', ':'])
                .ok_or_else(|| CensusError::ScopeGap {
                    level: part.to_string(),
                    reason: "expected level=value".to_string(),
                })?;
            filter = filter.with(level.parse()?, code)?;
        }
        Ok(filter)
    }
}

/// Validated, gap-free expansion order: one step per constrained or implied
/// ancestor level, outermost first.
pub fn plan_scope(
    target: GeographyLevel,
    scope: &ScopeFilter,
) -> Result<Vec<(GeographyLevel, ScopeValue)>, CensusError> {
    for (level, _) in scope.iter() {
        if level >= target {
            return Err(CensusError::ScopeGap {
                level: level.to_string(),
                reason: format!("scope may only constrain levels above {target}"),
            });
        }
    }

    let mut chain = ancestors(target);
    chain.reverse();

    let constrained = chain
        .iter()
        .enumerate()
        .filter(|(_, level)| scope.get(**level).is_some())
        .map(|(index, _)| index)
        .collect::<Vec<_>>();

    let (top, bottom) = match (constrained.first(), constrained.last()) {
        (Some(top), Some(bottom)) => (*top, *bottom),
        _ if target.is_self_identifying() => return Ok(Vec::new()),
        _ => {
            let start = chain
                .iter()
                .position(|level| *level == GeographyLevel::State)
                .unwrap_or(chain.len());
            return Ok(chain[start..]
                .iter()
                .map(|level| (*level, ScopeValue::Wildcard))
                .collect());
        }
    };

    if !chain[top].is_self_identifying() {
        return Err(CensusError::ScopeGap {
            level: chain[top].to_string(),
            reason: "code is only unique within its parent, which is unconstrained".to_string(),
        });
    }

    let mut steps = Vec::new();
    let mut seen_wildcard = false;
    for (index, level) in chain.iter().enumerate().skip(top) {
        let value = match scope.get(*level) {
            Some(value) => value.clone(),
            None if index < bottom => {
                return Err(CensusError::ScopeGap {
                    level: level.to_string(),
                    reason: "missing between constrained levels".to_string(),
                });
            }
            None => ScopeValue::Wildcard,
        };
        match &value {
            ScopeValue::Wildcard => seen_wildcard = true,
            ScopeValue::Explicit(_) if seen_wildcard => {
                return Err(CensusError::ScopeGap {
                    level: level.to_string(),
                    reason: "explicit value below a wildcard".to_string(),
                });
            }
            ScopeValue::Explicit(code) => validate_segment(*level, code)?,
        }
        if *level != GeographyLevel::Nation {
            steps.push((*level, value));
        }
    }
    Ok(steps)
}

fn validate_segment(level: GeographyLevel, code: &str) -> Result<(), CensusError> {
    let valid = if level.is_self_identifying() {
        validate_identifier(level, code)
    } else {
        code.len() == segment_width(level) && code.chars().all(|ch| ch.is_ascii_digit())
    };
    if valid {
        Ok(())
    } else {
        Err(CensusError::InvalidIdentifier {
            level: level.to_string(),
            id: code.to_string(),
        })
    }
}

pub struct RequestResolver<C: GeographyCatalog> {
    catalog: C,
}

impl<C: GeographyCatalog> RequestResolver<C> {
    pub fn new(catalog: C) -> Self {
        Self { catalog }
    }

    pub fn resolve(
        &self,
        level: GeographyLevel,
        scope: &ScopeFilter,
        product: Product,
        year: u16,
    ) -> Result<Vec<GeographyInstance>, CensusError> {
        product.check_available(year)?;
        let steps = plan_scope(level, scope)?;

        let mut parents = vec![GeographyInstance::nation()];
        if level == GeographyLevel::Nation {
            return Ok(parents);
        }
        for (step_level, value) in &steps {
            parents = self.expand(&parents, *step_level, value, year)?;
            debug!(level = %step_level, count = parents.len(), "expanded scope level");
        }
        let instances = self.expand(&parents, level, &ScopeValue::Wildcard, year)?;
        info!(
            level = %level,
            product = %product,
            year,
            instances = instances.len(),
            "resolved scope"
        );
        Ok(instances)
    }

    fn expand(
        &self,
        parents: &[GeographyInstance],
        level: GeographyLevel,
        value: &ScopeValue,
        year: u16,
    ) -> Result<Vec<GeographyInstance>, CensusError> {
        let mut expanded = Vec::new();
        for parent in parents {
            match value {
                ScopeValue::Wildcard => expanded.extend(self.children(parent, level, year)?),
                ScopeValue::Explicit(code) => {
                    // Summary-level containment is checked against the static
                    // tables; an explicit state outside its division matches nothing.
                    if let Some(known) = static_children(parent, level) {
                        expanded.extend(known.into_iter().filter(|child| child.id() == code));
                    } else {
                        expanded.push(parent.child(level, code, None)?);
                    }
                }
            }
        }
        Ok(expanded)
    }

    fn children(
        &self,
        parent: &GeographyInstance,
        level: GeographyLevel,
        year: u16,
    ) -> Result<Vec<GeographyInstance>, CensusError> {
        if let Some(children) = static_children(parent, level) {
            return Ok(children);
        }
        let pairs = self
            .catalog
            .enumerate_children(parent, level, year)
            .map_err(|err| CensusError::Enumeration {
                level: level.to_string(),
                parent: parent.id().to_string(),
                message: err.to_string(),
            })?;

        let mut children = pairs
            .into_iter()
            .map(|(id, name)| GeographyInstance::new(level, id, name))
            .collect::<Result<Vec<_>, CensusError>>()?;
        children.retain(|child| {
            level.is_self_identifying() || is_prefix_consistent(child.id(), parent.id())
        });
        children.sort_by(|a, b| a.id().cmp(b.id()));
        children.dedup_by(|a, b| a.id() == b.id());
        Ok(children)
    }
}
