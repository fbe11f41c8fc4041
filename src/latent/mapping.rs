//! Semantic attribute mapping
//!
//! Associates each editable attribute with a principal direction, its sign
//! convention and a base strength. Also holds the per-attribute sign policy
//! that restricts which user strengths are honoured.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Editable face attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Gender,
    Smile,
    Pose,
    Age,
    Lighting,
    HairColor,
    HairLength,
    Expression,
    EyeColor,
    EyeState,
    SeriousMood,
    Maturity,
}

impl Attribute {
    pub const ALL: [Attribute; 12] = [
        Attribute::Gender,
        Attribute::Smile,
        Attribute::Pose,
        Attribute::Age,
        Attribute::Lighting,
        Attribute::HairColor,
        Attribute::HairLength,
        Attribute::Expression,
        Attribute::EyeColor,
        Attribute::EyeState,
        Attribute::SeriousMood,
        Attribute::Maturity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::Gender => "gender",
            Attribute::Smile => "smile",
            Attribute::Pose => "pose",
            Attribute::Age => "age",
            Attribute::Lighting => "lighting",
            Attribute::HairColor => "hair_color",
            Attribute::HairLength => "hair_length",
            Attribute::Expression => "expression",
            Attribute::EyeColor => "eye_color",
            Attribute::EyeState => "eye_state",
            Attribute::SeriousMood => "serious_mood",
            Attribute::Maturity => "maturity",
        }
    }

    /// Which user-supplied signs this attribute accepts
    pub fn sign_policy(&self) -> SignPolicy {
        SIGN_POLICIES
            .iter()
            .find(|(attr, _)| attr == self)
            .map(|(_, policy)| *policy)
            .unwrap_or(SignPolicy::Any)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Attribute {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Attribute::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown attribute: {}", s))
    }
}

/// Allowed sign of the user strength for an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignPolicy {
    Any,
    /// Negative strengths are ignored
    NonNegative,
    /// Positive strengths are ignored
    NonPositive,
}

impl SignPolicy {
    pub fn allows(&self, strength: f32) -> bool {
        match self {
            SignPolicy::Any => true,
            SignPolicy::NonNegative => strength >= 0.0,
            SignPolicy::NonPositive => strength <= 0.0,
        }
    }
}

/// Attributes whose user strength is restricted to one sign.
/// Everything not listed accepts both signs.
pub const SIGN_POLICIES: &[(Attribute, SignPolicy)] = &[
    (Attribute::SeriousMood, SignPolicy::NonNegative),
    (Attribute::EyeColor, SignPolicy::NonPositive),
];

/// Sign convention of a principal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn sign(&self) -> f32 {
        match self {
            Direction::Positive => 1.0,
            Direction::Negative => -1.0,
        }
    }
}

impl TryFrom<i8> for Direction {
    type Error = String;

    fn try_from(value: i8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Direction::Positive),
            -1 => Ok(Direction::Negative),
            other => Err(format!("direction must be -1 or 1, got {}", other)),
        }
    }
}

impl From<Direction> for i8 {
    fn from(d: Direction) -> i8 {
        match d {
            Direction::Positive => 1,
            Direction::Negative => -1,
        }
    }
}

/// One entry of the mapping table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub component: usize,
    pub direction: Direction,
    pub strength: f32,
}

impl MappingRecord {
    pub fn new(component: usize, direction: Direction, strength: f32) -> Self {
        Self {
            component,
            direction,
            strength,
        }
    }
}

/// Attribute → principal direction lookup, immutable once built
#[derive(Debug, Clone, Default)]
pub struct SemanticMappingTable {
    records: HashMap<Attribute, MappingRecord>,
}

impl SemanticMappingTable {
    pub fn new(records: HashMap<Attribute, MappingRecord>) -> Self {
        Self { records }
    }

    /// Built-in table for the FFHQ StyleGAN2 principal components
    pub fn default_ffhq() -> Self {
        use Direction::*;
        let records = [
            (Attribute::Gender, MappingRecord::new(0, Negative, 1.0)),
            (Attribute::Pose, MappingRecord::new(1, Positive, 1.0)),
            (Attribute::Maturity, MappingRecord::new(3, Positive, 1.0)),
            (Attribute::Age, MappingRecord::new(5, Positive, 1.0)),
            (Attribute::Lighting, MappingRecord::new(8, Positive, 0.8)),
            (Attribute::HairColor, MappingRecord::new(12, Negative, 1.0)),
            (Attribute::Expression, MappingRecord::new(20, Positive, 1.0)),
            (Attribute::HairLength, MappingRecord::new(31, Positive, 1.0)),
            (Attribute::EyeColor, MappingRecord::new(33, Positive, 0.8)),
            (Attribute::EyeState, MappingRecord::new(39, Negative, 1.0)),
            (Attribute::Smile, MappingRecord::new(46, Positive, 1.2)),
            (Attribute::SeriousMood, MappingRecord::new(46, Negative, 1.0)),
        ];
        Self {
            records: records.into_iter().collect(),
        }
    }

    /// Load a JSON table of `name -> {component, direction, strength}`.
    /// Names outside the attribute set are skipped.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read semantic mapping {}", path.display()))?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: HashMap<String, MappingRecord> =
            serde_json::from_str(content).context("Invalid semantic mapping JSON")?;

        let mut records = HashMap::with_capacity(raw.len());
        for (name, record) in raw {
            match name.parse::<Attribute>() {
                Ok(attr) => {
                    records.insert(attr, record);
                }
                Err(_) => warn!("Ignoring mapping for unknown attribute '{}'", name),
            }
        }
        debug!("Loaded {} semantic mappings", records.len());
        Ok(Self { records })
    }

    pub fn get(&self, attribute: Attribute) -> Option<&MappingRecord> {
        self.records.get(&attribute)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Requested attribute strengths for a single edit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeVector {
    values: BTreeMap<Attribute, f32>,
}

impl AttributeVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attribute: Attribute, strength: f32) -> Self {
        self.set(attribute, strength);
        self
    }

    pub fn set(&mut self, attribute: Attribute, strength: f32) {
        self.values.insert(attribute, strength);
    }

    /// Build from loosely named values; unknown names are dropped
    pub fn from_named<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f32)>,
    {
        let mut out = Self::new();
        for (name, strength) in values {
            match name.parse::<Attribute>() {
                Ok(attr) => out.set(attr, strength),
                Err(_) => debug!("Dropping unknown attribute '{}'", name),
            }
        }
        out
    }

    pub fn get(&self, attribute: Attribute) -> f32 {
        self.values.get(&attribute).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Attribute, f32)> + '_ {
        self.values.iter().map(|(a, s)| (*a, *s))
    }

    /// True when no strength reaches `epsilon` in magnitude
    pub fn is_identity(&self, epsilon: f32) -> bool {
        self.values.values().all(|s| s.abs() < epsilon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_names_roundtrip() {
        for attr in Attribute::ALL {
            assert_eq!(attr.as_str().parse::<Attribute>().unwrap(), attr);
        }
        assert!("mustache".parse::<Attribute>().is_err());
    }

    #[test]
    fn test_sign_policy_table() {
        assert_eq!(Attribute::SeriousMood.sign_policy(), SignPolicy::NonNegative);
        assert_eq!(Attribute::EyeColor.sign_policy(), SignPolicy::NonPositive);
        assert_eq!(Attribute::Smile.sign_policy(), SignPolicy::Any);

        assert!(!SignPolicy::NonNegative.allows(-0.5));
        assert!(SignPolicy::NonNegative.allows(2.0));
        assert!(!SignPolicy::NonPositive.allows(0.5));
        assert!(SignPolicy::NonPositive.allows(-2.0));
    }

    #[test]
    fn test_mapping_json_skips_unknown_names() {
        let table = SemanticMappingTable::from_json_str(
            r#"{
                "smile": {"component": 46, "direction": 1, "strength": 1.5},
                "mustache": {"component": 2, "direction": -1, "strength": 1.0}
            }"#,
        )
        .unwrap();

        assert_eq!(table.len(), 1);
        let smile = table.get(Attribute::Smile).unwrap();
        assert_eq!(smile.component, 46);
        assert_eq!(smile.direction, Direction::Positive);
    }

    #[test]
    fn test_mapping_json_rejects_bad_direction() {
        let result = SemanticMappingTable::from_json_str(
            r#"{"smile": {"component": 1, "direction": 2, "strength": 1.0}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_default_table_covers_every_attribute() {
        let table = SemanticMappingTable::default_ffhq();
        for attr in Attribute::ALL {
            assert!(table.get(attr).is_some(), "missing {}", attr);
        }
    }

    #[test]
    fn test_attribute_vector_from_named() {
        let attrs = AttributeVector::from_named([("smile", 2.0), ("wings", 1.0)]);
        assert_eq!(attrs.get(Attribute::Smile), 2.0);
        assert_eq!(attrs.iter().count(), 1);
        assert!(!attrs.is_identity(0.001));
        assert!(AttributeVector::from_named([("age", 0.0005)]).is_identity(0.001));
    }
}
