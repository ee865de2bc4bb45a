use serde::{Deserialize, Serialize};
use std::fmt;

use crate::topology::Head;

/// Output transform, numbered like `wl_output.transform`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Transform {
    #[default]
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "90")]
    Rotate90,
    #[serde(rename = "180")]
    Rotate180,
    #[serde(rename = "270")]
    Rotate270,
    #[serde(rename = "flipped")]
    Flipped,
    #[serde(rename = "flipped-90")]
    Flipped90,
    #[serde(rename = "flipped-180")]
    Flipped180,
    #[serde(rename = "flipped-270")]
    Flipped270,
}

impl Transform {
    pub const ALL: [Transform; 8] = [
        Transform::Normal,
        Transform::Rotate90,
        Transform::Rotate180,
        Transform::Rotate270,
        Transform::Flipped,
        Transform::Flipped90,
        Transform::Flipped180,
        Transform::Flipped270,
    ];

    pub fn to_raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transform::Normal => "normal",
            Transform::Rotate90 => "90",
            Transform::Rotate180 => "180",
            Transform::Rotate270 => "270",
            Transform::Flipped => "flipped",
            Transform::Flipped90 => "flipped-90",
            Transform::Flipped180 => "flipped-180",
            Transform::Flipped270 => "flipped-270",
        };
        write!(f, "{}", name)
    }
}

/// Which head a profile output applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSelector {
    /// `*`, claims any head left over by the other rules
    Any,
    /// Exact connector name such as `eDP-1`
    Name(String),
    /// Criteria containing whitespace, matched against the head description
    Description(String),
}

impl OutputSelector {
    pub fn parse(criteria: &str) -> Self {
        if criteria == "*" {
            OutputSelector::Any
        } else if criteria.chars().any(char::is_whitespace) {
            OutputSelector::Description(criteria.to_string())
        } else {
            OutputSelector::Name(criteria.to_string())
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, OutputSelector::Any)
    }

    pub fn matches(&self, head: &Head) -> bool {
        match self {
            OutputSelector::Any => true,
            OutputSelector::Name(name) => head.name == *name,
            OutputSelector::Description(needle) => {
                head.name == *needle || head.description.contains(needle.as_str())
            }
        }
    }
}

impl fmt::Display for OutputSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSelector::Any => write!(f, "*"),
            OutputSelector::Name(s) | OutputSelector::Description(s) => write!(f, "{}", s),
        }
    }
}

/// Requested mode; refresh is in mHz
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRequest {
    pub width: i32,
    pub height: i32,
    pub refresh: Option<i32>,
    pub custom: bool,
}

impl fmt::Display for ModeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)?;
        if let Some(refresh) = self.refresh {
            write!(f, "@{}Hz", refresh as f64 / 1000.0)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

/// One `output` entry of a profile. Every field is optional; an absent field
/// leaves the compositor's current value alone.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileOutputRule {
    pub selector: OutputSelector,
    pub enabled: Option<bool>,
    pub mode: Option<ModeRequest>,
    pub position: Option<Position>,
    pub scale: Option<f64>,
    pub transform: Option<Transform>,
    pub adaptive_sync: Option<bool>,
}

impl ProfileOutputRule {
    pub fn new(selector: OutputSelector) -> Self {
        Self {
            selector,
            enabled: None,
            mode: None,
            position: None,
            scale: None,
            transform: None,
            adaptive_sync: None,
        }
    }

    /// Fills every field still absent from `defaults`.
    pub fn apply_defaults(&mut self, defaults: &ProfileOutputRule) {
        self.enabled = self.enabled.or(defaults.enabled);
        self.mode = self.mode.or(defaults.mode);
        self.position = self.position.or(defaults.position);
        self.scale = self.scale.or(defaults.scale);
        self.transform = self.transform.or(defaults.transform);
        self.adaptive_sync = self.adaptive_sync.or(defaults.adaptive_sync);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    pub outputs: Vec<ProfileOutputRule>,
    pub commands: Vec<String>,
}

impl Profile {
    /// Builds a profile, moving wildcard rules behind all the others while
    /// keeping declaration order within each group.
    pub fn new(name: impl Into<String>, outputs: Vec<ProfileOutputRule>, commands: Vec<String>) -> Self {
        let (mut sorted, wildcards): (Vec<_>, Vec<_>) = outputs
            .into_iter()
            .partition(|rule| !rule.selector.is_wildcard());
        sorted.extend(wildcards);

        Self {
            name: name.into(),
            outputs: sorted,
            commands,
        }
    }
}
