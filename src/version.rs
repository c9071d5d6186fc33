//! Published schema versions

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::checksum::Checksum;
use crate::diff::{ChangeKind, Criticality, SchemaChange};

/// How far a publish moves the version number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionBump {
    Major,
    Minor,
    Patch,
}

impl VersionBump {
    /// Breaking changes bump major, additions and dangerous changes bump
    /// minor, anything else patch
    pub fn for_changes(changes: &[SchemaChange]) -> Self {
        if changes.iter().any(|c| c.criticality == Criticality::Breaking) {
            VersionBump::Major
        } else if changes
            .iter()
            .any(|c| c.criticality == Criticality::Dangerous || is_addition(c.kind))
        {
            VersionBump::Minor
        } else {
            VersionBump::Patch
        }
    }

    pub fn apply(&self, version: &Version) -> Version {
        match self {
            VersionBump::Major => Version::new(version.major + 1, 0, 0),
            VersionBump::Minor => Version::new(version.major, version.minor + 1, 0),
            VersionBump::Patch => Version::new(version.major, version.minor, version.patch + 1),
        }
    }
}

fn is_addition(kind: ChangeKind) -> bool {
    matches!(
        kind,
        ChangeKind::TypeAdded
            | ChangeKind::FieldAdded
            | ChangeKind::FieldArgumentAdded
            | ChangeKind::InputFieldAdded
            | ChangeKind::EnumValueAdded
            | ChangeKind::UnionMemberAdded
            | ChangeKind::DirectiveAdded
    )
}

/// One published schema of a target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    pub version: Version,
    pub sdl: String,
    pub checksum: Checksum,
    pub author: String,
    /// Commit the schema was published from
    pub commit: String,
    pub created_at: DateTime<Utc>,
    pub previous_version: Option<Version>,
    /// Changes relative to the previous version
    #[serde(default)]
    pub changes: Vec<SchemaChange>,
    /// Published despite breaking changes
    #[serde(default)]
    pub forced: bool,
}

impl SchemaVersion {
    /// First version of a target
    pub fn initial(sdl: &str, author: &str, commit: &str) -> Self {
        Self {
            version: Version::new(1, 0, 0),
            sdl: sdl.to_string(),
            checksum: Checksum::of_sdl(sdl),
            author: author.to_string(),
            commit: commit.to_string(),
            created_at: Utc::now(),
            previous_version: None,
            changes: Vec::new(),
            forced: false,
        }
    }

    /// Version following `self` with `changes` applied
    pub fn next(&self, sdl: &str, author: &str, commit: &str, changes: Vec<SchemaChange>) -> Self {
        let bump = VersionBump::for_changes(&changes);
        Self {
            version: bump.apply(&self.version),
            sdl: sdl.to_string(),
            checksum: Checksum::of_sdl(sdl),
            author: author.to_string(),
            commit: commit.to_string(),
            created_at: Utc::now(),
            previous_version: Some(self.version.clone()),
            changes,
            forced: false,
        }
    }

    pub fn tag_string(&self) -> String {
        format!("v{}", self.version)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.version)
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for SchemaVersion {}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.version.cmp(&other.version)
    }
}
