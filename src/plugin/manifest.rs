use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use semver::{Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{PluginError, Result};
use crate::plugin::runtime::PluginStatus;

const MAX_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(pub String);

impl PluginId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids become file and directory names, so anything that could escape
    /// the plugin directory is rejected.
    pub fn validate(&self) -> Result<()> {
        let id = self.as_str();
        let context = format!("plugin id '{id}'");

        if id.is_empty() {
            return Err(PluginError::parse(context, "id cannot be empty"));
        }
        if id.len() > MAX_ID_LEN {
            return Err(PluginError::parse(
                context,
                format!("id cannot exceed {MAX_ID_LEN} characters"),
            ));
        }
        if id.contains("..") {
            return Err(PluginError::parse(context, "id contains invalid path characters"));
        }

        let valid = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(PluginError::parse(
                context,
                "id can only contain letters, digits, '-', '_' and '.'",
            ));
        }
        if id.starts_with(['-', '.']) || id.ends_with(['-', '.']) {
            return Err(PluginError::parse(
                context,
                "id cannot start or end with '-' or '.'",
            ));
        }

        Ok(())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PluginId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// An npm-style version range (`^1.2.0`, `>=1.0.0 <2.0.0`, `1.x || 2.x`, `*`).
///
/// Each `||` alternative is translated into a comma-joined
/// [`semver::VersionReq`]; the range matches when any alternative does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionRange {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            alternatives: vec![VersionReq::STAR],
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let context = format!("version range '{raw}'");

        let mut alternatives = Vec::new();
        for alternative in trimmed.split("||") {
            let requirement = npm_to_semver(alternative.trim())
                .map_err(|message| PluginError::parse(context.clone(), message))?;
            let parsed = VersionReq::parse(&requirement)
                .map_err(|err| PluginError::parse(context.clone(), err))?;
            alternatives.push(parsed);
        }

        Ok(Self {
            raw: if trimmed.is_empty() { "*".to_string() } else { trimmed.to_string() },
            alternatives,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl PartialEq for VersionRange {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for VersionRange {}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for VersionRange {
    type Error = PluginError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<VersionRange> for String {
    fn from(range: VersionRange) -> Self {
        range.raw
    }
}

/// Rewrites one npm conjunction (`>= 1.0.0 <2.0.0`, `1.0.0 - 2.3`) into the
/// comma-separated syntax `semver` understands.
fn npm_to_semver(alternative: &str) -> std::result::Result<String, String> {
    if alternative.is_empty() || matches!(alternative, "*" | "x" | "X") {
        return Ok("*".to_string());
    }

    let tokens: Vec<&str> = alternative.split_whitespace().collect();

    if let [low, "-", high] = tokens.as_slice() {
        return Ok(format!(">={}, <={}", strip_v(low), strip_v(high)));
    }
    if tokens.contains(&"-") {
        return Err("hyphen ranges take exactly two versions".to_string());
    }

    let mut comparators = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in tokens {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
            if pending_op.replace(token).is_some() {
                return Err(format!("dangling operator before '{token}'"));
            }
            continue;
        }

        let split = token
            .find(|c: char| !matches!(c, '<' | '>' | '=' | '^' | '~'))
            .unwrap_or(token.len());
        let (op, version) = token.split_at(split);
        let op = match (pending_op.take(), op) {
            (Some(pending), "") => pending,
            (Some(_), _) => return Err(format!("duplicate operator in '{token}'")),
            (None, op) => op,
        };
        let version = strip_v(version);
        // npm reads a bare version as an exact match; semver would read it as `^`.
        let op = if op.is_empty() && !is_wildcard(version) { "=" } else { op };
        comparators.push(format!("{op}{version}"));
    }

    if let Some(op) = pending_op {
        return Err(format!("operator '{op}' is missing a version"));
    }

    Ok(comparators.join(", "))
}

fn is_wildcard(version: &str) -> bool {
    version.split('.').any(|part| matches!(part, "*" | "x" | "X"))
}

fn strip_v(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version)
}

/// Culture-keyed text; a plain JSON string is accepted as the `en` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "LocalizedTextRepr")]
pub struct LocalizedText(pub BTreeMap<String, String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum LocalizedTextRepr {
    Plain(String),
    ByCulture(BTreeMap<String, String>),
}

impl From<LocalizedTextRepr> for LocalizedText {
    fn from(repr: LocalizedTextRepr) -> Self {
        match repr {
            LocalizedTextRepr::Plain(text) => Self(BTreeMap::from([("en".to_string(), text)])),
            LocalizedTextRepr::ByCulture(map) => Self(map),
        }
    }
}

impl LocalizedText {
    /// Exact culture, then its language (`de-AT` → `de`), then `en`, then
    /// whatever is present.
    pub fn get(&self, culture: &str) -> Option<&str> {
        let language = culture.split(['-', '_']).next().unwrap_or(culture);
        self.0
            .get(culture)
            .or_else(|| self.0.get(language))
            .or_else(|| self.0.get("en"))
            .or_else(|| self.0.values().next())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDeclaration {
    pub id: PluginId,
    #[serde(default)]
    pub version: VersionRange,
    #[serde(default)]
    pub optional: bool,
}

impl DependencyDeclaration {
    pub fn required(id: impl Into<String>, version: &str) -> Result<Self> {
        Ok(Self {
            id: PluginId::new(id),
            version: VersionRange::parse(version)?,
            optional: false,
        })
    }
}

/// Package metadata plus the runtime fields the manager mutates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: PluginId,
    pub name: String,
    #[serde(deserialize_with = "deserialize_version")]
    pub version: Version,
    #[serde(default)]
    pub author: String,
    pub entry: String,
    #[serde(default)]
    pub description: LocalizedText,
    #[serde(default)]
    pub dependencies: Vec<DependencyDeclaration>,
    #[serde(skip)]
    pub status: PluginStatus,
    #[serde(skip)]
    pub install_path: Option<PathBuf>,
}

fn deserialize_version<'de, D>(deserializer: D) -> std::result::Result<Version, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Version::parse(strip_v(raw.trim())).map_err(serde::de::Error::custom)
}

impl PluginDescriptor {
    /// Parses and validates a manifest document. `context` names the source
    /// (usually the package path) in error messages.
    pub fn from_json(text: &str, context: &str) -> Result<Self> {
        let descriptor: Self =
            serde_json::from_str(text).map_err(|err| PluginError::parse(context, err))?;
        descriptor.validate(context)?;
        Ok(descriptor)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| PluginError::parse(format!("manifest of {}", self.id), err))
    }

    fn validate(&self, context: &str) -> Result<()> {
        self.id.validate()?;

        if self.entry.trim().is_empty() {
            return Err(PluginError::parse(context, "entry module cannot be empty"));
        }

        for dependency in &self.dependencies {
            dependency.id.validate()?;
            if dependency.id == self.id {
                return Err(PluginError::parse(
                    context,
                    format!("plugin {} cannot depend on itself", self.id),
                ));
            }
        }

        Ok(())
    }

    pub fn required_dependencies(&self) -> impl Iterator<Item = &DependencyDeclaration> {
        self.dependencies.iter().filter(|dep| !dep.optional)
    }
}
