//! Extension manifest parsing and validation.
//!
//! Manifests are `extension.json` documents. They are parsed once at
//! discovery time into an immutable [`Manifest`]; anything malformed is
//! reported as a [`ManifestError`] so the caller can skip that one extension
//! and keep going.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;
use wildmatch::WildMatch;

/// File name of an extension's manifest inside its directory.
pub const MANIFEST_FILE: &str = "extension.json";

/// Version of the host API extensions are checked against.
pub const HOST_API_VERSION: &str = "1.0.0";

const HOST_API_MAJOR: u64 = 1;

/// Activation event that means "activate on startup".
pub const STARTUP_EVENT: &str = "*";

/// Privileged services an extension may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Capability {
    Filesystem,
    Network,
    Terminal,
    Clipboard,
}

/// A command contributed through the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CommandContribution {
    pub id: String,
    pub title: String,
}

/// Parsed extension manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Manifest {
    /// Identity of the extension; doubles as its id.
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub version: String,
    /// Entry point, relative to the extension directory.
    pub main: String,
    /// Required host API range (`engines.breadcrumb`).
    pub engine: String,
    pub activation_events: Vec<String>,
    pub capabilities: Vec<Capability>,
    pub commands: Vec<CommandContribution>,
    /// Ids of extensions that must be active first.
    pub dependencies: Vec<String>,
}

/// Why a manifest was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest must be a JSON object")]
    NotAnObject,

    #[error("Missing or empty required field `{0}`")]
    MissingField(&'static str),

    #[error("Field `{field}` is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },

    #[error("Extension requires host API {range}, this host provides {}", HOST_API_VERSION)]
    Incompatible { range: String },
}

impl Manifest {
    /// Parse and validate a raw manifest document.
    pub fn parse(raw: &Value) -> Result<Self, ManifestError> {
        let obj = raw.as_object().ok_or(ManifestError::NotAnObject)?;

        let name = required_str(obj, "name")?;
        let version = required_str(obj, "version")?;
        let main = required_str(obj, "main")?;

        let engine = obj
            .get("engines")
            .and_then(Value::as_object)
            .and_then(|engines| engines.get("breadcrumb"))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or(ManifestError::MissingField("engines.breadcrumb"))?
            .to_string();

        let capabilities = string_array(obj, "capabilities")?
            .into_iter()
            .map(|cap| {
                serde_json::from_value::<Capability>(Value::String(cap.clone())).map_err(|_| {
                    ManifestError::Malformed {
                        field: "capabilities",
                        reason: format!("unknown capability `{cap}`"),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let manifest = Manifest {
            display_name: optional_str(obj, "displayName")?,
            description: optional_str(obj, "description")?,
            activation_events: string_array(obj, "activationEvents")?,
            commands: contributed_commands(obj)?,
            dependencies: string_array(obj, "extensionDependencies")?,
            capabilities,
            name,
            version,
            main,
            engine,
        };

        if !is_compatible(&manifest.engine) {
            return Err(ManifestError::Incompatible {
                range: manifest.engine,
            });
        }
        Ok(manifest)
    }

    /// Parse, discarding the reason on failure.
    pub fn validate(raw: &Value) -> Option<Self> {
        Self::parse(raw).ok()
    }

    pub fn id(&self) -> &str {
        &self.name
    }

    /// True when the extension should start with the host: no activation
    /// events, or the startup wildcard among them.
    pub fn activates_on_startup(&self) -> bool {
        self.activation_events.is_empty()
            || self.activation_events.iter().any(|e| e == STARTUP_EVENT)
    }

    /// True when one of the declared activation events matches `event`.
    pub fn activates_on(&self, event: &str) -> bool {
        self.activation_events
            .iter()
            .any(|pattern| pattern == event || WildMatch::new(pattern).matches(event))
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Check a host API range against [`HOST_API_VERSION`].
///
/// Supported forms: `*`, `^1.2.0`, `~1.0.0`, `=1.0.0`, `1.x`, `1.3.0` (all
/// pinned to the current major), and `>=0.9.0` / `>=1.0.0` (any range whose
/// floor is at or below the current major). Anything else is rejected.
pub fn is_compatible(range: &str) -> bool {
    let range = range.trim();
    if range == "*" {
        return true;
    }
    if let Some(floor) = range.strip_prefix(">=") {
        return major(floor).is_some_and(|m| m <= HOST_API_MAJOR);
    }
    let pinned = range.trim_start_matches(['^', '~', '=']);
    major(pinned) == Some(HOST_API_MAJOR)
}

fn major(version: &str) -> Option<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|m| m.parse().ok())
}

fn required_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, ManifestError> {
    obj.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or(ManifestError::MissingField(field))
}

fn optional_str(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ManifestError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ManifestError::Malformed {
            field,
            reason: "expected a string".into(),
        }),
    }
}

fn string_array(obj: &Map<String, Value>, field: &'static str) -> Result<Vec<String>, ManifestError> {
    let items = match obj.get(field) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(ManifestError::Malformed {
                field,
                reason: "expected an array of strings".into(),
            });
        }
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| ManifestError::Malformed {
                    field,
                    reason: format!("entry {index} is not a string"),
                })
        })
        .collect()
}

fn contributed_commands(obj: &Map<String, Value>) -> Result<Vec<CommandContribution>, ManifestError> {
    let malformed = |reason: String| ManifestError::Malformed {
        field: "contributes.commands",
        reason,
    };

    let contributes = match obj.get("contributes") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Object(contributes)) => contributes,
        Some(_) => {
            return Err(ManifestError::Malformed {
                field: "contributes",
                reason: "expected an object".into(),
            });
        }
    };
    let commands = match contributes.get("commands") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(commands)) => commands,
        Some(_) => return Err(malformed("expected an array".into())),
    };

    commands
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let field = |key: &str| {
                entry
                    .get(key)
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| malformed(format!("entry {index} needs a non-empty `{key}`")))
            };
            Ok(CommandContribution {
                id: field("id")?,
                title: field("title")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full() -> Value {
        json!({
            "name": "git-tools",
            "displayName": "Git Tools",
            "description": "Git helpers",
            "version": "1.2.0",
            "main": "dist/extension.js",
            "engines": { "breadcrumb": "^1.0.0" },
            "activationEvents": ["onCommand:git-tools.log"],
            "capabilities": ["terminal", "filesystem"],
            "contributes": { "commands": [{ "id": "git-tools.log", "title": "Show Log" }] },
            "extensionDependencies": ["core-ui"]
        })
    }

    #[test]
    fn test_full_manifest_preserved() {
        let manifest = Manifest::parse(&full()).unwrap();
        assert_eq!(
            manifest,
            Manifest {
                name: "git-tools".into(),
                display_name: Some("Git Tools".into()),
                description: Some("Git helpers".into()),
                version: "1.2.0".into(),
                main: "dist/extension.js".into(),
                engine: "^1.0.0".into(),
                activation_events: vec!["onCommand:git-tools.log".into()],
                capabilities: vec![Capability::Terminal, Capability::Filesystem],
                commands: vec![CommandContribution {
                    id: "git-tools.log".into(),
                    title: "Show Log".into(),
                }],
                dependencies: vec!["core-ui".into()],
            }
        );
    }

    #[test]
    fn test_minimal_manifest() {
        let manifest = Manifest::validate(&json!({
            "name": "a",
            "version": "0.1.0",
            "main": "main.js",
            "engines": { "breadcrumb": "*" }
        }))
        .unwrap();
        assert!(manifest.activation_events.is_empty());
        assert!(manifest.activates_on_startup());
        assert!(manifest.display_name.is_none());
    }

    #[test]
    fn test_required_fields() {
        for (field, expected) in [
            ("name", "name"),
            ("version", "version"),
            ("main", "main"),
            ("engines", "engines.breadcrumb"),
        ] {
            let mut raw = full();
            raw.as_object_mut().unwrap().remove(field);
            assert_eq!(
                Manifest::parse(&raw),
                Err(ManifestError::MissingField(expected)),
                "removing {field}"
            );
            assert!(Manifest::validate(&raw).is_none());
        }

        let mut raw = full();
        raw["name"] = json!("  ");
        assert_eq!(Manifest::parse(&raw), Err(ManifestError::MissingField("name")));
    }

    #[test]
    fn test_malformed_optional_fields() {
        let cases = [
            ("activationEvents", json!("*")),
            ("activationEvents", json!(["*", 3])),
            ("extensionDependencies", json!({})),
            ("capabilities", json!(["telepathy"])),
            ("contributes", json!({ "commands": [{ "id": "x" }] })),
            ("contributes", json!({ "commands": [{ "title": "X" }] })),
            ("contributes", json!([])),
            ("displayName", json!(5)),
        ];
        for (field, value) in cases {
            let mut raw = full();
            raw[field] = value.clone();
            assert!(
                matches!(Manifest::parse(&raw), Err(ManifestError::Malformed { .. })),
                "{field} = {value}"
            );
        }
    }

    #[test]
    fn test_not_an_object() {
        assert_eq!(Manifest::parse(&json!([1, 2])), Err(ManifestError::NotAnObject));
    }

    #[test]
    fn test_compatibility_ranges() {
        for ok in ["*", "^1.2.0", "~1.0.0", "1.x", "1.3.0", "=1.0.0", ">=0.9.0", ">=1.0.0"] {
            assert!(is_compatible(ok), "{ok} should be accepted");
        }
        for bad in ["^2.0.0", "2.x", ">=2.0.0", "~0.9.0", "latest", "<2.0.0"] {
            assert!(!is_compatible(bad), "{bad} should be rejected");
        }

        let mut raw = full();
        raw["engines"]["breadcrumb"] = json!("^2.0.0");
        assert!(matches!(
            Manifest::parse(&raw),
            Err(ManifestError::Incompatible { .. })
        ));
    }

    #[test]
    fn test_activation_events() {
        let mut raw = full();
        raw["activationEvents"] = json!(["onLanguage:*", "onCommand:git-tools.log"]);
        let manifest = Manifest::parse(&raw).unwrap();
        assert!(!manifest.activates_on_startup());
        assert!(manifest.activates_on("onLanguage:rust"));
        assert!(manifest.activates_on("onCommand:git-tools.log"));
        assert!(!manifest.activates_on("onCommand:other"));
    }
}
