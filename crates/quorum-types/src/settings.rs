use std::collections::HashMap;
use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Provider-independent model tier. Ordered: `level1 < level2 < level3`.
/// Legacy model names (`haiku`, `sonnet`, `opus`) map onto the levels when
/// settings or agent definitions are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModelLevel {
    Level1,
    Level2,
    Level3,
}

impl ModelLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelLevel::Level1 => "level1",
            ModelLevel::Level2 => "level2",
            ModelLevel::Level3 => "level3",
        }
    }

    /// Parse a level name, accepting the legacy model-name aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "level1" | "haiku" => Some(ModelLevel::Level1),
            "level2" | "sonnet" => Some(ModelLevel::Level2),
            "level3" | "opus" => Some(ModelLevel::Level3),
            _ => None,
        }
    }
}

impl fmt::Display for ModelLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ModelLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ModelLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ModelLevel::parse(&raw)
            .ok_or_else(|| de::Error::custom(format!("unknown model level `{raw}`")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "ModelLevel::min_default")]
    pub min_level: ModelLevel,
    #[serde(default = "ModelLevel::max_default")]
    pub max_level: ModelLevel,
    #[serde(default = "ModelLevel::mid_default")]
    pub default_level: ModelLevel,
    /// Concrete model identifier per level, e.g. `level2 -> "sonnet-4"`.
    #[serde(default)]
    pub level_overrides: HashMap<String, String>,
}

impl ModelLevel {
    fn min_default() -> Self {
        ModelLevel::Level1
    }
    fn mid_default() -> Self {
        ModelLevel::Level2
    }
    fn max_default() -> Self {
        ModelLevel::Level3
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            min_level: ModelLevel::Level1,
            max_level: ModelLevel::Level3,
            default_level: ModelLevel::Level2,
            level_overrides: HashMap::new(),
        }
    }
}

impl ProviderSettings {
    /// Concrete model name for a level, falling back to the level name.
    pub fn model_for(&self, level: ModelLevel) -> String {
        self.level_overrides
            .get(level.as_str())
            .cloned()
            .unwrap_or_else(|| level.as_str().to_string())
    }
}

/// Engine settings, consumed read-through at cluster boundaries only
/// (cluster start and task spawn) and never cached across task executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "ModelLevel::max_default")]
    pub max_model: ModelLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_model: Option<ModelLevel>,
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default)]
    pub provider_settings: HashMap<String, ProviderSettings>,
    #[serde(default = "default_true")]
    pub strict_schema: bool,
}

fn default_provider() -> String {
    "claude".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_model: ModelLevel::Level3,
            min_model: None,
            default_provider: default_provider(),
            provider_settings: HashMap::new(),
            strict_schema: true,
        }
    }
}

impl Settings {
    pub fn provider(&self, name: &str) -> ProviderSettings {
        self.provider_settings.get(name).cloned().unwrap_or_default()
    }

    /// Whether a level lies within the cluster-wide floor/ceiling.
    pub fn level_in_bounds(&self, level: ModelLevel) -> bool {
        if level > self.max_model {
            return false;
        }
        if let Some(min) = self.min_model {
            if level < min {
                return false;
            }
        }
        true
    }
}
