//! Lowering configuration (`ossa.toml`)

use crate::error::{CompileError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the configuration file looked up next to the input
pub const CONFIG_FILE: &str = "ossa.toml";

/// Options that change the produced IR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoweringConfig {
    /// Dynamic exclusivity checks on or off
    pub enforcement: EnforcementMode,
    /// Vtable slot policy for overrides that change optionality
    pub override_policy: OverridePolicy,
    /// Size of the inline `materializeForSet` scratch buffer, in words
    pub value_buffer_words: usize,
    /// Lower independent function bodies on the rayon pool
    pub parallel: bool,
    /// Run the IR verifier on every lowered function
    pub verify: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementMode {
    #[default]
    Checked,
    /// Every dynamic access becomes an `[unsafe]` marker
    Unchecked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverridePolicy {
    /// Reuse the base slot when the optional and non-optional forms share a
    /// representation (class references, class metatypes), else add a slot
    #[default]
    RepresentationCompatible,
    /// Any optionality change adds a slot
    AlwaysNewSlot,
    /// Never add a slot; the base slot thunk absorbs every conversion
    NeverNewSlot,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        LoweringConfig {
            enforcement: EnforcementMode::Checked,
            override_policy: OverridePolicy::RepresentationCompatible,
            value_buffer_words: 3,
            parallel: true,
            verify: true,
        }
    }
}

impl LoweringConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: LoweringConfig = toml::from_str(text)?;
        if config.value_buffer_words == 0 {
            return Err(CompileError::parse_error(
                "value-buffer-words must be at least 1",
            ));
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CompileError::io_error(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// `ossa.toml` in `dir` if present, defaults otherwise
    pub fn discover(dir: &Path) -> Result<Self> {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "loading configuration");
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    pub fn unchecked(&self) -> bool {
        self.enforcement == EnforcementMode::Unchecked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(LoweringConfig::from_toml_str("").unwrap(), LoweringConfig::default());
    }

    #[test]
    fn test_kebab_case_keys() {
        let config = LoweringConfig::from_toml_str(
            "enforcement = \"unchecked\"\noverride-policy = \"always-new-slot\"\nvalue-buffer-words = 4\n",
        )
        .unwrap();
        assert!(config.unchecked());
        assert_eq!(config.override_policy, OverridePolicy::AlwaysNewSlot);
        assert_eq!(config.value_buffer_words, 4);
        assert!(config.parallel);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        assert!(LoweringConfig::from_toml_str("value-buffer-words = 0").is_err());
    }

    #[test]
    fn test_discover_without_file() {
        let dir = std::env::temp_dir().join("ossa-config-discover-none");
        let config = LoweringConfig::discover(&dir).unwrap();
        assert_eq!(config, LoweringConfig::default());
    }
}
