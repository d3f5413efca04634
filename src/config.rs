use std::collections::BTreeMap;
use std::path::Path;

use rand::Rng;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::verdict::Severity;

/// Who may override a reviewer's FAIL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverridePolicy {
    PrAuthor,
    WriteAccess,
    MaintainersOnly,
}

/// Model complexity tier, chosen by an external router from diff size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Flash,
    Standard,
    Pro,
}

impl Tier {
    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "flash" => Some(Tier::Flash),
            "standard" => Some(Tier::Standard),
            "pro" => Some(Tier::Pro),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tier::Flash => "flash",
            Tier::Standard => "standard",
            Tier::Pro => "pro",
        }
    }
}

/// How a reviewer's model is bound in config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelBinding {
    Explicit(String),
    Pool,
    Inherit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewerProfile {
    pub codename: String,
    pub perspective: String,
    pub description: String,
    pub model_binding: ModelBinding,
    pub override_policy: OverridePolicy,
    pub critical: bool,
}

/// Picks one model from a non-empty pool. Injectable so tests pin the draw.
pub trait PoolSelector {
    fn pick<'a>(&self, pool: &'a [String]) -> &'a str;
}

/// Uniform draw. Distribution quality is not load-bearing here.
pub struct UniformSelector;

impl PoolSelector for UniformSelector {
    fn pick<'a>(&self, pool: &'a [String]) -> &'a str {
        let idx = rand::thread_rng().gen_range(0..pool.len());
        &pool[idx]
    }
}

/// Deterministic selector for tests: always index `0` modulo pool length.
pub struct FixedSelector(pub usize);

impl PoolSelector for FixedSelector {
    fn pick<'a>(&self, pool: &'a [String]) -> &'a str {
        &pool[self.0 % pool.len()]
    }
}

// --- Raw file shapes ---

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub reviewers: Vec<ReviewerEntry>,
    #[serde(default)]
    pub model: ModelSection,
    pub waves: Option<WavesSection>,
    #[serde(default)]
    pub overrides: OverridesSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub triage: TriageSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReviewerEntry {
    pub codename: String,
    pub perspective: String,
    #[serde(default)]
    pub description: String,
    pub model: Option<String>,
    pub override_policy: Option<OverridePolicy>,
    pub critical: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    pub default: Option<String>,
    #[serde(default)]
    pub pool: Vec<String>,
    #[serde(default)]
    pub fallback: Vec<String>,
    pub tiers: Option<TierPools>,
    #[serde(default)]
    pub wave_pools: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TierPools {
    #[serde(default)]
    pub flash: Vec<String>,
    #[serde(default)]
    pub standard: Vec<String>,
    #[serde(default)]
    pub pro: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WavesSection {
    pub gate_severity: Option<String>,
    pub definitions: BTreeMap<String, WaveDef>,
    #[serde(default)]
    pub max_for_tier: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WaveDef {
    pub reviewers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct OverridesSection {
    pub command: String,
    pub legacy_command: String,
    pub trusted_bot_login: String,
}

impl Default for OverridesSection {
    fn default() -> Self {
        Self {
            command: "/cerberus override".to_string(),
            legacy_command: "/council override".to_string(),
            trusted_bot_login: "cerberus-bot".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RunnerSection {
    pub cli: String,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub agents_dir: String,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            cli: "agentctl".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            timeout_seconds: 600,
            agents_dir: ".cerberus/agents".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct TriageSection {
    pub enabled: bool,
    pub max_attempts: u32,
    pub stale_hours: u64,
}

impl Default for TriageSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            stale_hours: 24,
        }
    }
}

// --- Validated config ---

#[derive(Debug, Clone, PartialEq)]
pub struct WavesConfig {
    pub gate_severity: Severity,
    /// Ordered wave list: (name, reviewer codenames).
    pub definitions: Vec<(String, Vec<String>)>,
    pub max_for_tier: BTreeMap<String, String>,
}

impl WavesConfig {
    pub fn wave(&self, name: &str) -> Option<&[String]> {
        self.definitions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r.as_slice())
    }

    /// The wave after `name`, if any.
    pub fn next_after(&self, name: &str) -> Option<&str> {
        let idx = self.definitions.iter().position(|(n, _)| n == name)?;
        self.definitions.get(idx + 1).map(|(n, _)| n.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub reviewers: Vec<ReviewerProfile>,
    pub default_model: String,
    pub pool: Vec<String>,
    pub fallback: Vec<String>,
    pub tiers: TierPools,
    pub wave_pools: BTreeMap<String, Vec<String>>,
    pub waves: Option<WavesConfig>,
    pub overrides: OverridesSection,
    pub runner: RunnerSection,
    pub triage: TriageSection,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let file = parse_config(&content)?;
        validate(file)
    }

    pub fn get_reviewer(&self, perspective: &str) -> Result<&ReviewerProfile> {
        self.reviewers
            .iter()
            .find(|r| r.perspective == perspective)
            .ok_or_else(|| Error::ConfigValidation(format!("unknown perspective: {perspective}")))
    }

    pub fn get_reviewer_by_codename(&self, codename: &str) -> Option<&ReviewerProfile> {
        self.reviewers.iter().find(|r| r.codename == codename)
    }

    pub fn get_override_policy(&self, perspective: &str) -> Result<OverridePolicy> {
        Ok(self.get_reviewer(perspective)?.override_policy)
    }

    fn tier_pool(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::Flash => &self.tiers.flash,
            Tier::Standard => &self.tiers.standard,
            Tier::Pro => &self.tiers.pro,
        }
    }

    /// Resolve the model for one reviewer task.
    ///
    /// Order: action-level override, explicit binding, wave pool, tier pool,
    /// global default. A `pool` binding draws from the most specific
    /// applicable pool (wave, then tier, then the global pool).
    pub fn resolve_model(
        &self,
        profile: &ReviewerProfile,
        tier: Option<Tier>,
        wave: Option<&str>,
        action_override: Option<&str>,
        selector: &dyn PoolSelector,
    ) -> Result<String> {
        if let Some(m) = action_override {
            return Ok(m.to_string());
        }

        let wave_pool = wave
            .and_then(|w| self.wave_pools.get(w))
            .filter(|p| !p.is_empty());
        let tier_pool = tier
            .map(|t| self.tier_pool(t))
            .filter(|p| !p.is_empty());

        match &profile.model_binding {
            ModelBinding::Explicit(m) => Ok(m.clone()),
            ModelBinding::Pool => {
                let pool = wave_pool
                    .map(|p| p.as_slice())
                    .or(tier_pool)
                    .or(if self.pool.is_empty() {
                        None
                    } else {
                        Some(self.pool.as_slice())
                    })
                    .ok_or_else(|| {
                        Error::ConfigValidation(format!(
                            "reviewer {} binds to a pool but no pool applies",
                            profile.codename
                        ))
                    })?;
                Ok(selector.pick(pool).to_string())
            }
            ModelBinding::Inherit => {
                if let Some(p) = wave_pool {
                    Ok(selector.pick(p).to_string())
                } else if let Some(p) = tier_pool {
                    Ok(selector.pick(p).to_string())
                } else {
                    Ok(self.default_model.clone())
                }
            }
        }
    }

    /// Ordered model list for a runner: resolved primary plus the fallback
    /// chain, with duplicates of the primary removed.
    pub fn model_chain(&self, primary: &str) -> Vec<String> {
        let mut models = vec![primary.to_string()];
        for m in &self.fallback {
            if m != primary {
                models.push(m.clone());
            }
        }
        models
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    Ok(config)
}

pub fn validate(file: ConfigFile) -> Result<Config> {
    if file.reviewers.is_empty() {
        return Err(Error::ConfigValidation(
            "no reviewers configured".to_string(),
        ));
    }

    let mut reviewers = Vec::with_capacity(file.reviewers.len());
    for entry in &file.reviewers {
        if entry.codename.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "reviewer codename must be non-empty".to_string(),
            ));
        }
        if reviewers
            .iter()
            .any(|r: &ReviewerProfile| r.codename == entry.codename)
        {
            return Err(Error::ConfigValidation(format!(
                "duplicate reviewer codename: {}",
                entry.codename
            )));
        }
        if reviewers
            .iter()
            .any(|r: &ReviewerProfile| r.perspective == entry.perspective)
        {
            return Err(Error::ConfigValidation(format!(
                "duplicate reviewer perspective: {}",
                entry.perspective
            )));
        }
        let model_binding = match entry.model.as_deref() {
            None => ModelBinding::Inherit,
            Some("pool") => ModelBinding::Pool,
            Some(m) if m.trim().is_empty() => {
                return Err(Error::ConfigValidation(format!(
                    "reviewer {} has an empty model binding",
                    entry.codename
                )));
            }
            Some(m) => ModelBinding::Explicit(m.to_string()),
        };
        reviewers.push(ReviewerProfile {
            codename: entry.codename.clone(),
            perspective: entry.perspective.clone(),
            description: entry.description.clone(),
            model_binding,
            override_policy: entry.override_policy.unwrap_or(OverridePolicy::WriteAccess),
            critical: entry.critical.unwrap_or(false),
        });
    }

    let default_model = match file.model.default {
        Some(m) if !m.trim().is_empty() => m,
        _ => {
            return Err(Error::ConfigValidation(
                "model.default is required".to_string(),
            ));
        }
    };

    let waves = match file.waves {
        None => None,
        Some(section) => {
            if section.definitions.is_empty() {
                return Err(Error::ConfigValidation(
                    "waves.definitions must not be empty".to_string(),
                ));
            }
            let gate_severity = match section.gate_severity.as_deref() {
                None | Some("major") => Severity::Major,
                Some("critical") => Severity::Critical,
                Some(other) => {
                    return Err(Error::ConfigValidation(format!(
                        "waves.gate_severity must be critical or major, got {other}"
                    )));
                }
            };
            let mut definitions = Vec::new();
            for (name, def) in &section.definitions {
                for codename in &def.reviewers {
                    if !reviewers.iter().any(|r| &r.codename == codename) {
                        return Err(Error::ConfigValidation(format!(
                            "wave {name} references unknown reviewer: {codename}"
                        )));
                    }
                }
                definitions.push((name.clone(), def.reviewers.clone()));
            }
            for (tier, wave) in &section.max_for_tier {
                if Tier::parse(tier).is_none() {
                    return Err(Error::ConfigValidation(format!(
                        "waves.max_for_tier references unknown tier: {tier}"
                    )));
                }
                if !definitions.iter().any(|(n, _)| n == wave) {
                    return Err(Error::ConfigValidation(format!(
                        "waves.max_for_tier references unknown wave: {wave}"
                    )));
                }
            }
            Some(WavesConfig {
                gate_severity,
                definitions,
                max_for_tier: section.max_for_tier,
            })
        }
    };

    for (wave, pool) in &file.model.wave_pools {
        if pool.is_empty() {
            return Err(Error::ConfigValidation(format!(
                "model.wave_pools.{wave} must not be empty"
            )));
        }
    }

    if file.runner.timeout_seconds == 0 {
        return Err(Error::ConfigValidation(
            "runner.timeout_seconds must be > 0".to_string(),
        ));
    }
    if file.triage.max_attempts == 0 {
        return Err(Error::ConfigValidation(
            "triage.max_attempts must be > 0".to_string(),
        ));
    }

    Ok(Config {
        reviewers,
        default_model,
        pool: file.model.pool,
        fallback: file.model.fallback,
        tiers: file.model.tiers.unwrap_or_default(),
        wave_pools: file.model.wave_pools,
        waves,
        overrides: file.overrides,
        runner: file.runner,
        triage: file.triage,
    })
}

#[cfg(test)]
pub fn test_config(toml_str: &str) -> Config {
    validate(parse_config(toml_str).unwrap()).unwrap()
}
