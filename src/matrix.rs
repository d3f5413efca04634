use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{Config, Tier};
use crate::error::{Error, Result};

/// One unit of reviewer work, consumed by a parallel runner.
///
/// The tier/wave annotations tell the runner which pool to draw from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerTask {
    pub codename: String,
    pub perspective: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_wave: Option<String>,
}

/// Whether `tier` is allowed to reach `wave` under `waves.max_for_tier`.
///
/// A tier with no cap reaches every wave. The cap names the last wave the
/// tier may run, by wave order.
pub fn tier_allows_wave(config: &Config, tier: Tier, wave: &str) -> bool {
    let Some(waves) = &config.waves else {
        return true;
    };
    let Some(cap) = waves.max_for_tier.get(tier.name()) else {
        return true;
    };
    let pos = |name: &str| waves.definitions.iter().position(|(n, _)| n == name);
    match (pos(wave), pos(cap)) {
        (Some(w), Some(c)) => w <= c,
        _ => true,
    }
}

/// Expand the roster into the ordered list of reviewer tasks for one run.
pub fn expand(config: &Config, wave: Option<&str>, tier: Option<Tier>) -> Result<Vec<ReviewerTask>> {
    let tier_name = tier.map(|t| t.name().to_string());

    let selected: Vec<&crate::config::ReviewerProfile> = match wave {
        None => config.reviewers.iter().collect(),
        Some(name) => {
            let waves = config.waves.as_ref().ok_or_else(|| {
                Error::ConfigValidation(format!("wave {name} selected but no waves configured"))
            })?;
            let codenames = waves
                .wave(name)
                .ok_or_else(|| Error::ConfigValidation(format!("unknown wave: {name}")))?;
            if let Some(t) = tier
                && !tier_allows_wave(config, t, name)
            {
                info!(wave = name, tier = t.name(), "wave capped for tier, emitting no tasks");
                return Ok(Vec::new());
            }
            codenames
                .iter()
                .map(|c| {
                    config.get_reviewer_by_codename(c).ok_or_else(|| {
                        Error::ConfigValidation(format!("wave {name} references unknown reviewer: {c}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    Ok(selected
        .into_iter()
        .map(|r| ReviewerTask {
            codename: r.codename.clone(),
            perspective: r.perspective.clone(),
            model_tier: tier_name.clone(),
            model_wave: wave.map(str::to_string),
        })
        .collect())
}
