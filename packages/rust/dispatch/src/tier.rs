//! Model tiers and the strategy that picks one per item.

use feedforge_shared::ModelsSection;
use serde::{Deserialize, Serialize};

/// Content shorter than this goes to the fast tier unless quality is high.
const SHORT_CONTENT_CHARS: usize = 2_000;
/// Content longer than this always goes to the accurate tier.
const LONG_CONTENT_CHARS: usize = 20_000;
const HIGH_QUALITY: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Balanced,
    Accurate,
}

/// Parameters a tier sends with every request.
#[derive(Debug, Clone, PartialEq)]
pub struct TierParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Parameters for all three tiers.
#[derive(Debug, Clone)]
pub struct TierTable {
    fast: TierParams,
    balanced: TierParams,
    accurate: TierParams,
}

impl TierTable {
    pub fn params(&self, tier: ModelTier) -> &TierParams {
        match tier {
            ModelTier::Fast => &self.fast,
            ModelTier::Balanced => &self.balanced,
            ModelTier::Accurate => &self.accurate,
        }
    }
}

impl From<&ModelsSection> for TierTable {
    fn from(models: &ModelsSection) -> Self {
        Self {
            fast: TierParams {
                model: models.fast.clone(),
                max_tokens: 512,
                temperature: 0.2,
            },
            balanced: TierParams {
                model: models.balanced.clone(),
                max_tokens: 1024,
                temperature: 0.3,
            },
            accurate: TierParams {
                model: models.accurate.clone(),
                max_tokens: 2048,
                temperature: 0.3,
            },
        }
    }
}

/// Pick a tier from the item's size and its source's quality score.
pub fn select_tier(content_len: usize, quality_score: f64) -> ModelTier {
    if content_len > LONG_CONTENT_CHARS || quality_score >= HIGH_QUALITY {
        ModelTier::Accurate
    } else if content_len < SHORT_CONTENT_CHARS {
        ModelTier::Fast
    } else {
        ModelTier::Balanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy() {
        assert_eq!(select_tier(500, 0.5), ModelTier::Fast);
        assert_eq!(select_tier(5_000, 0.5), ModelTier::Balanced);
        assert_eq!(select_tier(50_000, 0.1), ModelTier::Accurate);
        assert_eq!(select_tier(100, 0.9), ModelTier::Accurate);
    }

    #[test]
    fn table_from_config() {
        let models = ModelsSection {
            fast: "m-fast".into(),
            balanced: "m-balanced".into(),
            accurate: "m-accurate".into(),
        };
        let table = TierTable::from(&models);
        assert_eq!(table.params(ModelTier::Fast).model, "m-fast");
        assert_eq!(table.params(ModelTier::Accurate).max_tokens, 2048);
    }
}
