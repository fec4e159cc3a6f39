use phf::phf_map;

use crate::types::{CostBreakdown, TokenUsage};
use crate::utils::warn_once;

/// Per-million-token prices for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    /// Prompt cache write cost per 1M tokens
    pub cache_write_per_1m: f64,
    /// Prompt cache read cost per 1M tokens
    pub cache_read_per_1m: f64,
}

/// Pricing used when a model is missing or unknown.
pub const FALLBACK_MODEL: &str = "claude-sonnet-4-20250514";

const FALLBACK_PRICING: ModelPricing = ModelPricing {
    input_per_1m: 3.0,
    output_per_1m: 15.0,
    cache_write_per_1m: 3.75,
    cache_read_per_1m: 0.30,
};

static MODEL_INDEX: phf::Map<&'static str, ModelPricing> = phf_map! {
    "claude-opus-4-5" => ModelPricing {
        input_per_1m: 5.0,
        output_per_1m: 25.0,
        cache_write_per_1m: 6.25,
        cache_read_per_1m: 0.5,
    },
    "claude-opus-4-1" => ModelPricing {
        input_per_1m: 15.0,
        output_per_1m: 75.0,
        cache_write_per_1m: 18.75,
        cache_read_per_1m: 1.5,
    },
    "claude-opus-4" => ModelPricing {
        input_per_1m: 15.0,
        output_per_1m: 75.0,
        cache_write_per_1m: 18.75,
        cache_read_per_1m: 1.5,
    },
    "claude-sonnet-4" => ModelPricing {
        input_per_1m: 3.0,
        output_per_1m: 15.0,
        cache_write_per_1m: 3.75,
        cache_read_per_1m: 0.3,
    },
    "claude-sonnet-4-5" => ModelPricing {
        input_per_1m: 3.0,
        output_per_1m: 15.0,
        cache_write_per_1m: 3.75,
        cache_read_per_1m: 0.3,
    },
    "claude-3-7-sonnet" => ModelPricing {
        input_per_1m: 3.0,
        output_per_1m: 15.0,
        cache_write_per_1m: 3.75,
        cache_read_per_1m: 0.3,
    },
    "claude-3-5-sonnet" => ModelPricing {
        input_per_1m: 3.0,
        output_per_1m: 15.0,
        cache_write_per_1m: 3.75,
        cache_read_per_1m: 0.3,
    },
    "claude-3-5-haiku" => ModelPricing {
        input_per_1m: 0.8,
        output_per_1m: 4.0,
        cache_write_per_1m: 1.0,
        cache_read_per_1m: 0.08,
    },
    "claude-haiku-4-5" => ModelPricing {
        input_per_1m: 1.0,
        output_per_1m: 5.0,
        cache_write_per_1m: 1.25,
        cache_read_per_1m: 0.10,
    },
    "claude-3-opus" => ModelPricing {
        input_per_1m: 15.0,
        output_per_1m: 75.0,
        cache_write_per_1m: 18.75,
        cache_read_per_1m: 1.5,
    },
    "claude-3-haiku" => ModelPricing {
        input_per_1m: 0.25,
        output_per_1m: 1.25,
        cache_write_per_1m: 0.3,
        cache_read_per_1m: 0.03,
    },
};

static MODEL_ALIASES: phf::Map<&'static str, &'static str> = phf_map! {
    "claude-opus-4-5-20251101" => "claude-opus-4-5",
    "claude-opus-4.5" => "claude-opus-4-5",
    "claude-opus-4-20250514" => "claude-opus-4",
    "claude-opus-4-0" => "claude-opus-4",
    "claude-opus-4.1" => "claude-opus-4-1",
    "claude-opus-4-1-20250805" => "claude-opus-4-1",
    "claude-sonnet-4-20250514" => "claude-sonnet-4",
    "claude-sonnet-4-0" => "claude-sonnet-4",
    "claude-sonnet-4.5" => "claude-sonnet-4-5",
    "claude-sonnet-4-5-20250929" => "claude-sonnet-4-5",
    "claude-3-7-sonnet-20250219" => "claude-3-7-sonnet",
    "claude-3-7-sonnet-latest" => "claude-3-7-sonnet",
    "claude-3-5-sonnet-20241022" => "claude-3-5-sonnet",
    "claude-3-5-sonnet-latest" => "claude-3-5-sonnet",
    "claude-3-5-sonnet-20240620" => "claude-3-5-sonnet",
    "claude-3-5-haiku-20241022" => "claude-3-5-haiku",
    "claude-3-5-haiku-latest" => "claude-3-5-haiku",
    "claude-haiku-4.5" => "claude-haiku-4-5",
    "claude-haiku-4-5-20251001" => "claude-haiku-4-5",
    "claude-3-opus-20240229" => "claude-3-opus",
    "claude-3-haiku-20240307" => "claude-3-haiku",
};

fn lookup(model_name: &str) -> Option<&'static ModelPricing> {
    if let Some(pricing) = MODEL_INDEX.get(model_name) {
        return Some(pricing);
    }

    MODEL_ALIASES
        .get(model_name)
        .and_then(|&canonical| MODEL_INDEX.get(canonical))
}

/// Resolve pricing for a model name.
///
/// Tries an exact match, then an alias, then the name with its trailing `-suffix`
/// (usually a release date) removed as a prefix match. Unknown and missing models are
/// priced as [`FALLBACK_MODEL`].
pub fn model_pricing(model_name: Option<&str>) -> ModelPricing {
    let Some(model_name) = model_name.filter(|name| !name.is_empty()) else {
        return FALLBACK_PRICING;
    };

    if let Some(pricing) = lookup(model_name) {
        return *pricing;
    }

    if let Some((base, _)) = model_name.rsplit_once('-') {
        let mut candidates: Vec<&&str> = MODEL_INDEX
            .keys()
            .filter(|key| key.starts_with(base))
            .collect();
        // phf iteration order is arbitrary; pick deterministically.
        candidates.sort();
        if let Some(key) = candidates.first()
            && let Some(pricing) = MODEL_INDEX.get(**key)
        {
            return *pricing;
        }
    }

    warn_once(format!(
        "No pricing found for model '{model_name}', using {FALLBACK_MODEL} pricing"
    ));
    FALLBACK_PRICING
}

/// Convert token counts into a per-kind cost breakdown in USD.
pub fn calculate_cost(tokens: &TokenUsage, model_name: Option<&str>) -> CostBreakdown {
    let pricing = model_pricing(model_name);

    CostBreakdown {
        input_cost: tokens.input_tokens as f64 * pricing.input_per_1m / 1_000_000.0,
        output_cost: tokens.output_tokens as f64 * pricing.output_per_1m / 1_000_000.0,
        cache_creation_cost: tokens.cache_creation_input_tokens as f64
            * pricing.cache_write_per_1m
            / 1_000_000.0,
        cache_read_cost: tokens.cache_read_input_tokens as f64 * pricing.cache_read_per_1m
            / 1_000_000.0,
    }
}

/// Cache hit rate as a percentage of all prompt-side tokens.
pub fn cache_hit_rate(tokens: &TokenUsage) -> f64 {
    let total = tokens.input_tokens
        + tokens.cache_creation_input_tokens
        + tokens.cache_read_input_tokens;
    if total == 0 {
        return 0.0;
    }
    tokens.cache_read_input_tokens as f64 / total as f64 * 100.0
}
