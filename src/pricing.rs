use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-model prices at the time a usage row is written, in integer micro-USD
/// per million tokens. Persisted next to every usage record so cost stays
/// auditable after the live table changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub prompt_usd_micros_per_mtok: u64,
    pub completion_usd_micros_per_mtok: u64,
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("invalid price for model {model}: {field} must be a finite non-negative number")]
    InvalidPrice { model: String, field: &'static str },
}

impl PriceSnapshot {
    /// Builds a snapshot from USD-per-million-token prices as they appear in
    /// config files.
    pub fn from_usd_per_mtok(
        model: &str,
        prompt_usd: f64,
        completion_usd: f64,
    ) -> Result<Self, PricingError> {
        Ok(Self {
            prompt_usd_micros_per_mtok: usd_to_micros(prompt_usd, model, "prompt_usd_per_mtok")?,
            completion_usd_micros_per_mtok: usd_to_micros(
                completion_usd,
                model,
                "completion_usd_per_mtok",
            )?,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    models: HashMap<String, PriceSnapshot>,
}

impl PricingTable {
    /// Prices shipped as defaults; config entries override these.
    pub fn builtin() -> Self {
        let mut table = Self::default();
        table.insert("gpt-4o", snapshot_micros(2_500_000, 10_000_000));
        table.insert("gpt-4o-mini", snapshot_micros(150_000, 600_000));
        table.insert("gpt-4.1", snapshot_micros(2_000_000, 8_000_000));
        table.insert("o3-mini", snapshot_micros(1_100_000, 4_400_000));
        table
    }

    pub fn insert(&mut self, model: impl Into<String>, snapshot: PriceSnapshot) {
        self.models.insert(model.into(), snapshot);
    }

    /// Unknown model is `None`; the engine never guesses a price.
    pub fn snapshot(&self, model: &str) -> Option<PriceSnapshot> {
        self.models.get(model).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

fn snapshot_micros(prompt: u64, completion: u64) -> PriceSnapshot {
    PriceSnapshot {
        prompt_usd_micros_per_mtok: prompt,
        completion_usd_micros_per_mtok: completion,
    }
}

fn usd_to_micros(usd: f64, model: &str, field: &'static str) -> Result<u64, PricingError> {
    if !usd.is_finite() || usd < 0.0 {
        return Err(PricingError::InvalidPrice {
            model: model.to_string(),
            field,
        });
    }
    let micros = (usd * 1_000_000.0).round();
    if micros > u64::MAX as f64 {
        return Ok(u64::MAX);
    }
    Ok(micros as u64)
}

/// Cost of one call in micro-USD: `tokens / 1e6 * price`, computed in integer
/// arithmetic with half-up rounding per component. Deterministic, and exactly
/// linear whenever per-token prices are whole micro-USD.
pub fn cost_usd_micros(snapshot: &PriceSnapshot, prompt_tokens: u64, completion_tokens: u64) -> u64 {
    let prompt = component_usd_micros(prompt_tokens, snapshot.prompt_usd_micros_per_mtok);
    let completion =
        component_usd_micros(completion_tokens, snapshot.completion_usd_micros_per_mtok);
    prompt.saturating_add(completion)
}

fn component_usd_micros(tokens: u64, usd_micros_per_mtok: u64) -> u64 {
    let product = u128::from(tokens) * u128::from(usd_micros_per_mtok);
    let rounded = (product + 500_000) / 1_000_000;
    if rounded > u128::from(u64::MAX) {
        u64::MAX
    } else {
        rounded as u64
    }
}
