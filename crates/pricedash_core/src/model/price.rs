//! Price snapshot record and its composite key.
//!
//! # Responsibility
//! - Describe one price observation of a coin in one quote currency.
//! - Derive the table key (`coin_id`, `timestamp_currency`) from a record.
//!
//! # Invariants
//! - `timestamp_currency` is always `"{timestamp}#{currency}"`.
//! - `price` and optional metrics are finite numbers.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Separator between the timestamp and currency halves of the sort key.
pub const SORT_KEY_SEPARATOR: char = '#';

/// Sampling interval a price point was recorded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Hourly,
    Daily,
}

/// Stored price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceData {
    pub coin_id: String,
    pub timestamp_currency: String,
    pub currency: String,
    /// Epoch milliseconds rendered as a decimal string.
    pub timestamp: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_change_24h: Option<f64>,
    #[serde(default)]
    pub granularity: Granularity,
}

/// Table key of a [`PriceData`] record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceKey {
    pub coin_id: String,
    pub timestamp_currency: String,
}

impl PriceKey {
    pub fn new(coin_id: impl Into<String>, timestamp: &str, currency: &str) -> Self {
        Self {
            coin_id: coin_id.into(),
            timestamp_currency: timestamp_currency(timestamp, currency),
        }
    }
}

/// Builds the composite sort key `"{timestamp}#{currency}"`.
pub fn timestamp_currency(timestamp: &str, currency: &str) -> String {
    format!("{timestamp}{SORT_KEY_SEPARATOR}{currency}")
}

/// Key extractor for price repositories.
pub fn price_key(record: &PriceData) -> PriceKey {
    PriceKey {
        coin_id: record.coin_id.clone(),
        timestamp_currency: record.timestamp_currency.clone(),
    }
}

impl PriceData {
    /// Creates a record with the sort key derived from `timestamp` and `currency`.
    pub fn new(
        coin_id: impl Into<String>,
        currency: impl Into<String>,
        timestamp: impl Into<String>,
        price: f64,
        granularity: Granularity,
    ) -> Self {
        let currency = currency.into();
        let timestamp = timestamp.into();
        Self {
            coin_id: coin_id.into(),
            timestamp_currency: timestamp_currency(&timestamp, &currency),
            currency,
            timestamp,
            price,
            market_cap: None,
            volume_24h: None,
            price_change_24h: None,
            granularity,
        }
    }

    pub fn key(&self) -> PriceKey {
        price_key(self)
    }

    /// Checks record invariants before it is written.
    pub fn validate(&self) -> Result<(), PriceValidationError> {
        if self.coin_id.trim().is_empty() {
            return Err(PriceValidationError::EmptyCoinId);
        }
        if self.currency.trim().is_empty() {
            return Err(PriceValidationError::EmptyCurrency);
        }
        if self.timestamp_currency != timestamp_currency(&self.timestamp, &self.currency) {
            return Err(PriceValidationError::SortKeyMismatch {
                expected: timestamp_currency(&self.timestamp, &self.currency),
                actual: self.timestamp_currency.clone(),
            });
        }

        let metrics = [
            ("price", Some(self.price)),
            ("market_cap", self.market_cap),
            ("volume_24h", self.volume_24h),
            ("price_change_24h", self.price_change_24h),
        ];
        for (field, value) in metrics {
            if value.is_some_and(|value| !value.is_finite()) {
                return Err(PriceValidationError::NonFinite(field));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceValidationError {
    EmptyCoinId,
    EmptyCurrency,
    SortKeyMismatch { expected: String, actual: String },
    NonFinite(&'static str),
}

impl Display for PriceValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyCoinId => write!(f, "coin_id cannot be empty"),
            Self::EmptyCurrency => write!(f, "currency cannot be empty"),
            Self::SortKeyMismatch { expected, actual } => write!(
                f,
                "timestamp_currency must be `{expected}`, got `{actual}`"
            ),
            Self::NonFinite(field) => write!(f, "{field} must be a finite number"),
        }
    }
}

impl Error for PriceValidationError {}
