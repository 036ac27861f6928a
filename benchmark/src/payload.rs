use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;

pub const LOYALTY_SCHEME_NAME: &str = "HelperCard";

/// Loyalty card numbers are drawn from `0..LOYALTY_NUMBER_RANGE`
pub const LOYALTY_NUMBER_RANGE: i64 = 1_000_000;

const LOYALTY_NUMBER_FIELD: &str = "loyaltySchemeNumber";

/// The opaque JSON blob stored in `userJsonObject`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraUserData {
    pub mysterious_hex_payload: String,
    pub loyalty_scheme_name: String,
    pub loyalty_scheme_number: i64,
}

impl ExtraUserData {
    /// A payload whose hex blob is roughly `len` characters long
    pub fn generate<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Self {
        let mut hex = String::with_capacity(len);
        for _ in 0..len / 2 {
            let _ = write!(hex, "{:02x}", rng.random::<u8>());
        }

        Self {
            mysterious_hex_payload: hex,
            loyalty_scheme_name: LOYALTY_SCHEME_NAME.to_string(),
            loyalty_scheme_number: new_loyalty_number(rng),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize user payload")
    }
}

/// Generate a payload and render it as the JSON stored on the user
pub fn generate_payload<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Result<String> {
    ExtraUserData::generate(len, rng).to_json()
}

pub fn new_loyalty_number<R: Rng + ?Sized>(rng: &mut R) -> i64 {
    rng.random_range(0..LOYALTY_NUMBER_RANGE)
}

/// Rewrite only the loyalty card number inside a stored payload, keeping
/// every other field as it is
pub fn with_loyalty_number(json: &str, number: i64) -> Result<String> {
    let mut value: Value = serde_json::from_str(json).context("Stored payload is not JSON")?;
    let object = value
        .as_object_mut()
        .context("Stored payload is not a JSON object")?;
    object.insert(LOYALTY_NUMBER_FIELD.to_string(), Value::from(number));
    Ok(value.to_string())
}
