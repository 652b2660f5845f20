//! Tenant and user identifier normalization
//!
//! The CRM hands out numeric company and user ids in JSON, but the
//! installation store keys on strings. Anything that carries an id accepts
//! either form and normalizes to a string.

use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Unsigned(n) => n.to_string(),
            RawId::Signed(n) => n.to_string(),
        }
    }
}

/// Deserialize a required id given as a JSON string or number.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let id = RawId::deserialize(deserializer)?.into_string();
    if id.trim().is_empty() {
        return Err(serde::de::Error::custom("identifier must not be empty"));
    }
    Ok(id)
}

/// Deserialize an optional id given as a JSON string, number or null.
pub fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(RawId::into_string))
}
