use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entity::Entity;
use crate::kind::EntityKind;

/// An issued access token. Only the SHA-512 digest of the token text is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    #[serde(default)]
    pub id: String,
    pub sha512: String,
    pub owner_uid: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    /// Validity in seconds from `issued_at`. Zero means no expiry.
    #[serde(default)]
    pub duration_secs: u64,
}

impl Token {
    pub fn new(sha512: impl Into<String>, owner_uid: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            sha512: sha512.into(),
            owner_uid: owner_uid.into(),
            issued_at: OffsetDateTime::now_utc(),
            duration_secs: 0,
        }
    }
}

impl Entity for Token {
    const KIND: EntityKind = EntityKind::Token;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrips_through_json() {
        let token = Token::new("abc123", "user-1");
        let value = serde_json::to_value(&token).unwrap();
        assert!(value["issued_at"].is_string());
        let back: Token = serde_json::from_value(value).unwrap();
        assert_eq!(back, token);
    }
}
