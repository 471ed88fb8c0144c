//! Short-lived signed session tokens.
//!
//! A token is `hex(claims) "." hex(mac)` where the MAC is a keyed BLAKE3 hash of the
//! encoded claims. Verification is pure: it needs only the key and a clock.
//!
//! Room ids are reused once a room is reaped, so the claims also carry the epoch of
//! the room instance that issued them. Only that instance honours the token.

use crate::error::TokenError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub player_id: u32,
    pub room_id: String,
    pub room_epoch: u64,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
}

#[derive(Clone)]
pub struct SessionTokenService {
    key: [u8; 32],
    ttl: Duration,
}

impl SessionTokenService {
    pub fn new(key: [u8; 32], ttl: Duration) -> Self {
        Self { key, ttl }
    }

    pub fn issue(&self, player_id: u32, room_id: &str, room_epoch: u64) -> String {
        self.issue_at(player_id, room_id, room_epoch, shared::now_ms())
    }

    pub fn issue_at(&self, player_id: u32, room_id: &str, room_epoch: u64, now_ms: u64) -> String {
        let claims = TokenClaims {
            player_id,
            room_id: room_id.to_string(),
            room_epoch,
            issued_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(self.ttl.as_millis() as u64),
        };
        // Encoding a plain struct into a Vec cannot fail; an empty payload would be
        // rejected as malformed on the way back in.
        let payload = bincode::serialize(&claims).unwrap_or_default();
        let mac = blake3::keyed_hash(&self.key, &payload);
        format!("{}.{}", hex::encode(&payload), mac.to_hex())
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.verify_at(token, shared::now_ms())
    }

    /// Fails closed: malformed input, a bad MAC or an expired claim all reject.
    pub fn verify_at(&self, token: &str, now_ms: u64) -> Result<TokenClaims, TokenError> {
        let (payload_hex, mac_hex) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let payload = hex::decode(payload_hex).map_err(|_| TokenError::Malformed)?;
        let mac = blake3::Hash::from_hex(mac_hex).map_err(|_| TokenError::Malformed)?;

        // Hash equality is constant time
        if blake3::keyed_hash(&self.key, &payload) != mac {
            return Err(TokenError::BadSignature);
        }

        let claims: TokenClaims =
            bincode::deserialize(&payload).map_err(|_| TokenError::Malformed)?;
        if now_ms >= claims.expires_at_ms {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SessionTokenService {
        SessionTokenService::new([7u8; 32], Duration::from_secs(60))
    }

    #[test]
    fn test_issue_and_verify() {
        let tokens = service();
        let token = tokens.issue_at(7, "A", 3, 1_000);
        let claims = tokens.verify_at(&token, 2_000).unwrap();
        assert_eq!(claims.player_id, 7);
        assert_eq!(claims.room_id, "A");
        assert_eq!(claims.room_epoch, 3);
        assert_eq!(claims.expires_at_ms, 61_000);
    }

    #[test]
    fn test_expired_token() {
        let tokens = service();
        let token = tokens.issue_at(7, "A", 3, 1_000);
        assert_eq!(tokens.verify_at(&token, 61_000), Err(TokenError::Expired));
    }

    #[test]
    fn test_tampered_payload() {
        let tokens = service();
        let token = tokens.issue_at(7, "A", 3, 1_000);
        let forged = tokens.issue_at(8, "A", 3, 1_000);
        let (_, mac) = token.split_once('.').unwrap();
        let (payload, _) = forged.split_once('.').unwrap();
        let spliced = format!("{}.{}", payload, mac);
        assert_eq!(tokens.verify_at(&spliced, 2_000), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_other_key_rejected() {
        let token = service().issue_at(7, "A", 3, 1_000);
        let other = SessionTokenService::new([9u8; 32], Duration::from_secs(60));
        assert_eq!(other.verify_at(&token, 2_000), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_malformed_tokens() {
        let tokens = service();
        assert_eq!(tokens.verify("garbage"), Err(TokenError::Malformed));
        assert_eq!(tokens.verify("zz.zz"), Err(TokenError::Malformed));
        assert_eq!(tokens.verify(""), Err(TokenError::Malformed));
    }
}
