use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use studio_core::{ContentAccess, ContentTokenPayload, StudioError, StudioResult, VerifiedToken};
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// `base64url(payload_json).base64url(hmac_sha256(key, payload_json))`
/// content access tokens (spec §4.8, §6). Verification recomputes the
/// MAC and compares in constant time; it never reconstructs the MAC
/// from attacker-controlled state without that comparison.
pub struct HmacContentAccess {
    key: Vec<u8>,
}

impl HmacContentAccess {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac_for(&self, payload_json: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(payload_json.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

impl ContentAccess for HmacContentAccess {
    fn issue_token(&self, asset_id: Uuid, owner_id: &str, ttl: chrono::Duration, now: DateTime<Utc>) -> String {
        let nonce_bytes = studio_core::ids::random_nonce_bytes();
        let payload = ContentTokenPayload {
            asset_id,
            owner_id: owner_id.to_string(),
            exp: (now + ttl).timestamp(),
            nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
        };
        let payload_json = serde_json::to_string(&payload).expect("ContentTokenPayload always serializes");
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json.as_bytes());
        let mac = self.mac_for(&payload_json);
        let mac_b64 = URL_SAFE_NO_PAD.encode(mac);
        format!("{payload_b64}.{mac_b64}")
    }

    fn verify(&self, token: &str, now: DateTime<Utc>) -> StudioResult<VerifiedToken> {
        let (payload_b64, mac_b64) = token.split_once('.').ok_or(StudioError::SignatureInvalid)?;

        let payload_json_bytes = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| StudioError::SignatureInvalid)?;
        let payload_json = String::from_utf8(payload_json_bytes).map_err(|_| StudioError::SignatureInvalid)?;
        let given_mac = URL_SAFE_NO_PAD.decode(mac_b64).map_err(|_| StudioError::SignatureInvalid)?;

        let expected_mac = self.mac_for(&payload_json);
        if expected_mac.ct_eq(&given_mac).unwrap_u8() != 1 {
            return Err(StudioError::SignatureInvalid);
        }

        let payload: ContentTokenPayload =
            serde_json::from_str(&payload_json).map_err(|_| StudioError::SignatureInvalid)?;
        if payload.exp < now.timestamp() {
            return Err(StudioError::SignatureInvalid);
        }

        Ok(VerifiedToken {
            asset_id: payload.asset_id,
            owner_id: payload.owner_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_before_expiry() {
        let access = HmacContentAccess::new(b"test-key".to_vec());
        let asset_id = Uuid::new_v4();
        let now = Utc::now();
        let token = access.issue_token(asset_id, "user-1", chrono::Duration::seconds(60), now);

        let verified = access.verify(&token, now + chrono::Duration::seconds(30)).unwrap();
        assert_eq!(verified.asset_id, asset_id);
        assert_eq!(verified.owner_id, "user-1");
    }

    #[test]
    fn expired_token_is_rejected() {
        let access = HmacContentAccess::new(b"test-key".to_vec());
        let now = Utc::now();
        let token = access.issue_token(Uuid::new_v4(), "user-1", chrono::Duration::seconds(60), now);
        let err = access.verify(&token, now + chrono::Duration::seconds(120)).unwrap_err();
        assert!(matches!(err, StudioError::SignatureInvalid));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let access = HmacContentAccess::new(b"test-key".to_vec());
        let now = Utc::now();
        let token = access.issue_token(Uuid::new_v4(), "user-1", chrono::Duration::seconds(60), now);
        let (_, mac) = token.split_once('.').unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_string(&ContentTokenPayload {
                asset_id: Uuid::new_v4(),
                owner_id: "attacker".to_string(),
                exp: (now + chrono::Duration::seconds(60)).timestamp(),
                nonce: "x".to_string(),
            })
            .unwrap(),
        );
        let forged = format!("{forged_payload}.{mac}");
        assert!(access.verify(&forged, now).is_err());
    }

    #[test]
    fn token_signed_with_a_different_key_is_rejected() {
        let access_a = HmacContentAccess::new(b"key-a".to_vec());
        let access_b = HmacContentAccess::new(b"key-b".to_vec());
        let now = Utc::now();
        let token = access_a.issue_token(Uuid::new_v4(), "user-1", chrono::Duration::seconds(60), now);
        assert!(access_b.verify(&token, now).is_err());
    }
}
