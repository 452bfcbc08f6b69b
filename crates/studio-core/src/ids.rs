//! Collision-resistant ID generation, injectable for the same reason as
//! [`crate::clock::Clock`]: deterministic tests need to assert on IDs.

use uuid::Uuid;

pub trait IdGen: Send + Sync + 'static {
    fn new_id(&self) -> Uuid;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// 16 random bytes, used as the `nonce` field of a [`crate::token`]-style
/// payload. Kept here rather than in the assets crate because both the
/// idempotency key derivation and content tokens want "give me fresh
/// randomness" without pulling in a full RNG dependency per call site.
pub fn random_nonce_bytes() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    let a = Uuid::new_v4();
    bytes.copy_from_slice(a.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_gen_produces_unique_ids() {
        let gen = UuidGen;
        let a = gen.new_id();
        let b = gen.new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn nonce_bytes_are_16() {
        assert_eq!(random_nonce_bytes().len(), 16);
    }
}
