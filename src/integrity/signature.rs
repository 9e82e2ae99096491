//! HMAC-SHA256 vote signatures.
//!
//! The signature binds a vote to its event and submitting IP. The message
//! is `"{vote_id}:{event_id}:{voter_ip}"`, the key is the process-wide
//! signing secret, and the output is lowercase hex.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::SigningSecret;
use crate::error::{Result, VoteError};
use crate::logging::structured::LogContext;
use crate::storage::models::{EventId, VoteId};

type HmacSha256 = Hmac<Sha256>;

pub fn signing_message(vote_id: VoteId, event_id: EventId, voter_ip: &str) -> String {
    format!("{}:{}:{}", vote_id, event_id, voter_ip)
}

/// Signs and verifies vote signatures with one secret.
#[derive(Debug, Clone)]
pub struct VoteSigner {
    secret: SigningSecret,
}

impl VoteSigner {
    pub fn new(secret: SigningSecret) -> Result<Self> {
        if secret.is_empty() {
            return Err(VoteError::validation("signing secret must not be empty"));
        }
        Ok(Self { secret })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| VoteError::validation(format!("invalid signing key: {}", e)))
    }

    pub fn sign(&self, vote_id: VoteId, event_id: EventId, voter_ip: &str) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(signing_message(vote_id, event_id, voter_ip).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time verification. Malformed hex is a mismatch.
    pub fn verify(
        &self,
        vote_id: VoteId,
        event_id: EventId,
        voter_ip: &str,
        signature_hex: &str,
        ctx: &LogContext,
    ) -> bool {
        let signature = match hex::decode(signature_hex) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("{} SIGNATURE_DECODE_FAILED error={}", ctx, e);
                return false;
            }
        };

        let mut mac = match self.mac() {
            Ok(mac) => mac,
            Err(e) => {
                log::error!("{} SIGNATURE_KEY_INVALID error={}", ctx, e);
                return false;
            }
        };
        mac.update(signing_message(vote_id, event_id, voter_ip).as_bytes());

        match mac.verify_slice(&signature) {
            Ok(()) => {
                log::debug!("{} SIGNATURE_VERIFY valid=true", ctx);
                true
            }
            Err(_) => {
                log::warn!("{} SIGNATURE_INVALID", ctx);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn signer(secret: &str) -> VoteSigner {
        VoteSigner::new(SigningSecret::new(secret)).unwrap()
    }

    #[test]
    fn test_known_message_format() {
        let vote = VoteId(uuid::Uuid::nil());
        let event = EventId(uuid::Uuid::nil());
        assert_eq!(
            signing_message(vote, event, "10.0.0.1"),
            "00000000-0000-0000-0000-000000000000:00000000-0000-0000-0000-000000000000:10.0.0.1"
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let ctx = LogContext::new("test");
        let s = signer("k1");
        let (vote, event) = (VoteId::new(), EventId::new());
        let sig = s.sign(vote, event, "10.0.0.1").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(s.verify(vote, event, "10.0.0.1", &sig, &ctx));

        assert!(!s.verify(vote, event, "10.0.0.2", &sig, &ctx));
        assert!(!s.verify(VoteId::new(), event, "10.0.0.1", &sig, &ctx));
        assert!(!s.verify(vote, EventId::new(), "10.0.0.1", &sig, &ctx));
        assert!(!signer("k2").verify(vote, event, "10.0.0.1", &sig, &ctx));
        assert!(!s.verify(vote, event, "10.0.0.1", "not-hex", &ctx));
        assert!(!s.verify(vote, event, "10.0.0.1", &sig[..32], &ctx));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(VoteSigner::new(SigningSecret::new("")).is_err());
    }

    proptest! {
        #[test]
        fn prop_signature_binds_every_input(
            secret in "[ -~]{1,32}",
            other_secret in "[ -~]{1,32}",
            ip in "[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}",
        ) {
            let ctx = LogContext::new("prop");
            let s = signer(&secret);
            let (vote, event) = (VoteId::new(), EventId::new());
            let sig = s.sign(vote, event, &ip).unwrap();

            prop_assert!(s.verify(vote, event, &ip, &sig, &ctx));
            let altered_ip = format!("{}0", ip);
            prop_assert!(!s.verify(vote, event, &altered_ip, &sig, &ctx));
            if other_secret != secret {
                prop_assert!(!signer(&other_secret).verify(vote, event, &ip, &sig, &ctx));
            }
        }
    }
}
