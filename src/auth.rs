//! Token validation building block for the WebSocket subscriber gate.
//!
//! The core itself does not own a user/credential store — that is an
//! out-of-scope collaborator — this module only provides the constant-time
//! comparison a [`crate::collaborators::SubscriberValidator`] implementation
//! needs, plus a simple shared-secret validator suitable for a standalone
//! deployment with one admin token and one viewer token.

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so an attacker cannot determine the secret's length
/// from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() { provided[i] } else { 0xff };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Validates a subscriber's `?token=` against a single pre-shared admin
/// token and a single pre-shared read-only token. Either may be empty to
/// disable that tier.
pub struct SharedSecretValidator {
    admin_token: String,
    viewer_token: String,
}

impl SharedSecretValidator {
    pub fn new(admin_token: String, viewer_token: String) -> Self {
        Self {
            admin_token,
            viewer_token,
        }
    }
}

impl crate::collaborators::SubscriberValidator for SharedSecretValidator {
    fn validate(&self, token: Option<&str>) -> (bool, bool) {
        let Some(token) = token else {
            return (false, false);
        };
        if !self.admin_token.is_empty()
            && constant_time_eq(self.admin_token.as_bytes(), token.as_bytes())
        {
            return (true, true);
        }
        if !self.viewer_token.is_empty()
            && constant_time_eq(self.viewer_token.as_bytes(), token.as_bytes())
        {
            return (true, false);
        }
        (false, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::SubscriberValidator;

    #[test]
    fn constant_time_eq_matches_equal_bytes() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"wrong"));
        assert!(!constant_time_eq(b"secret", b"secre"));
    }

    #[test]
    fn shared_secret_validator_grants_admin_and_viewer_tiers() {
        let validator = SharedSecretValidator::new("admintok".to_string(), "viewtok".to_string());
        assert_eq!(validator.validate(Some("admintok")), (true, true));
        assert_eq!(validator.validate(Some("viewtok")), (true, false));
        assert_eq!(validator.validate(Some("nope")), (false, false));
        assert_eq!(validator.validate(None), (false, false));
    }

    #[test]
    fn empty_tier_token_disables_that_tier() {
        let validator = SharedSecretValidator::new("admintok".to_string(), String::new());
        assert_eq!(validator.validate(Some("")), (false, false));
    }
}
