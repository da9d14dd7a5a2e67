//! Credential Manager (spec §4.5): short-term HMAC credentials and
//! long-term nonce/realm sessions created lazily off a 401 challenge.

use parking_lot::Mutex;

use codec::crypto::Password;

/// Short-term credential: ufrag + password, appended to every outbound
/// request when configured (spec §4.5).
#[derive(Debug, Clone)]
pub struct ShortTermCredential {
    pub username: String,
    pub password: Password,
}

/// A long-term session, created lazily in response to a 401 and
/// rotated on 438 Stale Nonce (spec §4.5, §3 "Credential Session").
#[derive(Debug, Clone)]
pub struct LongTermSession {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub password: Password,
}

/// Upcall the embedding agent implements to mint long-term credentials
/// once a server's realm is known (spec §4.5: "an upcall
/// `create_long_term_credential(realm)`").
pub trait LongTermCredentialProvider: Send + Sync {
    /// Returns `(username, password)` for `realm`, or `None` to refuse
    /// the challenge (the caller then fails the transaction with
    /// `AuthFailed`).
    fn create_long_term_credential(&self, realm: &str) -> Option<(String, String)>;
}

/// How many times a single logical request may be retried in response
/// to a 401/438 challenge before giving up (spec §4.5: "Do not enter an
/// infinite retry loop: a second 401 or 438 for the same transaction
/// terminates with AuthFailed").
pub const MAX_CHALLENGE_RETRIES: u32 = 1;

#[derive(Default)]
pub struct CredentialManager {
    short_term: Mutex<Option<ShortTermCredential>>,
    long_term: Mutex<Option<LongTermSession>>,
}

impl CredentialManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_short_term(&self, ufrag: &str, password: &str) {
        *self.short_term.lock() = Some(ShortTermCredential {
            username: ufrag.to_string(),
            password: Password::short_term(password),
        });
    }

    pub fn short_term(&self) -> Option<ShortTermCredential> {
        self.short_term.lock().clone()
    }

    pub fn long_term(&self) -> Option<LongTermSession> {
        self.long_term.lock().clone()
    }

    /// Create a long-term session from a 401 challenge's REALM/NONCE,
    /// via the embedding agent's `provider`. Returns `None` (and
    /// installs nothing) if the provider declines.
    pub fn establish_long_term(
        &self,
        realm: &str,
        nonce: &str,
        provider: &dyn LongTermCredentialProvider,
    ) -> Option<LongTermSession> {
        let (username, password) = provider.create_long_term_credential(realm)?;
        let session = LongTermSession {
            password: Password::long_term(&username, &password, realm),
            username,
            realm: realm.to_string(),
            nonce: nonce.to_string(),
        };
        *self.long_term.lock() = Some(session.clone());
        Some(session)
    }

    /// Rotate the nonce after a 438 Stale Nonce response (spec §4.5).
    /// No-op if no long-term session exists yet.
    pub fn update_nonce(&self, nonce: &str) -> Option<LongTermSession> {
        let mut guard = self.long_term.lock();
        if let Some(session) = guard.as_mut() {
            session.nonce = nonce.to_string();
            return Some(session.clone());
        }
        None
    }

    /// Drop the long-term session (spec §4.8: TRY_ALTERNATE "clear
    /// long-term session; retry ALLOCATE at new server").
    pub fn clear_long_term(&self) {
        *self.long_term.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider;
    impl LongTermCredentialProvider for FixedProvider {
        fn create_long_term_credential(&self, _realm: &str) -> Option<(String, String)> {
            Some(("user".to_string(), "pass".to_string()))
        }
    }

    #[test]
    fn establishes_and_rotates_nonce() {
        let manager = CredentialManager::new();
        let session = manager.establish_long_term("realm", "n1", &FixedProvider).unwrap();
        assert_eq!(session.nonce, "n1");

        let rotated = manager.update_nonce("n2").unwrap();
        assert_eq!(rotated.nonce, "n2");
        assert_eq!(manager.long_term().unwrap().nonce, "n2");
    }

    #[test]
    fn declining_provider_leaves_no_session() {
        struct Declining;
        impl LongTermCredentialProvider for Declining {
            fn create_long_term_credential(&self, _realm: &str) -> Option<(String, String)> {
                None
            }
        }

        let manager = CredentialManager::new();
        assert!(manager.establish_long_term("realm", "n1", &Declining).is_none());
        assert!(manager.long_term().is_none());
    }
}
