//! Crew credential store.
//!
//! Crew members are authorized against a static allow-list of SHA-512
//! digests of `username + "§" + password`. Clients either send the pair
//! (hashed here) or a digest they received on an earlier successful login.
//!
//! The store is immutable after startup and shared between connection
//! handlers behind an `Arc`.

use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

use relay_protocol::Credentials;

/// Separator between username and password in the hashed string.
pub const CREDENTIAL_SEPARATOR: char = '§';

/// Length of a digest in bytes.
pub const DIGEST_LEN: usize = 64;

/// Length of a digest rendered as hex.
pub const DIGEST_HEX_LEN: usize = DIGEST_LEN * 2;

/// A SHA-512 credential digest.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialDigest([u8; DIGEST_LEN]);

impl CredentialDigest {
    /// Hashes a username/password pair.
    pub fn from_password(username: &str, password: &str) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(username.as_bytes());
        let mut separator = [0u8; 4];
        hasher.update(CREDENTIAL_SEPARATOR.encode_utf8(&mut separator).as_bytes());
        hasher.update(password.as_bytes());
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(hasher.finalize().as_slice());
        Self(bytes)
    }

    /// Parses a hex digest from the allow-list (case-insensitive).
    ///
    /// Returns `None` unless `hex` is exactly 128 hex characters.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != DIGEST_HEX_LEN {
            return None;
        }
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(hex, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Parses a token sent by a client.
    ///
    /// Tokens are compared as issued: only the exact lowercase rendering
    /// returned by `to_hex` is accepted.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::from_hex(token).filter(|digest| digest.to_hex() == token)
    }

    /// Derives the digest a client's credentials stand for.
    ///
    /// Returns `None` for a token that is not an issued digest.
    pub fn from_credentials(credentials: &Credentials) -> Option<Self> {
        match credentials {
            Credentials::Token { token } => Self::from_token(token),
            Credentials::Password { username, password } => {
                Some(Self::from_password(username, password))
            }
        }
    }

    /// Lowercase hex rendering, as stored in the allow-list.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn ct_eq(&self, other: &Self) -> bool {
        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }
}

impl std::fmt::Debug for CredentialDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Enough to tell digests apart in logs without printing the secret
        let hex = self.to_hex();
        write!(f, "CredentialDigest({}…)", hex.get(..8).unwrap_or(""))
    }
}

/// Static allow-list of crew digests.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    digests: Vec<CredentialDigest>,
}

impl CredentialStore {
    pub fn new(digests: Vec<CredentialDigest>) -> Self {
        Self { digests }
    }

    /// Builds a store from hex digests, skipping malformed entries.
    ///
    /// The configuration is validated before this is called, so nothing is
    /// skipped in practice.
    pub fn from_hex_digests<I, S>(digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(
            digests
                .into_iter()
                .filter_map(|hex| CredentialDigest::from_hex(hex.as_ref()))
                .collect(),
        )
    }

    /// Returns true if the candidate digest is on the allow-list.
    ///
    /// Every entry is compared in constant time and the scan never stops
    /// early, so timing does not reveal which entry matched.
    pub fn contains(&self, candidate: &CredentialDigest) -> bool {
        self.digests
            .iter()
            .fold(false, |found, digest| digest.ct_eq(candidate) | found)
    }

    /// Authorizes a client's credentials.
    pub fn authorize(&self, candidate: &Credentials) -> bool {
        CredentialDigest::from_credentials(candidate)
            .map(|digest| self.contains(&digest))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(username: &str, password: &str) -> CredentialStore {
        CredentialStore::new(vec![CredentialDigest::from_password(username, password)])
    }

    #[test]
    fn test_digest_is_sha512_hex_of_joined_pair() {
        let digest = CredentialDigest::from_password("skipper", "ahoy");
        let mut hasher = Sha512::new();
        hasher.update("skipper§ahoy".as_bytes());
        let expected = hex::encode(hasher.finalize());

        assert_eq!(digest.to_hex(), expected);
        assert_eq!(digest.to_hex().len(), DIGEST_HEX_LEN);
    }

    #[test]
    fn test_from_hex_round_trip_and_case() {
        let digest = CredentialDigest::from_password("skipper", "ahoy");
        let hex = digest.to_hex();

        assert_eq!(CredentialDigest::from_hex(&hex), Some(digest.clone()));
        assert_eq!(
            CredentialDigest::from_hex(&hex.to_uppercase()),
            Some(digest)
        );
    }

    #[test]
    fn test_from_hex_rejects_malformed() {
        assert!(CredentialDigest::from_hex("").is_none());
        assert!(CredentialDigest::from_hex("abcd").is_none());
        assert!(CredentialDigest::from_hex(&"z".repeat(DIGEST_HEX_LEN)).is_none());

        let hex = CredentialDigest::from_password("skipper", "ahoy").to_hex();
        assert!(CredentialDigest::from_hex(&format!(" {hex}\n")).is_none());
    }

    #[test]
    fn test_token_must_match_issued_rendering() {
        let store = store_with("skipper", "ahoy");
        let token = CredentialDigest::from_password("skipper", "ahoy").to_hex();

        assert!(store.authorize(&Credentials::token(token.as_str())));
        assert!(!store.authorize(&Credentials::token(token.to_uppercase())));
        assert!(!store.authorize(&Credentials::token(format!("{token} "))));
        assert!(!store.authorize(&Credentials::token(format!(" {token}"))));
    }

    #[test]
    fn test_authorize_password() {
        let store = store_with("skipper", "ahoy");

        assert!(store.authorize(&Credentials::password("skipper", "ahoy")));
        assert!(!store.authorize(&Credentials::password("skipper", "wrong")));
        assert!(!store.authorize(&Credentials::password("deckhand", "ahoy")));
    }

    #[test]
    fn test_authorize_token() {
        let store = store_with("skipper", "ahoy");
        let token = CredentialDigest::from_password("skipper", "ahoy").to_hex();

        assert!(store.authorize(&Credentials::token(token)));
        assert!(!store.authorize(&Credentials::token("not-a-token")));
        assert!(!store.authorize(&Credentials::token(
            CredentialDigest::from_password("x", "y").to_hex()
        )));
    }

    #[test]
    fn test_separator_matters() {
        // "ab" + "§" + "c" must not collide with "a" + "§" + "bc"
        let store = store_with("ab", "c");
        assert!(!store.authorize(&Credentials::password("a", "bc")));
    }

    #[test]
    fn test_empty_store_authorizes_nobody() {
        let store = CredentialStore::default();
        assert!(store.is_empty());
        assert!(!store.authorize(&Credentials::password("", "")));
    }

    #[test]
    fn test_from_hex_digests_skips_malformed() {
        let good = CredentialDigest::from_password("skipper", "ahoy").to_hex();
        let store = CredentialStore::from_hex_digests([good.as_str(), "garbage"]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_debug_does_not_print_full_digest() {
        let digest = CredentialDigest::from_password("skipper", "ahoy");
        let debug = format!("{digest:?}");
        assert!(!debug.contains(&digest.to_hex()));
    }
}
