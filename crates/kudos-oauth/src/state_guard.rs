//! One-shot CSRF state tokens for the OAuth install round trip.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore as _;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Lifetime of an issued state token.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(10 * 60);

const STATE_TOKEN_BYTES: usize = 32;

/// In-memory, time-bounded store of outstanding OAuth state tokens.
///
/// Tokens are single-use: `consume` removes the entry whether or not it
/// is still valid, so two racing callbacks can never both pass. State is
/// deliberately not durable across restarts; the token only has to
/// survive one browser round trip.
#[derive(Debug)]
pub struct StateGuard {
    ttl: Duration,
    states: Mutex<HashMap<String, Instant>>,
}

impl Default for StateGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl StateGuard {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_STATE_TTL)
    }

    /// Guard with a custom token lifetime, mainly for tests.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a fresh unpredictable token and records its expiry.
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; STATE_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = BASE64_URL.encode(bytes);

        let expiry = Instant::now() + self.ttl;
        let mut states = self.states.lock().expect("state guard lock");
        states.retain(|_, entry_expiry| *entry_expiry > Instant::now());
        states.insert(token.clone(), expiry);
        token
    }

    /// Consumes `token`, returning whether it was outstanding and
    /// unexpired. The entry is removed either way.
    pub fn consume(&self, token: &str) -> bool {
        let mut states = self.states.lock().expect("state guard lock");
        match states.remove(token) {
            Some(expiry) => Instant::now() < expiry,
            None => false,
        }
    }

    /// Number of outstanding tokens, expired or not.
    pub fn outstanding(&self) -> usize {
        self.states.lock().expect("state guard lock").len()
    }
}
