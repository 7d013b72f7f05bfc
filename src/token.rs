//! Opaque tokens binding a live [`VerifyFlow`](crate::verify::VerifyFlow) or
//! [`ConnectFlow`](crate::connect::ConnectFlow) to the packets that reference
//! it.
//!
//! A token is 16 bytes of randomness rendered as 32 hex chars. On the wire
//! it is prefixed with a single discriminator character so a peer can echo
//! which side of a flow it is: `'S'` for the server side, `'C'` for the
//! client side. The stored key is always the unprefixed value.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Which side of a flow a prefixed token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSide {
    Server,
    Client,
}

impl TokenSide {
    fn prefix(self) -> char {
        match self {
            TokenSide::Server => 'S',
            TokenSide::Client => 'C',
        }
    }

    fn from_prefix(c: char) -> Option<Self> {
        match c {
            'S' => Some(TokenSide::Server),
            'C' => Some(TokenSide::Client),
            _ => None,
        }
    }
}

/// Render `token` prefixed for a given side, e.g. for embedding in an
/// outbound `GC_CONNECTING`.
pub fn prefixed(token: &str, side: TokenSide) -> String {
    format!("{}{token}", side.prefix())
}

/// Strip a wire-format prefixed token into `(side, unprefixed token)`.
/// Returns `None` for anything that isn't a recognized discriminator
/// followed by at least one character — callers treat that as an unknown
/// token, never an error.
pub fn split_prefix(prefixed: &str) -> Option<(TokenSide, &str)> {
    let mut chars = prefixed.char_indices();
    let (_, first) = chars.next()?;
    let side = TokenSide::from_prefix(first)?;
    let rest_start = chars.next().map(|(i, _)| i).unwrap_or(prefixed.len());
    Some((side, &prefixed[rest_start..]))
}

/// A live flow bound to a token. The table holds just enough to forward
/// events into the flow's task and to cancel it; flow state itself lives
/// inside the spawned task, never behind the table's lock.
pub enum FlowHandle {
    Verify {
        events: mpsc::UnboundedSender<crate::verify::VerifyEvent>,
        task: JoinHandle<()>,
    },
    Connect {
        events: mpsc::UnboundedSender<crate::connect::ConnectEvent>,
        task: JoinHandle<()>,
    },
}

impl Drop for FlowHandle {
    fn drop(&mut self) {
        match self {
            FlowHandle::Verify { task, .. } | FlowHandle::Connect { task, .. } => task.abort(),
        }
    }
}

/// Mapping from opaque (unprefixed) token to a live flow handle.
#[derive(Default)]
pub struct TokenTable {
    tokens: Mutex<HashMap<String, FlowHandle>>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw 16 random bytes, hex-encode, and retry on collision. Collisions
    /// are astronomically unlikely but the table is small enough to check
    /// for free.
    pub fn mint(&self) -> String {
        let tokens = self.tokens.lock();
        loop {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            let candidate = hex::encode(bytes);
            if !tokens.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn bind(&self, token: String, handle: FlowHandle) {
        self.tokens.lock().insert(token, handle);
    }

    /// Look up the flow for a prefixed wire-format token. Unknown tokens are
    /// never an error — a late packet after cleanup is expected — so this
    /// returns `None` rather than faulting.
    pub fn resolve_verify(
        &self,
        prefixed: &str,
    ) -> Option<mpsc::UnboundedSender<crate::verify::VerifyEvent>> {
        let (_, token) = split_prefix(prefixed)?;
        match self.tokens.lock().get(token)? {
            FlowHandle::Verify { events, .. } => Some(events.clone()),
            FlowHandle::Connect { .. } => None,
        }
    }

    pub fn resolve_connect(
        &self,
        prefixed: &str,
    ) -> Option<(TokenSide, mpsc::UnboundedSender<crate::connect::ConnectEvent>)> {
        let (side, token) = split_prefix(prefixed)?;
        match self.tokens.lock().get(token)? {
            FlowHandle::Connect { events, .. } => Some((side, events.clone())),
            FlowHandle::Verify { .. } => None,
        }
    }

    /// Remove and cancel a flow. Idempotent: dropping an unknown token is a
    /// silent no-op.
    pub fn drop_token(&self, token: &str) {
        self.tokens.lock().remove(token);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_produces_unique_32_char_hex_tokens() {
        let table = TokenTable::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let token = table.mint();
            assert_eq!(token.len(), 32);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(token), "mint produced a duplicate without binding");
        }
    }

    #[test]
    fn split_prefix_round_trips() {
        assert_eq!(split_prefix("Sabc123"), Some((TokenSide::Server, "abc123")));
        assert_eq!(split_prefix("Cabc123"), Some((TokenSide::Client, "abc123")));
        assert_eq!(split_prefix("Xabc123"), None);
        assert_eq!(split_prefix(""), None);
        assert_eq!(prefixed("abc123", TokenSide::Client), "Cabc123");
    }

    #[test]
    fn unknown_token_resolves_to_none_not_an_error() {
        let table = TokenTable::new();
        assert!(table.resolve_connect("Cdeadbeef").is_none());
        table.drop_token("never-bound"); // must not panic
    }
}
