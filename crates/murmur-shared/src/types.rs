use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{BUCKET_WINDOW_MS, HANDLE_ALPHABET, HANDLE_LEN};
use crate::error::{CryptoError, HandleError};

// Public handle = 8 alphanumeric characters, the only user-facing identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

impl Handle {
    pub fn parse(s: &str) -> Result<Self, HandleError> {
        let got = s.chars().count();
        if got != HANDLE_LEN {
            return Err(HandleError::Length {
                expected: HANDLE_LEN,
                got,
            });
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(HandleError::Character(c));
        }
        Ok(Self(s.to_string()))
    }

    /// Mint a random handle from [`HANDLE_ALPHABET`].
    pub fn generate() -> Result<Self, CryptoError> {
        let mut raw = [0u8; HANDLE_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut raw)
            .map_err(|_| CryptoError::EntropyUnavailable)?;
        let handle = raw
            .iter()
            .map(|b| HANDLE_ALPHABET[*b as usize % HANDLE_ALPHABET.len()] as char)
            .collect();
        Ok(Self(handle))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Handle {
    type Error = HandleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Handle> for String {
    fn from(h: Handle) -> Self {
        h.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic identifier for the unordered pair of participants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// Both orderings of the pair produce the same id.
    pub fn between(a: &Handle, b: &Handle) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{lo}_{hi}"))
    }

    /// The two participant handles, lowest first.
    pub fn participants(&self) -> Option<(Handle, Handle)> {
        let (lo, hi) = self.0.split_once('_')?;
        Some((Handle::parse(lo).ok()?, Handle::parse(hi).ok()?))
    }

    /// The participant that is not `me`.
    pub fn peer_of(&self, me: &Handle) -> Option<Handle> {
        let (lo, hi) = self.participants()?;
        if &lo == me {
            Some(hi)
        } else if &hi == me {
            Some(lo)
        } else {
            None
        }
    }

    pub fn to_topic(&self) -> String {
        format!("channel:{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Forward-only transitions, plus `failed -> pending` for a caller retry.
    /// Re-applying the current status is accepted as a no-op.
    pub fn can_transition_to(self, next: Self) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Sent)
                | (Pending, Delivered)
                | (Pending, Failed)
                | (Sent, Sent)
                | (Sent, Delivered)
                | (Delivered, Delivered)
                | (Failed, Failed)
                | (Failed, Pending)
        )
    }
}

/// Bucket id for a creation timestamp (Unix epoch millis).
pub fn bucket_of(created_at_ms: i64) -> i64 {
    created_at_ms.div_euclid(BUCKET_WINDOW_MS)
}

/// Current time as Unix epoch millis.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> Handle {
        Handle::parse(s).unwrap()
    }

    #[test]
    fn test_handle_validation() {
        assert!(Handle::parse("AAAAAAAA").is_ok());
        assert!(Handle::parse("ab12CD34").is_ok());
        assert_eq!(
            Handle::parse("SHORT"),
            Err(HandleError::Length {
                expected: 8,
                got: 5
            })
        );
        assert_eq!(Handle::parse("AAAA-AAA"), Err(HandleError::Character('-')));
    }

    #[test]
    fn test_generated_handle_uses_alphabet() {
        let handle = Handle::generate().unwrap();
        assert_eq!(handle.as_str().len(), HANDLE_LEN);
        assert!(handle.as_str().bytes().all(|b| HANDLE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_channel_id_is_order_independent() {
        let a = h("BBBBBBBB");
        let b = h("AAAAAAAA");
        assert_eq!(ChannelId::between(&a, &b), ChannelId::between(&b, &a));
        assert_eq!(ChannelId::between(&a, &b).as_str(), "AAAAAAAA_BBBBBBBB");
    }

    #[test]
    fn test_channel_peer_of() {
        let a = h("AAAAAAAA");
        let b = h("BBBBBBBB");
        let channel = ChannelId::between(&a, &b);
        assert_eq!(channel.peer_of(&a), Some(b.clone()));
        assert_eq!(channel.peer_of(&b), Some(a));
        assert_eq!(channel.peer_of(&h("CCCCCCCC")), None);
    }

    #[test]
    fn test_bucket_monotonicity() {
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(1000), 0);
        assert_eq!(bucket_of(BUCKET_WINDOW_MS - 1), 0);
        assert_eq!(bucket_of(BUCKET_WINDOW_MS), 1);

        let t1 = 3 * BUCKET_WINDOW_MS + 17;
        let t2 = 4 * BUCKET_WINDOW_MS - 1;
        assert_eq!(bucket_of(t1), bucket_of(t2));
        assert_ne!(bucket_of(t2), bucket_of(t2 + 1));
    }

    #[test]
    fn test_status_transitions() {
        use DeliveryStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Pending));
        assert!(!Sent.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Delivered));
    }
}
