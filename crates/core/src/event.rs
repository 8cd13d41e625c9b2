//! Data model (§3): events, filters, tags, and the replaceable-kind rules
//! consumed by the cache (§4.4).
//!
//! Grounded in `shared::types::nostr::{Event, Filter}` from the teacher, but
//! rebuilt on `serde`/`serde_json` rather than the teacher's hand-rolled byte
//! scanner: this crate has no flatbuffer wire format to optimize against, and
//! `serde_json` is already the teacher's own dependency for every JSON
//! envelope that isn't on the WASM hot path.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RelayError, Result};

macro_rules! hex32_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_hex(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)
                    .map_err(|_| RelayError::validation(format!("invalid hex: {s}")))?;
                if bytes.len() != 32 {
                    return Err(RelayError::validation(format!(
                        "expected 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                $name::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex32_newtype!(EventId);
hex32_newtype!(PublicKey);

impl RelayError {
    // local helper so event.rs doesn't need to spell RelayError::Validation everywhere
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        RelayError::Validation(msg.into())
    }
}

pub type Kind = u16;
pub type Tag = Vec<String>;

pub const KIND_METADATA: Kind = 0;
pub const KIND_TEXT_NOTE: Kind = 1;
pub const KIND_CONTACT_LIST: Kind = 3;
pub const KIND_ENCRYPTED_DM: Kind = 4;

/// Is this kind's newest instance the only one the cache should retain,
/// keyed purely by (kind, pubkey)? (§4.4)
pub fn is_replaceable(kind: Kind) -> bool {
    kind == 0 || kind == 3 || (10_000..20_000).contains(&kind)
}

/// Is this kind replaceable per (kind, pubkey, d-tag)? (§4.4)
pub fn is_parameterized_replaceable(kind: Kind) -> bool {
    (30_000..40_000).contains(&kind)
}

fn first_tag_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.first().map(|s| s.as_str()) == Some(name))
        .and_then(|t| t.get(1))
        .map(|s| s.as_str())
}

/// `d` tag value used as the third component of a parameterized-replaceable
/// key; empty string if absent (NIP-01 default).
pub fn d_tag(tags: &[Tag]) -> &str {
    first_tag_value(tags, "d").unwrap_or("")
}

/// An event before it has been signed; the `Signer` collaborator turns this
/// into an `Event` (§6).
#[derive(Clone, Debug)]
pub struct UnsignedEvent {
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(pubkey: PublicKey, kind: Kind, content: impl Into<String>, now: u64) -> Self {
        Self {
            pubkey,
            created_at: now,
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Canonical serialization used for id hashing (§6):
    /// `[0, pubkey, created_at, kind, tags, content]`, no extraneous
    /// whitespace, tags in insertion order. Hashing it (SHA-256) is the
    /// collaborator's job (`Signer::hash`); this function only builds the
    /// bytes the collaborator hashes, so the wire format is pinned inside
    /// the core even though the hash function itself is not.
    pub fn canonical_json(&self) -> String {
        #[derive(Serialize)]
        struct Canonical<'a>(u8, &'a str, u64, Kind, &'a [Tag], &'a str);
        serde_json::to_string(&Canonical(
            0,
            &self.pubkey.to_hex(),
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
        .expect("canonical event serialization is infallible")
    }
}

/// An immutable, signed event (§3). Equality and hashing are by `id` only,
/// matching the invariant that two events sharing an id are the same event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Event {}

impl Event {
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Replaceable-key this event supersedes, if any (§4.4).
    pub fn replace_key(&self) -> Option<String> {
        if is_replaceable(self.kind) {
            Some(format!("{}:{}", self.kind, self.pubkey.to_hex()))
        } else if is_parameterized_replaceable(self.kind) {
            Some(format!(
                "{}:{}:{}",
                self.kind,
                self.pubkey.to_hex(),
                d_tag(&self.tags)
            ))
        } else {
            None
        }
    }

    /// `created_at` ≤ now + skew (§3). One second beyond the boundary is
    /// rejected per §8's boundary behavior.
    pub fn within_clock_skew(&self, now: u64, skew_secs: u64) -> bool {
        self.created_at <= now.saturating_add(skew_secs)
    }
}

/// Selection predicate (§3). `None` on a field means "unconstrained";
/// `Some(vec)` with set-membership semantics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<EventId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PublicKey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<Kind>>,
    #[serde(flatten, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub tags: std::collections::BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.tags.is_empty()
            && self.since.is_none()
            && self.until.is_none()
            && self.limit.is_none()
    }

    /// §3: event matches iff every present constraint matches.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (tag_name, values) in &self.tags {
            // tag-selector keys are serialized as "#x"; strip the marker.
            let name = tag_name.strip_prefix('#').unwrap_or(tag_name);
            let has_match = event.tags.iter().any(|t| {
                t.first().map(|s| s.as_str()) == Some(name)
                    && t.get(1).map(|v| values.contains(v)).unwrap_or(false)
            });
            if !has_match {
                return false;
            }
        }
        true
    }

    pub fn with_tag(mut self, name: &str, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{name}"), values);
        self
    }
}

/// An event matches an intent iff it matches any of the intent's filters (§3).
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(byte: u8) -> PublicKey {
        PublicKey([byte; 32])
    }

    #[test]
    fn hex_roundtrip() {
        let id = EventId([7u8; 32]);
        let hex = id.to_hex();
        assert_eq!(EventId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn filter_matches_set_membership() {
        let event = Event {
            id: EventId([1; 32]),
            pubkey: pk(2),
            created_at: 100,
            kind: 1,
            tags: vec![vec!["p".into(), "abc".into()]],
            content: "hi".into(),
            sig: "00".repeat(64),
        };

        let f = Filter::new().with_tag("p", vec!["abc".into()]);
        assert!(f.matches(&event));

        let f2 = Filter {
            kinds: Some(vec![2]),
            ..Default::default()
        };
        assert!(!f2.matches(&event));
    }

    #[test]
    fn since_until_boundaries() {
        let event = Event {
            id: EventId([1; 32]),
            pubkey: pk(2),
            created_at: 100,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "00".repeat(64),
        };
        assert!(Filter {
            since: Some(100),
            ..Default::default()
        }
        .matches(&event));
        assert!(!Filter {
            since: Some(101),
            ..Default::default()
        }
        .matches(&event));
        assert!(Filter {
            until: Some(100),
            ..Default::default()
        }
        .matches(&event));
        assert!(!Filter {
            until: Some(99),
            ..Default::default()
        }
        .matches(&event));
    }

    #[test]
    fn replaceable_key_shapes() {
        let mut e = Event {
            id: EventId([0; 32]),
            pubkey: pk(9),
            created_at: 1,
            kind: 0,
            tags: vec![],
            content: String::new(),
            sig: "00".repeat(64),
        };
        assert!(e.replace_key().is_some());
        e.kind = 30001;
        e.tags = vec![vec!["d".into(), "profile".into()]];
        assert_eq!(
            e.replace_key().unwrap(),
            format!("30001:{}:profile", pk(9).to_hex())
        );
        e.kind = 1;
        assert!(e.replace_key().is_none());
    }

    #[test]
    fn clock_skew_boundary() {
        let event = Event {
            id: EventId([0; 32]),
            pubkey: pk(1),
            created_at: 160,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "00".repeat(64),
        };
        assert!(event.within_clock_skew(100, 60));
        assert!(!event.within_clock_skew(98, 60));
    }
}
