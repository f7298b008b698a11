//! The goal state wire format
//!
//! The controller encodes dirty dataplane state into [`Events`] messages and
//! node daemons decode and replay them. Payloads are binary: a u32 item count
//! followed by one u32 length prefixed JSON document per item. Decoders refuse
//! empty payloads outright so a truncated frame can never look like an empty
//! delta.

use bytes::{Buf, BufMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

use super::ipsets::IpSetMetadata;
use super::pods::PodMetadata;
use crate::Error;

/// The payload key for sets to create or update
pub const SET_APPLY: &str = "IPSETAPPLY";

/// The payload key for sets to remove
pub const SET_REMOVE: &str = "IPSETREMOVE";

/// The payload key for policies to install
pub const POLICY_APPLY: &str = "POLICYAPPLY";

/// The payload key for policies to remove
pub const POLICY_REMOVE: &str = "POLICYREMOVE";

/// The kinds of events the goal state channel carries
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EventType {
    /// A delta of dirty state since the last apply
    GoalState,
    /// A full snapshot for a consumer that just (re)connected
    Hydration,
}

/// One encoded payload inside an event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct GoalState {
    /// The encoded items of this payload
    pub data: Vec<u8>,
}

impl GoalState {
    /// Encode a list of items into a payload
    ///
    /// # Arguments
    ///
    /// * `items` - The items to encode
    pub fn encode<T: Serialize>(items: &[T]) -> Result<Self, Error> {
        let mut data = Vec::new();
        // lead with how many items this payload holds
        data.put_u32_le(u32::try_from(items.len()).map_err(|_| Error::new("payload too large"))?);
        for item in items {
            let raw = serde_json::to_vec(item)?;
            // length prefix each item so decoders can frame them
            data.put_u32_le(
                u32::try_from(raw.len()).map_err(|_| Error::new("payload item too large"))?,
            );
            data.put_slice(&raw);
        }
        Ok(GoalState { data })
    }

    /// Decode the items of this payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>, Error> {
        // an empty payload is a framing bug, not an empty delta
        if self.data.is_empty() {
            return Err(Error::validation("refusing to decode an empty payload"));
        }
        let mut buf = &self.data[..];
        if buf.remaining() < 4 {
            return Err(Error::validation("payload truncated before item count"));
        }
        let count = buf.get_u32_le() as usize;
        let mut items = Vec::with_capacity(count);
        for index in 0..count {
            if buf.remaining() < 4 {
                return Err(Error::validation(format!(
                    "payload truncated before item {index} length"
                )));
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(Error::validation(format!(
                    "payload truncated inside item {index}"
                )));
            }
            items.push(serde_json::from_slice(&buf[..len])?);
            buf.advance(len);
        }
        Ok(items)
    }
}

/// A message on the goal state channel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Events {
    /// Whether this is a delta or a full snapshot
    pub event_type: EventType,
    /// The encoded payloads keyed by what they apply to
    pub payloads: HashMap<String, GoalState>,
}

impl Events {
    /// Create an empty event of a type
    ///
    /// # Arguments
    ///
    /// * `event_type` - Whether this is a delta or a full snapshot
    pub fn new(event_type: EventType) -> Self {
        Events {
            event_type,
            payloads: HashMap::default(),
        }
    }

    /// Encode items under a payload key, skipping empty item lists
    ///
    /// # Arguments
    ///
    /// * `key` - The payload key to store the items under
    /// * `items` - The items to encode
    pub fn insert<T: Serialize>(&mut self, key: &str, items: &[T]) -> Result<(), Error> {
        if !items.is_empty() {
            self.payloads
                .insert(key.to_owned(), GoalState::encode(items)?);
        }
        Ok(())
    }

    /// Whether this event carries any payloads at all
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

/// The full state of one set, carried by apply and hydration payloads
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct IpSetSnapshot {
    /// The identity of the set
    pub metadata: Option<IpSetMetadata>,
    /// The generation of the set on the controller
    #[serde(default)]
    pub generation: u64,
    /// The members of a hash set
    #[serde(default)]
    pub members: Vec<PodMetadata>,
    /// The member sets of a list set
    #[serde(default)]
    pub member_sets: Vec<IpSetMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ipsets::SetType;

    #[test]
    fn payloads_roundtrip() {
        let sets = vec![
            IpSetSnapshot {
                metadata: Some(IpSetMetadata::new("x", SetType::Namespace)),
                generation: 3,
                members: vec![PodMetadata::new("10.0.0.1", "x/a", "node-1")],
                member_sets: Vec::default(),
            },
            IpSetSnapshot::default(),
        ];
        let payload = GoalState::encode(&sets).unwrap();
        let decoded: Vec<IpSetSnapshot> = payload.decode().unwrap();
        assert_eq!(decoded, sets);
    }

    #[test]
    fn empty_payloads_are_refused() {
        let payload = GoalState::default();
        let out: Result<Vec<IpSetSnapshot>, Error> = payload.decode();
        assert!(matches!(out, Err(Error::Validation(_))));
    }

    #[test]
    fn truncated_payloads_are_refused() {
        let keys = vec!["x/a".to_owned(), "x/b".to_owned()];
        let mut payload = GoalState::encode(&keys).unwrap();
        payload.data.truncate(payload.data.len() - 3);
        let out: Result<Vec<String>, Error> = payload.decode();
        assert!(matches!(out, Err(Error::Validation(_))));
    }

    #[test]
    fn events_skip_empty_item_lists() {
        let mut event = Events::new(EventType::GoalState);
        let none: Vec<String> = Vec::default();
        event.insert(SET_REMOVE, &none).unwrap();
        assert!(event.is_empty());
        event.insert(POLICY_REMOVE, &["x/base".to_owned()]).unwrap();
        assert!(!event.is_empty());
        assert!(event.payloads.contains_key(POLICY_REMOVE));
    }
}
