//! Wire codec (§4.1 / C1): encode/decode of the JSON-array frames exchanged
//! with a relay.
//!
//! Grounded in `parser::relays::types::{ClientMessage, RelayMessage}`, but
//! widened to the full verb set this runtime needs: the teacher's enum only
//! covers EVENT/REQ/CLOSE outbound and EVENT/OK/EOSE/CLOSED/NOTICE inbound,
//! because its product never authenticates to a relay or issues NIP-45
//! counts. This runtime's RPC layer (§4.6) needs AUTH, and the pool's
//! diagnostics surface needs COUNT, so both are added here in the same shape
//! as the teacher's existing variants.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::event::{Event, Filter};

/// A frame sent to a relay.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Event(Event),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close {
        subscription_id: String,
    },
    Auth(Event),
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
}

impl ClientMessage {
    /// Builds the exact wire array; `serde_json::to_string` on a `Value`
    /// array preserves declaration order and emits no extraneous whitespace.
    pub fn to_json(&self) -> String {
        let value = match self {
            ClientMessage::Event(event) => {
                serde_json::json!(["EVENT", event])
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![Value::from("REQ"), Value::from(subscription_id.clone())];
                arr.extend(filters.iter().map(|f| serde_json::to_value(f).unwrap()));
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
            ClientMessage::Auth(event) => {
                serde_json::json!(["AUTH", event])
            }
            ClientMessage::Count {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![Value::from("COUNT"), Value::from(subscription_id.clone())];
                arr.extend(filters.iter().map(|f| serde_json::to_value(f).unwrap()));
                Value::Array(arr)
            }
        };
        value.to_string()
    }
}

/// A frame received from a relay.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Eose {
        subscription_id: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
    Count {
        subscription_id: String,
        count: u64,
    },
}

fn arr_str(arr: &[Value], idx: usize, what: &str) -> Result<String> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| RelayError::protocol(format!("{what}: missing or non-string field {idx}")))
}

impl RelayMessage {
    /// Parses a single text frame. Rejects malformed shapes (non-array,
    /// missing verb, wrong arity for a known verb); an unrecognized verb is
    /// treated the same as a `NOTICE` so a relay adding a new message type
    /// doesn't break the connection (§8, open question: CLOSED for an
    /// unknown subscription id is likewise NOTICE-equivalent — decided at
    /// the connection layer, not here, since this function has no
    /// subscription registry to consult).
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RelayError::protocol(format!("invalid JSON: {e}")))?;
        let arr = value
            .as_array()
            .ok_or_else(|| RelayError::protocol("frame is not a JSON array"))?;
        let verb = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::protocol("frame missing verb"))?;

        match verb {
            "EVENT" => {
                let subscription_id = arr_str(arr, 1, "EVENT")?;
                let event_value = arr
                    .get(2)
                    .ok_or_else(|| RelayError::protocol("EVENT: missing event body"))?;
                let event: Event = serde_json::from_value(event_value.clone())
                    .map_err(|e| RelayError::protocol(format!("EVENT: malformed event: {e}")))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                let event_id = arr_str(arr, 1, "OK")?;
                let accepted = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| RelayError::protocol("OK: missing accepted flag"))?;
                let message = arr.get(3).and_then(Value::as_str).unwrap_or("").to_owned();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: arr_str(arr, 1, "EOSE")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: arr_str(arr, 1, "CLOSED")?,
                message: arr.get(2).and_then(Value::as_str).unwrap_or("").to_owned(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: arr.get(1).and_then(Value::as_str).unwrap_or("").to_owned(),
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: arr_str(arr, 1, "AUTH")?,
            }),
            "COUNT" => {
                let subscription_id = arr_str(arr, 1, "COUNT")?;
                let count = arr
                    .get(2)
                    .and_then(Value::as_object)
                    .and_then(|o| o.get("count"))
                    .and_then(Value::as_u64)
                    .ok_or_else(|| RelayError::protocol("COUNT: missing count field"))?;
                Ok(RelayMessage::Count {
                    subscription_id,
                    count,
                })
            }
            other => Ok(RelayMessage::Notice {
                message: format!("unrecognized verb {other}"),
            }),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CountBody {
    count: u64,
}

/// Rejects a `REQ`/`COUNT` filter set that can never match anything: an
/// empty array, or any individual filter with every field unset (§8: "empty
/// filter set on REQ is rejected by C1"). Classified `Configuration` per §7
/// — an invalid filter is a caller mistake, not a runtime validation
/// failure, so it's surfaced the same way a bad relay URL scheme is.
pub fn validate_req_filters(filters: &[Filter]) -> Result<()> {
    if filters.is_empty() {
        return Err(RelayError::configuration("REQ/COUNT requires at least one filter"));
    }
    if filters.iter().any(Filter::is_empty) {
        return Err(RelayError::configuration(
            "REQ/COUNT filter must constrain at least one field",
        ));
    }
    Ok(())
}
