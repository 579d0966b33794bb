//! Wire message envelope shared by both directions of the bridge.
//!
//! Every frame body is a JSON object tagged by a `status` field:
//!
//! ```text
//! {"status":"Success","request_id":7,"contents":"1+1"}
//! ```
//!
//! Outbound requests always carry `status: "Success"`; the tag marks a
//! well-formed request, not an outcome. `request_id` is present only on
//! correlated `Success`/`Failure` messages; `Start`, `Check` and `Affirm`
//! never carry one. Tags this client does not know deserialize to
//! [`Message::Unknown`] so newer peers can add statuses without breaking us.

use serde::{Deserialize, Serialize};

/// Contents of the distinguished `Failure` a peer sends when it is already
/// serving another session.
pub const BUSY: &str = "BUSY";

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Message {
    /// Session handshake, sent by the client after connecting.
    Start,
    /// Liveness probe, sent on a transient connection.
    Check,
    /// Peer readiness signal, the positive answer to `Check`.
    Affirm,
    /// Outbound: a well-formed eval request. Inbound: an eval result.
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        #[serde(default)]
        contents: String,
    },
    /// An eval error, or the session-level `"BUSY"` rejection.
    Failure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        #[serde(default)]
        contents: String,
    },
    /// Any status tag introduced after this client was built.
    #[serde(other)]
    Unknown,
}
