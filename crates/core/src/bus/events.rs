use serde::{Deserialize, Serialize};

/// Deliver a text message to a chat channel. Payload: [`SendMessage`].
pub const SEND_MESSAGE: &str = "sendmsg";

/// Request/response: every ticket currently stored.
pub const GET_TICKETS: &str = "getTickets";

/// Payload of [`SEND_MESSAGE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub channel_id: String,
    pub msg: String,
}
