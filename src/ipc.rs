//! Publishes Reconciler change events to the configured message bus.
//!
//! The bus itself is an external collaborator; this wires up a Redis pub/sub
//! connection, since that is what the reference tool's current generation uses
//! (an earlier generation published the same shape over a ZeroMQ PUB socket).

use anyhow::Result;
use redis::{Client, Commands, Connection};
use serde::Serialize;

const CHANGE_CHANNEL: &str = "pvector-changes";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Upgrade,
    Overwrite,
    Delete,
}

#[derive(Serialize, Debug, Clone)]
pub struct ChangeEvent {
    pub component: String,
    pub package: String,
    pub architecture: String,
    pub kind: ChangeKind,
    pub old_version: Option<String>,
    pub new_version: Option<String>,
}

pub fn redis_connect(address: &str) -> Result<Connection> {
    let client = Client::open(address)?;
    Ok(client.get_connection()?)
}

/// Publish each event as a JSON message on the change channel.
pub fn publish_change_events(events: &[ChangeEvent], conn: &mut Connection) -> Result<()> {
    for event in events {
        let payload = serde_json::to_string(event)?;
        let _: () = conn.publish(CHANGE_CHANNEL, payload)?;
    }

    Ok(())
}
