//! Out-of-band control messages carried in a channel payload.
//!
//! Two encodings are accepted: XML elements (`<id>..</id><command>..</command>`,
//! optionally wrapped in a `<route>` document) and `key=value` pairs separated by
//! `;`, `&` or newlines. Only `{id, command}` are decoded.

use std::fmt;
use std::str::FromStr;

use crate::errors::ControlError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Terminate,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "terminate" => Ok(Self::Terminate),
            other => Err(ControlError::UnknownCommand(other.to_string())),
        }
    }
}

/// A decoded control message. `id` names either the broker itself or an
/// in-flight request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    pub id: String,
    pub command: ControlCommand,
}

impl ControlMessage {
    pub fn terminate(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: ControlCommand::Terminate,
        }
    }

    pub fn parse(payload: &str) -> Result<Self, ControlError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(ControlError::Empty);
        }

        let (id, command) = if payload.starts_with('<') {
            (xml_value(payload, "id"), xml_value(payload, "command"))
        } else {
            (kv_value(payload, "id"), kv_value(payload, "command"))
        };

        let id = id
            .filter(|v| !v.is_empty())
            .ok_or(ControlError::MissingField("id"))?;
        let command = command.ok_or(ControlError::MissingField("command"))?;
        Ok(Self {
            id: id.to_string(),
            command: command.parse()?,
        })
    }

    /// XML form, as understood by peer routers.
    pub fn encode(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><!DOCTYPE route><route><id>{}</id><command>{}</command></route>",
            self.id, self.command
        )
    }
}

fn xml_value<'a>(doc: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = doc.find(&open)? + open.len();
    let len = doc[start..].find(&close)?;
    Some(doc[start..start + len].trim())
}

fn kv_value<'a>(doc: &'a str, key: &str) -> Option<&'a str> {
    doc.split([';', '&', '\n'])
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
}
