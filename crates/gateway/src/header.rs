//! Routing header parsing and group identifiers.
//!
//! A delivery names its target groups in one header, whose shape depends on
//! the deployment:
//! - `UserIDs`: comma-separated decimal ids (`"3,7,42"`)
//! - `groupName`: a single string name
//!
//! The header is resolved once at ingestion into a [`ParsedHeader`] and
//! never re-inspected downstream.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Header carrying numeric group ids.
pub const USER_IDS_HEADER: &str = "UserIDs";

/// Header carrying a single group name.
pub const GROUP_NAME_HEADER: &str = "groupName";

/// How this deployment identifies groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Numeric user ids from the `UserIDs` header.
    #[default]
    UserIds,
    /// String names from the `groupName` header.
    GroupName,
}

impl RoutingMode {
    /// Header this mode reads from deliveries.
    pub fn header_name(&self) -> &'static str {
        match self {
            RoutingMode::UserIds => USER_IDS_HEADER,
            RoutingMode::GroupName => GROUP_NAME_HEADER,
        }
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_ids" => Ok(RoutingMode::UserIds),
            "group_name" => Ok(RoutingMode::GroupName),
            other => Err(format!("unknown routing mode '{}'", other)),
        }
    }
}

/// Identifier of one group of connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupId {
    Id(u64),
    Name(String),
}

impl GroupId {
    /// Header key that routes this group's messages to a bound queue.
    pub fn binding_key(&self) -> String {
        match self {
            GroupId::Id(id) => format!("UserID:{}", id),
            GroupId::Name(name) => format!("GroupName:{}", name),
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupId::Id(id) => write!(f, "{}", id),
            GroupId::Name(name) => f.write_str(name),
        }
    }
}

impl From<u64> for GroupId {
    fn from(id: u64) -> Self {
        GroupId::Id(id)
    }
}

impl From<&str> for GroupId {
    fn from(name: &str) -> Self {
        GroupId::Name(name.to_string())
    }
}

/// Routing header resolved at ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedHeader {
    Ids(Vec<u64>),
    Name(String),
    Invalid(String),
}

impl ParsedHeader {
    /// Target groups in header order, or the reason the header is invalid.
    pub fn into_targets(self) -> Result<Vec<GroupId>, String> {
        match self {
            ParsedHeader::Ids(ids) => Ok(ids.into_iter().map(GroupId::Id).collect()),
            ParsedHeader::Name(name) => Ok(vec![GroupId::Name(name)]),
            ParsedHeader::Invalid(reason) => Err(reason),
        }
    }
}

/// Parse a comma-separated list of decimal ids.
///
/// Any empty or non-numeric token makes the whole value invalid.
pub fn parse_user_ids(value: &str) -> ParsedHeader {
    let mut ids = Vec::new();
    for token in value.split(',') {
        let token = token.trim();
        match token.parse::<u64>() {
            Ok(id) => ids.push(id),
            Err(_) => return ParsedHeader::Invalid(format!("bad user id '{}'", token)),
        }
    }
    ParsedHeader::Ids(ids)
}

/// Extract a string from an AMQP header value.
fn header_str(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok().map(str::to_string),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

/// Resolve the routing header of a delivery for the given mode.
pub fn parse_headers(headers: Option<&FieldTable>, mode: RoutingMode) -> ParsedHeader {
    let name = mode.header_name();
    let Some(value) = headers.and_then(|h| h.inner().get(&ShortString::from(name))) else {
        return ParsedHeader::Invalid(format!("missing {} header", name));
    };
    let Some(value) = header_str(value) else {
        return ParsedHeader::Invalid(format!("{} header is not a string", name));
    };

    match mode {
        RoutingMode::UserIds => parse_user_ids(&value),
        RoutingMode::GroupName if value.is_empty() => {
            ParsedHeader::Invalid(format!("empty {} header", name))
        }
        RoutingMode::GroupName => ParsedHeader::Name(value),
    }
}
