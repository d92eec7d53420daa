//! Field address resolution.
//!
//! Guests name what they want to read or write with a single token: either
//! a header name (`Type`, `Timestamp`, ...), the encoded-bytes pseudo target
//! `raw`, or a field reference of the form `Fields[<name>]`.

use std::fmt;
use std::str::FromStr;

/// Extract the field name from a `Fields[<name>]` reference.
///
/// Returns `None` for anything that is not a field reference.  The name is
/// taken verbatim, so `Fields[]` names the empty field and `Fields[a]b]`
/// names `a]b`.
pub fn parse_field_reference(token: &str) -> Option<&str> {
    token.strip_prefix("Fields[")?.strip_suffix(']')
}

/// A message header addressable by guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Header {
    Type,
    Logger,
    Payload,
    EnvVersion,
    Hostname,
    Uuid,
    Timestamp,
    Severity,
    Pid,
}

impl Header {
    pub const ALL: [Header; 9] = [
        Self::Type,
        Self::Logger,
        Self::Payload,
        Self::EnvVersion,
        Self::Hostname,
        Self::Uuid,
        Self::Timestamp,
        Self::Severity,
        Self::Pid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Type => "Type",
            Self::Logger => "Logger",
            Self::Payload => "Payload",
            Self::EnvVersion => "EnvVersion",
            Self::Hostname => "Hostname",
            Self::Uuid => "Uuid",
            Self::Timestamp => "Timestamp",
            Self::Severity => "Severity",
            Self::Pid => "Pid",
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Header {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|h| h.as_str() == s).ok_or(())
    }
}

/// What a guest token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Header(Header),
    Field(&'a str),
    /// The pack's encoded message bytes (read-only).
    Raw,
    Unknown(&'a str),
}

impl<'a> Target<'a> {
    /// Classify `token`.  Total: every input maps to exactly one target.
    pub fn resolve(token: &'a str) -> Self {
        if let Some(name) = parse_field_reference(token) {
            return Self::Field(name);
        }
        if token == "raw" {
            return Self::Raw;
        }
        match token.parse() {
            Ok(header) => Self::Header(header),
            Err(()) => Self::Unknown(token),
        }
    }
}
