use std::fmt;
use std::str::FromStr;

use ulid::Ulid;

use crate::server::{Headers, RawRequest};

/// Header carrying the request id in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Where a [`RequestId`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdOrigin {
    /// Adopted from the inbound `x-request-id` header.
    Inbound,
    /// Minted by the engine for this call.
    Minted,
}

/// Identifier of one top-level `service` call, shared by every frame of its
/// dispatch stack and by the async context that may resume it.
///
/// An inbound ULID is adopted so that ids stay stable across a proxy hop.
/// Anything else in the header is ignored and a fresh id is minted.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct RequestId {
    id: Ulid,
    origin: IdOrigin,
}

impl RequestId {
    #[must_use]
    pub fn mint() -> Self {
        Self {
            id: Ulid::new(),
            origin: IdOrigin::Minted,
        }
    }

    /// The id for `request`, adopted from its header when it holds a ULID.
    #[must_use]
    pub fn for_request(request: &dyn RawRequest) -> Self {
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.trim().parse::<Ulid>().ok())
            .map_or_else(Self::mint, |id| Self {
                id,
                origin: IdOrigin::Inbound,
            })
    }

    #[must_use]
    pub fn origin(&self) -> IdOrigin {
        self.origin
    }

    #[must_use]
    pub fn ulid(&self) -> Ulid {
        self.id
    }

    /// Write the id into outgoing `headers` unless one is already present.
    pub fn echo(&self, headers: &mut Headers) {
        if !headers.contains(REQUEST_ID_HEADER) {
            headers.set(REQUEST_ID_HEADER, self.to_string());
        }
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::mint()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

impl FromStr for RequestId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            id: Ulid::from_string(s)?,
            origin: IdOrigin::Inbound,
        })
    }
}
