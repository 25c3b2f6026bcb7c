//! Versioned wire codec and the request envelope.
//!
//! Every byte sequence a store persists or a request serializes to starts
//! with a 2-byte little-endian version tag followed by a bincode body.
//! Encoders write the version the request asks for; decoders accept every
//! tag up to the current revision and reject unknown or truncated input
//! with [`Error::Codec`], never a panic.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::command::Command;
use crate::error::Error;
use crate::state::RemoteState;

/// Wire format revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WireVersion {
    V1,
}

impl Default for WireVersion {
    fn default() -> Self {
        WireVersion::CURRENT
    }
}

impl WireVersion {
    pub const CURRENT: WireVersion = WireVersion::V1;

    fn tag(self) -> u16 {
        match self {
            WireVersion::V1 => 1,
        }
    }

    fn from_tag(tag: u16) -> Option<WireVersion> {
        match tag {
            1 => Some(WireVersion::V1),
            _ => None,
        }
    }
}

/// What a client ships to a backend for one round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    /// Wire version the backend must write state in.
    pub version: WireVersion,
    /// Client-supplied clock reading. When present it overrides the
    /// backend's clock, pinning the transition to the client's notion of
    /// "now" (determinism in tests, skew mitigation across nodes).
    pub client_time_nanos: Option<u64>,
    /// TTL policy the store applies to the row it writes.
    pub expiration: Option<ExpirationPolicy>,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Request {
            command,
            version: WireVersion::CURRENT,
            client_time_nanos: None,
            expiration: None,
        }
    }

    pub fn with_client_time(mut self, now_nanos: u64) -> Self {
        self.client_time_nanos = Some(now_nanos);
        self
    }

    pub fn with_expiration(mut self, policy: ExpirationPolicy) -> Self {
        self.expiration = Some(policy);
        self
    }
}

/// How long a written row stays alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationPolicy {
    /// Flat TTL per write.
    FixedTtl { ttl_nanos: u64 },
    /// TTL sized to the time the bucket needs to refill completely, floored
    /// at `min_ttl_nanos`. A forgotten bucket expires as soon as keeping it
    /// would change nothing.
    BasedOnRefill { min_ttl_nanos: u64 },
}

impl ExpirationPolicy {
    pub fn fixed(ttl: Duration) -> Self {
        ExpirationPolicy::FixedTtl { ttl_nanos: saturating_nanos(ttl) }
    }

    pub fn based_on_refill(min_ttl: Duration) -> Self {
        ExpirationPolicy::BasedOnRefill { min_ttl_nanos: saturating_nanos(min_ttl) }
    }

    /// TTL for a row holding `state` written at `now_nanos`.
    pub fn ttl_nanos(&self, state: &RemoteState, now_nanos: u64) -> u64 {
        match self {
            ExpirationPolicy::FixedTtl { ttl_nanos } => *ttl_nanos,
            ExpirationPolicy::BasedOnRefill { min_ttl_nanos } => {
                state.nanos_to_full(now_nanos).max(*min_ttl_nanos)
            }
        }
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

pub fn encode_state(state: &RemoteState, version: WireVersion) -> Result<Vec<u8>, Error> {
    encode(state, version)
}

pub fn decode_state(bytes: &[u8]) -> Result<RemoteState, Error> {
    decode(bytes)
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, Error> {
    encode(request, request.version)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, Error> {
    decode(bytes)
}

fn encode<T: Serialize>(value: &T, version: WireVersion) -> Result<Vec<u8>, Error> {
    let mut out = version.tag().to_le_bytes().to_vec();
    bincode::serialize_into(&mut out, value).map_err(|err| Error::codec(err.to_string()))?;
    Ok(out)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    if bytes.len() < 2 {
        return Err(Error::codec("truncated envelope, version tag missing"));
    }
    let tag = u16::from_le_bytes([bytes[0], bytes[1]]);
    // There is a single extant revision; the match grows with the format.
    match WireVersion::from_tag(tag) {
        Some(WireVersion::V1) => {
            bincode::deserialize(&bytes[2..]).map_err(|err| Error::codec(err.to_string()))
        }
        None => Err(Error::codec(format!("unsupported wire version {tag}"))),
    }
}
