//! Call-fork route planning
//!
//! Translates a prioritized route list into the engine's `callfork` parameter
//! dictionary. Every route gets its own group (groups are separated by `|`
//! entries), so routes are tried strictly in sequence; the engine only dials
//! in parallel within a group and this planner never packs two routes into
//! one.

use crate::constants::FORK_DROP_GRACE_MS;
use crate::error::{PbxError, PbxResult};
use serde::{Deserialize, Serialize};

/// One candidate target for a forked call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForkRoute {
    /// Gateway host, optionally `host:port`. Required.
    pub host: String,
    /// Caller id override for this route.
    pub caller: Option<String>,
    /// Called number override for this route.
    pub called: Option<String>,
    /// Signalling protocol; defaults to `sip`.
    pub protocol: Option<String>,
    /// Codec preference list passed through verbatim (e.g. `g729,g723`).
    pub formats: Option<String>,
    /// Full dial string overriding the computed `proto/uri@host` target.
    pub fullroute: Option<String>,
    /// Outbound line (account) the engine should use.
    pub line: Option<String>,
    /// How long to ring this route before falling through, in ms.
    pub forward_timeout: Option<u64>,
}

impl ForkRoute {
    /// Route to `host` with all other knobs left at their defaults.
    pub fn to_host(host: impl Into<String>) -> Self {
        ForkRoute {
            host: host.into(),
            ..ForkRoute::default()
        }
    }
}

/// Where an outgoing or routed call should go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    /// Called number used when a route has no override.
    pub called: String,
    /// Candidate routes, tried in order. Must not be empty.
    pub routes: Vec<ForkRoute>,
    /// Caller id used when a route has no override.
    pub caller: Option<String>,
    /// Call duration cap in ms; the session default applies when absent.
    pub timeout: Option<u64>,
    /// Setup (pre-answer) cap in ms; the session default applies when absent.
    pub setup_timeout: Option<u64>,
}

impl Destination {
    /// Destination for `called` over the given routes.
    pub fn new(called: impl Into<String>, routes: Vec<ForkRoute>) -> Self {
        Destination {
            called: called.into(),
            routes,
            caller: None,
            timeout: None,
            setup_timeout: None,
        }
    }
}

/// Build the `callfork` parameter list for a destination.
///
/// The returned list starts with `fork.stop=busy` followed by the `callto.N`
/// entries; the caller places the matching `fork` return value in the route
/// reply itself. `fallback_caller` applies when neither the route nor the
/// destination names one.
pub(crate) fn plan(
    dest: &Destination,
    fallback_caller: Option<&str>,
) -> PbxResult<Vec<(String, String)>> {
    if dest.routes.is_empty() {
        return Err(PbxError::InvalidDestination {
            message: "destination has no routes".to_string(),
        });
    }

    let mut params: Vec<(String, String)> = vec![("fork.stop".to_string(), "busy".to_string())];
    let mut pos = 1usize;

    for (index, route) in dest.routes.iter().enumerate() {
        if route.host.is_empty() {
            return Err(PbxError::InvalidDestination {
                message: format!("route {} has no host", index + 1),
            });
        }

        if index > 0 {
            // group separator; `drop=` keeps ringing the previous group for
            // the forward timeout plus a pre-ring grace
            let separator = match route.forward_timeout {
                Some(ms) => format!("|drop={}", ms + FORK_DROP_GRACE_MS),
                None => "|".to_string(),
            };
            params.push((format!("callto.{}", pos), separator));
            pos += 1;
        }

        let protocol = route.protocol.as_deref().unwrap_or("sip");
        let caller = route
            .caller
            .as_deref()
            .or(dest.caller.as_deref())
            .or(fallback_caller)
            .unwrap_or("");
        let called = route.called.as_deref().unwrap_or(&dest.called);
        let called_uri = if protocol == "sip" {
            format!("sip:{}", called)
        } else {
            called.to_string()
        };
        let target = match &route.fullroute {
            Some(fullroute) => fullroute.clone(),
            None => format!("{}/{}@{}", protocol, called_uri, route.host),
        };

        params.push((format!("callto.{}", pos), target));
        params.push((format!("callto.{}.caller", pos), caller.to_string()));
        params.push((format!("callto.{}.callername", pos), caller.to_string()));
        params.push((format!("callto.{}.domain", pos), route.host.clone()));
        params.push((format!("callto.{}.called", pos), called.to_string()));
        if let Some(formats) = &route.formats {
            params.push((format!("callto.{}.formats", pos), formats.clone()));
        }
        if let Some(line) = &route.line {
            params.push((format!("callto.{}.line", pos), line.clone()));
        }
        pos += 1;
    }

    Ok(params)
}
