//! Carrier trunk registry types
//!
//! A trunk is an upstream SIP account the session registers into. The host
//! declares the full desired set with `set_carriers`; the session diffs it
//! against what is currently known and emits the matching `user.login` /
//! logout dispatches.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One upstream carrier account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trunk {
    /// Registrar host. Required.
    pub host: String,
    /// Registrar port; omitted from the registrar string when absent.
    pub port: Option<u16>,
    /// Account username.
    pub username: Option<String>,
    /// Account password.
    pub password: Option<String>,
    /// Authentication name when it differs from the username.
    pub auth_name: Option<String>,
    /// Authentication domain when it differs from the host.
    pub auth_domain: Option<String>,
}

impl Trunk {
    /// Trunk registering to `host` with the given credentials.
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Trunk {
            host: host.into(),
            username: Some(username.into()),
            password: Some(password.into()),
            ..Trunk::default()
        }
    }

    /// Deterministic registry key (the line-id) for this trunk.
    ///
    /// Two trunks with the same credentials and registrar are the same
    /// account, whatever order their fields were filled in.
    pub fn line_id(&self) -> String {
        format!(
            "{}:{}:{}:{}@{}:{}",
            self.username.as_deref().unwrap_or(""),
            self.password.as_deref().unwrap_or(""),
            self.auth_name.as_deref().unwrap_or(""),
            self.auth_domain.as_deref().unwrap_or(""),
            self.host,
            self.port.map(|p| p.to_string()).unwrap_or_default(),
        )
    }

    /// Registrar string, `host` or `host:port`.
    pub fn registrar(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// Authentication name, defaulting to the username.
    pub fn effective_auth_name(&self) -> Option<&str> {
        self.auth_name.as_deref().or(self.username.as_deref())
    }

    /// Authentication domain, defaulting to the host.
    pub fn effective_domain(&self) -> &str {
        self.auth_domain.as_deref().unwrap_or(&self.host)
    }
}

/// A trunk plus its runtime registration state.
#[derive(Debug, Clone)]
pub(crate) struct CarrierState {
    pub trunk: Trunk,
    /// Set on a successful `user.login` reply, cleared on logout/disconnect.
    pub active: bool,
}

/// A dispatch the registry diff decided on.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CarrierAction {
    /// Register the trunk under the given account (line-id).
    Login { account: String, trunk: Trunk },
    /// Log the removed account out.
    Logout { account: String },
}

/// Compute the new registry and the login/logout actions that make the
/// engine match it.
///
/// Desired entries that are unknown or currently inactive get a login;
/// known-and-active entries are kept untouched; entries missing from the
/// desired set get a logout.
pub(crate) fn diff(
    current: &HashMap<String, CarrierState>,
    desired: &[Trunk],
) -> (HashMap<String, CarrierState>, Vec<CarrierAction>) {
    let mut next = HashMap::new();
    let mut actions = Vec::new();

    for trunk in desired {
        let account = trunk.line_id();
        if next.contains_key(&account) {
            continue;
        }
        let active = current.get(&account).map(|c| c.active).unwrap_or(false);
        if !active {
            actions.push(CarrierAction::Login {
                account: account.clone(),
                trunk: trunk.clone(),
            });
        }
        next.insert(
            account,
            CarrierState {
                trunk: trunk.clone(),
                active,
            },
        );
    }

    for account in current.keys() {
        if !next.contains_key(account) {
            actions.push(CarrierAction::Logout {
                account: account.clone(),
            });
        }
    }

    (next, actions)
}
