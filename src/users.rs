//! Registered local user store
//!
//! Keeps the verbatim `user.register` message per username with a lease
//! derived from its `expires` parameter. Expiry is observed lazily: a lookup
//! that finds a stale lease deletes the entry and reports it, so the session
//! can emit the matching event.

use crate::constants::DEFAULT_REGISTER_EXPIRES_SECS;
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Route literal for a registered local user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRoute {
    /// Calling party passed through to the dial.
    pub caller: String,
    /// Called username.
    pub called: String,
    /// Host the user registered from.
    pub host: String,
    /// The contact route published by the registration.
    pub fullroute: String,
}

#[derive(Debug, Clone)]
struct RegisteredUser {
    message: Message,
    expires_at: u64,
}

/// Outcome of a user lookup.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Lookup {
    /// The user is registered and the lease is current.
    Found(Message),
    /// The lease had lapsed; the entry was just deleted.
    Expired,
    /// No such user.
    Missing,
}

/// Username-keyed registration store.
#[derive(Debug, Default)]
pub(crate) struct LocalUsers {
    map: HashMap<String, RegisteredUser>,
}

impl LocalUsers {
    /// Store a `user.register` message, returning the username it was filed
    /// under. `None` means the message had no username and was not stored.
    pub fn register(&mut self, message: Message) -> Option<String> {
        let username = message.param("username")?.to_string();
        let expires = message
            .param("expires")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REGISTER_EXPIRES_SECS);
        let expires_at = message.time().unwrap_or(0).saturating_add(expires);
        self.map.insert(
            username.clone(),
            RegisteredUser {
                message,
                expires_at,
            },
        );
        Some(username)
    }

    /// Drop a registration, returning whether it existed.
    pub fn unregister(&mut self, username: &str) -> bool {
        self.map.remove(username).is_some()
    }

    /// Look up a user, enforcing the lease against `now` (unix seconds).
    pub fn lookup(&mut self, username: &str, now: u64) -> Lookup {
        match self.map.get(username) {
            None => Lookup::Missing,
            Some(user) if now >= user.expires_at => {
                self.map.remove(username);
                Lookup::Expired
            }
            Some(user) => Lookup::Found(user.message.clone()),
        }
    }

    /// Build the route literal for a registered user.
    ///
    /// `host` comes from the registration's `ip_host` (falling back to the
    /// head of `address`), `fullroute` from its `data` parameter.
    pub fn local_route(message: &Message, caller: &str, called: &str) -> Option<LocalRoute> {
        let host = message
            .param("ip_host")
            .or_else(|| {
                message
                    .param("address")
                    .map(|a| a.split(':').next().unwrap_or(a))
            })?
            .to_string();
        let fullroute = message.param("data")?.to_string();
        Some(LocalRoute {
            caller: caller.to_string(),
            called: called.to_string(),
            host,
            fullroute,
        })
    }
}
