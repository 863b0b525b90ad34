use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv6Addr};

/// Role flags supplied by the user-management system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Moderator,
    Trusted,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActorId {
    /// A registered account.
    User(u64),
    /// An identity without an account, such as a client IP or an email address.
    Anonymous(String),
}

/// The account or anonymous identity attempting an action.
///
/// Actors are read-only from the rate limiter's point of view.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: ActorId,
    /// When the account was registered, required for [ActorId::User].
    pub created_at: Option<DateTime<Utc>>,
    pub roles: Vec<Role>,
}

impl Actor {
    pub fn user(id: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ActorId::User(id),
            created_at: Some(created_at),
            roles: Vec::new(),
        }
    }

    pub fn anonymous(key: impl Into<String>) -> Self {
        Self {
            id: ActorId::Anonymous(key.into()),
            created_at: None,
            roles: Vec::new(),
        }
    }

    /// An anonymous actor keyed by client IP address.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn from_ip(addr: &str) -> Result<Self, Error> {
        Ok(Self::anonymous(ip_key(addr)?))
    }

    pub fn with_role(mut self, role: Role) -> Self {
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.id, ActorId::Anonymous(_))
    }

    /// The key segment identifying this actor in the counter store.
    pub fn cache_key(&self) -> Result<String, Error> {
        match &self.id {
            ActorId::User(0) => Err(Error::InvalidActor("user id must be non-zero".into())),
            ActorId::User(id) => {
                if self.created_at.is_none() {
                    return Err(Error::InvalidActor(format!(
                        "user {id} has no creation timestamp"
                    )));
                }
                Ok(format!("user:{id}"))
            }
            ActorId::Anonymous(key) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(Error::InvalidActor("anonymous key is blank".into()));
                }
                Ok(format!("anon:{key}"))
            }
        }
    }
}

impl Display for Actor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            ActorId::User(id) => write!(f, "user {id}"),
            ActorId::Anonymous(key) => write!(f, "anonymous {key}"),
        }
    }
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(ip_str: &str) -> Result<String, Error> {
    let ip = ip_str
        .trim()
        .parse::<IpAddr>()
        .map_err(|e| Error::InvalidActor(format!("unable to parse IP address {ip_str:?}: {e}")))?;
    Ok(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Ok(v4.to_string());
            }
            let s = v6.segments();
            let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
            format!("{subnet}/64")
        }
    })
}
