//! OS account resolution and the privilege rules around it.

use crate::config::TaskProfile;
use crate::error::SessionError;
use nix::unistd::{Gid, Group, Uid, User};
use std::path::PathBuf;
use tracing::{debug, warn};

/// The OS account a session runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub home: PathBuf,
}

/// Account lookups and process privileges, injectable so the session core
/// can run in tests without root.
pub trait IdentityProvider: Send + Sync {
    /// Look up an account by name or numeric uid.
    fn lookup_user(&self, name_or_id: &str) -> Result<Identity, SessionError>;

    /// Look up a group by name or numeric gid.
    fn lookup_group(&self, name_or_id: &str) -> Result<u32, SessionError>;

    /// The account the agent itself runs as.
    fn current(&self) -> Result<Identity, SessionError>;

    /// Whether the agent may switch children to another uid.
    fn is_privileged(&self) -> bool;
}

/// Lookups against the host's passwd and group databases.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostIdentity;

fn to_identity(user: User) -> Identity {
    Identity {
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        user: user.name,
        home: user.dir,
    }
}

impl IdentityProvider for HostIdentity {
    fn lookup_user(&self, name_or_id: &str) -> Result<Identity, SessionError> {
        let found = match name_or_id.parse::<u32>() {
            Ok(uid) => User::from_uid(Uid::from_raw(uid)),
            Err(_) => User::from_name(name_or_id),
        }
        .map_err(|e| SessionError::Lookup(format!("user {}: {}", name_or_id, e)))?;

        found
            .map(to_identity)
            .ok_or_else(|| SessionError::UnknownUser(name_or_id.to_string()))
    }

    fn lookup_group(&self, name_or_id: &str) -> Result<u32, SessionError> {
        let found = match name_or_id.parse::<u32>() {
            Ok(gid) => Group::from_gid(Gid::from_raw(gid)),
            Err(_) => Group::from_name(name_or_id),
        }
        .map_err(|e| SessionError::Lookup(format!("group {}: {}", name_or_id, e)))?;

        found
            .map(|g| g.gid.as_raw())
            .ok_or_else(|| SessionError::UnknownGroup(name_or_id.to_string()))
    }

    /// Reports the effective gid, which is what children inherit.
    fn current(&self) -> Result<Identity, SessionError> {
        let uid = Uid::effective();
        match User::from_uid(uid) {
            Ok(Some(user)) => Ok(Identity {
                gid: Gid::effective().as_raw(),
                ..to_identity(user)
            }),
            Ok(None) => Ok(Identity {
                uid: uid.as_raw(),
                gid: Gid::effective().as_raw(),
                user: uid.to_string(),
                home: PathBuf::from("/"),
            }),
            Err(e) => Err(SessionError::Lookup(format!("uid {}: {}", uid, e))),
        }
    }

    fn is_privileged(&self) -> bool {
        Uid::effective().is_root()
    }
}

/// Pick the account for a session.
///
/// The profile's `user` wins, else the principal's own account. A profile
/// `group` replaces the account's primary group. An unprivileged agent only
/// runs sessions as itself, so the returned gid is its own effective gid.
pub fn resolve(
    provider: &dyn IdentityProvider,
    profile: Option<&TaskProfile>,
    principal: &str,
) -> Result<Identity, SessionError> {
    let account = profile
        .and_then(|p| p.user.as_deref())
        .filter(|u| !u.is_empty())
        .unwrap_or(principal);

    let mut identity = provider.lookup_user(account)?;

    let group = profile.and_then(|p| p.group.as_deref()).filter(|g| !g.is_empty());
    if let Some(group) = group {
        identity.gid = provider.lookup_group(group)?;
    }

    if !provider.is_privileged() {
        let current = provider.current()?;
        if identity.uid != current.uid {
            warn!(
                requested = identity.uid,
                current = current.uid,
                "Agent is not privileged, refusing to switch user"
            );
            return Err(SessionError::ImpersonationDenied {
                current: current.uid,
                requested: identity.uid,
            });
        }
        if identity.gid != current.gid {
            if group.is_some() {
                warn!(
                    requested = identity.gid,
                    current = current.gid,
                    "Agent is not privileged, refusing to switch group"
                );
                return Err(SessionError::GroupSwitchDenied {
                    current: current.gid,
                    requested: identity.gid,
                });
            }
            identity.gid = current.gid;
        }
    }

    debug!(uid = identity.uid, gid = identity.gid, user = %identity.user, "Resolved session identity");
    Ok(identity)
}
