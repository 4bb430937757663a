//! Resolve the run-as identity of a service against the passwd and group databases.
//!
//! Everything a handler needs to switch identity is looked up here, in the
//! daemon, so the forked child only has to issue the raw set*id calls.

use crate::entries::RunAs;
use nix::unistd::{Gid, Group, Uid, User};
use std::ffi::CString;

fn lookup_user(user: &str) -> Result<User, String> {
    let entry = if let Ok(uid) = user.parse::<u32>() {
        User::from_uid(Uid::from_raw(uid))
    } else {
        User::from_name(user)
    };
    entry
        .map_err(|e| format!("Error looking up user {user}: {e}"))?
        .ok_or_else(|| format!("No entry found for username: {user}"))
}

fn lookup_gid(group: &str) -> Result<Gid, String> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(Gid::from_raw(gid));
    }
    Group::from_name(group)
        .map_err(|e| format!("Error looking up group {group}: {e}"))?
        .map(|entry| entry.gid)
        .ok_or_else(|| format!("No entry found for groupname: {group}"))
}

/// Resolve `user` (name or numeric uid) and an optional group override.
/// Supplementary groups are the user's groups as listed in the group database.
pub fn resolve_run_as(user: &str, group: Option<&str>) -> Result<RunAs, String> {
    let entry = lookup_user(user)?;
    let gid = match group {
        Some(group) => lookup_gid(group)?,
        None => entry.gid,
    };
    let c_name = CString::new(entry.name.as_str())
        .map_err(|_| format!("Username contains a NUL byte: {user:?}"))?;
    let groups = nix::unistd::getgrouplist(&c_name, gid)
        .map_err(|e| format!("Couldn't get supplementary groups of {user}: {e}"))?;

    Ok(RunAs {
        name: entry.name,
        group: group.map(str::to_owned),
        uid: entry.uid,
        gid,
        groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_user_name() -> String {
        User::from_uid(nix::unistd::getuid())
            .unwrap()
            .unwrap()
            .name
    }

    #[test]
    fn resolves_own_user() {
        let name = current_user_name();
        let run_as = resolve_run_as(&name, None).unwrap();
        assert_eq!(run_as.uid, nix::unistd::getuid());
        assert_eq!(run_as.name, name);
        assert!(run_as.group.is_none());

        let by_uid = resolve_run_as(&run_as.uid.as_raw().to_string(), None).unwrap();
        assert_eq!(by_uid.name, name);
    }

    #[test]
    fn numeric_group_override() {
        let name = current_user_name();
        let run_as = resolve_run_as(&name, Some("4242")).unwrap();
        assert_eq!(run_as.gid, Gid::from_raw(4242));
        assert_eq!(run_as.group.as_deref(), Some("4242"));
    }

    #[test]
    fn unknown_user_is_an_error() {
        assert!(resolve_run_as("no-such-user-hopefully-xyz", None).is_err());
    }
}
