//! User and group name resolution

use nix::unistd::{Group, User};

/// Resolve a user name or numeric id. Unknown names yield `None`.
pub fn resolve_uid(name: &str) -> Option<u32> {
    if let Ok(id) = name.parse::<u32>() {
        return Some(id);
    }
    match User::from_name(name) {
        Ok(Some(user)) => Some(user.uid.as_raw()),
        Ok(None) => {
            tracing::warn!(user = name, "Unknown user");
            None
        }
        Err(e) => {
            tracing::warn!(user = name, error = %e, "User lookup failed");
            None
        }
    }
}

/// Resolve a group name or numeric id. Unknown names yield `None`.
pub fn resolve_gid(name: &str) -> Option<u32> {
    if let Ok(id) = name.parse::<u32>() {
        return Some(id);
    }
    match Group::from_name(name) {
        Ok(Some(group)) => Some(group.gid.as_raw()),
        Ok(None) => {
            tracing::warn!(group = name, "Unknown group");
            None
        }
        Err(e) => {
            tracing::warn!(group = name, error = %e, "Group lookup failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_pass_through() {
        assert_eq!(resolve_uid("1234"), Some(1234));
        assert_eq!(resolve_gid("0"), Some(0));
    }

    #[test]
    fn root_resolves() {
        assert_eq!(resolve_uid("root"), Some(0));
    }

    #[test]
    fn unknown_name_is_none() {
        assert_eq!(resolve_uid("no-such-user-converge-test"), None);
    }
}
