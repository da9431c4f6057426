//! Minimal name-service database population.
//!
//! Containers carved down to a handful of binaries still need
//! `/etc/passwd`, `/etc/group`, and `/etc/nsswitch.conf` for anything
//! that resolves its own identity. Smith writes a fixed default table
//! plus the identity declared in the build spec.

use std::path::Path;

use smith_core::{Result, DEFAULT_ID, DEFAULT_NAME};

const DEFAULT_USERS: &[&str] = &[
    "root:x:0:0:root:/write:",
    "daemon:x:1:1:daemon:/write:",
    "bin:x:2:2:bin:/write:",
    "sys:x:3:3:sys:/write:",
];

const DEFAULT_GROUPS: &[&str] = &[
    "root:x:0:",
    "daemon:x:1:",
    "bin:x:2:",
    "sys:x:3:",
    "adm:x:4:",
    "tty:x:5:",
];

/// A parsed `user[:group]` identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub group: String,
    /// True when the user or group was given by name rather than id,
    /// which means the image needs working NSS lookups.
    pub nss: bool,
}

/// Parse a user string in OCI `user[:group]` form.
///
/// Each half may be a decimal id (reverse-looked-up against the default
/// table for its name) or a name (forward-looked-up for its id).
/// Anything unresolved falls back to the smith defaults.
pub fn parse_user(user: &str) -> UserIdentity {
    let (mut u, mut g) = match user.split_once(':') {
        Some((u, g)) => (u.to_string(), g.to_string()),
        None => (user.to_string(), String::new()),
    };

    let mut uid = get_id(DEFAULT_USERS, &u);
    let mut gid = get_id(DEFAULT_GROUPS, &g);
    let mut nss = false;

    if let Ok(val) = u.parse::<u32>() {
        uid = Some(val);
        u = get_name(DEFAULT_USERS, val);
    } else if !u.is_empty() {
        nss = true;
    }
    if let Ok(val) = g.parse::<u32>() {
        gid = Some(val);
        g = get_name(DEFAULT_GROUPS, val);
    } else if !g.is_empty() {
        nss = true;
    }

    if u.is_empty() {
        u = DEFAULT_NAME.to_string();
    }
    if g.is_empty() {
        g = DEFAULT_NAME.to_string();
    }

    UserIdentity {
        uid: uid.unwrap_or(DEFAULT_ID),
        gid: gid.unwrap_or(DEFAULT_ID),
        user: u,
        group: g,
        nss,
    }
}

/// Populate `etc/passwd`, `etc/group`, and `etc/nsswitch.conf` under
/// `output_dir` if the declared identity calls for it.
///
/// Extra `groups` each get a fresh gid counting up from the primary
/// gid, with the primary user as their sole member. Existing files are
/// overwritten. Returns whether the identity requires NSS name lookups
/// (named user or group, or any extra groups); when that is false and
/// `nss` wasn't forced, nothing is written.
pub fn populate_nss(
    output_dir: &Path,
    user: &str,
    groups: &[String],
    nss: bool,
) -> Result<bool> {
    let id = parse_user(user);
    let needed = id.nss || !groups.is_empty();
    if !nss && !needed {
        return Ok(false);
    }

    let etc_dir = output_dir.join("etc");
    tracing::info!(
        "populating nss with {}({}):{}({})",
        id.user,
        id.uid,
        id.group,
        id.gid
    );
    std::fs::create_dir_all(&etc_dir)?;

    let mut group_rows: Vec<(String, u32, String)> =
        vec![(id.group.clone(), id.gid, String::new())];
    let mut group_id = id.gid;
    for group in groups {
        if get_id(DEFAULT_GROUPS, group).is_some() {
            continue;
        }
        group_id += 1;
        group_rows.push((group.clone(), group_id, id.user.clone()));
    }
    populate_groups(&etc_dir, &group_rows)?;
    populate_users(&etc_dir, &[(id.user.clone(), id.uid, id.gid)])?;
    populate_nsswitch(&etc_dir)?;
    Ok(needed)
}

fn get_id(items: &[&str], name: &str) -> Option<u32> {
    for entry in items {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.first() == Some(&name) && parts.len() > 2 {
            if let Ok(val) = parts[2].parse() {
                return Some(val);
            }
        }
    }
    None
}

fn get_name(items: &[&str], id: u32) -> String {
    for entry in items {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() > 2 {
            if let Ok(val) = parts[2].parse::<u32>() {
                if val == id {
                    return parts[0].to_string();
                }
            }
        }
    }
    String::new()
}

fn populate_users(etc_dir: &Path, users: &[(String, u32, u32)]) -> Result<()> {
    let mut rows: Vec<String> = DEFAULT_USERS.iter().map(|s| s.to_string()).collect();
    let min = DEFAULT_USERS.len() as u32;
    for (user, uid, gid) in users {
        if *uid < min {
            continue;
        }
        rows.push(format!("{user}:x:{uid}:{gid}:{user}:/write"));
    }
    std::fs::write(etc_dir.join("passwd"), rows.join("\n"))?;
    Ok(())
}

fn populate_groups(etc_dir: &Path, groups: &[(String, u32, String)]) -> Result<()> {
    let mut rows: Vec<String> = DEFAULT_GROUPS.iter().map(|s| s.to_string()).collect();
    let min = DEFAULT_GROUPS.len() as u32;
    for (group, gid, members) in groups {
        if *gid < min {
            continue;
        }
        rows.push(format!("{group}:x:{gid}:{members}"));
    }
    std::fs::write(etc_dir.join("group"), rows.join("\n"))?;
    Ok(())
}

fn populate_nsswitch(etc_dir: &Path) -> Result<()> {
    let rows = [
        "passwd:     files",
        "shadow:     files",
        "group:      files",
        "hosts:      files dns",
    ];
    std::fs::write(etc_dir.join("nsswitch.conf"), rows.join("\n"))?;
    Ok(())
}
