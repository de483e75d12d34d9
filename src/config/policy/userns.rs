/// User namespace policy and id-range resolution
use crate::config::types::{IdMapping, Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;

pub const SUBUID_PATH: &str = "/etc/subuid";
pub const SUBGID_PATH: &str = "/etc/subgid";

/// User namespace policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserNamespacePolicy {
    /// No user namespace; the runner needs host privilege
    Disabled,

    /// In-namespace root maps to `root_id`, ids 1.. map to a subordinate range
    Mapped { uid: IdMapping, gid: IdMapping },

    /// Legacy `rootless`: in-namespace root is the invoking user, nothing else is mapped
    Transparent,
}

impl Default for UserNamespacePolicy {
    fn default() -> Self {
        UserNamespacePolicy::Disabled
    }
}

impl UserNamespacePolicy {
    pub fn creates_user_namespace(&self) -> bool {
        !matches!(self, UserNamespacePolicy::Disabled)
    }

    /// Highest in-namespace uid/gid that has a host mapping
    pub fn highest_mapped_ids(&self) -> Option<(u32, u32)> {
        match self {
            UserNamespacePolicy::Disabled => None,
            UserNamespacePolicy::Mapped { uid, gid } => Some((uid.range_count, gid.range_count)),
            UserNamespacePolicy::Transparent => Some((0, 0)),
        }
    }
}

/// Namespace selection for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub user: UserNamespacePolicy,
    /// Give the sandbox its own network namespace with only loopback
    pub isolate_network: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            user: UserNamespacePolicy::Disabled,
            isolate_network: true,
        }
    }
}

/// Subordinate id range for one user, as listed in /etc/subuid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIds {
    pub begin: u32,
    pub count: u32,
}

/// Find the first `name:begin:count` entry for `username`.
pub fn parse_subids<I>(username: &str, lines: I) -> Result<SubIds>
where
    I: IntoIterator<Item = String>,
{
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match trimmed.split(':').collect::<Vec<_>>()[..] {
            [name, _, _] if name != username => continue,
            [_, begin, count] => {
                let parse = |value: &str| {
                    value.parse::<u32>().map_err(|e| {
                        RunnerError::Namespace(format!("Bad subordinate id entry {:?}: {}", line, e))
                    })
                };
                return Ok(SubIds {
                    begin: parse(begin)?,
                    count: parse(count)?,
                });
            }
            _ => {
                return Err(RunnerError::Namespace(format!(
                    "Unexpected subordinate id entry: {:?}",
                    line
                )))
            }
        }
    }

    Err(RunnerError::Namespace(format!(
        "No subordinate id entry for user {}",
        username
    )))
}

pub fn read_subids(path: &Path, username: &str) -> Result<SubIds> {
    let file = std::fs::File::open(path)
        .map_err(|e| RunnerError::Namespace(format!("Failed to open {}: {}", path.display(), e)))?;
    let lines = std::io::BufReader::new(file).lines().map_while(|l| l.ok());
    parse_subids(username, lines)
}

/// Name of the invoking user, used to look up subordinate ranges
pub fn invoking_username() -> Result<String> {
    let uid = nix::unistd::geteuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(RunnerError::Namespace(format!(
            "No passwd entry for uid {}",
            uid
        ))),
        Err(e) => Err(RunnerError::Namespace(format!(
            "Failed to look up uid {}: {}",
            uid, e
        ))),
    }
}

/// Check if host supports unprivileged user namespaces
pub fn check_unprivileged_userns_support() -> bool {
    // Debian/Ubuntu knob
    if let Ok(content) = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone") {
        if content.trim() != "1" {
            return false;
        }
    }

    if let Ok(content) = std::fs::read_to_string("/proc/sys/user/max_user_namespaces") {
        if let Ok(max) = content.trim().parse::<u32>() {
            return max > 0;
        }
    }

    std::path::Path::new("/proc/self/ns/user").exists()
}

/// Render `/proc/<pid>/uid_map` content for a mapping
pub fn render_id_map(mapping: &IdMapping) -> String {
    let mut map = format!("0 {} 1\n", mapping.root_id);
    if mapping.range_count > 0 {
        map.push_str(&format!("1 {} {}\n", mapping.range_begin, mapping.range_count));
    }
    map
}
