// Config parsing and validation.
// Turns the wire document into an immutable ExecutionConfig, failing fast with
// the name of the offending field.

use crate::config::policy::userns::{
    invoking_username, read_subids, NamespaceConfig, UserNamespacePolicy, SUBGID_PATH,
    SUBUID_PATH,
};
use crate::config::schema::{
    ConfigDocument, FdDoc, LimitsDoc, OverlayDoc, RlimitDoc, RootfsDoc, TimeLimitsDoc,
    UserNamespaceDoc, CURRENT_SCHEMA_VERSION,
};
use crate::config::types::{
    CgroupLimits, ExecutionConfig, IdMapping, Identity, Limits, Mount, OverlayLayers, Result,
    RlimitEntry, RlimitKind, RootfsSource, RunnerError, StdioConfig, StdioTarget,
};
use crate::kernel::mount::plan::{normalize_destination, parse_mount_options, MountPlan};
use std::path::{Path, PathBuf};

/// uid and gid of the payload when the document names no `user`
pub const DEFAULT_PAYLOAD_ID: u32 = 65534;

/// Validation context: schema version and collected deprecation notes
#[derive(Debug)]
pub struct ValidationResult {
    pub version: u32,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn new(version: u32) -> Self {
        Self {
            version,
            warnings: Vec::new(),
        }
    }

    fn strict(&self) -> bool {
        self.version >= CURRENT_SCHEMA_VERSION
    }

    /// A legacy field that the current spelling of the same setting overrides
    fn shadowed(&mut self, field: &str, winner: &str) -> Result<()> {
        self.legacy(field, winner)?;
        self.warnings
            .push(format!("`{}` is ignored because `{}` is set", field, winner));
        Ok(())
    }

    /// Accept a first-generation shape, or reject it under the current version
    fn legacy(&mut self, field: &str, replacement: &str) -> Result<()> {
        if self.strict() {
            return Err(RunnerError::config(
                field,
                format!(
                    "legacy field is not accepted with version {}; use `{}`",
                    CURRENT_SCHEMA_VERSION, replacement
                ),
            ));
        }
        self.warnings
            .push(format!("`{}` is deprecated, use `{}`", field, replacement));
        Ok(())
    }
}

/// Parse and validate a JSON document
pub fn parse_config(json: &str) -> Result<ExecutionConfig> {
    let document: ConfigDocument = serde_json::from_str(json)
        .map_err(|e| RunnerError::config(json_error_field(&e), e.to_string()))?;
    let (config, result) = validate_document(document)?;
    for warning in &result.warnings {
        log::warn!("{}", warning);
    }
    Ok(config)
}

fn json_error_field(err: &serde_json::Error) -> String {
    match err.classify() {
        serde_json::error::Category::Syntax | serde_json::error::Category::Eof => {
            "<document>".to_string()
        }
        _ => format!("<line {} column {}>", err.line(), err.column()),
    }
}

/// Validate a decoded document
pub fn validate_document(document: ConfigDocument) -> Result<(ExecutionConfig, ValidationResult)> {
    let version = match document.version {
        None => 1,
        Some(v @ 1..=CURRENT_SCHEMA_VERSION) => v,
        Some(other) => {
            return Err(RunnerError::config(
                "version",
                format!("unsupported schema version {}", other),
            ))
        }
    };
    let mut result = ValidationResult::new(version);

    let rootfs = validate_rootfs(&document, &mut result)?;
    let cwd = validate_cwd(&document.cwd)?;
    let command = validate_command(&document.command)?;
    let paths = validate_paths(&document.paths)?;
    let mounts = validate_mounts(&document)?;
    let limits = validate_limits(document.limits.as_ref(), &mut result)?;
    let namespaces = validate_namespaces(&document, &mut result)?;
    let stdio = validate_stdio(document.fd.as_ref())?;
    let user = validate_identity(&document, &namespaces)?;

    MountPlan::build(&rootfs, &mounts)?;

    let config = ExecutionConfig {
        rootfs,
        cwd,
        command,
        paths,
        mounts,
        limits,
        namespaces,
        stdio,
        user,
        cgroup_parent: document.cgroup_parent.clone(),
    };
    Ok((config, result))
}

fn validate_rootfs(document: &ConfigDocument, result: &mut ValidationResult) -> Result<RootfsSource> {
    if document.rootfs.is_some() && document.overlayfs.is_some() {
        result.shadowed("overlayfs", "rootfs")?;
    }
    let source = match (&document.rootfs, &document.overlayfs) {
        (Some(RootfsDoc::Path(path)), _) => {
            require_absolute("rootfs", path)?;
            RootfsSource::Directory(path.clone())
        }
        (Some(RootfsDoc::Overlay(overlay)), _) => overlay_source("rootfs", overlay)?,
        (None, Some(overlay)) => {
            result.legacy("overlayfs", "rootfs")?;
            overlay_source("overlayfs", overlay)?
        }
        (None, None) => {
            return Err(RunnerError::config(
                "rootfs",
                "a rootfs path or overlay descriptor is required",
            ))
        }
    };
    Ok(source)
}

fn overlay_source(field: &str, overlay: &OverlayDoc) -> Result<RootfsSource> {
    let layers = [
        ("lower_dir", &overlay.lower_dir),
        ("upper_dir", &overlay.upper_dir),
        ("work_dir", &overlay.work_dir),
        ("merged_dir", &overlay.merged_dir),
    ];
    for (name, path) in layers {
        require_absolute(&format!("{}.{}", field, name), path)?;
    }
    if overlay.upper_dir == overlay.work_dir {
        return Err(RunnerError::config(
            format!("{}.work_dir", field),
            "work_dir must differ from upper_dir",
        ));
    }

    Ok(RootfsSource::Overlay(OverlayLayers {
        lower_dir: overlay.lower_dir.clone(),
        upper_dir: overlay.upper_dir.clone(),
        work_dir: overlay.work_dir.clone(),
        merged_dir: overlay.merged_dir.clone(),
    }))
}

fn require_absolute(field: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(RunnerError::config(field, "path is empty"));
    }
    if !path.is_absolute() {
        return Err(RunnerError::config(
            field,
            format!("{} is not an absolute path", path.display()),
        ));
    }
    Ok(())
}

fn validate_cwd(cwd: &Path) -> Result<PathBuf> {
    normalize_destination(cwd).map_err(|message| RunnerError::config("cwd", message))
}

fn validate_command(command: &[String]) -> Result<Vec<String>> {
    if command.is_empty() {
        return Err(RunnerError::config("command", "command must not be empty"));
    }
    for (index, arg) in command.iter().enumerate() {
        if arg.contains('\0') {
            return Err(RunnerError::config(
                format!("command[{}]", index),
                "argument contains a NUL byte",
            ));
        }
    }
    if command[0].is_empty() {
        return Err(RunnerError::config("command[0]", "program name is empty"));
    }
    Ok(command.to_vec())
}

fn validate_paths(paths: &[String]) -> Result<Vec<String>> {
    for (index, path) in paths.iter().enumerate() {
        if path.is_empty() || path.contains(':') || path.contains('\0') {
            return Err(RunnerError::config(
                format!("paths[{}]", index),
                "PATH entry must be non-empty and free of ':'",
            ));
        }
    }
    Ok(paths.to_vec())
}

fn validate_mounts(document: &ConfigDocument) -> Result<Vec<Mount>> {
    let mut mounts = Vec::with_capacity(document.mounts.len());
    for (index, entry) in document.mounts.iter().enumerate() {
        require_absolute(&format!("mounts[{}].from", index), &entry.from)?;
        let destination = normalize_destination(&entry.to)
            .map_err(|message| RunnerError::config(format!("mounts[{}].to", index), message))?;
        if destination == Path::new("/") {
            return Err(RunnerError::config(
                format!("mounts[{}].to", index),
                "bind mounts cannot replace the sandbox root",
            ));
        }
        let options = parse_mount_options(&entry.options).map_err(|message| {
            RunnerError::config(format!("mounts[{}].options", index), message)
        })?;

        mounts.push(Mount {
            source: entry.from.clone(),
            destination,
            options,
        });
    }
    Ok(mounts)
}

fn validate_limits(limits: Option<&LimitsDoc>, result: &mut ValidationResult) -> Result<Limits> {
    let Some(limits) = limits else {
        return Ok(Limits::default());
    };

    if limits.time.is_some() && limits.time_ms.is_some() {
        result.shadowed("limits.time_ms", "limits.time")?;
    }
    let (wall_time_ms, user_time_ms, kernel_time_ms) = match limits.time_limits() {
        TimeLimitsDoc::Structured { wall, user, kernel } => {
            let cpu = match (user, kernel) {
                (None, None) => None,
                (user, kernel) => Some(user.unwrap_or(0).saturating_add(kernel.unwrap_or(0))),
            };
            let wall = wall.or_else(|| cpu.map(|ms| ms.saturating_mul(2)));
            (wall, user, kernel)
        }
        TimeLimitsDoc::Legacy { time_ms } => {
            result.legacy("limits.time_ms", "limits.time.wall / limits.time.user")?;
            (Some(time_ms.saturating_mul(2)), Some(time_ms), None)
        }
        TimeLimitsDoc::Unset => (None, None, None),
    };
    for (field, value) in [
        ("limits.time.wall", wall_time_ms),
        ("limits.time.user", user_time_ms),
        ("limits.time.kernel", kernel_time_ms),
    ] {
        if value == Some(0) {
            return Err(RunnerError::config(field, "time bound must be positive"));
        }
    }

    let rlimits = match &limits.rlimit {
        None => Vec::new(),
        Some(RlimitDoc::List(entries)) => entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                rlimit_entry(&format!("limits.rlimit[{}]", index), &entry.kind, entry.soft, entry.hard)
            })
            .collect::<Result<Vec<_>>>()?,
        Some(RlimitDoc::Map(entries)) => {
            result.legacy("limits.rlimit", "limits.rlimit as a list of {type, soft, hard}")?;
            entries
                .iter()
                .map(|(name, bounds)| {
                    rlimit_entry(&format!("limits.rlimit.{}", name), name, bounds.soft, bounds.hard)
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    let cgroup = match &limits.cgroup {
        None => CgroupLimits::default(),
        Some(doc) => CgroupLimits {
            memory: positive("limits.cgroup.memory", doc.memory)?,
            memory_reservation: positive(
                "limits.cgroup.memory_reservation",
                doc.memory_reservation,
            )?,
            memory_swap: positive("limits.cgroup.memory_swap", doc.memory_swap)?,
            cpu_shares: positive("limits.cgroup.cpu_shares", doc.cpu_shares)?,
            cpu_quota: match doc.cpu_quota {
                Some(0) => {
                    return Err(RunnerError::config(
                        "limits.cgroup.cpu_quota",
                        "quota must be positive, or negative for no bound",
                    ))
                }
                other => other,
            },
            cpuset_cpus: cpuset_list("limits.cgroup.cpuset_cpus", doc.cpuset_cpus.as_deref())?,
            cpuset_mems: cpuset_list("limits.cgroup.cpuset_mems", doc.cpuset_mems.as_deref())?,
            pids: positive("limits.cgroup.pids_limit", doc.pids_limit)?,
        },
    };
    if let (Some(memory), Some(swap)) = (cgroup.memory, cgroup.memory_swap) {
        if swap < memory {
            return Err(RunnerError::config(
                "limits.cgroup.memory_swap",
                format!("memory_swap {} is below memory {}", swap, memory),
            ));
        }
    }

    Ok(Limits {
        wall_time_ms,
        user_time_ms,
        kernel_time_ms,
        rlimits,
        cgroup,
    })
}

fn rlimit_entry(field: &str, name: &str, soft: u64, hard: u64) -> Result<RlimitEntry> {
    let kind = RlimitKind::parse(name)
        .ok_or_else(|| RunnerError::config(field, format!("unknown rlimit type {:?}", name)))?;
    if soft > hard {
        return Err(RunnerError::config(
            field,
            format!("soft limit {} exceeds hard limit {}", soft, hard),
        ));
    }
    Ok(RlimitEntry { kind, soft, hard })
}

fn positive(field: &str, value: Option<u64>) -> Result<Option<u64>> {
    match value {
        Some(0) => Err(RunnerError::config(field, "limit must be positive")),
        other => Ok(other),
    }
}

/// Kernel list syntax such as `0-3,6`
fn cpuset_list(field: &str, value: Option<&str>) -> Result<Option<String>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let valid_range = |range: &str| {
        let mut bounds = range.splitn(2, '-').map(|n| n.parse::<u32>());
        match (bounds.next(), bounds.next()) {
            (Some(Ok(_)), None) => true,
            (Some(Ok(low)), Some(Ok(high))) => low <= high,
            _ => false,
        }
    };
    if value.is_empty() || !value.split(',').all(valid_range) {
        return Err(RunnerError::config(
            field,
            format!("{:?} is not a list like \"0-3,6\"", value),
        ));
    }
    Ok(Some(value.to_string()))
}

fn validate_namespaces(
    document: &ConfigDocument,
    result: &mut ValidationResult,
) -> Result<NamespaceConfig> {
    if document.user_namespace.is_some() && document.rootless.is_some() {
        result.shadowed("rootless", "user_namespace")?;
    }
    let user = match (&document.user_namespace, document.rootless) {
        (Some(doc), _) => mapped_policy(doc)?,
        (None, Some(rootless)) => {
            result.legacy("rootless", "user_namespace")?;
            if rootless {
                UserNamespacePolicy::Transparent
            } else {
                UserNamespacePolicy::Disabled
            }
        }
        (None, None) => UserNamespacePolicy::Disabled,
    };

    Ok(NamespaceConfig {
        user,
        isolate_network: document.network.map(|n| n.isolated).unwrap_or(true),
    })
}

fn mapped_policy(doc: &UserNamespaceDoc) -> Result<UserNamespacePolicy> {
    if !doc.enabled {
        return Ok(UserNamespacePolicy::Disabled);
    }

    let uid = id_mapping(
        "user_namespace.uid_map",
        doc.root_uid.unwrap_or_else(|| nix::unistd::geteuid().as_raw()),
        doc.uid_map_begin,
        doc.uid_map_count,
        SUBUID_PATH,
    )?;
    let gid = id_mapping(
        "user_namespace.gid_map",
        doc.root_gid.unwrap_or_else(|| nix::unistd::getegid().as_raw()),
        doc.gid_map_begin,
        doc.gid_map_count,
        SUBGID_PATH,
    )?;
    Ok(UserNamespacePolicy::Mapped { uid, gid })
}

fn id_mapping(
    field: &str,
    root_id: u32,
    begin: Option<u32>,
    count: Option<u32>,
    subid_table: &str,
) -> Result<IdMapping> {
    let (range_begin, range_count) = match (begin, count) {
        (Some(begin), Some(count)) => (begin, count),
        (None, None) => {
            let username = invoking_username()?;
            let ids = read_subids(Path::new(subid_table), &username)
                .map_err(|e| RunnerError::config(field, e.to_string()))?;
            (ids.begin, ids.count)
        }
        _ => {
            return Err(RunnerError::config(
                field,
                "map begin and count must be given together",
            ))
        }
    };

    if range_count > 0 && range_begin <= root_id && root_id < range_begin.saturating_add(range_count) {
        return Err(RunnerError::config(
            field,
            format!("root id {} overlaps the mapped range", root_id),
        ));
    }
    if range_begin.checked_add(range_count).is_none() {
        return Err(RunnerError::config(field, "mapped range overflows"));
    }

    Ok(IdMapping {
        root_id,
        range_begin,
        range_count,
    })
}

fn validate_stdio(fd: Option<&FdDoc>) -> Result<StdioConfig> {
    let mut stdio = StdioConfig::default();
    let Some(fd) = fd else {
        return Ok(stdio);
    };

    if let Some(target) = stdio_target("fd.stdin", fd.stdin.as_deref())? {
        stdio.stdin = target;
    }
    if let Some(target) = stdio_target("fd.stdout", fd.stdout.as_deref())? {
        if target == StdioTarget::Inherit {
            return Err(RunnerError::config(
                "fd.stdout",
                "stdout carries the report and cannot be inherited",
            ));
        }
        stdio.stdout = target;
    }
    if let Some(target) = stdio_target("fd.stderr", fd.stderr.as_deref())? {
        stdio.stderr = target;
    }
    Ok(stdio)
}

fn stdio_target(field: &str, raw: Option<&str>) -> Result<Option<StdioTarget>> {
    let target = match raw {
        None | Some("") => return Ok(None),
        Some("inherit") => StdioTarget::Inherit,
        Some("/dev/null") => StdioTarget::Null,
        Some(path) => {
            let path = PathBuf::from(path);
            require_absolute(field, &path)?;
            StdioTarget::File(path)
        }
    };
    Ok(Some(target))
}

/// `nobody`, wherever the namespace can represent it. A transparent
/// namespace maps only its root, so the payload stays there.
fn default_identity(namespaces: &NamespaceConfig) -> Option<Identity> {
    let nobody = Identity {
        uid: DEFAULT_PAYLOAD_ID,
        gid: DEFAULT_PAYLOAD_ID,
    };
    match namespaces.user.highest_mapped_ids() {
        None => Some(nobody),
        Some((max_uid, max_gid)) if max_uid >= nobody.uid && max_gid >= nobody.gid => Some(nobody),
        Some(_) => {
            log::debug!("No mapping for {}:{}, payload keeps the namespace root", nobody.uid, nobody.gid);
            None
        }
    }
}

fn validate_identity(
    document: &ConfigDocument,
    namespaces: &NamespaceConfig,
) -> Result<Option<Identity>> {
    let Some(user) = document.user else {
        return Ok(default_identity(namespaces));
    };
    if user.uid == 0 || user.gid == 0 {
        return Err(RunnerError::config(
            "user",
            "payload identity must be unprivileged",
        ));
    }
    if let Some((max_uid, max_gid)) = namespaces.user.highest_mapped_ids() {
        if user.uid > max_uid || user.gid > max_gid {
            return Err(RunnerError::config(
                "user",
                format!(
                    "{}:{} has no mapping in the user namespace (highest {}:{})",
                    user.uid, user.gid, max_uid, max_gid
                ),
            ));
        }
    }
    Ok(Some(Identity {
        uid: user.uid,
        gid: user.gid,
    }))
}
