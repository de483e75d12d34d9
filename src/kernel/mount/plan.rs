//! Mount plan construction.
//!
//! Everything here is pure path arithmetic so containment and ordering can be
//! decided before any namespace exists.

use crate::config::types::{Mount, MountOptions, Result, RootfsSource, RunnerError};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Normalize a destination into an absolute in-sandbox path.
///
/// `.` components are dropped and `..` pops one component. A `..` that would
/// climb above the sandbox root is rejected instead of being clamped.
pub fn normalize_destination(raw: &Path) -> std::result::Result<PathBuf, String> {
    if raw.as_os_str().is_empty() {
        return Err("destination is empty".to_string());
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in raw.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(format!(
                        "destination {} escapes the sandbox root",
                        raw.display()
                    ));
                }
            }
            Component::Prefix(_) => {
                return Err(format!("destination {} has a path prefix", raw.display()));
            }
        }
    }

    let mut normalized = PathBuf::from("/");
    for part in parts {
        normalized.push(part);
    }
    Ok(normalized)
}

/// Host path of an in-sandbox destination under `root`
pub fn host_path(root: &Path, destination: &Path) -> PathBuf {
    root.join(destination.strip_prefix("/").unwrap_or(destination))
}

/// One assembly step
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountStep {
    /// Build `/` of the sandbox
    Root(RootfsSource),
    /// Bind `source` onto `destination` (in-sandbox absolute path)
    Bind(Mount),
}

impl MountStep {
    fn destination(&self) -> PathBuf {
        match self {
            MountStep::Root(_) => PathBuf::from("/"),
            MountStep::Bind(mount) => mount.destination.clone(),
        }
    }

    fn is_overlay_root(&self) -> bool {
        match self {
            MountStep::Root(RootfsSource::Overlay(_)) => true,
            MountStep::Root(RootfsSource::Directory(_)) => false,
            MountStep::Bind(mount) => mount.options.overlay_root,
        }
    }
}

/// Ordered mount steps, root first
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPlan {
    steps: Vec<MountStep>,
}

impl MountPlan {
    pub fn build(rootfs: &RootfsSource, mounts: &[Mount]) -> Result<Self> {
        let mut steps = Vec::with_capacity(mounts.len() + 1);
        steps.push(MountStep::Root(rootfs.clone()));
        for mount in mounts {
            steps.push(MountStep::Bind(mount.clone()));
        }

        let plan = Self { steps };
        plan.verify_ordering()?;
        Ok(plan)
    }

    /// Every overlay-root step precedes the steps nested under it
    pub fn verify_ordering(&self) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            if !step.is_overlay_root() {
                continue;
            }
            let overlay_dest = step.destination();
            for earlier in &self.steps[..index] {
                let dest = earlier.destination();
                if dest.starts_with(&overlay_dest) && dest != overlay_dest {
                    return Err(RunnerError::config(
                        "mounts",
                        format!(
                            "{} is mounted before the overlay root at {} that contains it",
                            dest.display(),
                            overlay_dest.display()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn root(&self) -> Option<&RootfsSource> {
        self.steps.iter().find_map(|step| match step {
            MountStep::Root(source) => Some(source),
            MountStep::Bind(_) => None,
        })
    }

    pub fn binds(&self) -> impl Iterator<Item = &Mount> {
        self.steps.iter().filter_map(|step| match step {
            MountStep::Bind(mount) => Some(mount),
            MountStep::Root(_) => None,
        })
    }

    pub fn steps(&self) -> &[MountStep] {
        &self.steps
    }
}

/// Parse the textual option list of one mount entry
pub fn parse_mount_options(raw: &[String]) -> std::result::Result<MountOptions, String> {
    let mut options = MountOptions::default();
    for option in raw {
        match option.trim() {
            "rw" => options.read_write = true,
            "ro" => options.read_write = false,
            "exec" => options.executable = true,
            "noexec" => options.executable = false,
            "" => {}
            other => return Err(format!("unknown mount option {:?}", other)),
        }
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::OverlayLayers;

    fn bind(dest: &str) -> Mount {
        Mount {
            source: PathBuf::from("/host/src"),
            destination: PathBuf::from(dest),
            options: MountOptions::default(),
        }
    }

    #[test]
    fn normalize_resolves_dots_inside_root() {
        let cases = [
            ("/usr/local/bin/main", "/usr/local/bin/main"),
            ("usr/bin", "/usr/bin"),
            ("/a/./b/../c", "/a/c"),
            ("/", "/"),
            ("//seele//main.cpp", "/seele/main.cpp"),
        ];
        for (raw, expected) in cases {
            assert_eq!(
                normalize_destination(Path::new(raw)).unwrap(),
                PathBuf::from(expected),
                "normalizing {}",
                raw
            );
        }
    }

    #[test]
    fn normalize_rejects_escape_and_empty() {
        assert!(normalize_destination(Path::new("")).is_err());
        assert!(normalize_destination(Path::new("../etc")).is_err());
        assert!(normalize_destination(Path::new("/a/../../etc/passwd")).is_err());
    }

    #[test]
    fn host_path_stays_under_root() {
        let root = Path::new("/merged");
        assert_eq!(
            host_path(root, Path::new("/usr/bin/main")),
            PathBuf::from("/merged/usr/bin/main")
        );
        assert_eq!(host_path(root, Path::new("/")), PathBuf::from("/merged/"));
    }

    #[test]
    fn overlay_root_is_first_step() {
        let overlay = RootfsSource::Overlay(OverlayLayers {
            lower_dir: "/l".into(),
            upper_dir: "/u".into(),
            work_dir: "/w".into(),
            merged_dir: "/m".into(),
        });
        let plan = MountPlan::build(&overlay, &[bind("/seele"), bind("/seele/main.cpp")]).unwrap();

        assert!(matches!(plan.steps()[0], MountStep::Root(RootfsSource::Overlay(_))));
        let binds: Vec<_> = plan.binds().map(|m| m.destination.clone()).collect();
        assert_eq!(binds, vec![PathBuf::from("/seele"), PathBuf::from("/seele/main.cpp")]);
    }

    #[test]
    fn nested_mount_before_overlay_root_is_rejected() {
        let mut overlay_bind = bind("/opt");
        overlay_bind.options.overlay_root = true;
        let plan = MountPlan {
            steps: vec![
                MountStep::Root(RootfsSource::Directory("/srv/root".into())),
                MountStep::Bind(bind("/opt/tool")),
                MountStep::Bind(overlay_bind),
            ],
        };
        assert!(plan.verify_ordering().is_err());
    }

    #[test]
    fn mount_options_parse() {
        let options = parse_mount_options(&["rw".into(), "exec".into()]).unwrap();
        assert!(options.read_write && options.executable);

        let default = parse_mount_options(&[]).unwrap();
        assert!(!default.read_write && !default.executable);

        assert!(parse_mount_options(&["suid".into()]).is_err());
    }
}
