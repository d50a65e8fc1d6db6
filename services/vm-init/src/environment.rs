//! Workload execution environment: argv, env, working directory, exec.
//!
//! The launch plan is computed up front so every failure happens before the
//! point of no return (the process replacement).

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use ravel_init_config::InitConfig;
use tracing::debug;

use crate::error::InitError;

/// Everything needed to launch the workload.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    /// Full argv; never empty.
    pub argv: Vec<String>,

    /// Environment entries (`KEY=VALUE`), duplicates already resolved.
    pub env: Vec<String>,

    pub working_dir: String,
}

/// Compute the launch plan from the run config.
///
/// argv = (entrypoint override | image entrypoint) ++ (cmd override | image
/// cmd); env = image env then extra env with later entries winning on
/// duplicate keys.
pub fn build_launch_plan(config: &InitConfig) -> Result<LaunchPlan, InitError> {
    let entrypoint = config
        .entrypoint_override
        .as_ref()
        .unwrap_or(&config.image_config.entrypoint);
    let cmd = config
        .cmd_override
        .as_ref()
        .unwrap_or(&config.image_config.cmd);

    let mut argv = Vec::with_capacity(entrypoint.len() + cmd.len());
    argv.extend(entrypoint.iter().cloned());
    argv.extend(cmd.iter().cloned());

    if argv.is_empty() {
        return Err(InitError::EmptyArgv);
    }

    let env = merge_env(&config.image_config.env, &config.extra_env);

    let working_dir = match config.image_config.working_dir.as_deref() {
        Some(dir) if !dir.is_empty() => dir.to_string(),
        _ => "/".to_string(),
    };

    Ok(LaunchPlan {
        argv,
        env,
        working_dir,
    })
}

/// Concatenate env entry lists with an explicit later-wins policy: the
/// result keeps first-occurrence order but the last value for each key.
pub fn merge_env(base: &[String], extra: &[String]) -> Vec<String> {
    let mut entries: Vec<String> = Vec::with_capacity(base.len() + extra.len());
    let mut index_by_key: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for entry in base.iter().chain(extra.iter()) {
        let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
        match index_by_key.get(key) {
            Some(&index) => entries[index] = entry.clone(),
            None => {
                index_by_key.insert(key.to_string(), entries.len());
                entries.push(entry.clone());
            }
        }
    }
    entries
}

fn env_value<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter().rev().find_map(|entry| {
        entry
            .split_once('=')
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
    })
}

fn is_executable_file(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve `argv[0]` against the plan's PATH entries, in order.
///
/// A name containing a slash is used as-is (relative to the working
/// directory); anything else must be found under one of the PATH entries.
pub fn resolve_executable(plan: &LaunchPlan) -> Result<PathBuf, InitError> {
    let program = &plan.argv[0];

    if program.contains('/') {
        let path = PathBuf::from(program);
        if is_executable_file(&path) {
            return Ok(path);
        }
        return Err(InitError::ExecutableNotFound(program.clone()));
    }

    let search_path = env_value(&plan.env, "PATH").unwrap_or("");
    for dir in search_path.split(':').filter(|dir| !dir.is_empty()) {
        let candidate = Path::new(dir).join(program);
        if is_executable_file(&candidate) {
            return Ok(candidate);
        }
    }

    Err(InitError::ExecutableNotFound(program.clone()))
}

/// Change into the working directory, resolve the executable and replace
/// this process with the workload. Only returns on failure.
pub fn exec_workload(plan: &LaunchPlan) -> InitError {
    if let Err(err) = std::env::set_current_dir(&plan.working_dir) {
        return InitError::WorkdirFailed {
            dir: plan.working_dir.clone(),
            detail: err.to_string(),
        };
    }

    let program = match resolve_executable(plan) {
        Ok(program) => program,
        Err(err) => return err,
    };

    debug!(program = %program.display(), argv = ?plan.argv, "replacing init with workload");

    let mut command = Command::new(&program);
    command.arg0(&plan.argv[0]).args(&plan.argv[1..]).env_clear();
    for entry in &plan.env {
        match entry.split_once('=') {
            Some((key, value)) => command.env(key, value),
            None => command.env(entry, ""),
        };
    }

    // Standard streams are inherited by default; exec never returns on
    // success.
    let err = command.exec();
    InitError::ExecFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_init_config::{EtcResolv, ImageConfig, NetworkConfig};
    use std::fs;

    fn base_config() -> InitConfig {
        InitConfig {
            image_config: ImageConfig {
                user: None,
                working_dir: None,
                cmd: vec!["x".to_string()],
                entrypoint: vec!["/bin/a".to_string()],
                env: vec!["A=1".to_string(), "B=2".to_string()],
            },
            user_override: None,
            cmd_override: None,
            entrypoint_override: None,
            root_device: "/dev/vda".to_string(),
            etc_resolv: EtcResolv {
                nameservers: vec!["8.8.8.8".to_string()],
            },
            extra_env: vec![],
            network: NetworkConfig::default(),
        }
    }

    #[test]
    fn entrypoint_override_replaces_image_entrypoint() {
        let mut config = base_config();
        config.entrypoint_override = Some(vec!["/bin/b".to_string()]);

        let plan = build_launch_plan(&config).unwrap();
        assert_eq!(plan.argv, vec!["/bin/b", "x"]);
    }

    #[test]
    fn cmd_override_replaces_image_cmd() {
        let mut config = base_config();
        config.cmd_override = Some(vec!["y".to_string(), "z".to_string()]);

        let plan = build_launch_plan(&config).unwrap();
        assert_eq!(plan.argv, vec!["/bin/a", "y", "z"]);
    }

    #[test]
    fn empty_argv_is_rejected() {
        let mut config = base_config();
        config.image_config.entrypoint = vec![];
        config.image_config.cmd = vec![];

        let err = build_launch_plan(&config).unwrap_err();
        assert!(matches!(err, InitError::EmptyArgv));
    }

    #[test]
    fn empty_override_lists_are_respected() {
        // An explicitly empty override suppresses the image value entirely.
        let mut config = base_config();
        config.entrypoint_override = Some(vec![]);
        config.cmd_override = Some(vec![]);

        let err = build_launch_plan(&config).unwrap_err();
        assert!(matches!(err, InitError::EmptyArgv));
    }

    #[test]
    fn later_env_entries_win() {
        let merged = merge_env(
            &["A=1".to_string(), "B=2".to_string()],
            &["B=3".to_string(), "C=4".to_string()],
        );
        assert_eq!(merged, vec!["A=1", "B=3", "C=4"]);
    }

    #[test]
    fn extra_env_is_appended_to_image_env() {
        let mut config = base_config();
        config.extra_env = vec!["B=3".to_string(), "C=4".to_string()];

        let plan = build_launch_plan(&config).unwrap();
        assert_eq!(plan.env, vec!["A=1", "B=3", "C=4"]);
    }

    #[test]
    fn missing_working_dir_defaults_to_root() {
        let plan = build_launch_plan(&base_config()).unwrap();
        assert_eq!(plan.working_dir, "/");

        let mut config = base_config();
        config.image_config.working_dir = Some(String::new());
        let plan = build_launch_plan(&config).unwrap();
        assert_eq!(plan.working_dir, "/");

        config.image_config.working_dir = Some("/srv".to_string());
        let plan = build_launch_plan(&config).unwrap();
        assert_eq!(plan.working_dir, "/srv");
    }

    fn write_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn resolves_against_path_entries_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_executable(second.path(), "tool");
        let expected = second.path().join("tool");

        let plan = LaunchPlan {
            argv: vec!["tool".to_string()],
            env: vec![format!(
                "PATH={}:{}",
                first.path().display(),
                second.path().display()
            )],
            working_dir: "/".to_string(),
        };

        assert_eq!(resolve_executable(&plan).unwrap(), expected);

        // Once the first entry has the tool too, it shadows the second.
        let shadowed = write_executable(first.path(), "tool");
        assert_eq!(resolve_executable(&plan).unwrap(), shadowed);
    }

    #[test]
    fn unresolvable_program_is_executable_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let plan = LaunchPlan {
            argv: vec!["no-such-tool".to_string()],
            env: vec![format!("PATH={}", dir.path().display())],
            working_dir: "/".to_string(),
        };

        let err = resolve_executable(&plan).unwrap_err();
        assert!(matches!(err, InitError::ExecutableNotFound(_)));
        assert_eq!(err.reason_code(), "executable_not_found");
    }

    #[test]
    fn non_executable_file_is_not_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, "data").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&path, perms).unwrap();

        let plan = LaunchPlan {
            argv: vec!["tool".to_string()],
            env: vec![format!("PATH={}", dir.path().display())],
            working_dir: "/".to_string(),
        };
        assert!(resolve_executable(&plan).is_err());
    }

    #[test]
    fn absolute_path_bypasses_path_search() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_executable(dir.path(), "tool");

        let plan = LaunchPlan {
            argv: vec![tool.display().to_string()],
            env: vec![],
            working_dir: "/".to_string(),
        };
        assert_eq!(resolve_executable(&plan).unwrap(), tool);
    }

    #[test]
    fn missing_path_variable_fails_bare_names() {
        let plan = LaunchPlan {
            argv: vec!["tool".to_string()],
            env: vec!["HOME=/root".to_string()],
            working_dir: "/".to_string(),
        };
        assert!(matches!(
            resolve_executable(&plan),
            Err(InitError::ExecutableNotFound(_))
        ));
    }
}
