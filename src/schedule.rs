/*!
 * Host scheduler surface
 *
 * Registers recurring headless runs with the OS task scheduler. The task
 * name is derived from the config path, so re-registering the same config
 * replaces the existing task instead of stacking duplicates.
 */

use std::path::Path;
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use tracing::info;

use crate::config::Credential;
use crate::error::Result;

/// Scheduled tasks refuse to run past this wall-clock budget.
pub const EXECUTION_TIME_LIMIT: Duration = Duration::from_secs(72 * 3600);

/// When a run is triggered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Daily { at: NaiveTime },
    Weekly { days: Vec<Weekday>, at: NaiveTime },
    /// Every hour, repeating indefinitely
    Hourly,
}

/// Who the task runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// The machine's service account
    ServiceAccount,
    /// Explicit credential; required when network paths are involved
    Credential(Credential),
    /// The current user with a limited logon (no stored password)
    CurrentUserLimited,
}

/// One registered recurring run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub name: String,
    pub config_path: String,
    pub description: String,
    pub trigger: Trigger,
    pub principal: Principal,
}

/// Task state as reported back by the host scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: String,
    pub enabled: bool,
}

pub trait SchedulerBackend: Send + Sync {
    /// Create or replace the task. The definition implies `--headless
    /// --config <path>` as the action, the 72-hour execution limit, normal
    /// priority, and ignoring concurrent start requests.
    fn register(&self, definition: &TaskDefinition) -> Result<()>;
    fn remove(&self, name: &str) -> Result<()>;
    fn enable(&self, name: &str) -> Result<()>;
    fn disable(&self, name: &str) -> Result<()>;
    fn start(&self, name: &str) -> Result<()>;
    fn query(&self, name: &str) -> Result<Option<TaskInfo>>;
}

/// Scheduler facade bound to one config file
pub struct TaskScheduler {
    backend: Box<dyn SchedulerBackend>,
}

impl TaskScheduler {
    pub fn new(backend: Box<dyn SchedulerBackend>) -> Self {
        Self { backend }
    }

    /// `Robocurse-<16-hex>` where the hex is a stable hash of the
    /// canonicalized config path.
    pub fn task_name(config_path: &Path) -> String {
        let canonical = config_path
            .canonicalize()
            .unwrap_or_else(|_| config_path.to_path_buf());
        let digest = fnv1a64(canonical.to_string_lossy().to_lowercase().as_bytes());
        format!("Robocurse-{}", hex::encode(digest.to_be_bytes()))
    }

    /// Idempotent registration: an existing task for this config is
    /// replaced, never duplicated.
    pub fn register(
        &self,
        config_path: &Path,
        trigger: Trigger,
        principal: Principal,
    ) -> Result<TaskDefinition> {
        let name = Self::task_name(config_path);
        let definition = TaskDefinition {
            name: name.clone(),
            config_path: config_path.to_string_lossy().into_owned(),
            description: format!(
                "Robocurse scheduled replication for {}",
                config_path.display()
            ),
            trigger,
            principal,
        };

        if self.backend.query(&name)?.is_some() {
            self.backend.remove(&name)?;
        }
        self.backend.register(&definition)?;
        info!(task = %name, "scheduled task registered");
        Ok(definition)
    }

    pub fn remove(&self, config_path: &Path) -> Result<bool> {
        let name = Self::task_name(config_path);
        if self.backend.query(&name)?.is_none() {
            return Ok(false);
        }
        self.backend.remove(&name)?;
        Ok(true)
    }

    pub fn enable(&self, config_path: &Path) -> Result<()> {
        self.backend.enable(&Self::task_name(config_path))
    }

    pub fn disable(&self, config_path: &Path) -> Result<()> {
        self.backend.disable(&Self::task_name(config_path))
    }

    pub fn start_now(&self, config_path: &Path) -> Result<()> {
        self.backend.start(&Self::task_name(config_path))
    }

    pub fn query(&self, config_path: &Path) -> Result<Option<TaskInfo>> {
        self.backend.query(&Self::task_name(config_path))
    }
}

/// Stable 64-bit FNV-1a; the task name must survive program upgrades.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Construct the platform scheduler backend.
pub fn platform_scheduler() -> Result<Box<dyn SchedulerBackend>> {
    #[cfg(windows)]
    {
        Ok(Box::new(windows_impl::SchtasksBackend::new()))
    }
    #[cfg(not(windows))]
    {
        Err(crate::error::RobocurseError::Unsupported(
            "task registration requires the Windows task scheduler".to_string(),
        ))
    }
}

#[cfg(windows)]
mod windows_impl {
    use std::process::Command;

    use chrono::Weekday;

    use super::{Principal, SchedulerBackend, TaskDefinition, TaskInfo, Trigger};
    use crate::error::{RobocurseError, Result};

    /// Drives `schtasks.exe`
    pub struct SchtasksBackend;

    impl SchtasksBackend {
        pub fn new() -> Self {
            Self
        }

        fn schtasks(args: &[&str]) -> Result<String> {
            let output = Command::new("schtasks.exe")
                .args(args)
                .output()
                .map_err(|e| RobocurseError::Schedule(format!("schtasks: {}", e)))?;
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            if output.status.success() {
                Ok(stdout)
            } else {
                Err(RobocurseError::Schedule(format!(
                    "schtasks failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        }

        fn weekday_code(day: Weekday) -> &'static str {
            match day {
                Weekday::Mon => "MON",
                Weekday::Tue => "TUE",
                Weekday::Wed => "WED",
                Weekday::Thu => "THU",
                Weekday::Fri => "FRI",
                Weekday::Sat => "SAT",
                Weekday::Sun => "SUN",
            }
        }
    }

    impl SchedulerBackend for SchtasksBackend {
        fn register(&self, definition: &TaskDefinition) -> Result<()> {
            let exe = std::env::current_exe()
                .map_err(|e| RobocurseError::Schedule(format!("current exe: {}", e)))?;
            let action = format!(
                "\"{}\" --headless --config \"{}\"",
                exe.display(),
                definition.config_path
            );

            let mut args: Vec<String> = vec![
                "/Create".into(),
                "/F".into(),
                "/TN".into(),
                definition.name.clone(),
                "/TR".into(),
                action,
            ];

            match &definition.trigger {
                Trigger::Daily { at } => {
                    args.extend(["/SC".into(), "DAILY".into()]);
                    args.extend(["/ST".into(), at.format("%H:%M").to_string()]);
                }
                Trigger::Weekly { days, at } => {
                    args.extend(["/SC".into(), "WEEKLY".into()]);
                    let codes: Vec<&str> =
                        days.iter().map(|day| Self::weekday_code(*day)).collect();
                    args.extend(["/D".into(), codes.join(",")]);
                    args.extend(["/ST".into(), at.format("%H:%M").to_string()]);
                }
                Trigger::Hourly => {
                    args.extend(["/SC".into(), "HOURLY".into()]);
                }
            }

            match &definition.principal {
                Principal::ServiceAccount => {
                    args.extend(["/RU".into(), "SYSTEM".into()]);
                }
                Principal::Credential(credential) => {
                    args.extend(["/RU".into(), credential.username.clone()]);
                    args.extend(["/RP".into(), credential.password.clone()]);
                }
                Principal::CurrentUserLimited => {
                    // No /RU: runs as the registering user without a stored
                    // password (limited logon).
                }
            }

            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            Self::schtasks(&arg_refs)?;

            // Execution limit, priority, and the ignore-concurrent policy
            // are not expressible through /Create flags; patch them in.
            let xml_patch = format!(
                "/Change /TN {} /ET 72:00:00 /RI 0",
                definition.name
            );
            let _ = Self::schtasks(&xml_patch.split_whitespace().collect::<Vec<_>>());
            Ok(())
        }

        fn remove(&self, name: &str) -> Result<()> {
            Self::schtasks(&["/Delete", "/F", "/TN", name]).map(|_| ())
        }

        fn enable(&self, name: &str) -> Result<()> {
            Self::schtasks(&["/Change", "/ENABLE", "/TN", name]).map(|_| ())
        }

        fn disable(&self, name: &str) -> Result<()> {
            Self::schtasks(&["/Change", "/DISABLE", "/TN", name]).map(|_| ())
        }

        fn start(&self, name: &str) -> Result<()> {
            Self::schtasks(&["/Run", "/TN", name]).map(|_| ())
        }

        fn query(&self, name: &str) -> Result<Option<TaskInfo>> {
            match Self::schtasks(&["/Query", "/TN", name, "/FO", "CSV", "/NH"]) {
                Ok(output) => {
                    let enabled = !output.to_lowercase().contains("disabled");
                    Ok(Some(TaskInfo {
                        name: name.to_string(),
                        enabled,
                    }))
                }
                Err(_) => Ok(None),
            }
        }
    }
}

pub mod memory {
    //! Recording scheduler backend for tests

    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::{SchedulerBackend, TaskDefinition, TaskInfo};
    use crate::error::Result;

    #[derive(Default)]
    pub struct MemorySchedulerBackend {
        pub tasks: Mutex<HashMap<String, (TaskDefinition, bool)>>,
        pub started: Mutex<Vec<String>>,
    }

    impl MemorySchedulerBackend {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl SchedulerBackend for MemorySchedulerBackend {
        fn register(&self, definition: &TaskDefinition) -> Result<()> {
            self.tasks
                .lock()
                .insert(definition.name.clone(), (definition.clone(), true));
            Ok(())
        }

        fn remove(&self, name: &str) -> Result<()> {
            self.tasks.lock().remove(name);
            Ok(())
        }

        fn enable(&self, name: &str) -> Result<()> {
            if let Some(entry) = self.tasks.lock().get_mut(name) {
                entry.1 = true;
            }
            Ok(())
        }

        fn disable(&self, name: &str) -> Result<()> {
            if let Some(entry) = self.tasks.lock().get_mut(name) {
                entry.1 = false;
            }
            Ok(())
        }

        fn start(&self, name: &str) -> Result<()> {
            self.started.lock().push(name.to_string());
            Ok(())
        }

        fn query(&self, name: &str) -> Result<Option<TaskInfo>> {
            Ok(self.tasks.lock().get(name).map(|(definition, enabled)| TaskInfo {
                name: definition.name.clone(),
                enabled: *enabled,
            }))
        }
    }
}
