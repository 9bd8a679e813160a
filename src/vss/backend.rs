/*!
 * Shadow-copy backend seam
 *
 * The coordinator never talks to the platform directly: it drives this
 * trait, which the Windows implementation maps onto the shadow-copy
 * management API (WMI `Win32_ShadowCopy` plus remote process creation for
 * junction commands). `MemoryShadowBackend` is the in-memory double used
 * by tests and by dry-run tooling on other platforms.
 */

use std::path::Path;
use std::time::Duration;

use crate::config::Credential;
use crate::error::Result;

/// A snapshot as reported by the platform right after creation
#[derive(Debug, Clone)]
pub struct ShadowInfo {
    pub shadow_id: String,
    /// Device path clients read through (e.g. `\\?\GLOBALROOT\Device\...`)
    pub shadow_path: String,
}

/// Default per-call timeout for remote management operations.
pub const REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub trait ShadowBackend: Send + Sync {
    /// Fail with `InsufficientPrivileges` when the current context cannot
    /// create shadow copies.
    fn check_privileges(&self) -> Result<()>;

    /// Remaining shadow-storage on the volume, when the platform reports it.
    fn storage_headroom(&self, volume: &str) -> Result<Option<u64>>;

    /// Create a client-accessible shadow of a local volume.
    ///
    /// Transient conditions (busy, locked, timeout, storage pressure) come
    /// back as `VssTransient`; everything else as `VssPermanent`.
    fn create_shadow(&self, volume: &str) -> Result<ShadowInfo>;

    fn delete_shadow(&self, shadow_id: &str) -> Result<()>;

    /// Ids of the volume's current shadows.
    fn list_shadows(&self, volume: &str) -> Result<Vec<String>>;

    /// Create a directory junction (no elevation required, unlike symlinks).
    fn create_junction(&self, junction: &Path, target: &str) -> Result<()>;

    fn remove_junction(&self, junction: &Path) -> Result<()>;

    /// Resolve a share name to its local path on the server.
    fn resolve_share(
        &self,
        server: &str,
        share: &str,
        credential: Option<&Credential>,
    ) -> Result<String>;

    /// Create a shadow of a volume on a remote server.
    fn create_remote_shadow(
        &self,
        server: &str,
        volume: &str,
        credential: Option<&Credential>,
    ) -> Result<ShadowInfo>;

    fn delete_remote_shadow(
        &self,
        server: &str,
        shadow_id: &str,
        credential: Option<&Credential>,
    ) -> Result<()>;

    /// Run one command on the server (junction create/remove), bounded by
    /// `timeout` so an unreachable host cannot hang the run.
    fn remote_exec(
        &self,
        server: &str,
        command: &str,
        credential: Option<&Credential>,
        timeout: Duration,
    ) -> Result<String>;
}

/// Construct the platform backend, or fail on platforms without one.
pub fn platform_backend() -> Result<Box<dyn ShadowBackend>> {
    #[cfg(windows)]
    {
        Ok(Box::new(windows_impl::WmiShadowBackend::new()))
    }
    #[cfg(not(windows))]
    {
        Err(crate::error::RobocurseError::Unsupported(
            "shadow copies require the Windows shadow-copy service".to_string(),
        ))
    }
}

#[cfg(windows)]
mod windows_impl {
    use std::path::Path;
    use std::process::Command;
    use std::time::Duration;

    use tracing::debug;

    use super::{ShadowBackend, ShadowInfo};
    use crate::config::Credential;
    use crate::error::{Result, RobocurseError};

    /// Shadow-copy management through WMI, driven via PowerShell.
    pub struct WmiShadowBackend;

    impl WmiShadowBackend {
        pub fn new() -> Self {
            Self
        }

        fn powershell(script: &str, timeout: Option<Duration>) -> Result<String> {
            let mut command = Command::new("powershell.exe");
            command.args(["-NoProfile", "-NonInteractive", "-Command", script]);

            let output = match timeout {
                None => command
                    .output()
                    .map_err(|e| RobocurseError::VssPermanent(format!("powershell: {}", e)))?,
                Some(limit) => {
                    use std::process::Stdio;
                    use std::time::Instant;
                    let mut child = command
                        .stdout(Stdio::piped())
                        .stderr(Stdio::piped())
                        .spawn()
                        .map_err(|e| RobocurseError::VssPermanent(format!("powershell: {}", e)))?;
                    let deadline = Instant::now() + limit;
                    loop {
                        if child
                            .try_wait()
                            .map_err(|e| RobocurseError::VssPermanent(e.to_string()))?
                            .is_some()
                        {
                            break;
                        }
                        if Instant::now() >= deadline {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(RobocurseError::Timeout {
                                seconds: limit.as_secs(),
                            });
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    child
                        .wait_with_output()
                        .map_err(|e| RobocurseError::VssPermanent(e.to_string()))?
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if output.status.success() {
                Ok(stdout)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Err(classify_failure(&format!("{} {}", stdout, stderr)))
            }
        }

        fn credential_prefix(credential: Option<&Credential>) -> String {
            match credential {
                Some(cred) => format!(
                    "$pw = ConvertTo-SecureString '{}' -AsPlainText -Force; \
                     $cred = New-Object System.Management.Automation.PSCredential('{}', $pw); ",
                    cred.password.replace('\'', "''"),
                    cred.username.replace('\'', "''"),
                ),
                None => String::new(),
            }
        }
    }

    /// Transient signals per the shadow service: busy, locked, timeout, and
    /// the storage-pressure return codes.
    fn classify_failure(message: &str) -> RobocurseError {
        let lower = message.to_lowercase();
        let transient = ["busy", "locked", "timeout", "0x8004231f", "0x80042306", "storage"]
            .iter()
            .any(|signal| lower.contains(signal));
        if transient {
            RobocurseError::VssTransient(message.to_string())
        } else {
            RobocurseError::VssPermanent(message.to_string())
        }
    }

    impl ShadowBackend for WmiShadowBackend {
        fn check_privileges(&self) -> Result<()> {
            let script = "([Security.Principal.WindowsPrincipal] \
                 [Security.Principal.WindowsIdentity]::GetCurrent()).IsInRole(\
                 [Security.Principal.WindowsBuiltInRole]::Administrator)";
            let output = Self::powershell(script, None)?;
            if output.eq_ignore_ascii_case("true") {
                Ok(())
            } else {
                Err(RobocurseError::InsufficientPrivileges(
                    "shadow-copy creation requires backup-operator rights".to_string(),
                ))
            }
        }

        fn storage_headroom(&self, volume: &str) -> Result<Option<u64>> {
            let script = format!(
                "(Get-WmiObject Win32_ShadowStorage | Where-Object {{ \
                 $_.Volume -match '{}' }}).MaxSpace - \
                 (Get-WmiObject Win32_ShadowStorage | Where-Object {{ \
                 $_.Volume -match '{}' }}).UsedSpace",
                volume.trim_end_matches('\\').replace(':', ""),
                volume.trim_end_matches('\\').replace(':', ""),
            );
            match Self::powershell(&script, None) {
                Ok(output) => Ok(output.parse::<u64>().ok()),
                Err(_) => Ok(None),
            }
        }

        fn create_shadow(&self, volume: &str) -> Result<ShadowInfo> {
            let script = format!(
                "$r = (Get-WmiObject -List Win32_ShadowCopy).Create('{}\\', 'ClientAccessible'); \
                 if ($r.ReturnValue -ne 0) {{ throw \"create failed: $($r.ReturnValue)\" }}; \
                 $s = Get-WmiObject Win32_ShadowCopy -Filter \"ID='$($r.ShadowID)'\"; \
                 Write-Output \"$($s.ID)|$($s.DeviceObject)\"",
                volume.trim_end_matches('\\'),
            );
            let output = Self::powershell(&script, None)?;
            let (id, device) = output
                .split_once('|')
                .ok_or_else(|| RobocurseError::VssPermanent(format!("bad create output: {}", output)))?;
            debug!(shadow_id = id, "shadow created");
            Ok(ShadowInfo {
                shadow_id: id.trim().to_string(),
                shadow_path: device.trim().to_string(),
            })
        }

        fn delete_shadow(&self, shadow_id: &str) -> Result<()> {
            let script = format!(
                "Get-WmiObject Win32_ShadowCopy -Filter \"ID='{}'\" | ForEach-Object {{ $_.Delete() }}",
                shadow_id.replace('\'', ""),
            );
            Self::powershell(&script, None).map(|_| ())
        }

        fn list_shadows(&self, volume: &str) -> Result<Vec<String>> {
            let script = format!(
                "Get-WmiObject Win32_ShadowCopy | Where-Object {{ \
                 $_.VolumeName -match '{}' }} | ForEach-Object {{ $_.ID }}",
                volume.trim_end_matches('\\').replace(':', ""),
            );
            let output = Self::powershell(&script, None)?;
            Ok(output
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect())
        }

        fn create_junction(&self, junction: &Path, target: &str) -> Result<()> {
            let status = Command::new("cmd.exe")
                .args([
                    "/c",
                    "mklink",
                    "/J",
                    &junction.to_string_lossy(),
                    target,
                ])
                .status()
                .map_err(|e| RobocurseError::VssPermanent(format!("mklink: {}", e)))?;
            if status.success() {
                Ok(())
            } else {
                Err(RobocurseError::VssPermanent(format!(
                    "mklink failed for {}",
                    junction.display()
                )))
            }
        }

        fn remove_junction(&self, junction: &Path) -> Result<()> {
            // A junction is a directory entry; remove_dir drops the reparse
            // point without following it.
            std::fs::remove_dir(junction)?;
            Ok(())
        }

        fn resolve_share(
            &self,
            server: &str,
            share: &str,
            credential: Option<&Credential>,
        ) -> Result<String> {
            let script = format!(
                "{}Get-WmiObject Win32_Share -ComputerName '{}' {} | \
                 Where-Object {{ $_.Name -eq '{}' }} | ForEach-Object {{ $_.Path }}",
                Self::credential_prefix(credential),
                server,
                if credential.is_some() { "-Credential $cred" } else { "" },
                share,
            );
            let output = Self::powershell(&script, Some(super::REMOTE_CALL_TIMEOUT))?;
            let path = output.trim();
            if path.is_empty() {
                Err(RobocurseError::VssPermanent(format!(
                    "share {} not found on {}",
                    share, server
                )))
            } else {
                Ok(path.to_string())
            }
        }

        fn create_remote_shadow(
            &self,
            server: &str,
            volume: &str,
            credential: Option<&Credential>,
        ) -> Result<ShadowInfo> {
            let script = format!(
                "{}$r = (Get-WmiObject -List Win32_ShadowCopy -ComputerName '{}' {}).Create('{}\\', 'ClientAccessible'); \
                 if ($r.ReturnValue -ne 0) {{ throw \"create failed: $($r.ReturnValue)\" }}; \
                 $s = Get-WmiObject Win32_ShadowCopy -ComputerName '{}' {} -Filter \"ID='$($r.ShadowID)'\"; \
                 Write-Output \"$($s.ID)|$($s.DeviceObject)\"",
                Self::credential_prefix(credential),
                server,
                if credential.is_some() { "-Credential $cred" } else { "" },
                volume.trim_end_matches('\\'),
                server,
                if credential.is_some() { "-Credential $cred" } else { "" },
            );
            let output = Self::powershell(&script, Some(super::REMOTE_CALL_TIMEOUT))?;
            let (id, device) = output
                .split_once('|')
                .ok_or_else(|| RobocurseError::VssPermanent(format!("bad create output: {}", output)))?;
            Ok(ShadowInfo {
                shadow_id: id.trim().to_string(),
                shadow_path: device.trim().to_string(),
            })
        }

        fn delete_remote_shadow(
            &self,
            server: &str,
            shadow_id: &str,
            credential: Option<&Credential>,
        ) -> Result<()> {
            let script = format!(
                "{}Get-WmiObject Win32_ShadowCopy -ComputerName '{}' {} -Filter \"ID='{}'\" | \
                 ForEach-Object {{ $_.Delete() }}",
                Self::credential_prefix(credential),
                server,
                if credential.is_some() { "-Credential $cred" } else { "" },
                shadow_id.replace('\'', ""),
            );
            Self::powershell(&script, Some(super::REMOTE_CALL_TIMEOUT)).map(|_| ())
        }

        fn remote_exec(
            &self,
            server: &str,
            command: &str,
            credential: Option<&Credential>,
            timeout: Duration,
        ) -> Result<String> {
            let script = format!(
                "{}Invoke-WmiMethod -ComputerName '{}' {} -Class Win32_Process \
                 -Name Create -ArgumentList 'cmd.exe /c {}'",
                Self::credential_prefix(credential),
                server,
                if credential.is_some() { "-Credential $cred" } else { "" },
                command.replace('\'', "''"),
            );
            Self::powershell(&script, Some(timeout))
        }
    }
}

pub mod memory {
    //! In-memory shadow backend for tests
    //!
    //! Mirrors the platform contract closely enough to exercise the
    //! coordinator: scripted transient failures, shadow bookkeeping, and
    //! junction/remote-command recording.

    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::{ShadowBackend, ShadowInfo};
    use crate::config::Credential;
    use crate::error::{Result, RobocurseError};

    #[derive(Default)]
    pub struct MemoryShadowBackend {
        next_id: AtomicUsize,
        /// Shadows by id -> volume
        pub shadows: Mutex<HashMap<String, String>>,
        /// Junctions by path -> target
        pub junctions: Mutex<HashMap<PathBuf, String>>,
        /// Shares resolvable as (server, share) -> local path
        pub shares: Mutex<HashMap<(String, String), String>>,
        /// Commands run remotely, in order
        pub remote_commands: Mutex<Vec<String>>,
        /// Next N create calls fail transiently
        pub transient_failures: AtomicU32,
        /// When true every create fails permanently
        pub permanently_broken: std::sync::atomic::AtomicBool,
        /// When true privilege checks fail
        pub privileges_missing: std::sync::atomic::AtomicBool,
        /// Ordered teardown trace: "junction:<path>" / "shadow:<id>"
        pub teardown_trace: Mutex<Vec<String>>,
    }

    impl MemoryShadowBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_share(self, server: &str, share: &str, local: &str) -> Self {
            self.shares
                .lock()
                .insert((server.to_string(), share.to_string()), local.to_string());
            self
        }

        pub fn fail_transiently(&self, times: u32) {
            self.transient_failures.store(times, Ordering::SeqCst);
        }

        fn next_shadow(&self, volume: &str) -> Result<ShadowInfo> {
            if self.privileges_missing.load(Ordering::SeqCst) {
                return Err(RobocurseError::InsufficientPrivileges("mock".to_string()));
            }
            if self.permanently_broken.load(Ordering::SeqCst) {
                return Err(RobocurseError::VssPermanent("unsupported volume".to_string()));
            }
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RobocurseError::VssTransient("volume busy".to_string()));
            }

            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let id = format!("{{shadow-{:04}}}", n);
            let path = format!(r"\\?\GLOBALROOT\Device\HarddiskVolumeShadowCopy{}", n);
            self.shadows.lock().insert(id.clone(), volume.to_string());
            Ok(ShadowInfo {
                shadow_id: id,
                shadow_path: path,
            })
        }
    }

    impl ShadowBackend for MemoryShadowBackend {
        fn check_privileges(&self) -> Result<()> {
            if self.privileges_missing.load(Ordering::SeqCst) {
                Err(RobocurseError::InsufficientPrivileges("mock".to_string()))
            } else {
                Ok(())
            }
        }

        fn storage_headroom(&self, _volume: &str) -> Result<Option<u64>> {
            Ok(Some(10 * 1024 * 1024 * 1024))
        }

        fn create_shadow(&self, volume: &str) -> Result<ShadowInfo> {
            self.next_shadow(volume)
        }

        fn delete_shadow(&self, shadow_id: &str) -> Result<()> {
            if self.shadows.lock().remove(shadow_id).is_none() {
                return Err(RobocurseError::VssPermanent(format!(
                    "unknown shadow {}",
                    shadow_id
                )));
            }
            self.teardown_trace
                .lock()
                .push(format!("shadow:{}", shadow_id));
            Ok(())
        }

        fn list_shadows(&self, volume: &str) -> Result<Vec<String>> {
            let mut ids: Vec<String> = self
                .shadows
                .lock()
                .iter()
                .filter(|(_, v)| v.as_str() == volume)
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            Ok(ids)
        }

        fn create_junction(&self, junction: &Path, target: &str) -> Result<()> {
            self.junctions
                .lock()
                .insert(junction.to_path_buf(), target.to_string());
            Ok(())
        }

        fn remove_junction(&self, junction: &Path) -> Result<()> {
            if self.junctions.lock().remove(junction).is_none() {
                return Err(RobocurseError::VssPermanent(format!(
                    "unknown junction {}",
                    junction.display()
                )));
            }
            self.teardown_trace
                .lock()
                .push(format!("junction:{}", junction.display()));
            Ok(())
        }

        fn resolve_share(
            &self,
            server: &str,
            share: &str,
            _credential: Option<&Credential>,
        ) -> Result<String> {
            self.shares
                .lock()
                .get(&(server.to_string(), share.to_string()))
                .cloned()
                .ok_or_else(|| {
                    RobocurseError::VssPermanent(format!("share {} not found on {}", share, server))
                })
        }

        fn create_remote_shadow(
            &self,
            server: &str,
            volume: &str,
            _credential: Option<&Credential>,
        ) -> Result<ShadowInfo> {
            self.next_shadow(&format!("{}:{}", server, volume))
        }

        fn delete_remote_shadow(
            &self,
            _server: &str,
            shadow_id: &str,
            _credential: Option<&Credential>,
        ) -> Result<()> {
            self.delete_shadow(shadow_id)
        }

        fn remote_exec(
            &self,
            server: &str,
            command: &str,
            _credential: Option<&Credential>,
            _timeout: Duration,
        ) -> Result<String> {
            self.remote_commands
                .lock()
                .push(format!("{}: {}", server, command));
            // Junction bookkeeping mirrors what the command would do.
            if let Some(rest) = command.strip_prefix("mklink /J ") {
                if let Some((junction, target)) = split_quoted_pair(rest) {
                    self.junctions
                        .lock()
                        .insert(PathBuf::from(junction), target);
                }
            } else if let Some(rest) = command.strip_prefix("rmdir ") {
                let junction = PathBuf::from(rest.trim_matches('"'));
                if self.junctions.lock().remove(&junction).is_some() {
                    self.teardown_trace
                        .lock()
                        .push(format!("junction:{}", junction.display()));
                }
            }
            Ok(String::new())
        }
    }

    fn split_quoted_pair(rest: &str) -> Option<(String, String)> {
        let parts: Vec<&str> = rest.split('"').filter(|s| !s.trim().is_empty()).collect();
        if parts.len() >= 2 {
            Some((parts[0].to_string(), parts[1].to_string()))
        } else {
            None
        }
    }
}
