//! Pre-launch security invariant gate.
//!
//! The last line of defense before exec: the assembled argv is scanned
//! for every security flag the configuration promises. A missing flag is
//! fatal and aborts the launch — a sandbox must never start silently
//! weaker than configured.

use crate::argv::SecurityExpectations;
use crate::SandboxError;

/// Scan `argv` against the expectations. All missing invariants are
/// collected and reported together, each with the flag that was
/// expected.
pub fn verify_launch_argv(
    argv: &[String],
    expectations: &SecurityExpectations,
) -> Result<(), SandboxError> {
    let mut missing = Vec::new();

    let seccomp_flag = format!("seccomp={}", expectations.seccomp_profile);
    if !has_flag_value(argv, "--security-opt", &seccomp_flag) {
        missing.push(format!(
            "seccomp profile flag (--security-opt {seccomp_flag}); install the profile and re-run setup"
        ));
    }

    if !has_flag_value(argv, "--label", &expectations.label) {
        missing.push(format!("sandbox label (--label {})", expectations.label));
    }

    if let Some(platform) = &expectations.runtime_platform
        && !has_flag_value(argv, "--runtime", platform)
    {
        missing.push(format!(
            "isolated runtime selector (--runtime {platform}); gVisor is required by configuration"
        ));
    }

    if let Some(profile) = &expectations.apparmor_profile {
        let apparmor_flag = format!("apparmor={profile}");
        if !has_flag_value(argv, "--security-opt", &apparmor_flag) {
            missing.push(format!(
                "AppArmor profile flag (--security-opt {apparmor_flag})"
            ));
        }
    }

    if expectations.cap_drop_all && !has_flag_value(argv, "--cap-drop", "ALL") {
        missing.push("capability drop (--cap-drop ALL)".to_string());
    }

    if expectations.no_new_privileges
        && !has_flag_value(argv, "--security-opt", "no-new-privileges")
    {
        missing.push("no-new-privileges (--security-opt no-new-privileges)".to_string());
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::LaunchInvariant { missing })
    }
}

/// True when `flag` is immediately followed by `value` anywhere in the
/// argv.
fn has_flag_value(argv: &[String], flag: &str, value: &str) -> bool {
    argv.windows(2)
        .any(|pair| pair[0] == flag && pair[1] == value)
}
