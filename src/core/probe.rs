use std::ffi::CString;
use std::fs;
use std::path::Path;

use sysinfo::System;

use crate::error::Result;

use super::diagnostics::{Diagnostic, Severity};
use super::resolver::is_executable;
use super::supervisor::{self, ExitNotice};

/// VDE tool set a complete installation provides.
pub const VDE_BINS: &[&str] = &[
    "vde_switch",
    "vde_plug",
    "vde_cryptcab",
    "dpipe",
    "vdeterm",
    "vde_plug2tap",
    "wirefilter",
];

/// QEMU binaries recognized for Qemu bricks.
pub const QEMU_BINS: &[&str] = &[
    "qemu",
    "kvm",
    "qemu-system-arm",
    "qemu-system-cris",
    "qemu-system-i386",
    "qemu-system-m68k",
    "qemu-system-microblaze",
    "qemu-system-mips",
    "qemu-system-mips64",
    "qemu-system-mips64el",
    "qemu-system-mipsel",
    "qemu-system-ppc",
    "qemu-system-ppc64",
    "qemu-system-ppcemb",
    "qemu-system-sh4",
    "qemu-system-sh4eb",
    "qemu-system-sparc",
    "qemu-system-sparc64",
    "qemu-system-x86_64",
    "qemu-img",
];

const KSM_RUN_PATH: &str = "/sys/kernel/mm/ksm/run";
const KVM_DEVICE_PATH: &str = "/sys/class/misc/kvm";

const MEMORY_WARN_HEADROOM: u64 = 1024 * 1024 * 1024;
const MEMORY_FAIL_HEADROOM: u64 = 512 * 1024 * 1024;

/// Subset of `binaries` not found executable under `path`.
pub fn check_missing<'a>(path: &Path, binaries: &[&'a str]) -> Vec<&'a str> {
    binaries
        .iter()
        .filter(|name| !is_executable(&path.join(name)))
        .copied()
        .collect()
}

pub fn check_missing_vde(path: &Path) -> Vec<&'static str> {
    check_missing(path, VDE_BINS)
}

pub fn check_missing_qemu(path: &Path) -> Vec<&'static str> {
    check_missing(path, QEMU_BINS)
}

/// True iff a `kvm` binary is executable under `path` and the host exposes
/// the KVM device node.
pub fn check_kvm(path: &Path) -> bool {
    is_executable(&path.join("kvm")) && kvm_device_present()
}

/// True when the host kernel exposes the KVM device node.
pub fn kvm_device_present() -> bool {
    access_x(Path::new(KVM_DEVICE_PATH))
}

/// Current state of kernel same-page merging, false when unreadable.
pub fn check_ksm() -> bool {
    read_boolean_pseudo_file(Path::new(KSM_RUN_PATH))
}

/// Toggle KSM if the current host state differs from `enable`.
///
/// Fire-and-forget: the toggle runs through the shell (optionally elevated via
/// `sudo`) and a nonzero exit only reaches the caller through `on_exit`.
pub fn enable_ksm<F>(enable: bool, sudo: Option<&str>, on_exit: F) -> Result<bool>
where
    F: FnOnce(ExitNotice) + Send + 'static,
{
    enable_ksm_with_state(enable, check_ksm(), sudo, on_exit)
}

fn enable_ksm_with_state<F>(
    enable: bool,
    current: bool,
    sudo: Option<&str>,
    on_exit: F,
) -> Result<bool>
where
    F: FnOnce(ExitNotice) + Send + 'static,
{
    if enable == current {
        return Ok(false);
    }
    let command = format!("echo {} > {}", enable as u8, KSM_RUN_PATH);
    supervisor::run_shell(&command, sudo, on_exit)?;
    Ok(true)
}

/// Host memory headroom check performed before launching a QEMU brick.
pub fn check_memory(requested_bytes: u64) -> Option<Diagnostic> {
    let system = System::new_all();
    let Some(total) = system.total_memory().checked_mul(1024) else {
        return Some(Diagnostic::new(
            Severity::Warning,
            "Unable to determine host memory capacity; skipping memory safety check.",
        ));
    };

    let available = total.saturating_sub(requested_bytes);
    if available < MEMORY_FAIL_HEADROOM {
        Some(Diagnostic::new(
            Severity::Error,
            format!(
                "Requested {} of guest RAM leaves the host under its safety headroom.",
                super::image::fmtsize(requested_bytes)
            ),
        ))
    } else if available < MEMORY_WARN_HEADROOM {
        Some(Diagnostic::new(
            Severity::Warning,
            format!(
                "Requested {} of guest RAM; expect host memory pressure after launch.",
                super::image::fmtsize(requested_bytes)
            ),
        ))
    } else {
        None
    }
}

/// Generate a locally-administered NIC MAC in the `00:aa:` prefix.
pub fn random_mac() -> String {
    format!(
        "00:aa:{:02x}:{:02x}:{:02x}:{:02x}",
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>()
    )
}

pub fn mac_is_valid(mac: &str) -> bool {
    let mut groups = 0;
    for group in mac.split(':') {
        if group.len() != 2 || !group.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }
        groups += 1;
    }
    groups == 6
}

fn read_boolean_pseudo_file(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(contents) => contents
            .lines()
            .next()
            .and_then(|line| line.trim().parse::<i32>().ok())
            .map(|value| value != 0)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn access_x(path: &Path) -> bool {
    let Some(bytes) = path.to_str() else {
        return false;
    };
    let Ok(cstr) = CString::new(bytes) else {
        return false;
    };
    unsafe { libc::access(cstr.as_ptr(), libc::X_OK) == 0 }
}
