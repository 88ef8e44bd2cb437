//! Rendering of `template` directives.
//!
//! The template file is rendered with minijinja, using the environment's keys
//! as top-level variables, and written to the target. Ownership and mode are
//! applied afterwards when the directive asks for them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use minijinja::Environment;
use tracing::debug;

use crate::config::{resolve, TemplateSpec};
use crate::store::EnvMap;

/// Renders `spec` with `data`, resolving relative paths against `base`.
pub fn render(spec: &TemplateSpec, base: &Path, data: &EnvMap) -> Result<PathBuf> {
    let source_path = resolve(base, Some(&spec.template));
    let target = resolve(base, Some(&spec.target));

    let source = fs::read_to_string(&source_path)
        .with_context(|| format!("failed to read template {}", source_path.display()))?;
    let rendered = Environment::new()
        .render_str(&source, data)
        .with_context(|| format!("failed to render template {}", source_path.display()))?;
    fs::write(&target, rendered)
        .with_context(|| format!("failed to write {}", target.display()))?;
    debug!(template = %source_path.display(), target = %target.display(), "rendered template");

    set_ownership(&target, spec.owner.as_deref(), spec.group.as_deref())?;
    if let Some(mode) = spec.mode.as_deref().filter(|mode| !mode.is_empty()) {
        set_mode(&target, parse_mode(mode)?)?;
    }
    Ok(target)
}

/// Parses an octal file mode: "0644", "644" and "0o644" are all 0o644.
pub fn parse_mode(mode: &str) -> Result<u32> {
    let digits = mode.strip_prefix("0o").unwrap_or(mode);
    let parsed = u32::from_str_radix(digits, 8)
        .with_context(|| format!("invalid file mode {:?}", mode))?;
    if parsed > 0o7777 {
        bail!("invalid file mode {:?}", mode);
    }
    Ok(parsed)
}

#[cfg(unix)]
fn set_mode(target: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(target, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to chmod {}", target.display()))
}

#[cfg(not(unix))]
fn set_mode(_target: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_ownership(target: &Path, owner: Option<&str>, group: Option<&str>) -> Result<()> {
    let owner = owner.filter(|name| !name.is_empty());
    let group = group.filter(|name| !name.is_empty());
    if owner.is_none() && group.is_none() {
        return Ok(());
    }
    let uid = owner.map(lookup_user).transpose()?;
    let gid = group.map(lookup_group).transpose()?;
    std::os::unix::fs::chown(target, uid, gid)
        .with_context(|| format!("failed to chown {}", target.display()))
}

#[cfg(not(unix))]
fn set_ownership(_target: &Path, _owner: Option<&str>, _group: Option<&str>) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn lookup_user(name: &str) -> Result<u32> {
    if let Ok(uid) = name.parse() {
        return Ok(uid);
    }
    let c_name = std::ffi::CString::new(name).with_context(|| format!("invalid user {:?}", name))?;
    // SAFETY: getpwnam reads a NUL-terminated string; the returned record is
    // only read before any other passwd call on this thread.
    let entry = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if entry.is_null() {
        bail!("unknown user {:?}", name);
    }
    Ok(unsafe { (*entry).pw_uid })
}

#[cfg(unix)]
fn lookup_group(name: &str) -> Result<u32> {
    if let Ok(gid) = name.parse() {
        return Ok(gid);
    }
    let c_name =
        std::ffi::CString::new(name).with_context(|| format!("invalid group {:?}", name))?;
    // SAFETY: see lookup_user.
    let entry = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if entry.is_null() {
        bail!("unknown group {:?}", name);
    }
    Ok(unsafe { (*entry).gr_gid })
}
