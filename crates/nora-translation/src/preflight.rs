//! Environment checks run before the helper is started.

use std::path::Path;
use std::process::Command;

use crate::{Result, TranslatorError};

/// A parsed `node -v` answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Parse `v18.19.0` (the leading `v` and trailing noise are optional).
pub fn parse_node_version(raw: &str) -> Option<NodeVersion> {
    let raw = raw.trim().trim_start_matches('v');
    let mut parts = raw.split('.').map(|p| {
        let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u32>().ok()
    });
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some(NodeVersion {
        major,
        minor,
        patch,
    })
}

/// Ensure `major` lies within `[min_major, max_major]`.
pub fn validate_node_version(version: NodeVersion, min_major: u32, max_major: u32) -> Result<()> {
    if version.major < min_major {
        return Err(TranslatorError::Preflight(format!(
            "Node.js >= {min_major} is required, found v{}.{}.{}",
            version.major, version.minor, version.patch
        )));
    }
    if version.major > max_major {
        return Err(TranslatorError::Preflight(format!(
            "Node.js <= {max_major} is required, found v{}.{}.{}",
            version.major, version.minor, version.patch
        )));
    }
    Ok(())
}

/// Run `node -v` and check the major version.
pub fn check_node_version(min_major: u32, max_major: u32) -> Result<NodeVersion> {
    let output = Command::new("node")
        .arg("-v")
        .output()
        .map_err(|e| TranslatorError::Preflight(format!("could not run `node -v`: {e}")))?;
    if !output.status.success() {
        return Err(TranslatorError::Preflight(format!(
            "`node -v` exited with {}",
            output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = parse_node_version(&stdout).ok_or_else(|| {
        TranslatorError::Preflight(format!("unrecognised Node.js version {:?}", stdout.trim()))
    })?;
    validate_node_version(version, min_major, max_major)?;
    Ok(version)
}

/// The helper root must hold a `package.json` for `npm start` to work.
pub fn check_server_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(TranslatorError::Preflight(format!(
            "translation server directory {} does not exist",
            dir.display()
        )));
    }
    if !dir.join("package.json").is_file() {
        return Err(TranslatorError::Preflight(format!(
            "no package.json in {}; is translation-server installed there?",
            dir.display()
        )));
    }
    Ok(())
}
