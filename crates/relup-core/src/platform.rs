//! Platform tags used in archive names and manifest keys.

/// Recognized platform tags.
pub const PLATFORMS: &[&str] = &["mac", "win", "nix", "nix64", "arm"];

/// Find the platform tag among the `-` separated tokens of an archive
/// filename, e.g. `app-mac-0.1.0.tar.gz` → `mac`.
pub fn parse_platform(filename: &str) -> Option<&'static str> {
    let found = filename
        .split('-')
        .find_map(|token| PLATFORMS.iter().copied().find(|tag| *tag == token));
    if let Some(tag) = found {
        tracing::debug!(platform = tag, filename, "parsed platform");
    }
    found
}

/// Platform tag of the running build.
pub fn current_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else if cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
        "arm"
    } else if cfg!(target_pointer_width = "64") {
        "nix64"
    } else {
        "nix"
    }
}
