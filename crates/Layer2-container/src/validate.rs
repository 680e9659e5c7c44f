//! Input validation for values that end up on an engine command line
//!
//! Everything here runs before the engine is invoked. Values are passed to
//! the engine as separate argv entries, so the checks are about option
//! injection (`-`-prefixed values), control characters and malformed specs.

use crucible_foundation::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

static NAME_RE: OnceLock<Regex> = OnceLock::new();
static MEMORY_RE: OnceLock<Regex> = OnceLock::new();
static ENV_KEY_RE: OnceLock<Regex> = OnceLock::new();
static SCP_URL_RE: OnceLock<Regex> = OnceLock::new();

/// URL schemes accepted for `git clone`
const ALLOWED_SCHEMES: &[&str] = &["https", "http", "ssh", "git"];

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,127}$").expect("valid regex"))
}

fn memory_re() -> &'static Regex {
    MEMORY_RE.get_or_init(|| Regex::new(r"^[0-9]+[bkmgBKMG]?$").expect("valid regex"))
}

fn env_key_re() -> &'static Regex {
    ENV_KEY_RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

fn scp_url_re() -> &'static Regex {
    SCP_URL_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[A-Za-z0-9._/~-]+$").expect("valid regex")
    })
}

fn has_control_chars(value: &str) -> bool {
    value.chars().any(char::is_control)
}

/// Container name as accepted by Docker and Podman
pub fn container_name(name: &str) -> Result<()> {
    if name_re().is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid container name '{}'", name)))
    }
}

pub fn image(image: &str) -> Result<()> {
    if image.is_empty()
        || image.starts_with('-')
        || image.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(Error::Validation(format!("invalid image reference '{}'", image)));
    }
    Ok(())
}

/// Memory limit such as "512m" or "2g"
pub fn memory(value: &str) -> Result<()> {
    if memory_re().is_match(value) {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid memory limit '{}'", value)))
    }
}

/// CPU share, a positive decimal
pub fn cpus(value: &str) -> Result<()> {
    match value.parse::<f64>() {
        Ok(v) if v > 0.0 && v.is_finite() => Ok(()),
        _ => Err(Error::Validation(format!("invalid cpu share '{}'", value))),
    }
}

pub fn env_var(key: &str, value: &str) -> Result<()> {
    if !env_key_re().is_match(key) {
        return Err(Error::Validation(format!(
            "invalid environment variable name '{}'",
            key
        )));
    }
    if value.contains('\0') {
        return Err(Error::Validation(format!(
            "environment variable '{}' contains a NUL byte",
            key
        )));
    }
    Ok(())
}

/// Absolute path inside the container
pub fn container_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || has_control_chars(path) || path.contains(':') {
        return Err(Error::Validation(format!(
            "invalid container path '{}'",
            path
        )));
    }
    Ok(())
}

/// Label key/value pair
pub fn label(key: &str, value: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('-') || key.contains('=') || has_control_chars(key) {
        return Err(Error::Validation(format!("invalid label key '{}'", key)));
    }
    if has_control_chars(value) {
        return Err(Error::Validation(format!("invalid value for label '{}'", key)));
    }
    Ok(())
}

/// Repository URL handed to `git clone`
///
/// Accepts `https`, `http`, `ssh` and `git` URLs plus scp-style
/// `user@host:path`. Rejects anything git would read as an option and
/// transport helpers such as `ext::`.
pub fn repository_url(value: &str) -> Result<()> {
    let reject = |why: &str| Err(Error::Validation(format!("repository URL {}: '{}'", why, value)));

    if value.is_empty() {
        return reject("is empty");
    }
    if value.starts_with('-') {
        return reject("must not start with '-'");
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return reject("contains whitespace or control characters");
    }
    if value.contains("::") {
        return reject("uses a transport helper");
    }

    if scp_url_re().is_match(value) {
        return Ok(());
    }

    let parsed = match url::Url::parse(value) {
        Ok(parsed) => parsed,
        Err(_) => return reject("is not a valid URL"),
    };
    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return reject("uses an unsupported scheme");
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => reject("has no host"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_names() {
        assert!(container_name("crucible-1a2b3c4d").is_ok());
        assert!(container_name("x").is_ok());
        assert!(container_name("-rm").is_err());
        assert!(container_name("has space").is_err());
        assert!(container_name("").is_err());
    }

    #[test]
    fn test_memory_and_cpus() {
        assert!(memory("2g").is_ok());
        assert!(memory("512m").is_ok());
        assert!(memory("1024").is_ok());
        assert!(memory("2 g").is_err());
        assert!(memory("--privileged").is_err());

        assert!(cpus("2").is_ok());
        assert!(cpus("0.5").is_ok());
        assert!(cpus("0").is_err());
        assert!(cpus("two").is_err());
    }

    #[test]
    fn test_env_vars() {
        assert!(env_var("DEBIAN_FRONTEND", "noninteractive").is_ok());
        assert!(env_var("1BAD", "x").is_err());
        assert!(env_var("A=B", "x").is_err());
        assert!(env_var("OK", "nul\0byte").is_err());
    }

    #[test]
    fn test_repository_urls() {
        assert!(repository_url("https://github.com/rust-lang/cargo.git").is_ok());
        assert!(repository_url("ssh://git@example.com/org/repo.git").is_ok());
        assert!(repository_url("git@github.com:org/repo.git").is_ok());

        assert!(repository_url("--upload-pack=touch /tmp/pwned").is_err());
        assert!(repository_url("https://example.com/repo; rm -rf /").is_err());
        assert!(repository_url("ext::sh -c touch% /tmp/pwned").is_err());
        assert!(repository_url("file:///etc").is_err());
        assert!(repository_url("").is_err());
    }

    #[test]
    fn test_container_paths() {
        assert!(container_path("/workspace").is_ok());
        assert!(container_path("workspace").is_err());
        assert!(container_path("/a:/b").is_err());
    }
}
