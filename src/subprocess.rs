//! Validation of user-supplied paths and shell-free subprocess execution
//!
//! [`PathValidator::validate`] runs before anything touches the filesystem or
//! spawns a process on behalf of a user-supplied path. It rejects, in order:
//! null bytes, shell metacharacters, `..` segments (raw, percent-encoded or
//! double-encoded) and paths that resolve outside the allow-listed base
//! directories after following symlinks. The error names the failed check.

use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{GmailError, Result};

/// Default budget for one subprocess
pub const DEFAULT_SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(300);

const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '$', '`', '>', '<', '\n', '\r'];

pub const CHECK_NULL_BYTE: &str = "null_byte";
pub const CHECK_SHELL_METACHARACTER: &str = "shell_metacharacter";
pub const CHECK_PATH_TRAVERSAL: &str = "path_traversal";
pub const CHECK_OUTSIDE_ALLOWED: &str = "outside_allowed_dirs";

#[derive(Debug, Clone)]
pub struct PathValidator {
    allowed_base_dirs: Vec<PathBuf>,
}

impl PathValidator {
    /// An empty allow-list means "the current working directory"
    pub fn new(allowed_base_dirs: Vec<PathBuf>) -> Self {
        Self { allowed_base_dirs }
    }

    /// Raw input plus its once- and twice-percent-decoded forms
    fn decoded_forms(raw: &str) -> Vec<Cow<'_, str>> {
        let mut forms = vec![Cow::Borrowed(raw)];
        if let Ok(once) = urlencoding::decode(raw) {
            if once != raw {
                if let Ok(twice) = urlencoding::decode(&once) {
                    if twice != once {
                        forms.push(Cow::Owned(twice.into_owned()));
                    }
                }
                forms.push(Cow::Owned(once.into_owned()));
            }
        }
        forms
    }

    fn has_traversal(candidate: &str) -> bool {
        candidate
            .split(['/', '\\'])
            .any(|segment| segment == "..")
    }

    /// Reject dangerous input and return the canonical path inside the allow-list
    pub fn validate(&self, raw: &str) -> Result<PathBuf> {
        let forms = Self::decoded_forms(raw);

        if forms.iter().any(|form| form.contains('\0')) {
            return Err(GmailError::validation(
                CHECK_NULL_BYTE,
                "path contains a null byte",
            ));
        }

        if let Some(ch) = forms
            .iter()
            .find_map(|form| form.chars().find(|c| SHELL_METACHARACTERS.contains(c)))
        {
            return Err(GmailError::validation(
                CHECK_SHELL_METACHARACTER,
                format!("path contains shell metacharacter {:?}", ch),
            ));
        }

        if forms.iter().any(|form| Self::has_traversal(form)) {
            return Err(GmailError::validation(
                CHECK_PATH_TRAVERSAL,
                "path contains a '..' segment",
            ));
        }

        let resolved = resolve(Path::new(raw))?;
        let bases = self.canonical_bases()?;
        if bases.iter().any(|base| resolved.starts_with(base)) {
            debug!("Validated path {:?}", resolved);
            Ok(resolved)
        } else {
            Err(GmailError::validation(
                CHECK_OUTSIDE_ALLOWED,
                format!("{} resolves outside the allowed directories", resolved.display()),
            ))
        }
    }

    fn canonical_bases(&self) -> Result<Vec<PathBuf>> {
        if self.allowed_base_dirs.is_empty() {
            return Ok(vec![std::env::current_dir()?.canonicalize()?]);
        }

        Ok(self
            .allowed_base_dirs
            .iter()
            .filter_map(|base| match base.canonicalize() {
                Ok(canonical) => Some(canonical),
                Err(e) => {
                    warn!("Ignoring allowed directory {:?}: {}", base, e);
                    None
                }
            })
            .collect())
    }

    /// Validate every path argument, then run `program` directly (no shell).
    ///
    /// The child is killed when `timeout` expires, surfacing
    /// [`GmailError::SubprocessTimeout`].
    pub async fn run_validated(
        &self,
        program: &str,
        path_args: &[&str],
        timeout: Duration,
    ) -> Result<Output> {
        if program.is_empty() || program.contains('\0') || program.contains(SHELL_METACHARACTERS) {
            return Err(GmailError::validation(
                CHECK_SHELL_METACHARACTER,
                format!("refusing to run program {:?}", program),
            ));
        }

        let validated = path_args
            .iter()
            .map(|arg| self.validate(arg))
            .collect::<Result<Vec<_>>>()?;

        let mut command = Command::new(program);
        command
            .args(&validated)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Running {} with {} path argument(s)", program, validated.len());
        match tokio::time::timeout(timeout, command.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                warn!("{} exceeded {:?}, killed", program, timeout);
                Err(GmailError::SubprocessTimeout {
                    program: program.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }
}

/// Canonicalize `path`, allowing trailing components that do not exist yet
fn resolve(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut existing = absolute.as_path();
    let mut missing: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                let mut resolved = canonical;
                for component in missing.iter().rev() {
                    resolved.push(component);
                }
                return Ok(resolved);
            }
            Err(_) => {
                let Some(Component::Normal(name)) = existing.components().next_back() else {
                    return Err(GmailError::validation(
                        CHECK_OUTSIDE_ALLOWED,
                        format!("{} cannot be resolved", absolute.display()),
                    ));
                };
                missing.push(name);
                existing = existing.parent().ok_or_else(|| {
                    GmailError::validation(
                        CHECK_OUTSIDE_ALLOWED,
                        format!("{} cannot be resolved", absolute.display()),
                    )
                })?;
            }
        }
    }
}
