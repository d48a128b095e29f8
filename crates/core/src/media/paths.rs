use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Path is required")]
    Required,
    #[error("Access denied: Path outside of allowed directory")]
    OutsideBase,
    #[error("Access denied: Symbolic link points outside of allowed directory")]
    SymlinkEscape,
    #[error("Path does not exist")]
    Missing,
    #[error("Failed to create directory: {0}")]
    Create(String),
    #[error("Filename is required")]
    FilenameRequired,
    #[error("Filename contains invalid characters")]
    InvalidFilename { sanitized: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SecurePathOptions {
    pub must_exist: bool,
    pub create_if_missing: bool,
    /// Resolve symlinks and re-check containment on the real path.
    pub follow_symlinks: bool,
}

impl SecurePathOptions {
    pub fn existing() -> Self {
        Self {
            must_exist: true,
            ..Self::default()
        }
    }

    /// An existing file whose real location is also under the base.
    pub fn readable() -> Self {
        Self {
            must_exist: true,
            follow_symlinks: true,
            ..Self::default()
        }
    }
}

/// A path known to live under a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurePath {
    pub absolute: PathBuf,
    /// `/`-prefixed, `/`-separated path relative to the base.
    pub relative: String,
}

/// Resolves `user_path` under `base`. Leading slashes are ignored and `.`/`..`
/// are folded lexically, so `/a/../b` is `base/b` and `../x` is rejected.
pub fn secure_path(
    user_path: &str,
    base: &Path,
    options: SecurePathOptions,
) -> Result<SecurePath, PathError> {
    if user_path.is_empty() {
        return Err(PathError::Required);
    }

    let trimmed = user_path.trim_start_matches(['/', '\\']);
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or(PathError::OutsideBase)?),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathError::OutsideBase);
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(PathError::OutsideBase),
        }
    }

    let mut absolute = base.to_path_buf();
    absolute.extend(&parts);

    if options.must_exist && !absolute.exists() {
        return Err(PathError::Missing);
    }

    if options.create_if_missing && !absolute.exists() {
        std::fs::create_dir_all(&absolute).map_err(|err| PathError::Create(err.to_string()))?;
        tracing::debug!(path = %absolute.display(), "Created directory");
    }

    if options.follow_symlinks && absolute.exists() {
        let real = absolute
            .canonicalize()
            .map_err(|err| PathError::Create(err.to_string()))?;
        let real_base = base
            .canonicalize()
            .map_err(|err| PathError::Create(err.to_string()))?;
        if !real.starts_with(&real_base) {
            return Err(PathError::SymlinkEscape);
        }
    }

    Ok(SecurePath {
        absolute,
        relative: format!("/{}", parts.join("/")),
    })
}

const FORBIDDEN_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn is_forbidden(ch: char) -> bool {
    FORBIDDEN_FILENAME_CHARS.contains(&ch) || ch.is_control()
}

/// Last path component of `name`, rejected when it contains characters that
/// are unsafe on common filesystems.
pub fn validate_filename(name: &str) -> Result<String, PathError> {
    let basename = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_string();
    if basename.is_empty() || basename == "." || basename == ".." {
        return Err(PathError::FilenameRequired);
    }
    if basename.chars().any(is_forbidden) {
        return Err(PathError::InvalidFilename {
            sanitized: sanitize_filename(&basename),
        });
    }
    Ok(basename)
}

pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|ch| if is_forbidden(ch) { '_' } else { ch })
        .collect()
}

/// Relative form (`/a/b.jpg`) of a path under `base`.
pub fn relative_to(base: &Path, path: &Path) -> Option<String> {
    let stripped = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = stripped
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(format!("/{}", parts.join("/")))
}
