//! Installation-scoped runtime namespace.
//!
//! Two installations of the service on one machine must not see each other's
//! shells, so the runtime directory is keyed by a stable fingerprint of the
//! installation root and guarded by a local secret file.

use rand::RngCore;
use sha2::Digest;
use sha2::Sha256;
use std::io;
use std::path::Path;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

pub const SECRET_ENV_VAR: &str = "FRAMEWORK_SHELLS_SECRET";
const RUNTIMES_SUBDIR: &str = "framework_shells/runtimes";
const SECRET_FILENAME: &str = "secret";

#[derive(Debug, Clone)]
pub struct RuntimeDir {
    pub root: PathBuf,
    pub fingerprint: String,
    pub secret: String,
}

/// Stable hash of the installation root; 16 hex chars is plenty to keep
/// installations apart while staying readable in paths.
pub fn installation_fingerprint(install_root: &Path) -> String {
    let digest = Sha256::digest(install_root.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Resolve (and create on first use) the runtime directory for this
/// installation. The secret comes from `FRAMEWORK_SHELLS_SECRET` when set,
/// else from the `secret` file, which is created with random contents and
/// owner-only permissions the first time.
pub fn resolve_runtime_dir(cache_root: &Path, install_root: &Path) -> io::Result<RuntimeDir> {
    let fingerprint = installation_fingerprint(install_root);
    let root = cache_root.join(RUNTIMES_SUBDIR).join(&fingerprint);
    std::fs::create_dir_all(&root)?;

    let secret = match std::env::var(SECRET_ENV_VAR) {
        Ok(value) if !value.is_empty() => value,
        _ => load_or_create_secret(&root.join(SECRET_FILENAME))?,
    };

    Ok(RuntimeDir {
        root,
        fingerprint,
        secret,
    })
}

fn load_or_create_secret(path: &Path) -> io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(existing) if !existing.trim().is_empty() => Ok(existing.trim().to_string()),
        Ok(_) | Err(_) => {
            let mut bytes = [0u8; 32];
            rand::rng().fill_bytes(&mut bytes);
            let secret: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                options.mode(0o600);
            }
            let mut file = options.open(path)?;
            io::Write::write_all(&mut file, secret.as_bytes())?;
            Ok(secret)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = installation_fingerprint(Path::new("/opt/fws"));
        let b = installation_fingerprint(Path::new("/opt/fws"));
        let c = installation_fingerprint(Path::new("/opt/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn secret_file_is_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        let first = load_or_create_secret(&path).unwrap();
        let second = load_or_create_secret(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
