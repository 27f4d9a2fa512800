//! On-disk identity store.
//!
//! `load_or_create(data_dir)` returns the persistent [`AgentId`] and static
//! X25519 keypair, generating both on first start. Files are written with
//! owner-only permissions and a world-readable key refuses to load.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rand::RngCore;
use trellis_proto::AgentId;
use x25519_dalek::{PublicKey, StaticSecret};

const ID_FILE: &str = "agent_id";
const KEY_FILE: &str = "static_x25519.key";

pub struct Identity {
    pub agent_id: AgentId,
    pub static_secret: StaticSecret,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.static_secret)
    }

    /// Load the persisted identity from `data_dir`, creating one on first
    /// start.
    pub fn load_or_create(data_dir: impl AsRef<Path>) -> io::Result<Identity> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;

        let id_path = dir.join(ID_FILE);
        let key_path = dir.join(KEY_FILE);

        let agent_id = match fs::read_to_string(&id_path) {
            Ok(text) => text
                .parse::<AgentId>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut bytes = [0u8; 16];
                OsRng.fill_bytes(&mut bytes);
                let id = AgentId::from_bytes(bytes);
                write_private(&id_path, format!("{}\n", id).as_bytes())?;
                id
            }
            Err(e) => return Err(e),
        };

        let static_secret = match fs::read(&key_path) {
            Ok(raw) => {
                check_private(&key_path)?;
                let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "static key must be 32 bytes")
                })?;
                StaticSecret::from(bytes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let secret = StaticSecret::random_from_rng(OsRng);
                write_private(&key_path, secret.as_bytes())?;
                secret
            }
            Err(e) => return Err(e),
        };

        Ok(Identity { agent_id, static_secret })
    }
}

fn write_private(path: &PathBuf, contents: &[u8]) -> io::Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn check_private(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)?.permissions().mode();
        if mode & 0o044 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is group/world readable; refusing to use it", path.display()),
            ));
        }
    }
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("trellis-id-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn creates_then_reloads_same_identity() {
        let dir = tmp_dir("reload");
        let first = Identity::load_or_create(&dir).unwrap();
        let second = Identity::load_or_create(&dir).unwrap();
        assert_eq!(first.agent_id, second.agent_id);
        assert_eq!(
            first.static_secret.to_bytes(),
            second.static_secret.to_bytes()
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_corrupt_id_file() {
        let dir = tmp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(ID_FILE), "not-hex").unwrap();
        assert!(Identity::load_or_create(&dir).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn rejects_world_readable_key() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tmp_dir("perms");
        let id = Identity::load_or_create(&dir).unwrap();
        let key_path = dir.join(KEY_FILE);
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o644)).unwrap();
        let err = Identity::load_or_create(&dir).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let _ = id;
        fs::remove_dir_all(&dir).unwrap();
    }
}
