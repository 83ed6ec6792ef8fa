//! SSH key management for the node.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use log::info;
use russh_keys::{Algorithm, HashAlg, PrivateKey};

/// Load an OpenSSH private key from `path`, generating and saving an Ed25519
/// key when the file does not exist.
pub fn load_or_generate_key(path: &Path) -> anyhow::Result<PrivateKey> {
    let key = if path.exists() {
        info!("Loading key from {}...", path.display());
        let key_data = fs::read_to_string(path)?;
        PrivateKey::from_openssh(&key_data)?
    } else {
        info!("Generating new Ed25519 key for {}...", path.display());
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let key_data = key.to_openssh(russh_keys::ssh_key::LineEnding::LF)?;
        write_private_key(path, key_data.as_bytes())?;
        info!("Key saved to {}", path.display());
        key
    };

    info!(
        "Key fingerprint: {}",
        key.public_key().fingerprint(HashAlg::Sha256)
    );
    Ok(key)
}

/// Write key material readable by the owner only.
fn write_private_key(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}
