//! Generate an Ed25519 signing keypair for SGN operators.
//!
//! Writes the secret seed to `<out-dir>/signing.key` (0600 on unix) and
//! prints the public key PEM plus its key id for the trust allow-list.

use anyhow::Result;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sgn_core::sign::{key_id, verifying_key_to_pem};
use std::path::PathBuf;

fn main() -> Result<()> {
    let out_dir = std::env::args().nth(1).unwrap_or_else(|| "data".to_string());
    let mut key_path = PathBuf::from(out_dir);
    std::fs::create_dir_all(&key_path)?;
    key_path.push("signing.key");

    let signing_key = SigningKey::generate(&mut OsRng);
    std::fs::write(&key_path, signing_key.to_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600));
    }

    let verifying_key = signing_key.verifying_key();
    println!("{}", verifying_key_to_pem(&verifying_key)?);
    println!("key_id: {}", key_id(&verifying_key)?);
    Ok(())
}
