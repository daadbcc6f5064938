use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{AeadInPlace, KeyInit, OsRng};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use anyhow::Context;
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-256-GCM with a 16-byte IV, matching the stored `iv:tag:ciphertext` format.
type VaultCipher = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
// Changing the salt invalidates every stored credential.
const KDF_SALT: &[u8] = b"tally-credential-vault-salt-v1";
const SECRET_ENV: &str = "TALLY_SECRET";

/// Derived AES-256 key; zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct VaultKey([u8; 32]);

/// Encrypts credentials before they reach the database.
pub struct Vault {
    key: VaultKey,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").field("key", &"[REDACTED]").finish()
    }
}

impl Vault {
    /// Derive the vault key from process-wide secret material with Argon2id.
    pub fn from_secret(secret: &[u8]) -> anyhow::Result<Self> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(secret, KDF_SALT, &mut key)
            .map_err(|e| anyhow::anyhow!("vault key derivation failed: {e}"))?;
        Ok(Self { key: VaultKey(key) })
    }

    /// Secret from `TALLY_SECRET`, else `~/.tally/secret.key`, generating
    /// and persisting a random one on first use.
    pub fn load_or_create() -> anyhow::Result<Self> {
        if let Ok(raw) = std::env::var(SECRET_ENV) {
            if !raw.trim().is_empty() {
                return Self::from_secret(raw.trim().as_bytes());
            }
        }
        Self::load_or_create_at(&secret_file_path())
    }

    /// Same as [`Vault::load_or_create`] for an explicit secret file, ignoring the environment.
    pub fn load_or_create_at(path: &Path) -> anyhow::Result<Self> {
        if let Some(secret) = load_secret_file(path) {
            return Self::from_secret(&secret);
        }
        let secret = generate_and_save_secret(path)
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "generated vault secret");
        Self::from_secret(&secret)
    }

    /// Returns `iv:tag:ciphertext` (hex). Empty input encrypts to `""`.
    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let cipher = VaultCipher::new(GenericArray::from_slice(&self.key.0));
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| anyhow::anyhow!("credential encryption failed"))?;
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(buffer)
        ))
    }

    /// Fails closed: malformed, tampered or foreign tokens decrypt to `""`.
    pub fn decrypt(&self, token: &str) -> String {
        if token.is_empty() {
            return String::new();
        }
        match self.try_decrypt(token) {
            Some(plaintext) => plaintext,
            None => {
                tracing::warn!("credential could not be decrypted; treating as absent");
                String::new()
            }
        }
    }

    /// Like [`Vault::decrypt`] but zeroizes the plaintext when dropped.
    pub fn decrypt_secret(&self, token: &str) -> Zeroizing<String> {
        Zeroizing::new(self.decrypt(token))
    }

    fn try_decrypt(&self, token: &str) -> Option<String> {
        let mut parts = token.split(':');
        let (iv_hex, tag_hex, ct_hex) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let iv = hex::decode(iv_hex).ok()?;
        let tag = hex::decode(tag_hex).ok()?;
        let mut buffer = hex::decode(ct_hex).ok()?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return None;
        }
        let cipher = VaultCipher::new(GenericArray::from_slice(&self.key.0));
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&iv),
                b"",
                &mut buffer,
                GenericArray::from_slice(&tag),
            )
            .ok()?;
        String::from_utf8(buffer).ok()
    }
}

/// Returns the path to the on-disk secret: `~/.tally/secret.key`
pub fn secret_file_path() -> std::path::PathBuf {
    crate::models::tally_path("secret.key")
}

fn load_secret_file(path: &Path) -> Option<Vec<u8>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let bytes = STANDARD.decode(raw.trim()).ok()?;
    (bytes.len() == 32).then_some(bytes)
}

/// Generate 32 random bytes and save them base64-encoded with mode 600.
fn generate_and_save_secret(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", STANDARD.encode(secret)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(secret.to_vec())
}

/// Fresh key material for `TALLY_SECRET`.
pub fn generate_secret_b64() -> String {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    STANDARD.encode(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        Vault::from_secret(&[42u8; 32]).unwrap()
    }

    /// Replace the hex digit at `idx` with a different digit.
    fn flip_hex(token: &str, idx: usize) -> String {
        let mut chars: Vec<char> = token.chars().collect();
        chars[idx] = if chars[idx] == '0' { '1' } else { '0' };
        chars.into_iter().collect()
    }

    #[test]
    fn round_trip() {
        let vault = test_vault();
        for s in ["hello world", "ghp_abc123", "ünïcødé ✓", "a"] {
            let token = vault.encrypt(s).unwrap();
            assert_eq!(vault.decrypt(&token), s);
        }
    }

    #[test]
    fn empty_string_passes_through() {
        let vault = test_vault();
        assert_eq!(vault.encrypt("").unwrap(), "");
        assert_eq!(vault.decrypt(""), "");
    }

    #[test]
    fn token_format_is_iv_tag_ciphertext_hex() {
        let vault = test_vault();
        let token = vault.encrypt("secret").unwrap();
        let parts: Vec<&str> = token.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), IV_LEN * 2);
        assert_eq!(parts[1].len(), TAG_LEN * 2);
        assert_eq!(parts[2].len(), "secret".len() * 2);
        assert!(parts.iter().all(|p| p.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[test]
    fn fresh_iv_per_call() {
        let vault = test_vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_tag_or_ciphertext_decrypts_to_empty() {
        let vault = test_vault();
        let token = vault.encrypt("top secret value").unwrap();
        let tag_start = IV_LEN * 2 + 1;
        let ct_start = tag_start + TAG_LEN * 2 + 1;
        for idx in (tag_start..tag_start + TAG_LEN * 2).chain(ct_start..token.len()) {
            let tampered = flip_hex(&token, idx);
            assert_eq!(vault.decrypt(&tampered), "", "index {idx} not detected");
        }
    }

    #[test]
    fn wrong_key_decrypts_to_empty() {
        let token = test_vault().encrypt("secret").unwrap();
        let other = Vault::from_secret(&[0u8; 32]).unwrap();
        assert_eq!(other.decrypt(&token), "");
    }

    #[test]
    fn malformed_tokens_decrypt_to_empty() {
        let vault = test_vault();
        for bad in [
            "plaintext",
            "zz:zz:zz",
            "00:00",
            "00112233445566778899aabbccddeeff:00:00",
            "a:b:c:d",
        ] {
            assert_eq!(vault.decrypt(bad), "");
        }
    }

    #[test]
    fn same_secret_derives_same_key() {
        let token = Vault::from_secret(b"shared").unwrap().encrypt("x").unwrap();
        assert_eq!(Vault::from_secret(b"shared").unwrap().decrypt(&token), "x");
    }

    #[test]
    fn short_passwords_still_derive_a_key() {
        let vault = Vault::from_secret(b"pw").unwrap();
        let token = vault.encrypt("x").unwrap();
        assert_eq!(vault.decrypt(&token), "x");
        assert_eq!(Vault::from_secret(b"pw2").unwrap().decrypt(&token), "");
    }

    #[test]
    fn generate_secret_b64_is_32_bytes() {
        let bytes = STANDARD.decode(generate_secret_b64()).unwrap();
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn load_or_create_persists_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".tally").join("secret.key");

        let first = Vault::load_or_create_at(&path).unwrap();
        let token = first.encrypt("persisted").unwrap();
        assert!(path.exists());
        let second = Vault::load_or_create_at(&path).unwrap();
        assert_eq!(second.decrypt(&token), "persisted");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn unreadable_secret_file_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        std::fs::write(&path, "not base64!").unwrap();

        Vault::load_or_create_at(&path).unwrap();
        let saved = std::fs::read_to_string(&path).unwrap();
        assert_eq!(STANDARD.decode(saved.trim()).unwrap().len(), 32);
    }
}
