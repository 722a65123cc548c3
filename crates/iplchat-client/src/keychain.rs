//! Password-protected store of per-peer symmetric keys.
//!
//! On-disk layout for owner U, file `<owner_uuid>.keychain`:
//! `salt(32) ‖ AEAD_{KDF(password, salt)}(u32 count ‖ (u32 len ‖ peer_uuid ‖
//! u32 len ‖ key)*)`. A wrong password is reported as `false` from
//! [`Keychain::load`], never as corrupted state; the in-memory store stays
//! empty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use iplchat_shared::constants::{KEYCHAIN_SALT_SIZE, SYMMETRIC_KEY_SIZE, UUID_TEXT_LEN};
use iplchat_shared::crypto::{self, SymmetricKey};
use iplchat_shared::error::ProtocolError;
use iplchat_shared::types::UserId;

use crate::error::{ClientError, Result};

pub struct Keychain {
    path: PathBuf,
    salt: Vec<u8>,
    key: Option<SymmetricKey>,
    entries: HashMap<UserId, SymmetricKey>,
}

impl Keychain {
    /// A keychain for `owner`, stored under `dir`. Nothing touches the disk
    /// until [`load`](Self::load).
    pub fn new(dir: &Path, owner: UserId) -> Self {
        Self {
            path: dir.join(format!("{owner}.keychain")),
            salt: Vec::new(),
            key: None,
            entries: HashMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock the store. An absent file initializes a fresh salt and an
    /// empty store and returns `true`. A present file is decrypted under
    /// the derived key; a failure returns `false` and leaves the store
    /// empty and locked.
    pub fn load(&mut self, password: &str) -> Result<bool> {
        self.entries.clear();
        self.key = None;

        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.salt = crypto::random_bytes(KEYCHAIN_SALT_SIZE);
                self.key = Some(crypto::derive_key(password.as_bytes(), &self.salt)?);
                debug!(path = %self.path.display(), "initialized empty keychain");
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };

        if raw.len() < KEYCHAIN_SALT_SIZE {
            return Ok(false);
        }
        let (salt, body) = raw.split_at(KEYCHAIN_SALT_SIZE);
        let key = crypto::derive_key(password.as_bytes(), salt)?;

        let plaintext = match crypto::decrypt(&key, body) {
            Ok(plaintext) => plaintext,
            Err(_) => return Ok(false),
        };
        let entries = match decode_entries(&plaintext) {
            Ok(entries) => entries,
            Err(_) => return Ok(false),
        };

        self.salt = salt.to_vec();
        self.key = Some(key);
        self.entries = entries;
        debug!(
            path = %self.path.display(),
            peers = self.entries.len(),
            "keychain unlocked"
        );
        Ok(true)
    }

    pub fn add(&mut self, peer: UserId, key: SymmetricKey) {
        self.entries.insert(peer, key);
    }

    pub fn get(&self, peer: &UserId) -> Option<&SymmetricKey> {
        self.entries.get(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encrypt and write the store. Requires a prior successful `load`.
    pub fn save(&self) -> Result<()> {
        let key = self.key.as_ref().ok_or(ClientError::KeychainLocked)?;

        let body = crypto::encrypt(key, &encode_entries(&self.entries))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut raw = Vec::with_capacity(self.salt.len() + body.len());
        raw.extend_from_slice(&self.salt);
        raw.extend_from_slice(&body);
        std::fs::write(&self.path, raw)?;
        debug!(path = %self.path.display(), peers = self.entries.len(), "keychain saved");
        Ok(())
    }
}

fn encode_entries(entries: &HashMap<UserId, SymmetricKey>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (peer, key) in entries {
        let uuid = peer.to_string();
        out.extend_from_slice(&(uuid.len() as u32).to_le_bytes());
        out.extend_from_slice(uuid.as_bytes());
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key);
    }
    out
}

fn decode_entries(payload: &[u8]) -> Result<HashMap<UserId, SymmetricKey>> {
    let mut pos = 0usize;
    let count = read_u32(payload, &mut pos)?;

    let mut entries = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let ulen = read_u32(payload, &mut pos)? as usize;
        if ulen != UUID_TEXT_LEN {
            return Err(ProtocolError::MalformedPayload("keychain uuid length").into());
        }
        let peer = UserId::from_wire(read_bytes(payload, &mut pos, ulen)?)?;

        let klen = read_u32(payload, &mut pos)? as usize;
        if klen != SYMMETRIC_KEY_SIZE {
            return Err(ProtocolError::MalformedPayload("keychain key length").into());
        }
        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        key.copy_from_slice(read_bytes(payload, &mut pos, klen)?);

        entries.insert(peer, key);
    }

    if pos != payload.len() {
        return Err(ProtocolError::MalformedPayload("trailing keychain bytes").into());
    }
    Ok(entries)
}

fn read_u32(payload: &[u8], pos: &mut usize) -> Result<u32> {
    let end = *pos + 4;
    if end > payload.len() {
        return Err(ProtocolError::MalformedPayload("truncated keychain").into());
    }
    let value = u32::from_le_bytes(payload[*pos..end].try_into().unwrap());
    *pos = end;
    Ok(value)
}

fn read_bytes<'a>(payload: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= payload.len())
        .ok_or(ProtocolError::MalformedPayload("truncated keychain"))?;
    let bytes = &payload[*pos..end];
    *pos = end;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_keychain_initializes_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut keychain = Keychain::new(dir.path(), UserId::new());
        assert!(keychain.load("hunter2").unwrap());
        assert!(keychain.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let owner = UserId::new();

        let peer_a = UserId::new();
        let peer_b = UserId::new();
        let key_a = crypto::generate_symmetric_key();
        let key_b = crypto::generate_symmetric_key();

        let mut keychain = Keychain::new(dir.path(), owner);
        assert!(keychain.load("hunter2").unwrap());
        keychain.add(peer_a, key_a);
        keychain.add(peer_b, key_b);
        keychain.save().unwrap();

        let mut reloaded = Keychain::new(dir.path(), owner);
        assert!(reloaded.load("hunter2").unwrap());
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get(&peer_a), Some(&key_a));
        assert_eq!(reloaded.get(&peer_b), Some(&key_b));
    }

    #[test]
    fn test_wrong_password_fails_and_leaves_store_empty() {
        let dir = tempfile::tempdir().unwrap();
        let owner = UserId::new();

        let mut keychain = Keychain::new(dir.path(), owner);
        keychain.load("correct").unwrap();
        keychain.add(UserId::new(), crypto::generate_symmetric_key());
        keychain.save().unwrap();

        let mut reloaded = Keychain::new(dir.path(), owner);
        assert!(!reloaded.load("wrong").unwrap());
        assert!(reloaded.is_empty());
        // And saving while locked is refused rather than clobbering.
        assert!(reloaded.save().is_err());
    }

    #[test]
    fn test_truncated_file_reports_failure_not_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let owner = UserId::new();

        let mut keychain = Keychain::new(dir.path(), owner);
        keychain.load("pw").unwrap();
        keychain.add(UserId::new(), crypto::generate_symmetric_key());
        keychain.save().unwrap();

        let raw = std::fs::read(keychain.path()).unwrap();
        std::fs::write(keychain.path(), &raw[..raw.len() / 2]).unwrap();

        let mut reloaded = Keychain::new(dir.path(), owner);
        assert!(!reloaded.load("pw").unwrap());
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_file_name_is_owner_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let owner = UserId::new();
        let keychain = Keychain::new(dir.path(), owner);
        assert_eq!(
            keychain.path().file_name().unwrap().to_str().unwrap(),
            format!("{owner}.keychain")
        );
    }
}
