//! On-disk key material: long-term keypair, current group, current share
//! and the in-flight DKG snapshot.
//!
//! Layout under the node base directory:
//!
//! ```text
//! keys/node.json    long-term keypair            (0600)
//! keys/share.json   current share of the group key (0600)
//! groups/group.json current group descriptor
//! dkg/state.bin     in-flight DKG session snapshot, removed on completion
//! ```
//!
//! Writes go through a temp file plus rename. `save_group_and_share`
//! renames the share first and embeds the group fingerprint in the share
//! record, so a crash between the two renames is detected at load time
//! instead of silently mixing generations.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use rusty_beacon_crypto::{decode_scalar, KeyPair, PublicPoly, Share};
use rusty_beacon_types::Group;

use crate::StoreError;

const NODE_KEY_FILE: &str = "keys/node.json";
const SHARE_FILE: &str = "keys/share.json";
const GROUP_FILE: &str = "groups/group.json";
const DKG_STATE_FILE: &str = "dkg/state.bin";

#[derive(Serialize, Deserialize)]
struct NodeKeyRecord {
    secret: String,
    public: String,
}

#[derive(Serialize, Deserialize)]
struct ShareRecord {
    index: u32,
    secret: String,
    commits: Vec<String>,
    /// Fingerprint of the group this share belongs to.
    group: String,
}

/// File-backed key store. Reads are safe under concurrent readers; all
/// writes come from the orchestrator, one at a time.
pub struct FileKeyStore {
    base: PathBuf,
}

impl FileKeyStore {
    /// Open the store rooted at `base`, creating the directory skeleton.
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self, StoreError> {
        let base = base.as_ref().to_path_buf();
        for sub in ["keys", "groups", "dkg"] {
            fs::create_dir_all(base.join(sub))?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(base.join("keys"), fs::Permissions::from_mode(0o700))?;
        }
        Ok(FileKeyStore { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.base.join(rel)
    }

    /// Atomic file replacement: temp file in the same directory, fsync,
    /// rename over the target.
    fn write_atomic(&self, rel: &str, bytes: &[u8], private: bool) -> Result<(), StoreError> {
        let target = self.path(rel);
        let tmp = target.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        #[cfg(unix)]
        if private {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        #[cfg(not(unix))]
        let _ = private;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub fn save_keypair(&self, keypair: &KeyPair) -> Result<(), StoreError> {
        let record = NodeKeyRecord {
            secret: hex::encode(keypair.to_bytes()),
            public: hex::encode(keypair.public_bytes()),
        };
        self.write_atomic(NODE_KEY_FILE, &serde_json::to_vec_pretty(&record)?, true)
    }

    pub fn load_keypair(&self) -> Result<KeyPair, StoreError> {
        let bytes = fs::read(self.path(NODE_KEY_FILE))?;
        let record: NodeKeyRecord = serde_json::from_slice(&bytes)?;
        let secret =
            hex::decode(&record.secret).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let keypair = KeyPair::from_bytes(&secret)
            .map_err(|e| StoreError::Corrupt(format!("node key: {e}")))?;
        if hex::encode(keypair.public_bytes()) != record.public {
            return Err(StoreError::Corrupt(
                "node key public part does not match secret".to_string(),
            ));
        }
        Ok(keypair)
    }

    pub fn has_keypair(&self) -> bool {
        self.path(NODE_KEY_FILE).exists()
    }

    pub fn load_group(&self) -> Result<Group, StoreError> {
        let bytes = fs::read(self.path(GROUP_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn has_group(&self) -> bool {
        self.path(GROUP_FILE).exists()
    }

    /// Load the current share and check it belongs to `group`.
    pub fn load_share(&self, group: &Group) -> Result<Share, StoreError> {
        let bytes = fs::read(self.path(SHARE_FILE))?;
        let record: ShareRecord = serde_json::from_slice(&bytes)?;

        let fingerprint = group.fingerprint()?;
        if record.group != hex::encode(fingerprint) {
            return Err(StoreError::Mismatch(format!(
                "share was dealt for group {}, current group is {}",
                &record.group[..16],
                hex::encode(&fingerprint[..8]),
            )));
        }

        let secret =
            hex::decode(&record.secret).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let commits = record
            .commits
            .iter()
            .map(|c| hex::decode(c).map_err(|e| StoreError::Corrupt(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let share = Share {
            index: record.index,
            private: decode_scalar(&secret)
                .map_err(|e| StoreError::Corrupt(format!("share scalar: {e}")))?,
            public: PublicPoly::from_bytes(&commits)
                .map_err(|e| StoreError::Corrupt(format!("share commits: {e}")))?,
        };
        share
            .validate()
            .map_err(|e| StoreError::Corrupt(format!("share inconsistent: {e}")))?;
        Ok(share)
    }

    /// Persist a new group and the share dealt for it: both or neither.
    pub fn save_group_and_share(&self, group: &Group, share: &Share) -> Result<(), StoreError> {
        let record = ShareRecord {
            index: share.index,
            secret: hex::encode(share.private.to_bytes()),
            commits: share.public.to_bytes().iter().map(hex::encode).collect(),
            group: hex::encode(group.fingerprint()?),
        };
        // share first: a crash here leaves the old group with a share
        // fingerprinted for the new one, which load_share reports as a
        // mismatch instead of using either half
        self.write_atomic(SHARE_FILE, &serde_json::to_vec_pretty(&record)?, true)?;
        self.write_atomic(GROUP_FILE, &serde_json::to_vec_pretty(group)?, false)?;
        debug!("persisted group and share (index {})", share.index);
        Ok(())
    }

    /// Snapshot of an in-flight DKG session, opaque to the store.
    pub fn save_dkg_state(&self, bytes: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(DKG_STATE_FILE, bytes, true)
    }

    pub fn load_dkg_state(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path(DKG_STATE_FILE)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear_dkg_state(&self) -> Result<(), StoreError> {
        match fs::remove_file(self.path(DKG_STATE_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("could not clear dkg state: {e}");
                Err(e.into())
            }
        }
    }
}
