// =============================================================================
// SATLINK v1.2 - Channel Storage (Sled Database)
// =============================================================================
//
// Persistence for negotiated channels, keyed by channel id. The record is
// written the moment the client's refund is fully signed, before the
// contract is revealed, so a crash at any later point can still reach the
// refund path. Transactions are stored as consensus bytes; the rest of the
// record goes through bincode.
//
// =============================================================================

use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::ChannelError;

use super::{ChannelId, ChannelStore, ChannelVersion};

/// Everything needed to revive a channel at READY after a restart. Used
/// by both sides: a client stores its fully signed refund, a server
/// stores its best accepted signature (and an empty refund field).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredChannel {
    pub version: ChannelVersion,
    /// Contract transaction, consensus bytes.
    pub contract: Vec<u8>,
    /// Fully signed refund transaction, consensus bytes. Empty on the
    /// server side.
    pub refund: Vec<u8>,
    /// Our channel secret key (32 bytes).
    pub my_key: Vec<u8>,
    /// Counterparty channel pubkey (33 bytes, SEC1 compressed).
    pub their_pubkey: Vec<u8>,
    pub channel_value: u64,
    /// Client: remaining value. Server: best accepted value-to-server.
    pub value_to_me: u64,
    pub expiry: u64,
    /// Server side: client signature matching value_to_me.
    pub best_signature: Option<Vec<u8>>,
}

/// Sled-backed channel store. Sled serializes access per key, which is
/// exactly the per-channel-id serialization the protocol requires of its
/// persistence collaborator.
pub struct SledChannelStore {
    db: Db,
    channels: Tree,
}

impl SledChannelStore {
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, ChannelError> {
        let db = sled::open(path)
            .map_err(|e| ChannelError::Storage(format!("failed to open database: {}", e)))?;
        let channels = db
            .open_tree("channels")
            .map_err(|e| ChannelError::Storage(format!("failed to open channels tree: {}", e)))?;
        Ok(SledChannelStore { db, channels })
    }

    /// All persisted channel ids, e.g. for resuming servers at startup.
    pub fn channel_ids(&self) -> Result<Vec<ChannelId>, ChannelError> {
        let mut ids = Vec::new();
        for entry in self.channels.iter() {
            let (key, _) =
                entry.map_err(|e| ChannelError::Storage(format!("iteration error: {}", e)))?;
            if key.len() == 32 {
                let mut id = [0u8; 32];
                id.copy_from_slice(&key);
                ids.push(ChannelId(id));
            }
        }
        Ok(ids)
    }

    pub fn flush(&self) -> Result<(), ChannelError> {
        self.db
            .flush()
            .map_err(|e| ChannelError::Storage(format!("flush error: {}", e)))?;
        Ok(())
    }
}

impl ChannelStore for SledChannelStore {
    fn put(&self, id: &ChannelId, record: &StoredChannel) -> Result<(), ChannelError> {
        let data = bincode::serialize(record)
            .map_err(|e| ChannelError::Storage(format!("serialize error: {}", e)))?;
        self.channels
            .insert(id.0, data)
            .map_err(|e| ChannelError::Storage(format!("insert error: {}", e)))?;
        // A record that only lives in the page cache protects nothing.
        self.flush()
    }

    fn get(&self, id: &ChannelId) -> Result<Option<StoredChannel>, ChannelError> {
        let data = self
            .channels
            .get(id.0)
            .map_err(|e| ChannelError::Storage(format!("get error: {}", e)))?;
        match data {
            Some(bytes) => {
                let record = bincode::deserialize(&bytes)
                    .map_err(|e| ChannelError::Storage(format!("deserialize error: {}", e)))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn remove(&self, id: &ChannelId) -> Result<(), ChannelError> {
        self.channels
            .remove(id.0)
            .map_err(|e| ChannelError::Storage(format!("remove error: {}", e)))?;
        self.flush()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> StoredChannel {
        StoredChannel {
            version: ChannelVersion::V1,
            contract: vec![0x01, 0x00, 0x00, 0x00],
            refund: vec![0x02, 0x00, 0x00, 0x00],
            my_key: vec![0x11; 32],
            their_pubkey: vec![0x02; 33],
            channel_value: 50_000_000,
            value_to_me: 40_000_000,
            expiry: 1_700_086_400,
            best_signature: None,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledChannelStore::open_path(dir.path()).unwrap();
        let id = ChannelId([0xCD; 32]);

        assert_eq!(store.get(&id).unwrap(), None);
        store.put(&id, &sample_record()).unwrap();
        assert_eq!(store.get(&id).unwrap(), Some(sample_record()));

        store.remove(&id).unwrap();
        assert_eq!(store.get(&id).unwrap(), None);
    }

    #[test]
    fn test_overwrite_updates_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledChannelStore::open_path(dir.path()).unwrap();
        let id = ChannelId([0xEE; 32]);

        store.put(&id, &sample_record()).unwrap();
        let mut updated = sample_record();
        updated.value_to_me = 30_000_000;
        updated.best_signature = Some(vec![0x30, 0x44]);
        store.put(&id, &updated).unwrap();

        assert_eq!(store.get(&id).unwrap(), Some(updated));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = ChannelId([0xAB; 32]);
        {
            let store = SledChannelStore::open_path(dir.path()).unwrap();
            store.put(&id, &sample_record()).unwrap();
        }
        let store = SledChannelStore::open_path(dir.path()).unwrap();
        assert_eq!(store.get(&id).unwrap(), Some(sample_record()));
        assert_eq!(store.channel_ids().unwrap(), vec![id]);
    }
}
