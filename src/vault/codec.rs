use crate::vault::models::VaultSnapshot;
use crate::vault::ports::VaultCodec;
use anyhow::{anyhow, Context, Result};
use ron::ser::PrettyConfig;

/// RON encoding of the snapshot. Only ever written inside a sealed container.
pub struct RonCodec;

impl VaultCodec for RonCodec {
    fn encode(&self, snapshot: &VaultSnapshot) -> Result<Vec<u8>> {
        let pretty = PrettyConfig::new()
            .depth_limit(4)
            .separate_tuple_members(true);
        let s = ron::ser::to_string_pretty(snapshot, pretty)?;
        Ok(s.into_bytes())
    }

    fn decode(&self, data: &[u8]) -> Result<VaultSnapshot> {
        let s = std::str::from_utf8(data)
            .map_err(|_| anyhow!("vault content not valid UTF-8 RON"))?;
        let snapshot: VaultSnapshot = ron::from_str(s).context("Failed to parse vault content")?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::models::{PasswordEntry, Revision, StoredEntry};
    use uuid::Uuid;

    #[test]
    fn snapshot_survives_encoding_with_sync_state() {
        let id = Uuid::new_v4();
        let mut snapshot = VaultSnapshot::default();
        snapshot.entries.push(StoredEntry {
            id,
            entry: PasswordEntry::new("mail", "jimmy", "supersecret").with_tags(["work"]),
            revision: Revision(3),
            conflict_of: None,
        });
        snapshot.sync.mark_synced(id, Revision(3));
        snapshot.sync.advance_cursor(Revision(3));

        let bytes = RonCodec.encode(&snapshot).unwrap();
        assert_eq!(RonCodec.decode(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn garbage_is_an_error_not_a_panic() {
        assert!(RonCodec.decode(&[0xff, 0xfe, 0x00]).is_err());
        assert!(RonCodec.decode(b"(entries: [").is_err());
    }
}
