//! Durable per-instance storage: one atomically replaced file per record.

use std::collections::HashMap;
use std::path::Path;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs;

use crate::paxos::peer::Instance;
use crate::paxos::{PaxosValue, Seq};
use crate::utils::SynodError;

/// Writes the record for `seq` to `paxos-<seq>` through a `temp-<seq>` file
/// and a rename, so that a crash mid-write leaves the previous version of
/// the record intact.
pub(crate) async fn save<V: PaxosValue>(
    dir: &Path,
    seq: Seq,
    inst: &Instance<V>,
) -> Result<(), SynodError> {
    let bytes = encode_to_vec(inst)?;
    let tempname = dir.join(format!("temp-{}", seq));
    let fullname = dir.join(format!("paxos-{}", seq));
    fs::write(&tempname, &bytes).await?;
    fs::rename(&tempname, &fullname).await?;
    Ok(())
}

/// Removes the record file for a garbage-collected instance.
pub(crate) async fn remove(dir: &Path, seq: Seq) -> Result<(), SynodError> {
    fs::remove_file(dir.join(format!("paxos-{}", seq))).await?;
    Ok(())
}

/// Loads every `paxos-<seq>` record in `dir`. Leftover `temp-*` files from
/// a crash are skipped; they get overwritten by the next save.
pub(crate) async fn load_all<V: PaxosValue>(
    dir: &Path,
) -> Result<HashMap<Seq, Instance<V>>, SynodError> {
    let mut records = HashMap::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let filename = entry.file_name();
        let Some(filename) = filename.to_str() else {
            continue;
        };
        let Some(digits) = filename.strip_prefix("paxos-") else {
            continue;
        };
        let seq: Seq = digits.parse()?;
        let bytes = fs::read(entry.path()).await?;
        records.insert(seq, decode_from_slice(&bytes)?);
    }
    Ok(records)
}

#[cfg(test)]
mod durability_tests {
    use super::*;
    use crate::paxos::peer::Instance;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn save_load_round_trip() -> Result<(), SynodError> {
        let dir = tempfile::tempdir()?;
        let inst = Instance {
            n_p: 7,
            n_a: 7,
            v_a: Some(String::from("agreed")),
            decided: true,
        };
        save(dir.path(), 3, &inst).await?;
        save(dir.path(), 11, &Instance::<String>::default()).await?;

        let records = load_all::<String>(dir.path()).await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[&3].v_a.as_deref(), Some("agreed"));
        assert!(records[&3].decided);
        assert_eq!(records[&11].n_p, -1);
        assert!(!records[&11].decided);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn overwrite_keeps_latest() -> Result<(), SynodError> {
        let dir = tempfile::tempdir()?;
        let mut inst = Instance {
            n_p: 2,
            n_a: -1,
            v_a: None::<String>,
            decided: false,
        };
        save(dir.path(), 0, &inst).await?;
        inst.n_a = 2;
        inst.v_a = Some("second".into());
        save(dir.path(), 0, &inst).await?;

        let records = load_all::<String>(dir.path()).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[&0].v_a.as_deref(), Some("second"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn stray_temp_files_skipped() -> Result<(), SynodError> {
        let dir = tempfile::tempdir()?;
        save(dir.path(), 4, &Instance::<String>::default()).await?;
        fs::write(dir.path().join("temp-9"), b"half-written").await?;

        let records = load_all::<String>(dir.path()).await?;
        assert_eq!(records.len(), 1);
        assert!(records.contains_key(&4));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn remove_forgets_record() -> Result<(), SynodError> {
        let dir = tempfile::tempdir()?;
        save(dir.path(), 5, &Instance::<String>::default()).await?;
        remove(dir.path(), 5).await?;
        let records = load_all::<String>(dir.path()).await?;
        assert!(records.is_empty());
        Ok(())
    }
}
