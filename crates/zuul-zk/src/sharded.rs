//! Transparent splitting of oversized values into ordered sequence-numbered
//! children (spec §4.A). A node's single-value byte cap is the store's
//! ~1 MiB limit minus headroom for the envelope; anything under that is
//! written directly so the common case pays no extra round trips.

use crate::client::CoordinationClient;
use crate::error::ZkError;

const SHARD_THRESHOLD: usize = 1024 * 1024 - 16 * 1024;
const SHARD_CHUNK_SIZE: usize = 900 * 1024;

/// Writes `data` at `path`, sharding into `{path}/0000000000`, `.../...0001`,
/// ... children when it exceeds [`SHARD_THRESHOLD`]. The parent node itself
/// is left empty as a marker; [`read`] uses an empty parent with children as
/// the signal to reassemble rather than return the (empty) parent body.
pub async fn write(client: &dyn CoordinationClient, path: &str, data: &[u8]) -> Result<(), ZkError> {
    let existing_children = client.children(path).await.unwrap_or_default();
    for name in existing_children {
        let _ = client.delete(&format!("{path}/{name}"), -1, false).await;
    }

    if data.len() <= SHARD_THRESHOLD {
        write_whole(client, path, data).await?;
        return Ok(());
    }

    write_whole(client, path, b"").await?;
    for (i, chunk) in data.chunks(SHARD_CHUNK_SIZE).enumerate() {
        let child = format!("{path}/{i:010}");
        client.create(&child, chunk, false, false).await?;
    }
    Ok(())
}

async fn write_whole(client: &dyn CoordinationClient, path: &str, data: &[u8]) -> Result<(), ZkError> {
    match client.exists(path).await? {
        Some(stat) => {
            client.set(path, data, stat.version).await?;
        }
        None => {
            client.create(path, data, false, false).await?;
        }
    }
    Ok(())
}

/// Reassembles a value written by [`write`]: concatenates children in
/// sorted-name order if any exist, otherwise returns the parent's own data.
pub async fn read(client: &dyn CoordinationClient, path: &str) -> Result<Vec<u8>, ZkError> {
    let mut names = client.children(path).await.unwrap_or_default();
    if names.is_empty() {
        return Ok(client.get(path).await?.0);
    }
    names.sort();

    let mut out = Vec::new();
    for name in names {
        let (chunk, _) = client.get(&format!("{path}/{name}")).await?;
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}
