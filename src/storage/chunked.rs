// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;

use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{self, Result};

use super::{Area, IsPersistent, Items};

const MANIFEST_MAGIC: &str = "8e5b0c7a-3f2d-4d61-9a8e-2c4b6f1d0e93";

static CHUNK_KEY_PREFIX: Lazy<String> = Lazy::new(|| format!("chunk-{MANIFEST_MAGIC}:"));

// Base64 text of a SHA-256 digest.
const CHUNK_HASH_LENGTH: usize = 44;

// A chunk is stored as a JSON string, which costs two quote characters.
const CHUNK_QUOTE_OVERHEAD: usize = 2;

#[derive(Debug, Deserialize, PartialEq, Serialize)]
struct Manifest {
    magic: String,
    #[serde(rename = "chunkKeys")]
    chunk_keys: Vec<String>,
}

impl Manifest {
    fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value::<Self>(value.clone())
            .ok()
            .filter(|manifest| manifest.magic == MANIFEST_MAGIC)
    }
}

fn chunk_key(chunk: &str) -> String {
    format!(
        "{}{}",
        *CHUNK_KEY_PREFIX,
        base64::encode(Sha256::digest(chunk.as_bytes()))
    )
}

fn is_chunk_key(key: &str) -> bool {
    key.starts_with(CHUNK_KEY_PREFIX.as_str())
}

/// Bytes `c` occupies once written inside a JSON string literal.
fn escaped_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\u{08}' | '\u{0c}' | '\n' | '\r' | '\t' => 2,
        '\u{00}'..='\u{1f}' => 6,
        _ => c.len_utf8(),
    }
}

/// Splits `text` into pieces that each take at most `limit` bytes once
/// escaped as JSON strings. Every piece holds at least one character.
fn split_text(text: &str, limit: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut size = 0;
    for (index, c) in text.char_indices() {
        let len = escaped_len(c);
        if size + len > limit && index > start {
            pieces.push(&text[start..index]);
            start = index;
            size = 0;
        }
        size += len;
    }

    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Wraps an area that limits the size of individual items, splitting values
/// too large to store directly into content-addressed chunks referenced by a
/// manifest.
///
/// Chunks are keyed by the hash of their contents, so identical chunks are
/// stored once no matter how many values use them. Chunk keys never appear
/// in results read back from this area.
pub(crate) struct Chunked {
    area: Box<dyn Area>,
    max_item_bytes: usize,
    max_chunk_size: usize,
    lock: Mutex<()>,
}

impl Chunked {
    pub(crate) fn new(max_item_bytes: usize, area: Box<dyn Area>) -> Result<Self> {
        let max_chunk_size = max_item_bytes
            .checked_sub(CHUNK_KEY_PREFIX.len() + CHUNK_HASH_LENGTH + CHUNK_QUOTE_OVERHEAD)
            .filter(|size| *size > 0)
            .ok_or(error::Storage::Capacity(max_item_bytes))?;

        Ok(Self {
            area,
            max_item_bytes,
            max_chunk_size,
            lock: Mutex::new(()),
        })
    }

    fn can_store(&self, key: &str, serialized: &str) -> bool {
        key.len() + serialized.len() <= self.max_item_bytes
    }

    fn split(&self, key: String, value: serde_json::Value, into: &mut Items) -> Result<()> {
        let serialized = serde_json::to_string(&value)?;
        if self.can_store(&key, &serialized) {
            _ = into.insert(key, value);
            return Ok(());
        }

        let mut chunk_keys = Vec::new();
        for piece in split_text(&serialized, self.max_chunk_size) {
            let chunk = chunk_key(piece);
            _ = into.insert(chunk.clone(), serde_json::Value::String(piece.to_owned()));
            chunk_keys.push(chunk);
        }
        debug!("Storing {:?} as {} chunks", key, chunk_keys.len());

        _ = into.insert(
            key,
            serde_json::to_value(Manifest {
                magic: MANIFEST_MAGIC.to_owned(),
                chunk_keys,
            })?,
        );
        Ok(())
    }

    fn assemble(key: &str, manifest: &Manifest, raw: &Items) -> Result<serde_json::Value> {
        let mut serialized = String::new();
        for chunk in &manifest.chunk_keys {
            match raw.get(chunk) {
                Some(serde_json::Value::String(piece)) => serialized.push_str(piece),
                Some(_) => return Err(error::Storage::MalformedChunk(chunk.clone()).into()),
                None => {
                    return Err(error::Storage::MissingChunk {
                        key: key.to_owned(),
                        chunk: chunk.clone(),
                    }
                    .into())
                }
            }
        }

        Ok(serde_json::from_str(&serialized)?)
    }

    /// Deletes chunks that no manifest references any more.
    async fn collect_garbage(&self) -> Result<()> {
        let raw = self.area.get().await?;
        let referenced: HashSet<String> = raw
            .values()
            .filter_map(Manifest::from_value)
            .flat_map(|manifest| manifest.chunk_keys)
            .collect();

        let dangling: Vec<String> = raw
            .into_keys()
            .filter(|key| is_chunk_key(key) && !referenced.contains(key))
            .collect();

        if dangling.is_empty() {
            return Ok(());
        }
        debug!("Removing {} unreferenced chunks", dangling.len());
        self.area.delete(&dangling).await
    }
}

impl IsPersistent for Chunked {
    fn is_persistent(&self) -> bool {
        self.area.is_persistent()
    }
}

#[async_trait]
impl Area for Chunked {
    async fn set(&self, items: Items) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut stored = Items::new();
        for (key, value) in items {
            self.split(key, value, &mut stored)?;
        }
        self.area.set(stored).await?;

        // Overwritten values may have left their old chunks behind.
        self.collect_garbage().await
    }

    async fn get(&self) -> Result<Items> {
        let _guard = self.lock.lock().await;

        let raw = self.area.get().await?;
        raw.iter()
            .filter(|(key, _)| !is_chunk_key(key))
            .map(|(key, value)| {
                let value = match Manifest::from_value(value) {
                    Some(manifest) => Self::assemble(key, &manifest, &raw)?,
                    None => value.clone(),
                };
                Ok((key.clone(), value))
            })
            .collect()
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let _guard = self.lock.lock().await;

        self.area.delete(keys).await?;
        self.collect_garbage().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::storage::Memory;

    fn chunk_count(items: &Items) -> usize {
        items.keys().filter(|key| is_chunk_key(key)).count()
    }

    fn long_text(len: usize) -> String {
        "abcdefghijklmnopqrstuvwxyz".chars().cycle().take(len).collect()
    }

    #[test]
    fn capacity_must_leave_room_for_data() {
        let overhead = CHUNK_KEY_PREFIX.len() + CHUNK_HASH_LENGTH + CHUNK_QUOTE_OVERHEAD;
        assert!(matches!(
            Chunked::new(overhead, Box::new(Memory::new())),
            Err(error::Error::Storage(error::Storage::Capacity(_)))
        ));
        assert!(Chunked::new(overhead + 1, Box::new(Memory::new())).is_ok());
    }

    #[test]
    fn split_respects_escaping_and_char_boundaries() {
        let text = "ab\"cdé\nf";
        let pieces = split_text(text, 3);
        assert_eq!(pieces.concat(), text);
        for piece in &pieces {
            let escaped = piece.chars().map(escaped_len).sum::<usize>();
            assert!(escaped <= 3 || piece.chars().count() == 1, "{piece:?}");
        }
        assert!(split_text("", 3).is_empty());
    }

    #[tokio::test]
    async fn boundary_between_plain_and_chunked() -> Result<()> {
        let raw = Memory::new();
        let store = Chunked::new(200, Box::new(raw.clone()))?;

        // One byte of key, two quotes, 197 bytes of text: exactly 200.
        let fits = json!(long_text(197));
        store
            .set(Items::from([("k".to_owned(), fits.clone())]))
            .await?;
        let stored = raw.get().await?;
        assert_eq!(stored.get("k"), Some(&fits));
        assert_eq!(chunk_count(&stored), 0);

        let too_big = json!(long_text(198));
        store
            .set(Items::from([("k".to_owned(), too_big.clone())]))
            .await?;
        let stored = raw.get().await?;
        assert_eq!(chunk_count(&stored), 2);
        assert!(stored.get("k").and_then(Manifest::from_value).is_some());
        for (key, value) in stored.iter().filter(|(key, _)| is_chunk_key(key)) {
            assert!(key.len() + serde_json::to_string(value)?.len() <= 200);
        }

        assert_eq!(store.get().await?, Items::from([("k".to_owned(), too_big)]));
        Ok(())
    }

    #[tokio::test]
    async fn large_values_fit_a_quota() -> Result<()> {
        let pem = (0..80)
            .map(|_| long_text(64))
            .collect::<Vec<_>>()
            .join("\n");
        let value = json!({"name": "quoted \"name\"", "pemPrivateKey": pem});

        let store = Chunked::new(1024, Box::new(Memory::with_quota(1024)))?;
        store
            .set(Items::from([
                ("big".to_owned(), value.clone()),
                ("small".to_owned(), json!(true)),
            ]))
            .await?;

        let items = store.get().await?;
        assert_eq!(items.len(), 2);
        assert_eq!(items.get("big"), Some(&value));
        assert_eq!(items.get("small"), Some(&json!(true)));
        Ok(())
    }

    #[tokio::test]
    async fn shared_chunks_outlive_one_owner() -> Result<()> {
        let raw = Memory::new();
        let store = Chunked::new(200, Box::new(raw.clone()))?;
        let value = json!(long_text(1000));

        store
            .set(Items::from([
                ("a".to_owned(), value.clone()),
                ("b".to_owned(), value.clone()),
            ]))
            .await?;
        let chunks = chunk_count(&raw.get().await?);
        assert!(chunks > 1);

        store.delete(&["a".to_owned()]).await?;
        assert_eq!(chunk_count(&raw.get().await?), chunks);
        assert_eq!(store.get().await?, Items::from([("b".to_owned(), value)]));

        store.delete(&["b".to_owned()]).await?;
        assert!(raw.get().await?.is_empty());
        Ok(())
    }

    fn manifest_keys(items: &Items, key: &str) -> Vec<String> {
        items
            .get(key)
            .and_then(Manifest::from_value)
            .map(|manifest| manifest.chunk_keys)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn values_sharing_a_prefix_share_its_chunk() -> Result<()> {
        let raw = Memory::new();
        let store = Chunked::new(300, Box::new(raw.clone()))?;

        // Diverge right after the first chunk of `a`, whose leading quote is
        // written escaped.
        let a = long_text(1000);
        let serialized = serde_json::to_string(&json!(a))?;
        let first = split_text(&serialized, store.max_chunk_size)
            .first()
            .map_or(0, |piece| piece.len() - 1);
        let b: String = a
            .chars()
            .take(first)
            .chain(std::iter::repeat('Z'))
            .take(1000)
            .collect();

        store
            .set(Items::from([
                ("a".to_owned(), json!(a)),
                ("b".to_owned(), json!(b)),
            ]))
            .await?;
        let stored = raw.get().await?;
        let a_keys = manifest_keys(&stored, "a");
        let b_keys = manifest_keys(&stored, "b");
        assert!(a_keys.len() > 2);
        assert_eq!(a_keys.first(), b_keys.first());

        let shared: HashSet<&String> = a_keys.iter().filter(|key| b_keys.contains(key)).collect();
        assert_eq!(shared.len(), 1);

        store.delete(&["a".to_owned()]).await?;
        let stored = raw.get().await?;
        for key in &b_keys {
            assert!(stored.contains_key(key));
        }
        for key in a_keys.iter().skip(1) {
            assert!(!stored.contains_key(key));
        }
        assert_eq!(store.get().await?, Items::from([("b".to_owned(), json!(b))]));
        Ok(())
    }

    #[tokio::test]
    async fn overwriting_drops_stale_chunks() -> Result<()> {
        let raw = Memory::new();
        let store = Chunked::new(200, Box::new(raw.clone()))?;

        store
            .set(Items::from([("a".to_owned(), json!(long_text(1000)))]))
            .await?;
        store
            .set(Items::from([("a".to_owned(), json!("small"))]))
            .await?;

        assert_eq!(raw.get().await?, Items::from([("a".to_owned(), json!("small"))]));
        Ok(())
    }

    #[tokio::test]
    async fn missing_chunk_is_an_error() -> Result<()> {
        let raw = Memory::new();
        let store = Chunked::new(200, Box::new(raw.clone()))?;
        store
            .set(Items::from([("a".to_owned(), json!(long_text(500)))]))
            .await?;

        let victim = raw
            .get()
            .await?
            .into_keys()
            .find(|key| is_chunk_key(key));
        raw.delete(&victim.into_iter().collect::<Vec<_>>()).await?;

        assert!(matches!(
            store.get().await,
            Err(error::Error::Storage(error::Storage::MissingChunk { ref key, .. })) if key == "a"
        ));
        Ok(())
    }

    #[test]
    fn manifest_format() {
        use serde_test::{assert_tokens, Token};

        assert_tokens(
            &Manifest {
                magic: MANIFEST_MAGIC.to_owned(),
                chunk_keys: vec!["c1".to_owned()],
            },
            &[
                Token::Struct {
                    name: "Manifest",
                    len: 2,
                },
                Token::Str("magic"),
                Token::Str(MANIFEST_MAGIC),
                Token::Str("chunkKeys"),
                Token::Seq { len: Some(1) },
                Token::Str("c1"),
                Token::SeqEnd,
                Token::StructEnd,
            ],
        );
    }
}
