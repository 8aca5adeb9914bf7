use crate::chunking::StrategyKind;
use crate::error::Result;
use crate::models::{Chunk, ChunkParams, Document};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    document_id: String,
    strategy: String,
    params: ChunkParams,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    content_hash: String,
    chunks: Arc<[Chunk]>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    document_id: String,
    strategy: String,
    params: ChunkParams,
    content_hash: String,
    chunks: Vec<Chunk>,
}

// Entries keep the content hash they were built from; a changed document
// rebuilds its entry. Racing misses on one key only repeat the work.
#[derive(Debug, Default)]
pub struct ChunkRouter {
    cache: DashMap<CacheKey, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ChunkRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_chunks(
        &self,
        document: &Document,
        strategy_name: &str,
        params: &ChunkParams,
    ) -> Result<Arc<[Chunk]>> {
        let kind = StrategyKind::from_name(strategy_name)?;
        let key = CacheKey {
            document_id: document.id.clone(),
            strategy: kind.name().to_string(),
            params: kind.normalize(*params),
        };

        if let Some(entry) = self.cache.get(&key) {
            if entry.content_hash == document.content_hash {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&entry.chunks));
            }
            debug!(document = %document.id, strategy = %kind, "document changed, rebuilding chunks");
        }

        let chunks: Arc<[Chunk]> = kind.chunk(document, params)?.into();
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(
            key,
            CacheEntry {
                content_hash: document.content_hash.clone(),
                chunks: Arc::clone(&chunks),
            },
        );
        Ok(chunks)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let entries: Vec<PersistedEntry> = self
            .cache
            .iter()
            .map(|item| PersistedEntry {
                document_id: item.key().document_id.clone(),
                strategy: item.key().strategy.clone(),
                params: item.key().params,
                content_hash: item.value().content_hash.clone(),
                chunks: item.value().chunks.to_vec(),
            })
            .collect();
        fs::write(path, serde_json::to_vec(&entries)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let entries: Vec<PersistedEntry> = serde_json::from_slice(&fs::read(path)?)?;
        let router = Self::new();
        for entry in entries {
            router.cache.insert(
                CacheKey {
                    document_id: entry.document_id,
                    strategy: entry.strategy,
                    params: entry.params,
                },
                CacheEntry {
                    content_hash: entry.content_hash,
                    chunks: entry.chunks.into(),
                },
            );
        }
        Ok(router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SweepError;
    use crate::models::DocumentMetadata;
    use tempfile::tempdir;

    fn document(text: &str) -> Document {
        Document::new(
            "doc-1",
            text,
            DocumentMetadata {
                origin: "/tmp/doc-1.md".to_string(),
                format: "md".to_string(),
                extracted_at: chrono::Utc::now(),
            },
        )
    }

    #[test]
    fn repeated_requests_hit_the_cache() -> Result<()> {
        let router = ChunkRouter::new();
        let doc = document("a b c d e f g");
        let first = router.get_chunks(&doc, "fixed_token", &ChunkParams::fixed(3))?;
        let second = router.get_chunks(&doc, "fixed_token", &ChunkParams::fixed(3))?;
        assert_eq!(first, second);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!((router.hits(), router.misses()), (1, 1));
        Ok(())
    }

    #[test]
    fn ignored_params_share_an_entry() -> Result<()> {
        let router = ChunkRouter::new();
        let doc = document("a b c d e f g");
        router.get_chunks(&doc, "fixed_token", &ChunkParams::sliding(3, 1))?;
        router.get_chunks(&doc, "fixed_token", &ChunkParams::fixed(3))?;
        assert_eq!(router.len(), 1);
        assert_eq!(router.hits(), 1);
        Ok(())
    }

    #[test]
    fn changed_content_is_never_served_stale() -> Result<()> {
        let router = ChunkRouter::new();
        let original = router.get_chunks(&document("a b c"), "fixed_token", &ChunkParams::fixed(2))?;
        let edited = router.get_chunks(&document("x y z w"), "fixed_token", &ChunkParams::fixed(2))?;
        assert_eq!(original[0].text, "a b");
        assert_eq!(edited[0].text, "x y");
        assert_eq!(router.misses(), 2);
        assert_eq!(router.len(), 1);
        Ok(())
    }

    #[test]
    fn concurrent_callers_on_one_key_agree() -> Result<()> {
        let router = ChunkRouter::new();
        let doc = document("Pumps lose pressure. Filters clog over time. Replace them early.");
        let params = ChunkParams::sliding(4, 1);

        let results: Vec<Result<Vec<Arc<[Chunk]>>>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        (0..25)
                            .map(|_| router.get_chunks(&doc, "sliding_window", &params))
                            .collect::<Result<Vec<_>>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker
                        .join()
                        .unwrap_or_else(|_| Err(SweepError::InvalidArgument("worker panicked".into())))
                })
                .collect()
        });

        let expected = StrategyKind::SlidingWindow.chunk(&doc, &params)?;
        for served in results {
            for chunks in served? {
                assert_eq!(&chunks[..], &expected[..]);
            }
        }
        assert_eq!(router.len(), 1);
        assert_eq!(router.hits() + router.misses(), 200);
        assert!(router.misses() >= 1);
        Ok(())
    }

    #[test]
    fn unknown_strategy_is_reported() {
        let router = ChunkRouter::new();
        let result = router.get_chunks(&document("a"), "semantic", &ChunkParams::fixed(2));
        assert!(matches!(result, Err(SweepError::UnknownStrategy(_))));
        assert!(router.is_empty());
    }

    #[test]
    fn cache_survives_a_round_trip_to_disk() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("chunks.json");
        let doc = document("one two three. four five.");

        let router = ChunkRouter::new();
        let built = router.get_chunks(&doc, "sentence_aware", &ChunkParams::sentences(3))?;
        router.save(&path)?;

        let restored = ChunkRouter::load(&path)?;
        let served = restored.get_chunks(&doc, "sentence_aware", &ChunkParams::sentences(3))?;
        assert_eq!(built, served);
        assert_eq!((restored.hits(), restored.misses()), (1, 0));
        Ok(())
    }
}
