use minirag_core::{Fingerprint, IndexBlob};
use tracing::{debug, info, warn};

use crate::error::{RagError, Result};
use crate::store::{DocumentStore, SaveOutcome};

/// Turns raw document bytes into chunks plus a vector index. This is the
/// expensive path (extraction and embedding) that the cache exists to skip.
pub trait DocumentBuilder: Send + Sync {
    type Index: IndexBlob;

    fn build(&self, raw: &[u8]) -> anyhow::Result<(Vec<String>, Self::Index)>;

    /// Whether a cached index is still usable with this builder's settings.
    /// A rejected index is rebuilt and replaced in the store.
    fn accepts(&self, _index: &Self::Index) -> bool {
        true
    }
}

impl<F, I> DocumentBuilder for F
where
    F: Fn(&[u8]) -> anyhow::Result<(Vec<String>, I)> + Send + Sync,
    I: IndexBlob,
{
    type Index = I;

    fn build(&self, raw: &[u8]) -> anyhow::Result<(Vec<String>, I)> {
        self(raw)
    }
}

#[derive(Debug)]
pub struct Processed<I> {
    pub fingerprint: Fingerprint,
    pub chunks: Vec<String>,
    pub index: I,
    pub was_cached: bool,
    /// Set when the result was built but could not be cached. The result
    /// itself is still usable.
    pub cache_warning: Option<String>,
}

pub struct DocumentCache<S> {
    store: S,
}

impl<S: DocumentStore> DocumentCache<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Serves `raw` from the store when its fingerprint is cached and
    /// loadable; otherwise builds it with `builder` and caches the result.
    /// Store failures only ever cost a rebuild, never the call.
    pub fn process<B: DocumentBuilder>(
        &self,
        raw: &[u8],
        builder: &B,
    ) -> Result<Processed<B::Index>> {
        if raw.is_empty() {
            return Err(RagError::EmptyDocument);
        }
        let fingerprint = Fingerprint::of_bytes(raw);

        let exists = match self.store.exists(&fingerprint) {
            Ok(exists) => exists,
            Err(err) => {
                warn!(%fingerprint, error = %format!("{err:#}"), "cache lookup failed; rebuilding");
                false
            }
        };
        let mut stale = false;
        if exists {
            match self.store.load::<B::Index>(&fingerprint) {
                Some((chunks, index)) if builder.accepts(&index) => {
                    debug!(%fingerprint, chunks = chunks.len(), "cache hit");
                    return Ok(Processed {
                        fingerprint,
                        chunks,
                        index,
                        was_cached: true,
                        cache_warning: None,
                    });
                }
                Some(_) => {
                    info!(%fingerprint, "cached index does not match the current builder; rebuilding");
                    stale = true;
                }
                None => info!(%fingerprint, "cached entry unusable; rebuilding"),
            }
        } else {
            debug!(%fingerprint, "cache miss");
        }

        let (chunks, index) = builder.build(raw).map_err(RagError::Build)?;
        let saved = if stale {
            self.store.replace(&fingerprint, &chunks, &index)
        } else {
            self.store.save(&fingerprint, &chunks, &index)
        };
        let cache_warning = match saved {
            Ok(SaveOutcome::Inserted | SaveOutcome::RepairedIndex | SaveOutcome::Replaced) => None,
            Ok(SaveOutcome::AlreadyPresent) => {
                debug!(%fingerprint, "another writer cached this document first");
                None
            }
            Err(err) => {
                let message = format!("document was processed but not cached: {err:#}");
                warn!(%fingerprint, "{message}");
                Some(message)
            }
        };
        Ok(Processed {
            fingerprint,
            chunks,
            index,
            was_cached: false,
            cache_warning,
        })
    }
}
