use crate::error::{Error, Result};

/// External embedding capability. Implementations wrap a provider client;
/// the engine only calls `embed` in bulk (order-preserving) and, when
/// reranking is requested, `rerank`.
///
/// Provider credentials are the implementation's concern: `credential_env`
/// names the environment variable a caller should populate, and the engine
/// never reads it itself.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts. Returns one vector per input, same order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Rerank `documents` against `query`, returning up to `top_k` indices
    /// into `documents`, best first.
    fn rerank(&self, _query: &str, _documents: &[String], _top_k: usize) -> Result<Vec<usize>> {
        Err(Error::Embedder {
            message: "rerank not supported by this embedder".to_string(),
            retryable: false,
        })
    }

    /// Environment variable holding this provider's credential, if any.
    fn credential_env(&self) -> Option<&'static str> {
        None
    }
}
