pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod evaluation;
pub mod metrics;
pub mod models;
pub mod optimizer;
pub mod pareto;
pub mod report;
pub mod retry;
pub mod router;
pub mod stores;
pub mod tokenize;
pub mod traits;

pub use chunking::{ChunkStats, StrategyKind};
pub use config::{SearchSpace, SweepConfig};
pub use embeddings::{
    BackendSpec, Embedder, EmbedderCatalog, EmbeddingTransport, HttpTransport, LocalEmbedder,
    LocalModel, ModelSignatures, ModelSpec, RemoteEmbedder, RemoteSettings, SubwordHashModel,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{Result, Stage, SweepError};
pub use evaluation::{is_scorable, relevant_chunk_ids, EvaluationHarness};
pub use metrics::{MetricAggregate, PrimaryMetric, QueryMetrics};
pub use models::{
    Chunk, ChunkParams, Configuration, Document, DocumentMetadata, EmbeddingVector,
    EvaluationResult, GoldQuery,
};
pub use optimizer::{ConfigOutcome, ConfigState, ConfigTester, SweepReport};
pub use pareto::{dominates, pareto_frontier, recommend, Constraints};
pub use report::{RunEntry, RunLog, RunStatus};
pub use retry::RetryPolicy;
pub use router::ChunkRouter;
pub use stores::{MemoryStore, QdrantStore};
pub use tokenize::{count_tokens, normalize_whitespace, Tokenizer};
pub use traits::{MetadataFilter, ScoredPoint, VectorRecord, VectorStore};
