use crate::chunking::ChunkStats;
use crate::config::SweepConfig;
use crate::embeddings::{Embedder, EmbedderCatalog, ModelSignatures};
use crate::error::{Result, SweepError, Stage};
use crate::evaluation::EvaluationHarness;
use crate::models::{Chunk, Configuration, Document, EvaluationResult, GoldQuery};
use crate::pareto::{pareto_frontier, recommend};
use crate::router::ChunkRouter;
use crate::traits::{Metadata, VectorRecord, VectorStore};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-configuration state machine. Moves strictly forward; any stage
/// failure jumps to `Failed` with the stage it happened in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConfigState {
    Pending,
    Chunked,
    Embedded,
    Indexed,
    Evaluated,
    Failed { stage: Stage, reason: String },
    Cancelled,
}

impl ConfigState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Evaluated | Self::Failed { .. } | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOutcome {
    pub configuration: Configuration,
    pub state: ConfigState,
    pub result: Option<EvaluationResult>,
    pub within_constraints: bool,
}

impl ConfigOutcome {
    fn pending(configuration: Configuration) -> Self {
        Self {
            configuration,
            state: ConfigState::Pending,
            result: None,
            within_constraints: false,
        }
    }

    fn failed(configuration: Configuration, stage: Stage, error: &SweepError) -> Self {
        Self {
            configuration,
            state: ConfigState::Failed {
                stage,
                reason: error.to_string(),
            },
            result: None,
            within_constraints: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub outcomes: Vec<ConfigOutcome>,
    pub frontier: Vec<EvaluationResult>,
    pub recommended: Option<EvaluationResult>,
    pub cancelled: bool,
}

impl SweepReport {
    pub fn evaluated(&self) -> impl Iterator<Item = &EvaluationResult> {
        self.outcomes.iter().filter_map(|outcome| outcome.result.as_ref())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ConfigOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.state, ConfigState::Failed { .. }))
    }
}

struct Pipeline<S: VectorStore + ?Sized> {
    router: Arc<ChunkRouter>,
    store: Arc<S>,
    embedders: EmbedderCatalog,
    signatures: Arc<ModelSignatures>,
    harness: EvaluationHarness,
    documents: Arc<[Document]>,
    queries: Arc<[GoldQuery]>,
    keep_collections: bool,
    /// Last stage each configuration entered, keyed by grid index.
    reached: DashMap<usize, Stage>,
}

impl<S: VectorStore + ?Sized> Pipeline<S> {
    async fn run(&self, index: usize, configuration: Configuration) -> ConfigOutcome {
        let mut state = ConfigState::Pending;
        debug!(configuration = %configuration, state = ?state, "configuration started");

        self.reached.insert(index, Stage::Chunking);
        let corpus = match self.chunk(&configuration) {
            Ok(corpus) => corpus,
            Err(error) => return self.fail(configuration, Stage::Chunking, &error),
        };
        state = advance(&configuration, state, ConfigState::Chunked);

        self.reached.insert(index, Stage::Embedding);
        let Some(embedder) = self.embedders.get(&configuration.model) else {
            let error = SweepError::Configuration(format!(
                "no embedder registered for model {}",
                configuration.model
            ));
            return self.fail(configuration, Stage::Embedding, &error);
        };
        let records = match self.embed(embedder.as_ref(), &corpus).await {
            Ok(records) => records,
            Err(error) => return self.fail(configuration, Stage::Embedding, &error),
        };
        state = advance(&configuration, state, ConfigState::Embedded);

        let collection = configuration.collection_name();
        self.reached.insert(index, Stage::Indexing);
        let outcome = match self.store.upsert(&collection, &records).await {
            Err(error) => self.fail(configuration, Stage::Indexing, &error),
            Ok(()) => {
                state = advance(&configuration, state, ConfigState::Indexed);
                self.reached.insert(index, Stage::Evaluating);
                match self
                    .harness
                    .evaluate(
                        &self.queries,
                        self.store.as_ref(),
                        embedder.as_ref(),
                        &collection,
                        &corpus,
                    )
                    .await
                {
                    Err(error) => self.fail(configuration, Stage::Evaluating, &error),
                    Ok(metrics) => {
                        advance(&configuration, state, ConfigState::Evaluated);
                        let corpus_cost = embedder.estimate_cost(&corpus);
                        let result = EvaluationResult {
                            cost_per_10k_docs: corpus_cost / self.documents.len().max(1) as f64
                                * 10_000.0,
                            corpus_cost,
                            latency_ms: metrics.mean_latency_ms,
                            indexing_estimate_ms: embedder.estimate_latency(&corpus).as_secs_f64()
                                * 1000.0,
                            chunk_stats: ChunkStats::from_chunks(&corpus),
                            metrics,
                            configuration: configuration.clone(),
                        };
                        ConfigOutcome {
                            configuration,
                            state: ConfigState::Evaluated,
                            result: Some(result),
                            within_constraints: false,
                        }
                    }
                }
            }
        };

        if !self.keep_collections {
            if let Err(error) = self.store.drop_collection(&collection).await {
                warn!(collection = %collection, error = %error, "failed to drop sweep collection");
            }
        }
        outcome
    }

    fn chunk(&self, configuration: &Configuration) -> Result<Vec<Chunk>> {
        let mut corpus = Vec::new();
        for document in self.documents.iter() {
            let chunks =
                self.router
                    .get_chunks(document, &configuration.strategy, &configuration.params)?;
            corpus.extend(chunks.iter().cloned());
        }
        if corpus.is_empty() {
            return Err(SweepError::InvalidArgument(
                "chunking produced no chunks for the corpus".to_string(),
            ));
        }
        Ok(corpus)
    }

    async fn embed(&self, embedder: &dyn Embedder, corpus: &[Chunk]) -> Result<Vec<VectorRecord>> {
        self.signatures.declare(embedder)?;
        let vectors = embedder.embed(corpus).await?;
        self.signatures.check_all(embedder.model(), &vectors)?;

        Ok(corpus
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                let metadata = Metadata::from([
                    ("document_id".to_string(), chunk.document_id.clone()),
                    ("strategy".to_string(), chunk.strategy.clone()),
                    ("model".to_string(), vector.model.clone()),
                ]);
                VectorRecord {
                    id: vector.chunk_id,
                    vector: vector.values,
                    metadata,
                }
            })
            .collect())
    }

    fn fail(&self, configuration: Configuration, stage: Stage, error: &SweepError) -> ConfigOutcome {
        warn!(configuration = %configuration, stage = %stage, error = %error, "configuration failed");
        ConfigOutcome::failed(configuration, stage, error)
    }
}

fn advance(configuration: &Configuration, from: ConfigState, to: ConfigState) -> ConfigState {
    debug!(configuration = %configuration, from = ?from, to = ?to, "configuration advanced");
    to
}

pub struct ConfigTester<S: VectorStore + ?Sized = dyn VectorStore> {
    config: SweepConfig,
    router: Arc<ChunkRouter>,
    store: Arc<S>,
    embedders: EmbedderCatalog,
    signatures: Arc<ModelSignatures>,
}

impl<S: VectorStore + ?Sized + 'static> ConfigTester<S> {
    /// Fails with [`SweepError::Configuration`] when the config is invalid
    /// or names a model the catalogue cannot serve.
    pub fn new(config: SweepConfig, store: Arc<S>, embedders: EmbedderCatalog) -> Result<Self> {
        config.validate()?;
        if let Some(missing) = config
            .space
            .models
            .iter()
            .find(|model| !embedders.contains(model))
        {
            return Err(SweepError::Configuration(format!(
                "no embedder registered for model {missing}"
            )));
        }

        Ok(Self {
            config,
            router: Arc::new(ChunkRouter::new()),
            store,
            embedders,
            signatures: Arc::new(ModelSignatures::new()),
        })
    }

    pub fn with_router(mut self, router: Arc<ChunkRouter>) -> Self {
        self.router = router;
        self
    }

    pub fn router(&self) -> &Arc<ChunkRouter> {
        &self.router
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Evaluate every configuration of the grid. Grid errors abort before
    /// any work; stage failures are recorded against their configuration.
    ///
    /// After `cancel` fires no new configuration starts; in-flight ones
    /// finish and unstarted ones are reported as [`ConfigState::Cancelled`].
    pub async fn run(
        &self,
        documents: &[Document],
        queries: &[GoldQuery],
        cancel: CancellationToken,
    ) -> Result<SweepReport> {
        let configurations = self.config.space.enumerate()?;
        let harness = EvaluationHarness::new(self.config.retrieval_top_k)?
            .with_signatures(Arc::clone(&self.signatures));
        info!(
            configurations = configurations.len(),
            documents = documents.len(),
            queries = queries.len(),
            workers = self.config.max_concurrency,
            "sweep started"
        );

        let pipeline = Arc::new(Pipeline {
            router: Arc::clone(&self.router),
            store: Arc::clone(&self.store),
            embedders: self.embedders.clone(),
            signatures: Arc::clone(&self.signatures),
            harness,
            documents: documents.into(),
            queries: queries.into(),
            keep_collections: self.config.keep_collections,
            reached: DashMap::new(),
        });

        let mut outcomes: Vec<ConfigOutcome> = configurations
            .iter()
            .cloned()
            .map(ConfigOutcome::pending)
            .collect();
        let mut started = vec![false; outcomes.len()];
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks = JoinSet::new();

        for (index, configuration) in configurations.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                info!(remaining = outcomes.len() - index, "sweep cancelled, not starting remaining configurations");
                break;
            };

            started[index] = true;
            let pipeline = Arc::clone(&pipeline);
            tasks.spawn(async move {
                let outcome = pipeline.run(index, configuration).await;
                drop(permit);
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = outcome,
                Err(error) => warn!(error = %error, "configuration task aborted"),
            }
        }

        for (index, (outcome, started)) in outcomes.iter_mut().zip(started).enumerate() {
            if outcome.state.is_terminal() {
                continue;
            }
            outcome.state = if started {
                ConfigState::Failed {
                    stage: pipeline
                        .reached
                        .get(&index)
                        .map_or(Stage::Chunking, |stage| *stage),
                    reason: "configuration task aborted".to_string(),
                }
            } else {
                ConfigState::Cancelled
            };
        }

        let constraints = self.config.constraints;
        for outcome in &mut outcomes {
            outcome.within_constraints = outcome
                .result
                .as_ref()
                .is_some_and(|result| constraints.satisfied_by(result));
        }

        let primary = self.config.primary_metric;
        let survivors: Vec<&EvaluationResult> = outcomes
            .iter()
            .filter(|outcome| outcome.within_constraints)
            .filter_map(|outcome| outcome.result.as_ref())
            .collect();
        let frontier = pareto_frontier(&survivors, primary);
        let recommended = recommend(&frontier, primary).cloned();
        let frontier: Vec<EvaluationResult> = frontier.into_iter().cloned().collect();

        let report = SweepReport {
            cancelled: cancel.is_cancelled(),
            frontier,
            recommended,
            outcomes,
        };
        info!(
            evaluated = report.evaluated().count(),
            failed = report.failed().count(),
            frontier = report.frontier.len(),
            cancelled = report.cancelled,
            chunk_cache_hits = self.router.hits(),
            "sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchSpace;
    use crate::embeddings::{BackendSpec, LocalEmbedder, ModelSpec, SubwordHashModel};
    use crate::metrics::PrimaryMetric;
    use crate::models::DocumentMetadata;
    use crate::pareto::Constraints;
    use crate::stores::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn document(id: &str, text: &str) -> Document {
        Document::new(
            id,
            text,
            DocumentMetadata {
                origin: format!("/corpus/{id}"),
                format: "txt".to_string(),
                extracted_at: Utc::now(),
            },
        )
    }

    fn corpus() -> Vec<Document> {
        vec![
            document(
                "pumps.txt",
                "The hydraulic pump loses pressure when the intake filter clogs. \
                 Replace the filter every 500 hours. Bleed the lines after replacement.",
            ),
            document(
                "belts.txt",
                "Conveyor belt tension is adjusted with the rear idler. \
                 Belt speed is configured on the front control panel.",
            ),
        ]
    }

    fn gold() -> Vec<GoldQuery> {
        vec![
            GoldQuery {
                id: "q1".to_string(),
                question: "When does the hydraulic pump lose pressure?".to_string(),
                relevant_chunk_ids: Vec::new(),
                reference_answer: Some("hydraulic pump loses pressure".to_string()),
                category: Some("maintenance".to_string()),
            },
            GoldQuery {
                id: "q2".to_string(),
                question: "Where is belt speed configured?".to_string(),
                relevant_chunk_ids: Vec::new(),
                reference_answer: Some("belt speed is configured".to_string()),
                category: None,
            },
        ]
    }

    fn local_spec(name: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            backend: BackendSpec::Local { dimensions: 64 },
        }
    }

    fn config(strategies: &[&str], models: &[&str]) -> SweepConfig {
        SweepConfig {
            space: SearchSpace {
                strategies: strategies.iter().map(|name| name.to_string()).collect(),
                chunk_sizes: vec![8, 16],
                overlaps: vec![4],
                sentence_max_tokens: vec![12],
                models: models.iter().map(|name| name.to_string()).collect(),
            },
            models: models.iter().map(|name| local_spec(name)).collect(),
            constraints: Constraints::default(),
            retrieval_top_k: 2,
            primary_metric: PrimaryMetric::Recall,
            max_concurrency: 2,
            keep_collections: false,
        }
    }

    fn local(name: &str) -> Result<Arc<dyn Embedder>> {
        Ok(Arc::new(LocalEmbedder::with_throughput(
            name,
            SubwordHashModel::new(64),
            50_000.0,
        )?))
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Healthy,
        Unavailable,
        /// Corpus batches after the first come back one dimension wider.
        DriftAfterFirstBatch,
        QueryDrift,
        PanicOnQuery,
    }

    struct Scripted {
        name: &'static str,
        behaviour: Behaviour,
        batches: AtomicUsize,
        cancel_on_call: Option<CancellationToken>,
    }

    impl Scripted {
        fn new(name: &'static str, behaviour: Behaviour) -> Self {
            Self {
                name,
                behaviour,
                batches: AtomicUsize::new(0),
                cancel_on_call: None,
            }
        }
    }

    #[async_trait]
    impl Embedder for Scripted {
        fn model(&self) -> &str {
            self.name
        }

        fn dimensions(&self) -> usize {
            4
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if let Some(token) = &self.cancel_on_call {
                token.cancel();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if self.behaviour == Behaviour::Unavailable {
                return Err(SweepError::EmbeddingUnavailable {
                    model: self.name.to_string(),
                    attempts: 3,
                    reason: "rate limited".to_string(),
                });
            }

            let is_corpus = texts.len() > 1;
            if !is_corpus && self.behaviour == Behaviour::PanicOnQuery {
                panic!("query embedding blew up");
            }
            let batch = if is_corpus {
                self.batches.fetch_add(1, Ordering::SeqCst)
            } else {
                0
            };
            let dimensions = match self.behaviour {
                Behaviour::DriftAfterFirstBatch if batch > 0 => 5,
                Behaviour::QueryDrift if !is_corpus => 5,
                _ => 4,
            };
            Ok(texts
                .iter()
                .map(|text| {
                    let mut vector = vec![0.1; dimensions];
                    vector[0] = text.len() as f32;
                    vector
                })
                .collect())
        }

        fn estimate_cost(&self, chunks: &[Chunk]) -> f64 {
            chunks.len() as f64 * 0.001
        }

        fn estimate_latency(&self, _chunks: &[Chunk]) -> Duration {
            Duration::from_millis(5)
        }
    }

    fn catalog(embedders: Vec<Arc<dyn Embedder>>) -> EmbedderCatalog {
        let mut catalog = EmbedderCatalog::new();
        for embedder in embedders {
            catalog.insert(embedder);
        }
        catalog
    }

    #[tokio::test]
    async fn every_configuration_is_evaluated_and_collections_are_dropped() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let tester = ConfigTester::new(
            config(&["fixed_token", "sliding_window", "sentence_aware"], &["hash"]),
            Arc::clone(&store),
            catalog(vec![local("hash")?]),
        )?;

        let report = tester.run(&corpus(), &gold(), CancellationToken::new()).await?;

        assert_eq!(report.outcomes.len(), 5);
        assert!(report
            .outcomes
            .iter()
            .all(|outcome| outcome.state == ConfigState::Evaluated && outcome.within_constraints));
        assert!(!report.frontier.is_empty());
        assert!(report.recommended.is_some());
        assert!(!report.cancelled);
        assert!(store.collection_names().await.is_empty());

        let first = report.outcomes[0].result.as_ref().map(|result| result.metrics.evaluated);
        assert_eq!(first, Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn failures_stay_with_their_configuration() -> Result<()> {
        let mut config = config(&["fixed_token", "semantic_magic"], &["hash", "flaky"]);
        config.space.chunk_sizes = vec![8];
        let tester = ConfigTester::new(
            config,
            Arc::new(MemoryStore::new()),
            catalog(vec![local("hash")?, Arc::new(Scripted::new("flaky", Behaviour::Unavailable))]),
        )?;

        let report = tester.run(&corpus(), &gold(), CancellationToken::new()).await?;

        let states: Vec<_> = report
            .outcomes
            .iter()
            .map(|outcome| match &outcome.state {
                ConfigState::Failed { stage, .. } => format!("failed:{stage}"),
                other => format!("{other:?}"),
            })
            .collect();
        assert_eq!(
            states,
            vec!["Evaluated", "failed:embedding", "failed:chunking", "failed:chunking"]
        );
        assert!(matches!(
            &report.outcomes[2].state,
            ConfigState::Failed { reason, .. } if reason.contains("semantic_magic")
        ));
        assert_eq!(report.frontier.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn dimensionality_drift_fails_the_later_configuration() -> Result<()> {
        let mut config = config(&["fixed_token"], &["drifty"]);
        config.max_concurrency = 1;
        let tester = ConfigTester::new(
            config,
            Arc::new(MemoryStore::new()),
            catalog(vec![Arc::new(Scripted::new("drifty", Behaviour::DriftAfterFirstBatch))]),
        )?;

        let report = tester.run(&corpus(), &gold(), CancellationToken::new()).await?;

        assert_eq!(report.outcomes[0].state, ConfigState::Evaluated);
        assert!(matches!(
            &report.outcomes[1].state,
            ConfigState::Failed { stage: Stage::Embedding, reason } if reason.contains("drifted")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn query_side_drift_fails_while_evaluating() -> Result<()> {
        let mut config = config(&["fixed_token"], &["drifty"]);
        config.space.chunk_sizes = vec![8];
        let tester = ConfigTester::new(
            config,
            Arc::new(MemoryStore::new()),
            catalog(vec![Arc::new(Scripted::new("drifty", Behaviour::QueryDrift))]),
        )?;

        let report = tester.run(&corpus(), &gold(), CancellationToken::new()).await?;

        assert!(matches!(
            &report.outcomes[0].state,
            ConfigState::Failed { stage: Stage::Evaluating, reason } if reason.contains("drifted")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn a_panicking_task_is_charged_to_the_stage_it_reached() -> Result<()> {
        let mut config = config(&["fixed_token"], &["fragile"]);
        config.space.chunk_sizes = vec![8];
        let tester = ConfigTester::new(
            config,
            Arc::new(MemoryStore::new()),
            catalog(vec![Arc::new(Scripted::new("fragile", Behaviour::PanicOnQuery))]),
        )?;

        let report = tester.run(&corpus(), &gold(), CancellationToken::new()).await?;

        assert!(matches!(
            &report.outcomes[0].state,
            ConfigState::Failed { stage: Stage::Evaluating, reason } if reason.contains("aborted")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn constraint_violations_are_kept_but_leave_the_frontier() -> Result<()> {
        let mut config = config(&["fixed_token"], &["hash", "paid"]);
        config.space.chunk_sizes = vec![8];
        config.constraints.max_cost_per_10k_docs = Some(0.0);
        let tester = ConfigTester::new(
            config,
            Arc::new(MemoryStore::new()),
            catalog(vec![local("hash")?, Arc::new(Scripted::new("paid", Behaviour::Healthy))]),
        )?;

        let report = tester.run(&corpus(), &gold(), CancellationToken::new()).await?;

        assert_eq!(report.outcomes[1].state, ConfigState::Evaluated);
        assert!(report.outcomes[0].within_constraints);
        assert!(!report.outcomes[1].within_constraints);
        assert_eq!(report.frontier.len(), 1);
        assert_eq!(report.frontier[0].configuration.model, "hash");
        Ok(())
    }

    #[tokio::test]
    async fn nothing_meeting_constraints_is_a_result_not_an_error() -> Result<()> {
        let mut config = config(&["fixed_token"], &["hash"]);
        config.constraints.max_latency_ms = Some(0.0);
        let tester = ConfigTester::new(
            config,
            Arc::new(MemoryStore::new()),
            catalog(vec![local("hash")?]),
        )?;

        let report = tester.run(&corpus(), &gold(), CancellationToken::new()).await?;

        assert_eq!(report.evaluated().count(), 2);
        assert!(report.frontier.is_empty());
        assert!(report.recommended.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_lets_in_flight_work_finish() -> Result<()> {
        let cancel = CancellationToken::new();
        let mut config = config(&["fixed_token", "sliding_window"], &["slow"]);
        config.max_concurrency = 1;
        let mut slow = Scripted::new("slow", Behaviour::Healthy);
        slow.cancel_on_call = Some(cancel.clone());
        let tester = ConfigTester::new(
            config,
            Arc::new(MemoryStore::new()),
            catalog(vec![Arc::new(slow)]),
        )?;

        let report = tester.run(&corpus(), &gold(), cancel).await?;

        assert!(report.cancelled);
        assert_eq!(report.outcomes[0].state, ConfigState::Evaluated);
        assert!(report.outcomes[1..]
            .iter()
            .all(|outcome| outcome.state == ConfigState::Cancelled));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_models_are_rejected_up_front() {
        let result = ConfigTester::new(
            config(&["fixed_token"], &["hash"]),
            Arc::new(MemoryStore::new()),
            EmbedderCatalog::new(),
        );
        assert!(matches!(result, Err(SweepError::Configuration(_))));
    }
}
