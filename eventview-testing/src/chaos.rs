use async_trait::async_trait;
use eventview_types::{
    AggregateType, Backend, ColumnDef, Event, EventQuery, EventSource, ExistingColumn, Index,
    InstanceId, Operation, SourceError, StoreError, TableDefinition, Transaction,
};
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};

/// Probability value for chaos engineering injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

impl Probability {
    fn clamped(probability: f32) -> Self {
        Self::try_new(probability.clamp(0.0, 1.0)).expect("clamped value is always valid")
    }

    fn never() -> Self {
        Self::try_new(0.0).expect("0.0 is valid probability")
    }
}

#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
}

impl ChaosConfig {
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::clamped(probability);
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::never(),
        }
    }
}

struct Injector {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl Injector {
    fn new(config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    fn should_fail(&self) -> bool {
        let probability: f32 = self.config.failure_probability.into();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(f64::from(probability))
    }
}

/// [`EventSource`] wrapper failing reads at random.
pub struct ChaosEventSource<S> {
    source: S,
    injector: Injector,
}

impl<S> ChaosEventSource<S> {
    pub fn new(source: S, config: ChaosConfig) -> Self {
        Self {
            source,
            injector: Injector::new(config),
        }
    }
}

#[async_trait]
impl<S> EventSource for ChaosEventSource<S>
where
    S: EventSource,
{
    async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<Event>, SourceError> {
        if self.injector.should_fail() {
            return Err(SourceError::SourceFailure {
                operation: Operation::FetchEvents,
            });
        }
        self.source.fetch_events(query).await
    }

    async fn instance_ids(
        &self,
        aggregate_types: &[AggregateType],
    ) -> Result<Vec<InstanceId>, SourceError> {
        if self.injector.should_fail() {
            return Err(SourceError::SourceFailure {
                operation: Operation::ListInstances,
            });
        }
        self.source.instance_ids(aggregate_types).await
    }
}

/// [`Backend`] wrapper failing to open transactions at random.
///
/// Schema operations are passed through untouched.
pub struct ChaosBackend<B> {
    backend: B,
    injector: Injector,
}

impl<B> ChaosBackend<B> {
    pub fn new(backend: B, config: ChaosConfig) -> Self {
        Self {
            backend,
            injector: Injector::new(config),
        }
    }
}

#[async_trait]
impl<B> Backend for ChaosBackend<B>
where
    B: Backend,
{
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        if self.injector.should_fail() {
            return Err(StoreError::StoreFailure {
                operation: Operation::BeginTransaction,
            });
        }
        self.backend.begin().await
    }

    async fn inspect_table(&self, table: &str) -> Result<Option<Vec<ExistingColumn>>, StoreError> {
        self.backend.inspect_table(table).await
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<String>, StoreError> {
        self.backend.foreign_keys(table).await
    }

    async fn create_table(&self, table: &TableDefinition) -> Result<(), StoreError> {
        self.backend.create_table(table).await
    }

    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StoreError> {
        self.backend.add_column(table, column).await
    }

    async fn ensure_index(&self, table: &TableDefinition, index: &Index) -> Result<(), StoreError> {
        self.backend.ensure_index(table, index).await
    }
}

pub trait ChaosExt: Sized {
    fn with_chaos(self, config: ChaosConfig) -> ChaosEventSource<Self>;
}

impl<S> ChaosExt for S
where
    S: EventSource,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosEventSource<Self> {
        ChaosEventSource::new(self, config)
    }
}
