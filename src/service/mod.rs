pub mod auto_create;
pub mod classifier;
pub mod export;
pub mod matcher;
pub mod normalizer;
pub mod reconciler;
pub mod state_machine;

pub use auto_create::{AutoCreateCache, CatalogAutoCreator, RandomSkuGenerator, SkuGenerator};
pub use classifier::{AttributeClassifier, ClassifierInput};
pub use matcher::{CascadeOutcome, MatchEngine, MatchStrategy, StageHit, StageVerdict};
pub use normalizer::TextNormalizer;
pub use reconciler::ReconciliationService;
pub use state_machine::ReconciliationStateMachine;
