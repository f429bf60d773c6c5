// Heuristic scoring: feature extraction, the logistic model, and the
// online learning side path.

pub mod features;
pub mod model;
pub mod trainer;

pub use features::FeatureExtractor;
pub use model::{HeuristicModel, Inference, FEATURE_SIG_TYPE};
pub use trainer::{LearningQueue, Observation, Trainer};
