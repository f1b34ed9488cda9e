use std::sync::{Arc, Mutex};

use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, info};

use crate::error::{NotEnoughScoresSnafu, Result};
use crate::tensor::ClassifierTensor;

pub mod onnx;

pub use onnx::OnnxModelFactory;

/// Per-class scores of a single classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ScoreVector(Vec<f32>);

impl ScoreVector {
    /// Wrap raw model output; fewer than two classes is an inference failure.
    pub fn new(scores: Vec<f32>) -> Result<Self> {
        ensure!(scores.len() >= 2, NotEnoughScoresSnafu { len: scores.len() });
        Ok(ScoreVector(scores))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the highest score, the lowest index winning ties. NaN never wins.
    pub fn argmax(&self) -> PredictedClass {
        let mut best = 0;
        for (i, &score) in self.0.iter().enumerate().skip(1) {
            if score > self.0[best] || (self.0[best].is_nan() && !score.is_nan()) {
                best = i;
            }
        }
        PredictedClass(best)
    }
}

/// Index of the predicted class. Its meaning is fixed by the trained model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PredictedClass(pub usize);

impl PredictedClass {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for PredictedClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque scoring function: tensor in, one score per class out.
///
/// Implementations must tolerate concurrent calls.
pub trait Scorer: Send + Sync {
    fn score(&self, tensor: &ClassifierTensor) -> Result<ScoreVector>;
}

impl<F> Scorer for F
where
    F: Fn(&ClassifierTensor) -> Result<Vec<f32>> + Send + Sync,
{
    fn score(&self, tensor: &ClassifierTensor) -> Result<ScoreVector> {
        ScoreVector::new(self(tensor)?)
    }
}

/// Loads the scoring resource.
pub trait ScorerFactory: Send + Sync {
    fn load(&self) -> Result<Arc<dyn Scorer>>;
}

/// A scorer that is loaded on first use and reused afterwards.
///
/// Loading happens under a lock, so concurrent first calls load at most once.
/// A failed load is reported to the caller and attempted again on the next call.
pub struct LazyClassifier {
    factory: Box<dyn ScorerFactory>,
    scorer: Mutex<Option<Arc<dyn Scorer>>>,
}

impl LazyClassifier {
    pub fn new<F: ScorerFactory + 'static>(factory: F) -> Self {
        LazyClassifier {
            factory: Box::new(factory),
            scorer: Mutex::new(None),
        }
    }

    /// Wrap an already loaded scorer.
    pub fn with_scorer<S: Scorer + 'static>(scorer: S) -> Self {
        let scorer: Arc<dyn Scorer> = Arc::new(scorer);
        LazyClassifier {
            factory: Box::new(Loaded(scorer.clone())),
            scorer: Mutex::new(Some(scorer)),
        }
    }

    /// Get the scorer, loading it if this is the first use.
    pub fn scorer(&self) -> Result<Arc<dyn Scorer>> {
        let mut slot = self.scorer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(scorer) = slot.as_ref() {
            return Ok(scorer.clone());
        }
        info!("Loading classifier");
        let scorer = self.factory.load()?;
        *slot = Some(scorer.clone());
        Ok(scorer)
    }

    pub fn is_loaded(&self) -> bool {
        self.scorer.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn score(&self, tensor: &ClassifierTensor) -> Result<ScoreVector> {
        let scorer = self.scorer()?;
        let scores = scorer.score(tensor)?;
        debug!("Classifier scores: {:?}", scores.as_slice());
        Ok(scores)
    }

    pub fn predict(&self, tensor: &ClassifierTensor) -> Result<PredictedClass> {
        Ok(self.score(tensor)?.argmax())
    }
}

struct Loaded(Arc<dyn Scorer>);

impl ScorerFactory for Loaded {
    fn load(&self) -> Result<Arc<dyn Scorer>> {
        Ok(self.0.clone())
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_CLASSIFIER: LazyClassifier =
        LazyClassifier::new(OnnxModelFactory::default_location());
}

/// Process-wide classifier backed by the bundled model artifact.
pub fn default_classifier() -> &'static LazyClassifier {
    &DEFAULT_CLASSIFIER
}
