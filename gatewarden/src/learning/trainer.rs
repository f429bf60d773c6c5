// gatewarden/src/learning/trainer.rs
//
// Online learning side path. The inference path enqueues observations on
// a bounded channel and never blocks; a background worker drains the
// channel into the WeightStore, and a second task reloads the model at
// the configured interval. A full channel drops observations — learning
// is opportunistic.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::LearningOptions;
use crate::learning::model::{HeuristicModel, FEATURE_SIG_TYPE};
use crate::stores::WeightStore;

/// One detection outcome attributed to one active feature.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub feature: String,
    pub was_bot: bool,
    /// Verdict confidence scaled by the feature activation.
    pub impact:  f64,
}

/// Cheap cloneable handle the orchestrator feeds.
#[derive(Clone)]
pub struct LearningQueue {
    tx: mpsc::Sender<Observation>,
}

impl LearningQueue {
    /// Non-blocking enqueue; overflow is dropped silently.
    pub fn offer(&self, observation: Observation) {
        if self.tx.try_send(observation).is_err() {
            trace!("learning queue full, observation dropped");
        }
    }

    pub fn offer_all(&self, observations: impl IntoIterator<Item = Observation>) {
        for o in observations {
            self.offer(o);
        }
    }
}

pub struct Trainer {
    pub queue:   LearningQueue,
    drain_task:  JoinHandle<()>,
    reload_task: JoinHandle<()>,
}

impl Trainer {
    /// Spawn the drain and reload workers. Both run until the engine is
    /// dropped.
    pub fn spawn(
        store: Arc<dyn WeightStore>,
        model: Arc<HeuristicModel>,
        opts: &LearningOptions,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Observation>(opts.queue_capacity.max(1));

        let drain_store = Arc::clone(&store);
        let drain_task = tokio::spawn(async move {
            while let Some(obs) = rx.recv().await {
                drain_store
                    .record_observation(FEATURE_SIG_TYPE, &obs.feature, obs.was_bot, obs.impact)
                    .await;
            }
            debug!("learning drain worker stopped");
        });

        let interval =
            std::time::Duration::from_secs(opts.weight_reload_interval_minutes.max(1) * 60);
        let reload_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup keeps
            // the seed weights until real observations accumulate.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                model.reload(store.as_ref()).await;
            }
        });

        Self { queue: LearningQueue { tx }, drain_task, reload_task }
    }
}

impl Drop for Trainer {
    fn drop(&mut self) {
        self.drain_task.abort();
        self.reload_task.abort();
    }
}
