//! Per-session context: worker pool, animation sink, and data providers.

use anyhow::{Context, Result};
use log::info;
use rayon::{ThreadPool, ThreadPoolBuilder};
use sc_types::PipelineError;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::providers::{FeatureSetProvider, InMemoryFeatureSets, InMemoryReferences, ReferenceProvider};
use crate::step::Step;

/// Intermediate coordinates of an embedding being optimized.
#[derive(Clone, Debug, PartialEq)]
pub struct AnimationFrame {
    pub step: Step,
    pub iteration: usize,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

type AnimationCallback = Box<dyn Fn(&AnimationFrame) + Send + Sync>;

/// Shared resources of one analysis session. Several analyses may use the
/// same session.
pub struct Session {
    pool: Mutex<Option<Arc<ThreadPool>>>,
    animation: Option<AnimationCallback>,
    references: Arc<dyn ReferenceProvider>,
    feature_sets: Arc<dyn FeatureSetProvider>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// The worker pool, if it has not been torn down.
    pub fn workers(&self) -> Result<Arc<ThreadPool>> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| PipelineError::state("the session's workers have been shut down").into())
    }

    /// Run `op` inside the worker pool.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> Result<R> {
        Ok(self.workers()?.install(op))
    }

    pub fn animate(&self, frame: &AnimationFrame) {
        if let Some(callback) = &self.animation {
            callback(frame);
        }
    }

    pub fn references(&self) -> &dyn ReferenceProvider {
        self.references.as_ref()
    }

    pub fn feature_sets(&self) -> &dyn FeatureSetProvider {
        self.feature_sets.as_ref()
    }

    /// Tear down the worker pool. Steps that need it fail afterwards.
    pub fn kill_all_workers(&self) {
        if self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!("worker pool shut down");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let threads = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| p.current_num_threads());
        f.debug_struct("Session")
            .field("threads", &threads)
            .field("animation", &self.animation.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct SessionBuilder {
    num_threads: Option<usize>,
    animation: Option<AnimationCallback>,
    references: Option<Arc<dyn ReferenceProvider>>,
    feature_sets: Option<Arc<dyn FeatureSetProvider>>,
}

impl SessionBuilder {
    /// Number of worker threads; rayon picks one per core when unset.
    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n);
        self
    }

    pub fn animation(mut self, callback: impl Fn(&AnimationFrame) + Send + Sync + 'static) -> Self {
        self.animation = Some(Box::new(callback));
        self
    }

    pub fn references(mut self, provider: Arc<dyn ReferenceProvider>) -> Self {
        self.references = Some(provider);
        self
    }

    pub fn feature_sets(mut self, provider: Arc<dyn FeatureSetProvider>) -> Self {
        self.feature_sets = Some(provider);
        self
    }

    pub fn build(self) -> Result<Session> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("sc_ana-{i}"));
        if let Some(n) = self.num_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder.build().context("failed to start worker pool")?;
        info!("worker pool ready with {} threads", pool.current_num_threads());
        Ok(Session {
            pool: Mutex::new(Some(Arc::new(pool))),
            animation: self.animation,
            references: self
                .references
                .unwrap_or_else(|| Arc::new(InMemoryReferences::default())),
            feature_sets: self
                .feature_sets
                .unwrap_or_else(|| Arc::new(InMemoryFeatureSets::default())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_workers_and_shutdown() -> Result<()> {
        let session = Session::builder().num_threads(2).build()?;
        assert_eq!(session.install(rayon::current_num_threads)?, 2);
        session.kill_all_workers();
        session.kill_all_workers();
        let err = session.install(|| ()).unwrap_err();
        assert!(matches!(
            sc_types::error::find_pipeline_error(&err),
            Some(PipelineError::State(_))
        ));
        Ok(())
    }

    #[test]
    fn test_animation_callback() -> Result<()> {
        let frames = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&frames);
        let session = Session::builder()
            .num_threads(1)
            .animation(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()?;
        let frame = AnimationFrame {
            step: Step::Tsne,
            iteration: 10,
            x: vec![0.0],
            y: vec![1.0],
        };
        session.animate(&frame);
        session.animate(&frame);
        assert_eq!(frames.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
