//! In-process runner for publish and unpublish jobs.
//!
//! Jobs for the same post never run concurrently. Transient failures are
//! retried with exponential backoff; everything else is final.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bsky_publisher::{Error, PostId, PostStore, PublishOutcome, PublishingService};
use rand::Rng;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Publish,
    Unpublish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub post_id: PostId,
    pub kind: JobKind,
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `initial_backoff * 2^attempt`, capped, plus up to 50% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = base.min(self.max_backoff);

        let jitter_range = capped.as_millis() as u64 / 2;
        if jitter_range > 0 {
            capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_range))
        } else {
            capped
        }
    }
}

/// Handle for submitting jobs
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    pub fn enqueue(&self, post_id: PostId, kind: JobKind) -> Result<(), Error> {
        self.send(Job {
            post_id,
            kind,
            attempt: 0,
        })
    }

    fn send(&self, job: Job) -> Result<(), Error> {
        self.tx
            .send(job)
            .map_err(|_| Error::Internal("job runner has stopped".to_string()))
    }
}

#[derive(Clone)]
pub struct JobRunner {
    service: PublishingService,
    posts: Arc<dyn PostStore>,
    policy: RetryPolicy,
    locks: Arc<Mutex<HashMap<PostId, Arc<Mutex<()>>>>>,
}

impl JobRunner {
    pub fn new(service: PublishingService, posts: Arc<dyn PostStore>, policy: RetryPolicy) -> Self {
        Self {
            service,
            posts,
            policy,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts the dispatch loop and returns the queue feeding it
    pub fn spawn(self) -> JobQueue {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = JobQueue { tx };
        let retry_queue = queue.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let runner = self.clone();
                let queue = retry_queue.clone();
                tokio::spawn(async move {
                    runner.handle(job, queue).await;
                });
            }
            tracing::info!("job queue closed, runner stopping");
        });

        queue
    }

    async fn handle(&self, job: Job, queue: JobQueue) {
        let outcome = match self.run(job).await {
            Some(outcome) => outcome,
            None => return,
        };

        if outcome.success {
            tracing::info!("{:?} of post {} succeeded", job.kind, job.post_id);
        } else if outcome.retryable && job.attempt < self.policy.max_retries {
            let delay = self.policy.backoff(job.attempt);
            tracing::warn!(
                "{:?} of post {} failed (attempt {}), retrying in {:?}: {}",
                job.kind,
                job.post_id,
                job.attempt + 1,
                delay,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            let retry = Job {
                attempt: job.attempt + 1,
                ..job
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = queue.send(retry) {
                    tracing::error!("could not requeue post {}: {}", retry.post_id, e);
                }
            });
        } else if outcome.requires_reauth {
            tracing::warn!(
                "{:?} of post {} needs the user to sign in again",
                job.kind,
                job.post_id
            );
        } else {
            tracing::error!(
                "{:?} of post {} failed: {}",
                job.kind,
                job.post_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    /// Runs one job while holding the post's lock. `None` when the post is gone.
    pub async fn run(&self, job: Job) -> Option<PublishOutcome> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(job.post_id)
            .or_default()
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            self.run_locked(job).await
        };

        let mut locks = self.locks.lock().await;
        // Only the map and `lock` still hold it, so no job is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&job.post_id);
        }
        outcome
    }

    async fn run_locked(&self, job: Job) -> Option<PublishOutcome> {
        let mut post = match self.posts.get_post(job.post_id).await {
            Ok(Some(post)) => post,
            Ok(None) => {
                tracing::warn!("post {} no longer exists, dropping {:?}", job.post_id, job.kind);
                return None;
            }
            Err(e) => return Some(PublishOutcome::failed(&e)),
        };

        let outcome = match job.kind {
            JobKind::Publish => self.service.publish(&mut post).await,
            JobKind::Unpublish => self.service.unpublish(&mut post).await,
        };
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsky_publisher::{
        AuthScheme, CredentialStore, MemoryStore, Post, PostStatus, PublisherConfig,
        UserCredential,
    };
    use url::Url;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };

        let first = policy.backoff(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let second = policy.backoff(1);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));
        let capped = policy.backoff(10);
        assert!(capped >= Duration::from_millis(500) && capped <= Duration::from_millis(750));
    }

    async fn offline_runner(
        store: Arc<MemoryStore>,
        keys: &std::path::Path,
        policy: RetryPolicy,
    ) -> JobRunner {
        let unreachable = Url::parse("http://127.0.0.1:1").unwrap();
        let config = PublisherConfig::new(Url::parse("http://localhost:3000").unwrap())
            .with_default_pds(unreachable.clone())
            .with_identity_directory(unreachable)
            .with_key_dir(keys)
            .with_http_timeout(Duration::from_millis(200));

        store
            .save_credential(&UserCredential::new(
                "did:plc:abc",
                AuthScheme::Dpop,
                "at",
                "rt",
                None,
            ))
            .await
            .unwrap();

        let service = PublishingService::builder()
            .config(config)
            .credential_store(store.clone())
            .post_store(store.clone())
            .build()
            .unwrap();
        JobRunner::new(service, store, policy)
    }

    #[tokio::test]
    async fn missing_post_is_dropped() {
        let keys = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runner = offline_runner(store, keys.path(), RetryPolicy::default()).await;

        let outcome = runner
            .run(Job {
                post_id: 42,
                kind: JobKind::Publish,
                attempt: 0,
            })
            .await;
        assert!(outcome.is_none());
        assert!(runner.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn post_locks_are_released_after_concurrent_jobs() {
        let keys = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .insert_post(Post::draft(1, "did:plc:abc", "Hello", "<p>World</p>"))
            .unwrap();
        let runner = offline_runner(store.clone(), keys.path(), RetryPolicy::default()).await;

        let job = Job {
            post_id: 1,
            kind: JobKind::Unpublish,
            attempt: 0,
        };
        let (a, b) = tokio::join!(runner.run(job), runner.run(job));

        assert!(a.unwrap().success);
        assert!(b.unwrap().success);
        assert!(runner.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_exhausted() {
        let keys = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .insert_post(Post::draft(1, "did:plc:abc", "Hello", "<p>World</p>"))
            .unwrap();
        let policy = RetryPolicy {
            max_retries: 1,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
        };
        let queue = offline_runner(store.clone(), keys.path(), policy).await.spawn();

        queue.enqueue(1, JobKind::Publish).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while store.post_writes(1) < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // Let a third attempt show up if the retry bound were broken
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.post_writes(1), 2);
        let post = store.get_post(1).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Failed);
    }
}
