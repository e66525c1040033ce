use std::sync::Arc;

use chrono::Utc;

use crate::config::PublisherConfig;
use crate::error::{Error, Result};
use crate::format::ContentFormatter;
use crate::post::{Post, PostStatus};
use crate::repo::RepositoryClient;
use crate::session::UserCredential;
use crate::store::PostStore;

/// Drives a post through draft, published, archived and failed.
///
/// Every transition ends in exactly one `save_post`. A post is only marked
/// published once the create call has fully succeeded, and the uri is written
/// in that same save.
pub struct PublicationStateMachine {
    config: Arc<PublisherConfig>,
    repo: Arc<RepositoryClient>,
    formatter: Arc<dyn ContentFormatter>,
    posts: Arc<dyn PostStore>,
}

impl PublicationStateMachine {
    pub fn new(
        config: Arc<PublisherConfig>,
        repo: Arc<RepositoryClient>,
        formatter: Arc<dyn ContentFormatter>,
        posts: Arc<dyn PostStore>,
    ) -> Self {
        Self {
            config,
            repo,
            formatter,
            posts,
        }
    }

    pub fn formatter(&self) -> &Arc<dyn ContentFormatter> {
        &self.formatter
    }

    pub async fn publish(&self, post: &mut Post, credential: &mut UserCredential) -> Result<()> {
        post.check_publishable()?;

        // A uri left by an earlier partial success means the record exists
        if let Some(uri) = &post.bluesky_uri {
            tracing::info!("post {} already has remote record {}, not creating another", post.id, uri);
            post.repair_published();
            return self.posts.save_post(post).await;
        }

        let post_url = self.config.post_url(post.id)?;
        let formatted = self.formatter.format(post, &post_url)?;

        match self
            .repo
            .create_record(credential, formatted.collection, formatted.record)
            .await
        {
            Ok(created) => {
                post.mark_published(created.uri, created.cid, Utc::now());
                self.posts.save_post(post).await?;
                tracing::info!("published post {} as {:?}", post.id, post.bluesky_uri);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("publishing post {} failed: {}", post.id, e);
                post.mark_failed();
                self.posts.save_post(post).await?;
                Err(e)
            }
        }
    }

    /// Deletes the remote record if possible; the post returns to draft regardless.
    pub async fn unpublish(&self, post: &mut Post, credential: &mut UserCredential) -> Result<()> {
        if post.status != PostStatus::Published {
            return Err(Error::InvalidTransition {
                from: post.status,
                action: "unpublish",
            });
        }

        if let Some(uri) = post.bluesky_uri.clone() {
            if let Err(e) = self.repo.delete_record(credential, &uri).await {
                tracing::warn!(
                    "failed to delete remote record {} for post {}, leaving it behind: {}",
                    uri,
                    post.id,
                    e
                );
            }
        }

        post.mark_unpublished();
        self.posts.save_post(post).await
    }

    pub async fn archive(&self, post: &mut Post) -> Result<()> {
        if !matches!(post.status, PostStatus::Draft | PostStatus::Failed) {
            return Err(Error::InvalidTransition {
                from: post.status,
                action: "archive",
            });
        }

        if let Some(uri) = post.bluesky_uri.take() {
            tracing::warn!("archiving post {} drops its link to {}", post.id, uri);
            post.bluesky_cid = None;
        }
        post.published_at = None;
        post.set_status(PostStatus::Archived);
        self.posts.save_post(post).await
    }

    pub async fn unarchive(&self, post: &mut Post) -> Result<()> {
        if post.status != PostStatus::Archived {
            return Err(Error::InvalidTransition {
                from: post.status,
                action: "unarchive",
            });
        }

        post.set_status(PostStatus::Draft);
        self.posts.save_post(post).await
    }
}
