use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::at_uri::AtUri;
use crate::error::{Error, Result};

pub type PostId = i64;

/// Maximum length of the plain-text excerpt kept alongside a post
pub const EXCERPT_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    #[default]
    Draft,
    Published,
    Archived,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Published => "published",
            PostStatus::Archived => "archived",
            PostStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "published" => Ok(PostStatus::Published),
            "archived" => Ok(PostStatus::Archived),
            "failed" => Ok(PostStatus::Failed),
            other => Err(Error::Validation(format!("unknown post status: {}", other))),
        }
    }
}

/// A locally authored post and its link to the remote record.
///
/// `published_at` is set exactly when `status` is `Published`. A remote uri
/// only survives outside `Published` on a `Failed` post left over from a
/// partially successful publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub user_did: String,
    pub title: String,
    /// HTML body as authored
    pub content: String,
    pub status: PostStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub bluesky_uri: Option<String>,
    pub bluesky_cid: Option<String>,
    pub excerpt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub fn draft(
        id: PostId,
        user_did: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_did: user_did.into(),
            title: title.into(),
            content: content.into(),
            status: PostStatus::Draft,
            published_at: None,
            bluesky_uri: None,
            bluesky_cid: None,
            excerpt: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_publish(&self) -> bool {
        matches!(self.status, PostStatus::Draft | PostStatus::Failed)
    }

    /// Checks a post can be sent for publishing without touching the network
    pub fn check_publishable(&self) -> Result<()> {
        if !self.can_publish() {
            return Err(Error::InvalidTransition {
                from: self.status,
                action: "publish",
            });
        }
        if self.title.trim().is_empty() {
            return Err(Error::Validation("title is required".to_string()));
        }
        if self.content.trim().is_empty() {
            return Err(Error::Validation("content is required".to_string()));
        }
        Ok(())
    }

    /// Unpublishing a never-published draft is a no-op, not an error
    pub fn check_unpublishable(&self) -> Result<()> {
        let plain_draft = self.status == PostStatus::Draft && self.bluesky_uri.is_none();
        if self.status != PostStatus::Published && !plain_draft {
            return Err(Error::InvalidTransition {
                from: self.status,
                action: "unpublish",
            });
        }
        Ok(())
    }

    pub fn is_published(&self) -> bool {
        self.status == PostStatus::Published
    }

    pub fn has_remote_record(&self) -> bool {
        self.bluesky_uri.is_some()
    }

    pub fn mark_published(&mut self, uri: String, cid: String, at: DateTime<Utc>) {
        self.status = PostStatus::Published;
        self.bluesky_uri = Some(uri);
        self.bluesky_cid = Some(cid);
        self.published_at = Some(at);
        self.updated_at = at;
    }

    /// Recovers a post whose record exists remotely but whose local status
    /// never caught up.
    pub fn repair_published(&mut self) {
        self.status = PostStatus::Published;
        if self.published_at.is_none() {
            self.published_at = Some(self.updated_at);
        }
    }

    pub fn mark_failed(&mut self) {
        self.status = PostStatus::Failed;
        self.published_at = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_unpublished(&mut self) {
        self.status = PostStatus::Draft;
        self.bluesky_uri = None;
        self.bluesky_cid = None;
        self.published_at = None;
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: PostStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Checks the status/uri/published_at coupling.
    pub fn coupling_holds(&self) -> bool {
        let published = self.is_published();
        let uri_ok = match self.status {
            PostStatus::Published => self.bluesky_uri.is_some(),
            PostStatus::Failed => true,
            _ => self.bluesky_uri.is_none(),
        };
        published == self.published_at.is_some() && uri_ok
    }

    pub fn remote_uri(&self) -> Result<Option<AtUri>> {
        self.bluesky_uri.as_deref().map(AtUri::parse).transpose()
    }

    /// Link to the record on the Bluesky web app, for feed posts only.
    pub fn bluesky_url(&self, handle_or_did: &str) -> Option<String> {
        let uri = self.remote_uri().ok().flatten()?;
        (uri.collection == lexicons::app_bsky::feed::post::NSID).then(|| {
            format!(
                "https://bsky.app/profile/{}/post/{}",
                handle_or_did, uri.rkey
            )
        })
    }

    pub fn word_count(&self, plain_text: &str) -> usize {
        plain_text.split_whitespace().count()
    }

    /// Regenerates the excerpt from the plain-text rendering of the body.
    pub fn refresh_excerpt(&mut self, plain_text: &str) {
        let text = plain_text.split_whitespace().collect::<Vec<_>>().join(" ");
        self.excerpt = if text.is_empty() {
            None
        } else if text.chars().count() <= EXCERPT_CHARS {
            Some(text)
        } else {
            let cut: String = text.chars().take(EXCERPT_CHARS - 3).collect();
            Some(format!("{}...", cut.trim_end()))
        };
    }
}
