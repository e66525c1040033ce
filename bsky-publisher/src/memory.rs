use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::post::{Post, PostId};
use crate::session::UserCredential;
use crate::store::{CredentialStore, PostStore};

/// In-process store for tests and single-user tools
#[derive(Clone, Default)]
pub struct MemoryStore {
    credentials: Arc<RwLock<HashMap<String, UserCredential>>>,
    posts: Arc<RwLock<HashMap<PostId, Post>>>,
    post_writes: Arc<RwLock<HashMap<PostId, usize>>>,
}

fn poisoned<T>(_: T) -> Error {
    Error::StorageError("memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save_post` calls seen for a post
    pub fn post_writes(&self, id: PostId) -> usize {
        self.post_writes
            .read()
            .map(|w| w.get(&id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn insert_post(&self, post: Post) -> Result<()> {
        self.posts.write().map_err(poisoned)?.insert(post.id, post);
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load_credential(&self, did: &str) -> Result<Option<UserCredential>> {
        Ok(self.credentials.read().map_err(poisoned)?.get(did).cloned())
    }

    async fn save_credential(&self, credential: &UserCredential) -> Result<()> {
        let mut stored = credential.clone();
        stored.pds_endpoint = None;
        self.credentials
            .write()
            .map_err(poisoned)?
            .insert(credential.did.clone(), stored);
        Ok(())
    }
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn get_post(&self, id: PostId) -> Result<Option<Post>> {
        Ok(self.posts.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn save_post(&self, post: &Post) -> Result<()> {
        self.posts
            .write()
            .map_err(poisoned)?
            .insert(post.id, post.clone());
        *self
            .post_writes
            .write()
            .map_err(poisoned)?
            .entry(post.id)
            .or_insert(0) += 1;
        Ok(())
    }
}
