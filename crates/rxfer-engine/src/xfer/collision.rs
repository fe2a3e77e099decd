//! Collision handling: one visible prompt at a time, remembered
//! "all" decisions for the rest of an operation.

use crate::xfer::types::*;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// What the user is asked about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollisionPrompt {
    pub item_id: String,
    pub direction: TransferDirection,
    /// The existing target.
    pub path: String,
    pub target_type: Option<EntryKind>,
}

/// Asks the user how to handle an existing target.
#[async_trait]
pub trait CollisionPrompter: Send + Sync {
    /// `None` means the prompt was dismissed.
    async fn prompt(&self, prompt: CollisionPrompt) -> Option<CollisionChoice>;
}

/// Outcome for a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionDecision {
    Overwrite,
    Skip,
}

/// Holds the remembered policy for one operation. Resolvers created with
/// [`CollisionResolver::scoped`] share the prompt lock, so prompts from
/// every operation queue behind each other in arrival order.
pub struct CollisionResolver {
    policy: StdMutex<CollisionPolicy>,
    prompter: Option<Arc<dyn CollisionPrompter>>,
    prompt_lock: Arc<Mutex<()>>,
}

impl CollisionResolver {
    pub fn new(prompter: Option<Arc<dyn CollisionPrompter>>) -> Self {
        Self {
            policy: StdMutex::new(CollisionPolicy::Ask),
            prompter,
            prompt_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A fresh `Ask` scope sharing this resolver's prompter and lock.
    pub fn scoped(&self) -> Arc<CollisionResolver> {
        Arc::new(Self {
            policy: StdMutex::new(CollisionPolicy::Ask),
            prompter: self.prompter.clone(),
            prompt_lock: self.prompt_lock.clone(),
        })
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
            .lock()
            .map(|p| *p)
            .unwrap_or(CollisionPolicy::Ask)
    }

    pub fn set_policy(&self, policy: CollisionPolicy) {
        if let Ok(mut p) = self.policy.lock() {
            *p = policy;
        }
    }

    pub fn reset(&self) {
        self.set_policy(CollisionPolicy::Ask);
    }

    fn remembered(&self) -> Option<CollisionDecision> {
        match self.policy() {
            CollisionPolicy::Ask => None,
            CollisionPolicy::Overwrite => Some(CollisionDecision::Overwrite),
            CollisionPolicy::Skip => Some(CollisionDecision::Skip),
        }
    }

    /// Decide what to do with an existing target, prompting at most once.
    pub async fn resolve(&self, prompt: CollisionPrompt) -> CollisionDecision {
        if let Some(decision) = self.remembered() {
            return decision;
        }

        let _turn = self.prompt_lock.lock().await;
        // An earlier prompt may have set an "all" policy while we waited.
        if let Some(decision) = self.remembered() {
            return decision;
        }

        let Some(prompter) = self.prompter.as_ref() else {
            warn!("No collision prompter configured; skipping {}", prompt.path);
            return CollisionDecision::Skip;
        };

        let path = prompt.path.clone();
        let decision = match prompter.prompt(prompt).await {
            Some(CollisionChoice::Overwrite) => CollisionDecision::Overwrite,
            Some(CollisionChoice::Skip) => CollisionDecision::Skip,
            Some(CollisionChoice::OverwriteAll) => {
                self.set_policy(CollisionPolicy::Overwrite);
                CollisionDecision::Overwrite
            }
            Some(CollisionChoice::SkipAll) => {
                self.set_policy(CollisionPolicy::Skip);
                CollisionDecision::Skip
            }
            None => CollisionDecision::Skip,
        };
        debug!("Collision on {} resolved as {:?}", path, decision);
        decision
    }
}
