use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::chat_persistence::{BoxFuture, ChatPersistence, MessageSnapshot};
use super::error::{RepositoryError, RepositoryResult};
use crate::models::Lane;

/// One recorded `save_current_chat` call
#[derive(Clone, Debug, PartialEq)]
pub struct SaveRecord {
    pub force: bool,
    pub lane: Lane,
    pub snapshot: MessageSnapshot,
    /// The snapshot as it would be written to disk
    pub json: String,
}

/// In-memory persistence that records every save.
/// Useful for testing and for the replay binary.
#[derive(Clone)]
pub struct InMemoryChatRepository {
    saves: Arc<Mutex<Vec<SaveRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryChatRepository {
    pub fn new() -> Self {
        Self {
            saves: Arc::new(Mutex::new(Vec::new())),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make subsequent saves fail with `RepositoryError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn saves(&self) -> RepositoryResult<Vec<SaveRecord>> {
        let saves = self.saves.lock().map_err(|e| RepositoryError::InvalidData {
            message: format!("Failed to lock saves: {}", e),
        })?;
        Ok(saves.clone())
    }

    pub fn saves_for(&self, lane: Lane) -> RepositoryResult<Vec<SaveRecord>> {
        Ok(self
            .saves()?
            .into_iter()
            .filter(|record| record.lane == lane)
            .collect())
    }
}

impl Default for InMemoryChatRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatPersistence for InMemoryChatRepository {
    fn save_current_chat(
        &self,
        force: bool,
        lane: Lane,
        snapshot: MessageSnapshot,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let saves = self.saves.clone();
        let unavailable = self.unavailable.load(Ordering::SeqCst);

        Box::pin(async move {
            if unavailable {
                return Err(RepositoryError::Unavailable {
                    message: "in-memory repository switched off".to_string(),
                });
            }
            let json = serde_json::to_string(&snapshot)?;

            let mut store = saves.lock().map_err(|e| RepositoryError::InvalidData {
                message: format!("Failed to lock saves: {}", e),
            })?;
            store.push(SaveRecord {
                force,
                lane,
                snapshot,
                json,
            });

            Ok(())
        })
    }
}
