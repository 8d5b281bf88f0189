pub mod chat_persistence;
pub mod error;
pub mod in_memory_repository;

pub use chat_persistence::{BoxFuture, ChatPersistence, MessageSnapshot};
pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_repository::{InMemoryChatRepository, SaveRecord};
