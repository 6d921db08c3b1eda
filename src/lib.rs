// TodoStore - Local todo persistence with SQLite and JSON export/import

pub mod config;
pub mod error;
pub mod record;
pub mod service;
pub mod store;
pub mod transfer;

// Re-export main types for convenience
pub use config::{Config, ListFailurePolicy};
pub use error::{TodoError, TodoResult};
pub use record::{NewTodo, Todo, TodoStats};
pub use service::TodoService;
pub use store::RecordStore;
