pub mod types;
pub mod value;
pub mod program;
pub mod library;
pub mod parser;
pub mod arena;
pub mod grammar;
pub mod frontier;
pub mod task;
pub mod enumeration;
pub mod protocol;
pub mod worker;
pub mod scheduler;

pub use enumeration::{enumerate_for_task, enumerate_for_tasks, enumerate_window, EnumerationConfig, SearchStatus};
pub use grammar::Grammar;
pub use library::SymbolTable;
pub use program::Term;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use types::{Type, TypeContext};
