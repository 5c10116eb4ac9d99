//! Batch data model shared by the training builder and the decode loops
//!
//! - [`Codes`]: a `[timesteps, levels]` matrix of RVQ codec tokens
//! - [`Task`]: the task tag that decides which fields are live
//! - [`Prompt`] / [`BatchItem`]: one ragged example of a batch

mod batch;
mod codes;
mod task;

pub use batch::{BatchItem, Prompt};
pub use codes::Codes;
pub use task::{Task, TextField};
