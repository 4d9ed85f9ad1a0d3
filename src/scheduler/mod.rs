//! Task Distribution Engine: task modules, input chunking, and the mapping
//! of chunks onto fleet nodes.

pub mod assigner;
pub mod chunk;
pub mod task;

pub use assigner::{assign_round_robin, plan_assignments};
pub use chunk::{chunk_inputs, load_input_files};
pub use task::{RenderContext, TaskSpec, ITEM_PLACEHOLDER};
