pub use pipewright_core::*;
pub use pipewright_graph::*;
pub use pipewright_runtime::*;
