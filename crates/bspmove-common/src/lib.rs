#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::float_cmp,
         clippy::collapsible_else_if, clippy::field_reassign_with_default)]

// Collision and player movement shared by client prediction and the server.

pub mod q_shared;
pub mod qfiles;
pub mod cmodel;
pub mod cmtrace;
pub mod stuck;
pub mod cvar;
pub mod pmove;
