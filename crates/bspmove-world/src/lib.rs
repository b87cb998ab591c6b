#![allow(clippy::too_many_arguments)]

// Entity index layered over the world collision model.
pub mod sv_world;
