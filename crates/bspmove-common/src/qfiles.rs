// qfiles.rs -- BSP lump records consumed by the collision loader
//
// These mirror the on-disk layout of the collision lumps. Decoding the file
// itself is the loader's job; it hands the decoded tables over as
// `CollisionLumps`.

// ============================================================
// Upper design bounds
// ============================================================

pub const MAX_MAP_MODELS: usize = 1024;
pub const MAX_MAP_BRUSHES: usize = 8192;
pub const MAX_MAP_PLANES: usize = 65536;
pub const MAX_MAP_NODES: usize = 65536;
pub const MAX_MAP_BRUSHSIDES: usize = 65536;
pub const MAX_MAP_LEAFS: usize = 65536;
pub const MAX_MAP_LEAFBRUSHES: usize = 65536;

// ============================================================
// Lump records
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct DModel {
    pub mins: [f32; 3],
    pub maxs: [f32; 3],
    pub origin: [f32; 3],
    pub headnode: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct DPlane {
    pub normal: [f32; 3],
    pub dist: f32,
}

/// `children` uses the on-disk encoding: `>= 0` is a node index,
/// negative values are `-(leaf + 1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DNode {
    pub planenum: i32,
    pub children: [i32; 2],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DLeaf {
    pub contents: u32,
    pub cluster: i16,
    pub area: i16,
    pub firstleafbrush: u16,
    pub numleafbrushes: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DBrushSide {
    pub planenum: u16,
    /// Surface flags of the side's texture.
    pub surface_flags: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DBrush {
    pub firstside: i32,
    pub numsides: i32,
    pub contents: u32,
}

/// Decoded collision tables for one level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollisionLumps {
    pub planes: Vec<DPlane>,
    pub nodes: Vec<DNode>,
    pub leafs: Vec<DLeaf>,
    pub leafbrushes: Vec<u16>,
    pub brushes: Vec<DBrush>,
    pub brushsides: Vec<DBrushSide>,
    /// Model 0 is the world. Empty means a single world model rooted at
    /// node 0 (or leaf 0 when there are no nodes).
    pub models: Vec<DModel>,
}
