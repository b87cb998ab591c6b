// cmodel.rs -- Collision model construction and point/box queries
//
// A `CollisionModel` is built once per level from decoded lump tables and is
// immutable afterwards. Sweeps against it live in `cmtrace.rs`.

use crate::q_shared::{
    box_on_plane_side, dot_product, vector_length, CPlane, Contents, SurfaceFlags, Vec3,
};
use crate::qfiles::{
    CollisionLumps, DBrush, DBrushSide, DLeaf, DNode, DPlane, MAX_MAP_BRUSHES,
    MAX_MAP_BRUSHSIDES, MAX_MAP_LEAFBRUSHES, MAX_MAP_LEAFS, MAX_MAP_MODELS, MAX_MAP_NODES,
    MAX_MAP_PLANES,
};
use log::debug;
use rayon::prelude::*;
use thiserror::Error;

// ============================================================
// Runtime structures
// ============================================================

/// A node child: either another node or a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Child {
    Node(usize),
    Leaf(usize),
}

impl Child {
    /// Decodes the on-disk form, where negative values are `-(leaf + 1)`.
    pub fn from_raw(raw: i32) -> Self {
        if raw >= 0 {
            Child::Node(raw as usize)
        } else {
            Child::Leaf((-1 - raw) as usize)
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            Child::Node(n) => n as i32,
            Child::Leaf(l) => -1 - l as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CNode {
    pub plane_idx: usize,
    pub children: [Child; 2],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CBrushSide {
    pub plane_idx: usize,
    pub surface_flags: SurfaceFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CLeaf {
    pub contents: Contents,
    pub cluster: i32,
    pub area: i32,
    pub firstleafbrush: usize,
    pub numleafbrushes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CBrush {
    pub contents: Contents,
    pub firstbrushside: usize,
    pub numsides: usize,
}

/// An inline model: the world (index 0) or a brush mover.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3,
    pub headnode: Child,
}

// ============================================================
// Errors
// ============================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("map has no leafs")]
    NoLeafs,
    #[error("map has too many {lump} ({count})")]
    TooMany { lump: &'static str, count: usize },
    #[error("plane {plane} has a non-unit normal (length {length})")]
    NonUnitNormal { plane: usize, length: f32 },
    #[error("node {node} references plane {plane} out of range")]
    BadNodePlane { node: usize, plane: i32 },
    #[error("node {node} has child {child} out of range")]
    BadNodeChild { node: usize, child: i32 },
    #[error("leaf {leaf} leaf-brush range out of range")]
    BadLeafBrushRange { leaf: usize },
    #[error("leaf-brush entry {index} references brush {brush} out of range")]
    BadLeafBrush { index: usize, brush: usize },
    #[error("brush {brush} side range out of range")]
    BadBrushSides { brush: usize },
    #[error("brush side {side} references plane {plane} out of range")]
    BadSidePlane { side: usize, plane: usize },
    #[error("model {model} has headnode {headnode} out of range")]
    BadModelHeadnode { model: usize, headnode: i32 },
    #[error("node graph has a cycle through node {node}")]
    Cycle { node: usize },
    #[error("leaf {leaf} is not reachable from any model root")]
    UnreachableLeaf { leaf: usize },
}

// ============================================================
// Constants
// ============================================================

/// Normal length tolerance accepted from the loader.
const NORMAL_EPSILON: f32 = 0.01;

/// Lumps with at least this many records are converted on the rayon pool.
const PARALLEL_LUMP_THRESHOLD: usize = 64;

// ============================================================
// Collision model
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CollisionModel {
    pub(crate) planes: Vec<CPlane>,
    pub(crate) nodes: Vec<CNode>,
    pub(crate) leafs: Vec<CLeaf>,
    pub(crate) leafbrushes: Vec<usize>,
    pub(crate) brushes: Vec<CBrush>,
    pub(crate) brushsides: Vec<CBrushSide>,
    pub(crate) cmodels: Vec<CModel>,
}

/// Converts one lump, in parallel when it is large enough to pay off.
/// Output order always matches input order.
fn convert_lump<T, U, F>(records: &[T], f: F) -> Vec<U>
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> U + Sync + Send,
{
    if records.len() >= PARALLEL_LUMP_THRESHOLD {
        records.par_iter().map(f).collect()
    } else {
        records.iter().map(f).collect()
    }
}

fn check_count(lump: &'static str, count: usize, max: usize) -> Result<(), GeometryError> {
    if count > max {
        return Err(GeometryError::TooMany { lump, count });
    }
    Ok(())
}

impl CollisionModel {
    // ============================================================
    // Construction
    // ============================================================

    /// Builds and validates a model from decoded lumps. Every index is
    /// checked here so that traces never need to.
    pub fn from_lumps(lumps: &CollisionLumps) -> Result<Self, GeometryError> {
        if lumps.leafs.is_empty() {
            return Err(GeometryError::NoLeafs);
        }
        check_count("planes", lumps.planes.len(), MAX_MAP_PLANES)?;
        check_count("nodes", lumps.nodes.len(), MAX_MAP_NODES)?;
        check_count("leafs", lumps.leafs.len(), MAX_MAP_LEAFS)?;
        check_count("leafbrushes", lumps.leafbrushes.len(), MAX_MAP_LEAFBRUSHES)?;
        check_count("brushes", lumps.brushes.len(), MAX_MAP_BRUSHES)?;
        check_count("brushsides", lumps.brushsides.len(), MAX_MAP_BRUSHSIDES)?;
        check_count("models", lumps.models.len(), MAX_MAP_MODELS)?;

        let planes = Self::load_planes(&lumps.planes)?;
        let nodes = Self::load_nodes(&lumps.nodes, planes.len(), lumps.leafs.len())?;
        let leafs = Self::load_leafs(&lumps.leafs, lumps.leafbrushes.len())?;
        let leafbrushes = Self::load_leaf_brushes(&lumps.leafbrushes, lumps.brushes.len())?;
        let brushes = Self::load_brushes(&lumps.brushes, lumps.brushsides.len())?;
        let brushsides = Self::load_brush_sides(&lumps.brushsides, planes.len())?;
        let cmodels = Self::load_submodels(lumps, nodes.len(), leafs.len())?;

        let model = Self {
            planes,
            nodes,
            leafs,
            leafbrushes,
            brushes,
            brushsides,
            cmodels,
        };
        model.check_tree()?;

        debug!(
            "collision model: {} planes, {} nodes, {} leafs, {} brushes, {} models",
            model.planes.len(),
            model.nodes.len(),
            model.leafs.len(),
            model.brushes.len(),
            model.cmodels.len()
        );
        Ok(model)
    }

    fn load_planes(records: &[DPlane]) -> Result<Vec<CPlane>, GeometryError> {
        for (i, p) in records.iter().enumerate() {
            let length = vector_length(&p.normal);
            if (length - 1.0).abs() > NORMAL_EPSILON {
                return Err(GeometryError::NonUnitNormal { plane: i, length });
            }
        }
        // type and signbits are always derived, never trusted from input
        Ok(convert_lump(records, |p| CPlane::new(p.normal, p.dist)))
    }

    fn load_nodes(
        records: &[DNode],
        numplanes: usize,
        numleafs: usize,
    ) -> Result<Vec<CNode>, GeometryError> {
        for (i, n) in records.iter().enumerate() {
            if n.planenum < 0 || n.planenum as usize >= numplanes {
                return Err(GeometryError::BadNodePlane {
                    node: i,
                    plane: n.planenum,
                });
            }
            for &raw in &n.children {
                let ok = match Child::from_raw(raw) {
                    Child::Node(c) => c < records.len(),
                    Child::Leaf(l) => l < numleafs,
                };
                if !ok {
                    return Err(GeometryError::BadNodeChild { node: i, child: raw });
                }
            }
        }
        Ok(convert_lump(records, |n| CNode {
            plane_idx: n.planenum as usize,
            children: [Child::from_raw(n.children[0]), Child::from_raw(n.children[1])],
        }))
    }

    fn load_leafs(records: &[DLeaf], numleafbrushes: usize) -> Result<Vec<CLeaf>, GeometryError> {
        for (i, l) in records.iter().enumerate() {
            let end = l.firstleafbrush as usize + l.numleafbrushes as usize;
            if end > numleafbrushes {
                return Err(GeometryError::BadLeafBrushRange { leaf: i });
            }
        }
        Ok(convert_lump(records, |l| CLeaf {
            contents: Contents::from_bits_retain(l.contents),
            cluster: l.cluster as i32,
            area: l.area as i32,
            firstleafbrush: l.firstleafbrush as usize,
            numleafbrushes: l.numleafbrushes as usize,
        }))
    }

    fn load_leaf_brushes(records: &[u16], numbrushes: usize) -> Result<Vec<usize>, GeometryError> {
        for (i, &b) in records.iter().enumerate() {
            if b as usize >= numbrushes {
                return Err(GeometryError::BadLeafBrush {
                    index: i,
                    brush: b as usize,
                });
            }
        }
        Ok(records.iter().map(|&b| b as usize).collect())
    }

    fn load_brushes(records: &[DBrush], numsides: usize) -> Result<Vec<CBrush>, GeometryError> {
        for (i, b) in records.iter().enumerate() {
            let end = b.firstside.checked_add(b.numsides);
            let ok = b.firstside >= 0
                && b.numsides >= 0
                && end.is_some_and(|end| end as usize <= numsides);
            if !ok {
                return Err(GeometryError::BadBrushSides { brush: i });
            }
        }
        Ok(convert_lump(records, |b| CBrush {
            contents: Contents::from_bits_retain(b.contents),
            firstbrushside: b.firstside as usize,
            numsides: b.numsides as usize,
        }))
    }

    fn load_brush_sides(
        records: &[DBrushSide],
        numplanes: usize,
    ) -> Result<Vec<CBrushSide>, GeometryError> {
        for (i, s) in records.iter().enumerate() {
            if s.planenum as usize >= numplanes {
                return Err(GeometryError::BadSidePlane {
                    side: i,
                    plane: s.planenum as usize,
                });
            }
        }
        Ok(convert_lump(records, |s| CBrushSide {
            plane_idx: s.planenum as usize,
            surface_flags: SurfaceFlags::from_bits_retain(s.surface_flags),
        }))
    }

    fn load_submodels(
        lumps: &CollisionLumps,
        numnodes: usize,
        numleafs: usize,
    ) -> Result<Vec<CModel>, GeometryError> {
        if lumps.models.is_empty() {
            let headnode = if numnodes > 0 {
                Child::Node(0)
            } else {
                Child::Leaf(0)
            };
            return Ok(vec![CModel {
                mins: [0.0; 3],
                maxs: [0.0; 3],
                origin: [0.0; 3],
                headnode,
            }]);
        }

        let mut out = Vec::with_capacity(lumps.models.len());
        for (i, m) in lumps.models.iter().enumerate() {
            let headnode = Child::from_raw(m.headnode);
            let ok = match headnode {
                Child::Node(n) => n < numnodes,
                Child::Leaf(l) => l < numleafs,
            };
            if !ok {
                return Err(GeometryError::BadModelHeadnode {
                    model: i,
                    headnode: m.headnode,
                });
            }
            // spread the bounds the same way the map compiler does
            out.push(CModel {
                mins: [m.mins[0] - 1.0, m.mins[1] - 1.0, m.mins[2] - 1.0],
                maxs: [m.maxs[0] + 1.0, m.maxs[1] + 1.0, m.maxs[2] + 1.0],
                origin: m.origin,
                headnode,
            });
        }
        Ok(out)
    }

    /// Walks the tree from every model root: rejects cycles and leafs that no
    /// root can reach. Leaf 0 is allowed to be orphaned when it is the shared
    /// solid leaf the map compiler emits.
    fn check_tree(&self) -> Result<(), GeometryError> {
        const WHITE: u8 = 0;
        const GREY: u8 = 1;
        const BLACK: u8 = 2;

        let mut color = vec![WHITE; self.nodes.len()];
        let mut leaf_seen = vec![false; self.leafs.len()];

        for cmodel in &self.cmodels {
            let root = match cmodel.headnode {
                Child::Leaf(l) => {
                    leaf_seen[l] = true;
                    continue;
                }
                Child::Node(n) => n,
            };
            if color[root] == BLACK {
                continue;
            }

            // (node, next child to visit)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            color[root] = GREY;
            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                if next == 2 {
                    color[node] = BLACK;
                    stack.pop();
                    continue;
                }
                top.1 += 1;
                match self.nodes[node].children[next] {
                    Child::Leaf(l) => leaf_seen[l] = true,
                    Child::Node(c) => match color[c] {
                        GREY => return Err(GeometryError::Cycle { node: c }),
                        WHITE => {
                            color[c] = GREY;
                            stack.push((c, 0));
                        }
                        _ => {}
                    },
                }
            }
        }

        for (i, seen) in leaf_seen.iter().enumerate() {
            if *seen {
                continue;
            }
            if i == 0 && self.leafs[0].contents.contains(Contents::SOLID) {
                continue;
            }
            return Err(GeometryError::UnreachableLeaf { leaf: i });
        }
        Ok(())
    }

    // ============================================================
    // Box hull
    // ============================================================

    /// Builds a standalone model whose only solid is the box `mins..maxs`.
    /// Entities without brush geometry are traced against one of these.
    ///
    /// Layout: six nodes, one per face, each with the empty leaf (0) on the
    /// outside and the next node inside; the last node's inside is the box
    /// leaf (1) holding the single six-sided brush.
    pub fn box_hull(mins: &Vec3, maxs: &Vec3, contents: Contents) -> Self {
        let mut planes = Vec::with_capacity(12);
        let mut nodes = Vec::with_capacity(6);
        let mut brushsides = Vec::with_capacity(6);

        for i in 0..6 {
            let axis = i >> 1;
            let side = i & 1;
            let d = if side == 0 { maxs[axis] } else { mins[axis] };

            let mut normal = [0.0f32; 3];
            normal[axis] = 1.0;
            planes.push(CPlane::new(normal, d));
            normal[axis] = -1.0;
            planes.push(CPlane::new(normal, -d));

            brushsides.push(CBrushSide {
                plane_idx: i * 2 + side,
                surface_flags: SurfaceFlags::empty(),
            });

            let inside = if i != 5 {
                Child::Node(i + 1)
            } else {
                Child::Leaf(1)
            };
            let mut children = [Child::Leaf(0); 2];
            children[side] = Child::Leaf(0);
            children[side ^ 1] = inside;
            nodes.push(CNode {
                plane_idx: i * 2,
                children,
            });
        }

        Self {
            planes,
            nodes,
            leafs: vec![
                CLeaf::default(),
                CLeaf {
                    contents,
                    cluster: -1,
                    area: 0,
                    firstleafbrush: 0,
                    numleafbrushes: 1,
                },
            ],
            leafbrushes: vec![0],
            brushes: vec![CBrush {
                contents,
                firstbrushside: 0,
                numsides: 6,
            }],
            brushsides,
            cmodels: vec![CModel {
                mins: *mins,
                maxs: *maxs,
                origin: [0.0; 3],
                headnode: Child::Node(0),
            }],
        }
    }

    // ============================================================
    // Public accessors
    // ============================================================

    /// Root of the world model.
    pub fn world_root(&self) -> Child {
        self.cmodels[0].headnode
    }

    pub fn num_inline_models(&self) -> usize {
        self.cmodels.len()
    }

    /// Inline model `num`; 0 is the world.
    pub fn inline_model(&self, num: usize) -> Option<&CModel> {
        self.cmodels.get(num)
    }

    pub fn planes(&self) -> &[CPlane] {
        &self.planes
    }

    pub fn nodes(&self) -> &[CNode] {
        &self.nodes
    }

    pub fn leafs(&self) -> &[CLeaf] {
        &self.leafs
    }

    pub fn brushes(&self) -> &[CBrush] {
        &self.brushes
    }

    pub fn brush_sides(&self, brush: &CBrush) -> &[CBrushSide] {
        &self.brushsides[brush.firstbrushside..brush.firstbrushside + brush.numsides]
    }

    pub fn leaf_brushes(&self, leaf: &CLeaf) -> &[usize] {
        &self.leafbrushes[leaf.firstleafbrush..leaf.firstleafbrush + leaf.numleafbrushes]
    }

    pub fn leaf_contents(&self, leafnum: usize) -> Contents {
        self.leafs.get(leafnum).map_or(Contents::empty(), |l| l.contents)
    }

    // ============================================================
    // Point / leaf queries
    // ============================================================

    pub fn point_leafnum_r(&self, p: &Vec3, mut num: Child) -> usize {
        loop {
            let n = match num {
                Child::Leaf(l) => return l,
                Child::Node(n) => n,
            };
            let node = &self.nodes[n];
            let plane = &self.planes[node.plane_idx];

            let d = if plane.plane_type < 3 {
                p[plane.plane_type as usize] - plane.dist
            } else {
                dot_product(&plane.normal, p) - plane.dist
            };

            num = if d < 0.0 {
                node.children[1]
            } else {
                node.children[0]
            };
        }
    }

    pub fn point_leafnum(&self, p: &Vec3) -> usize {
        self.point_leafnum_r(p, self.world_root())
    }

    /// Contents of the leaf containing `p` under `headnode`.
    pub fn point_contents(&self, p: &Vec3, headnode: Child) -> Contents {
        let l = self.point_leafnum_r(p, headnode);
        self.leafs[l].contents
    }

    // ============================================================
    // Box leaf enumeration
    // ============================================================

    fn box_leafnums_r(
        &self,
        mut num: Child,
        leaf_list: &mut Vec<usize>,
        leaf_maxcount: usize,
        leaf_mins: &Vec3,
        leaf_maxs: &Vec3,
    ) {
        loop {
            let n = match num {
                Child::Leaf(l) => {
                    if leaf_list.len() < leaf_maxcount {
                        leaf_list.push(l);
                    }
                    return;
                }
                Child::Node(n) => n,
            };

            let node = &self.nodes[n];
            let plane = &self.planes[node.plane_idx];
            match box_on_plane_side(leaf_mins, leaf_maxs, plane) {
                1 => num = node.children[0],
                2 => num = node.children[1],
                _ => {
                    self.box_leafnums_r(
                        node.children[0],
                        leaf_list,
                        leaf_maxcount,
                        leaf_mins,
                        leaf_maxs,
                    );
                    num = node.children[1];
                }
            }
        }
    }

    /// Leafs touched by the box, front children first, capped at `listsize`.
    pub fn box_leafnums_headnode(
        &self,
        mins: &Vec3,
        maxs: &Vec3,
        listsize: usize,
        headnode: Child,
    ) -> Vec<usize> {
        let mut leaf_list = Vec::with_capacity(listsize.min(64));
        self.box_leafnums_r(headnode, &mut leaf_list, listsize, mins, maxs);
        leaf_list
    }

    pub fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, listsize: usize) -> Vec<usize> {
        self.box_leafnums_headnode(mins, maxs, listsize, self.world_root())
    }
}

// ============================================================
// Tests
// ============================================================
