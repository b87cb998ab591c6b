// cmtrace.rs -- Swept box traces against a collision model
//
// Brush clipping is not parallelized:
// 1. brushes shared by several leafs are deduplicated through the visit set
// 2. the early exit on `fraction == 0` depends on earlier brushes
// 3. most traces only touch a handful of brushes

use std::cell::RefCell;

use crate::cmodel::{Child, CollisionModel};
use crate::q_shared::{dot_product, vector_subtract, CPlane, Contents, Trace, Vec3};

// ============================================================
// Constants
// ============================================================

/// 1/32 epsilon to keep floating point happy.
pub const DIST_EPSILON: f32 = 0.03125;

/// Leaf list cap for position tests.
const MAX_POSITION_LEAFS: usize = 1024;

// ============================================================
// Brush deduplication
// ============================================================

/// Remembers which brushes the current trace already clipped against.
///
/// Each trace bumps the generation instead of clearing the stamps, so a
/// set can be reused across models and traces without any reset cost.
#[derive(Debug, Clone, Default)]
pub struct BrushVisitSet {
    stamps: Vec<u32>,
    generation: u32,
}

impl BrushVisitSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&mut self, numbrushes: usize) {
        if self.stamps.len() < numbrushes {
            self.stamps.resize(numbrushes, 0);
        }
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            self.stamps.iter_mut().for_each(|s| *s = 0);
            self.generation = 1;
        }
    }

    /// Returns false if `brush` was already visited during this trace.
    fn mark(&mut self, brush: usize) -> bool {
        if self.stamps[brush] == self.generation {
            return false;
        }
        self.stamps[brush] = self.generation;
        true
    }
}

thread_local! {
    static VISITED: RefCell<BrushVisitSet> = RefCell::new(BrushVisitSet::new());
}

// ============================================================
// Plane / brush helpers
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneSide {
    Front,
    Back,
    Cross,
}

/// Classifies a point against a plane, treating `|dist| <= epsilon` as on it.
pub fn point_on_plane_side(p: &Vec3, plane: &CPlane, epsilon: f32) -> PlaneSide {
    let dist = dot_product(&plane.normal, p) - plane.dist;
    if dist > epsilon {
        PlaneSide::Front
    } else if dist < -epsilon {
        PlaneSide::Back
    } else {
        PlaneSide::Cross
    }
}

/// A point is inside when it is behind (or within `epsilon` of) every side.
pub fn point_inside_brush(model: &CollisionModel, brush_idx: usize, p: &Vec3, epsilon: f32) -> bool {
    let brush = &model.brushes[brush_idx];
    model.brush_sides(brush).iter().all(|side| {
        let plane = &model.planes[side.plane_idx];
        dot_product(&plane.normal, p) - plane.dist <= epsilon
    })
}

/// Distance of `plane` pushed out by the box corner that touches it first.
#[inline]
fn box_plane_dist(plane: &CPlane, mins: &Vec3, maxs: &Vec3) -> f32 {
    let mut ofs = [0.0f32; 3];
    for j in 0..3 {
        ofs[j] = if plane.normal[j] < 0.0 { maxs[j] } else { mins[j] };
    }
    plane.dist - dot_product(&ofs, &plane.normal)
}

/// Clips the sweep `p1 -> p2` of the box against one brush, tightening
/// `trace` when the brush is hit earlier than anything seen so far.
#[allow(clippy::too_many_arguments)]
pub fn clip_box_to_brush(
    model: &CollisionModel,
    brush_idx: usize,
    mins: &Vec3,
    maxs: &Vec3,
    p1: &Vec3,
    p2: &Vec3,
    trace_ispoint: bool,
    trace: &mut Trace,
) {
    let brush = &model.brushes[brush_idx];
    if brush.numsides == 0 {
        return;
    }

    let mut enterfrac: f32 = -1.0;
    let mut leavefrac: f32 = 1.0;
    let mut clipplane: Option<CPlane> = None;
    let mut leadside = None;

    let mut getout = false;
    let mut startout = false;

    for side in model.brush_sides(brush) {
        let plane = &model.planes[side.plane_idx];

        let dist = if trace_ispoint {
            plane.dist
        } else {
            box_plane_dist(plane, mins, maxs)
        };

        let d1 = dot_product(p1, &plane.normal) - dist;
        let d2 = dot_product(p2, &plane.normal) - dist;

        if d2 > 0.0 {
            getout = true; // endpoint is not in solid
        }
        if d1 > 0.0 {
            startout = true;
        }

        // completely in front of face, no intersection
        if d1 > 0.0 && d2 >= d1 {
            return;
        }
        if d1 <= 0.0 && d2 <= 0.0 {
            continue;
        }

        if d1 > d2 {
            // enter
            let f = (d1 - DIST_EPSILON) / (d1 - d2);
            if f > enterfrac {
                enterfrac = f;
                clipplane = Some(*plane);
                leadside = Some(side);
            }
        } else {
            // leave
            let f = (d1 + DIST_EPSILON) / (d1 - d2);
            if f < leavefrac {
                leavefrac = f;
            }
        }
    }

    if !startout {
        // original point was inside brush
        trace.startsolid = true;
        if !getout {
            trace.allsolid = true;
        }
        return;
    }

    if enterfrac < leavefrac && enterfrac > -1.0 && enterfrac < trace.fraction {
        trace.fraction = enterfrac.max(0.0);
        trace.plane = clipplane;
        trace.surface_flags = leadside.map(|s| s.surface_flags).unwrap_or_default();
        trace.contents = brush.contents;
    }
}

/// Stationary version of `clip_box_to_brush`: marks the trace fully solid
/// when the box at `p1` overlaps the brush.
pub fn test_box_in_brush(
    model: &CollisionModel,
    brush_idx: usize,
    mins: &Vec3,
    maxs: &Vec3,
    p1: &Vec3,
    trace: &mut Trace,
) {
    let brush = &model.brushes[brush_idx];
    if brush.numsides == 0 {
        return;
    }

    for side in model.brush_sides(brush) {
        let plane = &model.planes[side.plane_idx];
        let d1 = dot_product(p1, &plane.normal) - box_plane_dist(plane, mins, maxs);

        // if completely in front of face, no intersection
        if d1 > 0.0 {
            return;
        }
    }

    // inside this brush
    trace.startsolid = true;
    trace.allsolid = true;
    trace.fraction = 0.0;
    trace.contents = brush.contents;
}

// ============================================================
// Tree walk
// ============================================================

/// Per-call trace parameters.
struct TraceWork<'a> {
    model: &'a CollisionModel,
    visited: &'a mut BrushVisitSet,
    start: Vec3,
    end: Vec3,
    mins: Vec3,
    maxs: Vec3,
    extents: Vec3,
    contents: Contents,
    ispoint: bool,
    trace: Trace,
}

impl TraceWork<'_> {
    fn trace_to_leaf(&mut self, leafnum: usize) {
        let model = self.model;
        let leaf = &model.leafs[leafnum];

        for &brushnum in model.leaf_brushes(leaf) {
            if !self.visited.mark(brushnum) {
                continue; // already checked this brush in another leaf
            }
            if !model.brushes[brushnum].contents.intersects(self.contents) {
                continue;
            }
            clip_box_to_brush(
                model,
                brushnum,
                &self.mins,
                &self.maxs,
                &self.start,
                &self.end,
                self.ispoint,
                &mut self.trace,
            );
            if self.trace.fraction == 0.0 {
                return;
            }
        }
    }

    fn test_in_leaf(&mut self, leafnum: usize) {
        let model = self.model;
        let leaf = &model.leafs[leafnum];

        for &brushnum in model.leaf_brushes(leaf) {
            if !self.visited.mark(brushnum) {
                continue;
            }
            if !model.brushes[brushnum].contents.intersects(self.contents) {
                continue;
            }
            test_box_in_brush(
                model,
                brushnum,
                &self.mins,
                &self.maxs,
                &self.start,
                &mut self.trace,
            );
            if self.trace.fraction == 0.0 {
                return;
            }
        }
    }

    fn recursive_hull_check(&mut self, num: Child, p1f: f32, p2f: f32, p1: &Vec3, p2: &Vec3) {
        if self.trace.fraction <= p1f {
            return; // already hit something nearer
        }

        let n = match num {
            Child::Leaf(l) => {
                self.trace_to_leaf(l);
                return;
            }
            Child::Node(n) => n,
        };

        // find the point distances to the separating plane
        // and the offset for the size of the box
        let node = self.model.nodes[n];
        let plane = &self.model.planes[node.plane_idx];

        let (t1, t2, offset);
        if plane.plane_type < 3 {
            let pt = plane.plane_type as usize;
            t1 = p1[pt] - plane.dist;
            t2 = p2[pt] - plane.dist;
            offset = self.extents[pt];
        } else {
            t1 = dot_product(&plane.normal, p1) - plane.dist;
            t2 = dot_product(&plane.normal, p2) - plane.dist;
            offset = if self.ispoint {
                0.0
            } else {
                (self.extents[0] * plane.normal[0]).abs()
                    + (self.extents[1] * plane.normal[1]).abs()
                    + (self.extents[2] * plane.normal[2]).abs()
            };
        }

        // see which sides we need to consider
        if t1 >= offset && t2 >= offset {
            self.recursive_hull_check(node.children[0], p1f, p2f, p1, p2);
            return;
        }
        if t1 < -offset && t2 < -offset {
            self.recursive_hull_check(node.children[1], p1f, p2f, p1, p2);
            return;
        }

        // put the crosspoint DIST_EPSILON pixels on the near side
        let (side, frac, frac2);
        if t1 < t2 {
            let idist = 1.0 / (t1 - t2);
            side = 1usize;
            frac = ((t1 - offset + DIST_EPSILON) * idist).clamp(0.0, 1.0);
            frac2 = ((t1 + offset + DIST_EPSILON) * idist).clamp(0.0, 1.0);
        } else if t1 > t2 {
            let idist = 1.0 / (t1 - t2);
            side = 0usize;
            frac = ((t1 + offset + DIST_EPSILON) * idist).clamp(0.0, 1.0);
            frac2 = ((t1 - offset - DIST_EPSILON) * idist).clamp(0.0, 1.0);
        } else {
            side = 0;
            frac = 1.0;
            frac2 = 0.0;
        }

        // move up to the node
        let midf = p1f + (p2f - p1f) * frac;
        let mid = lerp_point(p1, p2, frac);
        self.recursive_hull_check(node.children[side], p1f, midf, p1, &mid);

        // go past the node
        let midf2 = p1f + (p2f - p1f) * frac2;
        let mid2 = lerp_point(p1, p2, frac2);
        self.recursive_hull_check(node.children[side ^ 1], midf2, p2f, &mid2, p2);
    }
}

#[inline]
fn lerp_point(p1: &Vec3, p2: &Vec3, frac: f32) -> Vec3 {
    [
        p1[0] + frac * (p2[0] - p1[0]),
        p1[1] + frac * (p2[1] - p1[1]),
        p1[2] + frac * (p2[2] - p1[2]),
    ]
}

// ============================================================
// Box traces
// ============================================================

impl CollisionModel {
    /// Sweeps the box `mins..maxs` from `start` to `end` through the tree
    /// under `headnode`, only colliding with brushes in `brushmask`.
    ///
    /// When `start == end` this is a position test: the trace comes back
    /// with `startsolid`/`allsolid` set and `fraction == 0` if the box
    /// overlaps anything.
    #[allow(clippy::too_many_arguments)]
    pub fn box_trace_with(
        &self,
        visited: &mut BrushVisitSet,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: Child,
        brushmask: Contents,
    ) -> Trace {
        visited.begin(self.brushes.len());

        let mut work = TraceWork {
            model: self,
            visited,
            start: *start,
            end: *end,
            mins: *mins,
            maxs: *maxs,
            extents: [0.0; 3],
            contents: brushmask,
            ispoint: false,
            trace: Trace::default(),
        };

        // check for position test special case
        if start == end {
            let c1 = [
                start[0] + mins[0] - 1.0,
                start[1] + mins[1] - 1.0,
                start[2] + mins[2] - 1.0,
            ];
            let c2 = [
                start[0] + maxs[0] + 1.0,
                start[1] + maxs[1] + 1.0,
                start[2] + maxs[2] + 1.0,
            ];

            let leafs = self.box_leafnums_headnode(&c1, &c2, MAX_POSITION_LEAFS, headnode);
            for leafnum in leafs {
                work.test_in_leaf(leafnum);
                if work.trace.allsolid {
                    break;
                }
            }
            work.trace.endpos = *start;
            return work.trace;
        }

        // check for point special case
        if *mins == [0.0; 3] && *maxs == [0.0; 3] {
            work.ispoint = true;
        } else {
            for i in 0..3 {
                work.extents[i] = (-mins[i]).max(maxs[i]);
            }
        }

        // general sweeping through world
        work.recursive_hull_check(headnode, 0.0, 1.0, start, end);

        let mut trace = work.trace;
        if trace.fraction == 1.0 {
            trace.endpos = *end;
        } else {
            trace.endpos = lerp_point(start, end, trace.fraction);
        }
        trace
    }

    /// `box_trace_with` using a visit set kept per thread.
    pub fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: Child,
        brushmask: Contents,
    ) -> Trace {
        VISITED.with(|v| {
            self.box_trace_with(&mut v.borrow_mut(), start, end, mins, maxs, headnode, brushmask)
        })
    }

    /// Traces against a model placed at `origin`. Brush movers translate
    /// but never rotate, so this is a pure offset.
    #[allow(clippy::too_many_arguments)]
    pub fn transformed_box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: Child,
        brushmask: Contents,
        origin: &Vec3,
    ) -> Trace {
        let start_l = vector_subtract(start, origin);
        let end_l = vector_subtract(end, origin);

        let mut trace = self.box_trace(&start_l, &end_l, mins, maxs, headnode, brushmask);

        // plane distances move with the model
        if let Some(plane) = trace.plane.as_mut() {
            plane.dist += dot_product(&plane.normal, origin);
        }
        trace.endpos = if trace.fraction == 1.0 {
            *end
        } else {
            lerp_point(start, end, trace.fraction)
        };
        trace
    }

    pub fn transformed_point_contents(&self, p: &Vec3, headnode: Child, origin: &Vec3) -> Contents {
        let p_l = vector_subtract(p, origin);
        self.point_contents(&p_l, headnode)
    }
}

/// Traces a box through the world model.
pub fn trace(
    model: &CollisionModel,
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    mask: Contents,
) -> Trace {
    model.box_trace(start, end, mins, maxs, model.world_root(), mask)
}

// ============================================================
// Tests
// ============================================================
