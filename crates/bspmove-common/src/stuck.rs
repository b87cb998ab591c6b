// stuck.rs -- Position validation and recovery for boxes embedded in solid
//
// All helpers take a trace callback `(start, mins, maxs, end) -> Trace` so
// they work the same against the bare world or world plus entities.

use log::{debug, trace};

use crate::q_shared::{vector_add, vector_length_squared, vector_ma, vector_subtract, Trace, Vec3};

// ============================================================
// Good position
// ============================================================

/// True when the box fits at `origin` without overlapping anything solid.
pub fn good_position<F>(origin: &Vec3, mins: &Vec3, maxs: &Vec3, trace: F) -> bool
where
    F: Fn(&Vec3, &Vec3, &Vec3, &Vec3) -> Trace,
{
    !trace(origin, mins, maxs, origin).allsolid
}

// ============================================================
// Initial snap
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialSnap {
    pub origin: Vec3,
    /// False when no candidate fit; `origin` is then the input unchanged.
    pub snapped: bool,
}

/// Tries the origin and its 26 neighbours one unit away, in a fixed order
/// (z outermost, x innermost, each as 0, -1, +1), and keeps the first that fits.
pub fn initial_snap_position<F>(origin: &Vec3, mins: &Vec3, maxs: &Vec3, trace: F) -> InitialSnap
where
    F: Fn(&Vec3, &Vec3, &Vec3, &Vec3) -> Trace,
{
    const OFFSET: [f32; 3] = [0.0, -1.0, 1.0];

    for oz in OFFSET {
        for oy in OFFSET {
            for ox in OFFSET {
                let candidate = [origin[0] + ox, origin[1] + oy, origin[2] + oz];
                if good_position(&candidate, mins, maxs, &trace) {
                    return InitialSnap {
                        origin: candidate,
                        snapped: true,
                    };
                }
            }
        }
    }

    debug!("bad initial snap position at {:?}", origin);
    InitialSnap {
        origin: *origin,
        snapped: false,
    }
}

// ============================================================
// G_FixStuckObject
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StuckResult {
    GoodPosition,
    Fixed(Vec3),
    NoGoodPosition,
}

/// Which box bound to use per axis when flattening the box onto a face.
#[derive(Clone, Copy)]
enum Bound {
    Min,
    Zero,
    Max,
}

struct SideCheck {
    normal: [i8; 3],
    mins: [Bound; 3],
    maxs: [Bound; 3],
}

use Bound::{Max, Min, Zero};

// paired so that `i ^ 1` is always the opposite face
const SIDE_CHECKS: [SideCheck; 6] = [
    SideCheck { normal: [0, 0, 1], mins: [Min, Min, Zero], maxs: [Max, Max, Zero] },
    SideCheck { normal: [0, 0, -1], mins: [Min, Min, Zero], maxs: [Max, Max, Zero] },
    SideCheck { normal: [1, 0, 0], mins: [Zero, Min, Min], maxs: [Zero, Max, Max] },
    SideCheck { normal: [-1, 0, 0], mins: [Zero, Min, Min], maxs: [Zero, Max, Max] },
    SideCheck { normal: [0, 1, 0], mins: [Min, Zero, Min], maxs: [Max, Zero, Max] },
    SideCheck { normal: [0, -1, 0], mins: [Min, Zero, Min], maxs: [Max, Zero, Max] },
];

impl SideCheck {
    fn normal(&self) -> Vec3 {
        [self.normal[0] as f32, self.normal[1] as f32, self.normal[2] as f32]
    }

    /// The point on this face of the box placed at `origin`.
    fn face_point(&self, origin: &Vec3, mins: &Vec3, maxs: &Vec3) -> Vec3 {
        let mut p = *origin;
        for j in 0..3 {
            if self.normal[j] < 0 {
                p[j] += mins[j];
            } else if self.normal[j] > 0 {
                p[j] += maxs[j];
            }
        }
        p
    }

    /// The box flattened onto this face.
    fn flat_bounds(&self, mins: &Vec3, maxs: &Vec3) -> (Vec3, Vec3) {
        let pick = |b: Bound, j: usize| match b {
            Min => mins[j],
            Zero => 0.0,
            Max => maxs[j],
        };
        let mut lmins = [0.0f32; 3];
        let mut lmaxs = [0.0f32; 3];
        for j in 0..3 {
            lmins[j] = pick(self.mins[j], j);
            lmaxs[j] = pick(self.maxs[j], j);
        }
        (lmins, lmaxs)
    }
}

/// Tries to push a stuck box out of solid by sweeping each flattened face of
/// the box toward the opposite face and moving the box by however far that
/// face got. The smallest successful displacement wins; ties keep side order.
pub fn fix_stuck_object<F>(origin: &Vec3, mins: &Vec3, maxs: &Vec3, trace: F) -> StuckResult
where
    F: Fn(&Vec3, &Vec3, &Vec3, &Vec3) -> Trace,
{
    if !trace(origin, mins, maxs, origin).startsolid {
        return StuckResult::GoodPosition;
    }

    let mut best: Option<(f32, Vec3)> = None;

    for (i, side) in SIDE_CHECKS.iter().enumerate() {
        let (lmins, lmaxs) = side.flat_bounds(mins, maxs);
        let mut start = side.face_point(origin, mins, maxs);
        let mut tr = trace(&start, &lmins, &lmaxs, &start);

        // nudge the face along its free axes if it begins inside
        let mut nudge = [0.0f32; 3];
        if tr.startsolid {
            'axes: for j in 0..3 {
                if side.normal[j] != 0 {
                    continue;
                }
                for dir in [1.0f32, -1.0] {
                    let mut moved = start;
                    moved[j] += dir;
                    tr = trace(&moved, &lmins, &lmaxs, &moved);
                    if !tr.startsolid {
                        start = moved;
                        nudge[j] = dir;
                        break 'axes;
                    }
                }
            }
        }
        if tr.startsolid {
            continue;
        }

        let opposite = vector_add(&SIDE_CHECKS[i ^ 1].face_point(origin, mins, maxs), &nudge);
        let tr = trace(&start, &lmins, &lmaxs, &opposite);
        if tr.startsolid {
            continue;
        }

        let end = vector_ma(&tr.endpos, 0.125, &side.normal());
        let delta = vector_subtract(&end, &opposite);
        let candidate = vector_add(&vector_add(origin, &delta), &nudge);

        if trace(&candidate, mins, maxs, &candidate).startsolid {
            continue;
        }

        let distance = vector_length_squared(&delta);
        if best.map_or(true, |(d, _)| distance < d) {
            best = Some((distance, candidate));
        }
    }

    match best {
        Some((_, fixed)) => {
            trace!("unstuck {:?} -> {:?}", origin, fixed);
            StuckResult::Fixed(fixed)
        }
        None => StuckResult::NoGoodPosition,
    }
}

// ============================================================
// Snap
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapResolution {
    /// The position was already valid.
    #[default]
    Unchanged,
    /// The box was pushed out of solid.
    Fixed,
    /// Nothing fit; the previous origin was restored.
    Reverted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snap {
    pub origin: Vec3,
    pub velocity: Vec3,
    pub resolution: SnapResolution,
}

/// Settles a freshly moved box: keep it if it fits, otherwise try to push
/// it free, otherwise fall back to where it was before the move.
pub fn snap_position<F>(
    origin: &Vec3,
    velocity: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    previous_origin: &Vec3,
    trace: F,
) -> Snap
where
    F: Fn(&Vec3, &Vec3, &Vec3, &Vec3) -> Trace,
{
    if good_position(origin, mins, maxs, &trace) {
        return Snap {
            origin: *origin,
            velocity: *velocity,
            resolution: SnapResolution::Unchanged,
        };
    }

    match fix_stuck_object(origin, mins, maxs, &trace) {
        StuckResult::Fixed(fixed) => Snap {
            origin: fixed,
            velocity: *velocity,
            resolution: SnapResolution::Fixed,
        },
        // startsolid without allsolid: nothing to push against
        StuckResult::GoodPosition => Snap {
            origin: *origin,
            velocity: *velocity,
            resolution: SnapResolution::Unchanged,
        },
        StuckResult::NoGoodPosition => {
            debug!("snap reverted {:?} -> {:?}", origin, previous_origin);
            Snap {
                origin: *previous_origin,
                velocity: *velocity,
                resolution: SnapResolution::Reverted,
            }
        }
    }
}

// ============================================================
// Tests
// ============================================================
