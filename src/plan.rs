//! Batch planning: anchor set generation, dependency wiring, priority order
//!
//! The planner is pure. Given an origin, a fan-out radius, and map bounds it
//! produces the anchor set, the dependency tree rooted at the origin, and a
//! deterministic priority order the scheduler consumes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::anchor::{Anchor, AnchorId, AnchorStatus, Priority};
use crate::tile::{MapBounds, TileCoord};

/// Min/max tile coordinates over all anchor footprints, clipped to the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageBounds {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

/// Output of the planner
#[derive(Debug, Clone)]
pub struct BatchPlan {
    /// Every planned anchor, keyed by id
    pub anchors: HashMap<AnchorId, Anchor>,
    /// Anchor ids in priority order (earliest first)
    pub priority_order: Vec<AnchorId>,
    /// Coverage of all anchor footprints, `None` for empty plans
    pub coverage: Option<CoverageBounds>,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }
}

/// Priority triple for an offset from the origin.
fn priority_for(u: i32, v: i32) -> Priority {
    let bucket = match (u, v) {
        (0, 0) => 0,
        (_, 0) => 1,
        (0, _) => 2,
        _ => 3,
    };
    // Quadrants use tile orientation (y grows downward): north is v < 0.
    let quadrant = if bucket == 3 {
        match (u > 0, v < 0) {
            (true, true) => 0,   // NE
            (false, true) => 1,  // NW
            (true, false) => 2,  // SE
            (false, false) => 3, // SW
        }
    } else {
        4
    };
    Priority {
        distance: u.unsigned_abs() + v.unsigned_abs(),
        bucket,
        quadrant,
    }
}

/// Full comparable sort key realizing the priority total order.
///
/// After distance and bucket, the per-bucket tie-breaks are: axes order by
/// `|offset|` with the positive side first; interior orders by quadrant, then
/// ring `max(|u|, |v|)`, then `|u|`. Final tie-break is `v`, then `u`.
fn sort_key(a: &Anchor) -> (u32, u8, u32, u32, u32, i32, i32) {
    let p = a.priority;
    let (k1, k2, k3) = match p.bucket {
        0 => (0, 0, 0),
        1 => (a.u.unsigned_abs(), u32::from(a.u < 0), 0),
        2 => (a.v.unsigned_abs(), u32::from(a.v < 0), 0),
        _ => (
            p.quadrant as u32,
            a.u.unsigned_abs().max(a.v.unsigned_abs()),
            a.u.unsigned_abs(),
        ),
    };
    (p.distance, p.bucket, k1, k2, k3, a.v, a.u)
}

/// Build the anchor plan for a batch run.
///
/// Enumerates offsets `(u, v)` with `|u|, |v| <= layers`, drops centers whose
/// tile `(origin + 2u, origin + 2v)` falls outside the map, and wires each
/// non-origin anchor to the anchor one step closer to the origin along both
/// axes. Negative `layers` or an out-of-bounds origin yield an empty plan.
pub fn build_plan(origin: TileCoord, layers: i32, bounds: MapBounds) -> BatchPlan {
    let mut anchors: HashMap<AnchorId, Anchor> = HashMap::new();

    if layers >= 0 && bounds.contains(origin) {
        for v in -layers..=layers {
            for u in -layers..=layers {
                let center = TileCoord::new(origin.x + 2 * u, origin.y + 2 * v);
                if !bounds.contains(center) {
                    continue;
                }
                let id = AnchorId::new(u, v);
                anchors.insert(
                    id,
                    Anchor {
                        id,
                        u,
                        v,
                        x: center.x,
                        y: center.y,
                        deps: Vec::new(),
                        dependents: Vec::new(),
                        priority: priority_for(u, v),
                        status: AnchorStatus::Pending,
                        attempts: 0,
                        wave: None,
                        started_at: None,
                        finished_at: None,
                        blocked_by: None,
                        error: None,
                    },
                );
            }
        }
    }

    // Dependency edges: one step toward the origin along both axes. Edges to
    // anchors outside the plan are dropped, so the result is a tree rooted at
    // the origin.
    let ids: Vec<AnchorId> = anchors.keys().copied().collect();
    for id in &ids {
        if id.u == 0 && id.v == 0 {
            continue;
        }
        let dep = AnchorId::new(id.u - id.u.signum(), id.v - id.v.signum());
        if anchors.contains_key(&dep) {
            if let Some(a) = anchors.get_mut(id) {
                a.deps.push(dep);
            }
            if let Some(d) = anchors.get_mut(&dep) {
                d.dependents.push(*id);
            }
        }
    }
    // Deterministic reverse-edge order regardless of map iteration.
    for a in anchors.values_mut() {
        a.dependents.sort();
    }

    let mut priority_order: Vec<AnchorId> = anchors.keys().copied().collect();
    priority_order.sort_by_key(|id| sort_key(&anchors[id]));

    let coverage = coverage_of(&anchors, bounds);

    BatchPlan {
        anchors,
        priority_order,
        coverage,
    }
}

fn coverage_of(anchors: &HashMap<AnchorId, Anchor>, bounds: MapBounds) -> Option<CoverageBounds> {
    let mut cov: Option<CoverageBounds> = None;
    for anchor in anchors.values() {
        for tile in anchor.footprint(bounds) {
            cov = Some(match cov {
                None => CoverageBounds {
                    min_x: tile.x,
                    min_y: tile.y,
                    max_x: tile.x,
                    max_y: tile.y,
                },
                Some(c) => CoverageBounds {
                    min_x: c.min_x.min(tile.x),
                    min_y: c.min_y.min(tile.y),
                    max_x: c.max_x.max(tile.x),
                    max_y: c.max_y.max(tile.y),
                },
            });
        }
    }
    cov
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(pairs: &[(i32, i32)]) -> Vec<AnchorId> {
        pairs.iter().map(|&(u, v)| AnchorId::new(u, v)).collect()
    }

    #[test]
    fn single_layer_priority_order() {
        let plan = build_plan(TileCoord::new(20, 20), 1, MapBounds::new(64, 64));
        assert_eq!(plan.len(), 9);
        assert_eq!(
            plan.priority_order,
            ids(&[
                (0, 0),
                (1, 0),
                (-1, 0),
                (0, 1),
                (0, -1),
                (1, -1),
                (-1, -1),
                (1, 1),
                (-1, 1),
            ])
        );
    }

    #[test]
    fn two_layer_order_is_deterministic_and_stable() {
        let a = build_plan(TileCoord::new(20, 20), 2, MapBounds::new(64, 64));
        let b = build_plan(TileCoord::new(20, 20), 2, MapBounds::new(64, 64));
        assert_eq!(a.priority_order, b.priority_order);
        assert_eq!(a.len(), 25);

        // Distance-2 block: axes before interior, NE quadrant first.
        let d2: Vec<AnchorId> = a.priority_order[5..13].to_vec();
        assert_eq!(
            d2,
            ids(&[
                (2, 0),
                (-2, 0),
                (0, 2),
                (0, -2),
                (1, -1),
                (-1, -1),
                (1, 1),
                (-1, 1),
            ])
        );

        // Distance-3 block: interior only, quadrant-major then ring then |u|.
        let d3: Vec<AnchorId> = a.priority_order[13..21].to_vec();
        assert_eq!(
            d3,
            ids(&[
                (1, -2),
                (2, -1),
                (-1, -2),
                (-2, -1),
                (1, 2),
                (2, 1),
                (-1, 2),
                (-2, 1),
            ])
        );
    }

    #[test]
    fn dependency_tree_points_toward_origin() {
        let plan = build_plan(TileCoord::new(20, 20), 2, MapBounds::new(64, 64));
        let origin = &plan.anchors[&AnchorId::new(0, 0)];
        assert!(origin.deps.is_empty());

        let diag = &plan.anchors[&AnchorId::new(2, 2)];
        assert_eq!(diag.deps, vec![AnchorId::new(1, 1)]);

        let axis = &plan.anchors[&AnchorId::new(-2, 0)];
        assert_eq!(axis.deps, vec![AnchorId::new(-1, 0)]);

        let mixed = &plan.anchors[&AnchorId::new(1, -2)];
        assert_eq!(mixed.deps, vec![AnchorId::new(0, -1)]);

        // Every non-origin anchor has exactly one in-plan parent here.
        for a in plan.anchors.values() {
            if a.u == 0 && a.v == 0 {
                continue;
            }
            assert_eq!(a.deps.len(), 1, "anchor {}", a.id);
        }
    }

    #[test]
    fn out_of_bounds_centers_are_dropped_and_edges_rewired() {
        // Origin near the corner: negative offsets fall off the map.
        let plan = build_plan(TileCoord::new(1, 1), 2, MapBounds::new(64, 64));
        assert!(!plan.anchors.contains_key(&AnchorId::new(-1, 0)));
        assert!(plan.anchors.contains_key(&AnchorId::new(2, 2)));
        // (-1, 0) is missing, so (-2, 0) is missing too; nothing depends on a
        // dropped anchor.
        for a in plan.anchors.values() {
            for dep in &a.deps {
                assert!(plan.anchors.contains_key(dep));
            }
        }
    }

    #[test]
    fn empty_plans() {
        assert!(build_plan(TileCoord::new(100, 100), 1, MapBounds::new(64, 64)).is_empty());
        assert!(build_plan(TileCoord::new(20, 20), -1, MapBounds::new(64, 64)).is_empty());
        assert_eq!(
            build_plan(TileCoord::new(100, 100), 1, MapBounds::new(64, 64)).coverage,
            None
        );
    }

    #[test]
    fn zero_layers_is_just_the_origin() {
        let plan = build_plan(TileCoord::new(20, 20), 0, MapBounds::new(64, 64));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.priority_order, ids(&[(0, 0)]));
        let cov = plan.coverage.unwrap();
        assert_eq!((cov.min_x, cov.min_y, cov.max_x, cov.max_y), (19, 19, 21, 21));
    }

    #[test]
    fn coverage_clips_to_map() {
        let plan = build_plan(TileCoord::new(0, 0), 0, MapBounds::new(64, 64));
        let cov = plan.coverage.unwrap();
        assert_eq!((cov.min_x, cov.min_y), (0, 0));
        assert_eq!((cov.max_x, cov.max_y), (1, 1));
    }
}
