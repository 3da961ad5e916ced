//! Quadtree subdivision and horizon occlusion over whole updates.

use approx::assert_relative_eq;
use glam::{DVec2, DVec3};
use proland_core::{TileCoord, Visibility};
use proland_terrain::{CameraView, TerrainNode, TerrainNodeConfig, TerrainQuad};

fn view(eye: DVec3, target: DVec3, up: DVec3) -> CameraView {
    CameraView::look_at(
        eye,
        target,
        up,
        80f64.to_radians(),
        DVec2::new(1024.0, 1024.0),
        1.0,
        1e6,
    )
}

fn assert_occlusion_is_propagated(quad: &TerrainQuad) {
    if let Some(children) = quad.children() {
        assert_eq!(
            quad.occluded,
            children.iter().all(|c| c.occluded),
            "{} occlusion disagrees with its children",
            quad.coord
        );
        children.iter().for_each(assert_occlusion_is_propagated);
    } else if quad.occluded {
        assert_eq!(quad.visible, Visibility::Invisible);
    }
}

#[test]
fn root_splits_once_for_a_high_camera() {
    // Root of side 50 000; the children stop splitting once the camera is
    // further than their side times the split distance (2).
    let config = TerrainNodeConfig::default()
        .with_size(25_000.0)
        .with_split_factor(2.0)
        .with_max_level(3);
    let mut node = TerrainNode::new(config);
    node.update(&view(DVec3::new(0.0, 0.0, 60_000.0), DVec3::ZERO, DVec3::Y));

    assert_relative_eq!(node.split_distance(), 2.0, epsilon = 1e-9);
    let children = node.root().children().expect("root should be subdivided");
    assert!(children.iter().all(TerrainQuad::is_leaf));
    assert_eq!(node.root().count(), 5);
    for child in children {
        assert!(node.camera_dist(&child.local_box()) >= child.l * node.split_distance());
    }

    // At 10 000 m the children touching the point under the camera are only
    // 10 000 m away, below 25 000 × 2, so they split as well.
    node.update(&view(DVec3::new(0.0, 0.0, 10_000.0), DVec3::ZERO, DVec3::Y));
    let children = node.root().children().expect("root should be subdivided");
    assert!(children.iter().any(|c| !c.is_leaf()));
    assert!(node.root().count() > 5);
}

#[test]
fn a_cliff_hides_the_quads_behind_it() {
    let config = TerrainNodeConfig::default().with_size(1000.0).with_max_level(3);
    let mut node = TerrainNode::new(config);
    let camera = view(
        DVec3::new(0.0, -1100.0, 50.0),
        DVec3::new(0.0, 1000.0, 50.0),
        DVec3::Z,
    );
    node.update(&camera);
    assert!(!node.horizon().is_enabled());

    // A 200 m cliff over the first quarter of the terrain.
    node.root_mut().visit_mut(&mut |q| {
        let (zmin, zmax) = if q.oy + q.l <= -500.0 {
            (200.0, 200.0)
        } else if q.oy >= -500.0 {
            (0.0, 0.0)
        } else {
            (0.0, 200.0)
        };
        q.zmin = zmin;
        q.zmax = zmax;
    });
    node.update(&camera);
    assert!(node.horizon().is_enabled());

    let near = node.root().find(TileCoord::new(3, 4, 0)).expect("near quad");
    assert!(near.is_leaf());
    assert!(near.is_visible());
    assert!(!near.occluded);

    let far = node.root().find(TileCoord::new(2, 2, 3)).expect("far quad");
    assert!(far.is_leaf());
    assert!(far.occluded);
    assert_eq!(far.visible, Visibility::Invisible);

    assert_occlusion_is_propagated(node.root());
}
