//! Elevation reconstruction from residual pyramids, end to end.

use std::sync::Arc;

use approx::assert_abs_diff_eq;
use proland_core::TileCoord;
use proland_dem::upsample::{child_offset, upsample};
use proland_dem::{
    ElevationProducer, ElevationProducerConfig, ResidualEditor, ResidualFile, ResidualHeader,
    ResidualProducer, ResidualWriter,
};
use proland_producer::{CpuTileStorage, Deadline, InlineScheduler, Producer, Scheduler, TileCache};

const TILE_SIZE: u32 = 8;
const SAMPLES: usize = TILE_SIZE as usize + 5;

fn sample(level: u32, tx: u32, ty: u32, i: usize, j: usize) -> i16 {
    let h = i * 31 + j * 17 + (level * 7 + tx * 3 + ty * 5) as usize;
    (h % 21) as i16 - 10
}

fn residual_producer(max_level: u32, scale: f32) -> Producer {
    let header = ResidualHeader::new(0, max_level, TILE_SIZE, scale);
    let mut writer = ResidualWriter::new(header);
    for level in 0..=max_level {
        for ty in 0..1u32 << level {
            for tx in 0..1u32 << level {
                let mut tile = Vec::with_capacity(SAMPLES * SAMPLES);
                for j in 0..SAMPLES {
                    for i in 0..SAMPLES {
                        tile.push(sample(level, tx, ty, i, j));
                    }
                }
                writer.set_tile(level, tx, ty, &tile).unwrap();
            }
        }
    }
    let file = ResidualFile::from_bytes(writer.to_bytes().unwrap().into()).unwrap();
    let cache = Arc::new(TileCache::new(
        "residuals",
        Arc::new(CpuTileStorage::<f32>::new(SAMPLES as u32, 1, 32)),
    ));
    Producer::new(ResidualProducer::new("residuals", cache, file).unwrap())
}

fn elevation_producer(residuals: &Producer, max_level: u32) -> Producer {
    let config = ElevationProducerConfig::default()
        .with_tile_size(TILE_SIZE)
        .with_capacity(32)
        .with_max_level(max_level);
    Producer::new(ElevationProducer::from_config(&config, Some(residuals.clone()), None).unwrap())
}

fn elevation(p: &Producer, coord: TileCoord) -> Vec<f32> {
    let tile = p.get_tile(coord, Deadline::IMMEDIATE).unwrap();
    InlineScheduler.schedule(p.task_graph(&tile));
    assert!(tile.is_ready(), "{coord} was not produced");
    let values = p
        .downcast_ref::<ElevationProducer>()
        .unwrap()
        .read_tile(&tile)
        .unwrap();
    p.put_tile(&tile);
    values
}

fn residual(p: &Producer, coord: TileCoord) -> Vec<f32> {
    p.downcast_ref::<ResidualProducer>()
        .unwrap()
        .read_tile(coord)
        .unwrap()
}

#[test]
fn level_zero_is_the_residual_tile() {
    let residuals = residual_producer(2, 0.5);
    let p = elevation_producer(&residuals, 2);
    assert_eq!(elevation(&p, TileCoord::ROOT), residual(&residuals, TileCoord::ROOT));
}

#[test]
fn children_are_upsampled_parents_plus_residuals() {
    let residuals = residual_producer(2, 0.5);
    let p = elevation_producer(&residuals, 2);
    for level in 1..=2 {
        for ty in 0..1u32 << level {
            for tx in 0..1u32 << level {
                let coord = TileCoord::new(level, tx, ty);
                let parent = coord.parent().unwrap();
                let mut expected = vec![0.0; SAMPLES * SAMPLES];
                upsample(
                    &elevation(&p, parent),
                    SAMPLES,
                    child_offset(coord, TILE_SIZE),
                    &mut expected,
                    SAMPLES,
                )
                .unwrap();
                for (e, r) in expected.iter_mut().zip(residual(&residuals, coord)) {
                    *e += r;
                }
                let actual = elevation(&p, coord);
                for (a, e) in actual.iter().zip(&expected) {
                    assert_abs_diff_eq!(*a, *e, epsilon = 1e-4);
                }
            }
        }
    }
}

#[test]
fn every_answered_residual_tile_is_declared() {
    let residuals = residual_producer(2, 1.0);
    for level in 0..=4 {
        for ty in 0..1u32 << level {
            for tx in 0..1u32 << level {
                let coord = TileCoord::new(level, tx, ty);
                let declared = residuals.has_tile(coord);
                assert_eq!(declared, level <= 2, "{coord}");
                if declared {
                    let tile = residuals.get_tile(coord, Deadline::IMMEDIATE).unwrap();
                    InlineScheduler.schedule(residuals.task_graph(&tile));
                    assert!(tile.is_ready());
                    residuals.put_tile(&tile);
                }
            }
        }
    }
}

#[test]
fn edits_reach_elevation_and_spare_neighbors() {
    let residuals = residual_producer(2, 1.0);
    let p = elevation_producer(&residuals, 2);
    let edited = TileCoord::new(2, 1, 2);
    let neighbors = [TileCoord::new(2, 0, 2), TileCoord::new(2, 2, 2), TileCoord::new(2, 1, 3)];

    let before = elevation(&p, edited);
    let neighbors_before: Vec<_> = neighbors.iter().map(|&c| elevation(&p, c)).collect();

    let editor = ResidualEditor::new(residuals).unwrap();
    editor.attach_elevation(p.clone());
    editor.edit_region(edited, (5, 5), (3, 3), 5.0).unwrap();
    let report = editor.update_residuals().unwrap();
    assert!(report.edited.contains(&edited));
    assert!(report.edited.contains(&TileCoord::ROOT));

    let after = elevation(&p, edited);
    for j in 0..SAMPLES {
        for i in 0..SAMPLES {
            let dz = if (5..8).contains(&i) && (5..8).contains(&j) { 5.0 } else { 0.0 };
            let k = j * SAMPLES + i;
            assert_abs_diff_eq!(after[k], before[k] + dz, epsilon = 1e-3);
        }
    }
    for (coord, before) in neighbors.iter().zip(&neighbors_before) {
        let after = elevation(&p, *coord);
        for (a, b) in after.iter().zip(before) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
        }
    }

    editor.reset();
    let restored = elevation(&p, edited);
    for (r, b) in restored.iter().zip(&before) {
        assert_abs_diff_eq!(*r, *b, epsilon = 1e-4);
    }
}
