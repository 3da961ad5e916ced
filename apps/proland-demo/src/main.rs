//! Proland headless demo
//!
//! Builds a synthetic residual pyramid in memory, reconstructs elevation
//! tiles from it and flies a camera over the resulting terrain, refining the
//! quadtree, scheduling tile production and reading elevation ranges back
//! every frame. Halfway through, an edit raises part of the terrain.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p proland-demo -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--config <PATH>`: JSON descriptor; missing fields take their defaults
//! - `--frames <N>`: Number of frames to fly (default: 120)
//! - `--seed <N>`: Seed of the synthetic terrain (default: 42)
//! - `--sync`: Produce every tile in the frame that needs it
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod config;
mod scene;

use glam::{DVec3, Vec3};
use proland_particles::{ParticleProducer, WorldLayer};
use proland_producer::{FrameScheduler, RunReport, Scheduler};
use proland_terrain::{
    DrawPass, TerrainNode, TerrainViewController, TileSamplerZ, ViewController,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::DemoConfig;
use crate::scene::Pipeline;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DemoConfig::from_args()?;
    run(&config)
}

#[derive(Debug, Default)]
struct FlightStats {
    tasks: RunReport,
    draws: usize,
    max_quads: usize,
    particles_added: usize,
    particles_removed: usize,
}

fn run(config: &DemoConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(config)?;
    let mut terrain = TerrainNode::new(config.terrain.clone());
    let mut sampler = TileSamplerZ::new(pipeline.elevation.clone(), config.sampler.clone())?;
    let scheduler = FrameScheduler::new(config.scheduler.clone());
    let mut particles = ParticleProducer::from_config(&config.particles)?;

    let flight = &config.flight;
    let size = config.terrain.size;
    let mut controller = TerrainViewController::new(0.0, -0.6 * size, flight.distance)
        .with_angles(flight.tilt.to_radians(), 0.0);
    let mut stats = FlightStats::default();

    info!(
        frames = flight.frames,
        size,
        max_level = config.terrain.max_level,
        async_tiles = config.sampler.async_mode,
        "Starting flight"
    );

    for frame in 0..flight.frames {
        controller.move_by(0.0, flight.speed * flight.dt);
        terrain.update(&controller.view());

        scheduler.schedule(sampler.update(&terrain, frame));
        let run = scheduler.run_frame(frame);
        stats.tasks.done += run.done;
        stats.tasks.failed += run.failed;
        stats.tasks.skipped += run.skipped;

        sampler.read_back(&mut terrain);
        controller.set_ground_height(terrain.ground_height());

        let draws = DrawPass::new([sampler.sampler()]).run(&mut terrain);
        stats.draws += draws.len();
        sampler.end_frame();

        spawn_particles(&mut particles, config.spawn_rate, frame, controller.position());
        let update = particles.update(flight.dt);
        stats.particles_added += update.added;
        stats.particles_removed += update.removed;

        if config.edit.frame == Some(frame) {
            pipeline.raise_tile_at(
                config.edit.level,
                size,
                (controller.x0, controller.y0 + flight.distance),
                config.edit.dz,
            )?;
        }

        let quads = terrain.root().count();
        stats.max_quads = stats.max_quads.max(quads);
        if flight.report_every > 0 && frame % flight.report_every == 0 {
            let mut visible = 0;
            terrain.root().visit(&mut |q| visible += usize::from(q.is_visible() && q.is_leaf()));
            let cache = pipeline.elevation.cache().stats();
            info!(
                frame,
                quads,
                visible,
                draws = draws.len(),
                ground = terrain.ground_height(),
                tasks = run.done,
                held = sampler.sampler().held(),
                cache_hits = cache.hits,
                cache_misses = cache.misses,
                particles = particles.storage().len(),
                "Frame"
            );
        } else {
            debug!(frame, quads, draws = draws.len(), tasks = run.done, "Frame");
        }
    }

    let elevation = pipeline.elevation.cache().stats();
    let residuals = pipeline.residuals.cache().stats();
    info!(
        tasks_done = stats.tasks.done,
        tasks_failed = stats.tasks.failed,
        draws = stats.draws,
        max_quads = stats.max_quads,
        elevation_misses = elevation.misses,
        elevation_evictions = elevation.evictions,
        residual_misses = residuals.misses,
        particles_added = stats.particles_added,
        particles_removed = stats.particles_removed,
        "Flight finished"
    );
    Ok(())
}

/// Emit `count` particles around `origin`, rising and spreading out.
fn spawn_particles(particles: &mut ParticleProducer, count: usize, frame: u32, origin: DVec3) {
    let mut spawned = Vec::with_capacity(count);
    for _ in 0..count {
        match particles.new_particle() {
            Ok(id) => spawned.push(id),
            Err(e) => {
                debug!(error = %e, "Skipped particle");
                break;
            }
        }
    }
    let Some((world, storage)) = particles.layer_and_storage_mut::<WorldLayer>() else {
        return;
    };
    for (k, &id) in spawned.iter().enumerate() {
        let angle = (frame as usize * count + k) as f32 * 2.399_963;
        world.set_position(storage, id, origin);
        world.set_velocity(storage, id, Vec3::new(angle.cos() * 20.0, angle.sin() * 20.0, 5.0));
    }
}

fn print_help() {
    eprintln!(
        "Proland headless demo

USAGE:
    cargo run -p proland-demo -- [OPTIONS]

OPTIONS:
    --config <PATH>     JSON descriptor; missing fields take their defaults
    --frames <N>        Number of frames to fly (default: 120)
    --seed <N>          Seed of the synthetic terrain (default: 42)
    --sync              Produce every tile in the frame that needs it
    -h, --help          Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}
