//! Tile samplers: the binding between a terrain quadtree and a producer.
//!
//! Each frame a sampler walks the quadtree, acquires the tiles of the quads
//! it needs and returns the tasks still to run. Tiles acquired in one frame
//! stay held until the end of the next, so tiles needed in consecutive
//! frames never drop to zero users.

use std::sync::Arc;

use hashbrown::HashMap;
use proland_core::{Error, Result, TileCoord};
use proland_producer::{Deadline, Producer, TaskGraph, Tile};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::node::TerrainNode;
use crate::quad::TerrainQuad;
use crate::uniforms::TileUniforms;

/// Which quads a sampler acquires tiles for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TileSamplerConfig {
    pub name: String,
    /// Acquire tiles for leaf quads.
    pub store_leaf: bool,
    /// Acquire tiles for subdivided quads too.
    pub store_parent: bool,
    /// Acquire tiles for quads outside the view.
    pub store_invisible: bool,
    /// Produce tiles in the background; quads are drawn with ancestor tiles
    /// until theirs are ready.
    pub async_mode: bool,
}

impl Default for TileSamplerConfig {
    fn default() -> Self {
        Self {
            name: "elevation".to_string(),
            store_leaf: true,
            store_parent: true,
            store_invisible: false,
            async_mode: false,
        }
    }
}

impl TileSamplerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub const fn with_store_parent(mut self, store: bool) -> Self {
        self.store_parent = store;
        self
    }

    pub const fn with_store_invisible(mut self, store: bool) -> Self {
        self.store_invisible = store;
        self
    }

    pub const fn with_async(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }
}

/// Array layer of every ready tile, per level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileMap {
    levels: Vec<HashMap<(u32, u32), u32>>,
}

impl TileMap {
    pub fn insert(&mut self, coord: TileCoord, layer: u32) {
        let level = coord.level as usize;
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, HashMap::new);
        }
        self.levels[level].insert((coord.tx, coord.ty), layer);
    }

    pub fn get(&self, coord: TileCoord) -> Option<u32> {
        self.levels
            .get(coord.level as usize)?
            .get(&(coord.tx, coord.ty))
            .copied()
    }

    /// Entries of one level.
    pub fn level(&self, level: u32) -> Option<&HashMap<(u32, u32), u32>> {
        self.levels.get(level as usize)
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a quad reads its data: the nearest ready tile and the part of it
/// the quad covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileLookup {
    /// Coordinates of the tile actually used (the quad's or an ancestor's).
    pub source: TileCoord,
    pub uniforms: TileUniforms,
}

/// Binds one producer to one terrain.
pub struct TileSampler {
    config: TileSamplerConfig,
    producer: Producer,
    current: HashMap<TileCoord, Arc<Tile>>,
    previous: HashMap<TileCoord, Arc<Tile>>,
}

impl TileSampler {
    /// Create a new sampler for `producer`.
    pub fn new(producer: Producer, config: TileSamplerConfig) -> Self {
        Self {
            config,
            producer,
            current: HashMap::new(),
            previous: HashMap::new(),
        }
    }

    pub const fn config(&self) -> &TileSamplerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub const fn producer(&self) -> &Producer {
        &self.producer
    }

    pub const fn is_async(&self) -> bool {
        self.config.async_mode
    }

    /// Whether this sampler wants a tile for `quad`.
    pub fn needs_tile(&self, quad: &TerrainQuad) -> bool {
        let wanted = if quad.is_leaf() {
            self.config.store_leaf
        } else {
            self.config.store_parent
        };
        wanted && (self.config.store_invisible || quad.is_visible()) && self.producer.has_tile(quad.coord)
    }

    /// Acquire the tiles the terrain needs for `frame`.
    ///
    /// Returns the tasks that must run for them to become ready: due this
    /// frame, or the next one in asynchronous mode. Tiles that cannot be
    /// allocated are skipped and retried next frame.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn update(&mut self, terrain: &TerrainNode, frame: u32) -> TaskGraph {
        let deadline = if self.config.async_mode {
            Deadline::frame(frame.saturating_add(1))
        } else {
            Deadline::frame(frame)
        };
        let mut needed = Vec::new();
        terrain.root().visit(&mut |q| {
            if self.needs_tile(q) {
                needed.push(q.coord);
            }
        });

        let mut graph = TaskGraph::new();
        let mut skipped = 0usize;
        for coord in needed {
            if self.current.contains_key(&coord) {
                continue;
            }
            match self.producer.get_tile(coord, deadline) {
                Ok(tile) => {
                    if !tile.is_ready() {
                        graph.merge(self.producer.task_graph(&tile));
                    }
                    self.current.insert(coord, tile);
                }
                Err(e) if e.is_recoverable() => skipped += 1,
                Err(e) => warn!(sampler = %self.config.name, %coord, error = %e, "Failed to acquire tile"),
            }
        }
        if skipped > 0 {
            debug!(sampler = %self.config.name, skipped, "Tile pool exhausted, retrying next frame");
        }
        graph
    }

    /// Release the tiles of the previous frame.
    ///
    /// Tiles acquired again this frame keep their use.
    pub fn end_frame(&mut self) {
        for tile in self.previous.values() {
            self.producer.put_tile(tile);
        }
        self.previous = std::mem::take(&mut self.current);
    }

    /// Release every held tile.
    pub fn release_all(&mut self) {
        for tile in self.previous.values().chain(self.current.values()) {
            self.producer.put_tile(tile);
        }
        self.previous.clear();
        self.current.clear();
    }

    /// Tile held for `coord` in the current or previous frame.
    pub fn tile(&self, coord: TileCoord) -> Option<&Arc<Tile>> {
        self.current.get(&coord).or_else(|| self.previous.get(&coord))
    }

    /// Held tile for `coord` if it is ready.
    pub fn ready_tile(&self, coord: TileCoord) -> Option<&Arc<Tile>> {
        self.tile(coord).filter(|t| t.is_ready())
    }

    /// Number of distinct tiles held.
    pub fn held(&self) -> usize {
        self.current.len() + self.previous.keys().filter(|c| !self.current.contains_key(*c)).count()
    }

    /// Array layers of the ready tiles held this frame.
    pub fn tile_map(&self) -> TileMap {
        let mut map = TileMap::default();
        for (coord, tile) in &self.current {
            if tile.is_ready() {
                map.insert(*coord, tile.slot().0);
            }
        }
        map
    }

    /// Resolve `coord` to the nearest ready held tile at or above it.
    ///
    /// Texture coordinates skip the tile border; with an odd slot size they
    /// point at sample centers.
    pub fn lookup(&self, coord: TileCoord) -> Option<TileLookup> {
        let mut source = coord;
        let tile = loop {
            if self.producer.has_tile(source) {
                if let Some(tile) = self.ready_tile(source) {
                    break tile;
                }
            }
            source = source.parent()?;
        };
        let (dx, dy, scale) = coord.offset_in(source)?;
        let s = self.producer.tile_size();
        let border = f64::from(self.producer.border());
        let inner = f64::from(s / 2 * 2) - 2.0 * border;
        let center = if s % 2 == 0 { 0.0 } else { 0.5 };
        let s = f64::from(s);
        Some(TileLookup {
            source,
            uniforms: TileUniforms {
                coords: [
                    ((dx * inner + border + center) / s) as f32,
                    ((dy * inner + border + center) / s) as f32,
                    tile.slot().0 as f32,
                    0.0,
                ],
                size: [(scale * inner / s) as f32, (scale * inner / s) as f32, 0.0, 0.0],
            },
        })
    }
}

impl Drop for TileSampler {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for TileSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileSampler")
            .field("name", &self.config.name)
            .field("producer", &self.producer.name())
            .field("held", &self.held())
            .finish()
    }
}

/// A sampler over an elevation producer that feeds elevation ranges back
/// into the terrain.
#[derive(Debug)]
pub struct TileSamplerZ {
    sampler: TileSampler,
}

impl TileSamplerZ {
    /// Create a new elevation sampler.
    ///
    /// Fails if `producer` does not expose elevation ranges.
    pub fn new(producer: Producer, config: TileSamplerConfig) -> Result<Self> {
        if producer.z_range_reader().is_none() {
            return Err(Error::InvalidData(format!(
                "{} does not produce elevation tiles",
                producer.name()
            )));
        }
        Ok(Self {
            sampler: TileSampler::new(producer, config),
        })
    }

    pub const fn sampler(&self) -> &TileSampler {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut TileSampler {
        &mut self.sampler
    }

    /// See [`TileSampler::update`].
    pub fn update(&mut self, terrain: &TerrainNode, frame: u32) -> TaskGraph {
        self.sampler.update(terrain, frame)
    }

    /// See [`TileSampler::end_frame`].
    pub fn end_frame(&mut self) {
        self.sampler.end_frame();
    }

    /// Copy the elevation range of every ready tile into its quad and set
    /// the terrain's ground height below the camera.
    ///
    /// Returns the number of quads whose range was updated.
    pub fn read_back(&self, terrain: &mut TerrainNode) -> usize {
        let Some(reader) = self.sampler.producer.z_range_reader() else {
            return 0;
        };
        let mut updated = 0;
        terrain.root_mut().visit_mut(&mut |q| {
            let range = self.sampler.ready_tile(q.coord).and_then(|t| reader.z_range(t));
            if let Some((zmin, zmax)) = range {
                q.zmin = f64::from(zmin);
                q.zmax = f64::from(zmax);
                updated += 1;
            }
        });

        let camera = terrain.local_camera();
        let mut quad = terrain.root();
        let mut ground = None;
        let inside = |q: &TerrainQuad| {
            camera.x >= q.ox && camera.x <= q.ox + q.l && camera.y >= q.oy && camera.y <= q.oy + q.l
        };
        if inside(quad) {
            loop {
                if let Some(tile) = self.sampler.ready_tile(quad.coord) {
                    let u = (camera.x - quad.ox) / quad.l;
                    let v = (camera.y - quad.oy) / quad.l;
                    ground = reader.height_at(tile, u, v).or(ground);
                }
                match quad.children().and_then(|c| c.iter().find(|c| inside(c))) {
                    Some(child) => quad = child,
                    None => break,
                }
            }
        }
        if let Some(h) = ground {
            terrain.set_ground_height(f64::from(h));
        }
        updated
    }
}
