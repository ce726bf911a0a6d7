//! Synthetic bouncing-ball video generation.
//!
//! Layout written under the output directory:
//!
//! ```text
//! config.json
//! seq0/frame0.png .. frame{N-1}.png
//! seq0/ground_truth.npy      [N, 6] f32: x, y, vx, vy, ax, ay
//! seq1/...
//! ```

use std::fs;
use std::path::Path;

use image::{GrayImage, Luma};
use log::{info, warn};
use ndarray::Array2;
use ndarray_npy::WriteNpyExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::physics::{BallState, Bounds};

pub const CONFIG_FILE: &str = "config.json";
pub const GROUND_TRUTH_FILE: &str = "ground_truth.npy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub num_sequences: usize,
    /// Frames per sequence, input and output together.
    pub sequence_length: usize,
    pub t_frame: f32,
    pub window_size_x: u32,
    pub window_size_y: u32,
    pub ball_radius: f32,
    /// Per-axis speed limit in pixels per second.
    pub v_max: f32,
    pub position_std: f32,
    pub velocity_std: f32,
    pub acceleration_std: f32,
    pub avoid_collisions: bool,
    pub max_attempts: usize,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            num_sequences: 2048 + 128,
            sequence_length: 100,
            t_frame: 1.0 / 30.0,
            window_size_x: 32,
            window_size_y: 32,
            ball_radius: 5.0,
            v_max: 300.0,
            position_std: 8.0,
            velocity_std: 15.0,
            acceleration_std: 10.0,
            avoid_collisions: false,
            max_attempts: 100,
            seed: 456,
        }
    }
}

impl GeneratorConfig {
    pub fn bounds(&self) -> Bounds {
        Bounds::for_window(self.window_size_x, self.window_size_y, self.ball_radius)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sequence_length == 0 {
            return Err(Error::InvalidConfig("sequence_length must be > 0".into()));
        }
        if self.t_frame <= 0.0 {
            return Err(Error::InvalidConfig("t_frame must be positive".into()));
        }
        if self.ball_radius * 2.0 >= self.window_size_x.min(self.window_size_y) as f32 {
            return Err(Error::InvalidConfig(format!(
                "ball of radius {} does not fit a {}x{} window",
                self.ball_radius, self.window_size_x, self.window_size_y
            )));
        }
        if self.position_std < 0.0 || self.velocity_std < 0.0 || self.acceleration_std < 0.0 {
            return Err(Error::InvalidConfig(
                "standard deviations must be non-negative".into(),
            ));
        }
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let raw = fs::read_to_string(dir.join(CONFIG_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

pub struct Trajectory {
    pub states: Vec<BallState>,
    pub collided: bool,
}

impl Trajectory {
    pub fn to_array(&self) -> Array2<f32> {
        let mut arr = Array2::zeros((self.states.len(), 6));
        for (i, s) in self.states.iter().enumerate() {
            for (j, v) in s.to_array().into_iter().enumerate() {
                arr[[i, j]] = v;
            }
        }
        arr
    }
}

struct InitialStateSampler {
    x: Normal<f32>,
    y: Normal<f32>,
    velocity: Normal<f32>,
    acceleration: Normal<f32>,
}

impl InitialStateSampler {
    fn new(config: &GeneratorConfig) -> Result<Self> {
        let normal = |mean: f32, std: f32| {
            Normal::new(mean, std).map_err(|e| Error::InvalidConfig(e.to_string()))
        };
        Ok(Self {
            x: normal(config.window_size_x as f32 / 2.0, config.position_std)?,
            y: normal(config.window_size_y as f32 / 2.0, config.position_std)?,
            velocity: normal(0.0, config.velocity_std)?,
            acceleration: normal(0.0, config.acceleration_std)?,
        })
    }

    fn sample<R: Rng>(&self, bounds: &Bounds, rng: &mut R) -> BallState {
        // Start positions are whole pixels.
        let x = self.x.sample(rng).trunc();
        let y = self.y.sample(rng).trunc();
        let (x, y) = bounds.clamp(x, y);

        BallState {
            x,
            y,
            vx: self.velocity.sample(rng),
            vy: self.velocity.sample(rng),
            ax: self.acceleration.sample(rng),
            ay: self.acceleration.sample(rng),
        }
    }
}

pub fn sample_initial_state<R: Rng>(config: &GeneratorConfig, rng: &mut R) -> Result<BallState> {
    Ok(InitialStateSampler::new(config)?.sample(&config.bounds(), rng))
}

/// Records each frame's state, then limits speed and steps.
pub fn simulate(config: &GeneratorConfig, initial: BallState) -> Trajectory {
    let bounds = config.bounds();
    let mut states = Vec::with_capacity(config.sequence_length);
    let mut collided = false;
    let mut state = initial;

    for _ in 0..config.sequence_length {
        states.push(state);
        let step = state.limit_speed(config.v_max).step(&bounds, config.t_frame);
        collided |= step.collided;
        state = step.state;
    }

    Trajectory { states, collided }
}

fn draw_trajectory<R: Rng>(
    config: &GeneratorConfig,
    sampler: &InitialStateSampler,
    rng: &mut R,
) -> Trajectory {
    let bounds = config.bounds();
    let mut trajectory = simulate(config, sampler.sample(&bounds, rng));

    if config.avoid_collisions {
        let mut attempts = 1;
        while trajectory.collided && attempts < config.max_attempts {
            trajectory = simulate(config, sampler.sample(&bounds, rng));
            attempts += 1;
        }
        if trajectory.collided {
            warn!(
                "No collision-free trajectory after {} attempts, keeping the last one",
                attempts
            );
        }
    }

    trajectory
}

/// White disc on black; a pixel is lit when its centre lies inside the radius.
pub fn render_frame(config: &GeneratorConfig, x: f32, y: f32) -> GrayImage {
    let r2 = config.ball_radius * config.ball_radius;
    GrayImage::from_fn(config.window_size_x, config.window_size_y, |px, py| {
        let dx = px as f32 + 0.5 - x;
        let dy = py as f32 + 0.5 - y;
        if dx * dx + dy * dy <= r2 {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}

pub fn sequence_dir(root: &Path, index: usize) -> std::path::PathBuf {
    root.join(format!("seq{}", index))
}

pub fn frame_path(sequence_dir: &Path, frame: usize) -> std::path::PathBuf {
    sequence_dir.join(format!("frame{}.png", frame))
}

pub fn write_sequence(
    config: &GeneratorConfig,
    trajectory: &Trajectory,
    dir: &Path,
) -> Result<()> {
    fs::create_dir_all(dir)?;

    for (i_frame, state) in trajectory.states.iter().enumerate() {
        render_frame(config, state.x, state.y).save(frame_path(dir, i_frame))?;
    }

    let file = fs::File::create(dir.join(GROUND_TRUTH_FILE))?;
    trajectory.to_array().write_npy(file)?;
    Ok(())
}

pub fn generate(config: &GeneratorConfig, out_dir: &Path) -> Result<()> {
    config.validate()?;
    fs::create_dir_all(out_dir)?;

    let sampler = InitialStateSampler::new(config)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut num_collided = 0;

    for i_sequence in 0..config.num_sequences {
        info!(
            "Generating sequence: {} with length {} ...",
            i_sequence, config.sequence_length
        );
        let trajectory = draw_trajectory(config, &sampler, &mut rng);
        if trajectory.collided {
            num_collided += 1;
        }
        write_sequence(config, &trajectory, &sequence_dir(out_dir, i_sequence))?;
    }

    fs::write(
        out_dir.join(CONFIG_FILE),
        serde_json::to_string_pretty(config)?,
    )?;

    info!(
        "Wrote {} sequences to {:?} ({} with wall collisions)",
        config.num_sequences, out_dir, num_collided
    );
    Ok(())
}
