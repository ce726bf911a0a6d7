//! Ball kinematics under constant acceleration with wall reflection.

use serde::{Deserialize, Serialize};

/// Position (pixels), velocity (pixels/s) and acceleration (pixels/s²) of the ball.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BallState {
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub ax: f32,
    pub ay: f32,
}

/// Region the ball centre may occupy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
}

impl Bounds {
    /// Keeps a ball of `radius` fully inside a `width` x `height` window.
    pub fn for_window(width: u32, height: u32, radius: f32) -> Self {
        Self {
            x_min: radius,
            x_max: width as f32 - radius,
            y_min: radius,
            y_max: height as f32 - radius,
        }
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }

    pub fn clamp(&self, x: f32, y: f32) -> (f32, f32) {
        (x.clamp(self.x_min, self.x_max), y.clamp(self.y_min, self.y_max))
    }
}

/// Result of advancing a state by one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub state: BallState,
    pub collided: bool,
}

impl BallState {
    pub fn to_array(&self) -> [f32; 6] {
        [self.x, self.y, self.vx, self.vy, self.ax, self.ay]
    }

    /// Clamps each velocity component to `[-v_max, v_max]`.
    pub fn limit_speed(mut self, v_max: f32) -> Self {
        if self.vx.abs() > v_max {
            self.vx = v_max.copysign(self.vx);
        }
        if self.vy.abs() > v_max {
            self.vy = v_max.copysign(self.vy);
        }
        self
    }

    pub fn step(&self, bounds: &Bounds, dt: f32) -> Step {
        let mut vx = self.vx + self.ax * dt;
        let mut vy = self.vy + self.ay * dt;

        let mut x = self.x + self.vx * dt + 0.5 * self.ax * dt * dt;
        let mut y = self.y + self.vy * dt + 0.5 * self.ay * dt * dt;

        let mut collided = false;

        if x < bounds.x_min {
            x = bounds.x_min + (bounds.x_min - x);
            vx = -vx;
            collided = true;
        }
        if x > bounds.x_max {
            x = bounds.x_max - (x - bounds.x_max);
            vx = -vx;
            collided = true;
        }
        if y < bounds.y_min {
            y = bounds.y_min + (bounds.y_min - y);
            vy = -vy;
            collided = true;
        }
        if y > bounds.y_max {
            y = bounds.y_max - (y - bounds.y_max);
            vy = -vy;
            collided = true;
        }

        Step {
            state: BallState {
                x,
                y,
                vx,
                vy,
                ax: self.ax,
                ay: self.ay,
            },
            collided,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> Bounds {
        Bounds::for_window(32, 32, 5.0)
    }

    fn state(x: f32, y: f32, vx: f32, vy: f32) -> BallState {
        BallState {
            x,
            y,
            vx,
            vy,
            ax: 0.0,
            ay: 0.0,
        }
    }

    #[test]
    fn free_flight_is_ballistic() {
        let s = BallState {
            x: 16.0,
            y: 16.0,
            vx: 30.0,
            vy: 0.0,
            ax: 0.0,
            ay: 60.0,
        };
        let next = s.step(&bounds(), 0.1);
        assert!(!next.collided);
        assert!((next.state.x - 19.0).abs() < 1e-5);
        assert!((next.state.y - 16.3).abs() < 1e-5);
        assert!((next.state.vy - 6.0).abs() < 1e-5);
    }

    #[test]
    fn reflects_off_right_wall() {
        let next = state(26.0, 16.0, 30.0, 0.0).step(&bounds(), 0.1);
        assert!(next.collided);
        // 26 + 3 = 29 overshoots x_max = 27 by 2
        assert!((next.state.x - 25.0).abs() < 1e-5);
        assert!((next.state.vx + 30.0).abs() < 1e-5);
        assert!(bounds().contains(next.state.x, next.state.y));
    }

    #[test]
    fn reflects_off_top_wall() {
        let next = state(16.0, 6.0, 0.0, -20.0).step(&bounds(), 0.1);
        assert!(next.collided);
        assert!((next.state.y - 6.0).abs() < 1e-5);
        assert!(next.state.vy > 0.0);
    }

    #[test]
    fn speed_limit_keeps_sign() {
        let s = state(16.0, 16.0, -500.0, 400.0).limit_speed(300.0);
        assert_eq!(s.vx, -300.0);
        assert_eq!(s.vy, 300.0);

        let slow = state(16.0, 16.0, 10.0, -20.0).limit_speed(300.0);
        assert_eq!(slow.vx, 10.0);
        assert_eq!(slow.vy, -20.0);
    }

    #[test]
    fn clamp_pulls_into_bounds() {
        assert_eq!(bounds().clamp(-3.0, 40.0), (5.0, 27.0));
    }
}
