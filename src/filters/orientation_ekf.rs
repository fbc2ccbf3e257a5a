//! Orientation EKF on the rotation-matrix manifold.
//!
//! State is a single sensor-from-world rotation `R` plus a 3x3 covariance
//! living in the tangent space at `R`. Gyroscope samples drive prediction;
//! accelerometer (gravity) and magnetometer (north) samples drive
//! corrections whose Jacobians are estimated numerically. Every rotation
//! applied to the state goes through [`OrientationEkf::rotate_state`], which
//! re-expresses the covariance in the new tangent frame.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{HeadTrackerError, TrackerResult};
use crate::smoothing::GyroTimestepFilter;
use crate::so3;
use crate::types::{Matrix3x3d, Matrix3x3dExt, Matrix4d, Vector3d, Vector3dExt};

/// Nanoseconds to seconds
const NS2S: f64 = 1e-9;

/// Heading is undefined when the sensor Z axis is this close to vertical
const HEADING_MIN_HORIZONTAL: f64 = 0.1;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EkfConfig {
    /// Initial orientation uncertainty (rad), per axis
    pub initial_sigma_p: f64,
    /// Process noise (rad/s), scaled by dt² per gyro step
    pub sigma_q: f64,
    /// Magnetometer measurement noise (rad)
    pub sigma_r_mag: f64,
    /// Accelerometer measurement noise (rad)
    pub sigma_r_acc: f64,
    /// Magnitude of the world "down" reference (m/s²)
    pub gravity: f64,
    /// Gyro gaps longer than this are replaced by the filtered timestep
    pub max_gyro_timestep_secs: f64,
    /// Timestep used for long gaps before the filtered timestep is valid
    pub default_gyro_timestep_secs: f64,
    pub timestep_filter_coeff: f64,
    pub timestep_min_samples: u32,
    /// Tangent-space perturbation for the numerical Jacobian
    pub jacobian_epsilon: f64,
}

impl Default for EkfConfig {
    fn default() -> Self {
        Self {
            initial_sigma_p: 5.0,
            sigma_q: 1.0,
            sigma_r_mag: 0.25,
            sigma_r_acc: 0.75,
            gravity: 9.81,
            max_gyro_timestep_secs: 0.04,
            default_gyro_timestep_secs: 0.01,
            timestep_filter_coeff: 0.95,
            timestep_min_samples: 10,
            jacobian_epsilon: 1e-7,
        }
    }
}

impl EkfConfig {
    pub fn validate(&self) -> TrackerResult<()> {
        let non_negative = [
            ("initial_sigma_p", self.initial_sigma_p),
            ("sigma_q", self.sigma_q),
            ("sigma_r_mag", self.sigma_r_mag),
            ("sigma_r_acc", self.sigma_r_acc),
        ];
        for (name, value) in non_negative.iter() {
            if !value.is_finite() || *value < 0.0 {
                return Err(HeadTrackerError::InvalidConfig(format!(
                    "{} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }

        let positive = [
            ("gravity", self.gravity),
            ("max_gyro_timestep_secs", self.max_gyro_timestep_secs),
            ("default_gyro_timestep_secs", self.default_gyro_timestep_secs),
            ("jacobian_epsilon", self.jacobian_epsilon),
        ];
        for (name, value) in positive.iter() {
            if !value.is_finite() || *value <= 0.0 {
                return Err(HeadTrackerError::InvalidConfig(format!(
                    "{} must be finite and positive, got {}",
                    name, value
                )));
            }
        }

        if !(0.0..1.0).contains(&self.timestep_filter_coeff) {
            return Err(HeadTrackerError::InvalidConfig(format!(
                "timestep_filter_coeff must be in [0, 1), got {}",
                self.timestep_filter_coeff
            )));
        }

        if self.timestep_min_samples == 0 {
            return Err(HeadTrackerError::InvalidConfig(
                "timestep_min_samples must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

// ─── State snapshot ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct OrientationEkfState {
    /// Sensor-from-world rotation, row by row
    pub rotation: [[f64; 3]; 3],
    pub heading_deg: f64,
    pub covariance_trace: f64,
    pub ready: bool,
    pub gyro_updates: u64,
    pub acc_updates: u64,
    pub mag_updates: u64,
    pub skipped_corrections: u64,
    pub filtered_gyro_timestep: Option<f64>,
}

// ─── Filter ──────────────────────────────────────────────────────────────────

pub struct OrientationEkf {
    config: EkfConfig,

    /// Best estimate of device orientation
    so3_sensor_from_world: Matrix3x3d,

    /// Tangent-space covariance at `so3_sensor_from_world`
    covariance: Matrix3x3d,
    process_noise: Matrix3x3d,
    r_mag: Matrix3x3d,
    r_acc: Matrix3x3d,

    /// Last observation residual (rotation vector)
    innovation: Vector3d,

    down: Vector3d,
    north: Vector3d,

    /// Zero means "no sample yet"
    timestamp_gyro: i64,
    timestamp_acc: i64,
    timestamp_mag: i64,

    last_gyro: Vector3d,
    timestep_filter: GyroTimestepFilter,

    gyro_updates: u64,
    acc_updates: u64,
    mag_updates: u64,
    skipped_corrections: u64,
}

impl OrientationEkf {
    /// Filter with default noise parameters
    pub fn new() -> Self {
        Self::build(EkfConfig::default())
    }

    pub fn with_config(config: EkfConfig) -> TrackerResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EkfConfig) -> Self {
        let timestep_filter =
            GyroTimestepFilter::new(config.timestep_filter_coeff, config.timestep_min_samples);
        let mut ekf = Self {
            config,
            so3_sensor_from_world: Matrix3x3d::identity(),
            covariance: Matrix3x3d::zeros(),
            process_noise: Matrix3x3d::zeros(),
            r_mag: Matrix3x3d::zeros(),
            r_acc: Matrix3x3d::zeros(),
            innovation: Vector3d::zeros(),
            down: Vector3d::zeros(),
            north: Vector3d::zeros(),
            timestamp_gyro: 0,
            timestamp_acc: 0,
            timestamp_mag: 0,
            last_gyro: Vector3d::zeros(),
            timestep_filter,
            gyro_updates: 0,
            acc_updates: 0,
            mag_updates: 0,
            skipped_corrections: 0,
        };
        ekf.reset();
        ekf
    }

    /// Back to identity orientation, default covariance and "no samples seen".
    pub fn reset(&mut self) {
        let c = &self.config;

        self.timestamp_gyro = 0;
        self.timestamp_acc = 0;
        self.timestamp_mag = 0;

        self.so3_sensor_from_world = Matrix3x3d::identity();
        self.covariance = Matrix3x3d::same_diagonal(c.initial_sigma_p * c.initial_sigma_p);
        self.process_noise = Matrix3x3d::same_diagonal(c.sigma_q * c.sigma_q);
        self.r_mag = Matrix3x3d::same_diagonal(c.sigma_r_mag * c.sigma_r_mag);
        self.r_acc = Matrix3x3d::same_diagonal(c.sigma_r_acc * c.sigma_r_acc);

        self.innovation = Vector3d::zeros();
        self.last_gyro = Vector3d::zeros();
        self.down = Vector3d::new(0.0, 0.0, c.gravity);
        self.north = Vector3d::new(0.0, 1.0, 0.0);

        self.timestep_filter.reset();
        self.gyro_updates = 0;
        self.acc_updates = 0;
        self.mag_updates = 0;
        self.skipped_corrections = 0;
    }

    /// True once an accelerometer sample has seeded the orientation
    pub fn is_ready(&self) -> bool {
        self.timestamp_acc != 0
    }

    pub fn config(&self) -> &EkfConfig {
        &self.config
    }

    pub fn rotation(&self) -> Matrix3x3d {
        self.so3_sensor_from_world
    }

    pub fn covariance(&self) -> Matrix3x3d {
        self.covariance
    }

    pub fn innovation(&self) -> Vector3d {
        self.innovation
    }

    pub fn last_gyro(&self) -> Vector3d {
        self.last_gyro
    }

    /// Current estimate as a homogeneous 4x4 matrix (zero translation)
    pub fn orientation(&self) -> Matrix4d {
        self.so3_sensor_from_world.to_homogeneous()
    }

    /// Rotation extrapolated with the last angular velocity. Read-only.
    pub fn predicted_rotation(&self, seconds_after_last_gyro: f64) -> Matrix3x3d {
        let motion = so3::exp(&(self.last_gyro * -seconds_after_last_gyro));
        motion * self.so3_sensor_from_world
    }

    pub fn predicted_orientation(&self, seconds_after_last_gyro: f64) -> Matrix4d {
        self.predicted_rotation(seconds_after_last_gyro)
            .to_homogeneous()
    }

    /// Yaw about the vertical axis in degrees, in [0, 360).
    ///
    /// Returns 0 when the sensor Z axis points (nearly) straight up or down,
    /// where heading is undefined.
    pub fn heading_degrees(&self) -> f64 {
        let x = self.so3_sensor_from_world[(2, 0)];
        let y = self.so3_sensor_from_world[(2, 1)];
        if x.hypot(y) < HEADING_MIN_HORIZONTAL {
            return 0.0;
        }

        let mut heading = -90.0 - y.atan2(x).to_degrees();
        if heading < 0.0 {
            heading += 360.0;
        }
        if heading >= 360.0 {
            heading -= 360.0;
        }
        heading
    }

    /// Rotate the estimate about the world vertical so that it reports `heading`.
    /// Covariance is left as is.
    pub fn set_heading_degrees(&mut self, heading: f64) {
        let delta = (heading - self.heading_degrees()).to_radians();
        let (s, c) = delta.sin_cos();
        let about_vertical = Matrix3x3d::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0);
        self.so3_sensor_from_world *= about_vertical;
    }

    /// Prediction step from an angular velocity sample (rad/s).
    pub fn process_gyro(&mut self, gyro: &Vector3d, timestamp_ns: i64) {
        if self.timestamp_gyro != 0 {
            let measured_dt = timestamp_ns.saturating_sub(self.timestamp_gyro) as f64 * NS2S;
            if measured_dt <= 0.0 {
                debug!(
                    "gyro timestamp did not advance ({} ns), skipping integration",
                    timestamp_ns
                );
            } else {
                let dt = if measured_dt > self.config.max_gyro_timestep_secs {
                    let fallback = self
                        .timestep_filter
                        .timestep()
                        .unwrap_or(self.config.default_gyro_timestep_secs);
                    debug!(
                        "gyro gap of {:.4}s, integrating {:.4}s instead",
                        measured_dt, fallback
                    );
                    fallback
                } else {
                    self.timestep_filter.push(measured_dt);
                    measured_dt
                };

                let motion = so3::exp(&(gyro * -dt));
                self.rotate_state(&motion);
                self.covariance += self.process_noise * (dt * dt);
                self.gyro_updates += 1;
            }
        }

        self.timestamp_gyro = timestamp_ns;
        self.last_gyro = *gyro;
    }

    /// Correction from a specific-force sample (m/s²). The first sample seeds
    /// the orientation directly from gravity.
    pub fn process_acc(&mut self, acc: &Vector3d, timestamp_ns: i64) {
        if self.timestamp_acc != 0 {
            let down = self.down;
            let noise = self.r_acc;
            if self.correct(&down, acc, noise, "accelerometer") {
                self.acc_updates += 1;
            }
        } else {
            self.so3_sensor_from_world = so3::align(&self.down, acc);
            self.acc_updates += 1;
            info!("orientation initialized from gravity");
        }
        self.timestamp_acc = timestamp_ns;
    }

    /// Correction from a magnetic field sample. The field is tilt-compensated
    /// against the current down estimate before it is compared with north.
    /// The first sample only establishes the innovation baseline.
    pub fn process_mag(&mut self, mag: &Vector3d, timestamp_ns: i64) {
        let mut field = *mag;
        field.normalize_or_keep();

        let down_in_sensor: Vector3d = self.so3_sensor_from_world.column(2).into_owned();

        let mut perp_to_down_and_field = field.cross(&down_in_sensor);
        perp_to_down_and_field.normalize_or_keep();

        let mut horizontal = down_in_sensor.cross(&perp_to_down_and_field);
        horizontal.normalize_or_keep();

        if self.timestamp_mag != 0 {
            let north = self.north;
            let noise = self.r_mag;
            if self.correct(&north, &horizontal, noise, "magnetometer") {
                self.mag_updates += 1;
            }
        } else {
            self.innovation =
                observation_residual(&self.so3_sensor_from_world, &self.north, &horizontal);
            debug!("magnetometer baseline established");
        }
        self.timestamp_mag = timestamp_ns;
    }

    pub fn state(&self) -> OrientationEkfState {
        let r = &self.so3_sensor_from_world;
        OrientationEkfState {
            rotation: [
                [r[(0, 0)], r[(0, 1)], r[(0, 2)]],
                [r[(1, 0)], r[(1, 1)], r[(1, 2)]],
                [r[(2, 0)], r[(2, 1)], r[(2, 2)]],
            ],
            heading_deg: self.heading_degrees(),
            covariance_trace: self.covariance.trace(),
            ready: self.is_ready(),
            gyro_updates: self.gyro_updates,
            acc_updates: self.acc_updates,
            mag_updates: self.mag_updates,
            skipped_corrections: self.skipped_corrections,
            filtered_gyro_timestep: self.timestep_filter.timestep(),
        }
    }

    /// Kalman correction of the state toward `measured` (sensor frame), given
    /// the `reference` direction in the world frame. Returns false if skipped.
    fn correct(
        &mut self,
        reference: &Vector3d,
        measured: &Vector3d,
        noise: Matrix3x3d,
        sensor: &str,
    ) -> bool {
        let nu = observation_residual(&self.so3_sensor_from_world, reference, measured);
        self.innovation = nu;

        let h = self.numerical_jacobian(reference, measured, &nu);
        let h_t = h.transpose();
        let s = h * self.covariance * h_t + noise;

        let Some(s_inv) = s.inverse_checked() else {
            warn!(
                "{} correction skipped: innovation covariance is singular",
                sensor
            );
            self.skipped_corrections += 1;
            return false;
        };

        let gain = self.covariance * h_t * s_inv;
        let correction = gain * nu;
        self.covariance = (Matrix3x3d::identity() - gain * h) * self.covariance;

        self.rotate_state(&so3::exp(&correction));
        true
    }

    /// Forward-difference Jacobian of the residual w.r.t. a left perturbation
    /// `exp(eps · e_i) · R` of the state.
    fn numerical_jacobian(
        &self,
        reference: &Vector3d,
        measured: &Vector3d,
        nu: &Vector3d,
    ) -> Matrix3x3d {
        let eps = self.config.jacobian_epsilon;
        let mut h = Matrix3x3d::zeros();

        for dof in 0..3 {
            let mut delta = Vector3d::zeros();
            delta[dof] = eps;

            let perturbed = so3::exp(&delta) * self.so3_sensor_from_world;
            let with_delta = observation_residual(&perturbed, reference, measured);
            h.set_column(dof, &((nu - with_delta) / eps));
        }
        h
    }

    /// Apply `motion` to the state and carry the covariance into the new tangent frame.
    fn rotate_state(&mut self, motion: &Matrix3x3d) {
        self.so3_sensor_from_world = motion * self.so3_sensor_from_world;
        self.covariance = motion * self.covariance * motion.transpose();
    }
}

impl Default for OrientationEkf {
    fn default() -> Self {
        Self::new()
    }
}

/// Rotation (as a rotation vector) taking the predicted sensor-frame
/// direction of `reference` onto `measured`.
fn observation_residual(
    so3_sensor_from_world: &Matrix3x3d,
    reference: &Vector3d,
    measured: &Vector3d,
) -> Vector3d {
    let predicted = so3_sensor_from_world * reference;
    so3::log(&so3::align(&predicted, measured))
}
