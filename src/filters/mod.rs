pub mod orientation_ekf;

pub use orientation_ekf::{EkfConfig, OrientationEkf, OrientationEkfState};
