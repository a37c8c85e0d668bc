// ekf_sim/src/simulation/mod.rs

pub mod config;
pub mod prng;
pub mod runner;
pub mod sensors;
pub mod trajectory;
