pub mod engine;

pub use engine::PointsEngine;
