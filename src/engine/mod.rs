pub mod locks;
pub mod orchestrator;
pub mod params;
pub mod runner;
pub mod step;
pub mod types;
