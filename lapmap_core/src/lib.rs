//! lapmap Core - Cone-Landmark SLAM for Closed-Circuit Racing
//!
//! The mapping-and-localization core of an autonomous racing vehicle on a
//! circuit marked by coloured cones. Per keyframe the engine:
//! 1. **Assembles** per-cone perception messages into observation frames
//! 2. **Associates** observed cones against the working landmark list
//! 3. **Optimizes** a rolling pose-graph window while the first lap builds
//! 4. **Closes the loop** with a full bundle adjustment once the lap completes
//! 5. **Filters** the map once and freezes it
//! 6. **Localizes** against the frozen map and publishes the corrected pose
//!    plus the next cones ahead

pub mod backend;
pub mod cone;
pub mod config;
pub mod engine;
pub mod filter;
pub mod frame;
pub mod geometry;
pub mod graph;
pub mod localizer;
pub mod mapping;
pub mod messages;
pub mod persistence;

// Re-export key types for convenience
pub use cone::{Cone, ConeObservation};
pub use config::{ConfigError, SlamConfig};
pub use engine::{SlamEngine, SlamPhase};
pub use frame::{Frame, FrameAssembler, KeyframeGate};
pub use geometry::Pose2;
pub use graph::{GraphError, PoseGraph};
pub use mapping::ConeMap;
pub use messages::{ConeBundle, ConePackage, GeolocationReading, OutboundMessage};
