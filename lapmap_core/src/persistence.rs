//! Debug persistence sink.
//!
//! Not part of the operational interface: dumps the frozen map and the
//! keyframe trajectory as plain text for offline inspection.

use crate::cone::Cone;
use crate::geometry::Pose2;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Writes one `x<TAB>y` line per cone.
pub fn write_map_file(path: &Path, cones: &[Cone]) -> std::io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    for cone in cones {
        let position = cone.best_position();
        writeln!(file, "{:.9}\t{:.9}", position.x, position.y)?;
    }
    file.flush()?;
    info!(points = cones.len(), path = %path.display(), "map saved");
    Ok(())
}

/// Writes one `x<TAB>y<TAB>theta` line per keyframe pose.
pub fn write_pose_file(path: &Path, poses: &[Pose2]) -> std::io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    for pose in poses {
        writeln!(file, "{:.9}\t{:.9}\t{:.9}", pose.x, pose.y, pose.theta)?;
    }
    file.flush()?;
    info!(points = poses.len(), path = %path.display(), "poses saved");
    Ok(())
}
