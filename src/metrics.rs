// ============================================================================
// metrics.rs — slime-engine
// Field diagnostics computed from a readback snapshot.
// ============================================================================

use crate::field::FieldSnapshot;

/// Cells whose summed trail is below this count as empty.
const COVERAGE_EPSILON: f32 = 1e-4;

/// Summary of one field snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDiagnostics {
    /// Sum of each trail channel over all cells.
    pub channel_totals: [f64; 3],
    pub total_intensity: f64,
    /// Largest single-channel value.
    pub max_texel: f32,
    /// Fraction of cells carrying any trail.
    pub coverage: f32,
    pub mean_intensity: f32,
    pub intensity_std_dev: f32,
}

impl FieldDiagnostics {
    pub fn from_snapshot(snap: &FieldSnapshot) -> Self {
        let texels = snap.texels();
        let n = texels.len().max(1);

        let mut channel_totals = [0.0f64; 3];
        let mut max_texel = 0.0f32;
        let mut covered = 0usize;
        for t in texels {
            for c in 0..3 {
                channel_totals[c] += t[c] as f64;
                max_texel = max_texel.max(t[c]);
            }
            if t[0] + t[1] + t[2] > COVERAGE_EPSILON {
                covered += 1;
            }
        }
        let total_intensity: f64 = channel_totals.iter().sum();
        let mean = total_intensity / n as f64;

        // ---- Spatial spread ----
        let mut var = 0.0f64;
        for t in texels {
            let diff = (t[0] + t[1] + t[2]) as f64 - mean;
            var += diff * diff;
        }

        Self {
            channel_totals,
            total_intensity,
            max_texel,
            coverage: covered as f32 / n as f32,
            mean_intensity: mean as f32,
            intensity_std_dev: (var / n as f64).sqrt() as f32,
        }
    }

    /// Log at INFO level, with the change since `prev` when given.
    pub fn log(&self, frame: u64, prev: Option<&FieldDiagnostics>) {
        log::info!("══════════════ Frame {} Diagnostics ══════════════", frame);
        if let Some(p) = prev {
            log::info!(
                "TRENDS: Δintensity={:+.2} | Δcoverage={:+.2}%",
                self.total_intensity - p.total_intensity,
                (self.coverage - p.coverage) * 100.0,
            );
        }
        log::info!(
            "TRAIL: total={:.2} | r={:.2} g={:.2} b={:.2} | max={:.3}",
            self.total_intensity,
            self.channel_totals[0],
            self.channel_totals[1],
            self.channel_totals[2],
            self.max_texel,
        );
        log::info!(
            "SPATIAL: coverage={:.1}% | mean={:.4} | std_dev={:.4}",
            self.coverage * 100.0,
            self.mean_intensity,
            self.intensity_std_dev,
        );
    }
}
