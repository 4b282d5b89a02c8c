// Transparent SVG annotation layer burned into archived event videos

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{errors::DaclError, telemetry::TelemetrySnapshot};

/// Produces an annotation image for an event.
pub trait OverlayRenderer: Send + Sync {
    fn render(
        &self,
        telemetry: &TelemetrySnapshot,
        warning: &str,
        timestamp: &str,
    ) -> Result<PathBuf, DaclError>;
}

/// Renders the overlay as an SVG file with the event details in the top left corner.
#[derive(Debug, Clone)]
pub struct SvgOverlayRenderer {
    dir: PathBuf,
    canvas_size: (u32, u32),
    font_size: u32,
}

impl SvgOverlayRenderer {
    pub fn new(dir: &Path, width: u32, height: u32) -> Self {
        Self {
            dir: dir.to_path_buf(),
            canvas_size: (width, height),
            font_size: (height / 24).max(12),
        }
    }

    /// Overlay written to the system temp directory.
    pub fn in_temp_dir(width: u32, height: u32) -> Self {
        Self::new(&std::env::temp_dir(), width, height)
    }

    pub fn svg_content(&self, telemetry: &TelemetrySnapshot, warning: &str, timestamp: &str) -> String {
        let (width, height) = self.canvas_size;
        let lines = [
            format!("Speed: {} km/h", telemetry.speed_kph),
            format!("Trip: {} km", telemetry.trip_mileage_km),
            format!("Total: {} km", telemetry.total_mileage_km),
            format!("Warning: {}", warning),
            format!("Time: {}", timestamp),
        ];

        let line_height = self.font_size + self.font_size / 2;
        let mut svg = String::new();
        svg.push_str(&format!(
            r##"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {width} {height}">
  <style>
    .label {{ font-family: monospace; font-size: {}px; fill: #ffffff; stroke: #000000; stroke-width: 1; }}
  </style>
  <rect x="0" y="0" width="{}" height="{}" fill="#000000" fill-opacity="0.35" />"##,
            self.font_size,
            self.font_size * 18,
            line_height * lines.len() as u32 + self.font_size / 2,
        ));
        for (i, line) in lines.iter().enumerate() {
            svg.push_str(&format!(
                "\n  <text class=\"label\" x=\"{}\" y=\"{}\">{}</text>",
                self.font_size / 2,
                line_height * (i as u32 + 1),
                escape_xml(line)
            ));
        }
        svg.push_str("\n</svg>\n");
        svg
    }
}

impl OverlayRenderer for SvgOverlayRenderer {
    fn render(
        &self,
        telemetry: &TelemetrySnapshot,
        warning: &str,
        timestamp: &str,
    ) -> Result<PathBuf, DaclError> {
        let path = self.dir.join(format!(
            "dacl_overlay_{timestamp}_{}.svg",
            super::sanitize_label(warning)
        ));
        fs::write(&path, self.svg_content(telemetry, warning, timestamp)).map_err(|e| {
            DaclError::FileOperationError {
                operation: "write".to_string(),
                path: path.clone(),
                source: e,
            }
        })?;
        Ok(path)
    }
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            speed_kph: 87,
            trip_mileage_km: 12,
            total_mileage_km: 123_456,
            ..Default::default()
        }
    }

    #[test]
    fn test_svg_contains_event_details() {
        let renderer = SvgOverlayRenderer::new(Path::new("."), 1456, 1088);
        let svg = renderer.svg_content(&snapshot(), "Brake <Warn>", "20240309_140507");

        assert!(svg.starts_with("<svg width=\"1456\" height=\"1088\""));
        assert!(svg.contains("Speed: 87 km/h"));
        assert!(svg.contains("Trip: 12 km"));
        assert!(svg.contains("Total: 123456 km"));
        assert!(svg.contains("Warning: Brake &lt;Warn&gt;"));
        assert!(svg.contains("Time: 20240309_140507"));
        assert_eq!(svg.matches("<text").count(), 5);
        assert!(svg.trim_end().ends_with("</svg>"));
    }

    #[test]
    fn test_render_writes_file() {
        let dir = TempDir::new().unwrap();
        let renderer = SvgOverlayRenderer::new(dir.path(), 640, 480);
        let path = renderer
            .render(&snapshot(), "EngineFault", "20240309_140507")
            .unwrap();

        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "dacl_overlay_20240309_140507_EngineFault.svg"
        );
        assert!(fs::read_to_string(path).unwrap().contains("EngineFault"));
    }

    #[test]
    fn test_render_into_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let renderer = SvgOverlayRenderer::new(&dir.path().join("missing"), 640, 480);
        assert!(matches!(
            renderer.render(&snapshot(), "x", "t"),
            Err(DaclError::FileOperationError { .. })
        ));
    }
}
