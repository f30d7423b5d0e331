//! Output formats and the exporters that produce them.
//!
//! Encoding itself lives outside this crate: [`CommandExporter`] hands the
//! applied metadata to an external program and waits for the artifact.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, TaskError};
use crate::model::Metadata;
use crate::scene::SceneAssetProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Glb,
    Fbx,
    Vrm,
    Usdz,
    Jpeg,
    Mp4,
    Mov,
    Gif,
}

impl Format {
    pub const ALL: [Format; 8] = [
        Format::Glb,
        Format::Fbx,
        Format::Vrm,
        Format::Usdz,
        Format::Jpeg,
        Format::Mp4,
        Format::Mov,
        Format::Gif,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Format::Glb => "glb",
            Format::Fbx => "fbx",
            Format::Vrm => "vrm",
            Format::Usdz => "usdz",
            Format::Jpeg => "jpeg",
            Format::Mp4 => "mp4",
            Format::Mov => "mov",
            Format::Gif => "gif",
        }
    }

    /// File extension of the produced artifact.
    pub fn extension(self) -> &'static str {
        match self {
            Format::Jpeg => "jpg",
            other => other.as_str(),
        }
    }

    /// Image and video formats take [`RenderParams`].
    pub fn takes_params(self) -> bool {
        matches!(self, Format::Jpeg | Format::Mp4 | Format::Mov | Format::Gif)
    }

    pub fn task_name(self) -> String {
        format!("render_{}", self.as_str())
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let lower = if lower == "jpg" { "jpeg".to_string() } else { lower };
        Format::ALL
            .into_iter()
            .find(|f| f.as_str() == lower)
            .ok_or_else(|| TaskError::UnsupportedFormat(s.to_string()))
    }
}

/// Camera and timing settings for image and video output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderParams {
    #[serde(default = "default_resolution")]
    pub resolution_x: u32,
    #[serde(default = "default_resolution")]
    pub resolution_y: u32,
    #[serde(default = "default_frame_start")]
    pub frame_start: u32,
    #[serde(default = "default_frame_end")]
    pub frame_end: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
}

fn default_resolution() -> u32 {
    1024
}

fn default_frame_start() -> u32 {
    1
}

fn default_frame_end() -> u32 {
    48
}

fn default_fps() -> u32 {
    24
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            resolution_x: default_resolution(),
            resolution_y: default_resolution(),
            frame_start: default_frame_start(),
            frame_end: default_frame_end(),
            fps: default_fps(),
        }
    }
}

/// Everything an exporter needs for one artifact. The scene already carries
/// the applied attributes when the exporter runs.
pub struct ExportRequest<'a> {
    pub format: Format,
    pub metadata: &'a Metadata,
    pub params: &'a RenderParams,
    pub scene: &'a dyn SceneAssetProvider,
    pub dest: &'a Path,
}

pub trait Exporter: Send + Sync {
    fn format(&self) -> Format;

    /// True when this environment cannot produce the format at all.
    fn capability_missing(&self) -> bool {
        false
    }

    /// Writes the artifact to `request.dest` and returns its path.
    fn export(&self, request: &ExportRequest<'_>) -> Result<PathBuf, ExportError>;
}

/// External program invocation, as configured per format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Runs an external program per artifact.
///
/// Arguments may use `{metadata}` (path of a JSON file holding the format,
/// metadata and params), `{dest}`, `{format}`, `{id}`, `{resolution_x}`,
/// `{resolution_y}`, `{frame_start}`, `{frame_end}` and `{fps}`.
pub struct CommandExporter {
    format: Format,
    command: ExporterCommand,
}

#[derive(Serialize)]
struct ExportJobFile<'a> {
    format: Format,
    metadata: &'a Metadata,
    params: &'a RenderParams,
    dest: &'a Path,
}

impl CommandExporter {
    pub fn new(format: Format, command: ExporterCommand) -> Self {
        Self { format, command }
    }

    fn expand(&self, arg: &str, request: &ExportRequest<'_>, job_file: &Path) -> String {
        let p = request.params;
        arg.replace("{metadata}", &job_file.display().to_string())
            .replace("{dest}", &request.dest.display().to_string())
            .replace("{format}", request.format.as_str())
            .replace("{id}", &request.metadata.id.to_string())
            .replace("{resolution_x}", &p.resolution_x.to_string())
            .replace("{resolution_y}", &p.resolution_y.to_string())
            .replace("{frame_start}", &p.frame_start.to_string())
            .replace("{frame_end}", &p.frame_end.to_string())
            .replace("{fps}", &p.fps.to_string())
    }
}

impl Exporter for CommandExporter {
    fn format(&self) -> Format {
        self.format
    }

    fn capability_missing(&self) -> bool {
        find_program(&self.command.program).is_none()
    }

    fn export(&self, request: &ExportRequest<'_>) -> Result<PathBuf, ExportError> {
        let job_file = request.dest.with_extension("job.json");
        let body = ExportJobFile {
            format: request.format,
            metadata: request.metadata,
            params: request.params,
            dest: request.dest,
        };
        std::fs::write(&job_file, serde_json::to_vec_pretty(&body)?)?;

        let args: Vec<String> = self
            .command
            .args
            .iter()
            .map(|a| self.expand(a, request, &job_file))
            .collect();
        tracing::debug!(program = %self.command.program, ?args, "running exporter");
        let output = Command::new(&self.command.program).args(&args).output();
        let _ = std::fs::remove_file(&job_file);
        let output = output?;

        if !output.status.success() {
            return Err(ExportError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !request.dest.exists() {
            return Err(ExportError::MissingArtifact(request.dest.display().to_string()));
        }
        Ok(request.dest.to_path_buf())
    }
}

/// Resolves a program name against `PATH`, or checks an explicit path.
fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// Exporters keyed by format.
#[derive(Default)]
pub struct ExporterRegistry {
    exporters: HashMap<Format, Box<dyn Exporter>>,
}

impl ExporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds command exporters from `format name -> command`; unknown
    /// format names are skipped with a warning.
    pub fn from_commands(commands: &BTreeMap<String, ExporterCommand>) -> Self {
        let mut registry = Self::new();
        for (name, command) in commands {
            match name.parse::<Format>() {
                Ok(format) => registry.register(Box::new(CommandExporter::new(format, command.clone()))),
                Err(_) => tracing::warn!(format = %name, "ignoring exporter for unknown format"),
            }
        }
        registry
    }

    pub fn register(&mut self, exporter: Box<dyn Exporter>) {
        self.exporters.insert(exporter.format(), exporter);
    }

    /// The exporter for `format`, or `UnsupportedFormat` when none is
    /// registered or it cannot run here.
    pub fn get(&self, format: Format) -> Result<&dyn Exporter, TaskError> {
        match self.exporters.get(&format) {
            Some(exporter) if !exporter.capability_missing() => Ok(exporter.as_ref()),
            _ => Err(TaskError::UnsupportedFormat(format.to_string())),
        }
    }

    pub fn supports(&self, format: Format) -> bool {
        self.get(format).is_ok()
    }

    pub fn available(&self) -> Vec<Format> {
        Format::ALL.into_iter().filter(|f| self.supports(*f)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::fixtures::character_scene;

    #[test]
    fn format_names_and_extensions() {
        assert_eq!("JPG".parse::<Format>().unwrap(), Format::Jpeg);
        assert_eq!(Format::Jpeg.extension(), "jpg");
        assert_eq!(Format::Usdz.task_name(), "render_usdz");
        assert!(Format::Gif.takes_params());
        assert!(!Format::Vrm.takes_params());
        assert_eq!(
            "obj".parse::<Format>().unwrap_err(),
            TaskError::UnsupportedFormat("obj".into())
        );
    }

    #[test]
    fn render_params_fill_defaults() {
        let params: RenderParams = serde_json::from_str(r#"{"resolution_x": 512}"#).unwrap();
        assert_eq!(params.resolution_x, 512);
        assert_eq!(params.resolution_y, 1024);
        assert_eq!(params.frame_end, 48);
        assert_eq!(params.fps, 24);
    }

    #[test]
    fn missing_program_is_unsupported() {
        let mut registry = ExporterRegistry::new();
        registry.register(Box::new(CommandExporter::new(
            Format::Vrm,
            ExporterCommand {
                program: "traitforge-no-such-exporter".into(),
                args: vec![],
            },
        )));
        assert_eq!(
            registry.get(Format::Vrm).err(),
            Some(TaskError::UnsupportedFormat("vrm".into()))
        );
        assert!(!registry.supports(Format::Glb));
        assert!(registry.available().is_empty());
    }

    #[test]
    fn unknown_format_names_are_skipped() {
        let mut commands = BTreeMap::new();
        commands.insert(
            "obj".to_string(),
            ExporterCommand {
                program: "sh".into(),
                args: vec![],
            },
        );
        let registry = ExporterRegistry::from_commands(&commands);
        assert!(registry.exporters.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn command_exporter_runs_program_with_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc.jpg");
        let exporter = CommandExporter::new(
            Format::Jpeg,
            ExporterCommand {
                program: "sh".into(),
                args: vec![
                    "-c".into(),
                    "cp {metadata} {dest} && echo {resolution_x}x{resolution_y}@{fps} >> {dest}".into(),
                ],
            },
        );
        assert!(!exporter.capability_missing());

        let scene = character_scene();
        let metadata = Metadata {
            id: 12,
            ..Default::default()
        };
        let params = RenderParams {
            resolution_x: 640,
            resolution_y: 480,
            ..Default::default()
        };
        let path = exporter
            .export(&ExportRequest {
                format: Format::Jpeg,
                metadata: &metadata,
                params: &params,
                scene: &scene,
                dest: &dest,
            })
            .unwrap();

        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains(r#""id": 12"#), "{written}");
        assert!(written.trim_end().ends_with("640x480@24"), "{written}");
        assert!(!dest.with_extension("job.json").exists());
    }

    #[cfg(unix)]
    #[test]
    fn command_exporter_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc.glb");
        let scene = character_scene();
        let metadata = Metadata::default();
        let params = RenderParams::default();
        let request = ExportRequest {
            format: Format::Glb,
            metadata: &metadata,
            params: &params,
            scene: &scene,
            dest: &dest,
        };

        let failing = CommandExporter::new(
            Format::Glb,
            ExporterCommand {
                program: "sh".into(),
                args: vec!["-c".into(), "echo boom >&2; exit 3".into()],
            },
        );
        match failing.export(&request).unwrap_err() {
            ExportError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected {other:?}"),
        }

        let silent = CommandExporter::new(
            Format::Glb,
            ExporterCommand {
                program: "sh".into(),
                args: vec!["-c".into(), "true".into()],
            },
        );
        assert!(matches!(
            silent.export(&request).unwrap_err(),
            ExportError::MissingArtifact(_)
        ));
    }
}
