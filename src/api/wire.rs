//! Request and response bodies of the HTTP API.

use serde::{Deserialize, Deserializer, Serialize};

use crate::exporter::{Format, RenderParams};
use crate::model::Metadata;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreated {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCreated {
    pub batch_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Jobs waiting on the default queue.
    pub queued: usize,
    pub formats: Vec<Format>,
}

/// Body of the image and video render routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderWithParams {
    pub metadata: Metadata,
    #[serde(default)]
    pub render_params: Option<RenderParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateBatchQuery {
    pub number_to_generate: u64,
    #[serde(default = "first_id")]
    pub starting_id: u64,
}

fn first_id() -> u64 {
    1
}

/// Which formats `/render_batch` produces for every metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RenderBatchQuery {
    #[serde(default, deserialize_with = "flag")]
    pub should_render_glb: bool,
    #[serde(default, deserialize_with = "flag")]
    pub should_render_fbx: bool,
    #[serde(default, deserialize_with = "flag")]
    pub should_render_vrm: bool,
    #[serde(default, deserialize_with = "flag")]
    pub should_render_usdz: bool,
    #[serde(default, deserialize_with = "flag")]
    pub should_render_jpeg: bool,
    #[serde(default, deserialize_with = "flag")]
    pub should_render_mp4: bool,
    #[serde(default, deserialize_with = "flag")]
    pub should_render_mov: bool,
    #[serde(default, deserialize_with = "flag")]
    pub should_render_gif: bool,
}

impl RenderBatchQuery {
    /// Selected formats in declaration order.
    pub fn formats(&self) -> Vec<Format> {
        Format::ALL
            .into_iter()
            .filter(|format| match format {
                Format::Glb => self.should_render_glb,
                Format::Fbx => self.should_render_fbx,
                Format::Vrm => self.should_render_vrm,
                Format::Usdz => self.should_render_usdz,
                Format::Jpeg => self.should_render_jpeg,
                Format::Mp4 => self.should_render_mp4,
                Format::Mov => self.should_render_mov,
                Format::Gif => self.should_render_gif,
            })
            .collect()
    }
}

/// Accepts `true`/`false` in any case, plus `1`/`0`, `yes`/`no`, `on`/`off`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(serde::de::Error::custom(format!("`{other}` is not a boolean"))),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderBatchBody {
    pub metadata_list: Vec<Metadata>,
    #[serde(default)]
    pub jpeg_params: Option<RenderParams>,
    #[serde(default)]
    pub mp4_params: Option<RenderParams>,
    #[serde(default)]
    pub mov_params: Option<RenderParams>,
    #[serde(default)]
    pub gif_params: Option<RenderParams>,
}

impl RenderBatchBody {
    pub fn params_for(&self, format: Format) -> RenderParams {
        let params = match format {
            Format::Jpeg => &self.jpeg_params,
            Format::Mp4 => &self.mp4_params,
            Format::Mov => &self.mov_params,
            Format::Gif => &self.gif_params,
            _ => &None,
        };
        params.clone().unwrap_or_default()
    }
}
