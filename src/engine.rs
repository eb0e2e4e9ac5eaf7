//! Transcoding engine interface and its ffmpeg-backed implementation.
//!
//! The pipeline never touches pixels or samples itself; everything it needs
//! from the outside world is a metadata query, a filter-graph render, or a
//! zero-re-encode concatenation. Those three capabilities form the
//! [`TranscodingEngine`] trait, so tests (or another backend entirely) can
//! substitute their own implementation.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as ProcCommand;

use crate::{AssetKind, CarouselError, Result};

/// Metadata for a media file as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaProbe {
    pub width: u32,
    pub height: u32,
    /// Duration in seconds; `None` for still images.
    pub duration: Option<f64>,
    pub has_audio: bool,
}

/// One input source of a render request.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderInput {
    /// A regular media file.
    File(PathBuf),
    /// A still image looped into a continuous video stream.
    LoopedImage(PathBuf),
    /// A synthetic source such as `anullsrc=...`.
    Source(String),
}

/// A structured filter-graph invocation: input sources, filter expressions,
/// output stream mapping and an output path. Encoding parameters are fixed
/// to the carousel profile (H.264/AAC, fast-start layout).
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub inputs: Vec<RenderInput>,
    pub filter_graph: String,
    /// Output stream labels to map, e.g. `["[v]", "[a]"]`.
    pub maps: Vec<String>,
    /// Hard output duration in seconds, when the graph does not bound it.
    pub duration: Option<f64>,
    pub output: PathBuf,
}

/// Capability interface of the external transcoding engine.
pub trait TranscodingEngine: Send + Sync {
    /// Query dimensions, duration and audio availability of a media file.
    fn probe(&self, path: &Path) -> Result<MediaProbe>;

    /// Execute one filter-graph request, producing `request.output`.
    fn render(&self, request: &RenderRequest) -> Result<()>;

    /// Stream-copy concatenation of `inputs` into `output`, no re-encode.
    fn concat_copy(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;
}

const ENCODE_ARGS: &[&str] = &[
    "-c:v",
    "libx264",
    "-pix_fmt",
    "yuv420p",
    "-preset",
    "ultrafast",
    "-crf",
    "23",
    "-c:a",
    "aac",
    "-b:a",
    "128k",
    "-movflags",
    "+faststart",
];

/// Engine backed by the `ffmpeg`/`ffprobe` command-line tools.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg_cmd: PathBuf,
    ffprobe_cmd: PathBuf,
}

impl FfmpegEngine {
    /// Resolve `ffmpeg` and `ffprobe` from `PATH`.
    pub fn new() -> Self {
        Self {
            ffmpeg_cmd: PathBuf::from("ffmpeg"),
            ffprobe_cmd: PathBuf::from("ffprobe"),
        }
    }

    /// Use a specific ffmpeg binary; ffprobe is expected next to it.
    pub fn with_ffmpeg_path(ffmpeg: &Path) -> Self {
        Self {
            ffprobe_cmd: ffprobe_sibling(ffmpeg),
            ffmpeg_cmd: ffmpeg.to_path_buf(),
        }
    }

    fn ffprobe(&self, args: &[&str], path: &Path) -> Result<String> {
        let context = || format!("probing {}", path.display());
        let output = ProcCommand::new(&self.ffprobe_cmd)
            .args(args)
            .arg(path)
            .output()
            .map_err(|e| CarouselError::engine(context(), e.to_string()))?;
        if !output.status.success() {
            return Err(CarouselError::engine(
                context(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscodingEngine for FfmpegEngine {
    fn probe(&self, path: &Path) -> Result<MediaProbe> {
        // Still images are probed in-process; spawning ffprobe per image is
        // needless overhead when only dimensions are wanted.
        if matches!(AssetKind::from_path(path), Some(AssetKind::Image)) {
            let (width, height) = image::image_dimensions(path).map_err(|e| {
                CarouselError::engine(format!("probing {}", path.display()), e.to_string())
            })?;
            return Ok(MediaProbe {
                width,
                height,
                duration: None,
                has_audio: false,
            });
        }

        let dims = self.ffprobe(
            &[
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=p=0",
            ],
            path,
        )?;
        let mut parts = dims.trim().split(',');
        let (width, height) = match (
            parts.next().and_then(|v| v.parse::<u32>().ok()),
            parts.next().and_then(|v| v.parse::<u32>().ok()),
        ) {
            (Some(w), Some(h)) => (w, h),
            _ => {
                return Err(CarouselError::engine(
                    format!("probing {}", path.display()),
                    format!("unexpected dimension output: {}", dims.trim()),
                ))
            }
        };

        let duration_raw = self.ffprobe(
            &[
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "csv=p=0",
            ],
            path,
        )?;
        let duration = duration_raw.trim().parse::<f64>().ok();

        let audio_streams = self.ffprobe(
            &[
                "-v",
                "error",
                "-select_streams",
                "a",
                "-show_entries",
                "stream=codec_type",
                "-of",
                "csv=p=0",
            ],
            path,
        )?;

        Ok(MediaProbe {
            width,
            height,
            duration,
            has_audio: !audio_streams.trim().is_empty(),
        })
    }

    fn render(&self, request: &RenderRequest) -> Result<()> {
        let context = || format!("rendering {}", request.output.display());
        let args = build_render_args(request);
        let output = ProcCommand::new(&self.ffmpeg_cmd)
            .args(&args)
            .output()
            .map_err(|e| CarouselError::engine(context(), e.to_string()))?;
        if !output.status.success() {
            return Err(CarouselError::engine(
                context(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn concat_copy(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let context = || format!("concatenating into {}", output.display());

        // The concat demuxer resolves relative entries against the list file,
        // so absolute paths keep it unambiguous.
        let mut listing = String::new();
        for input in inputs {
            let absolute = fs::canonicalize(input)?;
            listing.push_str(&format!("file '{}'\n", absolute.display()));
        }
        let list_path = output.with_extension("list.txt");
        fs::write(&list_path, listing)?;
        let _list_guard = TempFileGuard::new(list_path.clone());

        let result = ProcCommand::new(&self.ffmpeg_cmd)
            .args(["-loglevel", "error", "-y", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy", "-movflags", "+faststart"])
            .arg(output)
            .output()
            .map_err(|e| CarouselError::engine(context(), e.to_string()))?;
        if !result.status.success() {
            return Err(CarouselError::engine(
                context(),
                String::from_utf8_lossy(&result.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn build_render_args(request: &RenderRequest) -> Vec<String> {
    let mut args: Vec<String> = vec!["-loglevel".into(), "error".into(), "-y".into()];

    for input in &request.inputs {
        match input {
            RenderInput::File(path) => {
                args.push("-i".into());
                args.push(path.display().to_string());
            }
            RenderInput::LoopedImage(path) => {
                args.push("-loop".into());
                args.push("1".into());
                args.push("-i".into());
                args.push(path.display().to_string());
            }
            RenderInput::Source(spec) => {
                args.push("-f".into());
                args.push("lavfi".into());
                args.push("-i".into());
                args.push(spec.clone());
            }
        }
    }

    args.push("-filter_complex".into());
    args.push(request.filter_graph.clone());

    for map in &request.maps {
        args.push("-map".into());
        args.push(map.clone());
    }

    if let Some(duration) = request.duration {
        args.push("-t".into());
        args.push(duration.to_string());
    }

    args.extend(ENCODE_ARGS.iter().map(|s| s.to_string()));
    args.push(request.output.display().to_string());
    args
}

fn ffprobe_sibling(ffmpeg: &Path) -> PathBuf {
    if let Some(name) = ffmpeg.file_name().and_then(|n| n.to_str()) {
        if name.contains("ffmpeg") {
            return ffmpeg.with_file_name(name.replace("ffmpeg", "ffprobe"));
        }
    }
    PathBuf::from("ffprobe")
}

/// Removes the wrapped file when dropped.
pub(crate) struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffprobe_is_derived_as_a_sibling_of_ffmpeg() {
        assert_eq!(
            ffprobe_sibling(Path::new("/opt/media/bin/ffmpeg")),
            PathBuf::from("/opt/media/bin/ffprobe")
        );
        assert_eq!(
            ffprobe_sibling(Path::new(r"C:\tools\ffmpeg.exe")),
            PathBuf::from(r"C:\tools\ffprobe.exe")
        );
        assert_eq!(
            ffprobe_sibling(Path::new("/usr/bin/avconv")),
            PathBuf::from("ffprobe")
        );
    }

    #[test]
    fn render_args_follow_input_graph_map_output_order() {
        let request = RenderRequest {
            inputs: vec![
                RenderInput::LoopedImage(PathBuf::from("a.jpg")),
                RenderInput::Source("anullsrc=channel_layout=stereo:sample_rate=44100".into()),
            ],
            filter_graph: "[0:v]null[v];[1:a]anull[a]".into(),
            maps: vec!["[v]".into(), "[a]".into()],
            duration: Some(6.0),
            output: PathBuf::from("clip.mp4"),
        };
        let args = build_render_args(&request);

        let looped = args.iter().position(|a| a == "-loop").unwrap();
        assert_eq!(args[looped + 1], "1");
        assert_eq!(args[looped + 2], "-i");
        assert_eq!(args[looped + 3], "a.jpg");

        let lavfi = args.iter().position(|a| a == "lavfi").unwrap();
        assert_eq!(args[lavfi - 1], "-f");
        assert_eq!(args[lavfi + 1], "-i");

        let graph = args.iter().position(|a| a == "-filter_complex").unwrap();
        assert_eq!(args[graph + 1], "[0:v]null[v];[1:a]anull[a]");

        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "6");

        assert_eq!(args.iter().filter(|a| *a == "-map").count(), 2);
        assert!(args.contains(&"+faststart".to_string()));
        assert_eq!(args.last().unwrap(), "clip.mp4");
    }

    #[test]
    fn render_args_omit_duration_when_unset() {
        let request = RenderRequest {
            inputs: vec![RenderInput::File(PathBuf::from("a.mp4"))],
            filter_graph: "[0:v]null[v]".into(),
            maps: vec!["[v]".into()],
            duration: None,
            output: PathBuf::from("out.mp4"),
        };
        let args = build_render_args(&request);
        assert!(!args.contains(&"-t".to_string()));
        assert!(!args.contains(&"-loop".to_string()));
    }
}
