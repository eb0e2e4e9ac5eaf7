//! # carousel - Carousel Video Assembler
//!
//! `carousel` stitches an ordered set of still images and short video clips
//! into one continuous 16:9 video: every asset is rendered onto a blurred,
//! slowly zooming background, overlaid centered on the canvas, optionally
//! captioned with its fading filename, and joined to its neighbours with
//! video and audio crossfades.
//!
//! ## Features
//!
//! - Deterministic, filename-sorted carousel order
//! - Parallel clip rendering on a bounded worker pool
//! - Batched crossfade concatenation with exact transition offsets
//! - Incremental stream-copy folding that bounds peak temporary storage
//! - Guaranteed cleanup of the temporary working area on every exit path
//!
//! ## Example
//!
//! ```no_run
//! use carousel::{CarouselAssembler, CarouselConfig};
//! use carousel::engine::FfmpegEngine;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CarouselConfig::default().with_threads(4);
//! let assembler = CarouselAssembler::new(config)?;
//! let engine = FfmpegEngine::new();
//! assembler.assemble(Path::new("assets"), Path::new("carousel.mp4"), &engine)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Progress Reporting
//!
//! For UI integration, [`CarouselAssembler::assemble_with_progress`] reports
//! phase changes and per-clip completion:
//!
//! ```no_run
//! use carousel::{CarouselAssembler, CarouselConfig, ProgressPhase};
//! use carousel::engine::FfmpegEngine;
//! use std::path::Path;
//!
//! let assembler = CarouselAssembler::new(CarouselConfig::default()).unwrap();
//! assembler.assemble_with_progress(
//!     Path::new("assets"),
//!     Path::new("carousel.mp4"),
//!     &FfmpegEngine::new(),
//!     |progress| match progress.phase {
//!         ProgressPhase::RenderingClips => {
//!             println!("Rendering: {}/{}", progress.completed, progress.total);
//!         }
//!         _ => println!("{}", progress.message),
//!     },
//! ).unwrap();
//! ```

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

pub mod engine;
pub mod plan;

pub use engine::{FfmpegEngine, MediaProbe, RenderInput, RenderRequest, TranscodingEngine};
pub use plan::{plan_clips, ClipPlan, FPS};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CarouselError>;

/// Error taxonomy of the assembly pipeline. Every variant aborts the whole
/// run; there is no retry and no partial output.
#[derive(Debug, thiserror::Error)]
pub enum CarouselError {
    /// Configuration or an asset violates an invariant. Raised before any
    /// rendering begins.
    #[error("validation error: {0}")]
    Validation(String),

    /// No supported assets found, or the output location is unusable.
    #[error("not found: {0}")]
    NotFound(String),

    /// The transcoding engine failed; carries its diagnostic output.
    #[error("engine error while {context}: {detail}")]
    Engine { context: String, detail: String },

    /// An expected artifact is missing or empty after a reported success.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CarouselError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn engine(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Engine {
            context: context.into(),
            detail: detail.into(),
        }
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Re-attach a more specific stage description to an engine failure.
    fn for_stage(self, stage: impl Into<String>) -> Self {
        match self {
            Self::Engine { detail, .. } => Self::Engine {
                context: stage.into(),
                detail,
            },
            other => other,
        }
    }
}

/// Represents the current phase of an assembly run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressPhase {
    /// Probing assets and computing per-clip plans
    Planning,
    /// Rendering individual clips on the worker pool
    RenderingClips,
    /// Crossfade-merging a batch of rendered clips
    MergingBatches,
    /// Appending a batch segment onto the running output
    Folding,
    /// Assembly completed successfully
    Complete,
}

/// Progress information for assembly runs, suitable for driving a UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    /// Current phase of the run
    pub phase: ProgressPhase,
    /// Number of items completed in the current phase
    pub completed: usize,
    /// Total number of items in the current phase
    pub total: usize,
    /// Percentage complete (0.0 to 100.0)
    pub percentage: f64,
    /// Human-readable message describing current status
    pub message: String,
}

impl Progress {
    fn percentage_of(completed: usize, total: usize) -> f64 {
        if total > 0 {
            (completed as f64 / total as f64) * 100.0
        } else {
            0.0
        }
    }

    pub fn planning(total: usize) -> Self {
        Self {
            phase: ProgressPhase::Planning,
            completed: 0,
            total,
            percentage: 0.0,
            message: format!("Planning {} clips...", total),
        }
    }

    pub fn rendering_clips(completed: usize, total: usize) -> Self {
        Self {
            phase: ProgressPhase::RenderingClips,
            completed,
            total,
            percentage: Self::percentage_of(completed, total),
            message: format!("Rendered clip {} of {}", completed, total),
        }
    }

    pub fn merging_batch(batch: usize, batch_count: usize) -> Self {
        Self {
            phase: ProgressPhase::MergingBatches,
            completed: batch,
            total: batch_count,
            percentage: Self::percentage_of(batch, batch_count),
            message: format!("Merging batch {} of {}", batch, batch_count),
        }
    }

    pub fn folding(batch: usize, batch_count: usize) -> Self {
        Self {
            phase: ProgressPhase::Folding,
            completed: batch,
            total: batch_count,
            percentage: Self::percentage_of(batch, batch_count),
            message: format!("Folding batch {} into the output", batch),
        }
    }

    pub fn complete(total: usize) -> Self {
        Self {
            phase: ProgressPhase::Complete,
            completed: total,
            total,
            percentage: 100.0,
            message: format!("Assembly complete: {} clips", total),
        }
    }
}

/// Anchor of the background zoom/pan crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoomDirection {
    Center,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    /// Pick a fixed anchor per asset from the run's seeded RNG.
    Random,
}

impl ZoomDirection {
    /// Every fixed anchor, i.e. the candidates `random` draws from.
    pub const ANCHORS: [ZoomDirection; 9] = [
        ZoomDirection::Center,
        ZoomDirection::Top,
        ZoomDirection::Bottom,
        ZoomDirection::Left,
        ZoomDirection::Right,
        ZoomDirection::TopLeft,
        ZoomDirection::TopRight,
        ZoomDirection::BottomLeft,
        ZoomDirection::BottomRight,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Center => "center",
            Self::Top => "top",
            Self::Bottom => "bottom",
            Self::Left => "left",
            Self::Right => "right",
            Self::TopLeft => "top_left",
            Self::TopRight => "top_right",
            Self::BottomLeft => "bottom_left",
            Self::BottomRight => "bottom_right",
            Self::Random => "random",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "center" => Some(Self::Center),
            "top" => Some(Self::Top),
            "bottom" => Some(Self::Bottom),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "top_left" => Some(Self::TopLeft),
            "top_right" => Some(Self::TopRight),
            "bottom_left" => Some(Self::BottomLeft),
            "bottom_right" => Some(Self::BottomRight),
            "random" => Some(Self::Random),
            _ => None,
        }
    }

    pub fn available_names() -> String {
        let mut names: Vec<&str> = Self::ANCHORS.iter().map(|d| d.name()).collect();
        names.push("random");
        names.join(", ")
    }
}

/// Named crossfade styles, mapped onto the engine's transition catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStyle {
    Fade,
    FadeBlack,
    FadeWhite,
    Dissolve,
    WipeLeft,
    WipeRight,
    WipeUp,
    WipeDown,
    SlideLeft,
    SlideRight,
    CircleOpen,
    CircleClose,
    SmoothLeft,
    SmoothRight,
    Pixelize,
    Radial,
    /// Pick a style for the whole run from the seeded RNG.
    Random,
}

impl TransitionStyle {
    /// Every concrete style, i.e. the candidates `random` draws from.
    pub const CATALOG: [TransitionStyle; 16] = [
        TransitionStyle::Fade,
        TransitionStyle::FadeBlack,
        TransitionStyle::FadeWhite,
        TransitionStyle::Dissolve,
        TransitionStyle::WipeLeft,
        TransitionStyle::WipeRight,
        TransitionStyle::WipeUp,
        TransitionStyle::WipeDown,
        TransitionStyle::SlideLeft,
        TransitionStyle::SlideRight,
        TransitionStyle::CircleOpen,
        TransitionStyle::CircleClose,
        TransitionStyle::SmoothLeft,
        TransitionStyle::SmoothRight,
        TransitionStyle::Pixelize,
        TransitionStyle::Radial,
    ];

    /// The engine-side transition name.
    pub fn xfade_name(&self) -> &'static str {
        match self {
            Self::Fade | Self::Random => "fade",
            Self::FadeBlack => "fadeblack",
            Self::FadeWhite => "fadewhite",
            Self::Dissolve => "dissolve",
            Self::WipeLeft => "wipeleft",
            Self::WipeRight => "wiperight",
            Self::WipeUp => "wipeup",
            Self::WipeDown => "wipedown",
            Self::SlideLeft => "slideleft",
            Self::SlideRight => "slideright",
            Self::CircleOpen => "circleopen",
            Self::CircleClose => "circleclose",
            Self::SmoothLeft => "smoothleft",
            Self::SmoothRight => "smoothright",
            Self::Pixelize => "pixelize",
            Self::Radial => "radial",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        if name.trim().eq_ignore_ascii_case("random") {
            return Some(Self::Random);
        }
        Self::CATALOG
            .iter()
            .copied()
            .find(|style| style.xfade_name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn available_names() -> String {
        let mut names: Vec<&str> = Self::CATALOG.iter().map(|s| s.xfade_name()).collect();
        names.push("random");
        names.join(", ")
    }

    fn resolve(self, rng: &mut StdRng) -> TransitionStyle {
        match self {
            Self::Random => *Self::CATALOG.choose(rng).unwrap_or(&Self::Fade),
            fixed => fixed,
        }
    }
}

/// Accepted deviation of `width / height` from 16:9.
pub const ASPECT_TOLERANCE: f64 = 0.01;

/// Width and height for a named resolution preset.
pub fn resolution_preset(name: &str) -> Option<(u32, u32)> {
    match name.trim().to_ascii_lowercase().as_str() {
        "720p" => Some((1280, 720)),
        "1080p" => Some((1920, 1080)),
        "4k" => Some((3840, 2160)),
        _ => None,
    }
}

/// Validated run parameters for one assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CarouselConfig {
    /// Canvas width in pixels; width/height must be 16:9 within tolerance.
    pub width: u32,
    /// Canvas height in pixels.
    pub height: u32,
    /// Seconds each still image stays on screen.
    pub image_duration: f64,
    /// Cap on how much of a video asset is used, in seconds.
    pub max_video_duration: f64,
    /// Gaussian blur sigma of the background.
    pub blur_radius: f64,
    /// Background zoom factor at the start of each clip.
    pub zoom_start: f64,
    /// Background zoom factor at the end of each clip.
    pub zoom_end: f64,
    /// Anchor of the zoom/pan crop.
    pub zoom_direction: ZoomDirection,
    /// Foreground shrink factor within its fitted size, in (0, 1].
    pub overlay_scale: f64,
    /// Crossfade length in seconds; must be shorter than every clip.
    pub transition_duration: f64,
    /// Crossfade style.
    pub transition_style: TransitionStyle,
    /// Caption fade-in length in seconds.
    pub text_fade_in: f64,
    /// Caption fade-out length in seconds.
    pub text_fade_out: f64,
    /// Background opacity over black, in [0, 1].
    pub background_opacity: f64,
    /// Draw a fading filename caption on each clip.
    pub draw_text: bool,
    /// Worker pool size for clip rendering.
    pub threads: usize,
    /// Seed for the `random` zoom/transition modes. Unset means a fresh
    /// seed per run.
    pub seed: Option<u64>,
}

impl Default for CarouselConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            image_duration: 5.0,
            max_video_duration: 10.0,
            blur_radius: 20.0,
            zoom_start: 1.0,
            zoom_end: 1.2,
            zoom_direction: ZoomDirection::Center,
            overlay_scale: 0.9,
            transition_duration: 1.0,
            transition_style: TransitionStyle::Fade,
            text_fade_in: 0.5,
            text_fade_out: 0.5,
            background_opacity: 1.0,
            draw_text: false,
            threads: 4,
            seed: None,
        }
    }
}

impl CarouselConfig {
    pub fn with_canvas(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_image_duration(mut self, seconds: f64) -> Self {
        self.image_duration = seconds;
        self
    }

    pub fn with_max_video_duration(mut self, seconds: f64) -> Self {
        self.max_video_duration = seconds;
        self
    }

    pub fn with_transition(mut self, seconds: f64, style: TransitionStyle) -> Self {
        self.transition_duration = seconds;
        self.transition_style = style;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check every configuration invariant. Runs before anything is probed,
    /// rendered or created on disk.
    pub fn validate(&self) -> Result<()> {
        if self.threads < 1 {
            return Err(CarouselError::validation("threads must be at least 1"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(CarouselError::validation(
                "canvas dimensions must be nonzero",
            ));
        }
        let ratio = self.width as f64 / self.height as f64;
        if (ratio - 16.0 / 9.0).abs() > ASPECT_TOLERANCE {
            return Err(CarouselError::validation(format!(
                "canvas {}x{} is not 16:9 (ratio {:.4})",
                self.width, self.height, ratio
            )));
        }
        if !(self.overlay_scale > 0.0 && self.overlay_scale <= 1.0) {
            return Err(CarouselError::validation(format!(
                "overlay scale must be within (0, 1], got {}",
                self.overlay_scale
            )));
        }
        if !(0.0..=1.0).contains(&self.background_opacity) {
            return Err(CarouselError::validation(format!(
                "background opacity must be within [0, 1], got {}",
                self.background_opacity
            )));
        }
        if self.image_duration <= 0.0 || self.max_video_duration <= 0.0 {
            return Err(CarouselError::validation("clip durations must be positive"));
        }
        if self.transition_duration < 0.0
            || self.transition_duration >= self.image_duration.min(self.max_video_duration)
        {
            return Err(CarouselError::validation(format!(
                "transition duration {}s must be non-negative and shorter than every clip",
                self.transition_duration
            )));
        }
        if self.zoom_start <= 0.0 || self.zoom_end <= 0.0 {
            return Err(CarouselError::validation("zoom factors must be positive"));
        }
        if self.blur_radius < 0.0 {
            return Err(CarouselError::validation(format!(
                "blur radius must be non-negative, got {}",
                self.blur_radius
            )));
        }
        if self.text_fade_in < 0.0 || self.text_fade_out < 0.0 {
            return Err(CarouselError::validation(
                "caption fade durations must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Extensions recognized as still images.
pub const SUPPORTED_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
/// Extensions recognized as video clips.
pub const SUPPORTED_VIDEO_EXTENSIONS: &[&str] = &["mp4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Video,
}

impl AssetKind {
    /// Classify a path by extension; `None` for unsupported files.
    pub fn from_path(path: &Path) -> Option<AssetKind> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(AssetKind::Image)
        } else if SUPPORTED_VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(AssetKind::Video)
        } else {
            None
        }
    }
}

/// One discovered input file. `index` is its position in the filename-sorted
/// sequence and therefore its position in the carousel.
#[derive(Debug, Clone, PartialEq)]
pub struct InputAsset {
    pub path: PathBuf,
    pub kind: AssetKind,
    pub index: usize,
}

/// List supported assets directly under `input_dir`, sorted by filename.
///
/// The sort is pure lexicographic: it IS the carousel order, independent of
/// how or when files arrived in the directory.
pub fn scan_assets(input_dir: &Path) -> Result<Vec<InputAsset>> {
    let mut found: Vec<(PathBuf, AssetKind)> = WalkDir::new(input_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file())
        .filter_map(|p| AssetKind::from_path(&p).map(|kind| (p, kind)))
        .collect();
    found.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));

    if found.is_empty() {
        return Err(CarouselError::not_found(format!(
            "no supported assets found in {}",
            input_dir.display()
        )));
    }

    Ok(found
        .into_iter()
        .enumerate()
        .map(|(index, (path, kind))| InputAsset { path, kind, index })
        .collect())
}

/// A rendered temporary clip. Produced exactly once per plan, consumed by
/// exactly one batch merge.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedClip {
    pub path: PathBuf,
    pub duration: f64,
    pub asset_index: usize,
}

/// Upper bound on clips handed to a single crossfade invocation. A chain of
/// B clips needs B inputs and B-1 transition stages in one engine call, so
/// the bound keeps command size and engine resource use flat for any N.
pub fn batch_size(threads: usize) -> usize {
    (threads * 2).clamp(1, 10)
}

/// Transition offsets for a batch: `offset_k = max(0, offset_{k-1} +
/// duration_{k-1} - transition)`. Returns one offset per crossfade stage.
pub fn crossfade_offsets(durations: &[f64], transition_duration: f64) -> Vec<f64> {
    let mut offsets = Vec::with_capacity(durations.len().saturating_sub(1));
    let mut offset = 0.0_f64;
    for k in 1..durations.len() {
        offset = (offset + durations[k - 1] - transition_duration).max(0.0);
        offsets.push(offset);
    }
    offsets
}

fn build_crossfade_request(
    clips: &[RenderedClip],
    transition_duration: f64,
    style: TransitionStyle,
    output: PathBuf,
) -> RenderRequest {
    let durations: Vec<f64> = clips.iter().map(|c| c.duration).collect();
    let offsets = crossfade_offsets(&durations, transition_duration);

    let mut graph = String::new();
    let mut last_video = "[0:v]".to_string();
    let mut last_audio = "[0:a]".to_string();
    for (stage, offset) in offsets.iter().enumerate() {
        let i = stage + 1;
        if !graph.is_empty() {
            graph.push(';');
        }
        graph.push_str(&format!(
            "{lv}[{i}:v]xfade=transition={t}:duration={d}:offset={o}[v{i}];\
             {la}[{i}:a]acrossfade=d={d}[a{i}]",
            lv = last_video,
            la = last_audio,
            t = style.xfade_name(),
            d = transition_duration,
            o = offset,
        ));
        last_video = format!("[v{i}]");
        last_audio = format!("[a{i}]");
    }

    RenderRequest {
        inputs: clips
            .iter()
            .map(|c| RenderInput::File(c.path.clone()))
            .collect(),
        filter_graph: graph,
        maps: vec![last_video, last_audio],
        duration: None,
        output,
    }
}

/// Process-scoped temporary working area. Every rendered clip and batch
/// segment lives under it; dropping the guard removes the directory and all
/// contents, on success and on every error path alike.
struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    fn create() -> Result<Self> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "carousel_work_{}_{}",
            std::process::id(),
            stamp
        ));
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Main entry point: assembles a carousel video from a directory of assets.
#[derive(Debug)]
pub struct CarouselAssembler {
    config: CarouselConfig,
}

impl CarouselAssembler {
    /// Create an assembler with a validated configuration.
    pub fn new(config: CarouselConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Assemble all supported assets under `input_dir` into `output_file`.
    ///
    /// Returns the output path on success. On any failure the target path is
    /// left untouched and the temporary working area is removed.
    pub fn assemble<E>(&self, input_dir: &Path, output_file: &Path, engine: &E) -> Result<PathBuf>
    where
        E: TranscodingEngine,
    {
        self.assemble_with_progress(input_dir, output_file, engine, |_| {})
    }

    /// [`assemble`](Self::assemble) with per-phase progress callbacks.
    pub fn assemble_with_progress<E, F>(
        &self,
        input_dir: &Path,
        output_file: &Path,
        engine: &E,
        progress: F,
    ) -> Result<PathBuf>
    where
        E: TranscodingEngine,
        F: Fn(Progress) + Send + Sync,
    {
        use std::sync::atomic::{AtomicUsize, Ordering};

        ensure_output_writable(output_file)?;
        let assets = scan_assets(input_dir)?;
        let total = assets.len();

        let mut rng = StdRng::seed_from_u64(self.config.seed.unwrap_or_else(rand::random));
        let transition = self.config.transition_style.resolve(&mut rng);

        progress(Progress::planning(total));
        let plans = plan_clips(&self.config, &assets, engine, &mut rng)?;

        let workdir = WorkDir::create()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .build()
            .map_err(|e| CarouselError::validation(format!("failed to build worker pool: {e}")))?;

        let size = batch_size(self.config.threads);
        let batch_count = total.div_ceil(size);
        let completed = AtomicUsize::new(0);

        // Batches run strictly in order; only the clips inside one batch are
        // rendered in parallel. Rendering per batch also bounds how many
        // temporary clips exist at once.
        let mut current: Option<PathBuf> = None;
        for (batch_index, batch) in plans.chunks(size).enumerate() {
            let clips = pool.install(|| {
                batch
                    .par_iter()
                    .map(|plan| {
                        let clip_path = workdir
                            .path()
                            .join(format!("clip_{:03}.mp4", plan.asset_index));
                        let request =
                            plan::build_clip_request(&self.config, plan, clip_path.clone());
                        engine.render(&request).map_err(|e| {
                            e.for_stage(format!("rendering clip for {}", plan.source.display()))
                        })?;
                        check_artifact(
                            &clip_path,
                            &format!("rendered clip for {}", plan.source.display()),
                        )?;
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        progress(Progress::rendering_clips(done, total));
                        Ok(RenderedClip {
                            path: clip_path,
                            duration: plan.duration,
                            asset_index: plan.asset_index,
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })?;

            progress(Progress::merging_batch(batch_index + 1, batch_count));
            let segment = workdir.path().join(format!("batch_{batch_index:03}.mp4"));
            if let [only] = clips.as_slice() {
                // A one-clip batch needs no crossfade and no re-encode.
                fs::rename(&only.path, &segment)?;
            } else {
                let request = build_crossfade_request(
                    &clips,
                    self.config.transition_duration,
                    transition,
                    segment.clone(),
                );
                engine
                    .render(&request)
                    .map_err(|e| e.for_stage(format!("crossfading batch {batch_index}")))?;
                check_artifact(&segment, &format!("segment for batch {batch_index}"))?;
                for clip in &clips {
                    let _ = fs::remove_file(&clip.path);
                }
            }

            current = Some(match current.take() {
                None => segment,
                Some(previous) => {
                    progress(Progress::folding(batch_index + 1, batch_count));
                    let folded = workdir
                        .path()
                        .join(format!("assembly_{batch_index:03}.mp4"));
                    engine.concat_copy(&[previous.clone(), segment.clone()], &folded)?;
                    check_artifact(&folded, &format!("output folded after batch {batch_index}"))?;
                    let _ = fs::remove_file(&previous);
                    let _ = fs::remove_file(&segment);
                    folded
                }
            });
        }

        let assembled =
            current.ok_or_else(|| CarouselError::integrity("assembly produced no segments"))?;
        move_into_place(&assembled, output_file)?;

        progress(Progress::complete(total));
        Ok(output_file.to_path_buf())
    }
}

fn ensure_output_writable(output_file: &Path) -> Result<()> {
    let parent = match output_file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| {
        CarouselError::not_found(format!(
            "cannot create output directory {}: {}",
            parent.display(),
            e
        ))
    })?;
    let meta = fs::metadata(parent)?;
    if meta.permissions().readonly() {
        return Err(CarouselError::not_found(format!(
            "output directory {} is not writable",
            parent.display()
        )));
    }
    Ok(())
}

fn check_artifact(path: &Path, what: &str) -> Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(CarouselError::integrity(format!(
            "{what} at {} is empty",
            path.display()
        ))),
        Err(_) => Err(CarouselError::integrity(format!(
            "{what} at {} is missing",
            path.display()
        ))),
    }
}

/// Move the finished assembly to the target path, falling back to copy +
/// delete when the rename crosses filesystems.
fn move_into_place(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        fs::remove_file(to)?;
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}
