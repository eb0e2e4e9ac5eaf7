use anyhow::{anyhow, Context, Result};
use carousel::engine::FfmpegEngine;
use carousel::{
    resolution_preset, CarouselAssembler, CarouselConfig, ProgressPhase, TransitionStyle,
    ZoomDirection,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

fn load_config(explicit: Option<&PathBuf>) -> Result<CarouselConfig> {
    // Look for carousel.json in app support, current dir fallback, then built-in default
    let mut tried: Vec<PathBuf> = Vec::new();
    if let Some(p) = explicit {
        if !p.exists() {
            return Err(anyhow!("Config file not found: {}", p.display()));
        }
        tried.push(p.clone());
    } else {
        if let Some(mut d) = dirs::data_dir() {
            d.push("carousel");
            d.push("carousel.json");
            tried.push(d);
        }
        tried.push(PathBuf::from("carousel.json"));
    }

    for p in &tried {
        if p.exists() {
            let text =
                fs::read_to_string(p).with_context(|| format!("reading config {}", p.display()))?;
            let cfg: CarouselConfig =
                serde_json::from_str(&text).context("parsing config json")?;
            return Ok(cfg);
        }
    }

    // Built-in defaults
    Ok(CarouselConfig::default())
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Assemble images and video clips into a 16:9 carousel video."
)]
struct Args {
    /// Directory containing the images and clips to assemble
    input_dir: PathBuf,

    /// Path of the assembled video
    #[arg(long, short, default_value = "carousel.mp4")]
    output_file: PathBuf,

    /// Resolution preset: 720p, 1080p or 4k
    #[arg(long, conflicts_with_all = &["width", "height"])]
    resolution: Option<String>,

    /// Canvas width in pixels (must stay 16:9 together with --height)
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Canvas height in pixels
    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Seconds each still image stays on screen
    #[arg(long)]
    image_duration: Option<f64>,

    /// Maximum seconds taken from each video clip
    #[arg(long)]
    max_video_duration: Option<f64>,

    /// Gaussian blur sigma of the background
    #[arg(long)]
    blur_radius: Option<f64>,

    /// Background zoom factor at the start of each clip
    #[arg(long)]
    zoom_start: Option<f64>,

    /// Background zoom factor at the end of each clip
    #[arg(long)]
    zoom_end: Option<f64>,

    /// Zoom anchor (center, top, bottom_right, ..., or random)
    #[arg(long)]
    zoom_direction: Option<String>,

    /// Foreground shrink factor within its fitted size, in (0, 1]
    #[arg(long)]
    overlay_scale: Option<f64>,

    /// Crossfade length in seconds
    #[arg(long)]
    transition_duration: Option<f64>,

    /// Crossfade style (fade, wipeleft, circleopen, ..., or random)
    #[arg(long)]
    transition_type: Option<String>,

    /// Caption fade-in length in seconds
    #[arg(long)]
    text_fade_in: Option<f64>,

    /// Caption fade-out length in seconds
    #[arg(long)]
    text_fade_out: Option<f64>,

    /// Background opacity over black, 0.0 to 1.0
    #[arg(long)]
    background_opacity: Option<f64>,

    /// Draw a fading filename caption on each clip (--draw-text=false
    /// disables a config-file setting)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    draw_text: Option<bool>,

    /// Worker pool size for clip rendering
    #[arg(long, short)]
    threads: Option<usize>,

    /// Seed for the random zoom/transition modes (reproducible runs)
    #[arg(long)]
    seed: Option<u64>,

    /// Path to the ffmpeg binary (ffprobe is expected next to it)
    #[arg(long)]
    ffmpeg_path: Option<PathBuf>,

    /// Path to a JSON config file (overrides the default lookup)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn apply_overrides(mut cfg: CarouselConfig, args: &Args) -> Result<CarouselConfig> {
    if let Some(name) = &args.resolution {
        let (w, h) = resolution_preset(name)
            .ok_or_else(|| anyhow!("Unknown resolution '{}'. Available: 720p, 1080p, 4k", name))?;
        cfg.width = w;
        cfg.height = h;
    }
    if let (Some(w), Some(h)) = (args.width, args.height) {
        cfg.width = w;
        cfg.height = h;
    }
    if let Some(v) = args.image_duration {
        cfg.image_duration = v;
    }
    if let Some(v) = args.max_video_duration {
        cfg.max_video_duration = v;
    }
    if let Some(v) = args.blur_radius {
        cfg.blur_radius = v;
    }
    if let Some(v) = args.zoom_start {
        cfg.zoom_start = v;
    }
    if let Some(v) = args.zoom_end {
        cfg.zoom_end = v;
    }
    if let Some(name) = &args.zoom_direction {
        cfg.zoom_direction = ZoomDirection::from_name(name).ok_or_else(|| {
            anyhow!(
                "Unknown zoom direction '{}'. Available: {}",
                name,
                ZoomDirection::available_names()
            )
        })?;
    }
    if let Some(v) = args.overlay_scale {
        cfg.overlay_scale = v;
    }
    if let Some(v) = args.transition_duration {
        cfg.transition_duration = v;
    }
    if let Some(name) = &args.transition_type {
        cfg.transition_style = TransitionStyle::from_name(name).ok_or_else(|| {
            anyhow!(
                "Unknown transition '{}'. Available: {}",
                name,
                TransitionStyle::available_names()
            )
        })?;
    }
    if let Some(v) = args.text_fade_in {
        cfg.text_fade_in = v;
    }
    if let Some(v) = args.text_fade_out {
        cfg.text_fade_out = v;
    }
    if let Some(v) = args.background_opacity {
        cfg.background_opacity = v;
    }
    if let Some(v) = args.draw_text {
        cfg.draw_text = v;
    }
    if let Some(v) = args.threads {
        cfg.threads = v;
    }
    if let Some(v) = args.seed {
        cfg.seed = Some(v);
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    let args = Args::parse();

    if !args.input_dir.is_dir() {
        return Err(anyhow!(
            "Input directory does not exist: {}",
            args.input_dir.display()
        ));
    }

    let cfg = apply_overrides(load_config(args.config.as_ref())?, &args)?;
    let assembler = CarouselAssembler::new(cfg).context("validating configuration")?;

    let engine = match &args.ffmpeg_path {
        Some(path) => FfmpegEngine::with_ffmpeg_path(path),
        None => FfmpegEngine::new(),
    };

    println!("Assembling carousel from {}...", args.input_dir.display());

    // Create progress bar (will be initialized once we know the clip count)
    let progress_bar: Arc<Mutex<Option<ProgressBar>>> = Arc::new(Mutex::new(None));
    let pb_clone = Arc::clone(&progress_bar);

    let output = assembler
        .assemble_with_progress(
            &args.input_dir,
            &args.output_file,
            &engine,
            move |progress| {
                let mut pb_guard = pb_clone.lock().unwrap();
                if pb_guard.is_none() {
                    // Initialize progress bar on first callback
                    let pb = ProgressBar::new(progress.total as u64);
                    pb.set_style(
                        ProgressStyle::default_bar()
                            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                            .unwrap()
                            .progress_chars("#>-"),
                    );
                    *pb_guard = Some(pb);
                }
                if let Some(ref pb) = *pb_guard {
                    if progress.phase == ProgressPhase::RenderingClips {
                        pb.set_position(progress.completed as u64);
                    }
                    pb.set_message(progress.message.clone());
                }
            },
        )
        .with_context(|| format!("assembling {}", args.input_dir.display()))?;

    let pb_opt = progress_bar.lock().unwrap().take();
    if let Some(pb) = pb_opt {
        pb.finish_with_message("Done");
    }

    println!("\nCarousel written to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_text_flag_overrides_config_both_ways() {
        let cfg = CarouselConfig {
            draw_text: true,
            ..CarouselConfig::default()
        };

        // A config-file setting can be switched off from the command line.
        let args = Args::parse_from(["carousel", "assets", "--draw-text=false"]);
        let cfg = apply_overrides(cfg, &args).unwrap();
        assert!(!cfg.draw_text);

        // The bare flag still enables captioning.
        let args = Args::parse_from(["carousel", "assets", "--draw-text"]);
        let cfg = apply_overrides(cfg, &args).unwrap();
        assert!(cfg.draw_text);

        // Absent flag leaves the config value alone.
        let args = Args::parse_from(["carousel", "assets"]);
        assert_eq!(args.draw_text, None);
        let cfg = apply_overrides(cfg, &args).unwrap();
        assert!(cfg.draw_text);
    }

    #[test]
    fn resolution_preset_overrides_canvas_dimensions() {
        let args = Args::parse_from(["carousel", "assets", "--resolution", "1080p"]);
        let cfg = apply_overrides(CarouselConfig::default(), &args).unwrap();
        assert_eq!((cfg.width, cfg.height), (1920, 1080));

        let args = Args::parse_from(["carousel", "assets", "--resolution", "8k"]);
        assert!(apply_overrides(CarouselConfig::default(), &args).is_err());
    }
}
