//! Per-asset clip planning: durations, zoom/pan curves, overlay geometry
//! and caption fade windows.
//!
//! A [`ClipPlan`] is computed once per asset and never reads another plan's
//! state, which is what makes clip rendering safely parallel.

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::engine::{MediaProbe, RenderInput, RenderRequest, TranscodingEngine};
use crate::{AssetKind, CarouselConfig, CarouselError, InputAsset, Result, ZoomDirection};

/// Frame rate of every rendered clip.
pub const FPS: u32 = 30;

/// The blurred background is rendered slightly larger than the canvas so the
/// zoom/pan crop never runs out of pixels.
const BACKGROUND_OVERSCAN: f64 = 1.2;

const SILENT_AUDIO: &str = "anullsrc=channel_layout=stereo:sample_rate=44100";

/// Zoom/pan expressions fed to the engine's `zoompan` stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoomPan {
    pub zoom_expr: String,
    pub x_expr: String,
    pub y_expr: String,
    pub total_frames: u32,
}

/// Placement of the foreground asset on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayRect {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

/// Caption text with its fade window.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionFade {
    pub text: String,
    pub fade_in: f64,
    pub fade_out: f64,
}

/// Everything needed to render one asset's clip.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipPlan {
    pub asset_index: usize,
    pub source: PathBuf,
    pub kind: AssetKind,
    /// Clip duration in seconds. Includes the trailing transition padding
    /// for every asset except the last; the padding is consumed entirely by
    /// the crossfade overlap, so visible screen time stays at the configured
    /// duration.
    pub duration: f64,
    pub zoom_pan: ZoomPan,
    pub overlay: OverlayRect,
    pub caption: Option<CaptionFade>,
    pub has_audio: bool,
}

/// Derive one [`ClipPlan`] per asset, probing metadata through the engine.
///
/// The RNG is only consulted when `zoom_direction` is
/// [`ZoomDirection::Random`]; seed it for reproducible runs.
pub fn plan_clips<E>(
    config: &CarouselConfig,
    assets: &[InputAsset],
    engine: &E,
    rng: &mut StdRng,
) -> Result<Vec<ClipPlan>>
where
    E: TranscodingEngine + ?Sized,
{
    let mut plans = Vec::with_capacity(assets.len());
    for asset in assets {
        let probe = engine.probe(&asset.path)?;
        plans.push(plan_clip(config, asset, assets.len(), &probe, rng)?);
    }
    Ok(plans)
}

fn plan_clip(
    config: &CarouselConfig,
    asset: &InputAsset,
    total_assets: usize,
    probe: &MediaProbe,
    rng: &mut StdRng,
) -> Result<ClipPlan> {
    let base_duration = match asset.kind {
        AssetKind::Image => config.image_duration,
        AssetKind::Video => {
            let probed = probe.duration.ok_or_else(|| {
                CarouselError::integrity(format!(
                    "no duration reported for {}",
                    asset.path.display()
                ))
            })?;
            probed.min(config.max_video_duration)
        }
    };

    // Only the last clip has no crossfade tail to feed.
    let duration = if asset.index + 1 < total_assets {
        base_duration + config.transition_duration
    } else {
        base_duration
    };

    let direction = resolve_direction(config.zoom_direction, rng);
    let zoom_pan = zoom_pan_expressions(config.zoom_start, config.zoom_end, direction, duration);
    let overlay = overlay_rect(
        config.width,
        config.height,
        probe.width,
        probe.height,
        config.overlay_scale,
    );

    let caption = if config.draw_text {
        Some(caption_fade(config, &asset.path, duration)?)
    } else {
        None
    };

    let has_audio = match asset.kind {
        AssetKind::Image => false,
        AssetKind::Video => probe.has_audio,
    };

    Ok(ClipPlan {
        asset_index: asset.index,
        source: asset.path.clone(),
        kind: asset.kind,
        duration,
        zoom_pan,
        overlay,
        caption,
        has_audio,
    })
}

fn resolve_direction(direction: ZoomDirection, rng: &mut StdRng) -> ZoomDirection {
    match direction {
        ZoomDirection::Random => *ZoomDirection::ANCHORS
            .choose(rng)
            .unwrap_or(&ZoomDirection::Center),
        fixed => fixed,
    }
}

/// Linear zoom from `zoom_start` to `zoom_end` across the clip, with the
/// crop offset anchored per direction.
pub fn zoom_pan_expressions(
    zoom_start: f64,
    zoom_end: f64,
    direction: ZoomDirection,
    duration: f64,
) -> ZoomPan {
    let total_frames = (FPS as f64 * duration).round().max(1.0) as u32;
    let zoom_expr = format!("{zoom_start}+({zoom_end}-{zoom_start})*on/{total_frames}");
    let (x_expr, y_expr) = anchor_exprs(direction, &zoom_expr);
    ZoomPan {
        zoom_expr,
        x_expr,
        y_expr,
        total_frames,
    }
}

fn anchor_exprs(direction: ZoomDirection, zoom_expr: &str) -> (String, String) {
    let center_x = format!("(iw-iw*({zoom_expr}))/2");
    let max_x = format!("iw-iw*({zoom_expr})");
    let center_y = format!("(ih-ih*({zoom_expr}))/2");
    let max_y = format!("ih-ih*({zoom_expr})");
    let zero = || "0".to_string();

    match direction {
        // Random is resolved before planning; treat a stray value as center.
        ZoomDirection::Center | ZoomDirection::Random => (center_x, center_y),
        ZoomDirection::Top => (center_x, zero()),
        ZoomDirection::Bottom => (center_x, max_y),
        ZoomDirection::Left => (zero(), center_y),
        ZoomDirection::Right => (max_x, center_y),
        ZoomDirection::TopLeft => (zero(), zero()),
        ZoomDirection::TopRight => (max_x, zero()),
        ZoomDirection::BottomLeft => (zero(), max_y),
        ZoomDirection::BottomRight => (max_x, max_y),
    }
}

/// Fit the asset inside the canvas, shrink by `overlay_scale`, and center it.
pub fn overlay_rect(
    canvas_w: u32,
    canvas_h: u32,
    asset_w: u32,
    asset_h: u32,
    overlay_scale: f64,
) -> OverlayRect {
    let fit = (canvas_w as f64 / asset_w.max(1) as f64)
        .min(canvas_h as f64 / asset_h.max(1) as f64);
    let scale = fit * overlay_scale;
    let width = ((asset_w as f64 * scale) as u32).min(canvas_w);
    let height = ((asset_h as f64 * scale) as u32).min(canvas_h);
    OverlayRect {
        width,
        height,
        x: (canvas_w - width) / 2,
        y: (canvas_h - height) / 2,
    }
}

fn caption_fade(config: &CarouselConfig, path: &Path, duration: f64) -> Result<CaptionFade> {
    if config.text_fade_in >= duration - config.text_fade_out {
        return Err(CarouselError::validation(format!(
            "caption fades ({}s in + {}s out) do not fit the {}s clip for {}",
            config.text_fade_in,
            config.text_fade_out,
            duration,
            path.display()
        )));
    }
    let text = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string();
    Ok(CaptionFade {
        text,
        fade_in: config.text_fade_in,
        fade_out: config.text_fade_out,
    })
}

/// Turn a plan into the single engine invocation that renders its clip:
/// blurred zooming background, centered overlay, optional fading caption,
/// and an audio track (source audio or synthesized silence).
pub fn build_clip_request(
    config: &CarouselConfig,
    plan: &ClipPlan,
    output: PathBuf,
) -> RenderRequest {
    let overscan_w = (config.width as f64 * BACKGROUND_OVERSCAN) as u32;
    let overscan_h = (config.height as f64 * BACKGROUND_OVERSCAN) as u32;
    let zp = &plan.zoom_pan;

    let mut graph = format!(
        "[0:v]scale={ow}:{oh}:force_original_aspect_ratio=increase,crop={ow}:{oh},\
         gblur=sigma={blur},zoompan=z='{z}':x='{x}':y='{y}':d={frames}:s={w}x{h}:fps={fps}",
        ow = overscan_w,
        oh = overscan_h,
        blur = config.blur_radius,
        z = zp.zoom_expr,
        x = zp.x_expr,
        y = zp.y_expr,
        frames = zp.total_frames,
        w = config.width,
        h = config.height,
        fps = FPS,
    );

    if config.background_opacity < 1.0 {
        graph.push_str(&format!(
            ",format=rgba,colorchannelmixer=aa={op}[bgf];\
             color=c=black:s={w}x{h}:r={fps}:d={d}[cv];\
             [cv][bgf]overlay=shortest=1,format=yuv420p[bg];",
            op = config.background_opacity,
            w = config.width,
            h = config.height,
            fps = FPS,
            d = plan.duration,
        ));
    } else {
        graph.push_str(",format=yuv420p[bg];");
    }

    graph.push_str(&format!(
        "[0:v]scale={sw}:{sh},format=yuv420p[fg];[bg][fg]overlay={x}:{y}",
        sw = plan.overlay.width,
        sh = plan.overlay.height,
        x = plan.overlay.x,
        y = plan.overlay.y,
    ));

    match &plan.caption {
        Some(caption) => {
            graph.push_str("[ov];[ov]");
            graph.push_str(&format!(
                "drawtext={}[v];",
                drawtext_filter(caption, plan.duration)
            ));
        }
        None => graph.push_str("[v];"),
    }

    let (inputs, audio_label) = match (plan.kind, plan.has_audio) {
        (AssetKind::Video, true) => (vec![RenderInput::File(plan.source.clone())], "[0:a]"),
        (AssetKind::Video, false) => (
            vec![
                RenderInput::File(plan.source.clone()),
                RenderInput::Source(SILENT_AUDIO.to_string()),
            ],
            "[1:a]",
        ),
        (AssetKind::Image, _) => (
            vec![
                RenderInput::LoopedImage(plan.source.clone()),
                RenderInput::Source(SILENT_AUDIO.to_string()),
            ],
            "[1:a]",
        ),
    };

    graph.push_str(&format!(
        "{audio_label}atrim=0:{d},asetpts=PTS-STARTPTS[a]",
        d = plan.duration,
    ));

    RenderRequest {
        inputs,
        filter_graph: graph,
        maps: vec!["[v]".to_string(), "[a]".to_string()],
        duration: Some(plan.duration),
        output,
    }
}

fn drawtext_filter(caption: &CaptionFade, duration: f64) -> String {
    let mut filter = format!(
        "text='{}':fontcolor=white:fontsize=h/18:box=1:boxcolor=black@0.4:boxborderw=12:\
         x=(w-text_w)/2:y=h-text_h-h/12",
        escape_drawtext(&caption.text)
    );
    if let Some(alpha) = alpha_expr(caption.fade_in, caption.fade_out, duration) {
        filter.push_str(&format!(":alpha='{alpha}'"));
    }
    filter
}

/// Opacity ramp 0→1 over `[0, fade_in]`, hold at 1, then 1→0 over
/// `[duration - fade_out, duration]`. `None` when both fades are zero.
pub(crate) fn alpha_expr(fade_in: f64, fade_out: f64, duration: f64) -> Option<String> {
    let hold_end = duration - fade_out;
    match (fade_in > 0.0, fade_out > 0.0) {
        (true, true) => Some(format!(
            "if(lt(t,{fade_in}),t/{fade_in},if(lt(t,{hold_end}),1,({duration}-t)/{fade_out}))"
        )),
        (true, false) => Some(format!("if(lt(t,{fade_in}),t/{fade_in},1)")),
        (false, true) => Some(format!(
            "if(lt(t,{hold_end}),1,({duration}-t)/{fade_out})"
        )),
        (false, false) => None,
    }
}

pub(crate) fn escape_drawtext(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace(':', "\\:")
        .replace('%', "\\%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    struct StubEngine {
        probe: MediaProbe,
    }

    impl StubEngine {
        fn images() -> Self {
            Self {
                probe: MediaProbe {
                    width: 4000,
                    height: 3000,
                    duration: None,
                    has_audio: false,
                },
            }
        }
    }

    impl TranscodingEngine for StubEngine {
        fn probe(&self, _path: &Path) -> Result<MediaProbe> {
            Ok(self.probe)
        }

        fn render(&self, _request: &RenderRequest) -> Result<()> {
            Ok(())
        }

        fn concat_copy(&self, _inputs: &[PathBuf], _output: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn image_assets(names: &[&str]) -> Vec<InputAsset> {
        names
            .iter()
            .enumerate()
            .map(|(index, name)| InputAsset {
                path: PathBuf::from(name),
                kind: AssetKind::Image,
                index,
            })
            .collect()
    }

    fn test_config() -> CarouselConfig {
        CarouselConfig {
            image_duration: 5.0,
            transition_duration: 1.0,
            ..CarouselConfig::default()
        }
    }

    #[test]
    fn all_but_the_last_clip_carry_transition_padding() {
        let config = test_config();
        let assets = image_assets(&["a.jpg", "b.jpg", "c.jpg"]);
        let mut rng = StdRng::seed_from_u64(0);
        let plans = plan_clips(&config, &assets, &StubEngine::images(), &mut rng).unwrap();
        let durations: Vec<f64> = plans.iter().map(|p| p.duration).collect();
        assert_eq!(durations, vec![6.0, 6.0, 5.0]);
    }

    #[test]
    fn video_duration_is_capped_at_the_configured_maximum() {
        let config = test_config();
        let assets = vec![InputAsset {
            path: PathBuf::from("long.mp4"),
            kind: AssetKind::Video,
            index: 0,
        }];
        let engine = StubEngine {
            probe: MediaProbe {
                width: 1920,
                height: 1080,
                duration: Some(42.0),
                has_audio: true,
            },
        };
        let mut rng = StdRng::seed_from_u64(0);
        let plans = plan_clips(&config, &assets, &engine, &mut rng).unwrap();
        assert_eq!(plans[0].duration, config.max_video_duration);
        assert!(plans[0].has_audio);
    }

    #[test]
    fn overlay_is_fitted_scaled_and_centered() {
        let rect = overlay_rect(1280, 720, 4000, 3000, 0.9);
        assert_eq!(rect.width, 864);
        assert_eq!(rect.height, 648);
        assert_eq!(rect.x, 208);
        assert_eq!(rect.y, 36);
    }

    #[test]
    fn zoom_expressions_are_anchored_per_direction() {
        let zp = zoom_pan_expressions(1.0, 1.2, ZoomDirection::Center, 6.0);
        assert_eq!(zp.total_frames, 180);
        assert_eq!(zp.zoom_expr, "1+(1.2-1)*on/180");
        assert_eq!(zp.x_expr, "(iw-iw*(1+(1.2-1)*on/180))/2");

        let top_left = zoom_pan_expressions(1.0, 1.2, ZoomDirection::TopLeft, 6.0);
        assert_eq!(top_left.x_expr, "0");
        assert_eq!(top_left.y_expr, "0");

        let bottom_right = zoom_pan_expressions(1.0, 1.2, ZoomDirection::BottomRight, 6.0);
        assert_eq!(bottom_right.x_expr, "iw-iw*(1+(1.2-1)*on/180)");
        assert_eq!(bottom_right.y_expr, "ih-ih*(1+(1.2-1)*on/180)");
    }

    #[test]
    fn overlapping_caption_fades_fail_naming_the_asset() {
        let config = CarouselConfig {
            image_duration: 2.0,
            transition_duration: 0.5,
            draw_text: true,
            text_fade_in: 1.5,
            text_fade_out: 1.0,
            ..CarouselConfig::default()
        };
        let assets = image_assets(&["holiday.jpg"]);
        let mut rng = StdRng::seed_from_u64(0);
        let err = plan_clips(&config, &assets, &StubEngine::images(), &mut rng).unwrap_err();
        match err {
            CarouselError::Validation(message) => assert!(message.contains("holiday.jpg")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn planning_is_idempotent_for_a_fixed_seed() {
        let config = CarouselConfig {
            zoom_direction: ZoomDirection::Random,
            ..test_config()
        };
        let assets = image_assets(&["a.jpg", "b.jpg", "c.jpg", "d.jpg"]);
        let engine = StubEngine::images();

        let mut rng_a = StdRng::seed_from_u64(99);
        let mut rng_b = StdRng::seed_from_u64(99);
        let first = plan_clips(&config, &assets, &engine, &mut rng_a).unwrap();
        let second = plan_clips(&config, &assets, &engine, &mut rng_b).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn image_clip_request_loops_the_still_and_synthesizes_silence() {
        let config = test_config();
        let assets = image_assets(&["a.jpg", "b.jpg"]);
        let mut rng = StdRng::seed_from_u64(0);
        let plans = plan_clips(&config, &assets, &StubEngine::images(), &mut rng).unwrap();

        let request = build_clip_request(&config, &plans[0], PathBuf::from("clip_000.mp4"));
        assert_eq!(
            request.inputs,
            vec![
                RenderInput::LoopedImage(PathBuf::from("a.jpg")),
                RenderInput::Source(SILENT_AUDIO.to_string()),
            ]
        );
        assert_eq!(request.maps, vec!["[v]".to_string(), "[a]".to_string()]);
        assert_eq!(request.duration, Some(6.0));
        assert!(request.filter_graph.contains("gblur=sigma=20"));
        assert!(request.filter_graph.contains("[1:a]atrim=0:6"));
        assert!(!request.filter_graph.contains("drawtext"));
    }

    #[test]
    fn translucent_background_is_rendered_over_black() {
        let config = CarouselConfig {
            background_opacity: 0.8,
            ..test_config()
        };
        let assets = image_assets(&["a.jpg"]);
        let mut rng = StdRng::seed_from_u64(0);
        let plans = plan_clips(&config, &assets, &StubEngine::images(), &mut rng).unwrap();
        let request = build_clip_request(&config, &plans[0], PathBuf::from("clip_000.mp4"));
        assert!(request.filter_graph.contains("colorchannelmixer=aa=0.8"));
        assert!(request.filter_graph.contains("color=c=black"));
    }

    #[test]
    fn caption_alpha_covers_every_fade_combination() {
        assert_eq!(
            alpha_expr(0.5, 0.5, 6.0).unwrap(),
            "if(lt(t,0.5),t/0.5,if(lt(t,5.5),1,(6-t)/0.5))"
        );
        assert_eq!(alpha_expr(0.5, 0.0, 6.0).unwrap(), "if(lt(t,0.5),t/0.5,1)");
        assert_eq!(alpha_expr(0.0, 0.5, 6.0).unwrap(), "if(lt(t,5.5),1,(6-t)/0.5)");
        assert_eq!(alpha_expr(0.0, 0.0, 6.0), None);
    }

    #[test]
    fn drawtext_metacharacters_are_escaped() {
        assert_eq!(escape_drawtext("it's 50%: a\\b"), "it\\'s 50\\%\\: a\\\\b");
    }
}
