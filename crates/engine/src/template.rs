//! Command templates
//!
//! A [`TemplateSource`] turns a plan into a pair of encoder command lines (GPU
//! and CPU variant) that still contain placeholders. [`substitute`] fills the
//! placeholders for one job.

use crate::plan::{Plan, ResolveError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Source file placeholder
pub const INPUT_TOKEN: &str = "{input_file}";
/// Destination file placeholder
pub const OUTPUT_TOKEN: &str = "{output_file}";
/// Generated subtitle file placeholder
pub const SUBTITLE_TOKEN: &str = "{subtitle_file}";
/// Source file stem, rendered in the title bar of subtitle plans
pub const FILENAME_TOKEN: &str = "%{filename}";

/// Height of the subtitle background box as a fraction of the canvas
const SUBTITLE_BOX_HEIGHT: f32 = 0.16;

/// What a template source needs to know to build the command pair
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateRequest<'a> {
    pub plan: &'a Plan,
    pub more_effects: bool,
    pub canvas_y: f32,
}

/// GPU and CPU variants of one encoder command, placeholders unresolved
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandTemplate {
    pub gpu_command: String,
    pub cpu_command: String,
}

impl CommandTemplate {
    /// Pick the variant for the path the job was admitted on
    pub fn select(&self, use_gpu: bool, plan_id: u32) -> Result<&str, ResolveError> {
        let (command, path) = if use_gpu {
            (&self.gpu_command, "GPU")
        } else {
            (&self.cpu_command, "CPU")
        };
        if command.trim().is_empty() {
            return Err(ResolveError::MissingTemplate { plan_id, path });
        }
        Ok(command)
    }
}

/// Where command templates come from
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn command_templates(
        &self,
        request: &TemplateRequest<'_>,
    ) -> Result<CommandTemplate, ResolveError>;
}

/// Values substituted into a template for one job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Substitutions<'a> {
    pub input_file: &'a str,
    pub output_file: &'a str,
    /// Subtitle and filename tokens are only replaced when this is set
    pub subtitle_file: Option<&'a str>,
    pub filename: &'a str,
}

/// Replace placeholders in a single left-to-right pass.
///
/// Substituted values are never rescanned, and any other brace or `%{...}`
/// syntax in the template (filter expressions, drawtext expansions) is copied
/// through untouched.
pub fn substitute(template: &str, subs: &Substitutions<'_>) -> String {
    let mut tokens: Vec<(&str, &str)> = vec![
        (INPUT_TOKEN, subs.input_file),
        (OUTPUT_TOKEN, subs.output_file),
    ];
    if let Some(subtitle) = subs.subtitle_file {
        tokens.push((SUBTITLE_TOKEN, subtitle));
        tokens.push((FILENAME_TOKEN, subs.filename));
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while !rest.is_empty() {
        if let Some((token, value)) = tokens.iter().find(|(token, _)| rest.starts_with(token)) {
            out.push_str(value);
            rest = &rest[token.len()..];
            continue;
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// In-process generator for the stock ffmpeg command pairs
#[derive(Debug, Clone)]
pub struct BuiltinTemplates {
    /// Encoder executable
    pub program: String,
    /// Font used for the title bar and burned-in subtitles
    pub font_name: String,
    /// Thread count passed to the encoder
    pub encoder_threads: u32,
}

impl Default for BuiltinTemplates {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            font_name: "SimHei".to_string(),
            encoder_threads: 10,
        }
    }
}

#[async_trait]
impl TemplateSource for BuiltinTemplates {
    async fn command_templates(
        &self,
        request: &TemplateRequest<'_>,
    ) -> Result<CommandTemplate, ResolveError> {
        Ok(self.build(request))
    }
}

impl BuiltinTemplates {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Build both variants for a request
    pub fn build(&self, request: &TemplateRequest<'_>) -> CommandTemplate {
        let plan = request.plan;
        let tail = format!(
            "-c:a aac -b:a 128k -threads {} -movflags +faststart \"{}\"",
            self.encoder_threads, OUTPUT_TOKEN
        );

        if plan.add_subtitle {
            let vf = self.subtitle_chain(request.canvas_y);
            return CommandTemplate {
                gpu_command: format!(
                    "{} -y -i \"{}\" -vf \"{}\" \
                     -c:v h264_nvenc -preset p4 -tune ll -rc:v vbr -cq:v 23 \
                     -qmin 18 -qmax 28 -b:v 4M -maxrate 12M -bufsize 8M \
                     -spatial-aq 1 -temporal-aq 1 -aq-strength 8 \
                     -b_ref_mode 0 -multipass qres -profile:v high -level 5.1 {}",
                    self.program, INPUT_TOKEN, vf, tail
                ),
                cpu_command: format!(
                    "{} -y -i \"{}\" -vf \"{}\" \
                     -c:v libx264 -preset medium -crf 23 -tune film \
                     -x264opts keyint=24:min-keyint=24:no-scenecut {}",
                    self.program, INPUT_TOKEN, vf, tail
                ),
            };
        }

        let vf = select_filter_chain(plan, request.more_effects);
        CommandTemplate {
            gpu_command: format!(
                "{} -y -i \"{}\" -vf \"{}\" \
                 -c:v h264_nvenc -preset p2 -tune hq -rc vbr -cq 23 \
                 -b:v 6M -maxrate 10M -bufsize 10M \
                 -spatial-aq 1 -temporal-aq 1 -profile:v high {}",
                self.program, INPUT_TOKEN, vf, tail
            ),
            cpu_command: format!(
                "{} -y -i \"{}\" -vf \"{}\" \
                 -c:v libx264 -preset medium -crf 23 \
                 -b:v 6M -maxrate 10M -bufsize 10M -profile:v high {}",
                self.program, INPUT_TOKEN, vf, tail
            ),
        }
    }

    /// Title bar, subtitle box at `canvas_y` and burned-in subtitles
    fn subtitle_chain(&self, canvas_y: f32) -> String {
        let font = &self.font_name;
        let box_h = SUBTITLE_BOX_HEIGHT;
        [
            "scale=1080:1980:force_original_aspect_ratio=1".to_string(),
            "pad=1080:1980:(ow-iw)/2:(oh-ih)/2:black".to_string(),
            "drawbox=x=0:y=0:w=iw:h=100:color=white:t=fill".to_string(),
            format!(
                "drawtext=text='{}':font='{}':fontsize=40:fontcolor=black:x=(w-text_w)/2:y=(50-text_h)/2",
                FILENAME_TOKEN, font
            ),
            format!(
                "drawbox=x=0:y=ih*{canvas_y}:w=iw:h=ih*{box_h}:color=white:t=fill"
            ),
            format!(
                "subtitles='{}':force_style='FontName={},Fontsize=25,Alignment=2,\
                 Position=50%,Yabs=ih*{canvas_y}+(ih*{box_h}-th)/2,\
                 PrimaryColour=&H000000&,BorderStyle=1,Outline=1,\
                 OutlineColour=&HFFFFFF&,MarginL=10,MarginR=10'",
                SUBTITLE_TOKEN, font
            ),
            "unsharp=5:5:1.8:5:5:0.5".to_string(),
            "hqdn3d=1.2:1.2:4:4".to_string(),
        ]
        .join(",")
    }
}

/// Which filter chain a non-subtitle plan gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterChain {
    BlurBackground,
    MoreEffects,
    Basic,
}

impl FilterChain {
    /// Blur background wins over more effects, which wins over basic
    pub fn for_plan(plan: &Plan, more_effects: bool) -> Self {
        if plan.blur_bg {
            FilterChain::BlurBackground
        } else if more_effects {
            FilterChain::MoreEffects
        } else {
            FilterChain::Basic
        }
    }

    pub fn render(self, width: u32, height: u32) -> String {
        let (w, h) = (width, height);
        match self {
            FilterChain::BlurBackground => format!(
                "split [main][bg];\
                 [main]scale={w}:{h}:force_original_aspect_ratio=1[fg];\
                 [bg]scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},boxblur=20:5[blurred];\
                 [blurred][fg]overlay=(W-w)/2:(H-h)/2,\
                 unsharp=5:5:1.8:5:5:0.5,hqdn3d=1.2:1.2:4:4"
            ),
            FilterChain::MoreEffects => format!(
                "split[original][blur];\
                 [blur]boxblur=1:1[blurred];\
                 [original][blurred]overlay=0:0:0.05,\
                 drawgrid=width=10:height=100:thickness=2:color=black@0.01,\
                 pad=w=iw+20:h=ih+20:x=10:y=10:color=gray@0.05,\
                 scale={w}:{h}:force_original_aspect_ratio=1,\
                 pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black,\
                 unsharp=5:5:1.8:5:5:0.5,hqdn3d=1.2:1.2:4:4"
            ),
            FilterChain::Basic => format!(
                "scale={w}:{h}:force_original_aspect_ratio=1,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black"
            ),
        }
    }
}

fn select_filter_chain(plan: &Plan, more_effects: bool) -> String {
    FilterChain::for_plan(plan, more_effects).render(plan.width, plan.height)
}
