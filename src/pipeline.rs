//! Default job body: drives the external synthesis and rendering
//! collaborators as subprocess stages.
//!
//! The actual generation algorithms live outside this crate; they are reached
//! through two configurable command templates. Synthesis produces an audio
//! artifact from text, rendering consumes that audio plus a source image and
//! produces the result video. Progress checkpoints bracket each stage.
//! Intermediate audio lands in the swept temp directory; finished videos go
//! to the output directory, which the reclaimer never touches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::pool::{CleanupFn, JobBody, ProgressReporter};

/// One accepted generation request, validated at execution time.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub text: String,
    pub voice: String,
    pub speed: f64,
    pub image_path: PathBuf,
}

impl GenerationRequest {
    /// Metadata recorded on the job at creation, never interpreted by the core.
    pub fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("text".to_string(), self.text.clone()),
            ("voice".to_string(), self.voice.clone()),
            ("speed".to_string(), self.speed.to_string()),
            (
                "image_path".to_string(),
                self.image_path.to_string_lossy().into_owned(),
            ),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Build the job body for one request. The returned closure owns
    /// everything it needs and is executed by exactly one worker.
    pub fn job_body(&self, request: GenerationRequest) -> JobBody {
        let config = self.config.clone();
        Box::new(move |progress: ProgressReporter| {
            Box::pin(async move { run_pipeline(config, request, progress).await })
        })
    }

    /// Cleanup for the job's intermediate audio artifact; runs whether the
    /// job succeeded, failed, or was cancelled before starting.
    pub fn cleanup_for(&self, job_id: &str) -> CleanupFn {
        let audio_path = audio_path(&self.config.temp_dir, job_id);
        Box::new(move || {
            match std::fs::remove_file(&audio_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::debug!(path = %audio_path.display(), error = %err, "Temp audio cleanup failed");
                }
            }
        })
    }
}

async fn run_pipeline(
    config: PipelineConfig,
    request: GenerationRequest,
    progress: ProgressReporter,
) -> Result<PathBuf> {
    let job_id = progress.job_id().to_string();
    progress.report(0.1).await;

    if request.text.trim().is_empty() || request.voice.trim().is_empty() {
        return Err(Error::Validation("text and voice are required".to_string()));
    }

    tokio::fs::create_dir_all(&config.temp_dir).await?;
    tokio::fs::create_dir_all(&config.output_dir).await?;
    let audio_path = audio_path(&config.temp_dir, &job_id);
    // The finished video goes to the output directory; only the temp
    // directory is subject to the reclaimer's age-based sweep.
    let video_path = config.output_dir.join(format!("render_{job_id}.mp4"));

    progress.report(0.2).await;
    let synth_argv = render_template(
        &config.synthesize_command,
        &[
            ("text", request.text.as_str()),
            ("voice", request.voice.as_str()),
            ("speed", &request.speed.to_string()),
            ("output", &audio_path.to_string_lossy()),
        ],
    );
    run_command("synthesis", &synth_argv)
        .await
        .map_err(|err| Error::Execution(format!("audio generation failed: {err}")))?;
    if !audio_path.exists() {
        return Err(Error::Execution(format!(
            "synthesis produced no audio at {}",
            audio_path.display()
        )));
    }
    progress.report(0.4).await;

    if !request.image_path.exists() {
        return Err(Error::Execution(format!(
            "image file not found: {}",
            request.image_path.display()
        )));
    }

    progress.report(0.5).await;
    let render_argv = render_template(
        &config.render_command,
        &[
            ("audio", &audio_path.to_string_lossy()),
            ("image", &request.image_path.to_string_lossy()),
            ("output", &video_path.to_string_lossy()),
        ],
    );
    run_command("render", &render_argv)
        .await
        .map_err(|err| Error::Execution(format!("video rendering failed: {err}")))?;
    if !video_path.exists() {
        return Err(Error::Execution(
            "rendering produced no video file".to_string(),
        ));
    }
    progress.report(0.9).await;

    Ok(video_path)
}

fn audio_path(temp_dir: &Path, job_id: &str) -> PathBuf {
    temp_dir.join(format!("temp_audio_{job_id}.wav"))
}

/// Split the template on whitespace, then substitute `{placeholder}` markers
/// per token, so substituted values containing spaces stay single arguments.
fn render_template(template: &str, vars: &[(&str, &str)]) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| {
            let mut token = token.to_string();
            for (name, value) in vars {
                token = token.replace(&format!("{{{name}}}"), value);
            }
            token
        })
        .collect()
}

async fn run_command(stage: &str, argv: &[String]) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::Validation(format!("{stage} command is empty")));
    };
    tracing::debug!(stage, program = %program, "Running pipeline stage");

    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| Error::Execution(format!("failed to launch {program}: {err}")))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(Error::Execution(if stderr.trim().is_empty() {
        format!("{program} exited with {:?}", output.status.code())
    } else {
        stderr.trim().to_string()
    }))
}
