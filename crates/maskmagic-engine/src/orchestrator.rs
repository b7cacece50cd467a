//! Runs one generation end to end: prepare, mask, fit, submit, download and
//! reconcile orientation.
//!
//! Control flow is linear. The first failing stage ends the invocation and
//! nothing is retried. The orchestrator blocks at two points only: the
//! generation call and the result download.

use std::fmt;

use maskmagic_contracts::config::ServiceConfig;
use maskmagic_contracts::events::{EventLog, PipelineEvent};
use maskmagic_contracts::wire::{self, EditRequestBody, EditResponseBody};

use crate::budget::{fit_to_budget_with, BudgetPolicy, Encoding, FittedImage};
use crate::error::{mib, FailureKind, PayloadPart, PipelineError, Result};
use crate::geometry::{prepare_with, CanvasSpec};
use crate::mask::{fit_mask, generate_mask, MaskShape, DEFAULT_COVERAGE};
use crate::orientation::{describe_orientation, normalize_orientation_report};
use crate::raster::RasterImage;
use crate::transport::HttpTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Preparing,
    MaskGenerating,
    BudgetFitting,
    Submitting,
    Downloading,
    OrientationFixing,
    Done,
    Failed(FailureKind),
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::MaskGenerating => "mask_generating",
            Self::BudgetFitting => "budget_fitting",
            Self::Submitting => "submitting",
            Self::Downloading => "downloading",
            Self::OrientationFixing => "orientation_fixing",
            Self::Done => "done",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "failed({})", kind.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A source image and its mask, congruent by construction.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    image: FittedImage,
    mask: RasterImage,
    prompt: String,
    model: String,
    size: String,
    response_format: String,
}

impl GenerationRequest {
    pub fn new(
        image: FittedImage,
        mask: RasterImage,
        prompt: impl Into<String>,
        config: &ServiceConfig,
    ) -> Result<Self> {
        if !image.image.is_congruent(&mask) {
            return Err(PipelineError::SizeMismatch {
                image: image.image.geometry(),
                mask: mask.geometry(),
            });
        }
        Ok(Self {
            image,
            mask,
            prompt: prompt.into(),
            model: config.model.clone(),
            size: config.size_label(),
            response_format: config.response_format.clone(),
        })
    }

    pub fn image(&self) -> &RasterImage {
        &self.image.image
    }

    pub fn mask(&self) -> &RasterImage {
        &self.mask
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Encodes both rasters as PNG data URIs, each checked against `max_bytes`.
    /// A JPEG-fitted image is re-encoded losslessly from its decoded pixels.
    pub fn encode(&self, max_bytes: u64) -> Result<EditRequestBody> {
        let image_bytes = match self.image.encoding {
            Encoding::Png => self.image.bytes.clone(),
            Encoding::Jpeg { quality } => {
                tracing::debug!(quality, "re-encoding JPEG-fitted image as PNG");
                self.image.image.encode_png()?
            }
        };
        check_ceiling(PayloadPart::Image, image_bytes.len() as u64, max_bytes)?;
        let mask_bytes = self.mask.encode_png()?;
        check_ceiling(PayloadPart::Mask, mask_bytes.len() as u64, max_bytes)?;

        Ok(EditRequestBody {
            image: wire::encode_data_uri("image/png", &image_bytes),
            mask: wire::encode_data_uri("image/png", &mask_bytes),
            prompt: self.prompt.clone(),
            model: self.model.clone(),
            size: self.size.clone(),
            response_format: self.response_format.clone(),
        })
    }
}

fn check_ceiling(part: PayloadPart, bytes: u64, limit: u64) -> Result<()> {
    tracing::info!(%part, size_mb = %mib(&bytes), "payload size");
    if bytes > limit {
        return Err(PipelineError::PayloadTooLarge { part, bytes, limit });
    }
    Ok(())
}

/// The result of one invocation plus every stage it passed through.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub result: Result<RasterImage>,
    pub trail: Vec<Stage>,
}

impl GenerationOutcome {
    pub fn final_stage(&self) -> Stage {
        self.trail.last().copied().unwrap_or(Stage::Idle)
    }
}

pub struct Orchestrator {
    config: ServiceConfig,
    transport: Box<dyn HttpTransport>,
    events: Option<EventLog>,
    coverage: f64,
    budget: BudgetPolicy,
}

impl Orchestrator {
    pub fn new(config: ServiceConfig, transport: impl HttpTransport + 'static) -> Self {
        Self {
            budget: BudgetPolicy::from_config(&config),
            config,
            transport: Box::new(transport),
            events: None,
            coverage: DEFAULT_COVERAGE,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_coverage(mut self, coverage: f64) -> Self {
        self.coverage = coverage;
        self
    }

    /// Overrides the budget-fitting policy derived from the config.
    pub fn with_budget(mut self, budget: BudgetPolicy) -> Self {
        self.budget = budget;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn generate(&self, image: RasterImage, prompt: &str, shape: MaskShape) -> Result<RasterImage> {
        self.run(image, prompt, shape).result
    }

    pub fn run(&self, image: RasterImage, prompt: &str, shape: MaskShape) -> GenerationOutcome {
        let mut trail = vec![Stage::Idle];
        let result = self.execute(image, prompt, shape, &mut trail);
        match &result {
            Ok(output) => {
                self.enter(&mut trail, Stage::Done);
                self.emit(PipelineEvent::GenerationFinished {
                    width: output.width(),
                    height: output.height(),
                    scale: output.scale(),
                });
            }
            Err(err) => {
                let failed_in = trail.last().copied().unwrap_or(Stage::Idle);
                tracing::error!(stage = %failed_in, kind = err.kind().as_str(), "{err}");
                trail.push(Stage::Failed(err.kind()));
                self.emit(PipelineEvent::GenerationFailed {
                    stage: failed_in.as_str().to_string(),
                    kind: err.kind().as_str().to_string(),
                    message: err.to_string(),
                });
            }
        }
        GenerationOutcome { result, trail }
    }

    fn execute(
        &self,
        image: RasterImage,
        prompt: &str,
        shape: MaskShape,
        trail: &mut Vec<Stage>,
    ) -> Result<RasterImage> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(PipelineError::EmptyPrompt);
        }

        self.enter(trail, Stage::Preparing);
        let prepared = prepare_with(image, &CanvasSpec::from_config(&self.config))?;

        self.enter(trail, Stage::MaskGenerating);
        let mask = generate_mask(&prepared, shape, self.coverage)?;

        self.enter(trail, Stage::BudgetFitting);
        let request = self.build_request(prepared, mask, prompt)?;
        let body = request.encode(self.config.service_max_bytes)?;

        self.enter(trail, Stage::Submitting);
        let reply = self.transport.post_json(&self.config.endpoint, &body.to_json())?;
        if !reply.is_success() {
            let message = wire::error_message(&reply.body)
                .unwrap_or_else(|| wire::generic_status_message(reply.status));
            return Err(PipelineError::RemoteError {
                status_code: reply.status,
                message,
            });
        }

        self.enter(trail, Stage::Downloading);
        let response: EditResponseBody = serde_json::from_slice(&reply.body)
            .map_err(|err| PipelineError::DecodeError(format!("invalid response JSON: {err}")))?;
        let url = response
            .first_url()
            .ok_or_else(|| PipelineError::DecodeError("no image URL in response".to_string()))?;
        reqwest::Url::parse(url)
            .map_err(|err| PipelineError::DecodeError(format!("invalid image URL '{url}': {err}")))?;
        tracing::info!(url, "downloading generated image");
        let download = self.transport.get(url)?;
        if !download.is_success() {
            return Err(PipelineError::RemoteError {
                status_code: download.status,
                message: wire::generic_status_message(download.status),
            });
        }
        let generated = RasterImage::decode(&download.body)?;

        self.enter(trail, Stage::OrientationFixing);
        tracing::info!(
            orientation = describe_orientation(generated.orientation()),
            width = generated.width(),
            height = generated.height(),
            "generated image received"
        );
        let normalized = normalize_orientation_report(generated);
        if let Some(anomaly) = normalized.anomaly {
            tracing::warn!(
                expected = ?anomaly.expected,
                actual = ?anomaly.actual,
                transposed = anomaly.is_transposed(),
                "generated image dimensions changed during orientation fix"
            );
            self.emit(PipelineEvent::OrientationAnomaly {
                expected: [anomaly.expected.0, anomaly.expected.1],
                actual: [anomaly.actual.0, anomaly.actual.1],
            });
        }
        Ok(normalized.image)
    }

    /// Fits the prepared image under the local ceiling and re-establishes
    /// congruence if fitting changed its geometry.
    fn build_request(
        &self,
        prepared: RasterImage,
        mask: RasterImage,
        prompt: &str,
    ) -> Result<GenerationRequest> {
        let fitted = fit_to_budget_with(prepared, &self.budget)?;
        let mask = if mask.is_congruent(&fitted.image) {
            mask
        } else {
            tracing::warn!(
                mask = %mask.geometry(),
                image = %fitted.image.geometry(),
                "mask no longer matches image, re-rendering"
            );
            fit_mask(&mask, &fitted.image).map_err(|_| PipelineError::SizeMismatch {
                image: fitted.image.geometry(),
                mask: mask.geometry(),
            })?
        };
        GenerationRequest::new(fitted, mask, prompt, &self.config)
    }

    fn enter(&self, trail: &mut Vec<Stage>, stage: Stage) {
        tracing::debug!(stage = %stage, "stage entered");
        trail.push(stage);
        self.emit(PipelineEvent::StageEntered {
            stage: stage.as_str().to_string(),
        });
    }

    fn emit(&self, event: PipelineEvent) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(err) = events.emit(event) {
            tracing::warn!(path = %events.path().display(), "failed writing event: {err:#}");
        }
    }
}
