//! Masked image-edit pipeline: normalize, mask, budget-fit, submit, reconcile.

pub mod budget;
pub mod error;
pub mod geometry;
pub mod mask;
pub mod orchestrator;
pub mod orientation;
pub mod raster;
pub mod relay;
pub mod serve;
pub mod transport;

pub use budget::{fit_to_budget, fit_to_budget_with, BudgetPolicy, Encoding, FittedImage};
pub use error::{FailureKind, PayloadPart, PipelineError, Result};
pub use geometry::{prepare, prepare_with, CanvasSpec};
pub use mask::{fit_mask, generate_mask, MaskShape, DEFAULT_COVERAGE};
pub use orchestrator::{GenerationOutcome, GenerationRequest, Orchestrator, Stage};
pub use orientation::{describe_orientation, normalize_orientation, normalize_orientation_report};
pub use raster::{Geometry, RasterImage};
pub use relay::{Relay, RelayReply, RELAY_CORS_HEADERS};
pub use serve::{RelayServer, RELAY_ROUTE};
pub use transport::{HttpReply, HttpTransport, MultipartUpload, ReqwestTransport, UploadFile};
