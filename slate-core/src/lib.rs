//! # slate-core — Board model and reconciliation for Slate
//!
//! Everything a whiteboard replica needs that does not touch the network:
//! the stroke model, the incremental ink renderer, the reconciliation
//! engine and the document controller that ties them to user input.
//!
//! ## Architecture
//!
//! ```text
//! pointer / commands
//!        │
//!        ▼
//! ┌──────────────────┐   outbound BoardEvents   ┌──────────────┐
//! │DocumentController│ ───────────────────────► │  transports  │
//! └────────┬─────────┘                          │ (collab crate)│
//!          │                                    └──────┬───────┘
//!          ▼                                           │ events / snapshots
//! ┌──────────────────┐ ◄───────────────────────────────┘
//! │ Replica          │
//! │  └ StrokeModel   │
//! └────────┬─────────┘
//!          │ RenderRequest
//!          ▼
//! ┌──────────────────┐
//! │ Renderer (ink)   │
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`stroke`] — Points, colors, stroke ids
//! - [`event`] — Incremental board events
//! - [`snapshot`] — Authoritative document state and its event rules
//! - [`model`] — Local stroke list with undo/redo
//! - [`render`] — Incremental rasterizer
//! - [`reconcile`] — Snapshot/event merge engine
//! - [`permission`] — Role-keyed action gating
//! - [`page`] — Seam to an external page rasterizer
//! - [`controller`] — User-facing document controller

pub mod controller;
pub mod error;
pub mod event;
pub mod model;
pub mod page;
pub mod permission;
pub mod reconcile;
pub mod render;
pub mod snapshot;
pub mod stroke;

pub use controller::{DocumentController, GestureState, Notification, Tool, ToolState};
pub use error::CoreError;
pub use event::{BoardEvent, ToolField};
pub use model::StrokeModel;
pub use page::{DocumentInfo, PageError, PageRasterizer};
pub use permission::{Action, PermissionSource, PermissionTable, Role};
pub use reconcile::{MergeOutcome, Provenance, Replica};
pub use render::{Bitmap, RenderPass, RenderRequest, Renderer, RendererConfig};
pub use snapshot::{AttachedFile, DocumentSnapshot};
pub use stroke::{Color, Point, ReplicaId, StampClock, Stroke, StrokeId, StrokeMode};
