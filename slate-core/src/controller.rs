//! Document controller: turns user input into model mutations and outbound
//! events, and exposes the board state the UI needs.
//!
//! Every mutating method returns the events to publish. An empty vector
//! means nothing changed, which is also what a permission denial looks like.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::event::{BoardEvent, ToolField};
use crate::page::{PageError, PageRasterizer};
use crate::permission::{Action, PermissionSource, Role};
use crate::reconcile::{MergeOutcome, Provenance, Replica};
use crate::render::{Bitmap, RenderPass, Renderer, RendererConfig};
use crate::snapshot::{AttachedFile, DocumentSnapshot};
use crate::stroke::{Color, Point, ReplicaId, StrokeId, StrokeMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    #[default]
    Pencil,
    Eraser,
}

impl Tool {
    fn mode(self) -> StrokeMode {
        match self {
            Tool::Pencil => StrokeMode::Draw,
            Tool::Eraser => StrokeMode::Erase,
        }
    }

    fn action(self) -> Action {
        match self {
            Tool::Pencil => Action::Draw,
            Tool::Eraser => Action::Erase,
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::Pencil => f.write_str("pencil"),
            Tool::Eraser => f.write_str("eraser"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub tool: Tool,
    pub color: Color,
    pub width: f32,
}

impl Default for ToolState {
    fn default() -> Self {
        Self {
            tool: Tool::Pencil,
            color: Color::BLACK,
            width: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureState {
    Idle,
    Drawing(StrokeId),
}

/// Things the UI may want to surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The local tool state changed.
    ToolChanged(ToolState),
    /// Another participant announced a tool change.
    PeerTool {
        origin: ReplicaId,
        field: ToolField,
        value: String,
    },
    PageChanged { page: u32, total: u32 },
    /// A transport reported something the user should know about.
    SyncFault(String),
}

pub struct DocumentController {
    replica: Replica,
    renderer: Renderer,
    role: Role,
    permissions: Box<dyn PermissionSource + Send>,
    tool: ToolState,
    gesture: GestureState,
    notifications: Vec<Notification>,
}

impl DocumentController {
    pub fn new(
        id: ReplicaId,
        role: Role,
        permissions: impl PermissionSource + Send + 'static,
        config: RendererConfig,
    ) -> Self {
        Self {
            replica: Replica::new(id),
            renderer: Renderer::new(config),
            role,
            permissions: Box::new(permissions),
            tool: ToolState::default(),
            gesture: GestureState::Idle,
            notifications: Vec::new(),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.replica.id()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn tool_state(&self) -> ToolState {
        self.tool
    }

    pub fn gesture(&self) -> GestureState {
        self.gesture
    }

    pub fn current_page(&self) -> u32 {
        self.replica.active_page()
    }

    pub fn total_pages(&self) -> u32 {
        self.replica.total_pages()
    }

    pub fn attached_file(&self) -> Option<&AttachedFile> {
        self.replica.attached_file()
    }

    /// Whether the local participant may draw at all.
    pub fn is_editable(&self) -> bool {
        self.permissions.allows(self.role, Action::Draw)
    }

    /// Swap in freshly loaded permissions.
    pub fn refresh_permissions(&mut self, permissions: impl PermissionSource + Send + 'static) {
        self.permissions = Box::new(permissions);
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    fn allowed(&self, action: Action) -> bool {
        let allowed = self.permissions.allows(self.role, action);
        if !allowed {
            log::debug!("{:?} denied {} for {:?}", self.id(), action.key(), self.role);
        }
        allowed
    }

    // ───────────────────────────────────────────────────────────
    // Drawing
    // ───────────────────────────────────────────────────────────

    pub fn pointer_down(&mut self, point: Point) -> Vec<BoardEvent> {
        if self.gesture != GestureState::Idle || !point.is_finite() {
            return Vec::new();
        }
        if !self.allowed(self.tool.tool.action()) {
            return Vec::new();
        }
        let page = self.replica.active_page();
        let ToolState { tool, color, width } = self.tool;
        let started = self
            .replica
            .begin_stroke(tool.mode(), color, width, page)
            .and_then(|id| self.replica.append_point(id, point.clamped()).map(|_| id));
        match started {
            Ok(id) => self.gesture = GestureState::Drawing(id),
            Err(e) => log::warn!("Could not start stroke: {e}"),
        }
        // The begin event waits for the second point.
        Vec::new()
    }

    pub fn pointer_move(&mut self, point: Point) -> Vec<BoardEvent> {
        let GestureState::Drawing(id) = self.gesture else {
            return Vec::new();
        };
        if !point.is_finite() {
            return Vec::new();
        }
        let count = match self.replica.append_point(id, point.clamped()) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Dropping point for {id}: {e}");
                return Vec::new();
            }
        };
        let Some(stroke) = self.replica.model().stroke(&id) else {
            return Vec::new();
        };
        let append = BoardEvent::StrokeAppend {
            stroke_id: id,
            points: stroke.points.clone(),
        };
        match count {
            2 => vec![BoardEvent::StrokeBegin { stroke: stroke.head() }, append],
            n if n > 2 => vec![append],
            _ => Vec::new(),
        }
    }

    pub fn pointer_up(&mut self) -> Vec<BoardEvent> {
        let GestureState::Drawing(id) = self.gesture else {
            return Vec::new();
        };
        self.gesture = GestureState::Idle;
        let page_before = self.current_page();
        let result = match self.replica.end_stroke(id) {
            Ok((Some(_), _)) => vec![BoardEvent::StrokeEnd { stroke_id: id }],
            Ok((None, _)) => {
                log::trace!("Discarded single-point gesture {id}");
                Vec::new()
            }
            Err(e) => {
                log::warn!("Could not end stroke {id}: {e}");
                Vec::new()
            }
        };
        // Deferred inbound work may have moved the page.
        self.notify_page_if_changed(page_before);
        result
    }

    pub fn pointer_leave(&mut self) -> Vec<BoardEvent> {
        self.pointer_up()
    }

    // ───────────────────────────────────────────────────────────
    // History & board commands
    // ───────────────────────────────────────────────────────────

    pub fn undo(&mut self) -> Vec<BoardEvent> {
        if !self.allowed(Action::Undo) {
            return Vec::new();
        }
        match self.replica.undo() {
            Some(stroke) => vec![BoardEvent::Undo { stroke_id: stroke.id }],
            None => Vec::new(),
        }
    }

    pub fn redo(&mut self) -> Vec<BoardEvent> {
        if !self.allowed(Action::Redo) {
            return Vec::new();
        }
        match self.replica.redo() {
            Some(stroke) => vec![BoardEvent::Redo { stroke }],
            None => Vec::new(),
        }
    }

    pub fn clear(&mut self) -> Vec<BoardEvent> {
        if !self.allowed(Action::Clear) {
            return Vec::new();
        }
        self.replica.clear();
        self.gesture = GestureState::Idle;
        self.renderer.reset();
        vec![BoardEvent::Clear]
    }

    /// Move to `page`. Teachers only; out-of-range pages are ignored.
    pub fn set_page(&mut self, page: u32) -> Vec<BoardEvent> {
        if self.role != Role::Teacher {
            log::debug!("Page change by {:?} ignored", self.role);
            return Vec::new();
        }
        if !self.allowed(Action::ChangePage) || self.gesture != GestureState::Idle {
            return Vec::new();
        }
        match self.replica.set_page(page) {
            Ok(true) => {
                self.notify_page();
                vec![BoardEvent::SetPage { page }]
            }
            Ok(false) => Vec::new(),
            Err(e) => {
                log::debug!("Ignoring page change: {e}");
                Vec::new()
            }
        }
    }

    /// Attach a paged document. The rasterizer only needs to report how
    /// many pages it has.
    pub fn attach_file(
        &mut self,
        name: &str,
        locator: &str,
        bytes: &[u8],
        rasterizer: &mut dyn PageRasterizer,
    ) -> Result<Vec<BoardEvent>, PageError> {
        if self.role != Role::Teacher || !self.allowed(Action::AttachFile) {
            return Ok(Vec::new());
        }
        let info = rasterizer.load_document(bytes)?;
        if info.page_count == 0 {
            return Err(PageError::Unreadable(format!("{name} has no pages")));
        }
        let file = AttachedFile {
            name: name.to_string(),
            locator: locator.to_string(),
            page_count: info.page_count,
        };
        log::info!("Attached {} ({} pages)", file.name, file.page_count);
        self.replica.attach_file(file.clone());
        self.notify_page();
        Ok(vec![BoardEvent::AttachFile { file }])
    }

    // ───────────────────────────────────────────────────────────
    // Tool state
    // ───────────────────────────────────────────────────────────

    pub fn set_tool(&mut self, tool: Tool) -> Vec<BoardEvent> {
        if self.tool.tool == tool || !self.allowed(Action::ChangeTool) {
            return Vec::new();
        }
        self.tool.tool = tool;
        self.tool_changed(ToolField::Tool, tool.to_string())
    }

    pub fn set_color(&mut self, color: Color) -> Vec<BoardEvent> {
        if self.tool.color == color || !self.allowed(Action::ChangeColor) {
            return Vec::new();
        }
        self.tool.color = color;
        self.tool_changed(ToolField::Color, color.to_hex())
    }

    pub fn set_width(&mut self, width: f32) -> Vec<BoardEvent> {
        if !width.is_finite() || width <= 0.0 || self.tool.width == width {
            return Vec::new();
        }
        if !self.allowed(Action::ChangeWidth) {
            return Vec::new();
        }
        self.tool.width = width;
        self.tool_changed(ToolField::Width, width.to_string())
    }

    fn tool_changed(&mut self, field: ToolField, value: String) -> Vec<BoardEvent> {
        self.notifications.push(Notification::ToolChanged(self.tool));
        vec![BoardEvent::ToolChanged { field, value }]
    }

    // ───────────────────────────────────────────────────────────
    // Inbound
    // ───────────────────────────────────────────────────────────

    pub fn apply_snapshot(&mut self, snapshot: DocumentSnapshot) -> MergeOutcome {
        let page_before = self.current_page();
        let outcome = self.replica.ingest_snapshot(snapshot);
        self.notify_page_if_changed(page_before);
        outcome
    }

    pub fn apply_event(
        &mut self,
        origin: ReplicaId,
        event: BoardEvent,
        via: Provenance,
    ) -> Result<MergeOutcome, CoreError> {
        if let BoardEvent::ToolChanged { field, value } = event {
            if origin != self.id() {
                self.notifications.push(Notification::PeerTool { origin, field, value });
            }
            return Ok(MergeOutcome::Unchanged);
        }
        let page_before = self.current_page();
        let outcome = self.replica.ingest_event(origin, event, via)?;
        self.notify_page_if_changed(page_before);
        Ok(outcome)
    }

    pub fn report_fault(&mut self, message: impl Into<String>) {
        self.notifications.push(Notification::SyncFault(message.into()));
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    fn notify_page(&mut self) {
        self.notifications.push(Notification::PageChanged {
            page: self.current_page(),
            total: self.total_pages(),
        });
    }

    fn notify_page_if_changed(&mut self, before: u32) {
        if self.current_page() != before {
            self.notify_page();
        }
    }

    // ───────────────────────────────────────────────────────────
    // Rendering
    // ───────────────────────────────────────────────────────────

    /// Repaint whatever changed since the last call.
    pub fn render(&mut self) -> RenderPass {
        let request = self.replica.take_render_request();
        self.renderer
            .render(self.replica.strokes(), self.replica.active_page(), request)
    }

    /// The ink layer, transparent where nothing was drawn.
    pub fn bitmap(&self) -> &Bitmap {
        self.renderer.bitmap()
    }

    /// Rasterize the active page of the attached document, if any.
    pub fn render_page_background(
        &self,
        rasterizer: &dyn PageRasterizer,
        scale: f32,
    ) -> Result<Option<Bitmap>, PageError> {
        if self.replica.attached_file().is_none() {
            return Ok(None);
        }
        rasterizer.render_page(self.current_page(), scale).map(Some)
    }
}
