//! The host renderer seam and the state guarded by the graphics lock.

use tracing::{debug, trace};

use mplanecam_capture::BGRA_BYTES_PER_PIXEL;

use crate::exchange::{ExchangeGate, FrameExchange};
use crate::EngineResult;

/// Opaque identifier of a renderer-owned texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// A host graphics context able to hold and draw BGRA textures.
///
/// Target creation and destruction happen while the session is being brought up or torn
/// down; updates and draws happen on the render path. Calls are serialized by the caller.
pub trait Renderer: Send {
    /// Creates a `width`x`height` BGRA target initialized from `initial`.
    fn create_target(&mut self, width: u32, height: u32, initial: &[u8])
        -> EngineResult<TextureHandle>;

    /// Uploads packed BGRA rows of `stride` bytes into `target`.
    fn update_target(&mut self, target: TextureHandle, data: &[u8], stride: u32);

    /// Releases `target`.
    fn destroy_target(&mut self, target: TextureHandle);

    /// Draws `target` at `width`x`height`.
    fn draw(&mut self, target: TextureHandle, width: u32, height: u32);
}

/// A renderer that keeps nothing and draws nothing, for headless hosts.
#[derive(Debug, Default)]
pub struct NullRenderer {
    next: u64,
}

impl Renderer for NullRenderer {
    fn create_target(&mut self, _: u32, _: u32, _: &[u8]) -> EngineResult<TextureHandle> {
        self.next += 1;
        Ok(TextureHandle(self.next))
    }

    fn update_target(&mut self, _: TextureHandle, _: &[u8], _: u32) {}

    fn destroy_target(&mut self, _: TextureHandle) {}

    fn draw(&mut self, _: TextureHandle, _: u32, _: u32) {}
}

/// The renderer, its target and the buffer frames are uploaded from.
///
/// Guarded by the graphics lock. The exchange lock is only taken to swap a pending frame into
/// `upload`; uploads and draws run after it is released.
pub(crate) struct RenderState {
    renderer: Box<dyn Renderer>,
    target: Option<TextureHandle>,
    width: u32,
    height: u32,
    upload: Vec<u8>,
}

impl RenderState {
    pub(crate) fn new(renderer: Box<dyn Renderer>) -> Self {
        Self {
            renderer,
            target: None,
            width: 0,
            height: 0,
            upload: Vec::new(),
        }
    }

    /// Sizes the front and upload buffers and creates a blank target for `width`x`height`.
    pub(crate) fn allocate(
        &mut self,
        exchange: &mut FrameExchange,
        width: u32,
        height: u32,
    ) -> EngineResult<()> {
        self.release(exchange);
        let len = width as usize * height as usize * BGRA_BYTES_PER_PIXEL;
        exchange.reset(len);
        self.upload = vec![0; len];
        let target = match self.renderer.create_target(width, height, &self.upload) {
            Ok(target) => target,
            Err(e) => {
                exchange.release();
                self.upload = Vec::new();
                return Err(e);
            }
        };
        debug!(?target, width, height, "Created render target");
        self.target = Some(target);
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Destroys the target and frees both buffers.
    pub(crate) fn release(&mut self, exchange: &mut FrameExchange) {
        self.destroy_target();
        exchange.release();
        self.upload = Vec::new();
        self.width = 0;
        self.height = 0;
    }

    /// Uploads a pending frame, then draws. Returns whether a new frame was uploaded.
    pub(crate) fn present(&mut self, gate: &ExchangeGate<'_, FrameExchange>) -> bool {
        let Some(target) = self.target else {
            return false;
        };
        let uploaded = gate.lock().consume(&mut self.upload);
        if uploaded {
            trace!("Uploading frame");
            let stride = self.width * BGRA_BYTES_PER_PIXEL as u32;
            self.renderer.update_target(target, &self.upload, stride);
        }
        self.renderer.draw(target, self.width, self.height);
        uploaded
    }

    fn destroy_target(&mut self) {
        if let Some(target) = self.target.take() {
            debug!(?target, "Destroying render target");
            self.renderer.destroy_target(target);
        }
    }
}

impl Drop for RenderState {
    fn drop(&mut self) {
        self.destroy_target();
    }
}
