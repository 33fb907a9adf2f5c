//! wgpu implementation of [`TextureTarget`]: decoded frames are uploaded to a
//! texture and copied, centered, onto an offscreen canvas.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use crate::error::BackendError;
use crate::render::accelerated::TextureTarget;

const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

enum Pending {
    Nothing,
    Image,
    Clear([f64; 4]),
}

struct Uploaded {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
}

pub struct WgpuTarget {
    device: wgpu::Device,
    queue: wgpu::Queue,
    canvas: wgpu::Texture,
    canvas_size: (u32, u32),
    image: Option<Uploaded>,
    pending: Pending,
    lost: Arc<Mutex<Option<String>>>,
}

impl WgpuTarget {
    pub fn new(width: u32, height: u32) -> Result<Self, BackendError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| BackendError::Fatal(format!("failed to acquire GPU adapter: {err}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("draw-this-device"),
            ..Default::default()
        }))
        .map_err(|err| BackendError::Fatal(format!("failed to acquire GPU device: {err}")))?;

        let lost = Arc::new(Mutex::new(None));
        {
            let lost = Arc::clone(&lost);
            device.set_device_lost_callback(move |reason, message| {
                warn!(?reason, %message, "GPU device lost");
                *lost.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(format!("{reason:?}: {message}"));
            });
        }

        let canvas_size = (width.max(1), height.max(1));
        let canvas = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("draw-this-canvas"),
            size: wgpu::Extent3d {
                width: canvas_size.0,
                height: canvas_size.1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        info!(
            adapter = %adapter.get_info().name,
            width = canvas_size.0,
            height = canvas_size.1,
            "GPU render target ready",
        );

        Ok(Self {
            device,
            queue,
            canvas,
            canvas_size,
            image: None,
            pending: Pending::Nothing,
            lost,
        })
    }

    fn check_device(&self) -> Result<(), BackendError> {
        match self
            .lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(reason) => Err(BackendError::Fatal(format!("GPU device lost: {reason}"))),
            None => Ok(()),
        }
    }

    fn image_texture(&mut self, width: u32, height: u32) -> wgpu::Texture {
        if let Some(img) = self
            .image
            .as_ref()
            .filter(|img| img.width == width && img.height == height)
        {
            return img.texture.clone();
        }
        if let Some(old) = self.image.take() {
            old.texture.destroy();
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("draw-this-frame"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FORMAT,
            usage: wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        self.image = Some(Uploaded {
            texture: texture.clone(),
            width,
            height,
        });
        texture
    }

    fn clear_pass(&self, encoder: &mut wgpu::CommandEncoder, color: [f64; 4]) {
        let view = self
            .canvas
            .create_view(&wgpu::TextureViewDescriptor::default());
        let [r, g, b, a] = color;
        let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("draw-this-clear"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            ..Default::default()
        });
    }
}

impl TextureTarget for WgpuTarget {
    fn upload(&mut self, width: u32, height: u32, rgba: &[u8]) -> Result<(), BackendError> {
        self.check_device()?;
        let max = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(BackendError::Frame(format!(
                "{width}x{height} frame exceeds texture limits (max {max})"
            )));
        }
        let texture = self.image_texture(width, height);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.pending = Pending::Image;
        Ok(())
    }

    fn clear(&mut self, color: [f64; 4]) -> Result<(), BackendError> {
        self.check_device()?;
        self.pending = Pending::Clear(color);
        Ok(())
    }

    fn present(&mut self) -> Result<(), BackendError> {
        self.check_device()?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("draw-this-present"),
            });
        match std::mem::replace(&mut self.pending, Pending::Nothing) {
            Pending::Nothing => return Ok(()),
            Pending::Clear(color) => self.clear_pass(&mut encoder, color),
            Pending::Image => {
                self.clear_pass(&mut encoder, [0.0, 0.0, 0.0, 1.0]);
                if let Some(img) = &self.image {
                    let (cw, ch) = self.canvas_size;
                    let copy_w = img.width.min(cw);
                    let copy_h = img.height.min(ch);
                    encoder.copy_texture_to_texture(
                        wgpu::TexelCopyTextureInfo {
                            texture: &img.texture,
                            mip_level: 0,
                            origin: wgpu::Origin3d {
                                x: (img.width - copy_w) / 2,
                                y: (img.height - copy_h) / 2,
                                z: 0,
                            },
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::TexelCopyTextureInfo {
                            texture: &self.canvas,
                            mip_level: 0,
                            origin: wgpu::Origin3d {
                                x: (cw - copy_w) / 2,
                                y: (ch - copy_h) / 2,
                                z: 0,
                            },
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::Extent3d {
                            width: copy_w,
                            height: copy_h,
                            depth_or_array_layers: 1,
                        },
                    );
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        self.check_device()
    }

    fn release(&mut self) {
        if let Some(img) = self.image.take() {
            img.texture.destroy();
        }
        self.canvas.destroy();
    }
}
