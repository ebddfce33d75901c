//! Portable GPU renderer via wgpu
//!
//! Uploads software-decoded planes to textures and converts YUV -> RGB in
//! the fragment shader using the negotiated matrix. Hardware surfaces are
//! not imported here; sessions that pick this renderer decode in software.

use std::sync::Arc;

use wgpu::util::DeviceExt;
use winit::window::Window;

use super::{DisplayBackend, RenderBackend, RenderCaps, RenderInit, RenderKind};
use crate::color::ColorConfig;
use crate::error::{PipelineError, Result};
use crate::picture::{ColorRange, Colorspace, DecodedPicture, PixelFormat};

// ============================================================================
// Vertex and Shader
// ============================================================================

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    tex_coords: [f32; 2],
}

const VERTICES: &[Vertex] = &[
    Vertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
    Vertex { position: [ 1.0, -1.0], tex_coords: [1.0, 1.0] },
    Vertex { position: [ 1.0,  1.0], tex_coords: [1.0, 0.0] },
    Vertex { position: [-1.0,  1.0], tex_coords: [0.0, 0.0] },
];

const INDICES: &[u16] = &[0, 1, 2, 2, 3, 0];

/// std140 mirror of the shader's `Color` block
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ColorUniform {
    matrix: [[f32; 4]; 3],
    offset: [f32; 4],
}

impl From<&ColorConfig> for ColorUniform {
    fn from(config: &ColorConfig) -> Self {
        let [y, u, v] = config.offsets;
        Self { matrix: config.std140_matrix(), offset: [y, u, v, 0.0] }
    }
}

const SHADER_COMMON: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

struct Color {
    matrix: mat3x3<f32>,
    offset: vec4<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}

@group(0) @binding(0) var t_0: texture_2d<f32>;
@group(0) @binding(1) var t_1: texture_2d<f32>;
@group(0) @binding(2) var t_2: texture_2d<f32>;
@group(0) @binding(3) var s: sampler;
@group(0) @binding(4) var<uniform> color: Color;
"#;

const FRAGMENT_PLANAR: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let yuv = vec3<f32>(
        textureSample(t_0, s, in.tex_coords).r,
        textureSample(t_1, s, in.tex_coords).r,
        textureSample(t_2, s, in.tex_coords).r,
    );
    return vec4<f32>(color.matrix * (yuv - color.offset.xyz), 1.0);
}
"#;

const FRAGMENT_SEMI_PLANAR: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let y = textureSample(t_0, s, in.tex_coords).r;
    let uv = textureSample(t_1, s, in.tex_coords).rg;
    let yuv = vec3<f32>(y, uv);
    return vec4<f32>(color.matrix * (yuv - color.offset.xyz), 1.0);
}
"#;

// ============================================================================
// Plane Textures
// ============================================================================

/// Texture format per plane; `None` when the picture cannot be sampled
fn plane_formats(format: PixelFormat, norm16: bool) -> Option<&'static [wgpu::TextureFormat]> {
    use wgpu::TextureFormat::*;
    match format {
        PixelFormat::Yuv420p | PixelFormat::Yuv444p => Some(&[R8Unorm, R8Unorm, R8Unorm]),
        PixelFormat::Nv12 | PixelFormat::Nv24 => Some(&[R8Unorm, Rg8Unorm]),
        PixelFormat::P010 if norm16 => Some(&[R16Unorm, Rg16Unorm]),
        PixelFormat::Yuv444p10 if norm16 => Some(&[R16Unorm, R16Unorm, R16Unorm]),
        _ => None,
    }
}

/// Texel size of plane `index`
fn plane_extent(format: PixelFormat, index: usize, width: u32, height: u32) -> wgpu::Extent3d {
    let (w, h) = if index == 0 || format.is_444() {
        (width, height)
    } else {
        (width.div_ceil(2), height.div_ceil(2))
    };
    wgpu::Extent3d { width: w.max(1), height: h.max(1), depth_or_array_layers: 1 }
}

struct PlaneTextures {
    key: (PixelFormat, u32, u32),
    textures: Vec<wgpu::Texture>,
    bind_group: wgpu::BindGroup,
}

// ============================================================================
// GPU Renderer
// ============================================================================

struct Pipelines {
    surface_config: wgpu::SurfaceConfiguration,
    planar: wgpu::RenderPipeline,
    semi_planar: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    color_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    placeholder: wgpu::Texture,
}

pub struct WgpuRenderer {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    norm16: bool,
    pipelines: Option<Pipelines>,
    planes: Option<PlaneTextures>,
    color: ColorConfig,
    color_dirty: bool,
}

impl WgpuRenderer {
    /// Find an adapter able to present to the display's window
    pub fn create(display: &mut dyn DisplayBackend) -> Result<Self> {
        let window = display
            .window()
            .ok_or_else(|| PipelineError::BackendUnavailable("wgpu needs a window".into()))?;

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| PipelineError::render("wgpu", format!("surface creation failed: {}", e)))?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| PipelineError::BackendUnavailable("no suitable GPU adapter".into()))?;

        let norm16 = adapter.features().contains(wgpu::Features::TEXTURE_FORMAT_16BIT_NORM);
        let required_features = if norm16 {
            wgpu::Features::TEXTURE_FORMAT_16BIT_NORM
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                required_features,
                required_limits: wgpu::Limits::default(),
                label: Some("slipstream_device"),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| PipelineError::render("wgpu", format!("device request failed: {}", e)))?;

        let info = adapter.get_info();
        tracing::debug!(adapter = %info.name, backend = ?info.backend, norm16, "wgpu adapter");

        Ok(Self {
            window,
            surface,
            adapter,
            device,
            queue,
            norm16,
            pipelines: None,
            planes: None,
            color: ColorConfig::new(Colorspace::Bt709, ColorRange::Limited),
            color_dirty: true,
        })
    }

    fn build_pipelines(&self, width: u32, height: u32, vsync: bool) -> Result<Pipelines> {
        let device = &self.device;
        let surface_caps = self.surface.get_capabilities(&self.adapter);
        // the shader already outputs gamma-encoded RGB
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_caps.formats.first())
            .copied()
            .ok_or_else(|| PipelineError::render("wgpu", "surface reports no formats"))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: width.max(1),
            height: height.max(1),
            present_mode: if vsync { wgpu::PresentMode::AutoVsync } else { wgpu::PresentMode::AutoNoVsync },
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        self.surface.configure(device, &surface_config);

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
            label: Some("yuv_bind_group_layout"),
        });

        let vertex_layout = wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        };

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("yuv_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let build = |label: &str, fragment: &str| {
            let source = format!("{}{}", SHADER_COMMON, fragment);
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[vertex_layout.clone()],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: surface_format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: Some(wgpu::Face::Back),
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState {
                    count: 1,
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                multiview: None,
                cache: None,
            })
        };
        let planar = build("planar_pipeline", FRAGMENT_PLANAR);
        let semi_planar = build("semi_planar_pipeline", FRAGMENT_SEMI_PLANAR);

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("vertex_buffer"),
            contents: bytemuck::cast_slice(VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("index_buffer"),
            contents: bytemuck::cast_slice(INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });
        let color_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("color_uniform"),
            contents: bytemuck::bytes_of(&ColorUniform::from(&self.color)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        // bound to unused slots so one layout serves both pipelines
        let placeholder = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("placeholder_texture"),
            size: wgpu::Extent3d { width: 1, height: 1, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });

        Ok(Pipelines {
            surface_config,
            planar,
            semi_planar,
            bind_group_layout,
            vertex_buffer,
            index_buffer,
            color_buffer,
            sampler,
            placeholder,
        })
    }

    fn ensure_textures(&mut self, picture: &DecodedPicture) -> Result<()> {
        let key = (picture.format, picture.width, picture.height);
        if self.planes.as_ref().is_some_and(|p| p.key == key) {
            return Ok(());
        }
        let pipelines = self.pipelines.as_ref().ok_or_else(|| PipelineError::render("wgpu", "draw before init"))?;
        let formats = plane_formats(picture.format, self.norm16).ok_or_else(|| {
            PipelineError::render("wgpu", format!("{:?} pictures are not supported", picture.format))
        })?;

        let textures: Vec<wgpu::Texture> = formats
            .iter()
            .enumerate()
            .map(|(i, &format)| {
                self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("plane_texture"),
                    size: plane_extent(picture.format, i, picture.width, picture.height),
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                })
            })
            .collect();

        let mut views: Vec<wgpu::TextureView> = textures
            .iter()
            .map(|t| t.create_view(&wgpu::TextureViewDescriptor::default()))
            .collect();
        while views.len() < 3 {
            views.push(pipelines.placeholder.create_view(&wgpu::TextureViewDescriptor::default()));
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("yuv_bind_group"),
            layout: &pipelines.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&views[0]) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(&views[1]) },
                wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(&views[2]) },
                wgpu::BindGroupEntry { binding: 3, resource: wgpu::BindingResource::Sampler(&pipelines.sampler) },
                wgpu::BindGroupEntry { binding: 4, resource: pipelines.color_buffer.as_entire_binding() },
            ],
        });

        tracing::debug!(format = ?picture.format, width = picture.width, height = picture.height, "plane textures");
        self.planes = Some(PlaneTextures { key, textures, bind_group });
        Ok(())
    }

    fn upload(&self, picture: &DecodedPicture) -> Result<()> {
        let planes = self.planes.as_ref().ok_or_else(|| PipelineError::render("wgpu", "no plane textures"))?;
        if picture.planes.len() < planes.textures.len() {
            return Err(PipelineError::render("wgpu", "picture is missing planes"));
        }
        for (i, (texture, plane)) in planes.textures.iter().zip(&picture.planes).enumerate() {
            let size = plane_extent(picture.format, i, picture.width, picture.height);
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &plane.data,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(plane.stride as u32),
                    rows_per_image: Some(plane.rows as u32),
                },
                size,
            );
        }
        Ok(())
    }

    fn follow_window_size(&mut self) {
        let size = self.window.inner_size();
        if let Some(p) = self.pipelines.as_mut() {
            if size.width > 0
                && size.height > 0
                && (p.surface_config.width, p.surface_config.height) != (size.width, size.height)
            {
                p.surface_config.width = size.width;
                p.surface_config.height = size.height;
                self.surface.configure(&self.device, &p.surface_config);
            }
        }
    }

    fn acquire(&self) -> Result<wgpu::SurfaceTexture> {
        let pipelines = self.pipelines.as_ref().ok_or_else(|| PipelineError::render("wgpu", "draw before init"))?;
        match self.surface.get_current_texture() {
            Ok(frame) => Ok(frame),
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                self.surface.configure(&self.device, &pipelines.surface_config);
                self.surface
                    .get_current_texture()
                    .map_err(|e| PipelineError::render("wgpu", format!("surface lost: {}", e)))
            }
            Err(e) => Err(PipelineError::render("wgpu", format!("acquire failed: {}", e))),
        }
    }
}

impl RenderBackend for WgpuRenderer {
    fn kind(&self) -> RenderKind {
        RenderKind::Wgpu
    }

    fn caps(&self) -> RenderCaps {
        RenderCaps::YUV444
    }

    fn init(&mut self, _display: &mut dyn DisplayBackend, info: &RenderInit) -> Result<()> {
        let size = self.window.inner_size();
        let (w, h) = if size.width > 0 && size.height > 0 { (size.width, size.height) } else { (info.width, info.height) };
        self.pipelines = Some(self.build_pipelines(w, h, info.vsync)?);
        self.planes = None;
        self.color_dirty = true;
        tracing::info!(width = w, height = h, "wgpu renderer ready");
        Ok(())
    }

    fn sync_config(&mut self, config: &ColorConfig) -> Result<()> {
        self.color = *config;
        self.color_dirty = true;
        Ok(())
    }

    fn draw(&mut self, picture: &mut DecodedPicture, _display: &mut dyn DisplayBackend) -> Result<usize> {
        if picture.is_hardware() {
            return Err(PipelineError::render("wgpu", "hardware surfaces are not importable"));
        }
        self.follow_window_size();
        self.ensure_textures(picture)?;
        self.upload(picture)?;

        let pipelines = self.pipelines.as_ref().ok_or_else(|| PipelineError::render("wgpu", "draw before init"))?;
        if self.color_dirty {
            self.queue
                .write_buffer(&pipelines.color_buffer, 0, bytemuck::bytes_of(&ColorUniform::from(&self.color)));
            self.color_dirty = false;
        }

        let output = self.acquire()?;
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("render_encoder"),
        });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("render_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            if let Some(planes) = &self.planes {
                let pipeline = if picture.format.is_semi_planar() {
                    &pipelines.semi_planar
                } else {
                    &pipelines.planar
                };
                render_pass.set_pipeline(pipeline);
                render_pass.set_bind_group(0, &planes.bind_group, &[]);
                render_pass.set_vertex_buffer(0, pipelines.vertex_buffer.slice(..));
                render_pass.set_index_buffer(pipelines.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
                render_pass.draw_indexed(0..INDICES.len() as u32, 0, 0..1);
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(0)
    }

    fn destroy(&mut self, _display: &mut dyn DisplayBackend) {
        self.planes = None;
        self.pipelines = None;
        tracing::debug!("wgpu renderer destroyed");
    }
}
