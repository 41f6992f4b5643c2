//! GPU context: device, queue, compiled-kernel cache, launch counter.
//!
//! Uses wgpu for cross-platform GPU acceleration (Metal, Vulkan, DX12).
//! The context is created once and shared (`Arc`); matrices, checks and
//! assignments all borrow the device and queue through it.
//!
//! The kernel cache maps exact generated WGSL source text to a compiled
//! compute pipeline. Kernel text is immutable once generated, so the cache
//! is read-mostly after first compilation and needs nothing beyond a
//! standard mutex-guarded map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Shared GPU state: one device and queue plus the compiled-kernel cache.
#[derive(Debug)]
pub struct Context {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    pipelines: Mutex<HashMap<String, Arc<wgpu::ComputePipeline>>>,
    launches: AtomicU64,
}

impl Context {
    /// Try to create a wgpu device and queue.
    /// Returns None if no GPU adapter is available.
    pub fn try_new() -> Option<Arc<Context>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))?;
        // A fused assignment binds one storage buffer per input,
        // destination and check buffer, which quickly passes the
        // 8-per-stage baseline limit. Request what the adapter has.
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("riptide-gpu"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .ok()?;
        Some(Arc::new(Context {
            device,
            queue,
            pipelines: Mutex::new(HashMap::new()),
            launches: AtomicU64::new(0),
        }))
    }

    /// Retrieve the compute pipeline for the given kernel source, compiling
    /// it on first use. Keyed by exact source text.
    pub(crate) fn get_or_compile(&self, source: &str) -> Arc<wgpu::ComputePipeline> {
        if let Some(pipeline) = self.pipelines.lock().unwrap().get(source) {
            return pipeline.clone();
        }
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("riptide_fused"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = Arc::new(self.device.create_compute_pipeline(
            &wgpu::ComputePipelineDescriptor {
                label: Some("riptide_fused_pipeline"),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            },
        ));
        self.pipelines
            .lock()
            .unwrap()
            .insert(source.to_string(), pipeline.clone());
        pipeline
    }

    /// Number of distinct kernel sources compiled so far.
    pub fn cached_kernels(&self) -> usize {
        self.pipelines.lock().unwrap().len()
    }

    /// Number of kernel dispatches submitted so far.
    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    pub(crate) fn record_launch(&self) {
        self.launches.fetch_add(1, Ordering::Relaxed);
    }

    /// Block until the given submission has completed on the device.
    pub(crate) fn wait(&self, index: &wgpu::SubmissionIndex) {
        self.device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(index.clone()));
    }

    /// Copy `bytes` bytes of a device buffer back to the host through a
    /// staging buffer.
    pub(crate) fn read_back(&self, buffer: &wgpu::Buffer, bytes: u64) -> Vec<u8> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("riptide_staging"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("riptide_readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .expect("GPU readback channel closed")
            .expect("GPU readback failed");

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        data
    }
}
