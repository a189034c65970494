//! In-memory capture backend emitting a test pattern.
//!
//! Behaves like a small multi-planar driver: it adjusts requested resolutions, pads strides,
//! limits the buffer count and hands buffers back in FIFO order. Each buffer carries a luma
//! ramp shifted by its index, so consecutive frames differ.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use mplanecam_ipc::MAX_BUFFERS;
use tracing::debug;

use crate::device::{
    CaptureDevice, DeviceFormat, Dequeued, FormatRequest, Mapping, PlaneFormat, PlaneLocation,
    VideoBackend,
};

/// Device paths served by the virtual backend start with this prefix.
pub const VIRTUAL_PATH_PREFIX: &str = "virtual";

// Offsets encode (buffer, plane) the way a driver's mmap cookie would.
const BUFFER_SHIFT: u32 = 16;
const PLANE_MASK: u32 = 0xff;

/// Tunables of the simulated driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualOptions {
    /// 1 for contiguous buffers, 2 for separate luma/chroma planes.
    pub plane_count: u32,

    /// Row alignment in bytes applied to both planes.
    pub stride_align: u32,

    /// Largest width the device accepts.
    pub max_width: u32,

    /// Largest height the device accepts.
    pub max_height: u32,

    /// Most buffers the device grants.
    pub buffer_limit: u32,
}

impl Default for VirtualOptions {
    fn default() -> Self {
        Self {
            plane_count: 2,
            stride_align: 64,
            max_width: 1920,
            max_height: 1080,
            buffer_limit: MAX_BUFFERS,
        }
    }
}

/// Opens [`VirtualDevice`]s for paths starting with `virtual`.
#[derive(Debug, Default)]
pub struct VirtualBackend {
    options: VirtualOptions,
    opened: AtomicUsize,
}

impl VirtualBackend {
    pub fn new(options: VirtualOptions) -> Self {
        Self {
            options,
            opened: AtomicUsize::new(0),
        }
    }

    /// How many devices have been opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl VideoBackend for VirtualBackend {
    type Device = VirtualDevice;

    fn open(&self, path: &str) -> io::Result<VirtualDevice> {
        if !path.starts_with(VIRTUAL_PATH_PREFIX) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no virtual device at {path}"),
            ));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!(path, "Opened virtual capture device");
        Ok(VirtualDevice::new(self.options))
    }
}

/// Heap memory standing in for a driver mapping.
#[derive(Debug)]
pub struct HeapRegion {
    data: Box<[u8]>,
}

impl Mapping for HeapRegion {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// A simulated multi-planar capture device.
#[derive(Debug)]
pub struct VirtualDevice {
    options: VirtualOptions,
    format: DeviceFormat,
    buffers: u32,
    queued: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.to_string())
}

fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

impl VirtualDevice {
    fn new(options: VirtualOptions) -> Self {
        let format = Self::adjust(&options, options.max_width, options.max_height);
        Self {
            options,
            format,
            buffers: 0,
            queued: VecDeque::new(),
            streaming: false,
            sequence: 0,
        }
    }

    /// Clamps to the device limits, rounds down to even and pads rows.
    fn adjust(options: &VirtualOptions, width: u32, height: u32) -> DeviceFormat {
        let width = (width.clamp(2, options.max_width.max(2))) & !1;
        let height = (height.clamp(2, options.max_height.max(2))) & !1;
        let stride = align_up(width, options.stride_align);
        let luma = stride * height;
        let chroma = stride * height / 2;

        let planes = if options.plane_count >= 2 {
            vec![
                PlaneFormat {
                    bytes_per_line: stride,
                    size_image: luma,
                },
                PlaneFormat {
                    bytes_per_line: stride,
                    size_image: chroma,
                },
            ]
        } else {
            vec![PlaneFormat {
                bytes_per_line: stride,
                size_image: luma + chroma,
            }]
        };

        DeviceFormat {
            width,
            height,
            fourcc: crate::device::PixelFormat::Nv12.fourcc(),
            planes,
        }
    }

    fn stride(&self) -> usize {
        self.format
            .planes
            .first()
            .map_or(self.format.width, |p| p.bytes_per_line) as usize
    }

    fn fill_luma(&self, index: u32, data: &mut [u8]) {
        let width = self.format.width as usize;
        let shift = index as usize * width / MAX_BUFFERS as usize;
        let stride = self.stride();
        for row in data.chunks_mut(stride).take(self.format.height as usize) {
            for (x, byte) in row.iter_mut().take(width).enumerate() {
                *byte = 16 + (((x + shift) % width) * 219 / width) as u8;
            }
        }
    }
}

impl CaptureDevice for VirtualDevice {
    type Mapping = HeapRegion;

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<DeviceFormat> {
        if self.buffers > 0 {
            return Err(io::Error::other("buffers allocated"));
        }
        self.format = Self::adjust(&self.options, request.width, request.height);
        Ok(self.format.clone())
    }

    fn get_format(&mut self) -> io::Result<DeviceFormat> {
        Ok(self.format.clone())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        if self.streaming {
            return Err(io::Error::other("streaming"));
        }
        self.queued.clear();
        self.buffers = count.min(self.options.buffer_limit);
        Ok(self.buffers)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<Vec<PlaneLocation>> {
        if index >= self.buffers {
            return Err(invalid("buffer index out of range"));
        }
        Ok(self
            .format
            .planes
            .iter()
            .enumerate()
            .map(|(plane, format)| PlaneLocation {
                offset: (index << BUFFER_SHIFT) | plane as u32,
                length: format.size_image as usize,
            })
            .collect())
    }

    fn map(&mut self, plane: &PlaneLocation) -> io::Result<HeapRegion> {
        let index = plane.offset >> BUFFER_SHIFT;
        let plane_index = plane.offset & PLANE_MASK;
        if index >= self.buffers {
            return Err(invalid("unknown mmap offset"));
        }

        // Neutral chroma everywhere, then the luma ramp over the luma part.
        let mut data = vec![128u8; plane.length].into_boxed_slice();
        if plane_index == 0 {
            let luma = (self.stride() * self.format.height as usize).min(data.len());
            self.fill_luma(index, &mut data[..luma]);
        }
        Ok(HeapRegion { data })
    }

    fn queue(&mut self, index: u32, _planes: u32) -> io::Result<()> {
        if index >= self.buffers {
            return Err(invalid("buffer index out of range"));
        }
        if self.queued.contains(&index) {
            return Err(invalid("buffer already queued"));
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<Option<Dequeued>> {
        if !self.streaming {
            return Err(invalid("not streaming"));
        }
        Ok(self.queued.pop_front().map(|index| {
            let sequence = self.sequence;
            self.sequence = self.sequence.wrapping_add(1);
            Dequeued { index, sequence }
        }))
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.buffers == 0 {
            return Err(invalid("no buffers"));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.streaming = false;
        self.queued.clear();
        Ok(())
    }
}
