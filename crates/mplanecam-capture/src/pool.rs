//! Driver buffer pool.
//!
//! The pool owns every mapping of one capture session. Mappings are owned values that unmap
//! when dropped, so releasing the pool is just clearing it, and a buffer whose mapping failed
//! halfway never leaks the planes that did map.

use mplanecam_ipc::MAX_BUFFERS;
use tracing::{debug, info, instrument};

use crate::device::{CaptureDevice, Mapping};
use crate::error::CaptureError;
use crate::format::NegotiatedFormat;
use crate::CaptureResult;

/// How luma and chroma are laid out inside one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneLayout {
    /// One mapping per plane: luma in the first, chroma in the second.
    Separate,

    /// A single mapping holding luma followed by chroma.
    Contiguous {
        /// Byte offset of the chroma plane (`luma_stride * height`).
        chroma_offset: usize,
    },
}

/// One driver-granted buffer slot and its mappings.
#[derive(Debug)]
pub struct MappedBuffer<M> {
    index: u32,
    regions: Vec<M>,
    layout: PlaneLayout,
}

impl<M: Mapping> MappedBuffer<M> {
    fn new(index: u32, regions: Vec<M>, luma_size: usize) -> CaptureResult<Self> {
        let layout = match regions.as_slice() {
            [] => return Err(CaptureError::ZeroPlanes { index }),
            [single] => {
                let total = single.len();
                if luma_size >= total {
                    return Err(CaptureError::InconsistentLayout {
                        total,
                        luma: luma_size,
                    });
                }
                PlaneLayout::Contiguous {
                    chroma_offset: luma_size,
                }
            }
            _ => PlaneLayout::Separate,
        };

        Ok(Self {
            index,
            regions,
            layout,
        })
    }

    /// Driver index of this slot.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Plane layout resolved at allocation time.
    pub fn layout(&self) -> PlaneLayout {
        self.layout
    }

    /// Number of planes the driver exposes for this buffer.
    pub fn plane_count(&self) -> u32 {
        self.regions.len() as u32
    }

    /// The luma plane.
    pub fn luma(&self) -> &[u8] {
        let Some(primary) = self.regions.first() else {
            return &[];
        };
        match self.layout {
            PlaneLayout::Separate => primary.as_slice(),
            PlaneLayout::Contiguous { chroma_offset } => &primary.as_slice()[..chroma_offset],
        }
    }

    /// The interleaved chroma plane.
    pub fn chroma(&self) -> &[u8] {
        match self.layout {
            PlaneLayout::Separate => self.regions.get(1).map_or(&[], |r| r.as_slice()),
            PlaneLayout::Contiguous { chroma_offset } => self
                .regions
                .first()
                .map_or(&[], |r| &r.as_slice()[chroma_offset..]),
        }
    }
}

/// The mapped buffers of one capture session.
#[derive(Debug)]
pub struct BufferPool<M> {
    buffers: Vec<MappedBuffer<M>>,
}

impl<M: Mapping> Default for BufferPool<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mapping> BufferPool<M> {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            buffers: Vec::with_capacity(MAX_BUFFERS as usize),
        }
    }

    /// Reserves up to `count` buffers, maps each one and hands it to the capture queue.
    ///
    /// Returns the number of buffers now owned by the pool. On any failure every mapping
    /// made so far is released before the error is returned.
    #[instrument(name = "pool_allocate", skip(self, device, format))]
    pub fn allocate<D>(
        &mut self,
        device: &mut D,
        format: &NegotiatedFormat,
        count: u32,
    ) -> CaptureResult<u32>
    where
        D: CaptureDevice<Mapping = M>,
    {
        if !self.buffers.is_empty() {
            return Err(CaptureError::AlreadyAllocated);
        }

        let requested = count.clamp(1, MAX_BUFFERS);
        let granted = device
            .request_buffers(requested)
            .map_err(CaptureError::ioctl("VIDIOC_REQBUFS"))?;
        if granted == 0 {
            return Err(CaptureError::NoBuffers);
        }

        let usable = granted.min(MAX_BUFFERS);
        debug!(requested, granted, usable, "Driver granted buffers");

        if let Err(e) = self.map_and_queue(device, format, usable) {
            self.release();
            return Err(e);
        }

        info!(buffers = usable, planes = self.plane_count(), "Mapped capture buffers");
        Ok(usable)
    }

    fn map_and_queue<D>(
        &mut self,
        device: &mut D,
        format: &NegotiatedFormat,
        count: u32,
    ) -> CaptureResult<()>
    where
        D: CaptureDevice<Mapping = M>,
    {
        for index in 0..count {
            let buffer = Self::map_buffer(device, format, index)?;

            // The contents are not valid until the driver fills the buffer.
            device
                .queue(index, buffer.plane_count())
                .map_err(CaptureError::ioctl("VIDIOC_QBUF"))?;

            self.buffers.push(buffer);
        }
        Ok(())
    }

    fn map_buffer<D>(
        device: &mut D,
        format: &NegotiatedFormat,
        index: u32,
    ) -> CaptureResult<MappedBuffer<M>>
    where
        D: CaptureDevice<Mapping = M>,
    {
        let planes = device
            .query_buffer(index)
            .map_err(CaptureError::ioctl("VIDIOC_QUERYBUF"))?;
        if planes.is_empty() {
            return Err(CaptureError::ZeroPlanes { index });
        }

        let mut regions = Vec::with_capacity(planes.len());
        for (plane, location) in planes.iter().enumerate() {
            let region = device
                .map(location)
                .map_err(|source| CaptureError::Mmap {
                    index,
                    plane,
                    source,
                })?;
            regions.push(region);
        }

        MappedBuffer::new(index, regions, format.luma_size())
    }

    /// Unmaps every buffer. Safe to call repeatedly and on a partially filled pool.
    ///
    /// Returns the number of buffers that were released.
    pub fn release(&mut self) -> usize {
        let released = self.buffers.len();
        self.buffers.clear();
        if released > 0 {
            debug!(buffers = released, "Released capture buffers");
        }
        released
    }

    /// Looks up a buffer by driver index.
    pub fn get(&self, index: u32) -> Option<&MappedBuffer<M>> {
        self.buffers.get(index as usize)
    }

    /// Number of mapped buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns true when nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Planes per buffer, taken from the first buffer (0 when empty).
    pub fn plane_count(&self) -> u32 {
        self.buffers.first().map_or(0, MappedBuffer::plane_count)
    }
}
