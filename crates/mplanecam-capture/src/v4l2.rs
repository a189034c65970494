//! V4L2 backend for multi-planar capture nodes.
//!
//! Talks to the driver through the raw ioctl layer of the `v4l` crate: multi-planar capture
//! type, MMAP memory, and a non-blocking descriptor so `VIDIOC_DQBUF` reports "not ready"
//! instead of stalling the caller.

use std::ffi::c_void;
use std::io;
use std::mem;
use std::os::raw::c_int;
use std::ptr::{self, NonNull};

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_format, v4l2_plane, v4l2_requestbuffers};

use crate::device::{
    CaptureDevice, DeviceFormat, Dequeued, FormatRequest, Mapping, PlaneFormat, PlaneLocation,
    VideoBackend,
};

const BUF_TYPE: u32 = Type::VideoCaptureMplane as u32;
const MEMORY: u32 = Memory::Mmap as u32;

// VIDEO_MAX_PLANES in videodev2.h.
const MAX_PLANES: usize = 8;

/// Opens `/dev/video*` nodes.
#[derive(Debug, Default)]
pub struct V4l2Backend;

impl VideoBackend for V4l2Backend {
    type Device = V4l2Device;

    fn open(&self, path: &str) -> io::Result<V4l2Device> {
        let fd = v4l2::open(path, libc::O_RDWR | libc::O_NONBLOCK)?;
        debug!(path, fd, "Opened capture device");
        Ok(V4l2Device {
            fd,
            path: path.to_string(),
        })
    }
}

/// An open capture node. The descriptor is closed on drop.
#[derive(Debug)]
pub struct V4l2Device {
    fd: c_int,
    path: String,
}

impl V4l2Device {
    /// Path the device was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        loop {
            // SAFETY: `arg` is the argument struct the request expects and outlives the call.
            let result = unsafe { v4l2::ioctl(self.fd, request, arg as *mut T as *mut c_void) };
            match result {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn device_format(format: &v4l2_format) -> DeviceFormat {
        // SAFETY: the driver fills `pix_mp` for multi-planar buffer types. The struct is
        // packed, so every field is copied out by value.
        let (width, height, fourcc, num_planes, plane_fmt) = unsafe {
            (
                format.fmt.pix_mp.width,
                format.fmt.pix_mp.height,
                format.fmt.pix_mp.pixelformat,
                format.fmt.pix_mp.num_planes,
                format.fmt.pix_mp.plane_fmt,
            )
        };

        let planes = plane_fmt
            .iter()
            .take((num_planes as usize).min(MAX_PLANES))
            .map(|plane| {
                let bytes_per_line = plane.bytesperline;
                let size_image = plane.sizeimage;
                PlaneFormat {
                    bytes_per_line,
                    size_image,
                }
            })
            .collect();

        DeviceFormat {
            width,
            height,
            fourcc,
            planes,
        }
    }

    fn buffer(index: u32, planes: &mut [v4l2_plane; MAX_PLANES], count: u32) -> v4l2_buffer {
        // SAFETY: all-zero is a valid v4l2_buffer.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = BUF_TYPE;
        buf.memory = MEMORY;
        buf.index = index;
        buf.length = count;
        buf.m.planes = planes.as_mut_ptr();
        buf
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if let Err(e) = v4l2::close(self.fd) {
            warn!(path = %self.path, error = %e, "Failed to close capture device");
        }
    }
}

/// A driver buffer plane mapped into process memory. Unmapped on drop.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain shared memory owned by this value; access is read-only.
unsafe impl Send for MmapRegion {}

impl Mapping for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` maps `len` readable bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful mmap and are unmapped exactly once.
        if let Err(e) = unsafe { v4l2::munmap(self.ptr.as_ptr() as *mut c_void, self.len) } {
            warn!(error = %e, len = self.len, "munmap failed");
        }
    }
}

impl CaptureDevice for V4l2Device {
    type Mapping = MmapRegion;

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<DeviceFormat> {
        // SAFETY: all-zero is a valid v4l2_format.
        let mut format: v4l2_format = unsafe { mem::zeroed() };
        format.type_ = BUF_TYPE;
        // SAFETY: writing plain integers into the multi-planar member of the union.
        unsafe {
            format.fmt.pix_mp.width = request.width;
            format.fmt.pix_mp.height = request.height;
            format.fmt.pix_mp.pixelformat = request.pixel_format.fourcc();
        }
        self.ioctl(vidioc::VIDIOC_S_FMT, &mut format)?;
        Ok(Self::device_format(&format))
    }

    fn get_format(&mut self) -> io::Result<DeviceFormat> {
        // SAFETY: all-zero is a valid v4l2_format.
        let mut format: v4l2_format = unsafe { mem::zeroed() };
        format.type_ = BUF_TYPE;
        self.ioctl(vidioc::VIDIOC_G_FMT, &mut format)?;
        Ok(Self::device_format(&format))
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        // SAFETY: all-zero is a valid v4l2_requestbuffers.
        let mut request: v4l2_requestbuffers = unsafe { mem::zeroed() };
        request.type_ = BUF_TYPE;
        request.memory = MEMORY;
        request.count = count;
        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut request)?;
        Ok(request.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<Vec<PlaneLocation>> {
        // SAFETY: all-zero is a valid v4l2_plane.
        let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        let mut buf = Self::buffer(index, &mut planes, MAX_PLANES as u32);
        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)?;

        let count = (buf.length as usize).min(MAX_PLANES);
        Ok(planes[..count]
            .iter()
            .map(|plane| PlaneLocation {
                // SAFETY: MMAP buffers report their offset in `mem_offset`.
                offset: unsafe { plane.m.mem_offset },
                length: plane.length as usize,
            })
            .collect())
    }

    fn map(&mut self, plane: &PlaneLocation) -> io::Result<MmapRegion> {
        // SAFETY: offset and length were reported by VIDIOC_QUERYBUF for this descriptor.
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                plane.length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                plane.offset as libc::off_t,
            )?
        };
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(MmapRegion {
            ptr,
            len: plane.length,
        })
    }

    fn queue(&mut self, index: u32, planes: u32) -> io::Result<()> {
        // SAFETY: all-zero is a valid v4l2_plane.
        let mut plane_info: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        let count = planes.clamp(1, MAX_PLANES as u32);
        let mut buf = Self::buffer(index, &mut plane_info, count);
        self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue(&mut self) -> io::Result<Option<Dequeued>> {
        // SAFETY: all-zero is a valid v4l2_plane.
        let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        let mut buf = Self::buffer(0, &mut planes, MAX_PLANES as u32);
        match self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf) {
            Ok(()) => Ok(Some(Dequeued {
                index: buf.index,
                sequence: buf.sequence,
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut buf_type = BUF_TYPE as c_int;
        self.ioctl(vidioc::VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut buf_type = BUF_TYPE as c_int;
        self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut buf_type)
    }
}
