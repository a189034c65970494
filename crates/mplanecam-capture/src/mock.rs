//! Scripted capture device for unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{
    CaptureDevice, DeviceFormat, Dequeued, FormatRequest, Mapping, PixelFormat, PlaneFormat,
    PlaneLocation,
};
use crate::format::NegotiatedFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    SetFormat,
    GetFormat,
    RequestBuffers(u32),
    QueryBuffer(u32),
    Queue(u32),
    Dequeue,
    StreamOn,
    StreamOff,
}

/// Observes and steers a mock device after it has been moved into a stream.
#[derive(Clone, Default)]
pub(crate) struct MockHandle {
    calls: Arc<Mutex<Vec<Call>>>,
    live: Arc<AtomicUsize>,
    fail_queue: Arc<AtomicBool>,
}

impl MockHandle {
    /// Makes every later QBUF fail, or succeed again.
    pub(crate) fn fail_queue(&self, fail: bool) {
        self.fail_queue.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn live_mappings(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

pub(crate) struct MockMapping {
    data: Vec<u8>,
    live: Arc<AtomicUsize>,
}

impl Mapping for MockMapping {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockDevice {
    pub format: DeviceFormat,
    pub plane_lengths: Vec<usize>,
    pub grant: Option<u32>,
    pub fail_set_format: bool,
    pub fail_get_format: bool,
    pub fail_map_at: Option<(u32, usize)>,
    pub fail_stream_on: bool,
    pub luma_fill: u8,
    pub chroma_fill: u8,
    pub dequeue_script: VecDeque<io::Result<Option<Dequeued>>>,
    handle: MockHandle,
}

impl MockDevice {
    /// Two planes per buffer with `stride`-byte rows for both.
    pub(crate) fn two_plane(stride: u32, height: u32) -> Self {
        let luma = (stride * height) as usize;
        Self::with_planes(
            stride,
            height,
            vec![
                PlaneFormat {
                    bytes_per_line: stride,
                    size_image: luma as u32,
                },
                PlaneFormat {
                    bytes_per_line: stride,
                    size_image: (luma / 2) as u32,
                },
            ],
            vec![luma, luma / 2],
        )
    }

    /// One contiguous plane per buffer of `length` bytes.
    pub(crate) fn single_plane(stride: u32, height: u32, length: usize) -> Self {
        Self::with_planes(
            stride,
            height,
            vec![PlaneFormat {
                bytes_per_line: stride,
                size_image: length as u32,
            }],
            vec![length],
        )
    }

    fn with_planes(
        stride: u32,
        height: u32,
        planes: Vec<PlaneFormat>,
        plane_lengths: Vec<usize>,
    ) -> Self {
        Self {
            format: DeviceFormat {
                width: stride,
                height,
                fourcc: PixelFormat::Nv12.fourcc(),
                planes,
            },
            plane_lengths,
            grant: None,
            fail_set_format: false,
            fail_get_format: false,
            fail_map_at: None,
            fail_stream_on: false,
            luma_fill: 16,
            chroma_fill: 128,
            dequeue_script: VecDeque::new(),
            handle: MockHandle::default(),
        }
    }

    /// The format the negotiator would settle on for this device.
    pub(crate) fn negotiated(&self) -> NegotiatedFormat {
        let request = FormatRequest {
            width: self.format.width,
            height: self.format.height,
            pixel_format: PixelFormat::Nv12,
        };
        NegotiatedFormat::canonicalize(&request, &self.format)
    }

    pub(crate) fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.handle.calls()
    }

    pub(crate) fn live_mappings(&self) -> usize {
        self.handle.live_mappings()
    }

    pub(crate) fn script_dequeue(&mut self, index: u32) {
        self.dequeue_script.push_back(Ok(Some(Dequeued { index, sequence: 0 })));
    }

    pub(crate) fn script_dequeue_error(&mut self, kind: io::ErrorKind) {
        self.dequeue_script.push_back(Err(io::Error::new(kind, "DQBUF failed")));
    }
}

fn failure(op: &str) -> io::Error {
    io::Error::other(format!("{op} failed"))
}

impl CaptureDevice for MockDevice {
    type Mapping = MockMapping;

    fn set_format(&mut self, _request: &FormatRequest) -> io::Result<DeviceFormat> {
        self.handle.record(Call::SetFormat);
        if self.fail_set_format {
            return Err(failure("S_FMT"));
        }
        Ok(self.format.clone())
    }

    fn get_format(&mut self) -> io::Result<DeviceFormat> {
        self.handle.record(Call::GetFormat);
        if self.fail_get_format {
            return Err(failure("G_FMT"));
        }
        Ok(self.format.clone())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.handle.record(Call::RequestBuffers(count));
        if count == 0 {
            return Ok(0);
        }
        Ok(self.grant.unwrap_or(count))
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<Vec<PlaneLocation>> {
        self.handle.record(Call::QueryBuffer(index));
        Ok(self
            .plane_lengths
            .iter()
            .enumerate()
            .map(|(plane, &length)| PlaneLocation {
                offset: index * 16 + plane as u32,
                length,
            })
            .collect())
    }

    fn map(&mut self, plane: &PlaneLocation) -> io::Result<MockMapping> {
        let index = plane.offset / 16;
        let plane_index = (plane.offset % 16) as usize;
        if self.fail_map_at == Some((index, plane_index)) {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "mmap failed"));
        }

        let mut data = vec![self.chroma_fill; plane.length];
        if plane_index == 0 {
            let luma = self.negotiated().luma_size().min(plane.length);
            data[..luma].fill(self.luma_fill);
        }

        self.handle.live.fetch_add(1, Ordering::SeqCst);
        Ok(MockMapping {
            data,
            live: self.handle.live.clone(),
        })
    }

    fn queue(&mut self, index: u32, _planes: u32) -> io::Result<()> {
        self.handle.record(Call::Queue(index));
        if self.handle.fail_queue.load(Ordering::SeqCst) {
            return Err(failure("QBUF"));
        }
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<Option<Dequeued>> {
        self.handle.record(Call::Dequeue);
        self.dequeue_script.pop_front().unwrap_or(Ok(None))
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.handle.record(Call::StreamOn);
        if self.fail_stream_on {
            return Err(failure("STREAMON"));
        }
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.handle.record(Call::StreamOff);
        Ok(())
    }
}
