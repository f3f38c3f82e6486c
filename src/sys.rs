//! Raw V4L2 requests the `v4l` crate does not expose for user-pointer
//! streaming: buffer slot requests, split queue/dequeue, stream on/off and the
//! legacy `VIDIOC_QUERYCTRL`/`VIDIOC_S_CTRL` control paths.
#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::raw::{c_int, c_ulong, c_void};
use std::time::{Duration, Instant};

use v4l::buffer::Type;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_control, v4l2_queryctrl, v4l2_requestbuffers};

/// `V4L2_CTRL_TYPE_INTEGER64`
pub const CTRL_TYPE_INTEGER64: u32 = 5;
/// `V4L2_CTRL_FLAG_DISABLED`
pub const CTRL_FLAG_DISABLED: u32 = 0x0001;

/// Driver-reported state of a dequeued buffer.
#[derive(Debug, Clone, Copy)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// `VIDIOC_REQBUFS` with user-pointer memory. Returns the granted count.
pub fn request_buffers(fd: c_int, count: u32) -> io::Result<u32> {
    // SAFETY: v4l2_requestbuffers is a plain C struct; all-zero is valid.
    let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
    req.count = count;
    req.type_ = Type::VideoCapture as u32;
    req.memory = Memory::UserPtr as u32;
    // SAFETY: req lives across the call and matches the request's argument type.
    unsafe {
        v4l2::ioctl(
            fd,
            vidioc::VIDIOC_REQBUFS,
            std::ptr::addr_of_mut!(req).cast::<c_void>(),
        )?;
    }
    Ok(req.count)
}

/// `VIDIOC_QUERYBUF`. Returns the buffer length the driver requires.
pub fn query_buffer_length(fd: c_int, index: u32) -> io::Result<u32> {
    // SAFETY: all-zero is a valid v4l2_buffer.
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.index = index;
    buf.type_ = Type::VideoCapture as u32;
    buf.memory = Memory::UserPtr as u32;
    // SAFETY: buf lives across the call and matches the request's argument type.
    unsafe {
        v4l2::ioctl(
            fd,
            vidioc::VIDIOC_QUERYBUF,
            std::ptr::addr_of_mut!(buf).cast::<c_void>(),
        )?;
    }
    Ok(buf.length)
}

/// `VIDIOC_QBUF` of a user-pointer buffer.
///
/// # Safety
///
/// `ptr` must point to `len` writable bytes that stay allocated, and are not
/// read or written by the application, until the buffer is dequeued or
/// streaming is stopped.
pub unsafe fn queue_user_buffer(fd: c_int, index: u32, ptr: *mut u8, len: u32) -> io::Result<()> {
    // SAFETY: all-zero is a valid v4l2_buffer.
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.index = index;
    buf.type_ = Type::VideoCapture as u32;
    buf.memory = Memory::UserPtr as u32;
    buf.m.userptr = ptr as c_ulong;
    buf.length = len;
    // SAFETY: buf lives across the call; the memory contract is the caller's.
    unsafe {
        v4l2::ioctl(
            fd,
            vidioc::VIDIOC_QBUF,
            std::ptr::addr_of_mut!(buf).cast::<c_void>(),
        )
    }
}

/// `VIDIOC_DQBUF` of a user-pointer buffer. Fails with `WouldBlock` when the
/// descriptor is non-blocking and no buffer is ready.
pub fn dequeue_user_buffer(fd: c_int) -> io::Result<Dequeued> {
    // SAFETY: all-zero is a valid v4l2_buffer.
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.type_ = Type::VideoCapture as u32;
    buf.memory = Memory::UserPtr as u32;
    // SAFETY: buf lives across the call and matches the request's argument type.
    unsafe {
        v4l2::ioctl(
            fd,
            vidioc::VIDIOC_DQBUF,
            std::ptr::addr_of_mut!(buf).cast::<c_void>(),
        )?;
    }

    // V4L2 timestamps are non-negative in practice
    #[allow(clippy::cast_sign_loss)]
    let secs = buf.timestamp.tv_sec.max(0) as u64;
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let nanos = (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000);

    Ok(Dequeued {
        index: buf.index,
        bytes_used: buf.bytesused,
        sequence: buf.sequence,
        timestamp: Duration::new(secs, nanos),
    })
}

fn stream_request(fd: c_int, request: vidioc::_IOC_TYPE) -> io::Result<()> {
    let mut typ = Type::VideoCapture as c_int;
    // SAFETY: both stream requests take a pointer to the buffer type.
    unsafe { v4l2::ioctl(fd, request, std::ptr::addr_of_mut!(typ).cast::<c_void>()) }
}

/// `VIDIOC_STREAMON`.
pub fn stream_on(fd: c_int) -> io::Result<()> {
    stream_request(fd, vidioc::VIDIOC_STREAMON)
}

/// `VIDIOC_STREAMOFF`.
pub fn stream_off(fd: c_int) -> io::Result<()> {
    stream_request(fd, vidioc::VIDIOC_STREAMOFF)
}

/// `VIDIOC_S_CTRL`, the pre-extended-controls single value path.
pub fn set_control(fd: c_int, id: u32, value: i32) -> io::Result<()> {
    let mut ctrl = v4l2_control { id, value };
    // SAFETY: ctrl lives across the call and matches the request's argument type.
    unsafe {
        v4l2::ioctl(
            fd,
            vidioc::VIDIOC_S_CTRL,
            std::ptr::addr_of_mut!(ctrl).cast::<c_void>(),
        )
    }
}

/// Control descriptor fields returned by `VIDIOC_QUERYCTRL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueriedControl {
    pub typ: u32,
    pub flags: u32,
    pub name: String,
}

/// `VIDIOC_QUERYCTRL` for one control id. Drivers answer `EINVAL` for ids they
/// do not implement.
pub fn query_control(fd: c_int, id: u32) -> io::Result<QueriedControl> {
    // SAFETY: all-zero is a valid v4l2_queryctrl.
    let mut query: v4l2_queryctrl = unsafe { mem::zeroed() };
    query.id = id;
    // SAFETY: query lives across the call and matches the request's argument type.
    unsafe {
        v4l2::ioctl(
            fd,
            vidioc::VIDIOC_QUERYCTRL,
            std::ptr::addr_of_mut!(query).cast::<c_void>(),
        )?;
    }

    let name = query.name.split(|&b| b == 0).next().unwrap_or_default();
    Ok(QueriedControl {
        typ: query.type_,
        flags: query.flags,
        name: String::from_utf8_lossy(name).into_owned(),
    })
}

/// Milliseconds left until `deadline` as a `poll` timeout, rounded up so an
/// unexpired deadline never becomes a zero-length wait. `None` is infinite.
fn poll_timeout(deadline: Option<Instant>, now: Instant) -> c_int {
    deadline.map_or(-1, |deadline| {
        let remaining = deadline.saturating_duration_since(now);
        let millis = remaining.as_micros().div_ceil(1000);
        c_int::try_from(millis).unwrap_or(c_int::MAX)
    })
}

/// Wait until the descriptor has a filled buffer ready.
///
/// `None` waits forever. Returns `false` once `deadline` has passed. An
/// interrupted wait resumes with whatever time is left.
pub fn wait_readable(fd: c_int, deadline: Option<Instant>) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let timeout_ms = poll_timeout(deadline, Instant::now());
        // SAFETY: pollfd is a single valid entry that outlives the call.
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        match ready {
            0 => return Ok(false),
            n if n > 0 => return Ok(true),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}
