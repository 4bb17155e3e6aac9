//! Connection to the FUSE kernel device.
//!
//! A [`Connection`] owns the device descriptor obtained from mounting and
//! mediates all traffic on it: one reader pulling requests and any number of
//! threads writing responses. Reading and writing are serialized by two
//! separate locks, so responding never blocks the reader; closing takes both
//! locks exclusively and therefore serializes with everything in flight.

use std::backtrace::Backtrace;
use std::fmt;
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use log::{debug, warn};

use crate::error::Error;
use crate::request::Request;

/// Maximum file write size we are prepared to receive from the kernel.
/// 31 pages should be enough for anyone.
pub const MAX_WRITE: u32 = 31 * 4096;

/// All requests read from the kernel, without data, are shorter than one
/// page; the read buffer holds a page plus the largest possible write.
fn buffer_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    let page = *PAGE_SIZE
        .get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });
    page + MAX_WRITE as usize
}

/// Structured events reported through the connection's debug sink.
///
/// The default sink discards them; install one with
/// [`Connection::with_debug_sink`] to observe protocol anomalies that are
/// deliberately swallowed on the main paths.
#[derive(Debug)]
pub enum DebugEvent {
    /// A message failed to decode against its declared length and structure.
    MalformedMessage,
    /// The kernel sent an opcode outside the supported set. The request is
    /// handed to the server as [`Request::Unknown`].
    UnknownOpcode { opcode: u32 },
    /// The kernel accepted fewer bytes of a response than were written.
    ShortKernelWrite {
        written: isize,
        length: usize,
        error: Option<io::Error>,
        stack: Backtrace,
    },
}

/// Sink receiving [`DebugEvent`]s.
pub type DebugSink = Arc<dyn Fn(&DebugEvent) + Send + Sync>;

fn noop_sink() -> DebugSink {
    Arc::new(|_| {})
}

/// Pool of read buffers. Buffers live here between messages so that reading
/// a request allocates nothing in the steady state.
struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn new() -> BufferPool {
        BufferPool { free: Mutex::new(Vec::new()) }
    }

    fn get(&self) -> Vec<u8> {
        match self.free.lock().unwrap().pop() {
            Some(buf) => buf,
            None => vec![0; buffer_size()],
        }
    }

    fn put(&self, buf: Vec<u8>) {
        self.free.lock().unwrap().push(buf);
    }
}

/// One-shot signal resolved when the mount has become visible, plus the slot
/// for an error the mount finisher may record.
struct ReadySignal {
    rx: Mutex<Option<mpsc::Receiver<io::Error>>>,
    error: OnceLock<Arc<io::Error>>,
}

impl ReadySignal {
    fn ready_now() -> ReadySignal {
        ReadySignal { rx: Mutex::new(None), error: OnceLock::new() }
    }

    fn pending(rx: mpsc::Receiver<io::Error>) -> ReadySignal {
        ReadySignal { rx: Mutex::new(Some(rx)), error: OnceLock::new() }
    }
}

/// A connection to a mounted FUSE filesystem.
///
/// The connection may be shared freely between one thread calling
/// [`read_request`](Connection::read_request) and any number of threads
/// responding to earlier requests.
pub struct Connection {
    /// Device handle. The lock is held shared for reads and writes and
    /// exclusively by close, which takes the descriptor out.
    dev: RwLock<Option<OwnedFd>>,
    /// Serializes response writes so each frame reaches the device whole.
    wio: Mutex<()>,
    pool: BufferPool,
    ready: ReadySignal,
    debug: DebugSink,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fd = self.dev.read().unwrap().as_ref().map(|fd| fd.as_raw_fd());
        f.debug_struct("Connection").field("fd", &fd).finish()
    }
}

impl Connection {
    /// Creates a connection around an already-opened FUSE device
    /// descriptor, as delivered by a platform mount mechanism.
    pub fn new(dev: OwnedFd) -> Connection {
        Connection {
            dev: RwLock::new(Some(dev)),
            wio: Mutex::new(()),
            pool: BufferPool::new(),
            ready: ReadySignal::ready_now(),
            debug: noop_sink(),
        }
    }

    /// Creates a connection whose mount is still being finished; the
    /// finisher reports through the channel and [`ready`](Connection::ready)
    /// blocks on it.
    #[cfg_attr(not(feature = "libfuse"), allow(dead_code))]
    pub(crate) fn new_mounting(dev: OwnedFd, rx: mpsc::Receiver<io::Error>) -> Connection {
        Connection {
            dev: RwLock::new(Some(dev)),
            wio: Mutex::new(()),
            pool: BufferPool::new(),
            ready: ReadySignal::pending(rx),
            debug: noop_sink(),
        }
    }

    /// Installs a debug sink. Meant to be called right after construction,
    /// before the connection is shared.
    pub fn with_debug_sink(mut self, sink: DebugSink) -> Connection {
        self.debug = sink;
        self
    }

    /// Waits until the mount is complete and returns its outcome. The new
    /// mount is not guaranteed to be visible before this returns; on some
    /// platforms it does not complete until the initial requests are served,
    /// so a server loop must already be running.
    pub fn ready(&self) -> Result<(), Error> {
        let rx = self.ready.rx.lock().unwrap().take();
        if let Some(rx) = rx {
            // A dropped sender means the mount finished without an error.
            if let Ok(err) = rx.recv() {
                let _ = self.ready.error.set(Arc::new(err));
            }
        }
        match self.ready.error.get() {
            Some(err) => Err(Error::Mount(Arc::clone(err))),
            None => Ok(()),
        }
    }

    /// Returns the next request from the kernel, or `None` once the
    /// filesystem has been unmounted and the stream of requests has ended.
    ///
    /// The caller must answer with exactly one respond or
    /// [`respond_error`](Request::respond_error) call in a reasonable time
    /// (except for forget and interrupt, which take no reply), and must not
    /// retain data borrowed from the request afterwards.
    pub fn read_request(&self) -> Result<Option<Request>, Error> {
        let mut buf = self.pool.get();
        let result = match self.read_message(&mut buf) {
            Ok(Some(n)) => self.decode(&buf[..n]),
            Ok(None) => Ok(None),
            Err(err) => Err(Error::Io(err)),
        };
        self.pool.put(buf);
        result
    }

    /// Reads one message off the device. The kernel delivers exactly one
    /// request per read.
    fn read_message(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            let dev = self.dev.read().unwrap();
            let fd = match dev.as_ref() {
                Some(fd) => fd.as_raw_fd(),
                None => return Ok(None), // closed
            };
            let rc = unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len() as libc::size_t)
            };
            drop(dev);
            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    // Interrupted, or the request was aborted before it
                    // reached userspace. Safe to retry.
                    Some(libc::EINTR) | Some(libc::ENOENT) | Some(libc::EAGAIN) => continue,
                    // Filesystem was unmounted.
                    Some(libc::ENODEV) => return Ok(None),
                    _ => return Err(err),
                }
            }
            if rc == 0 {
                return Ok(None); // EOF, device gone
            }
            return Ok(Some(rc as usize));
        }
    }

    fn decode(&self, buf: &[u8]) -> Result<Option<Request>, Error> {
        match Request::parse(buf) {
            Ok(request) => {
                if let Request::Unknown(header) = &request {
                    warn!("unknown FUSE opcode {}", header.opcode);
                    (self.debug)(&DebugEvent::UnknownOpcode { opcode: header.opcode });
                }
                debug!("{}", request);
                Ok(Some(request))
            }
            Err(err) => {
                warn!("{}", err);
                (self.debug)(&DebugEvent::MalformedMessage);
                Err(Error::Malformed(err))
            }
        }
    }

    /// Closes the connection. Serializes with an in-flight read and all
    /// response writes; afterwards reads report end-of-stream and responses
    /// are reported to the debug sink as undeliverable.
    pub fn close(&self) -> Result<(), Error> {
        let _wio = self.wio.lock().unwrap();
        let mut dev = self.dev.write().unwrap();
        match dev.take() {
            Some(fd) => {
                let rc = unsafe { libc::close(fd.into_raw_fd()) };
                if rc < 0 {
                    Err(Error::Io(io::Error::last_os_error()))
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    /// Sends a short fixed-size reply in one write. The frame's length field
    /// is patched to the final size first.
    pub(crate) fn respond(&self, mut frame: Vec<u8>) {
        let len = frame.len();
        patch_len(&mut frame, len);
        let _wio = self.wio.lock().unwrap();
        self.write_frame(&[IoSlice::new(&frame)]);
    }

    /// Sends a reply with a payload by concatenating into a single buffer.
    // TODO: make this vectored like respond_safe and drop the copy
    pub(crate) fn respond_data(&self, mut frame: Vec<u8>, data: &[u8]) {
        frame.extend_from_slice(data);
        let len = frame.len();
        patch_len(&mut frame, len);
        let _wio = self.wio.lock().unwrap();
        self.write_frame(&[IoSlice::new(&frame)]);
    }

    /// Sends a header plus caller-owned payload as one vectored write, for
    /// payloads that may be large and must not be copied.
    pub(crate) fn respond_safe(&self, mut header: Vec<u8>, data: &[u8]) {
        let len = header.len() + data.len();
        patch_len(&mut header, len);
        let _wio = self.wio.lock().unwrap();
        self.write_frame(&[IoSlice::new(&header), IoSlice::new(data)]);
    }

    /// Writes one response frame. Caller holds the write lock. Failures and
    /// short writes are swallowed after being reported; the kernel surfaces
    /// its own error to the original syscall if it cares.
    fn write_frame(&self, bufs: &[IoSlice<'_>]) {
        let length: usize = bufs.iter().map(|buf| buf.len()).sum();
        let dev = self.dev.read().unwrap();
        let rc = match dev.as_ref() {
            Some(fd) => unsafe {
                libc::writev(
                    fd.as_raw_fd(),
                    bufs.as_ptr() as *const libc::iovec,
                    bufs.len() as libc::c_int,
                )
            },
            None => {
                // Closed underneath a responder.
                self.report_short_write(0, length, Some(io::Error::from_raw_os_error(libc::EBADF)));
                return;
            }
        };
        if rc < 0 {
            self.report_short_write(rc, length, Some(io::Error::last_os_error()));
        } else if rc as usize != length {
            self.report_short_write(rc, length, None);
        }
    }

    fn report_short_write(&self, written: isize, length: usize, error: Option<io::Error>) {
        warn!(
            "short kernel write: written={}/{} error={:?}",
            written, length, error
        );
        (self.debug)(&DebugEvent::ShortKernelWrite {
            written,
            length,
            error,
            stack: Backtrace::force_capture(),
        });
    }
}

fn patch_len(frame: &mut [u8], len: usize) {
    frame[0..4].copy_from_slice(&(len as u32).to_le_bytes());
}
