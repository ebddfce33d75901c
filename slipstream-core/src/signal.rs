// SIGNAL - One-way descriptors between the pipeline and the host event loop
//
//   input collaborator ──SignalSender──► pipe ──SignalReceiver──► session
//   decode/render threads ──Notifier (eventfd)──► event loop ──► session
//
// Every descriptor is an OwnedFd. The host only ever sees raw fds through
// EventRegistrar and must stop polling them once the session shuts down.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::{last_os_error, Result};
use crate::ioctl::would_block;
use crate::platform::WindowOp;

// ============================================================================
// Input Signals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputSignal {
    Grab = 1,
    Ungrab = 2,
    Quit = 3,
}

impl InputSignal {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Grab),
            2 => Some(Self::Ungrab),
            3 => Some(Self::Quit),
            _ => None,
        }
    }

    /// Window operation the display applies, `None` for quit
    pub fn window_op(&self) -> Option<WindowOp> {
        match self {
            Self::Grab => Some(WindowOp::Grab),
            Self::Ungrab => Some(WindowOp::Ungrab),
            Self::Quit => None,
        }
    }
}

/// Create the single-producer/single-consumer input channel
pub fn signal_channel() -> Result<(SignalSender, SignalReceiver)> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if ret != 0 {
        return Err(last_os_error());
    }
    // SAFETY: pipe2 succeeded, both fds are fresh and owned by us
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((SignalSender { fd: write }, SignalReceiver { fd: read }))
}

pub struct SignalSender {
    fd: OwnedFd,
}

impl SignalSender {
    pub fn send(&self, signal: InputSignal) -> Result<()> {
        let byte = signal as u8;
        loop {
            let ret = unsafe { libc::write(self.fd.as_raw_fd(), (&byte as *const u8).cast(), 1) };
            if ret == 1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // a full pipe means the session stopped reading; the signal is moot
                _ if would_block(&err) => {
                    tracing::warn!(?signal, "input channel full, signal dropped");
                    return Ok(());
                }
                _ => return Err(err.into()),
            }
        }
    }
}

impl AsFd for SignalSender {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

pub struct SignalReceiver {
    fd: OwnedFd,
}

impl SignalReceiver {
    /// Read every pending signal without blocking
    pub fn drain(&self) -> Result<Vec<InputSignal>> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                for &byte in &buf[..n as usize] {
                    match InputSignal::from_byte(byte) {
                        Some(signal) => signals.push(signal),
                        None => tracing::warn!(byte, "unknown input signal ignored"),
                    }
                }
                continue;
            }
            if n == 0 {
                // sender gone: nobody can ask us to quit anymore, so treat it as quit
                if signals.last() != Some(&InputSignal::Quit) {
                    signals.push(InputSignal::Quit);
                }
                return Ok(signals);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if would_block(&err) {
                return Ok(signals);
            }
            return Err(err.into());
        }
    }
}

impl AsFd for SignalReceiver {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// eventfd the pipeline threads poke when the session needs attention
pub struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(last_os_error());
        }
        // SAFETY: eventfd returned a fresh descriptor
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub fn notify(&self) {
        let one: u64 = 1;
        let ret = unsafe { libc::write(self.fd.as_raw_fd(), (&one as *const u64).cast(), 8) };
        if ret != 8 {
            // only fails when the counter would overflow, which still leaves it readable
            tracing::trace!("eventfd write: {}", io::Error::last_os_error());
        }
    }

    /// Reset the counter, returning how many notifications were pending
    pub fn clear(&self) -> u64 {
        let mut value: u64 = 0;
        let ret = unsafe { libc::read(self.fd.as_raw_fd(), (&mut value as *mut u64).cast(), 8) };
        if ret == 8 { value } else { 0 }
    }
}

impl AsFd for Notifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

// ============================================================================
// Event Loop Registration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventToken {
    /// Input signal pipe is readable
    Signals,
    /// A pipeline thread reported a failure
    Failure,
}

/// Host event loop side of descriptor registration
pub trait EventRegistrar {
    fn register(&mut self, fd: RawFd, token: EventToken) -> Result<()>;
}

/// poll(2)-based registrar for hosts without their own reactor
#[derive(Debug, Default)]
pub struct PollSet {
    entries: Vec<(RawFd, EventToken)>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait until at least one descriptor is readable or `timeout` passes
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<EventToken>> {
        let mut fds: Vec<libc::pollfd> = self
            .entries
            .iter()
            .map(|(fd, _)| libc::pollfd { fd: *fd, events: libc::POLLIN, revents: 0 })
            .collect();
        let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as libc::c_int);

        let ret = loop {
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if ret >= 0 {
                break ret;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err.into());
            }
        };
        if ret == 0 {
            return Ok(Vec::new());
        }

        Ok(fds
            .iter()
            .zip(&self.entries)
            .filter(|(pfd, _)| pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .map(|(_, (_, token))| *token)
            .collect())
    }
}

impl EventRegistrar for PollSet {
    fn register(&mut self, fd: RawFd, token: EventToken) -> Result<()> {
        if self.entries.iter().any(|(f, _)| *f == fd) {
            return Ok(());
        }
        self.entries.push((fd, token));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signals_round_trip_in_order() {
        let (tx, rx) = signal_channel().unwrap();
        assert!(rx.drain().unwrap().is_empty());
        tx.send(InputSignal::Grab).unwrap();
        tx.send(InputSignal::Ungrab).unwrap();
        tx.send(InputSignal::Quit).unwrap();
        assert_eq!(rx.drain().unwrap(), vec![InputSignal::Grab, InputSignal::Ungrab, InputSignal::Quit]);
        assert!(rx.drain().unwrap().is_empty());
    }

    #[test]
    fn test_closed_sender_reads_as_quit() {
        let (tx, rx) = signal_channel().unwrap();
        tx.send(InputSignal::Grab).unwrap();
        drop(tx);
        assert_eq!(rx.drain().unwrap(), vec![InputSignal::Grab, InputSignal::Quit]);
    }

    #[test]
    fn test_unknown_bytes_are_skipped() {
        let (tx, rx) = signal_channel().unwrap();
        let junk = [9u8, 3u8];
        let n = unsafe { libc::write(tx.fd.as_raw_fd(), junk.as_ptr().cast(), 2) };
        assert_eq!(n, 2);
        assert_eq!(rx.drain().unwrap(), vec![InputSignal::Quit]);
    }

    #[test]
    fn test_window_ops() {
        assert_eq!(InputSignal::Grab.window_op(), Some(WindowOp::Grab));
        assert_eq!(InputSignal::Quit.window_op(), None);
        assert_eq!(InputSignal::from_byte(2), Some(InputSignal::Ungrab));
    }

    #[test]
    fn test_notifier_counts_and_clears() {
        let notifier = Notifier::new().unwrap();
        assert_eq!(notifier.clear(), 0);
        notifier.notify();
        notifier.notify();
        assert_eq!(notifier.clear(), 2);
        assert_eq!(notifier.clear(), 0);
    }

    #[test]
    fn test_poll_set_reports_ready_tokens() {
        let (tx, rx) = signal_channel().unwrap();
        let notifier = Notifier::new().unwrap();
        let mut set = PollSet::new();
        set.register(rx.as_fd().as_raw_fd(), EventToken::Signals).unwrap();
        set.register(notifier.as_fd().as_raw_fd(), EventToken::Failure).unwrap();
        set.register(notifier.as_fd().as_raw_fd(), EventToken::Failure).unwrap();
        assert_eq!(set.len(), 2);

        assert!(set.wait(Some(Duration::from_millis(5))).unwrap().is_empty());

        notifier.notify();
        assert_eq!(set.wait(Some(Duration::from_millis(100))).unwrap(), vec![EventToken::Failure]);
        notifier.clear();

        tx.send(InputSignal::Grab).unwrap();
        assert_eq!(set.wait(None).unwrap(), vec![EventToken::Signals]);
    }
}
