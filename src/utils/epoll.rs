use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Debug)]
pub struct EpollEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub hup_or_err: bool,
}

/// Which directions to watch on a descriptor. Level-triggered throughout:
/// a descriptor stays ready across iterations until its buffer is
/// actually drained, and `writable` is only ever requested while there
/// is something queued to send.
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub fn readable() -> Self {
        Interest { readable: true, writable: false }
    }

    pub fn read_write() -> Self {
        Interest { readable: true, writable: true }
    }

    fn as_bits(&self) -> u32 {
        let mut bits = 0u32;
        if self.readable {
            bits |= libc::EPOLLIN as u32;
        }
        if self.writable {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}

pub struct EpollManager {
    epoll_fd: RawFd,
}

impl EpollManager {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollManager { epoll_fd })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event { events: interest.as_bits(), u64: fd as u64 };
        let result = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Changes which directions are watched for an already-registered fd.
    /// Used to arm/disarm `EPOLLOUT` as a send or CGI-stdin buffer fills
    /// and drains, so a level-triggered empty buffer doesn't spin the
    /// loop hot on a descriptor that's always writable.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event { events: interest.as_bits(), u64: fd as u64 };
        let result = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let result = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn wait(&self, timeout: Duration) -> io::Result<Vec<EpollEvent>> {
        const MAX_EVENTS: usize = 256;
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        let timeout_ms = timeout.as_millis() as i32;
        let num_events = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms) };

        if num_events == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut result = Vec::with_capacity(num_events as usize);
        for raw in &events[..num_events as usize] {
            let bits = raw.events;
            result.push(EpollEvent {
                fd: raw.u64 as RawFd,
                readable: bits & (libc::EPOLLIN as u32) != 0,
                writable: bits & (libc::EPOLLOUT as u32) != 0,
                hup_or_err: bits & ((libc::EPOLLHUP | libc::EPOLLERR) as u32) != 0,
            });
        }
        Ok(result)
    }
}

impl Drop for EpollManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
