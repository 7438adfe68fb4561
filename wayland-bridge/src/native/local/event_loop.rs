use std::{
    os::unix::io::{BorrowedFd, RawFd},
    time::{Duration, Instant},
};

use rustix::event::{PollFd, PollFlags, Timespec};

use crate::{
    native::{FdMask, SourceCallback, SourceEvent},
    types::{HandleKind, NativeError, NativeHandle},
};

use super::{handle, LocalLibrary, SourceData, SourceKind};

fn poll_flags(mask: FdMask) -> PollFlags {
    let mut flags = PollFlags::empty();
    if mask.contains(FdMask::READABLE) {
        flags |= PollFlags::IN;
    }
    if mask.contains(FdMask::WRITABLE) {
        flags |= PollFlags::OUT;
    }
    flags
}

fn fd_mask(flags: PollFlags) -> FdMask {
    let mut mask = FdMask::NONE;
    if flags.contains(PollFlags::IN) {
        mask |= FdMask::READABLE;
    }
    if flags.contains(PollFlags::OUT) {
        mask |= FdMask::WRITABLE;
    }
    if flags.contains(PollFlags::HUP) {
        mask |= FdMask::HANGUP;
    }
    if flags.intersects(PollFlags::ERR | PollFlags::NVAL) {
        mask |= FdMask::ERROR;
    }
    mask
}

fn timespec(duration: Duration) -> Timespec {
    Timespec { tv_sec: duration.as_secs() as _, tv_nsec: duration.subsec_nanos() as _ }
}

impl LocalLibrary {
    pub(super) fn add_source(
        &self,
        event_loop: NativeHandle,
        kind: SourceKind,
        callback: SourceCallback,
    ) -> Result<NativeHandle, NativeError> {
        let source = self.alloc(HandleKind::EventSource);
        let mut state = self.lock();
        let Some(data) = state.loops.get_mut(&event_loop.addr()) else {
            drop(state);
            drop(callback);
            return Err(NativeError::InvalidObject);
        };
        data.sources.push(source.addr());
        state.sources.insert(
            source.addr(),
            SourceData { event_loop: event_loop.addr(), callback, kind, check: false },
        );
        Ok(source)
    }

    /// Unlink a source, the caller drops it once unlocked
    pub(super) fn remove_source(&self, source: usize) -> Option<SourceData> {
        let mut state = self.lock();
        let data = state.sources.remove(&source)?;
        if let Some(event_loop) = state.loops.get_mut(&data.event_loop) {
            event_loop.sources.retain(|&s| s != source);
        }
        Some(data)
    }

    pub(super) fn destroy_loop(&self, event_loop: usize) {
        self.emit_destroy(handle(HandleKind::EventLoop, event_loop));
        let removed: Vec<SourceData> = {
            let mut state = self.lock();
            match state.loops.remove(&event_loop) {
                Some(data) => data.sources.iter().filter_map(|s| state.sources.remove(s)).collect(),
                None => Vec::new(),
            }
        };
        drop(removed);
    }

    /// Run the idle sources, each of them is removed before it runs
    pub(super) fn dispatch_idle(&self, event_loop: usize) {
        loop {
            let next = {
                let mut state = self.lock();
                let idle = state.loops.get(&event_loop).and_then(|data| {
                    data.sources.iter().copied().find(|s| {
                        state.sources.get(s).map_or(false, |s| matches!(s.kind, SourceKind::Idle))
                    })
                });
                idle.and_then(|source| {
                    let data = state.sources.remove(&source)?;
                    if let Some(event_loop) = state.loops.get_mut(&event_loop) {
                        event_loop.sources.retain(|&s| s != source);
                    }
                    Some(data)
                })
            };
            match next {
                Some(data) => {
                    (data.callback)(SourceEvent::Idle);
                }
                None => break,
            }
        }
    }

    fn fire(&self, source: usize, event: SourceEvent) {
        loop {
            let Some((callback, check)) =
                self.lock().sources.get(&source).map(|s| (s.callback.clone(), s.check))
            else {
                return;
            };
            if callback(event) <= 0 || !check {
                return;
            }
        }
    }

    pub(super) fn dispatch_loop(
        &self,
        event_loop: usize,
        timeout: Option<Duration>,
    ) -> Result<(), NativeError> {
        if !self.lock().loops.contains_key(&event_loop) {
            return Err(NativeError::InvalidObject);
        }
        self.dispatch_idle(event_loop);
        let processed = self.process_clients(event_loop);

        let (fds, deadline) = {
            let state = self.lock();
            let mut fds: Vec<(usize, RawFd, FdMask)> = Vec::new();
            let mut deadline: Option<Instant> = None;
            let sources = state.loops.get(&event_loop).map(|l| l.sources.as_slice()).unwrap_or(&[]);
            for source in sources {
                match state.sources.get(source).map(|s| &s.kind) {
                    Some(SourceKind::Fd { fd, mask }) => fds.push((*source, *fd, *mask)),
                    Some(SourceKind::Timer { deadline: Some(d) }) => {
                        deadline = Some(deadline.map_or(*d, |current| current.min(*d)))
                    }
                    _ => {}
                }
            }
            (fds, deadline)
        };

        let mut wait = if processed { Some(Duration::ZERO) } else { timeout };
        if let Some(deadline) = deadline {
            let until = deadline.saturating_duration_since(Instant::now());
            wait = Some(wait.map_or(until, |w| w.min(until)));
        }

        let mut ready: Vec<(usize, SourceEvent)> = Vec::new();
        if fds.is_empty() {
            // only a timer can fire, nothing else could wake the loop up
            if let (Some(wait), Some(_)) = (wait, deadline) {
                std::thread::sleep(wait);
            }
        } else {
            let mut poll_fds: Vec<PollFd<'_>> = fds
                .iter()
                .map(|(_, fd, mask)| {
                    // SAFETY: fd sources are removed before their fd is closed
                    let fd = unsafe { BorrowedFd::borrow_raw(*fd) };
                    PollFd::from_borrowed_fd(fd, poll_flags(*mask))
                })
                .collect();
            let wait = wait.map(timespec);
            match rustix::event::poll(&mut poll_fds, wait.as_ref()) {
                Ok(_) => {}
                Err(rustix::io::Errno::INTR) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
            for (poll_fd, (source, fd, _)) in poll_fds.iter().zip(&fds) {
                let mask = fd_mask(poll_fd.revents());
                if !mask.is_empty() {
                    ready.push((*source, SourceEvent::Fd { fd: *fd, mask }));
                }
            }
        }

        {
            let now = Instant::now();
            let mut state = self.lock();
            let sources = state.loops.get(&event_loop).map(|l| l.sources.clone()).unwrap_or_default();
            for source in sources {
                if let Some(SourceKind::Timer { deadline }) =
                    state.sources.get_mut(&source).map(|s| &mut s.kind)
                {
                    if deadline.map_or(false, |d| d <= now) {
                        *deadline = None;
                        ready.push((source, SourceEvent::Timer));
                    }
                }
            }
        }

        for (source, event) in ready {
            self.fire(source, event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_map_to_poll_flags() {
        assert_eq!(poll_flags(FdMask::READABLE | FdMask::WRITABLE), PollFlags::IN | PollFlags::OUT);
        assert_eq!(fd_mask(PollFlags::IN | PollFlags::HUP), FdMask::READABLE | FdMask::HANGUP);
        assert_eq!(fd_mask(PollFlags::NVAL), FdMask::ERROR);
        assert!(fd_mask(PollFlags::empty()).is_empty());
    }
}
