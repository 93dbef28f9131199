//! Descriptor (IO) source (spec section 4.7): wraps exactly one
//! descriptor watch and forwards its observed event mask to a callback.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::ready::Ready;
use crate::source::{Callback, DispatchAction, Source, SourceImpl, WatchKey};

pub struct DescriptorSource;

fn the_watch(source: &Source) -> Option<WatchKey> {
    let mut found = None;
    source.each_watch(|key, _| {
        if found.is_none() {
            found = Some(key);
        }
    });
    found
}

impl SourceImpl for DescriptorSource {
    fn check(&self, source: &Source) -> bool {
        the_watch(source).map(|k| !source.query_descriptor_watch(k).is_empty()).unwrap_or(false)
    }

    fn dispatch(&self, source: &Source, callback: &mut Option<Callback>) -> DispatchAction {
        let received = the_watch(source).map(|k| source.query_descriptor_watch(k)).unwrap_or_else(Ready::empty);

        match callback {
            Some(Callback::Io(f)) => f(received),
            _ => DispatchAction::Remove,
        }
    }

    fn kind_name(&self) -> &'static str {
        "descriptor"
    }
}

impl DescriptorSource {
    pub fn new(fd: RawFd, requested: Ready, callback: impl FnMut(Ready) -> DispatchAction + Send + 'static) -> Arc<Source> {
        let source = Source::new(DescriptorSource);
        source.set_callback(Callback::Io(Box::new(callback)));
        source.add_descriptor_watch(fd, requested);
        source.set_name("descriptor");
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn fires_when_the_watched_descriptor_becomes_writable() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let ctx = Context::new().unwrap();
        let fired = Arc::new(Mutex::new(Ready::empty()));
        let fired2 = fired.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let source = DescriptorSource::new(write_fd, Ready::writable(), move |ready| {
            *fired2.lock().unwrap() = ready;
            calls2.fetch_add(1, Ordering::SeqCst);
            DispatchAction::Remove
        });
        source.attach(&ctx);

        ctx.iteration(false);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(fired.lock().unwrap().is_writable());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
