//! Release of half-open links
//!
//! Connecting to a peripheral is several awaits long (link, service discovery,
//! characteristic lookup). If the caller gives up part way through, the link
//! must still be torn down.

use futures::future::BoxFuture;

/// Releases a link when connecting is abandoned
///
/// Arm the guard before the link is requested and [`LinkGuard::disarm`] it
/// once the connection is handed out. Dropping an armed guard spawns the
/// release on the current runtime.
pub(crate) struct LinkGuard<T: Clone + Send + 'static> {
    link: T,
    release: Option<fn(T) -> BoxFuture<'static, ()>>,
}

impl<T: Clone + Send + 'static> LinkGuard<T> {
    pub(crate) fn new(link: T, release: fn(T) -> BoxFuture<'static, ()>) -> Self {
        Self {
            link,
            release: Some(release),
        }
    }

    pub(crate) fn link(&self) -> &T {
        &self.link
    }

    /// Hand the link out; it is no longer released on drop.
    pub(crate) fn disarm(mut self) -> T {
        self.release = None;
        self.link.clone()
    }
}

impl<T: Clone + Send + 'static> Drop for LinkGuard<T> {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(release(self.link.clone()));
        }
    }
}
