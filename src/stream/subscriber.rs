//! Listener registration payload

use crate::segment::Frame;
use crate::types::ChannelKey;
use std::collections::BTreeSet;
use std::fmt;

/// Callback receiving frames restricted to a listener's channels
pub type FrameHandler = Box<dyn FnMut(&Frame) + Send>;

/// Callback run once the subscription including a listener has been pushed
pub type OpenHandler = Box<dyn FnOnce() + Send>;

/// A set of channels of interest and what to do with their frames
pub struct Subscriber {
    pub(crate) channels: BTreeSet<ChannelKey>,
    pub(crate) handler: FrameHandler,
    pub(crate) on_open: Option<OpenHandler>,
}

impl Subscriber {
    pub fn new<K, I, F>(channels: I, handler: F) -> Self
    where
        K: Into<ChannelKey>,
        I: IntoIterator<Item = K>,
        F: FnMut(&Frame) + Send + 'static,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            handler: Box::new(handler),
            on_open: None,
        }
    }

    /// Run `f` once the stream carries this subscriber's channels
    pub fn on_open(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_open = Some(Box::new(f));
        self
    }

    pub fn channels(&self) -> &BTreeSet<ChannelKey> {
        &self.channels
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("channels", &self.channels)
            .field("on_open", &self.on_open.is_some())
            .finish()
    }
}
