//! A fire-and-forget activity ping, handed to a worker task so a
//! subscriber outside the gateway (the stall sentinel, spec.md §4.12) can
//! observe "a worker event happened" without the gateway's `GatewayPort`
//! trait having to expose its internal event stream.

use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct ActivitySink(Arc<dyn Fn() + Send + Sync>);

impl ActivitySink {
    pub fn new(on_activity: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(on_activity))
    }

    pub fn ping(&self) {
        (self.0)();
    }
}

impl fmt::Debug for ActivitySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActivitySink(..)")
    }
}
