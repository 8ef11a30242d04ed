use std::io;
use std::time::Instant;

use bitflags::bitflags;

use crate::Error;

bitflags! {
    /// Readiness bits reported by [`Channel::wait`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events: u8 {
        const APP_DATA = 0b0001;
        const NETWORK_DATA = 0b0010;
        const APP_CLOSE = 0b0100;
        const TIMEOUT = 0b1000;
    }
}

/// Everything the engine sees of the outside world: the packet substrate
/// below, the application above, and the multiplexer tying them together.
///
/// `wait` is the engine's only suspension point. It blocks until at least
/// one of the interest bits is ready, or until the deadline expires, which
/// is reported as `TIMEOUT`. All other operations must not block: the
/// engine only calls them for conditions `wait` has already reported, and
/// the substrate is assumed to absorb outbound packets without loss or
/// reordering. `APP_CLOSE` is a one-shot condition: reporting it consumes
/// the request.
pub trait Channel {
    fn wait(&mut self, interest: Events, deadline: Option<Instant>) -> Events;

    fn net_send(&mut self, segment: &[u8]) -> io::Result<()>;
    fn net_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn app_recv(&mut self, buf: &mut [u8]) -> usize;
    fn app_send(&mut self, bytes: &[u8]);

    /// Report the handshake outcome to the blocked application.
    fn unblock_app(&mut self, err: Option<Error>);

    /// Signal end-of-stream upstream: the peer has promised to send no
    /// more data.
    fn app_eof(&mut self);

    /// Report that the connection context has been released.
    fn app_close_ack(&mut self);
}
