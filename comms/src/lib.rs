mod codec;
pub mod msg;
mod receiver;
mod sender;

use tokio::io::{AsyncRead, AsyncWrite};

pub use codec::{Deserialize, Serialize};
pub use receiver::FrameReceiver;
pub use sender::FrameSender;

type LenType = u32;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Upper bound for a single frame body, anything larger is treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Creates both `FrameReceiver` and `FrameSender` channel parts.
///
/// Given a reader and a writer creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a frame receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
