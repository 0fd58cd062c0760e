/*! Errors enums for the link layer.
*/

use thiserror::Error;

use veil_packet::error::DecryptFragmentError;

/// Error that can happen when queueing a message into a session.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum QueueMessageError {
    /// The session is closed or its handshake has not finished.
    #[error("Session is not ready to carry messages")]
    Closed,
    /// The send queue is full; the message was dropped and the caller may
    /// retry later.
    #[error("Send queue is full")]
    Backpressure,
    /// The message does not fit into a link message.
    #[error("Message exceeds the maximum link message size")]
    Overflow,
}

/// Error that can happen while feeding received transport bytes into a
/// session. Any of these closes the session.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum HandleRecvError {
    /// A fragment failed authentication or carried inconsistent sizes.
    #[error("Fragment error: {0:?}")]
    Fragment(DecryptFragmentError),
    /// Reassembly of a message overflowed the link message size.
    #[error("Reassembly overflow")]
    Overflow,
    /// A completed message could not be parsed as a link message, or arrived
    /// before the handshake finished.
    #[error("Invalid link message")]
    InvalidMessage,
    /// A link intro carried a bad signature or named an unexpected router.
    #[error("Invalid link intro")]
    InvalidLinkIntro,
    /// Bytes arrived for a session that is already closed.
    #[error("Session is closed")]
    Closed,
}

impl From<DecryptFragmentError> for HandleRecvError {
    fn from(e: DecryptFragmentError) -> HandleRecvError {
        HandleRecvError::Fragment(e)
    }
}

/// Error that can happen when opening an outbound session.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum NewSessionError {
    /// A session with this transport address already exists.
    #[error("Session already exists")]
    AlreadyExists,
    /// The transport command channel refused the connect.
    #[error("Transport is gone or congested")]
    Transport,
}

/// Error that can happen when sending a link message to a router.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SendToRouterError {
    /// No session with that router exists.
    #[error("No session with this router")]
    UnknownRouter,
    /// The session refused the message.
    #[error("Queue error: {0}")]
    Queue(QueueMessageError),
}

impl From<QueueMessageError> for SendToRouterError {
    fn from(e: QueueMessageError) -> SendToRouterError {
        SendToRouterError::Queue(e)
    }
}
