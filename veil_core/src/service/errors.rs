/*! Errors enums for the hidden-service endpoint.
*/

use futures::channel::mpsc::SendError;
use thiserror::Error;

use veil_packet::error::GetPayloadError;

/// Error that can happen when handling a `GotRouterMessage`.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum HandleGotRouterError {
    /// The contact signature does not verify; the node db stays unchanged.
    #[error("Invalid router contact signature")]
    InvalidSignature,
}

/// Error that can happen when publishing our introset.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum PublishIntroSetError {
    /// No established path to publish over; retried next tick.
    #[error("No established path to publish the introset over")]
    NoPath,
    /// The link refused the message.
    #[error("Send error")]
    SendTo(SendError),
}

/// Error that can happen when starting a hidden service lookup.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum EnsurePathError {
    /// No established path to route the lookup over; retried by the caller.
    #[error("No established path for the lookup")]
    NoPath,
    /// The link refused the message.
    #[error("Send error")]
    SendTo(SendError),
}

/// Error that can happen when sending application data to a remote service.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SendToServiceError {
    /// No outbound context for this address; look it up first.
    #[error("No conversation with this address")]
    NoContext,
    /// No aligned path to the selected introduction yet; the payload was
    /// queued and goes out once a path is up.
    #[error("No aligned path yet, payload queued")]
    NoPath,
    /// The conversation has no cached key.
    #[error("No cached conversation key")]
    NoKey,
    /// The link refused the message.
    #[error("Send error")]
    SendTo(SendError),
}

/// Error that can happen when handling a received protocol frame.
#[derive(Debug, PartialEq, Error)]
pub enum HandleFrameError {
    /// The frame names a conversation we do not know.
    #[error("Unknown conversation tag")]
    UnknownTag,
    /// No key to decrypt the frame with.
    #[error("No conversation key")]
    NoKey,
    /// The post-quantum ciphertext could not be decapsulated.
    #[error("Decapsulation failed")]
    Decapsulation,
    /// The payload could not be decrypted or parsed.
    #[error("Invalid payload")]
    InvalidPayload(GetPayloadError),
    /// The frame signature does not verify against the sender.
    #[error("Invalid frame signature")]
    SignatureInvalid,
}

/// Error that can happen when loading or persisting the identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Reading or writing the keyfile failed.
    #[error("Keyfile io error: {0}")]
    Io(#[from] std::io::Error),
    /// The keyfile contents could not be parsed.
    #[error("Keyfile is malformed")]
    Malformed,
}
