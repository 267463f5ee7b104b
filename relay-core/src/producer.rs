use crate::error::ProducerError;
use futures_util::stream::BoxStream;

/// Ordered text fragments from the generation backend.
///
/// Streams must be lazy: nothing may happen upstream until first poll, so a
/// session rejected as busy costs nothing. End of stream is the `done` signal;
/// an `Err` item is terminal.
pub type FragmentStream = BoxStream<'static, Result<String, ProducerError>>;
