//! Reading sinks
//!
//! A [`Sink`] is the single hand-off point between the serial reader and
//! whatever consumes its readings.

use crate::reading::Reading;

/// Consumer of parsed readings.
///
/// Called synchronously from the read loop, in parse order. Implementations
/// must not block for long: a slow sink stalls the serial reader.
pub trait Sink: Send + Sync {
    /// Accept one reading
    fn deliver(&self, reading: &Reading);
}

impl<S: Sink + ?Sized> Sink for std::sync::Arc<S> {
    fn deliver(&self, reading: &Reading) {
        (**self).deliver(reading)
    }
}

/// Adapter for ad-hoc closures
pub struct FnSink<F>(pub F);

impl<F> Sink for FnSink<F>
where
    F: Fn(&Reading) + Send + Sync,
{
    fn deliver(&self, reading: &Reading) {
        (self.0)(reading)
    }
}
