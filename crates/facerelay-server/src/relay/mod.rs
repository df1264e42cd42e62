//! Frame relay: device admission, frame sampling and recognition dispatch.

mod capture;
mod dispatcher;
mod error;
mod gate;
mod lifecycle;
mod manager;
mod names;
mod recognition;

pub use capture::{capture_frame, CaptureSettings, FrameCaptureLoop, SampleGate};
pub use dispatcher::{DispatchOutcome, NoMatchLog, RecognitionDispatcher, SampledFrame};
pub use error::{AdmissionError, CaptureError};
pub use gate::{ConcurrencyGate, GatePermit};
pub use lifecycle::{Lifecycle, Transition, TransportState};
pub use manager::{
    ConnectionManager, ConnectionSnapshot, ManagerSettings, MediaSession, SessionEvent,
    SessionEventKind, SessionEvents, SessionFactory,
};
pub use names::{NameCachePolicy, PersonNameResolver, NO_MATCH_IDENTITY, NO_MATCH_NAME};
pub use recognition::{HttpRecognitionBackend, RawPrediction, RecognitionBackend, RecognitionError};
